use std::ops::Deref;
use std::sync::Arc;

use ash::vk;

pub trait HasDevice {
    fn device(&self) -> &Device;
}

/// Device properties this crate needs for placement and dispatch decisions.
/// Queried once by the owning device layer and handed in at construction.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    pub max_compute_workgroup_invocations: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_storage_buffer_offset_alignment: 256,
            max_compute_workgroup_invocations: 64,
        }
    }
}

#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

pub struct DeviceInner {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    limits: DeviceLimits,
}

impl Device {
    /// Wrap an already-created logical device. Instance and queue setup belong
    /// to the device layer above this crate; the handles must stay valid until
    /// the last clone is dropped.
    pub fn new(
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        limits: DeviceLimits,
    ) -> Self {
        Self(Arc::new(DeviceInner {
            device,
            physical_device,
            limits,
        }))
    }
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.0.physical_device
    }
    pub fn limits(&self) -> &DeviceLimits {
        &self.0.limits
    }
}

impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Host access to the device must be externally synchronized. We hold
        // the last reference, so nothing else can be recording against it.
        unsafe {
            self.device.destroy_device(None);
        }
    }
}
