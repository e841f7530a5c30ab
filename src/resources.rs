//! Ownership wrappers for the resource handles descriptor pools keep alive.
//! A handle's lifetime ends when the last holder (pool slot or caller) drops
//! its `Arc`.

use ash::vk;

use crate::{Device, HasDevice};

pub struct ImageView {
    device: Device,
    raw: vk::ImageView,
}

impl ImageView {
    pub fn from_raw(device: Device, raw: vk::ImageView) -> Self {
        Self { device, raw }
    }
    pub fn raw(&self) -> vk::ImageView {
        self.raw
    }
}
impl HasDevice for ImageView {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.raw, None);
        }
    }
}

pub struct Sampler {
    device: Device,
    raw: vk::Sampler,
}

impl Sampler {
    pub fn from_raw(device: Device, raw: vk::Sampler) -> Self {
        Self { device, raw }
    }
    pub fn new(device: Device, info: &vk::SamplerCreateInfo) -> ash::prelude::VkResult<Self> {
        let raw = unsafe { device.create_sampler(info, None)? };
        Ok(Self { device, raw })
    }
    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }
}
impl HasDevice for Sampler {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.raw, None);
        }
    }
}

pub struct BufferView {
    device: Device,
    raw: vk::BufferView,
}

impl BufferView {
    pub fn from_raw(device: Device, raw: vk::BufferView) -> Self {
        Self { device, raw }
    }
    pub fn raw(&self) -> vk::BufferView {
        self.raw
    }
}
impl HasDevice for BufferView {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for BufferView {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer_view(self.raw, None);
        }
    }
}

/// Destruction goes through the KHR extension function table, so the wrapper
/// carries it alongside the handle.
pub struct AccelerationStructure {
    fns: ash::khr::acceleration_structure::Device,
    raw: vk::AccelerationStructureKHR,
}

impl AccelerationStructure {
    pub fn from_raw(
        fns: ash::khr::acceleration_structure::Device,
        raw: vk::AccelerationStructureKHR,
    ) -> Self {
        Self { fns, raw }
    }
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }
}
impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.fns.destroy_acceleration_structure(self.raw, None);
        }
    }
}
