use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use crate::{Device, HasDevice};

pub trait BufferLike {
    fn raw_buffer(&self) -> vk::Buffer;
    fn offset(&self) -> vk::DeviceSize {
        0
    }
    fn size(&self) -> vk::DeviceSize {
        vk::WHOLE_SIZE
    }
}

impl BufferLike for vk::Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        *self
    }
}

/// Non-owning buffer + offset pair. The caller keeps the buffer alive for as
/// long as GPU work recorded against the binding may still read it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
}

impl BufferBinding {
    pub fn new(buffer: vk::Buffer, offset: vk::DeviceSize) -> Self {
        Self { buffer, offset }
    }
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }
}

/// Non-owning buffer range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl BufferRange {
    pub fn new(buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        Self {
            buffer,
            offset,
            size,
        }
    }
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null() && self.size > 0
    }
    pub fn binding(&self) -> BufferBinding {
        BufferBinding {
            buffer: self.buffer,
            offset: self.offset,
        }
    }
}

impl BufferLike for BufferRange {
    fn raw_buffer(&self) -> vk::Buffer {
        self.buffer
    }
    fn offset(&self) -> vk::DeviceSize {
        self.offset
    }
    fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

#[derive(Clone)]
pub struct Allocator {
    device: Device,
    raw: Arc<vk_mem::Allocator>,
}

impl Allocator {
    pub fn new(device: Device, raw: vk_mem::Allocator) -> Self {
        Self {
            device,
            raw: Arc::new(raw),
        }
    }
    pub fn raw(&self) -> &vk_mem::Allocator {
        &self.raw
    }
}

impl HasDevice for Allocator {
    fn device(&self) -> &Device {
        &self.device
    }
}

/// Owning buffer. Either backed by a vk-mem allocation created here, or an
/// externally created buffer adopted with [`Buffer::from_raw`] whose memory
/// the external owner manages.
pub struct Buffer {
    device: Device,
    allocator: Option<Allocator>,
    allocation: Option<vk_mem::Allocation>,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    ptr: *mut u8,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Create a HOST_VISIBLE buffer mapped for sequential write. On integrated
    /// GPUs and GPUs with SAM the device may read it directly; on discrete
    /// GPUs it still works as a persistently mapped upload target.
    pub fn new_upload(
        allocator: Allocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        let (buffer, allocation) = unsafe {
            allocator.raw.create_buffer(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    flags: vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                    ..Default::default()
                },
            )?
        };
        let info = allocator.raw.get_allocation_info(&allocation);
        Ok(Self {
            device: allocator.device.clone(),
            allocator: Some(allocator),
            allocation: Some(allocation),
            buffer,
            size,
            ptr: info.mapped_data as *mut u8,
        })
    }

    /// Adopt an externally created buffer. The adopted handle is destroyed on
    /// drop; its memory stays with whoever bound it.
    pub fn from_raw(device: Device, buffer: vk::Buffer, size: vk::DeviceSize) -> Self {
        Self {
            device,
            allocator: None,
            allocation: None,
            buffer,
            size,
            ptr: std::ptr::null_mut(),
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    /// Write host data into a mapped upload buffer.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) {
        assert!(!self.ptr.is_null(), "buffer is not host mapped");
        assert!(offset + data.len() as vk::DeviceSize <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.add(offset as usize),
                data.len(),
            );
        }
    }

    pub fn binding(&self) -> BufferBinding {
        BufferBinding {
            buffer: self.buffer,
            offset: 0,
        }
    }
    pub fn range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> BufferRange {
        debug_assert!(offset + size <= self.size);
        BufferRange {
            buffer: self.buffer,
            offset,
            size,
        }
    }
}

impl BufferLike for Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.buffer
    }
    fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if let (Some(allocator), Some(allocation)) = (&self.allocator, &mut self.allocation) {
                allocator.raw.destroy_buffer(self.buffer, allocation);
            } else {
                self.device.destroy_buffer(self.buffer, None);
            }
        }
    }
}
