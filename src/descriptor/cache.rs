use std::sync::{Arc, Mutex};

use ash::vk;

use super::{DescriptorPool, DescriptorPoolError, DescriptorPoolFlags, DescriptorSet,
            DescriptorSetLayout};
use crate::{BufferRange, Device};

/// Number of storage-buffer bindings every cached set carries. Dispatches that
/// need fewer buffers write the last binding twice.
pub const CACHE_SET_BINDING_COUNT: usize = 2;

struct PendingRelease {
    fence: vk::Fence,
    index: u32,
}

/// Fixed-capacity ring of reusable temporary descriptor sets. A set acquired
/// for a dispatch is released against that dispatch's fence and only handed
/// out again once the fence has signaled, so no set is rewritten while
/// in-flight GPU work may still read it. Acquisition and release are
/// internally serialized; this is the manager's only shared mutable state.
pub struct DescriptorSetCache {
    device: Device,
    layout: Arc<DescriptorSetLayout>,
    // Sets live for the cache's lifetime; the pool does not allow freeing.
    sets: Vec<DescriptorSet>,
    recycler: crossbeam_channel::Receiver<u32>,
    sender: crossbeam_channel::Sender<u32>,
    pending: Mutex<Vec<PendingRelease>>,
}

impl DescriptorSetCache {
    pub fn new(
        device: Device,
        layout: Arc<DescriptorSetLayout>,
        capacity: u32,
    ) -> Result<Self, DescriptorPoolError> {
        let mut pool_sizes = Vec::new();
        for kind in super::ALL_KINDS {
            let count = layout.counts().of(kind);
            if count > 0 {
                pool_sizes.push((kind, count * capacity));
            }
        }
        let pool = DescriptorPool::new(
            device.clone(),
            DescriptorPoolFlags::UPDATE_AFTER_BIND,
            capacity,
            &pool_sizes,
        )?;
        let layouts: Vec<&Arc<DescriptorSetLayout>> =
            std::iter::repeat(&layout).take(capacity as usize).collect();
        let sets = pool.create_descriptor_sets(&layouts)?;
        let (sender, recycler) = crossbeam_channel::unbounded();
        for index in 0..capacity {
            sender.send(index).unwrap();
        }
        Ok(Self {
            device,
            layout,
            sets,
            recycler,
            sender,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn raw_set(&self, index: u32) -> vk::DescriptorSet {
        self.sets[index as usize].raw()
    }

    /// Acquire a set and point its storage-buffer bindings at `buffers`.
    /// Returns `None` when every set is still pending on an unsignaled fence.
    /// The bound buffers must stay alive until the fence passed to
    /// [`release`](Self::release) signals.
    pub fn acquire(&self, buffers: &[BufferRange]) -> Option<u32> {
        debug_assert!(!buffers.is_empty() && buffers.len() <= CACHE_SET_BINDING_COUNT);
        self.recycle_completed();
        let index = self.recycler.try_recv().ok()?;
        let set = self.raw_set(index);

        let mut infos = [vk::DescriptorBufferInfo::default(); CACHE_SET_BINDING_COUNT];
        let mut writes = [vk::WriteDescriptorSet::default(); CACHE_SET_BINDING_COUNT];
        for i in 0..CACHE_SET_BINDING_COUNT {
            // Unused bindings alias the last provided buffer.
            let buffer = &buffers[i.min(buffers.len() - 1)];
            infos[i] = vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: buffer.offset,
                range: buffer.size,
            };
            writes[i] = vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: i as u32,
                dst_array_element: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                p_buffer_info: &infos[i],
                ..Default::default()
            };
        }
        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
        }
        Some(index)
    }

    /// Defer returning the set until `fence` is known to have signaled.
    pub fn release(&self, index: u32, fence: vk::Fence) {
        self.pending.lock().unwrap().push(PendingRelease { fence, index });
    }

    fn recycle_completed(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|release| {
            let signaled = unsafe { self.device.get_fence_status(release.fence) };
            match signaled {
                Ok(true) => {
                    self.sender.send(release.index).unwrap();
                    false
                }
                Ok(false) => true,
                Err(err) => {
                    tracing::warn!(?err, "fence status query failed; keeping set pending");
                    true
                }
            }
        });
    }
}
