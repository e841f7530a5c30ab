use std::sync::Arc;

use ash::vk;

use super::{NodeHandle, TransformProperty, INVALID_NODE};
use crate::allocator::{FreeListAllocator, INVALID_ADDRESS};
use crate::descriptor::{DescriptorBindingDesc, DescriptorKind, DescriptorPool,
                        DescriptorPoolError, DescriptorPoolFlags, DescriptorResource,
                        DescriptorSet, DescriptorSetLayout, DescriptorWrite};
use crate::transfer::PropertyBinding;
use crate::{Buffer, BufferRange, Device, HasDevice};

/// One node property array inside the externally allocated pool memory.
pub struct PropertyRange {
    pub buffer: Arc<Buffer>,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl PropertyRange {
    pub fn range(&self) -> BufferRange {
        BufferRange {
            buffer: self.buffer.raw(),
            offset: self.offset,
            size: self.size,
        }
    }
}

/// The five GPU-resident property arrays backing a tree's node pool.
pub struct TransformPropertyBuffers {
    pub parents: PropertyRange,
    pub relative_transforms: PropertyRange,
    pub modified_stamps: PropertyRange,
    pub recomputed_stamps: PropertyRange,
    pub global_transforms: PropertyRange,
}

impl TransformPropertyBuffers {
    fn get(&self, property: TransformProperty) -> &PropertyRange {
        match property {
            TransformProperty::Parent => &self.parents,
            TransformProperty::RelativeTransform => &self.relative_transforms,
            TransformProperty::ModifiedStamp => &self.modified_stamps,
            TransformProperty::RecomputedStamp => &self.recomputed_stamps,
            TransformProperty::GlobalTransform => &self.global_transforms,
        }
    }
}

/// Hierarchical transform forest resident in GPU memory. The tree owns the
/// node index space (a CPU-side free list) and the descriptor set exposing the
/// property pool to the update/recompute kernels and the debug vertex shader.
pub struct TransformTree {
    capacity: u32,
    node_allocator: FreeListAllocator,
    buffers: TransformPropertyBuffers,
    layout: Arc<DescriptorSetLayout>,
    // Backs `set`; one-set pool living exactly as long as the tree.
    pool: DescriptorPool,
    set: DescriptorSet,
}

impl TransformTree {
    pub fn property_layout_bindings() -> Vec<DescriptorBindingDesc> {
        TransformProperty::ALL
            .iter()
            .map(|property| {
                DescriptorBindingDesc::new(
                    property.binding(),
                    DescriptorKind::StorageBuffer,
                    1,
                    vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::VERTEX,
                )
            })
            .collect()
    }

    pub fn new(
        device: Device,
        capacity: u32,
        buffers: TransformPropertyBuffers,
    ) -> Result<Self, DescriptorPoolError> {
        for property in TransformProperty::ALL {
            debug_assert!(
                buffers.get(property).size
                    >= capacity as vk::DeviceSize * property.stride() as vk::DeviceSize,
                "property buffer too small for the declared capacity"
            );
        }
        let layout = Arc::new(DescriptorSetLayout::new(
            device.clone(),
            Self::property_layout_bindings(),
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?);
        let pool = DescriptorPool::new(
            device,
            DescriptorPoolFlags::NONE,
            1,
            &[(DescriptorKind::StorageBuffer, TransformProperty::COUNT as u32)],
        )?;
        let set = pool.create_descriptor_set(&layout)?;
        let writes: Vec<DescriptorWrite> = TransformProperty::ALL
            .iter()
            .map(|&property| {
                let range = buffers.get(property);
                DescriptorWrite {
                    binding: property.binding(),
                    array_element: 0,
                    resource: DescriptorResource::Buffer {
                        buffer: range.buffer.clone(),
                        offset: range.offset,
                        size: range.size,
                    },
                }
            })
            .collect();
        set.write(&writes)?;
        Ok(Self {
            capacity,
            node_allocator: FreeListAllocator::new(capacity),
            buffers,
            layout,
            pool,
            set,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
    pub fn device(&self) -> &Device {
        self.pool.device()
    }
    pub fn property_descriptor_set(&self) -> vk::DescriptorSet {
        self.set.raw()
    }
    pub fn property_layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }
    /// Destination binding for a batched property transfer.
    pub fn property_binding(&self, property: TransformProperty) -> PropertyBinding {
        PropertyBinding {
            dst: self.buffers.get(property).range(),
            stride: property.stride(),
        }
    }

    /// Allocate indices for every entry still equal to `INVALID_NODE`;
    /// entries already holding a node pass through untouched, which lets a
    /// caller split allocation from transfer setup. All or nothing: on
    /// exhaustion the entries allocated here are returned and `false` comes
    /// back.
    pub fn allocate_nodes(&mut self, out: &mut [NodeHandle]) -> bool {
        allocate_node_handles(&mut self.node_allocator, out)
    }

    /// Return node indices to the pool free list. Children are not removed
    /// and parent references pointing at removed nodes are left dangling;
    /// fixing up topology after removal is the caller's responsibility.
    pub fn free_nodes(&mut self, nodes: &[NodeHandle]) {
        for &node in nodes {
            if node != INVALID_NODE {
                self.node_allocator.free(node, 1);
            }
        }
    }
}

pub(crate) fn allocate_node_handles(
    allocator: &mut FreeListAllocator,
    out: &mut [NodeHandle],
) -> bool {
    let mut taken: Vec<usize> = Vec::new();
    for ix in 0..out.len() {
        if out[ix] != INVALID_NODE {
            continue;
        }
        let addr = allocator.allocate(1);
        if addr == INVALID_ADDRESS {
            // roll back what this call handed out; pre-allocated entries
            // keep theirs
            for &pos in taken.iter().rev() {
                allocator.free(out[pos], 1);
                out[pos] = INVALID_NODE;
            }
            return false;
        }
        out[ix] = addr;
        taken.push(ix);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_fills_only_invalid_entries() {
        let mut allocator = FreeListAllocator::new(8);
        let pre = allocator.allocate(1);
        let mut out = [INVALID_NODE, pre, INVALID_NODE];
        assert!(allocate_node_handles(&mut allocator, &mut out));
        assert_eq!(out[1], pre);
        assert_ne!(out[0], INVALID_NODE);
        assert_ne!(out[2], INVALID_NODE);
        assert_ne!(out[0], out[2]);
    }

    #[test]
    fn exhaustion_rolls_back_and_keeps_preallocated() {
        let mut allocator = FreeListAllocator::new(2);
        let pre = allocator.allocate(1);
        let snapshot = allocator.clone();
        let mut out = [INVALID_NODE, pre, INVALID_NODE, INVALID_NODE];
        assert!(!allocate_node_handles(&mut allocator, &mut out));
        assert_eq!(out, [INVALID_NODE, pre, INVALID_NODE, INVALID_NODE]);
        assert_eq!(allocator, snapshot);
    }
}
