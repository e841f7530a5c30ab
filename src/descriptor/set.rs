use std::sync::Arc;

use ash::vk;

use super::pool::storage_base;
use super::{DescriptorKind, DescriptorOffsets, DescriptorPool, DescriptorPoolError,
            DescriptorPoolFlags, DescriptorSetLayout, MUTABLE_SAMPLER_IX};
use crate::resources::{AccelerationStructure, BufferView, ImageView, Sampler};
use crate::{Buffer, HasDevice};

pub enum DescriptorResource {
    Image {
        view: Arc<ImageView>,
        /// Required when the binding has no immutable samplers.
        sampler: Option<Arc<Sampler>>,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    TexelBuffer {
        view: Arc<BufferView>,
    },
    AccelerationStructure {
        handle: Arc<AccelerationStructure>,
    },
}

pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

/// An allocated descriptor set bound to contiguous per-kind offset ranges in
/// its pool. Dropping the set returns the ranges when the pool allows freeing;
/// otherwise the slots are reclaimed when the pool itself is destroyed.
pub struct DescriptorSet {
    pool: DescriptorPool,
    layout: Arc<DescriptorSetLayout>,
    raw: vk::DescriptorSet,
    offsets: DescriptorOffsets,
}

impl DescriptorSet {
    pub(super) fn new(
        pool: DescriptorPool,
        layout: Arc<DescriptorSetLayout>,
        raw: vk::DescriptorSet,
        offsets: DescriptorOffsets,
    ) -> Self {
        Self {
            pool,
            layout,
            raw,
            offsets,
        }
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }
    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }
    pub fn offsets(&self) -> &DescriptorOffsets {
        &self.offsets
    }

    /// Store the written resource handles into the pool's backing storage
    /// (the pool keeps them alive until the set is freed) and flush one
    /// `vkUpdateDescriptorSets` call.
    pub fn write(&self, writes: &[DescriptorWrite]) -> Result<(), DescriptorPoolError> {
        let max = *self.pool.max_counts();

        let mut image_count = 0;
        let mut buffer_count = 0;
        let mut texel_count = 0;
        let mut accel_count = 0;
        for write in writes {
            match write.resource {
                DescriptorResource::Image { .. } => image_count += 1,
                DescriptorResource::Buffer { .. } => buffer_count += 1,
                DescriptorResource::TexelBuffer { .. } => texel_count += 1,
                DescriptorResource::AccelerationStructure { .. } => accel_count += 1,
            }
        }
        // Reserved up front; pushes below must not reallocate or the pointers
        // already taken into these arrays would dangle.
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(image_count);
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(buffer_count);
        let mut texel_views: Vec<vk::BufferView> = Vec::with_capacity(texel_count);
        let mut accel_handles: Vec<vk::AccelerationStructureKHR> = Vec::with_capacity(accel_count);
        let mut accel_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> =
            Vec::with_capacity(accel_count);

        let mut vk_writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(writes.len());
        for write in writes {
            let (binding, storage_offset) = self
                .layout
                .binding_info(write.binding)
                .ok_or(DescriptorPoolError::UnknownBinding(write.binding))?;
            debug_assert!(write.array_element < binding.count);
            let kind = binding.kind;
            if !resource_matches_kind(&write.resource, kind) {
                return Err(DescriptorPoolError::KindMismatch(write.binding));
            }
            let slot = storage_base(&max, kind)
                + self.offsets.0[kind.ix()]
                + storage_offset.kind_offset
                + write.array_element;

            let mut vk_write = vk::WriteDescriptorSet {
                dst_set: self.raw,
                dst_binding: write.binding,
                dst_array_element: write.array_element,
                descriptor_count: 1,
                descriptor_type: kind.to_vk(),
                ..Default::default()
            };
            match &write.resource {
                DescriptorResource::Image {
                    view,
                    sampler,
                    layout,
                } => {
                    let storage_image = kind != DescriptorKind::CombinedImageSampler;
                    if kind == DescriptorKind::CombinedImageSampler
                        && binding.immutable_samplers.is_empty()
                    {
                        let sampler = sampler
                            .as_ref()
                            .ok_or(DescriptorPoolError::MissingSampler(write.binding))?;
                        let sampler_slot = self.offsets.0[MUTABLE_SAMPLER_IX]
                            + storage_offset.mutable_sampler_offset
                            + write.array_element;
                        self.pool
                            .store_mutable_sampler(sampler_slot, sampler.clone());
                    }
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: sampler.as_ref().map_or(vk::Sampler::null(), |s| s.raw()),
                        image_view: view.raw(),
                        image_layout: *layout,
                    });
                    vk_write.p_image_info = &image_infos[image_infos.len() - 1];
                    self.pool.store_image(slot, view.clone(), storage_image);
                }
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: buffer.raw(),
                        offset: *offset,
                        range: *size,
                    });
                    vk_write.p_buffer_info = &buffer_infos[buffer_infos.len() - 1];
                    self.pool.store_buffer(slot, buffer.clone());
                }
                DescriptorResource::TexelBuffer { view } => {
                    texel_views.push(view.raw());
                    vk_write.p_texel_buffer_view = &texel_views[texel_views.len() - 1];
                    self.pool.store_texel_buffer(slot, view.clone());
                }
                DescriptorResource::AccelerationStructure { handle } => {
                    accel_handles.push(handle.raw());
                    accel_infos.push(vk::WriteDescriptorSetAccelerationStructureKHR {
                        acceleration_structure_count: 1,
                        p_acceleration_structures: &accel_handles[accel_handles.len() - 1],
                        ..Default::default()
                    });
                    vk_write.p_next = &accel_infos[accel_infos.len() - 1]
                        as *const vk::WriteDescriptorSetAccelerationStructureKHR
                        as *const _;
                    self.pool
                        .store_acceleration_structure(slot, handle.clone());
                }
            }
            vk_writes.push(vk_write);
        }

        unsafe {
            self.pool.device().update_descriptor_sets(&vk_writes, &[]);
        }
        Ok(())
    }
}

fn resource_matches_kind(resource: &DescriptorResource, kind: DescriptorKind) -> bool {
    use DescriptorKind::*;
    match resource {
        DescriptorResource::Image { .. } => {
            matches!(kind, CombinedImageSampler | StorageImage | InputAttachment)
        }
        DescriptorResource::Buffer { .. } => matches!(
            kind,
            UniformBuffer | StorageBuffer | UniformBufferDynamic | StorageBufferDynamic
        ),
        DescriptorResource::TexelBuffer { .. } => {
            matches!(kind, UniformTexelBuffer | StorageTexelBuffer)
        }
        DescriptorResource::AccelerationStructure { .. } => {
            matches!(kind, AccelerationStructure)
        }
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if self
            .pool
            .flags()
            .contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET)
        {
            if let Err(err) = self.pool.release_set(&self.layout, &self.offsets, self.raw) {
                tracing::error!(?err, "failed to free descriptor set");
            }
        }
    }
}
