use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use super::{DescriptorCounts, DescriptorKind};
use crate::{resources::Sampler, Device, HasDevice};

/// One binding of a descriptor set layout. Immutable samplers are baked into
/// the layout; a combined-image-sampler binding without them samples through
/// mutable samplers written per descriptor.
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub immutable_samplers: Vec<Arc<Sampler>>,
}

impl DescriptorBindingDesc {
    pub fn new(
        binding: u32,
        kind: DescriptorKind,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            kind,
            count,
            stages,
            immutable_samplers: Vec::new(),
        }
    }
}

pub struct DescriptorSetLayout {
    device: Device,
    raw: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingDesc>,
    counts: DescriptorCounts,
    // Per binding: offset of its first descriptor within its kind's range
    // (and, for mutable samplers, within the mutable-sampler range).
    storage_offsets: Vec<BindingStorageOffset>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BindingStorageOffset {
    pub kind_offset: u32,
    pub mutable_sampler_offset: u32,
}

impl DescriptorSetLayout {
    pub fn new(
        device: Device,
        mut bindings: Vec<DescriptorBindingDesc>,
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> VkResult<Self> {
        bindings.sort_by_key(|b| b.binding);
        let counts = DescriptorCounts::from_bindings(&bindings);
        let storage_offsets = Self::compute_storage_offsets(&bindings);

        // Immutable sampler handle arrays must outlive the create call.
        let sampler_handles: SmallVec<[Vec<vk::Sampler>; 4]> = bindings
            .iter()
            .map(|b| b.immutable_samplers.iter().map(|s| s.raw()).collect())
            .collect();
        let vk_bindings: SmallVec<[vk::DescriptorSetLayoutBinding; 8]> = bindings
            .iter()
            .zip(sampler_handles.iter())
            .map(|(b, samplers)| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: b.kind.to_vk(),
                descriptor_count: b.count,
                stage_flags: b.stages,
                p_immutable_samplers: if samplers.is_empty() {
                    std::ptr::null()
                } else {
                    samplers.as_ptr()
                },
                ..Default::default()
            })
            .collect();
        let raw = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo {
                    flags,
                    binding_count: vk_bindings.len() as u32,
                    p_bindings: vk_bindings.as_ptr(),
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self {
            device,
            raw,
            bindings,
            counts,
            storage_offsets,
        })
    }

    fn compute_storage_offsets(bindings: &[DescriptorBindingDesc]) -> Vec<BindingStorageOffset> {
        let mut per_kind = [0u32; super::KIND_COUNT];
        let mut mutable_samplers = 0u32;
        bindings
            .iter()
            .map(|b| {
                let offset = BindingStorageOffset {
                    kind_offset: per_kind[b.kind.ix()],
                    mutable_sampler_offset: mutable_samplers,
                };
                per_kind[b.kind.ix()] += b.count;
                if b.kind == DescriptorKind::CombinedImageSampler
                    && b.immutable_samplers.is_empty()
                {
                    mutable_samplers += b.count;
                }
                offset
            })
            .collect()
    }

    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }
    pub fn bindings(&self) -> &[DescriptorBindingDesc] {
        &self.bindings
    }
    pub fn counts(&self) -> &DescriptorCounts {
        &self.counts
    }
    pub(super) fn binding_info(
        &self,
        binding: u32,
    ) -> Option<(&DescriptorBindingDesc, BindingStorageOffset)> {
        let ix = self
            .bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()?;
        Some((&self.bindings[ix], self.storage_offsets[ix]))
    }
}

impl HasDevice for DescriptorSetLayout {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.raw, None);
        }
    }
}
