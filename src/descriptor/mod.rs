mod cache;
mod layout;
mod pool;
mod set;

pub use cache::*;
pub use layout::*;
pub use pool::*;
pub use set::*;

use ash::vk;

/// Descriptor kinds the pool sub-allocates. One allocator state exists per
/// kind, plus an extra slot for mutable samplers aliasing combined image
/// samplers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DescriptorKind {
    CombinedImageSampler = 0,
    StorageImage = 1,
    UniformTexelBuffer = 2,
    StorageTexelBuffer = 3,
    UniformBuffer = 4,
    StorageBuffer = 5,
    UniformBufferDynamic = 6,
    StorageBufferDynamic = 7,
    InputAttachment = 8,
    AccelerationStructure = 9,
}

pub const KIND_COUNT: usize = 10;
/// Index of the mutable-sampler allocator in per-kind tables.
pub const MUTABLE_SAMPLER_IX: usize = KIND_COUNT;

pub const ALL_KINDS: [DescriptorKind; KIND_COUNT] = [
    DescriptorKind::CombinedImageSampler,
    DescriptorKind::StorageImage,
    DescriptorKind::UniformTexelBuffer,
    DescriptorKind::StorageTexelBuffer,
    DescriptorKind::UniformBuffer,
    DescriptorKind::StorageBuffer,
    DescriptorKind::UniformBufferDynamic,
    DescriptorKind::StorageBufferDynamic,
    DescriptorKind::InputAttachment,
    DescriptorKind::AccelerationStructure,
];

impl DescriptorKind {
    pub fn ix(self) -> usize {
        self as u32 as usize
    }
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            Self::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            Self::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            Self::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// Per-kind descriptor totals, with the mutable-sampler tally in the extra
/// slot. Computable from binding descriptions alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorCounts(pub [u32; KIND_COUNT + 1]);

impl DescriptorCounts {
    pub fn from_bindings(bindings: &[DescriptorBindingDesc]) -> Self {
        let mut counts = Self::default();
        for binding in bindings {
            counts.0[binding.kind.ix()] += binding.count;
            // A combined image sampler without immutable samplers also needs a
            // mutable sampler slot per descriptor.
            if binding.kind == DescriptorKind::CombinedImageSampler
                && binding.immutable_samplers.is_empty()
            {
                counts.0[MUTABLE_SAMPLER_IX] += binding.count;
            }
        }
        counts
    }
    pub fn of(&self, kind: DescriptorKind) -> u32 {
        self.0[kind.ix()]
    }
    pub fn mutable_samplers(&self) -> u32 {
        self.0[MUTABLE_SAMPLER_IX]
    }
    pub fn accumulate(&mut self, other: &Self) {
        for (dst, src) in self.0.iter_mut().zip(other.0.iter()) {
            *dst += src;
        }
    }
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }
}
