use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use arrayvec::ArrayVec;
use ash::vk;
use thiserror::Error;

use super::{DescriptorCounts, DescriptorKind, DescriptorSet, ALL_KINDS, KIND_COUNT,
            MUTABLE_SAMPLER_IX};
use crate::allocator::{AllocatorState, INVALID_ADDRESS};
use crate::resources::{AccelerationStructure, BufferView, ImageView, Sampler};
use crate::{Buffer, DescriptorSetLayout, Device, HasDevice};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorPoolFlags(u32);

impl DescriptorPoolFlags {
    pub const NONE: Self = Self(0);
    /// Individual sets may be freed back to the pool.
    pub const FREE_DESCRIPTOR_SET: Self = Self(0x1);
    pub const UPDATE_AFTER_BIND: Self = Self(0x2);
    pub const HOST_ONLY: Self = Self(0x4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
    fn to_vk(self) -> vk::DescriptorPoolCreateFlags {
        let mut flags = vk::DescriptorPoolCreateFlags::empty();
        if self.contains(Self::FREE_DESCRIPTOR_SET) {
            flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }
        if self.contains(Self::UPDATE_AFTER_BIND) {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }
        if self.contains(Self::HOST_ONLY) {
            flags |= vk::DescriptorPoolCreateFlags::HOST_ONLY_EXT;
        }
        flags
    }
}

impl BitOr for DescriptorPoolFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One slot index per descriptor kind (plus the mutable-sampler slot).
/// `INVALID_ADDRESS` marks kinds the owning set has no descriptors of, which
/// is what destruction keys off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorOffsets(pub [u32; KIND_COUNT + 1]);

impl Default for DescriptorOffsets {
    fn default() -> Self {
        Self([INVALID_ADDRESS; KIND_COUNT + 1])
    }
}

#[derive(Debug, Error)]
pub enum DescriptorPoolError {
    #[error("descriptor pool capacity exhausted")]
    OutOfPoolMemory,
    #[error("pool was not created with FREE_DESCRIPTOR_SET")]
    FreeNotAllowed,
    #[error("write targets unknown binding {0}")]
    UnknownBinding(u32),
    #[error("binding {0} has mutable samplers but the write supplied none")]
    MissingSampler(u32),
    #[error("resource written to binding {0} does not match its descriptor kind")]
    KindMismatch(u32),
    #[error(transparent)]
    Vk(#[from] vk::Result),
}

/// Device-free allocation bookkeeping for a descriptor pool: one allocator
/// state per descriptor kind plus the mutable-sampler alias slot, and the
/// outstanding-set counter. Equality-comparable so tests can assert that a
/// failed batch leaves the accounting untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAccounting {
    max_sets: u32,
    outstanding_sets: u32,
    allocators: [AllocatorState; KIND_COUNT + 1],
}

impl PoolAccounting {
    pub fn new(max_sets: u32, pool_sizes: &DescriptorCounts, allows_freeing: bool) -> Self {
        Self {
            max_sets,
            outstanding_sets: 0,
            allocators: std::array::from_fn(|i| {
                AllocatorState::new(pool_sizes.0[i], allows_freeing)
            }),
        }
    }

    /// Allocate the contiguous per-kind ranges for one batch of sets. All or
    /// nothing: on any sub-allocation failure everything allocated so far in
    /// the batch is returned and `None` comes back with the accounting equal
    /// to its pre-call state.
    pub fn allocate_batch(
        &mut self,
        layout_counts: &[&DescriptorCounts],
    ) -> Option<Vec<DescriptorOffsets>> {
        let mut journal: Vec<(usize, u32, u32)> = Vec::new();
        let mut results = Vec::with_capacity(layout_counts.len());
        let sets_before = self.outstanding_sets;
        for counts in layout_counts {
            if self.outstanding_sets == self.max_sets {
                self.rollback(&journal, sets_before);
                return None;
            }
            let mut offsets = DescriptorOffsets::default();
            for slot in 0..=KIND_COUNT {
                let count = counts.0[slot];
                if count == 0 {
                    continue;
                }
                let addr = self.allocators[slot].allocate(count);
                if addr == INVALID_ADDRESS {
                    self.rollback(&journal, sets_before);
                    return None;
                }
                journal.push((slot, addr, count));
                offsets.0[slot] = addr;
            }
            self.outstanding_sets += 1;
            results.push(offsets);
        }
        Some(results)
    }

    fn rollback(&mut self, journal: &[(usize, u32, u32)], sets_before: u32) {
        // Undo in reverse order so linear-allocator cursor rewinds are exact.
        for &(slot, addr, count) in journal.iter().rev() {
            self.allocators[slot].unallocate(addr, count);
        }
        self.outstanding_sets = sets_before;
    }

    /// Return one set's ranges. Only valid on free-enabled accounting.
    pub fn free_offsets(&mut self, offsets: &DescriptorOffsets, counts: &DescriptorCounts) {
        for slot in 0..=KIND_COUNT {
            if offsets.0[slot] != INVALID_ADDRESS {
                self.allocators[slot].free(offsets.0[slot], counts.0[slot]);
            }
        }
        self.outstanding_sets -= 1;
    }

    pub fn outstanding_sets(&self) -> u32 {
        self.outstanding_sets
    }
}

/// Typed backing storage. Slots start out `None` and are only populated when a
/// descriptor write lands in them; kinds sharing a resource category live in
/// one array at disjoint base offsets.
struct PoolStorage {
    images: Box<[Option<Arc<ImageView>>]>,
    mutable_samplers: Box<[Option<Arc<Sampler>>]>,
    storage_images: Box<[Option<Arc<ImageView>>]>,
    buffers: Box<[Option<Arc<Buffer>>]>,
    texel_buffers: Box<[Option<Arc<BufferView>>]>,
    acceleration_structures: Box<[Option<Arc<AccelerationStructure>>]>,
}

fn none_slots<T>(len: u32) -> Box<[Option<T>]> {
    std::iter::repeat_with(|| None).take(len as usize).collect()
}

impl PoolStorage {
    fn new(max: &DescriptorCounts) -> Self {
        use DescriptorKind::*;
        Self {
            images: none_slots(max.of(CombinedImageSampler)),
            mutable_samplers: none_slots(max.of(CombinedImageSampler)),
            storage_images: none_slots(max.of(StorageImage) + max.of(InputAttachment)),
            buffers: none_slots(
                max.of(UniformBuffer)
                    + max.of(StorageBuffer)
                    + max.of(UniformBufferDynamic)
                    + max.of(StorageBufferDynamic),
            ),
            texel_buffers: none_slots(max.of(UniformTexelBuffer) + max.of(StorageTexelBuffer)),
            acceleration_structures: none_slots(max.of(AccelerationStructure)),
        }
    }

    fn clear_range(&mut self, max: &DescriptorCounts, kind: DescriptorKind, offset: u32, count: u32) {
        let base = storage_base(max, kind) + offset;
        match kind {
            DescriptorKind::CombinedImageSampler => clear(&mut self.images, base, count),
            DescriptorKind::StorageImage | DescriptorKind::InputAttachment => {
                clear(&mut self.storage_images, base, count)
            }
            DescriptorKind::UniformTexelBuffer | DescriptorKind::StorageTexelBuffer => {
                clear(&mut self.texel_buffers, base, count)
            }
            DescriptorKind::UniformBuffer
            | DescriptorKind::StorageBuffer
            | DescriptorKind::UniformBufferDynamic
            | DescriptorKind::StorageBufferDynamic => clear(&mut self.buffers, base, count),
            DescriptorKind::AccelerationStructure => {
                clear(&mut self.acceleration_structures, base, count)
            }
        }
    }

    fn clear_mutable_samplers(&mut self, offset: u32, count: u32) {
        clear(&mut self.mutable_samplers, offset, count);
    }
}

fn clear<T>(slots: &mut [Option<T>], base: u32, count: u32) {
    for slot in &mut slots[base as usize..(base + count) as usize] {
        *slot = None;
    }
}

/// Base offset of a kind within its shared storage array.
pub(super) fn storage_base(max: &DescriptorCounts, kind: DescriptorKind) -> u32 {
    use DescriptorKind::*;
    match kind {
        CombinedImageSampler => 0,
        StorageImage => 0,
        InputAttachment => max.of(StorageImage),
        UniformTexelBuffer => 0,
        StorageTexelBuffer => max.of(UniformTexelBuffer),
        UniformBuffer => 0,
        StorageBuffer => max.of(UniformBuffer),
        UniformBufferDynamic => max.of(UniformBuffer) + max.of(StorageBuffer),
        StorageBufferDynamic => {
            max.of(UniformBuffer) + max.of(StorageBuffer) + max.of(UniformBufferDynamic)
        }
        AccelerationStructure => 0,
    }
}

struct PoolState {
    accounting: PoolAccounting,
    storage: PoolStorage,
}

struct PoolShared {
    device: Device,
    raw: vk::DescriptorPool,
    flags: DescriptorPoolFlags,
    max_sets: u32,
    max_counts: DescriptorCounts,
    state: Mutex<PoolState>,
}

/// Fixed-capacity descriptor arena. Capacity (sets and per-kind descriptor
/// maxima) is declared up front and never grows; sets are created against it
/// and, when `FREE_DESCRIPTOR_SET` is set, returned to it.
#[derive(Clone)]
pub struct DescriptorPool(Arc<PoolShared>);

impl DescriptorPool {
    pub fn new(
        device: Device,
        flags: DescriptorPoolFlags,
        max_sets: u32,
        pool_sizes: &[(DescriptorKind, u32)],
    ) -> Result<Self, DescriptorPoolError> {
        let mut max_counts = DescriptorCounts::default();
        for &(kind, count) in pool_sizes {
            max_counts.0[kind.ix()] += count;
        }
        // Mutable samplers can alias any combined-image-sampler descriptor.
        max_counts.0[MUTABLE_SAMPLER_IX] = max_counts.of(DescriptorKind::CombinedImageSampler);

        let vk_sizes: ArrayVec<vk::DescriptorPoolSize, KIND_COUNT> = ALL_KINDS
            .iter()
            .filter(|kind| max_counts.of(**kind) > 0)
            .map(|&kind| vk::DescriptorPoolSize {
                ty: kind.to_vk(),
                descriptor_count: max_counts.of(kind),
            })
            .collect();
        let raw = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo {
                    flags: flags.to_vk(),
                    max_sets,
                    pool_size_count: vk_sizes.len() as u32,
                    p_pool_sizes: vk_sizes.as_ptr(),
                    ..Default::default()
                },
                None,
            )?
        };
        let allows_freeing = flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET);
        Ok(Self(Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                accounting: PoolAccounting::new(max_sets, &max_counts, allows_freeing),
                storage: PoolStorage::new(&max_counts),
            }),
            device,
            raw,
            flags,
            max_sets,
            max_counts,
        })))
    }

    pub fn capacity(&self) -> u32 {
        self.0.max_sets
    }
    pub fn flags(&self) -> DescriptorPoolFlags {
        self.0.flags
    }
    pub(super) fn max_counts(&self) -> &DescriptorCounts {
        &self.0.max_counts
    }

    /// Create one set per layout. Atomic: if any per-kind sub-allocation or
    /// the backing-pool allocation fails, every offset taken for the batch is
    /// rolled back and no set is created.
    pub fn create_descriptor_sets(
        &self,
        layouts: &[&Arc<DescriptorSetLayout>],
    ) -> Result<Vec<DescriptorSet>, DescriptorPoolError> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let counts: Vec<&DescriptorCounts> = layouts.iter().map(|l| l.counts()).collect();
        let offsets = {
            let mut state = self.0.state.lock().unwrap();
            state
                .accounting
                .allocate_batch(&counts)
                .ok_or(DescriptorPoolError::OutOfPoolMemory)?
        };

        let raw_layouts: Vec<vk::DescriptorSetLayout> = layouts.iter().map(|l| l.raw()).collect();
        let raw_sets = unsafe {
            self.0.device.allocate_descriptor_sets(&vk::DescriptorSetAllocateInfo {
                descriptor_pool: self.0.raw,
                descriptor_set_count: raw_layouts.len() as u32,
                p_set_layouts: raw_layouts.as_ptr(),
                ..Default::default()
            })
        };
        let raw_sets = match raw_sets {
            Ok(sets) => sets,
            Err(err) => {
                let mut state = self.0.state.lock().unwrap();
                for (offs, counts) in offsets.iter().zip(counts.iter()) {
                    state.accounting.free_offsets(offs, counts);
                }
                return Err(err.into());
            }
        };

        Ok(raw_sets
            .into_iter()
            .zip(offsets)
            .zip(layouts.iter())
            .map(|((raw, offsets), layout)| {
                DescriptorSet::new(self.clone(), (*layout).clone(), raw, offsets)
            })
            .collect())
    }

    pub fn create_descriptor_set(
        &self,
        layout: &Arc<DescriptorSetLayout>,
    ) -> Result<DescriptorSet, DescriptorPoolError> {
        Ok(self.create_descriptor_sets(&[layout])?.remove(0))
    }

    /// Free a batch of sets. Only valid with `FREE_DESCRIPTOR_SET`; each
    /// set's per-kind ranges go back to their allocators and the resource
    /// handles stored in them are dropped.
    pub fn free_descriptor_sets(
        &self,
        sets: Vec<DescriptorSet>,
    ) -> Result<(), DescriptorPoolError> {
        if !self.0.flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET) {
            return Err(DescriptorPoolError::FreeNotAllowed);
        }
        // The sets' drop glue routes through `release_set`.
        drop(sets);
        Ok(())
    }

    /// Release a set's ranges and drop every resource handle stored in them.
    /// This is the only path that drops those ownership references.
    pub(super) fn release_set(
        &self,
        layout: &DescriptorSetLayout,
        offsets: &DescriptorOffsets,
        raw: vk::DescriptorSet,
    ) -> Result<(), DescriptorPoolError> {
        if !self.0.flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET) {
            return Err(DescriptorPoolError::FreeNotAllowed);
        }
        {
            let mut state = self.0.state.lock().unwrap();
            let max = self.0.max_counts;
            for kind in ALL_KINDS {
                let offset = offsets.0[kind.ix()];
                if offset != INVALID_ADDRESS {
                    state
                        .storage
                        .clear_range(&max, kind, offset, layout.counts().of(kind));
                }
            }
            if offsets.0[MUTABLE_SAMPLER_IX] != INVALID_ADDRESS {
                state.storage.clear_mutable_samplers(
                    offsets.0[MUTABLE_SAMPLER_IX],
                    layout.counts().mutable_samplers(),
                );
            }
            state.accounting.free_offsets(offsets, layout.counts());
        }
        unsafe {
            self.0.device.free_descriptor_sets(self.0.raw, &[raw])?;
        }
        Ok(())
    }

    pub(super) fn store_image(&self, slot: u32, handle: Arc<ImageView>, storage_image: bool) {
        let mut state = self.0.state.lock().unwrap();
        let slots = if storage_image {
            &mut state.storage.storage_images
        } else {
            &mut state.storage.images
        };
        slots[slot as usize] = Some(handle);
    }
    pub(super) fn store_mutable_sampler(&self, slot: u32, handle: Arc<Sampler>) {
        self.0.state.lock().unwrap().storage.mutable_samplers[slot as usize] = Some(handle);
    }
    pub(super) fn store_buffer(&self, slot: u32, handle: Arc<Buffer>) {
        self.0.state.lock().unwrap().storage.buffers[slot as usize] = Some(handle);
    }
    pub(super) fn store_texel_buffer(&self, slot: u32, handle: Arc<BufferView>) {
        self.0.state.lock().unwrap().storage.texel_buffers[slot as usize] = Some(handle);
    }
    pub(super) fn store_acceleration_structure(
        &self,
        slot: u32,
        handle: Arc<AccelerationStructure>,
    ) {
        self.0.state.lock().unwrap().storage.acceleration_structures[slot as usize] = Some(handle);
    }
}

impl HasDevice for DescriptorPool {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(kind: DescriptorKind, n: u32) -> DescriptorCounts {
        let mut c = DescriptorCounts::default();
        c.0[kind.ix()] = n;
        c
    }

    fn pool_sizes(storage: u32, uniform: u32) -> DescriptorCounts {
        let mut c = counts(DescriptorKind::StorageBuffer, storage);
        c.0[DescriptorKind::UniformBuffer.ix()] = uniform;
        c
    }

    #[test]
    fn batch_allocation_distinct_ranges() {
        let sizes = pool_sizes(8, 0);
        let mut acct = PoolAccounting::new(4, &sizes, true);
        let layout = counts(DescriptorKind::StorageBuffer, 2);
        let offsets = acct.allocate_batch(&[&layout, &layout, &layout]).unwrap();
        let taken: Vec<u32> = offsets
            .iter()
            .map(|o| o.0[DescriptorKind::StorageBuffer.ix()])
            .collect();
        assert_eq!(taken, vec![0, 2, 4]);
        assert_eq!(acct.outstanding_sets(), 3);
    }

    #[test]
    fn failed_batch_restores_accounting_exactly() {
        let sizes = pool_sizes(8, 2);
        for allows_freeing in [true, false] {
            let mut acct = PoolAccounting::new(8, &sizes, allows_freeing);
            // Seed some outstanding allocations first.
            let seed = counts(DescriptorKind::StorageBuffer, 3);
            acct.allocate_batch(&[&seed]).unwrap();
            let before = acct.clone();

            // Second layout of the batch over-demands uniform buffers.
            let small = counts(DescriptorKind::StorageBuffer, 2);
            let hungry = counts(DescriptorKind::UniformBuffer, 3);
            assert!(acct.allocate_batch(&[&small, &hungry]).is_none());
            assert_eq!(acct, before);

            // Demand that fails on the set-capacity limit rolls back too.
            let mut acct = PoolAccounting::new(1, &sizes, allows_freeing);
            let before = acct.clone();
            assert!(acct.allocate_batch(&[&small, &small]).is_none());
            assert_eq!(acct, before);
        }
    }

    #[test]
    fn free_then_reallocate() {
        let sizes = pool_sizes(4, 0);
        let mut acct = PoolAccounting::new(4, &sizes, true);
        let layout = counts(DescriptorKind::StorageBuffer, 4);
        let offsets = acct.allocate_batch(&[&layout]).unwrap();
        assert!(acct.allocate_batch(&[&layout]).is_none());
        acct.free_offsets(&offsets[0], &layout);
        let again = acct.allocate_batch(&[&layout]).unwrap();
        assert_eq!(again[0].0[DescriptorKind::StorageBuffer.ix()], 0);
    }

    #[test]
    fn unused_kinds_stay_invalid() {
        let sizes = pool_sizes(4, 4);
        let mut acct = PoolAccounting::new(4, &sizes, true);
        let layout = counts(DescriptorKind::StorageBuffer, 1);
        let offsets = acct.allocate_batch(&[&layout]).unwrap();
        assert_eq!(offsets[0].0[DescriptorKind::UniformBuffer.ix()], INVALID_ADDRESS);
        assert_eq!(offsets[0].0[MUTABLE_SAMPLER_IX], INVALID_ADDRESS);
        assert_ne!(offsets[0].0[DescriptorKind::StorageBuffer.ix()], INVALID_ADDRESS);
    }

    #[test]
    fn storage_bases_are_disjoint() {
        let mut max = DescriptorCounts::default();
        max.0[DescriptorKind::UniformBuffer.ix()] = 2;
        max.0[DescriptorKind::StorageBuffer.ix()] = 3;
        max.0[DescriptorKind::UniformBufferDynamic.ix()] = 4;
        max.0[DescriptorKind::StorageBufferDynamic.ix()] = 5;
        assert_eq!(storage_base(&max, DescriptorKind::UniformBuffer), 0);
        assert_eq!(storage_base(&max, DescriptorKind::StorageBuffer), 2);
        assert_eq!(storage_base(&max, DescriptorKind::UniformBufferDynamic), 5);
        assert_eq!(storage_base(&max, DescriptorKind::StorageBufferDynamic), 9);
    }
}
