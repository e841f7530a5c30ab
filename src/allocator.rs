use std::collections::BTreeMap;

/// Failure / unallocated sentinel shared by every allocator in the crate.
pub const INVALID_ADDRESS: u32 = !0;

/// Bump allocator over a fixed address space. `free` is unsupported; the only
/// way back is rewinding the cursor, which batch rollback uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearAllocator {
    cursor: u32,
    capacity: u32,
}

impl LinearAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            cursor: 0,
            capacity,
        }
    }
    pub fn allocate(&mut self, count: u32) -> u32 {
        if count == 0 || count > self.capacity - self.cursor {
            return INVALID_ADDRESS;
        }
        let addr = self.cursor;
        self.cursor += count;
        addr
    }
    pub fn cursor(&self) -> u32 {
        self.cursor
    }
    /// Roll the cursor back to a previously observed position.
    pub fn rewind(&mut self, cursor: u32) {
        debug_assert!(cursor <= self.cursor);
        self.cursor = cursor;
    }
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// General purpose allocator over a fixed address space: free blocks keyed by
/// offset, first-fit allocation, two-sided coalescing on free. Freeing a range
/// immediately after allocating it restores the exact prior block map, which
/// the descriptor pool's batch rollback relies on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeListAllocator {
    capacity: u32,
    // offset -> length of each free block; blocks never touch or overlap
    free_blocks: BTreeMap<u32, u32>,
}

impl FreeListAllocator {
    pub fn new(capacity: u32) -> Self {
        let mut free_blocks = BTreeMap::new();
        if capacity > 0 {
            free_blocks.insert(0, capacity);
        }
        Self {
            capacity,
            free_blocks,
        }
    }
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
    pub fn allocate(&mut self, count: u32) -> u32 {
        if count == 0 {
            return INVALID_ADDRESS;
        }
        let found = self
            .free_blocks
            .iter()
            .find(|(_, &len)| len >= count)
            .map(|(&offset, &len)| (offset, len));
        let Some((offset, len)) = found else {
            return INVALID_ADDRESS;
        };
        self.free_blocks.remove(&offset);
        if len > count {
            self.free_blocks.insert(offset + count, len - count);
        }
        offset
    }
    pub fn free(&mut self, offset: u32, count: u32) {
        if count == 0 {
            return;
        }
        debug_assert!(offset + count <= self.capacity);
        let mut offset = offset;
        let mut count = count;
        // merge with the block ending exactly at `offset`
        if let Some((&prev_offset, &prev_len)) = self.free_blocks.range(..offset).next_back() {
            debug_assert!(prev_offset + prev_len <= offset, "double free");
            if prev_offset + prev_len == offset {
                self.free_blocks.remove(&prev_offset);
                offset = prev_offset;
                count += prev_len;
            }
        }
        // merge with the block starting exactly at the end of the freed range
        if let Some(&next_len) = self.free_blocks.get(&(offset + count)) {
            self.free_blocks.remove(&(offset + count));
            count += next_len;
        }
        self.free_blocks.insert(offset, count);
    }
}

/// Per-descriptor-kind allocator state. Pools that allow freeing sets get the
/// reusable allocator; everything else gets the cheaper bump allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocatorState {
    Reusable(FreeListAllocator),
    Linear(LinearAllocator),
}

impl AllocatorState {
    pub fn new(capacity: u32, allows_freeing: bool) -> Self {
        if allows_freeing {
            Self::Reusable(FreeListAllocator::new(capacity))
        } else {
            Self::Linear(LinearAllocator::new(capacity))
        }
    }
    pub fn allocate(&mut self, count: u32) -> u32 {
        match self {
            Self::Reusable(a) => a.allocate(count),
            Self::Linear(a) => a.allocate(count),
        }
    }
    /// Only meaningful for reusable allocators; the pool never routes frees to
    /// a linear allocator.
    pub fn free(&mut self, offset: u32, count: u32) {
        match self {
            Self::Reusable(a) => a.free(offset, count),
            Self::Linear(_) => debug_assert!(false, "free on a non-reusable allocator"),
        }
    }
    /// Undo an allocation during rollback. Valid for both modes as long as
    /// allocations are undone in reverse order, which makes the linear rewind
    /// exact.
    pub fn unallocate(&mut self, offset: u32, count: u32) {
        match self {
            Self::Reusable(a) => a.free(offset, count),
            Self::Linear(a) => a.rewind(offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_exhaustion() {
        let mut alloc = LinearAllocator::new(4);
        for expected in 0..4 {
            assert_eq!(alloc.allocate(1), expected);
        }
        assert_eq!(alloc.allocate(1), INVALID_ADDRESS);
    }

    #[test]
    fn linear_rewind() {
        let mut alloc = LinearAllocator::new(8);
        let mark = alloc.cursor();
        assert_eq!(alloc.allocate(3), 0);
        assert_eq!(alloc.allocate(3), 3);
        alloc.rewind(mark);
        assert_eq!(alloc, LinearAllocator::new(8));
    }

    #[test]
    fn free_list_exhaustion_distinct_offsets() {
        let mut alloc = FreeListAllocator::new(16);
        let mut offsets = Vec::new();
        for _ in 0..16 {
            let addr = alloc.allocate(1);
            assert_ne!(addr, INVALID_ADDRESS);
            assert!(!offsets.contains(&addr));
            offsets.push(addr);
        }
        assert_eq!(alloc.allocate(1), INVALID_ADDRESS);
    }

    #[test]
    fn free_list_reuse() {
        let mut alloc = FreeListAllocator::new(4);
        assert_eq!(alloc.allocate(4), 0);
        assert_eq!(alloc.allocate(1), INVALID_ADDRESS);
        alloc.free(1, 2);
        assert_eq!(alloc.allocate(2), 1);
    }

    #[test]
    fn free_list_coalescing_restores_state() {
        let mut alloc = FreeListAllocator::new(8);
        let pristine = alloc.clone();
        let a = alloc.allocate(3);
        let b = alloc.allocate(2);
        let c = alloc.allocate(3);
        assert_eq!(alloc.allocate(1), INVALID_ADDRESS);
        // free out of order; coalescing must stitch the space back together
        alloc.free(b, 2);
        alloc.free(c, 3);
        alloc.free(a, 3);
        assert_eq!(alloc, pristine);
        assert_eq!(alloc.allocate(8), 0);
    }

    #[test]
    fn free_list_large_then_small() {
        let mut alloc = FreeListAllocator::new(8);
        assert_eq!(alloc.allocate(5), 0);
        assert_eq!(alloc.allocate(5), INVALID_ADDRESS);
        assert_eq!(alloc.allocate(3), 5);
    }

    #[test]
    fn zero_capacity_always_fails() {
        assert_eq!(FreeListAllocator::new(0).allocate(1), INVALID_ADDRESS);
        assert_eq!(LinearAllocator::new(0).allocate(1), INVALID_ADDRESS);
    }
}
