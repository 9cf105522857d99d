//! First-fit range allocator for GPU-addressable space within one domain.
//!
//! Tracks free extents as an offset-keyed map; frees coalesce with both
//! neighbours. At most one allocation covers a given byte at a time (the
//! disjoint-residency invariant the placement manager relies on).

use std::collections::BTreeMap;

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value.checked_add(alignment - 1).map_or(u64::MAX, |v| v & !(alignment - 1))
}

#[derive(Debug)]
pub struct RangeAllocator {
    size: u64,
    /// offset → extent length, for every free extent.
    free: BTreeMap<u64, u64>,
    used: u64,
}

impl RangeAllocator {
    pub fn new(size: u64) -> RangeAllocator {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        RangeAllocator {
            size,
            free,
            used: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Allocate `len` bytes at an offset aligned to `alignment` (a power of
    /// two, or 0/1 for byte alignment). First fit in offset order.
    pub fn alloc(&mut self, len: u64, alignment: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return None;
        }

        let candidate = self.free.iter().find_map(|(&start, &extent)| {
            let aligned = align_up(start, alignment);
            let pad = aligned.checked_sub(start)?;
            extent.checked_sub(pad).filter(|room| *room >= len)?;
            Some((start, extent, aligned))
        });
        let (start, extent, aligned) = candidate?;

        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned - start);
        }
        let tail = start + extent - (aligned + len);
        if tail > 0 {
            self.free.insert(aligned + len, tail);
        }
        self.used += len;
        Some(aligned)
    }

    /// Return `[offset, offset + len)` to the free pool, coalescing with
    /// adjacent free extents.
    pub fn free(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        debug_assert!(offset + len <= self.size);

        let mut start = offset;
        let mut extent = len;

        // Merge with the predecessor if it ends exactly at `offset`.
        if let Some((&prev_start, &prev_len)) = self.free.range(..offset).next_back() {
            debug_assert!(prev_start + prev_len <= offset, "double free");
            if prev_start + prev_len == offset {
                self.free.remove(&prev_start);
                start = prev_start;
                extent += prev_len;
            }
        }
        // Merge with the successor if it begins exactly at the end.
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            extent += next_len;
        }

        self.free.insert(start, extent);
        self.used -= len;
    }
}
