//! Disc sector allocator.
//!
//! The layout planner assigns every logical sector of the ISO9660 track
//! to exactly one role. The allocator tracks which LSN ranges have been
//! handed out, detects double-reservations of fixed addresses and
//! answers "highest allocated sector" queries, which is how the final
//! ISO track size is derived.
//!
//! The 333,000 sector address space is kept as an ordered map of
//! allocated runs rather than a flat bitmap, so a nearly empty disc
//! costs a handful of entries.

use std::collections::BTreeMap;

/// Allocation state over the LSN space.
///
/// Identical call sequences always produce identical allocations: the
/// next-fit scan is a deterministic first-fit from LSN 0.
#[derive(Debug, Default)]
pub struct SectorAllocator {
    /// Allocated runs, keyed by start LSN, value is the run length
    runs: BTreeMap<u32, u32>,
}

impl SectorAllocator {
    /// Create an allocator with every sector free
    pub fn new() -> SectorAllocator {
        SectorAllocator {
            runs: BTreeMap::new(),
        }
    }

    /// Returns true if every sector of `[start, start + count)` is free
    fn range_free(&self, start: u32, count: u32) -> bool {
        let end = start + count;

        if let Some((&s, &len)) = self.runs.range(..=start).next_back() {
            if s + len > start {
                return false;
            }
        }

        if let Some((&s, _)) = self.runs.range(start..).next() {
            if s < end {
                return false;
            }
        }

        true
    }

    /// Insert a run, coalescing with its neighbours
    fn insert_run(&mut self, start: u32, count: u32) {
        let mut start = start;
        let mut count = count;

        if let Some((&s, &len)) = self.runs.range(..start).next_back() {
            if s + len == start {
                self.runs.remove(&s);
                start = s;
                count += len;
            }
        }

        if let Some(&len) = self.runs.get(&(start + count)) {
            self.runs.remove(&(start + count));
            count += len;
        }

        self.runs.insert(start, count);
    }

    /// Reserve `count` sectors at the fixed LSN `start`. Returns
    /// `None` without changing any state if any sector in the range is
    /// already taken.
    pub fn reserve_at(&mut self, start: u32, count: u32) -> Option<u32> {
        assert!(count > 0);

        if !self.range_free(start, count) {
            return None;
        }

        self.insert_run(start, count);

        Some(start)
    }

    /// Reserve the first free run of `count` sectors, scanning up from
    /// LSN 0
    pub fn reserve_next(&mut self, count: u32) -> u32 {
        assert!(count > 0);

        let mut cursor = 0u32;

        for (&s, &len) in self.runs.iter() {
            if s - cursor >= count {
                break;
            }
            cursor = s + len;
        }

        self.insert_run(cursor, count);

        cursor
    }

    /// Release `[start, start + count)`. Panics if any sector of the
    /// range was not allocated: freeing unreserved sectors is a logic
    /// error in the layout planner.
    pub fn free(&mut self, start: u32, count: u32) {
        assert!(count > 0);

        let end = start + count;

        let (&s, &len) = self
            .runs
            .range(..=start)
            .next_back()
            .expect("freeing unallocated sectors");

        assert!(s + len >= end, "freeing unallocated sectors");

        self.runs.remove(&s);

        if s < start {
            self.runs.insert(s, start - s);
        }

        if s + len > end {
            self.runs.insert(end, s + len - end);
        }
    }

    /// Highest allocated LSN, or `None` if nothing has been reserved
    pub fn highest(&self) -> Option<u32> {
        self.runs
            .iter()
            .next_back()
            .map(|(&s, &len)| s + len - 1)
    }
}

#[cfg(test)]
mod test {
    use super::SectorAllocator;

    #[test]
    fn fixed_reservations() {
        let mut alloc = SectorAllocator::new();

        assert!(alloc.reserve_at(16, 1) == Some(16));
        assert!(alloc.reserve_at(17, 1) == Some(17));

        // Double-reservation is refused
        assert!(alloc.reserve_at(16, 1) == None);
        assert!(alloc.reserve_at(10, 10) == None);
        assert!(alloc.reserve_at(17, 5) == None);

        // The refusals must not have changed anything
        assert!(alloc.reserve_at(18, 1) == Some(18));
        assert!(alloc.highest() == Some(18));
    }

    #[test]
    fn first_fit() {
        let mut alloc = SectorAllocator::new();

        alloc.reserve_at(0, 16).unwrap();
        alloc.reserve_at(75, 75).unwrap();

        // 59 free sectors between 16 and 75
        assert!(alloc.reserve_next(59) == 16);
        // Next fit lands after the run ending at 149
        assert!(alloc.reserve_next(10) == 150);
        assert!(alloc.highest() == Some(159));
    }

    #[test]
    fn free_and_realloc() {
        let mut alloc = SectorAllocator::new();

        alloc.reserve_at(18, 57).unwrap();
        alloc.free(18, 57);

        assert!(alloc.reserve_at(18, 4) == Some(18));
        assert!(alloc.reserve_at(22, 2) == Some(22));
    }

    #[test]
    fn partial_free_splits() {
        let mut alloc = SectorAllocator::new();

        alloc.reserve_at(100, 50).unwrap();
        alloc.free(110, 10);

        assert!(alloc.reserve_at(110, 10) == Some(110));
        assert!(alloc.reserve_at(100, 1) == None);
        assert!(alloc.reserve_at(120, 1) == None);
    }

    #[test]
    #[should_panic]
    fn free_unallocated_panics() {
        let mut alloc = SectorAllocator::new();

        alloc.reserve_at(10, 5).unwrap();
        alloc.free(10, 10);
    }

    #[test]
    fn highest_empty() {
        assert!(SectorAllocator::new().highest() == None);
    }
}
