//! One-shot frame allocation before the runtime allocator is online.
//!
//! Boot code needs frames (page tables, the Pages region backing) before the
//! free list exists. This allocator bumps linearly through the memory map's
//! `Free` entries and never deallocates; [`FrameAllocator::populate`]
//! consumes its watermark and turns everything left into the free list.
//!
//! [`FrameAllocator::populate`]: super::FrameAllocator::populate

use crate::frame::{FrameIndex, FramesExhausted};
use crate::mem::map::MemoryMapEntry;
use crate::mem::{PhysicalAddress, PAGE_SIZE};

pub struct BootstrapFrameAllocator<'a> {
    map: &'a [MemoryMapEntry],
    /// Index of the memory-map entry currently being carved.
    region: usize,
    /// Next physical address to hand out within the current entry.
    cursor: usize,
    allocated: usize,
}

impl<'a> BootstrapFrameAllocator<'a> {
    pub fn new(map: &'a [MemoryMapEntry]) -> Self {
        let mut this = Self { map, region: 0, cursor: 0, allocated: 0 };
        this.seek_free_region();
        this
    }

    /// Positions `region`/`cursor` at the next `Free` entry, if any.
    fn seek_free_region(&mut self) {
        while let Some(entry) = self.map.get(self.region) {
            if entry.is_free() {
                self.cursor = self.cursor.max(entry.range.base().value());
                if self.cursor < entry.range.end().value() {
                    return;
                }
            }
            self.region += 1;
            self.cursor = 0;
        }
    }

    /// Bumps out one frame.
    pub fn allocate(&mut self) -> Result<FrameIndex, FramesExhausted> {
        loop {
            let Some(entry) = self.map.get(self.region) else {
                return Err(FramesExhausted);
            };
            if !entry.is_free() || self.cursor >= entry.range.end().value() {
                self.region += 1;
                self.cursor = 0;
                self.seek_free_region();
                continue;
            }

            let frame = FrameIndex::from_physical(PhysicalAddress::new(self.cursor));
            self.cursor += PAGE_SIZE;
            // The frame whose index equals the sentinel is trimmed, not
            // handed out; the rest of its entry stays usable.
            if frame.value() == u32::MAX {
                continue;
            }
            self.allocated += 1;
            return Ok(frame);
        }
    }

    /// Frames handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub(super) fn map(&self) -> &'a [MemoryMapEntry] {
        self.map
    }

    /// Consumes the allocator, yielding the watermark `(region, cursor)`:
    /// every `Free` frame before it has been handed out.
    pub(super) fn finish(self) -> (usize, usize) {
        (self.region, self.cursor)
    }
}
