//! Page-granular physical frame allocation.
//!
//! Frames are identified by dense [`FrameIndex`] values; per-frame state is
//! one [`FrameRecord`] in a caller-provided contiguous array (the mapped
//! Pages region). The free list is a lock-free stack: a single atomic head
//! plus a `next` link inside each record. `allocate` pops with a CAS loop,
//! `deallocate` splices a whole caller-built [`FrameList`] with one CAS.
//!
//! ABA on the head is benign here: records never move and a frame's link is
//! only rewritten while it is owned by exactly one side of the head CAS.

pub mod bootstrap;

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use static_assertions::const_assert_eq;

use crate::mem::map::MemoryMapEntry;
use crate::mem::mapping::DirectMapping;
use crate::mem::{PhysicalAddress, PAGE_SIZE};

pub use bootstrap::BootstrapFrameAllocator;

/// Raw value of the reserved "no frame" sentinel.
const NONE_RAW: u32 = u32::MAX;

/// Identifies one physical frame.
///
/// Public values are always valid; the `NONE` sentinel never escapes this
/// module.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIndex(u32);

impl FrameIndex {
    /// The frame containing `physical`.
    pub const fn from_physical(physical: PhysicalAddress) -> Self {
        debug_assert!(physical.value() / PAGE_SIZE <= u32::MAX as usize);
        Self((physical.value() / PAGE_SIZE) as u32)
    }

    /// Base address of the frame: `index × PAGE_SIZE`.
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 as usize * PAGE_SIZE)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for FrameIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FrameIndex({})", self.0)
    }
}

/// Per-frame bookkeeping: the free-list link.
///
/// The link is atomic because CAS retries in [`FrameAllocator::allocate`]
/// may read it while another executor pops the frame; transitions between
/// "on the free list" and "owned" are fenced by the head CAS.
pub struct FrameRecord {
    next: AtomicU32,
}

impl FrameRecord {
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(NONE_RAW) }
    }
}

impl Default for FrameRecord {
    fn default() -> Self {
        Self::new()
    }
}

// The record array is sized from the memory map; keep it one word per frame.
const_assert_eq!(core::mem::size_of::<FrameRecord>(), 4);

/// A plain, single-owner list of frames used to build deallocation batches.
///
/// Not thread safe: one owner links frames together, then
/// [`FrameAllocator::deallocate`] splices the whole list atomically.
#[derive(Debug)]
pub struct FrameList {
    first: u32,
    last: u32,
    count: usize,
}

impl FrameList {
    pub const fn new() -> Self {
        Self { first: NONE_RAW, last: NONE_RAW, count: 0 }
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Prepends `frame`, linking it through `records`.
    pub fn push(&mut self, frame: FrameIndex, records: &[FrameRecord]) {
        records[frame.0 as usize].next.store(self.first, Ordering::Relaxed);
        self.first = frame.0;
        if self.last == NONE_RAW {
            self.last = frame.0;
        }
        self.count += 1;
    }
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when no free frame exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramesExhausted;

impl core::fmt::Display for FramesExhausted {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("physical frames exhausted")
    }
}

impl core::error::Error for FramesExhausted {}

/// The runtime physical frame allocator.
pub struct FrameAllocator {
    records: &'static [FrameRecord],
    direct_map: &'static dyn DirectMapping,
    /// Head of the lock-free free list, padded away from the counter so the
    /// CAS loop and the counter update do not false-share.
    head: CachePadded<AtomicU32>,
    /// Published free byte count. Writers release, readers acquire.
    free_memory: CachePadded<AtomicUsize>,
    total_frames: AtomicUsize,
    /// Byte pattern written over each allocated frame, for use-after-free
    /// debugging. `None` leaves frame contents untouched.
    debug_pattern: Option<u8>,
}

impl FrameAllocator {
    /// Creates an allocator with an empty free list over `records`.
    ///
    /// `records` is the mapped Pages region: one record per frame index up
    /// to the highest usable frame boundary. Frames become allocatable once
    /// [`populate`](Self::populate) consumes the bootstrap allocator.
    pub fn new(
        records: &'static [FrameRecord],
        direct_map: &'static dyn DirectMapping,
        debug_pattern: Option<u8>,
    ) -> Self {
        Self {
            records,
            direct_map,
            head: CachePadded::new(AtomicU32::new(NONE_RAW)),
            free_memory: CachePadded::new(AtomicUsize::new(0)),
            total_frames: AtomicUsize::new(0),
            debug_pattern,
        }
    }

    /// Splices every frame the bootstrap allocator did not hand out onto the
    /// free list and publishes `free_memory`.
    ///
    /// `map` must be the same memory map the bootstrap allocator walked.
    pub fn populate(&self, map: &[MemoryMapEntry], bootstrap: BootstrapFrameAllocator<'_>) {
        debug_assert!(core::ptr::eq(map, bootstrap.map()));
        let (consumed_region, cursor) = bootstrap.finish();

        let mut list = FrameList::new();
        for (index, entry) in map.iter().enumerate() {
            if !entry.is_free() || index < consumed_region {
                continue;
            }
            let start = if index == consumed_region {
                cursor.max(entry.range.base().value())
            } else {
                entry.range.base().value()
            };
            let mut physical = start;
            while physical < entry.range.end().value() {
                let frame = FrameIndex::from_physical(PhysicalAddress::new(physical));
                physical += PAGE_SIZE;
                // The trimmed sentinel frame stays unusable forever.
                if frame.0 == NONE_RAW {
                    continue;
                }
                debug_assert!((frame.0 as usize) < self.records.len());
                list.push(frame, self.records);
            }
        }

        let count = list.count();
        self.total_frames.store(count, Ordering::Relaxed);
        self.deallocate(list);
        log::info!(
            "frame allocator online: {} frames, {} KiB free",
            count,
            count * PAGE_SIZE / 1024
        );
    }

    /// Pops one frame off the free list.
    pub fn allocate(&self) -> Result<FrameIndex, FramesExhausted> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == NONE_RAW {
                return Err(FramesExhausted);
            }
            let next = self.records[head as usize].next.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let frame = FrameIndex(head);
        self.records[head as usize].next.store(NONE_RAW, Ordering::Relaxed);
        self.free_memory.fetch_sub(PAGE_SIZE, Ordering::Release);

        if let Some(pattern) = self.debug_pattern {
            let virt = self.direct_map.direct_map_from_physical(frame.physical_address());
            // SAFETY: the direct map covers every usable frame and this
            // frame is exclusively owned from the CAS above until the caller
            // releases it.
            unsafe {
                core::ptr::write_bytes(virt.as_ptr::<u8>(), pattern, PAGE_SIZE);
            }
        }

        Ok(frame)
    }

    /// Splices `list` onto the free list with a single CAS.
    ///
    /// No-op for an empty list.
    pub fn deallocate(&self, list: FrameList) {
        if list.is_empty() {
            return;
        }

        let last = &self.records[list.last as usize];
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            last.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                list.first,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.free_memory.fetch_add(list.count * PAGE_SIZE, Ordering::Release);
    }

    /// Links `frame` into a caller-built deallocation batch.
    pub fn extend_list(&self, list: &mut FrameList, frame: FrameIndex) {
        list.push(frame, self.records);
    }

    /// Convenience for returning a single frame.
    pub fn deallocate_one(&self, frame: FrameIndex) {
        let mut list = FrameList::new();
        list.push(frame, self.records);
        self.deallocate(list);
    }

    /// The published free byte count.
    pub fn free_memory(&self) -> usize {
        self.free_memory.load(Ordering::Acquire)
    }

    /// Frames handed to [`populate`](Self::populate).
    pub fn total_frames(&self) -> usize {
        self.total_frames.load(Ordering::Relaxed)
    }

    /// The direct mapping the allocator addresses frame contents through.
    pub fn direct_map(&self) -> &'static dyn DirectMapping {
        self.direct_map
    }

    pub(crate) fn records(&self) -> &'static [FrameRecord] {
        self.records
    }
}
