//! Unit-test scaffolding: host-backed physical pools and collaborator
//! stand-ins.
//!
//! "Physical" addresses are offsets into one leaked page-aligned host
//! buffer; the direct map adds the buffer base, so the allocators touch
//! real memory exactly the way a kernel would through its direct map.
//! Fixtures leak on purpose; the components want `'static` wiring.

use std::alloc::Layout;
use std::collections::HashMap;
use std::vec::Vec;

use spin::Mutex;

use crate::arena::{Arena, ArenaOptions};
use crate::frame::{BootstrapFrameAllocator, FrameAllocator, FrameIndex, FrameList, FrameRecord};
use crate::mem::map::{MemoryMapEntry, MemoryMapEntryKind};
use crate::mem::mapping::{
    AddressSpaceMapper, BackingDecision, FlushBatch, FlushBus, FlushRequest, MapError, MapType,
    OffsetDirectMap, TopLevelDecision,
};
use crate::mem::{PhysicalAddress, PhysicalRange, VirtualAddress, VirtualRange, PAGE_SIZE};
use crate::slab::MetadataCaches;

/// Leaks a page-aligned, zeroed host buffer and returns its address range.
pub(crate) fn leak_buffer(bytes: usize) -> VirtualRange {
    assert!(bytes > 0 && bytes % PAGE_SIZE == 0);
    let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    // SAFETY: non-zero layout; the buffer is intentionally leaked.
    let pointer = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!pointer.is_null());
    VirtualRange::new(VirtualAddress::from_ptr(pointer), bytes)
}

pub(crate) struct TestPoolBuilder {
    bytes: usize,
    bootstrap_take: usize,
    debug_pattern: Option<u8>,
}

impl TestPoolBuilder {
    pub fn bootstrap_take(mut self, frames: usize) -> Self {
        self.bootstrap_take = frames;
        self
    }

    pub fn debug_pattern(mut self, pattern: u8) -> Self {
        self.debug_pattern = Some(pattern);
        self
    }

    pub fn build(self) -> TestPool {
        let backing = leak_buffer(self.bytes);
        let direct_map: &'static OffsetDirectMap = Box::leak(Box::new(OffsetDirectMap::new(
            backing,
            backing.base(),
        )));

        let map: &'static [MemoryMapEntry] = Box::leak(Box::new([MemoryMapEntry::new(
            PhysicalRange::new(PhysicalAddress::new(0), self.bytes),
            MemoryMapEntryKind::Free,
        )]));

        let records: &'static [FrameRecord] = Box::leak(
            (0..self.bytes / PAGE_SIZE)
                .map(|_| FrameRecord::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );

        let mut bootstrap = BootstrapFrameAllocator::new(map);
        let bootstrap_frames: Vec<FrameIndex> = (0..self.bootstrap_take)
            .map(|_| bootstrap.allocate().expect("pool large enough for bootstrap take"))
            .collect();

        let frames: &'static FrameAllocator = Box::leak(Box::new(FrameAllocator::new(
            records,
            direct_map,
            self.debug_pattern,
        )));
        frames.populate(map, bootstrap);

        TestPool { frames, bootstrap_frames }
    }
}

/// A populated frame allocator over leaked host memory.
pub(crate) struct TestPool {
    frames: &'static FrameAllocator,
    bootstrap_frames: Vec<FrameIndex>,
}

impl TestPool {
    pub fn builder(bytes: usize) -> TestPoolBuilder {
        TestPoolBuilder { bytes, bootstrap_take: 0, debug_pattern: None }
    }

    pub fn new(bytes: usize) -> Self {
        Self::builder(bytes).build()
    }

    pub fn with_debug_pattern(bytes: usize, pattern: u8) -> Self {
        Self::builder(bytes).debug_pattern(pattern).build()
    }

    pub fn frames(&self) -> &'static FrameAllocator {
        self.frames
    }

    pub fn bootstrap_frames(&self) -> impl Iterator<Item = FrameIndex> + '_ {
        self.bootstrap_frames.iter().copied()
    }
}

/// A frame pool plus metadata caches plus a page-granular arena over a
/// second host buffer: enough infrastructure for arena and slab tests.
pub(crate) struct TestEnv {
    pool: TestPool,
    metadata: &'static MetadataCaches,
    pages: &'static Arena,
}

impl TestEnv {
    /// `pool_bytes` backs frames (metadata slabs and `Pmm` caches);
    /// `pages_bytes` backs the page arena `Heap`-sourced slabs draw from.
    pub fn new(pool_bytes: usize, pages_bytes: usize) -> Self {
        let pool = TestPool::new(pool_bytes);
        let metadata: &'static MetadataCaches =
            Box::leak(Box::new(MetadataCaches::new(pool.frames())));

        let backing = leak_buffer(pages_bytes);
        let pages = Self::leak_arena_with(
            "test-pages",
            PAGE_SIZE,
            metadata,
            ArenaOptions::default(),
        );
        pages
            .add_span(backing.base().value(), backing.len())
            .expect("fresh arena accepts its span");

        Self { pool, metadata, pages }
    }

    pub fn frames(&self) -> &'static FrameAllocator {
        self.pool.frames()
    }

    pub fn metadata(&self) -> &'static MetadataCaches {
        self.metadata
    }

    /// The mapped page-granular arena, standing in for the heap's page
    /// layer.
    pub fn pages(&self) -> &'static Arena {
        self.pages
    }

    /// Builds and leaks an arena wired to this environment's metadata.
    pub fn leak_arena(&self, name: &'static str, quantum: usize, options: ArenaOptions) -> &'static Arena {
        Self::leak_arena_with(name, quantum, self.metadata, options)
    }

    fn leak_arena_with(
        name: &'static str,
        quantum: usize,
        metadata: &'static MetadataCaches,
        options: ArenaOptions,
    ) -> &'static Arena {
        Box::leak(Box::new(
            Arena::new(name, quantum, metadata, options).expect("valid test arena config"),
        ))
    }
}

/// A flush bus for a single-executor world: requests complete immediately.
pub(crate) struct NoopFlushBus;

impl FlushBus for NoopFlushBus {
    fn submit_and_wait(&self, _request: FlushRequest) {}
}

pub(crate) static NOOP_FLUSH: NoopFlushBus = NoopFlushBus;

/// A mapper over already-resident host memory: "mapping" only allocates
/// and records backing frames, "unmapping" returns them. The virtual
/// ranges it is handed are real host buffers, so no translation happens.
pub(crate) struct TestMapper {
    backing: Mutex<HashMap<usize, Vec<FrameIndex>>>,
    special: Mutex<HashMap<usize, (PhysicalRange, MapType)>>,
}

impl TestMapper {
    pub fn new() -> Self {
        Self {
            backing: Mutex::new(HashMap::new()),
            special: Mutex::new(HashMap::new()),
        }
    }

    pub fn leak() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    /// Ranges currently backed by frames.
    pub fn mapped_range_count(&self) -> usize {
        self.backing.lock().len()
    }

    /// The special mapping installed at `base`, if any.
    pub fn special_mapping(&self, base: VirtualAddress) -> Option<(PhysicalRange, MapType)> {
        self.special.lock().get(&base.value()).copied()
    }
}

impl AddressSpaceMapper for TestMapper {
    fn map_range_and_back_with_frames(
        &self,
        range: VirtualRange,
        _map_type: MapType,
        frames: &FrameAllocator,
    ) -> Result<(), MapError> {
        assert!(range.base().is_aligned_to(PAGE_SIZE) && range.len() % PAGE_SIZE == 0);
        let mut taken = Vec::new();
        for _ in 0..range.len() / PAGE_SIZE {
            match frames.allocate() {
                Ok(frame) => taken.push(frame),
                Err(_) => {
                    for frame in taken {
                        frames.deallocate_one(frame);
                    }
                    return Err(MapError::FramesExhausted);
                }
            }
        }
        let previous = self.backing.lock().insert(range.base().value(), taken);
        assert!(previous.is_none(), "double map of {range:?}");
        Ok(())
    }

    fn map_range_to_physical_range(
        &self,
        range: VirtualRange,
        physical: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError> {
        let previous = self
            .special
            .lock()
            .insert(range.base().value(), (physical, map_type));
        if previous.is_some() {
            return Err(MapError::AlreadyMapped);
        }
        Ok(())
    }

    fn unmap(
        &self,
        batch: &FlushBatch,
        backing: BackingDecision,
        _top_level: TopLevelDecision,
        frames: &FrameAllocator,
    ) {
        for range in batch.ranges() {
            if let Some(taken) = self.backing.lock().remove(&range.base().value()) {
                if backing == BackingDecision::FreeBacking {
                    let mut list = FrameList::new();
                    for frame in taken {
                        list.push(frame, frames.records());
                    }
                    frames.deallocate(list);
                }
                continue;
            }
            let removed = self.special.lock().remove(&range.base().value());
            assert!(removed.is_some(), "unmap of unmapped {range:?}");
        }
    }

    fn change_protection(&self, _batch: &FlushBatch, _map_type: MapType) -> Result<(), MapError> {
        Ok(())
    }
}
