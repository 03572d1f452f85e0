//! Shared fixture for the integration suites.
//!
//! "Physical memory" is a leaked page-aligned host buffer; physical
//! addresses are offsets into it and the direct map adds the buffer base.
//! The mapper stand-in allocates and returns real backing frames but never
//! touches page tables; the "virtual" regions handed to the heap are
//! themselves host buffers, so heap pointers dereference directly.

#![allow(dead_code)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::Mutex;

use strata::boot::{BootConfig, KernelMemory};
use strata::frame::{BootstrapFrameAllocator, FrameAllocator, FrameIndex, FrameRecord};
use strata::layout::{Region, RegionList, RegionType};
use strata::mem::map::{MemoryMapEntry, MemoryMapEntryKind};
use strata::mem::mapping::{
    AddressSpaceMapper, BackingDecision, FlushBatch, FlushBus, FlushRequest,
    MapError, MapType, OffsetDirectMap, TopLevelDecision,
};
use strata::mem::{PhysicalAddress, PhysicalRange, VirtualAddress, VirtualRange, PAGE_SIZE};
use strata::MetadataCaches;

/// Leaks a page-aligned, zeroed host buffer and returns its address range.
pub fn leak_buffer(bytes: usize) -> VirtualRange {
    assert!(bytes > 0 && bytes % PAGE_SIZE == 0);
    let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    let pointer = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!pointer.is_null());
    VirtualRange::new(VirtualAddress::from_ptr(pointer), bytes)
}

/// A populated frame allocator over a fresh host-backed pool.
pub fn frame_pool(bytes: usize) -> &'static FrameAllocator {
    let (frames, _map) = frame_pool_with_map(bytes, 0);
    frames
}

/// Like [`frame_pool`], taking `bootstrap_take` frames through the
/// bootstrap allocator first. Returns the memory map as well.
pub fn frame_pool_with_map(
    bytes: usize,
    bootstrap_take: usize,
) -> (&'static FrameAllocator, &'static [MemoryMapEntry]) {
    let backing = leak_buffer(bytes);
    let direct_map: &'static OffsetDirectMap =
        Box::leak(Box::new(OffsetDirectMap::new(backing, backing.base())));
    let map: &'static [MemoryMapEntry] = Box::leak(Box::new([MemoryMapEntry::new(
        PhysicalRange::new(PhysicalAddress::new(0), bytes),
        MemoryMapEntryKind::Free,
    )]));
    let records: &'static [FrameRecord] = Box::leak(
        (0..bytes / PAGE_SIZE)
            .map(|_| FrameRecord::new())
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );

    let mut bootstrap = BootstrapFrameAllocator::new(map);
    for _ in 0..bootstrap_take {
        bootstrap.allocate().unwrap();
    }

    let frames: &'static FrameAllocator =
        Box::leak(Box::new(FrameAllocator::new(records, direct_map, None)));
    frames.populate(map, bootstrap);
    (frames, map)
}

/// Metadata caches over a fresh pool.
pub fn metadata_over_pool(bytes: usize) -> (&'static MetadataCaches, &'static FrameAllocator) {
    let frames = frame_pool(bytes);
    let metadata: &'static MetadataCaches = Box::leak(Box::new(MetadataCaches::new(frames)));
    (metadata, frames)
}

/// A flush bus for a single-executor test world.
pub struct ImmediateFlush;

impl FlushBus for ImmediateFlush {
    fn submit_and_wait(&self, _request: FlushRequest) {}
}

pub static IMMEDIATE_FLUSH: ImmediateFlush = ImmediateFlush;

/// A mapper over already-resident host memory: mapping allocates and
/// records backing frames, unmapping returns them one by one.
pub struct RecordingMapper {
    backing: Mutex<HashMap<usize, Vec<FrameIndex>>>,
    special: Mutex<HashMap<usize, (PhysicalRange, MapType)>>,
}

impl RecordingMapper {
    pub fn leak() -> &'static Self {
        Box::leak(Box::new(Self {
            backing: Mutex::new(HashMap::new()),
            special: Mutex::new(HashMap::new()),
        }))
    }

    pub fn mapped_range_count(&self) -> usize {
        self.backing.lock().unwrap().len()
    }

    pub fn special_mapping(&self, base: VirtualAddress) -> Option<(PhysicalRange, MapType)> {
        self.special.lock().unwrap().get(&base.value()).copied()
    }
}

impl AddressSpaceMapper for RecordingMapper {
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
        let previous = self.backing.lock().unwrap().insert(range.base().value(), taken);
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
            .unwrap()
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
            if let Some(taken) = self.backing.lock().unwrap().remove(&range.base().value()) {
                if backing == BackingDecision::FreeBacking {
                    for frame in taken {
                        frames.deallocate_one(frame);
                    }
                }
                continue;
            }
            let removed = self.special.lock().unwrap().remove(&range.base().value());
            assert!(removed.is_some(), "unmap of unmapped {range:?}");
        }
    }

    fn change_protection(&self, _batch: &FlushBatch, _map_type: MapType) -> Result<(), MapError> {
        Ok(())
    }
}

/// A fully brought-up kernel memory subsystem over host buffers.
pub struct Platform {
    pub memory: &'static KernelMemory,
    pub mapper: &'static RecordingMapper,
    pub direct_map: &'static OffsetDirectMap,
    pub pool_bytes: usize,
}

/// Runs the whole bring-up sequence the way an embedding kernel would.
pub fn bring_up(pool_bytes: usize, heap_bytes: usize) -> Platform {
    let backing = leak_buffer(pool_bytes);
    let direct_map: &'static OffsetDirectMap =
        Box::leak(Box::new(OffsetDirectMap::new(backing, backing.base())));
    let map: &'static [MemoryMapEntry] = Box::leak(Box::new([MemoryMapEntry::new(
        PhysicalRange::new(PhysicalAddress::new(0), pool_bytes),
        MemoryMapEntryKind::Free,
    )]));
    let records: &'static [FrameRecord] = Box::leak(
        (0..pool_bytes / PAGE_SIZE)
            .map(|_| FrameRecord::new())
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );

    // The regions that matter are real host buffers so heap pointers are
    // dereferenceable; the kernel-address-space region is only ever used
    // as abstract integers.
    let heap_region = leak_buffer(heap_bytes);
    let special_region = leak_buffer(4 * PAGE_SIZE);
    let address_space_region = leak_buffer(4 * PAGE_SIZE);

    let mut regions = RegionList::new();
    regions
        .insert(Region { range: heap_region, kind: RegionType::KernelHeap })
        .unwrap();
    regions
        .insert(Region { range: special_region, kind: RegionType::SpecialHeap })
        .unwrap();
    regions
        .insert(Region { range: address_space_region, kind: RegionType::KernelAddressSpace })
        .unwrap();

    // A page-table build would take a few bootstrap frames first.
    let mut bootstrap = BootstrapFrameAllocator::new(map);
    for _ in 0..2 {
        bootstrap.allocate().unwrap();
    }

    let mapper = RecordingMapper::leak();
    let memory: &'static KernelMemory = Box::leak(Box::new(KernelMemory::new()));
    memory
        .init(BootConfig {
            memory_map: map,
            bootstrap,
            regions,
            frame_records: records,
            direct_map,
            mapper,
            flush: &IMMEDIATE_FLUSH,
            frame_debug_pattern: None,
        })
        .unwrap();

    Platform { memory, mapper, direct_map, pool_bytes }
}
