//! Bring-up orchestration.
//!
//! [`KernelMemory`] bundles every allocator layer behind once-initialized
//! fields and runs the fixed initialization order: store the region list →
//! populate the frame allocator (consuming the bootstrap allocator) → init
//! the metadata caches → init the heap stack → init the special heap →
//! seed the kernel-address-space arena.
//!
//! The embedder owns the value (a `static` in a kernel, a leaked box in
//! tests), builds the layout and page tables first with
//! [`build_layout`](crate::layout::build_layout) and the
//! [`BootstrapFrameAllocator`], then calls [`KernelMemory::init`] exactly
//! once with every external collaborator passed explicitly.

use spin::Once;

use crate::arena::{AddSpanError, Arena, ArenaInitError, ArenaOptions};
use crate::frame::{BootstrapFrameAllocator, FrameAllocator, FrameRecord};
use crate::heap::{HeapAllocator, HeapInitError, HeapStack, HeapStackConfig, SpecialHeap};
use crate::layout::{RegionList, RegionType};
use crate::mem::map::MemoryMapEntry;
use crate::mem::mapping::{AddressSpaceMapper, DirectMapping, FlushBus};
use crate::mem::PAGE_SIZE;
use crate::slab::MetadataCaches;

/// Errors from [`KernelMemory::init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootError {
    /// The region list lacks a region the sequence needs.
    MissingRegion(RegionType),
    Heap(HeapInitError),
    Arena(ArenaInitError),
    Span(AddSpanError),
}

impl core::fmt::Display for BootError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MissingRegion(kind) => write!(f, "layout is missing the {kind:?} region"),
            Self::Heap(error) => write!(f, "heap bring-up failed: {error}"),
            Self::Arena(error) => write!(f, "arena bring-up failed: {error}"),
            Self::Span(error) => write!(f, "span installation failed: {error}"),
        }
    }
}

impl core::error::Error for BootError {}

/// Everything [`KernelMemory::init`] needs, passed explicitly.
pub struct BootConfig<'a> {
    pub memory_map: &'a [MemoryMapEntry],
    /// The boot-time allocator; its watermark decides which frames the
    /// runtime allocator receives.
    pub bootstrap: BootstrapFrameAllocator<'a>,
    /// The built region list, already used to construct the page tables.
    pub regions: RegionList,
    /// The mapped Pages region as a frame-record slice.
    pub frame_records: &'static [FrameRecord],
    pub direct_map: &'static dyn DirectMapping,
    pub mapper: &'static dyn AddressSpaceMapper,
    pub flush: &'static dyn FlushBus,
    /// Byte pattern for freshly allocated frames, if any.
    pub frame_debug_pattern: Option<u8>,
}

/// The kernel memory subsystem, brought up in one fixed sequence.
pub struct KernelMemory {
    regions: Once<RegionList>,
    frames: Once<FrameAllocator>,
    metadata: Once<MetadataCaches>,
    heap_stack: HeapStack,
    heap_allocator: Once<HeapAllocator>,
    special: Once<SpecialHeap>,
    kernel_address_space: Once<Arena>,
}

impl KernelMemory {
    pub const fn new() -> Self {
        Self {
            regions: Once::new(),
            frames: Once::new(),
            metadata: Once::new(),
            heap_stack: HeapStack::new(),
            heap_allocator: Once::new(),
            special: Once::new(),
            kernel_address_space: Once::new(),
        }
    }

    /// Runs the bring-up sequence.
    ///
    /// # Panics
    ///
    /// Panics on double initialization.
    pub fn init(&'static self, config: BootConfig<'_>) -> Result<(), BootError> {
        assert!(self.frames.get().is_none(), "kernel memory initialized twice");
        let regions = self.regions.call_once(|| config.regions);

        let frames = self.frames.call_once(|| {
            FrameAllocator::new(config.frame_records, config.direct_map, config.frame_debug_pattern)
        });
        frames.populate(config.memory_map, config.bootstrap);

        let metadata = self.metadata.call_once(|| MetadataCaches::new(frames));

        let heap_region = regions
            .find_by_type(RegionType::KernelHeap)
            .ok_or(BootError::MissingRegion(RegionType::KernelHeap))?
            .range;
        self.heap_stack
            .init(HeapStackConfig {
                heap_region,
                metadata,
                frames,
                mapper: config.mapper,
                flush: config.flush,
            })
            .map_err(BootError::Heap)?;
        self.heap_allocator
            .call_once(|| HeapAllocator::new(self.heap_stack.heap()));

        let special_region = regions
            .find_by_type(RegionType::SpecialHeap)
            .ok_or(BootError::MissingRegion(RegionType::SpecialHeap))?
            .range;
        let special = SpecialHeap::new(
            special_region,
            metadata,
            config.mapper,
            config.flush,
            frames,
        )
        .map_err(BootError::Heap)?;
        self.special.call_once(|| special);

        let address_space_region = regions
            .find_by_type(RegionType::KernelAddressSpace)
            .ok_or(BootError::MissingRegion(RegionType::KernelAddressSpace))?
            .range;
        let kernel_address_space = Arena::new(
            "kernel-address-space",
            PAGE_SIZE,
            metadata,
            ArenaOptions::default(),
        )
        .map_err(BootError::Arena)?;
        kernel_address_space
            .add_span(address_space_region.base().value(), address_space_region.len())
            .map_err(BootError::Span)?;
        self.kernel_address_space.call_once(|| kernel_address_space);

        log::info!("kernel memory subsystem online");
        Ok(())
    }

    pub fn regions(&self) -> &RegionList {
        self.regions.get().expect("kernel memory not initialized")
    }

    pub fn frames(&self) -> &FrameAllocator {
        self.frames.get().expect("kernel memory not initialized")
    }

    pub fn metadata(&self) -> &MetadataCaches {
        self.metadata.get().expect("kernel memory not initialized")
    }

    /// The byte-granular heap arena.
    pub fn heap(&self) -> &Arena {
        self.heap_stack.heap()
    }

    /// The page-granular heap arena, the usual slab-cache backing.
    pub fn heap_pages(&self) -> &Arena {
        self.heap_stack.pages()
    }

    /// The bottom heap arena managing raw heap address space.
    pub fn heap_address_space(&self) -> &Arena {
        self.heap_stack.address_space()
    }

    pub fn heap_allocator(&self) -> &HeapAllocator {
        self.heap_allocator.get().expect("kernel memory not initialized")
    }

    pub fn special_heap(&self) -> &SpecialHeap {
        self.special.get().expect("kernel memory not initialized")
    }

    pub fn kernel_address_space(&self) -> &Arena {
        self.kernel_address_space.get().expect("kernel memory not initialized")
    }
}

impl Default for KernelMemory {
    fn default() -> Self {
        Self::new()
    }
}
