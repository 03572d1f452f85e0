//! The kernel heap: three stacked arenas plus allocation façades.
//!
//! ```text
//! heap (quantum 16, quantum caches through 512 B)
//!   ← heap-pages (quantum = page, source maps imported spans with frames)
//!     ← heap-address-space (quantum = page, seeded with the KernelHeap
//!       region)
//! ```
//!
//! The middle layer's [`MappedPageSource`] is where virtual space meets
//! physical backing: importing a span allocates address space below and maps
//! it with freshly allocated frames; releasing unmaps, frees the backing and
//! submits the TLB shootdown. Everything above it hands out already-mapped
//! bytes.


use core::ptr::NonNull;

use spin::{Mutex, Once};
use static_assertions::const_assert_eq;

use crate::arena::{
    Allocation, AllocateError, AllocationPolicy, Arena, ArenaInitError, ArenaOptions,
    AddSpanError, QuantumCacheConfig, QuantumCacheStorage, SpanSource,
};
use crate::frame::FrameAllocator;
use crate::mem::mapping::{
    AddressSpaceMapper, BackingDecision, DirectMapping, FlushBatch, FlushBus, FlushRequest,
    FlushTarget, MapError, MapType, TopLevelDecision,
};
use crate::mem::{PhysicalRange, VirtualAddress, VirtualRange, PAGE_SIZE};
use crate::slab::MetadataCaches;

/// Quantum of the byte-granular heap arena.
pub const HEAP_QUANTUM: usize = 16;

/// Quantum caches on the heap arena: 32 caches of 16 B steps cover
/// allocations through 512 bytes.
pub const HEAP_QUANTUM_CACHE_COUNT: usize = 32;

/// Errors from heap bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapInitError {
    Arena(ArenaInitError),
    Span(AddSpanError),
}

impl core::fmt::Display for HeapInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Arena(error) => write!(f, "heap arena creation failed: {error}"),
            Self::Span(error) => write!(f, "heap span installation failed: {error}"),
        }
    }
}

impl core::error::Error for HeapInitError {}

/// A [`SpanSource`] that backs imported address space with frames.
pub struct MappedPageSource {
    address_space: &'static Arena,
    mapper: &'static dyn AddressSpaceMapper,
    flush: &'static dyn FlushBus,
    frames: &'static FrameAllocator,
}

impl SpanSource for MappedPageSource {
    fn import(&self, len: usize, policy: AllocationPolicy) -> Result<Allocation, AllocateError> {
        let allocation = self.address_space.allocate(len, policy)?;
        let range = VirtualRange::new(VirtualAddress::new(allocation.base), allocation.len);
        match self
            .mapper
            .map_range_and_back_with_frames(range, MapType::KernelReadWrite, self.frames)
        {
            Ok(()) => Ok(allocation),
            Err(error) => {
                log::warn!("heap page import failed to map {range:?}: {error}");
                self.address_space.deallocate(allocation);
                Err(AllocateError::RequestedLengthUnavailable)
            }
        }
    }

    fn release(&self, allocation: Allocation) {
        let range = VirtualRange::new(VirtualAddress::new(allocation.base), allocation.len);
        let mut batch = FlushBatch::new();
        batch.push(range).expect("a fresh batch holds one range");
        self.mapper.unmap(
            &batch,
            BackingDecision::FreeBacking,
            TopLevelDecision::KeepTopLevel,
            self.frames,
        );
        self.flush.submit_and_wait(FlushRequest {
            batch,
            target: FlushTarget::Kernel,
        });
        self.address_space.deallocate(allocation);
    }
}

/// Dependencies for [`HeapStack::init`].
#[derive(Clone, Copy)]
pub struct HeapStackConfig {
    /// The KernelHeap region from the layout.
    pub heap_region: VirtualRange,
    pub metadata: &'static MetadataCaches,
    pub frames: &'static FrameAllocator,
    pub mapper: &'static dyn AddressSpaceMapper,
    pub flush: &'static dyn FlushBus,
}

/// The three stacked heap arenas, once-initialized in place so the layers
/// can reference each other from a single embedder-owned value.
pub struct HeapStack {
    address_space: Once<Arena>,
    page_source: Once<MappedPageSource>,
    pages: Once<Arena>,
    heap: Once<Arena>,
}

impl HeapStack {
    pub const fn new() -> Self {
        Self {
            address_space: Once::new(),
            page_source: Once::new(),
            pages: Once::new(),
            heap: Once::new(),
        }
    }

    /// Brings the stack up bottom to top.
    ///
    /// # Panics
    ///
    /// Panics on double initialization.
    pub fn init(&'static self, config: HeapStackConfig) -> Result<(), HeapInitError> {
        assert!(self.heap.get().is_none(), "heap stack initialized twice");

        let address_space = Arena::new(
            "heap-address-space",
            PAGE_SIZE,
            config.metadata,
            ArenaOptions::default(),
        )
        .map_err(HeapInitError::Arena)?;
        address_space
            .add_span(config.heap_region.base().value(), config.heap_region.len())
            .map_err(HeapInitError::Span)?;
        let address_space = self.address_space.call_once(|| address_space);

        let page_source = self.page_source.call_once(|| MappedPageSource {
            address_space,
            mapper: config.mapper,
            flush: config.flush,
            frames: config.frames,
        });

        let pages = Arena::new(
            "heap-pages",
            PAGE_SIZE,
            config.metadata,
            ArenaOptions {
                source: Some(page_source),
                quantum_caches: None,
            },
        )
        .map_err(HeapInitError::Arena)?;
        let pages = self.pages.call_once(|| pages);

        let heap = Arena::new(
            "heap",
            HEAP_QUANTUM,
            config.metadata,
            ArenaOptions {
                source: Some(pages),
                quantum_caches: Some(QuantumCacheConfig {
                    count: HEAP_QUANTUM_CACHE_COUNT,
                    // The heap cannot allocate its own cache blocks from
                    // itself; they are packed straight into frames.
                    storage: QuantumCacheStorage::Heap(config.frames),
                    slab_backing: pages,
                }),
            },
        )
        .map_err(HeapInitError::Arena)?;
        self.heap.call_once(|| heap);

        log::info!(
            "heap online over {:#x}..{:#x}",
            config.heap_region.base().value(),
            config.heap_region.end().value()
        );
        Ok(())
    }

    pub fn heap(&self) -> &Arena {
        self.heap.get().expect("heap stack not initialized")
    }

    pub fn pages(&self) -> &Arena {
        self.pages.get().expect("heap stack not initialized")
    }

    pub fn address_space(&self) -> &Arena {
        self.address_space.get().expect("heap stack not initialized")
    }

    /// Tears the stack down top to bottom. Test support; a kernel never
    /// does this.
    pub fn deinit(&self) {
        self.heap().deinit();
        self.pages().deinit();
        self.address_space().deinit();
    }
}

/// Header prefixed to every general-allocator allocation so `free` can
/// recover the arena bookkeeping without a size argument.
#[repr(C)]
struct AllocationHeader {
    base: usize,
    len: usize,
}

// The header doubles as the allocation's alignment padding; it must be
// exactly one heap quantum so returned pointers stay quantum-aligned.
const_assert_eq!(core::mem::size_of::<AllocationHeader>(), HEAP_QUANTUM);

/// The kernel's size-less general allocator over the heap arena.
#[derive(Clone, Copy)]
pub struct HeapAllocator {
    heap: &'static Arena,
}

impl HeapAllocator {
    pub fn new(heap: &'static Arena) -> Self {
        Self { heap }
    }

    /// Allocates `len` bytes, aligned to the heap quantum.
    pub fn allocate(&self, len: usize) -> Result<NonNull<u8>, AllocateError> {
        let total = len
            .checked_add(core::mem::size_of::<AllocationHeader>())
            .ok_or(AllocateError::RequestedLengthUnavailable)?;
        let allocation = self.heap.allocate(total, AllocationPolicy::InstantFit)?;

        let header = allocation.base as *mut AllocationHeader;
        // SAFETY: the heap returned an exclusive mapped range at least
        // header-sized; the base is quantum-aligned.
        unsafe {
            header.write(AllocationHeader {
                base: allocation.base,
                len: allocation.len,
            });
            Ok(NonNull::new_unchecked(
                (allocation.base as *mut u8).add(core::mem::size_of::<AllocationHeader>()),
            ))
        }
    }

    /// Frees an allocation by pointer alone.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator
    /// and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let header = ptr
            .as_ptr()
            .sub(core::mem::size_of::<AllocationHeader>())
            .cast::<AllocationHeader>();
        let header = header.read();
        debug_assert_eq!(header.base + core::mem::size_of::<AllocationHeader>(), ptr.as_ptr() as usize);
        self.heap.deallocate(Allocation {
            base: header.base,
            len: header.len,
        });
    }
}

/// Errors from [`SpecialHeap::allocate_special`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialAllocateError {
    /// No virtual space left in the special-heap region.
    Unavailable(AllocateError),
    /// The mapping collaborator rejected the request.
    Map(MapError),
}

impl core::fmt::Display for SpecialAllocateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unavailable(error) => write!(f, "special heap exhausted: {error}"),
            Self::Map(error) => write!(f, "special heap mapping failed: {error}"),
        }
    }
}

impl core::error::Error for SpecialAllocateError {}

/// Virtual space for mapping caller-supplied physical ranges (MMIO).
pub struct SpecialHeap {
    address_space: Arena,
    mapper: &'static dyn AddressSpaceMapper,
    flush: &'static dyn FlushBus,
    frames: &'static FrameAllocator,
    /// Serializes the map/unmap calls against the shared page table.
    map_lock: Mutex<()>,
}

impl SpecialHeap {
    pub fn new(
        region: VirtualRange,
        metadata: &'static MetadataCaches,
        mapper: &'static dyn AddressSpaceMapper,
        flush: &'static dyn FlushBus,
        frames: &'static FrameAllocator,
    ) -> Result<Self, HeapInitError> {
        let address_space = Arena::new(
            "special-heap-address-space",
            PAGE_SIZE,
            metadata,
            ArenaOptions::default(),
        )
        .map_err(HeapInitError::Arena)?;
        address_space
            .add_span(region.base().value(), region.len())
            .map_err(HeapInitError::Span)?;
        Ok(Self {
            address_space,
            mapper,
            flush,
            frames,
            map_lock: Mutex::new(()),
        })
    }

    /// Allocates virtual space and maps it onto `physical`.
    ///
    /// `physical.len()` must equal `size` rounded up to the page size.
    pub fn allocate_special(
        &self,
        size: usize,
        physical: PhysicalRange,
        map_type: MapType,
    ) -> Result<VirtualRange, SpecialAllocateError> {
        let allocation = self
            .address_space
            .allocate(size, AllocationPolicy::InstantFit)
            .map_err(SpecialAllocateError::Unavailable)?;
        assert_eq!(
            allocation.len,
            physical.len(),
            "special mapping must cover whole pages of the physical range"
        );
        let range = VirtualRange::new(VirtualAddress::new(allocation.base), allocation.len);

        let result = {
            let _guard = self.map_lock.lock();
            self.mapper.map_range_to_physical_range(range, physical, map_type)
        };
        match result {
            Ok(()) => Ok(range),
            Err(error) => {
                self.address_space.deallocate(allocation);
                Err(SpecialAllocateError::Map(error))
            }
        }
    }

    /// Unmaps and frees a range returned by
    /// [`allocate_special`](Self::allocate_special). The caller keeps
    /// ownership of the physical range.
    pub fn free_special(&self, range: VirtualRange) {
        let mut batch = FlushBatch::new();
        batch.push(range).expect("a fresh batch holds one range");
        {
            let _guard = self.map_lock.lock();
            self.mapper.unmap(
                &batch,
                BackingDecision::KeepBacking,
                TopLevelDecision::KeepTopLevel,
                self.frames,
            );
        }
        self.flush.submit_and_wait(FlushRequest {
            batch,
            target: FlushTarget::Kernel,
        });
        self.address_space.deallocate(Allocation {
            base: range.base().value(),
            len: range.len(),
        });
    }

    pub fn address_space(&self) -> &Arena {
        &self.address_space
    }

    /// The direct mapping shared with the frame allocator, handy for
    /// callers that mix MMIO and direct-map access.
    pub fn direct_map(&self) -> &'static dyn DirectMapping {
        self.frames.direct_map()
    }
}
