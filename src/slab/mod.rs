//! Typed, constructor-aware slab caches.
//!
//! A [`RawCache`] recycles fixed-size objects. Small objects pack into one
//! page per slab with the control block at the page tail (see [`small`]);
//! large objects live in one arena allocation per slab with externally
//! cached bookkeeping (see [`large`]). Constructors run once per slot when
//! a slab is created and destructors once when it is destroyed, so the
//! allocate/deallocate hot path hands out pre-constructed objects.
//!
//! Slabs come from a [`SlabSource`]: `Heap` draws mapped pages from the
//! heap's page arena, `Pmm` takes single frames straight from the frame
//! allocator through the direct map. The `Pmm` path exists so the caches
//! the arena and heap machinery itself depends on (boundary tags,
//! large-slab headers, large-item descriptors, bundled in
//! [`MetadataCaches`]) never allocate through the layers they implement.
//!
//! Lock order: a cache's slab-allocation lock is taken outside its primary
//! lock; slab sources (arenas, metadata caches, the frame allocator) are
//! only entered while at most those cache locks are held, never the other
//! way around. Constructors and destructors must not re-enter the cache.

pub(crate) mod large;
pub(crate) mod small;


use core::mem::MaybeUninit;
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::const_assert;

use crate::arena::{Allocation, AllocationPolicy, Arena};
use crate::frame::FrameAllocator;
use crate::mem::{align_down, align_up, PAGE_SIZE};

use large::{LargeItem, LargeLookup, LargeSlab, LargeSlabList};
use small::{SmallSlab, SmallSlabList};

/// Error raised by an item constructor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemConstructionFailed;

impl core::fmt::Display for ItemConstructionFailed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("item constructor failed")
    }
}

impl core::error::Error for ItemConstructionFailed {}

/// Errors from cache allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheAllocateError {
    /// The backing source (heap arena or frame allocator) declined.
    SlabAllocationFailed,
    /// The constructor rejected an item while building a new slab.
    ItemConstructionFailed,
    /// A large-item descriptor could not be allocated.
    LargeItemAllocationFailed,
}

impl core::fmt::Display for CacheAllocateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SlabAllocationFailed => f.write_str("slab allocation failed"),
            Self::ItemConstructionFailed => f.write_str("item constructor failed"),
            Self::LargeItemAllocationFailed => f.write_str("large-item descriptor allocation failed"),
        }
    }
}

impl core::error::Error for CacheAllocateError {}

/// Errors from cache construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheConfigError {
    ZeroItemSize,
    /// Alignment must be a power of two no larger than a page.
    InvalidAlignment,
    /// `Pmm`-sourced caches must stay in the small class.
    PmmSourceRequiresSmallItems,
}

impl core::fmt::Display for CacheConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ZeroItemSize => f.write_str("item size is zero"),
            Self::InvalidAlignment => f.write_str("invalid item alignment"),
            Self::PmmSourceRequiresSmallItems => {
                f.write_str("frame-sourced caches are limited to small items")
            }
        }
    }
}

impl core::error::Error for CacheConfigError {}

/// Runs once per slot when a slab is created. Receives an exclusive,
/// aligned, item-sized slot and must leave it fully constructed on `Ok`.
pub type Constructor = fn(NonNull<u8>) -> Result<(), ItemConstructionFailed>;

/// Runs once per slot when a slab is destroyed.
pub type Destructor = fn(NonNull<u8>);

/// What to do when the last item of a slab is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastSlabPolicy {
    /// Retain the slab if it is the only available one.
    Keep,
    /// Always return empty slabs to the source.
    Free,
}

/// Where a cache's slabs come from.
#[derive(Clone, Copy)]
pub enum SlabSource {
    /// Mapped pages from the heap's page-granular arena. Required for
    /// large-class caches.
    Heap {
        pages: &'static Arena,
        metadata: &'static MetadataCaches,
    },
    /// Single frames from the frame allocator, addressed through its direct
    /// mapping. Small-class caches only; used by the caches that implement
    /// the arena/heap machinery itself.
    Pmm(&'static FrameAllocator),
}

/// Construction parameters for [`RawCache::new`].
#[derive(Clone, Copy)]
pub struct RawCacheConfig {
    pub name: &'static str,
    pub item_size: usize,
    pub alignment: usize,
    pub constructor: Option<Constructor>,
    pub destructor: Option<Destructor>,
    pub last_slab: LastSlabPolicy,
    pub source: SlabSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SizeClass {
    Small,
    Large,
}

enum CacheClass {
    Small {
        available: SmallSlabList,
        full: SmallSlabList,
    },
    Large {
        available: LargeSlabList,
        full: LargeSlabList,
        lookup: LargeLookup,
    },
}

struct CacheState {
    class: CacheClass,
}

// SAFETY: CacheState's raw pointers reference slabs and descriptors owned
// by this cache and touched only under its primary mutex.
unsafe impl Send for CacheState {}

enum NewSlab {
    Small(NonNull<SmallSlab>),
    Large(NonNull<LargeSlab>),
}

/// An untyped slab cache.
pub struct RawCache {
    name: &'static str,
    item_size: usize,
    effective_item_size: usize,
    items_per_slab: usize,
    size_class: SizeClass,
    constructor: Option<Constructor>,
    destructor: Option<Destructor>,
    last_slab: LastSlabPolicy,
    source: SlabSource,
    state: Mutex<CacheState>,
    /// Serializes slab allocation so concurrent misses produce one slab.
    slab_alloc_lock: Mutex<()>,
}

impl RawCache {
    pub fn new(config: RawCacheConfig) -> Result<Self, CacheConfigError> {
        if config.item_size == 0 {
            return Err(CacheConfigError::ZeroItemSize);
        }
        if !config.alignment.is_power_of_two() || config.alignment > PAGE_SIZE {
            return Err(CacheConfigError::InvalidAlignment);
        }

        let small_effective = small::effective_size(config.item_size, config.alignment);
        let (size_class, effective_item_size, items_per_slab, class) =
            if small::fits_small_class(small_effective) {
                let items = small::items_per_slab(small_effective);
                let class = CacheClass::Small {
                    available: SmallSlabList::new(),
                    full: SmallSlabList::new(),
                };
                (SizeClass::Small, small_effective, items, class)
            } else {
                if matches!(config.source, SlabSource::Pmm(_)) {
                    return Err(CacheConfigError::PmmSourceRequiresSmallItems);
                }
                let effective = align_up(config.item_size, config.alignment);
                let items = large::items_per_slab(effective);
                let class = CacheClass::Large {
                    available: LargeSlabList::new(),
                    full: LargeSlabList::new(),
                    lookup: LargeLookup::new(),
                };
                (SizeClass::Large, effective, items, class)
            };

        log::debug!(
            "cache '{}' created: {} x {} byte items per {:?} slab",
            config.name,
            items_per_slab,
            config.item_size,
            size_class,
        );

        Ok(Self {
            name: config.name,
            item_size: config.item_size,
            effective_item_size,
            items_per_slab,
            size_class,
            constructor: config.constructor,
            destructor: config.destructor,
            last_slab: config.last_slab,
            source: config.source,
            state: Mutex::new(CacheState { class }),
            slab_alloc_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn effective_item_size(&self) -> usize {
        self.effective_item_size
    }

    pub fn items_per_slab(&self) -> usize {
        self.items_per_slab
    }

    /// Allocates one item per `out` slot; every slot is initialized on `Ok`.
    ///
    /// On failure nothing is handed out: items already taken are rolled
    /// back before the error is returned.
    pub fn allocate_many(
        &self,
        out: &mut [MaybeUninit<NonNull<u8>>],
    ) -> Result<(), CacheAllocateError> {
        if out.is_empty() {
            return Ok(());
        }

        let mut filled = 0usize;
        match self.fill(out, &mut filled) {
            Ok(()) => Ok(()),
            Err(error) => {
                for slot in &out[..filled] {
                    // SAFETY: `fill` initialized the first `filled` slots.
                    let item = unsafe { slot.assume_init_read() };
                    self.deallocate(item);
                }
                Err(error)
            }
        }
    }

    fn fill(
        &self,
        out: &mut [MaybeUninit<NonNull<u8>>],
        filled: &mut usize,
    ) -> Result<(), CacheAllocateError> {
        let mut state = self.state.lock();
        loop {
            while *filled < out.len() {
                // SAFETY: primary lock held.
                let Some(item) = (unsafe { self.pop_item(&mut state) }) else {
                    break;
                };
                out[*filled].write(item);
                *filled += 1;
            }
            if *filled == out.len() {
                return Ok(());
            }

            // Out of available slabs. Take the slab-allocation lock with
            // the primary lock released, then double-check: a racing
            // allocator may already have installed a slab for us.
            drop(state);
            let _critical = self.slab_alloc_lock.lock();
            state = self.state.lock();
            if !Self::has_available(&state) {
                drop(state);
                let new_slab = self.allocate_slab()?;
                state = self.state.lock();
                // SAFETY: primary lock held; the slab is fresh.
                unsafe { Self::insert_new_slab(&mut state, new_slab) };
            }
        }
    }

    /// Returns items to their slabs.
    ///
    /// # Panics
    ///
    /// Panics if an item was not produced by this cache, a caller bug.
    pub fn deallocate_many(&self, items: &[NonNull<u8>]) {
        let mut state = self.state.lock();
        for &item in items {
            // SAFETY: primary lock held.
            unsafe { self.release_item(&mut state, item) };
        }
    }

    /// Allocates a single item.
    pub fn allocate(&self) -> Result<NonNull<u8>, CacheAllocateError> {
        let mut out = [MaybeUninit::uninit()];
        self.allocate_many(&mut out)?;
        // SAFETY: allocate_many initialized the slot.
        Ok(unsafe { out[0].assume_init() })
    }

    /// Returns a single item.
    pub fn deallocate(&self, item: NonNull<u8>) {
        self.deallocate_many(&[item]);
    }

    /// Tears the cache down, destroying remaining empty slabs.
    ///
    /// # Panics
    ///
    /// Panics if any item is still allocated.
    pub fn deinit(&self) {
        let mut state = self.state.lock();
        match &mut state.class {
            CacheClass::Small { available, full } => {
                assert!(
                    full.is_empty(),
                    "cache '{}' deinitialized with full slabs",
                    self.name
                );
                while let Some(slab) = available.front() {
                    // SAFETY: primary lock held; slab ownership moves to
                    // the destroy path.
                    unsafe {
                        assert_eq!(
                            slab.as_ref().allocated,
                            0,
                            "cache '{}' deinitialized with live items",
                            self.name
                        );
                        available.remove(slab);
                        self.destroy_small_slab(slab);
                    }
                }
            }
            CacheClass::Large { available, full, lookup } => {
                assert!(
                    full.is_empty(),
                    "cache '{}' deinitialized with full slabs",
                    self.name
                );
                assert!(
                    lookup.is_empty(),
                    "cache '{}' deinitialized with live items",
                    self.name
                );
                while let Some(slab) = available.front() {
                    // SAFETY: as above.
                    unsafe {
                        assert_eq!(
                            slab.as_ref().allocated,
                            0,
                            "cache '{}' deinitialized with live items",
                            self.name
                        );
                        available.remove(slab);
                        self.destroy_large_slab(slab);
                    }
                }
            }
        }
        log::debug!("cache '{}' deinitialized", self.name);
    }

    /// Available and full slab counts, for diagnostics and tests.
    pub fn slab_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        match &state.class {
            CacheClass::Small { available, full } => (available.len(), full.len()),
            CacheClass::Large { available, full, .. } => (available.len(), full.len()),
        }
    }

    fn has_available(state: &CacheState) -> bool {
        match &state.class {
            CacheClass::Small { available, .. } => !available.is_empty(),
            CacheClass::Large { available, .. } => !available.is_empty(),
        }
    }

    unsafe fn pop_item(&self, state: &mut CacheState) -> Option<NonNull<u8>> {
        match &mut state.class {
            CacheClass::Small { available, full } => {
                let slab_ptr = available.front()?;
                let slab = &mut *slab_ptr.as_ptr();
                let node = slab.free.expect("available small slab has a free item");
                slab.free = node.as_ref().next;
                slab.allocated += 1;
                if slab.allocated == self.items_per_slab {
                    available.remove(slab_ptr);
                    full.push_front(slab_ptr);
                }
                Some(small::item_from_node(node, self.item_size))
            }
            CacheClass::Large { available, full, lookup } => {
                let slab_ptr = available.front()?;
                let slab = &mut *slab_ptr.as_ptr();
                let mut item = slab.free.expect("available large slab has a free item");
                slab.free = item.as_ref().next;
                slab.allocated += 1;
                if slab.allocated == self.items_per_slab {
                    available.remove(slab_ptr);
                    full.push_front(slab_ptr);
                }
                item.as_mut().next = None;
                lookup.insert(item);
                Some(item.as_ref().object)
            }
        }
    }

    unsafe fn release_item(&self, state: &mut CacheState, item: NonNull<u8>) {
        match &mut state.class {
            CacheClass::Small { available, full } => {
                let slab_ptr = small::slab_from_item(item);
                assert_eq!(
                    slab_ptr.as_ref().this,
                    slab_ptr,
                    "cache '{}': free of pointer outside any slab",
                    self.name
                );
                let slab = &mut *slab_ptr.as_ptr();
                if slab.allocated == self.items_per_slab {
                    full.remove(slab_ptr);
                    available.push_front(slab_ptr);
                }
                let mut node = small::node_from_item(item, self.item_size);
                node.as_mut().next = slab.free;
                slab.free = Some(node);
                slab.allocated -= 1;
                if slab.allocated == 0
                    && (self.last_slab == LastSlabPolicy::Free || available.len() > 1)
                {
                    available.remove(slab_ptr);
                    self.destroy_small_slab(slab_ptr);
                }
            }
            CacheClass::Large { available, full, lookup } => {
                let descriptor = lookup.remove(item).unwrap_or_else(|| {
                    panic!("cache '{}': free of unknown object", self.name)
                });
                let slab_ptr = descriptor.as_ref().slab;
                let slab = &mut *slab_ptr.as_ptr();
                if slab.allocated == self.items_per_slab {
                    full.remove(slab_ptr);
                    available.push_front(slab_ptr);
                }
                let mut descriptor = descriptor;
                descriptor.as_mut().next = slab.free;
                slab.free = Some(descriptor);
                slab.allocated -= 1;
                if slab.allocated == 0
                    && (self.last_slab == LastSlabPolicy::Free || available.len() > 1)
                {
                    available.remove(slab_ptr);
                    self.destroy_large_slab(slab_ptr);
                }
            }
        }
    }

    unsafe fn insert_new_slab(state: &mut CacheState, new_slab: NewSlab) {
        match (&mut state.class, new_slab) {
            (CacheClass::Small { available, .. }, NewSlab::Small(slab)) => {
                available.push_front(slab);
            }
            (CacheClass::Large { available, .. }, NewSlab::Large(slab)) => {
                available.push_front(slab);
            }
            _ => unreachable!("slab class matches cache class"),
        }
    }

    fn allocate_slab(&self) -> Result<NewSlab, CacheAllocateError> {
        match self.size_class {
            SizeClass::Small => self.allocate_small_slab().map(NewSlab::Small),
            SizeClass::Large => self.allocate_large_slab().map(NewSlab::Large),
        }
    }

    fn allocate_small_slab(&self) -> Result<NonNull<SmallSlab>, CacheAllocateError> {
        let page = self.allocate_page()?;

        if let Some(constructor) = self.constructor {
            for index in 0..self.items_per_slab {
                // SAFETY: the page is exclusively owned and each slot stays
                // inside it.
                let item = unsafe {
                    NonNull::new_unchecked(page.as_ptr().add(index * self.effective_item_size))
                };
                if constructor(item).is_err() {
                    if let Some(destructor) = self.destructor {
                        for constructed in 0..index {
                            let item = unsafe {
                                NonNull::new_unchecked(
                                    page.as_ptr().add(constructed * self.effective_item_size),
                                )
                            };
                            destructor(item);
                        }
                    }
                    self.free_page(page);
                    return Err(CacheAllocateError::ItemConstructionFailed);
                }
            }
        }

        // SAFETY: page exclusively owned, layout parameters computed for it.
        let slab = unsafe {
            small::format_page(page, self.item_size, self.effective_item_size, self.items_per_slab)
        };
        log::trace!("cache '{}': new small slab at {:p}", self.name, page.as_ptr());
        Ok(slab)
    }

    fn allocate_large_slab(&self) -> Result<NonNull<LargeSlab>, CacheAllocateError> {
        let SlabSource::Heap { pages, metadata } = self.source else {
            unreachable!("large caches are rejected for Pmm sources at construction");
        };

        let backing = pages
            .allocate(self.items_per_slab * self.effective_item_size, AllocationPolicy::InstantFit)
            .map_err(|_| CacheAllocateError::SlabAllocationFailed)?;
        let mut slab = match metadata.allocate_slab_header() {
            Ok(slab) => slab,
            Err(_) => {
                pages.deallocate(backing);
                return Err(CacheAllocateError::SlabAllocationFailed);
            }
        };

        // SAFETY: fresh control block, exclusively owned.
        unsafe {
            *slab.as_mut() = LargeSlab {
                prev: None,
                next: None,
                free: None,
                allocated: 0,
                backing,
            };
        }

        for index in 0..self.items_per_slab {
            let object = NonNull::new((backing.base + index * self.effective_item_size) as *mut u8)
                .expect("arena allocations are never at null");

            let mut descriptor = match metadata.allocate_large_item() {
                Ok(descriptor) => descriptor,
                Err(_) => {
                    // SAFETY: slab is private to this call.
                    unsafe { self.release_large_slab(slab) };
                    return Err(CacheAllocateError::LargeItemAllocationFailed);
                }
            };

            if let Some(constructor) = self.constructor {
                if constructor(object).is_err() {
                    metadata.deallocate_large_item(descriptor);
                    // SAFETY: slab is private to this call; its free list
                    // holds only constructed items.
                    unsafe { self.release_large_slab(slab) };
                    return Err(CacheAllocateError::ItemConstructionFailed);
                }
            }

            // SAFETY: descriptor and slab are exclusively owned here.
            unsafe {
                let slab_mut = slab.as_mut();
                *descriptor.as_mut() = LargeItem {
                    object,
                    slab,
                    next: slab_mut.free,
                };
                slab_mut.free = Some(descriptor);
            }
        }

        log::trace!(
            "cache '{}': new large slab over {:#x}..{:#x}",
            self.name,
            backing.base,
            backing.base + backing.len
        );
        Ok(slab)
    }

    /// One page of slab backing from the configured source.
    fn allocate_page(&self) -> Result<NonNull<u8>, CacheAllocateError> {
        match self.source {
            SlabSource::Pmm(frames) => {
                let frame = frames
                    .allocate()
                    .map_err(|_| CacheAllocateError::SlabAllocationFailed)?;
                let virt = frames.direct_map().direct_map_from_physical(frame.physical_address());
                Ok(NonNull::new(virt.as_ptr()).expect("direct map never yields null"))
            }
            SlabSource::Heap { pages, .. } => {
                let allocation = pages
                    .allocate(PAGE_SIZE, AllocationPolicy::InstantFit)
                    .map_err(|_| CacheAllocateError::SlabAllocationFailed)?;
                Ok(NonNull::new(allocation.base as *mut u8).expect("mapped pages are never at null"))
            }
        }
    }

    fn free_page(&self, page: NonNull<u8>) {
        match self.source {
            SlabSource::Pmm(frames) => {
                let physical = frames
                    .direct_map()
                    .physical_from_direct_map(crate::mem::VirtualAddress::from_ptr(page.as_ptr()))
                    .expect("slab pages come from the direct map");
                frames.deallocate_one(crate::frame::FrameIndex::from_physical(physical));
            }
            SlabSource::Heap { pages, .. } => {
                pages.deallocate(Allocation {
                    base: page.as_ptr() as usize,
                    len: PAGE_SIZE,
                });
            }
        }
    }

    /// Destroys an empty small slab: destructors over every slot, then the
    /// page goes back to the source.
    unsafe fn destroy_small_slab(&self, slab: NonNull<SmallSlab>) {
        debug_assert_eq!(slab.as_ref().allocated, 0);
        let page = NonNull::new_unchecked(
            align_down(slab.as_ptr() as usize, PAGE_SIZE) as *mut u8
        );
        if let Some(destructor) = self.destructor {
            for index in 0..self.items_per_slab {
                destructor(NonNull::new_unchecked(
                    page.as_ptr().add(index * self.effective_item_size),
                ));
            }
        }
        log::trace!("cache '{}': small slab at {:p} destroyed", self.name, page.as_ptr());
        self.free_page(page);
    }

    /// Destroys an empty large slab: destructors and descriptor returns for
    /// every free slot, then the control block and backing go back.
    unsafe fn destroy_large_slab(&self, slab: NonNull<LargeSlab>) {
        debug_assert_eq!(slab.as_ref().allocated, 0);
        log::trace!(
            "cache '{}': large slab over {:#x} destroyed",
            self.name,
            slab.as_ref().backing.base
        );
        self.release_large_slab(slab);
    }

    /// Releases a large slab's free items, control block and backing.
    ///
    /// # Safety
    ///
    /// The slab must be unreachable from the cache lists and every item on
    /// its free list must be constructed.
    unsafe fn release_large_slab(&self, slab: NonNull<LargeSlab>) {
        let SlabSource::Heap { pages, metadata } = self.source else {
            unreachable!("large caches are rejected for Pmm sources at construction");
        };

        let mut cursor = slab.as_ref().free;
        while let Some(descriptor) = cursor {
            cursor = descriptor.as_ref().next;
            if let Some(destructor) = self.destructor {
                destructor(descriptor.as_ref().object);
            }
            metadata.deallocate_large_item(descriptor);
        }

        let backing = slab.as_ref().backing;
        metadata.deallocate_slab_header(slab);
        pages.deallocate(backing);
    }
}

/// A typed façade over [`RawCache`].
pub struct Cache<T> {
    raw: RawCache,
    _marker: core::marker::PhantomData<fn(T) -> T>,
}

impl<T> Cache<T> {
    pub fn new(
        name: &'static str,
        constructor: Option<Constructor>,
        destructor: Option<Destructor>,
        last_slab: LastSlabPolicy,
        source: SlabSource,
    ) -> Result<Self, CacheConfigError> {
        Ok(Self {
            raw: RawCache::new(RawCacheConfig {
                name,
                item_size: core::mem::size_of::<T>(),
                alignment: core::mem::align_of::<T>(),
                constructor,
                destructor,
                last_slab,
                source,
            })?,
            _marker: core::marker::PhantomData,
        })
    }

    pub fn allocate(&self) -> Result<NonNull<T>, CacheAllocateError> {
        self.raw.allocate().map(NonNull::cast)
    }

    pub fn deallocate(&self, item: NonNull<T>) {
        self.raw.deallocate(item.cast());
    }

    pub fn raw(&self) -> &RawCache {
        &self.raw
    }

    pub fn deinit(&self) {
        self.raw.deinit();
    }
}

/// The three frame-backed caches the allocator machinery itself runs on:
/// boundary tags, large-slab headers, and large-item descriptors.
///
/// Hard-wiring these to the frame allocator breaks the cycle where the tag
/// cache would otherwise allocate through the heap, which allocates through
/// arenas, which need tags.
pub struct MetadataCaches {
    tags: Cache<crate::arena::BoundaryTag>,
    slab_headers: Cache<LargeSlab>,
    large_items: Cache<LargeItem>,
}

impl MetadataCaches {
    pub fn new(frames: &'static FrameAllocator) -> Self {
        let source = SlabSource::Pmm(frames);
        Self {
            tags: Cache::new(
                "boundary-tags",
                Some(crate::arena::BoundaryTag::construct),
                None,
                LastSlabPolicy::Keep,
                source,
            )
            .expect("boundary tags fit the small class"),
            slab_headers: Cache::new(
                "large-slab-headers",
                Some(LargeSlab::construct),
                None,
                LastSlabPolicy::Keep,
                source,
            )
            .expect("slab headers fit the small class"),
            large_items: Cache::new(
                "large-item-descriptors",
                Some(LargeItem::construct),
                None,
                LastSlabPolicy::Keep,
                source,
            )
            .expect("large-item descriptors fit the small class"),
        }
    }

    pub(crate) fn allocate_tag(
        &self,
    ) -> Result<NonNull<crate::arena::BoundaryTag>, CacheAllocateError> {
        self.tags.allocate()
    }

    pub(crate) fn deallocate_tag(&self, tag: NonNull<crate::arena::BoundaryTag>) {
        self.tags.deallocate(tag);
    }

    pub(crate) fn allocate_slab_header(&self) -> Result<NonNull<LargeSlab>, CacheAllocateError> {
        self.slab_headers.allocate()
    }

    pub(crate) fn deallocate_slab_header(&self, slab: NonNull<LargeSlab>) {
        self.slab_headers.deallocate(slab);
    }

    pub(crate) fn allocate_large_item(&self) -> Result<NonNull<LargeItem>, CacheAllocateError> {
        self.large_items.allocate()
    }

    pub(crate) fn deallocate_large_item(&self, item: NonNull<LargeItem>) {
        self.large_items.deallocate(item);
    }

    /// Tears the three caches down. Every arena and large cache built on
    /// them must already be gone.
    pub fn deinit(&self) {
        self.tags.deinit();
        self.slab_headers.deinit();
        self.large_items.deinit();
    }
}

// The quantum-cache array packs RawCache control blocks into frames.
const_assert!(core::mem::size_of::<RawCache>() <= PAGE_SIZE);

// The metadata caches are Pmm-sourced and must stay in the small class.
const_assert!(small::fits_small_class(small::effective_size(
    core::mem::size_of::<crate::arena::BoundaryTag>(),
    core::mem::align_of::<crate::arena::BoundaryTag>(),
)));
const_assert!(small::fits_small_class(small::effective_size(
    core::mem::size_of::<LargeSlab>(),
    core::mem::align_of::<LargeSlab>(),
)));
const_assert!(small::fits_small_class(small::effective_size(
    core::mem::size_of::<LargeItem>(),
    core::mem::align_of::<LargeItem>(),
)));
