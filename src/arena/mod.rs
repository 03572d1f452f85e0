//! Boundary-tag resource arenas.
//!
//! An [`Arena`] manages an abstract integer resource (typically virtual
//! address space) in multiples of a power-of-two *quantum*. Space is
//! described by boundary tags on an ordered all-tags list; free space is
//! indexed by power-of-two freelists with a bitmap accelerator, and live
//! allocations sit in a fixed-bucket hash table keyed by base. Arenas stack:
//! an arena with a [`SpanSource`] imports spans on demand and releases them
//! when their last byte is freed.
//!
//! Small fixed-size requests can be served by per-quantum slab caches in
//! front of the arena, configured at construction.
//!
//! The design follows Bonwick's vmem: tag splitting on allocate, eager
//! coalescing on deallocate, so the all-tags list never carries two adjacent
//! free tags.

mod tag;

#[cfg(test)]
mod tests;

use core::ptr::NonNull;

use spin::{Mutex, MutexGuard};

use crate::frame::FrameAllocator;
use crate::slab::{LastSlabPolicy, MetadataCaches, RawCache, RawCacheConfig, SlabSource};

pub(crate) use tag::{AllLink, BoundaryTag, KindLink, TagKind, TagList};

/// One freelist per possible `log2(len)`.
const NUMBER_OF_FREELISTS: usize = usize::BITS as usize;

/// Bucket count of the allocation hash table. Must be a power of two.
const ALLOCATION_HASH_BUCKETS: usize = 64;

/// Upper bound on quantum caches an arena may be configured with.
pub const MAX_QUANTUM_CACHES: usize = 64;

/// Tags a single public call can consume: two for an imported span plus one
/// for splitting the allocation off it.
const TAGS_PER_IMPORT: usize = 3;

/// The result of a successful arena allocation.
///
/// `len` is the requested length rounded up to the arena quantum; the pair
/// is the exact value [`Arena::deallocate`] expects back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub base: usize,
    pub len: usize,
}

/// How [`Arena::allocate`] picks among fitting free tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// Constant-time: any tag from the smallest freelist guaranteed to fit,
    /// found with the bitmap. Falls back to a first-fit scan of the exact
    /// freelist.
    InstantFit,
    /// Smallest fitting tag in the exact freelist, else the minimum of the
    /// smallest guaranteed-fit freelist.
    BestFit,
    /// First fitting tag in the exact freelist, else instant fit.
    FirstFit,
}

/// Errors from [`Arena::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocateError {
    /// Zero-length requests are rejected.
    ZeroLength,
    /// No fitting free tag, and the source (if any) also declined.
    RequestedLengthUnavailable,
    /// The global tag cache could not supply boundary tags.
    OutOfBoundaryTags,
}

impl core::fmt::Display for AllocateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ZeroLength => f.write_str("zero-length allocation"),
            Self::RequestedLengthUnavailable => f.write_str("requested length unavailable"),
            Self::OutOfBoundaryTags => f.write_str("out of boundary tags"),
        }
    }
}

impl core::error::Error for AllocateError {}

/// Errors from [`Arena::add_span`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddSpanError {
    ZeroLength,
    /// Base or length is not quantum-aligned.
    Unaligned,
    /// `base + len` overflows the resource space.
    WouldWrap,
    /// The span overlaps a span the arena already manages.
    Overlap,
    OutOfBoundaryTags,
}

impl core::fmt::Display for AddSpanError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ZeroLength => f.write_str("zero-length span"),
            Self::Unaligned => f.write_str("span is not quantum-aligned"),
            Self::WouldWrap => f.write_str("span wraps the resource space"),
            Self::Overlap => f.write_str("span overlaps an existing span"),
            Self::OutOfBoundaryTags => f.write_str("out of boundary tags"),
        }
    }
}

impl core::error::Error for AddSpanError {}

/// Errors from [`Arena::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaInitError {
    /// The quantum must be a non-zero power of two.
    InvalidQuantum,
    /// Too many quantum caches requested.
    TooManyQuantumCaches,
    /// Backing storage for the quantum caches could not be allocated.
    QuantumCacheAllocationFailed,
}

impl core::fmt::Display for ArenaInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidQuantum => f.write_str("quantum is not a power of two"),
            Self::TooManyQuantumCaches => f.write_str("too many quantum caches"),
            Self::QuantumCacheAllocationFailed => {
                f.write_str("quantum cache storage allocation failed")
            }
        }
    }
}

impl core::error::Error for ArenaInitError {}

/// Something an arena can import spans from and release spans to.
///
/// Every [`Arena`] implements this by forwarding to its own allocate and
/// deallocate, so arenas stack directly. Custom sources override the pair:
/// the heap's page layer maps imported spans with frames on the way in and
/// unmaps on the way out.
pub trait SpanSource: Sync {
    fn import(&self, len: usize, policy: AllocationPolicy) -> Result<Allocation, AllocateError>;

    fn release(&self, allocation: Allocation);
}

impl SpanSource for Arena {
    fn import(&self, len: usize, policy: AllocationPolicy) -> Result<Allocation, AllocateError> {
        self.allocate(len, policy)
    }

    fn release(&self, allocation: Allocation) {
        self.deallocate(allocation);
    }
}

/// Where the quantum-cache control blocks live.
///
/// A bootstrap-ordering concern, not a capability difference: arenas that
/// exist to build the heap cannot allocate their caches *from* the heap.
#[derive(Clone, Copy)]
pub enum QuantumCacheStorage {
    /// Control blocks come from the byte-granular heap arena.
    Normal(&'static Arena),
    /// Control blocks are packed into frames addressed through the direct
    /// map. Reserved for the heap's own arenas.
    Heap(&'static FrameAllocator),
}

/// Quantum-cache configuration for [`Arena::new`].
#[derive(Clone, Copy)]
pub struct QuantumCacheConfig {
    /// Number of caches; cache `i` serves requests of `(i + 1) × quantum`.
    pub count: usize,
    pub storage: QuantumCacheStorage,
    /// Page-granular arena the caches draw their slabs from.
    pub slab_backing: &'static Arena,
}

/// Construction options for [`Arena::new`].
#[derive(Clone, Copy, Default)]
pub struct ArenaOptions {
    pub source: Option<&'static dyn SpanSource>,
    pub quantum_caches: Option<QuantumCacheConfig>,
}

/// A point-in-time structural snapshot, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub span_count: usize,
    pub imported_span_count: usize,
    pub free_bytes: usize,
    pub allocated_bytes: usize,
    pub free_tag_count: usize,
    pub allocation_count: usize,
    pub unused_tag_count: usize,
    pub freelist_bitmap: usize,
}

struct ArenaInner {
    /// Every tag, ascending base.
    all_tags: TagList<AllLink>,
    /// Span and imported-span tags, ascending base.
    spans: TagList<KindLink>,
    /// Free tags bucketed by `floor(log2(len))`.
    freelists: [TagList<KindLink>; NUMBER_OF_FREELISTS],
    /// Bit `i` set iff `freelists[i]` is non-empty.
    freelist_bitmap: usize,
    /// Allocated tags bucketed by a hash of their base.
    hash: [TagList<KindLink>; ALLOCATION_HASH_BUCKETS],
    /// Stash of role-less tags, pre-filled before the mutex is taken so the
    /// locked paths never allocate.
    unused: TagList<KindLink>,
    /// Live allocations tracked through the hash table.
    allocations: usize,
}

// SAFETY: ArenaInner holds raw tag pointers, but every tag it references is
// reachable only through this ArenaInner and only touched under the owning
// arena's mutex.
unsafe impl Send for ArenaInner {}

/// A boundary-tag resource arena.
pub struct Arena {
    name: &'static str,
    quantum: usize,
    metadata: &'static MetadataCaches,
    source: Option<&'static dyn SpanSource>,
    inner: Mutex<ArenaInner>,
    quantum_caches: Option<QuantumCaches>,
}

impl Arena {
    /// Creates an arena managing multiples of `quantum`.
    pub fn new(
        name: &'static str,
        quantum: usize,
        metadata: &'static MetadataCaches,
        options: ArenaOptions,
    ) -> Result<Self, ArenaInitError> {
        if quantum == 0 || !quantum.is_power_of_two() {
            return Err(ArenaInitError::InvalidQuantum);
        }

        let quantum_caches = match options.quantum_caches {
            Some(config) => Some(QuantumCaches::new(name, quantum, metadata, config)?),
            None => None,
        };

        log::debug!(
            "arena '{}' created: quantum {:#x}, source: {}, quantum caches: {}",
            name,
            quantum,
            options.source.is_some(),
            quantum_caches.as_ref().map_or(0, |qc| qc.count),
        );

        Ok(Self {
            name,
            quantum,
            metadata,
            source: options.source,
            inner: Mutex::new(ArenaInner {
                all_tags: TagList::new(),
                spans: TagList::new(),
                freelists: [TagList::NEW; NUMBER_OF_FREELISTS],
                freelist_bitmap: 0,
                hash: [TagList::NEW; ALLOCATION_HASH_BUCKETS],
                unused: TagList::new(),
                allocations: 0,
            }),
            quantum_caches,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Hands the arena a new span to manage.
    ///
    /// `base` and `len` must be quantum-aligned, `len` non-zero, and the
    /// span must not overlap any existing span or wrap the resource space.
    pub fn add_span(&self, base: usize, len: usize) -> Result<(), AddSpanError> {
        if len == 0 {
            return Err(AddSpanError::ZeroLength);
        }
        if !crate::mem::is_aligned(base, self.quantum) || !crate::mem::is_aligned(len, self.quantum)
        {
            return Err(AddSpanError::Unaligned);
        }
        let end = base.checked_add(len).ok_or(AddSpanError::WouldWrap)?;

        let mut inner = self
            .lock_with_tags(2)
            .map_err(|_| AddSpanError::OutOfBoundaryTags)?;

        // SAFETY: tag pointers below are owned by this arena and the mutex
        // is held.
        unsafe {
            for span in inner.spans.iter() {
                let span = span.as_ref();
                if base < span.base + span.len && span.base < end {
                    return Err(AddSpanError::Overlap);
                }
            }
            Self::install_span(&mut inner, base, len, TagKind::Span, true);
        }

        log::debug!("arena '{}': span {:#x}..{:#x} added", self.name, base, end);
        Ok(())
    }

    /// Allocates `len` bytes of resource, rounded up to the quantum.
    pub fn allocate(
        &self,
        len: usize,
        policy: AllocationPolicy,
    ) -> Result<Allocation, AllocateError> {
        if len == 0 {
            return Err(AllocateError::ZeroLength);
        }
        let len = self.round_to_quantum(len)?;

        if let Some(caches) = &self.quantum_caches {
            if len <= caches.max_cached_len() {
                return caches.allocate(len);
            }
        }

        let mut inner = self
            .lock_with_tags(1)
            .map_err(|_| AllocateError::OutOfBoundaryTags)?;

        // SAFETY: all tag manipulation below happens under the arena mutex
        // on tags owned by this arena.
        unsafe {
            let free_tag = match Self::take_fit(&mut inner, len, policy) {
                Some(tag) => tag,
                None => {
                    drop(inner);
                    let source = self
                        .source
                        .ok_or(AllocateError::RequestedLengthUnavailable)?;
                    let imported = source
                        .import(len, AllocationPolicy::InstantFit)
                        .map_err(|_| AllocateError::RequestedLengthUnavailable)?;
                    log::trace!(
                        "arena '{}': imported span {:#x}..{:#x}",
                        self.name,
                        imported.base,
                        imported.base + imported.len
                    );

                    match self.lock_with_tags(TAGS_PER_IMPORT) {
                        Ok(mut relocked) => {
                            // The fresh free tag stays off the freelists: it
                            // is consumed immediately below.
                            let free_tag = Self::install_span(
                                &mut relocked,
                                imported.base,
                                imported.len,
                                TagKind::ImportedSpan,
                                false,
                            );
                            inner = relocked;
                            free_tag
                        }
                        Err(_) => {
                            source.release(imported);
                            return Err(AllocateError::OutOfBoundaryTags);
                        }
                    }
                }
            };

            let allocated = Self::split_off_front(&mut inner, free_tag, len);
            Self::hash_insert(&mut inner, allocated);
            inner.allocations += 1;

            let tag = allocated.as_ref();
            Ok(Allocation {
                base: tag.base,
                len: tag.len,
            })
        }
    }

    /// Returns an allocation to the arena.
    ///
    /// # Panics
    ///
    /// Panics if `allocation` was not produced by this arena (or was already
    /// freed), which is a caller bug that cannot be continued past safely.
    pub fn deallocate(&self, allocation: Allocation) {
        assert!(allocation.len != 0, "arena '{}': zero-length free", self.name);
        let len = self
            .round_to_quantum(allocation.len)
            .expect("length was valid at allocation time");

        if let Some(caches) = &self.quantum_caches {
            if len <= caches.max_cached_len() {
                caches.deallocate(allocation.base, len);
                return;
            }
        }

        let release;
        {
            let mut inner = self.inner.lock();

            // SAFETY: arena mutex held; all touched tags belong to this
            // arena.
            unsafe {
                let tag = Self::hash_remove(&mut inner, allocation.base).unwrap_or_else(|| {
                    panic!(
                        "arena '{}': free of unknown allocation {:#x}",
                        self.name, allocation.base
                    )
                });
                assert_eq!(
                    tag.as_ref().len,
                    len,
                    "arena '{}': free of {:#x} with mismatched length",
                    self.name,
                    allocation.base
                );
                inner.allocations -= 1;
                release = Self::free_and_coalesce(&mut inner, tag);
            }
        }

        if let Some(span) = release {
            log::trace!(
                "arena '{}': releasing span {:#x}..{:#x}",
                self.name,
                span.base,
                span.base + span.len
            );
            self.source
                .expect("imported span exists without a source")
                .release(span);
        }
    }

    /// Tears the arena down, releasing imported spans and returning every
    /// tag to the global tag cache.
    ///
    /// # Panics
    ///
    /// Panics if any allocation is still live. The arena must not be used
    /// afterwards.
    pub fn deinit(&self) {
        if let Some(caches) = &self.quantum_caches {
            caches.deinit();
        }

        // Release spans one at a time so the source is never called with
        // the arena mutex held.
        loop {
            let release;
            {
                let mut inner = self.inner.lock();
                assert_eq!(
                    inner.allocations, 0,
                    "arena '{}' deinitialized with live allocations",
                    self.name
                );
                // SAFETY: arena mutex held.
                unsafe {
                    let Some(span) = inner.spans.front() else {
                        break;
                    };
                    release = Self::remove_span(&mut inner, span);
                }
            }
            if let Some(span) = release {
                self.source
                    .expect("imported span exists without a source")
                    .release(span);
            }
        }

        // Hand the stash back to the global cache.
        loop {
            let tag = {
                let mut inner = self.inner.lock();
                // SAFETY: arena mutex held.
                unsafe { inner.unused.pop_front() }
            };
            match tag {
                Some(tag) => self.metadata.deallocate_tag(tag),
                None => break,
            }
        }

        log::debug!("arena '{}' deinitialized", self.name);
    }

    /// Snapshots structural counters.
    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        let mut stats = ArenaStats {
            unused_tag_count: inner.unused.len(),
            allocation_count: inner.allocations,
            freelist_bitmap: inner.freelist_bitmap,
            ..ArenaStats::default()
        };
        for tag in inner.all_tags.iter() {
            // SAFETY: arena mutex held.
            let tag = unsafe { tag.as_ref() };
            match tag.kind {
                TagKind::Span => stats.span_count += 1,
                TagKind::ImportedSpan => {
                    stats.span_count += 1;
                    stats.imported_span_count += 1;
                }
                TagKind::Free => {
                    stats.free_tag_count += 1;
                    stats.free_bytes += tag.len;
                }
                TagKind::Allocated => stats.allocated_bytes += tag.len,
            }
        }
        stats
    }

    /// Walks every structure and asserts the arena's invariants:
    /// all-tags ordering, no adjacent free tags, span tiling, freelist
    /// bucketing, bitmap consistency and hash membership.
    ///
    /// Intended for tests and debug builds; cost is linear in tag count.
    pub fn verify_invariants(&self) {
        let inner = self.inner.lock();
        // SAFETY: arena mutex held for the whole walk.
        unsafe {
            let mut previous: Option<&BoundaryTag> = None;
            let mut span_remaining = 0usize;
            for tag in inner.all_tags.iter() {
                let tag = tag.as_ref();
                if let Some(prev) = previous {
                    assert!(prev.base <= tag.base, "all-tags list out of order");
                    assert!(
                        !(prev.kind == TagKind::Free && tag.kind == TagKind::Free),
                        "adjacent free tags survived a deallocate"
                    );
                }
                match tag.kind {
                    TagKind::Span | TagKind::ImportedSpan => {
                        assert_eq!(span_remaining, 0, "span content does not tile its span");
                        span_remaining = tag.len;
                    }
                    TagKind::Free | TagKind::Allocated => {
                        assert!(span_remaining >= tag.len, "tag overruns its span");
                        span_remaining -= tag.len;
                    }
                }
                previous = Some(tag);
            }
            assert_eq!(span_remaining, 0, "trailing span is not fully tiled");

            let mut span_previous = 0usize;
            for span in inner.spans.iter() {
                let span = span.as_ref();
                assert!(
                    matches!(span.kind, TagKind::Span | TagKind::ImportedSpan),
                    "non-span tag on the span list"
                );
                assert!(span.base >= span_previous, "span list out of order");
                span_previous = span.base;
            }

            for (index, list) in inner.freelists.iter().enumerate() {
                assert_eq!(
                    inner.freelist_bitmap & (1 << index) != 0,
                    !list.is_empty(),
                    "freelist bitmap out of sync at index {index}"
                );
                for tag in list.iter() {
                    let tag = tag.as_ref();
                    assert_eq!(tag.kind, TagKind::Free);
                    assert_eq!(freelist_index(tag.len), index, "tag in wrong freelist");
                }
            }

            let mut hashed = 0usize;
            for bucket in inner.hash.iter() {
                for tag in bucket.iter() {
                    assert_eq!(tag.as_ref().kind, TagKind::Allocated);
                    hashed += 1;
                }
            }
            assert_eq!(hashed, inner.allocations, "hash table allocation count drifted");
        }
    }

    fn round_to_quantum(&self, len: usize) -> Result<usize, AllocateError> {
        len.checked_add(self.quantum - 1)
            .map(|padded| padded & !(self.quantum - 1))
            .ok_or(AllocateError::RequestedLengthUnavailable)
    }

    /// Locks the arena, guaranteeing at least `needed` stashed tags under
    /// the lock. Tops the stash up from the global tag cache while unlocked.
    fn lock_with_tags(&self, needed: usize) -> Result<MutexGuard<'_, ArenaInner>, OutOfTags> {
        loop {
            {
                let inner = self.inner.lock();
                if inner.unused.len() >= needed {
                    return Ok(inner);
                }
            }
            let tag = self.metadata.allocate_tag().map_err(|_| OutOfTags)?;
            // SAFETY: fresh tag, arena mutex held for the push.
            unsafe { self.inner.lock().unused.push_front(tag) };
        }
    }

    /// Takes a stashed tag. `lock_with_tags` guarantees availability.
    unsafe fn take_unused(inner: &mut ArenaInner, base: usize, len: usize, kind: TagKind) -> NonNull<BoundaryTag> {
        let mut tag = inner
            .unused
            .pop_front()
            .expect("tag stash exhausted under lock");
        tag.as_mut().reset(base, len, kind);
        tag
    }

    /// Installs a span tag plus its single free tag, both ordered into the
    /// all-tags list. The free tag joins a freelist only when
    /// `free_to_freelist`; an imported span's free tag is consumed by the
    /// caller immediately.
    unsafe fn install_span(
        inner: &mut ArenaInner,
        base: usize,
        len: usize,
        kind: TagKind,
        free_to_freelist: bool,
    ) -> NonNull<BoundaryTag> {
        let span_tag = Self::take_unused(inner, base, len, kind);
        let free_tag = Self::take_unused(inner, base, len, TagKind::Free);

        let anchor = inner
            .all_tags
            .iter()
            .find(|candidate| candidate.as_ref().base > base);
        inner.all_tags.insert_before(anchor, span_tag);
        inner.all_tags.insert_after(span_tag, free_tag);

        let span_anchor = inner
            .spans
            .iter()
            .find(|candidate| candidate.as_ref().base > base);
        inner.spans.insert_before(span_anchor, span_tag);

        if free_to_freelist {
            Self::freelist_push(inner, free_tag);
        }
        free_tag
    }

    /// Removes one span and its (single, free) content tag, stashing both.
    /// Returns the allocation to release if the span was imported.
    unsafe fn remove_span(
        inner: &mut ArenaInner,
        span: NonNull<BoundaryTag>,
    ) -> Option<Allocation> {
        let (base, len, kind) = {
            let span = span.as_ref();
            (span.base, span.len, span.kind)
        };

        let content = span.as_ref().all.next.expect("span without content tag");
        {
            let content_ref = content.as_ref();
            assert_eq!(content_ref.kind, TagKind::Free, "deinit with live content");
            assert_eq!(content_ref.base, base);
            assert_eq!(content_ref.len, len);
        }
        Self::freelist_remove(inner, content);
        inner.all_tags.remove(content);
        inner.unused.push_front(content);

        inner.spans.remove(span);
        inner.all_tags.remove(span);
        inner.unused.push_front(span);

        (kind == TagKind::ImportedSpan).then_some(Allocation { base, len })
    }

    unsafe fn freelist_push(inner: &mut ArenaInner, tag: NonNull<BoundaryTag>) {
        let index = freelist_index(tag.as_ref().len);
        inner.freelists[index].push_front(tag);
        inner.freelist_bitmap |= 1 << index;
    }

    unsafe fn freelist_remove(inner: &mut ArenaInner, tag: NonNull<BoundaryTag>) {
        let index = freelist_index(tag.as_ref().len);
        inner.freelists[index].remove(tag);
        if inner.freelists[index].is_empty() {
            inner.freelist_bitmap &= !(1 << index);
        }
    }

    /// Picks and removes a free tag of at least `len` per `policy`.
    unsafe fn take_fit(
        inner: &mut ArenaInner,
        len: usize,
        policy: AllocationPolicy,
    ) -> Option<NonNull<BoundaryTag>> {
        match policy {
            AllocationPolicy::InstantFit => {
                Self::take_instant(inner, len).or_else(|| Self::take_first_exact(inner, len))
            }
            AllocationPolicy::FirstFit => {
                Self::take_first_exact(inner, len).or_else(|| Self::take_instant(inner, len))
            }
            AllocationPolicy::BestFit => Self::take_best(inner, len),
        }
    }

    /// Any tag from the smallest freelist whose every member fits `len`.
    unsafe fn take_instant(inner: &mut ArenaInner, len: usize) -> Option<NonNull<BoundaryTag>> {
        let mask = guaranteed_fit_mask(inner.freelist_bitmap, len);
        if mask == 0 {
            return None;
        }
        let index = mask.trailing_zeros() as usize;
        let tag = inner.freelists[index].front()?;
        Self::freelist_remove(inner, tag);
        Some(tag)
    }

    /// First fitting tag in the freelist that exactly contains `len`.
    unsafe fn take_first_exact(inner: &mut ArenaInner, len: usize) -> Option<NonNull<BoundaryTag>> {
        let index = freelist_index(len);
        let tag = inner.freelists[index]
            .iter()
            .find(|tag| tag.as_ref().len >= len)?;
        Self::freelist_remove(inner, tag);
        Some(tag)
    }

    /// Smallest fitting tag in the exact freelist, else the minimum of the
    /// smallest guaranteed-fit freelist.
    unsafe fn take_best(inner: &mut ArenaInner, len: usize) -> Option<NonNull<BoundaryTag>> {
        let exact = freelist_index(len);
        let mut best: Option<NonNull<BoundaryTag>> = None;
        for tag in inner.freelists[exact].iter() {
            let tag_len = tag.as_ref().len;
            if tag_len < len {
                continue;
            }
            if tag_len == len {
                best = Some(tag);
                break;
            }
            if best.map_or(true, |current| tag_len < current.as_ref().len) {
                best = Some(tag);
            }
        }

        let tag = best.or_else(|| {
            let mask = guaranteed_fit_mask(inner.freelist_bitmap, len);
            if mask == 0 {
                return None;
            }
            let index = mask.trailing_zeros() as usize;
            let mut minimum: Option<NonNull<BoundaryTag>> = None;
            for tag in inner.freelists[index].iter() {
                if minimum.map_or(true, |current| tag.as_ref().len < current.as_ref().len) {
                    minimum = Some(tag);
                }
            }
            minimum
        })?;
        Self::freelist_remove(inner, tag);
        Some(tag)
    }

    /// Carves `len` off the front of `free_tag` (already off the
    /// freelists). The remainder, if any, becomes a new free tag. Returns
    /// the allocated tag.
    unsafe fn split_off_front(
        inner: &mut ArenaInner,
        mut free_tag: NonNull<BoundaryTag>,
        len: usize,
    ) -> NonNull<BoundaryTag> {
        let (base, tag_len) = {
            let tag = free_tag.as_ref();
            (tag.base, tag.len)
        };
        debug_assert!(tag_len >= len);

        if tag_len > len {
            let rest = Self::take_unused(inner, base + len, tag_len - len, TagKind::Free);
            inner.all_tags.insert_after(free_tag, rest);
            Self::freelist_push(inner, rest);
            free_tag.as_mut().len = len;
        }
        free_tag.as_mut().kind = TagKind::Allocated;
        free_tag
    }

    unsafe fn hash_insert(inner: &mut ArenaInner, tag: NonNull<BoundaryTag>) {
        let bucket = hash_bucket(tag.as_ref().base);
        inner.hash[bucket].push_front(tag);
    }

    unsafe fn hash_remove(inner: &mut ArenaInner, base: usize) -> Option<NonNull<BoundaryTag>> {
        let bucket = hash_bucket(base);
        let tag = inner.hash[bucket]
            .iter()
            .find(|tag| tag.as_ref().base == base)?;
        inner.hash[bucket].remove(tag);
        Some(tag)
    }

    /// Marks `tag` free, coalesces with free neighbors, and either returns
    /// the span to release (exact fill of an imported span) or files the tag
    /// on its freelist.
    unsafe fn free_and_coalesce(
        inner: &mut ArenaInner,
        mut tag: NonNull<BoundaryTag>,
    ) -> Option<Allocation> {
        tag.as_mut().kind = TagKind::Free;

        // Absorb the left neighbor.
        if let Some(previous) = tag.as_ref().all.prev {
            if previous.as_ref().kind == TagKind::Free {
                let (prev_base, prev_len) = {
                    let previous = previous.as_ref();
                    (previous.base, previous.len)
                };
                Self::freelist_remove(inner, previous);
                inner.all_tags.remove(previous);
                inner.unused.push_front(previous);
                let tag = tag.as_mut();
                tag.base = prev_base;
                tag.len += prev_len;
            }
        }

        // Absorb the right neighbor.
        if let Some(following) = tag.as_ref().all.next {
            if following.as_ref().kind == TagKind::Free {
                let next_len = following.as_ref().len;
                Self::freelist_remove(inner, following);
                inner.all_tags.remove(following);
                inner.unused.push_front(following);
                tag.as_mut().len += next_len;
            }
        }

        // An exactly refilled imported span goes back to the source.
        if let Some(previous) = tag.as_ref().all.prev {
            let previous_ref = previous.as_ref();
            if previous_ref.kind == TagKind::ImportedSpan
                && previous_ref.base == tag.as_ref().base
                && previous_ref.len == tag.as_ref().len
            {
                let span = Allocation {
                    base: previous_ref.base,
                    len: previous_ref.len,
                };
                inner.all_tags.remove(tag);
                inner.unused.push_front(tag);
                inner.spans.remove(previous);
                inner.all_tags.remove(previous);
                inner.unused.push_front(previous);
                return Some(span);
            }
        }

        Self::freelist_push(inner, tag);
        None
    }
}

/// Internal marker for tag-cache exhaustion.
struct OutOfTags;

/// `floor(log2(len))`, the freelist a tag of `len` belongs to.
#[inline]
fn freelist_index(len: usize) -> usize {
    debug_assert!(len > 0);
    NUMBER_OF_FREELISTS - 1 - len.leading_zeros() as usize
}

/// Bitmap mask of freelists whose smallest possible member is >= `len`.
#[inline]
fn guaranteed_fit_mask(bitmap: usize, len: usize) -> usize {
    match len.checked_next_power_of_two() {
        Some(ceiling) => bitmap & !(ceiling - 1),
        None => 0,
    }
}

/// wyhash-style mix of an allocation base into a hash bucket.
#[inline]
fn hash_bucket(base: usize) -> usize {
    const SEED: u64 = 0xa076_1d64_78bd_642f;
    const SECRET: u64 = 0xe703_7ed1_a0b4_28db;
    let product = u128::from(base as u64 ^ SEED) * u128::from(SECRET);
    let mixed = (product as u64) ^ ((product >> 64) as u64);
    mixed as usize & (ALLOCATION_HASH_BUCKETS - 1)
}

/// The per-quantum slab caches fronting an arena.
struct QuantumCaches {
    quantum: usize,
    count: usize,
    caches: [Option<NonNull<RawCache>>; MAX_QUANTUM_CACHES],
    storage: QuantumCacheBacking,
}

// SAFETY: the cache pointers are written once at construction; RawCache
// itself is Sync.
unsafe impl Send for QuantumCaches {}
unsafe impl Sync for QuantumCaches {}

/// Deinit bookkeeping for the quantum-cache control blocks.
enum QuantumCacheBacking {
    Normal(&'static Arena),
    Heap {
        frames: &'static FrameAllocator,
        used: heapless::Vec<crate::frame::FrameIndex, MAX_QUANTUM_CACHES>,
    },
}

impl QuantumCaches {
    fn new(
        name: &'static str,
        quantum: usize,
        metadata: &'static MetadataCaches,
        config: QuantumCacheConfig,
    ) -> Result<Self, ArenaInitError> {
        if config.count == 0 || config.count > MAX_QUANTUM_CACHES {
            return Err(ArenaInitError::TooManyQuantumCaches);
        }

        let mut caches = [None; MAX_QUANTUM_CACHES];
        let make_config = |index: usize| RawCacheConfig {
            name,
            item_size: (index + 1) * quantum,
            alignment: quantum,
            constructor: None,
            destructor: None,
            last_slab: LastSlabPolicy::Keep,
            source: SlabSource::Heap {
                pages: config.slab_backing,
                metadata,
            },
        };

        let storage = match config.storage {
            QuantumCacheStorage::Normal(heap) => {
                for (index, slot) in caches.iter_mut().enumerate().take(config.count) {
                    let bytes = heap
                        .allocate(core::mem::size_of::<RawCache>(), AllocationPolicy::InstantFit)
                        .map_err(|_| ArenaInitError::QuantumCacheAllocationFailed)?;
                    let cache = RawCache::new(make_config(index))
                        .expect("quantum cache configuration is always small-legal");
                    let pointer = bytes.base as *mut RawCache;
                    // SAFETY: the heap returned a live, exclusive,
                    // suitably sized mapping; RawCache's alignment is
                    // below the heap quantum.
                    unsafe { pointer.write(cache) };
                    *slot = NonNull::new(pointer);
                }
                QuantumCacheBacking::Normal(heap)
            }
            QuantumCacheStorage::Heap(frames) => {
                let per_frame = crate::mem::PAGE_SIZE / core::mem::size_of::<RawCache>();
                let mut used = heapless::Vec::new();
                let mut base: *mut RawCache = core::ptr::null_mut();
                for (index, slot) in caches.iter_mut().enumerate().take(config.count) {
                    if index % per_frame == 0 {
                        let frame = frames
                            .allocate()
                            .map_err(|_| ArenaInitError::QuantumCacheAllocationFailed)?;
                        used.push(frame)
                            .expect("frame list capacity matches cache capacity");
                        base = frames
                            .direct_map()
                            .direct_map_from_physical(frame.physical_address())
                            .as_ptr();
                    }
                    let cache = RawCache::new(make_config(index))
                        .expect("quantum cache configuration is always small-legal");
                    // SAFETY: `base` points at an exclusively owned frame
                    // through the direct map; `index % per_frame` slots of
                    // `size_of::<RawCache>()` stay inside it.
                    unsafe {
                        let pointer = base.add(index % per_frame);
                        pointer.write(cache);
                        *slot = Some(NonNull::new_unchecked(pointer));
                    }
                }
                QuantumCacheBacking::Heap { frames, used }
            }
        };

        Ok(Self {
            quantum,
            count: config.count,
            caches,
            storage,
        })
    }

    fn max_cached_len(&self) -> usize {
        self.count * self.quantum
    }

    fn cache_for(&self, len: usize) -> &RawCache {
        debug_assert!(len > 0 && len <= self.max_cached_len());
        debug_assert!(len % self.quantum == 0);
        let cache = self.caches[len / self.quantum - 1].expect("cache index within count");
        // SAFETY: written at construction, never moved, freed only at
        // deinit.
        unsafe { cache.as_ref() }
    }

    fn allocate(&self, len: usize) -> Result<Allocation, AllocateError> {
        let item = self
            .cache_for(len)
            .allocate()
            .map_err(|_| AllocateError::RequestedLengthUnavailable)?;
        Ok(Allocation {
            base: item.as_ptr() as usize,
            len,
        })
    }

    fn deallocate(&self, base: usize, len: usize) {
        let pointer = NonNull::new(base as *mut u8).expect("allocation base is never null");
        self.cache_for(len).deallocate(pointer);
    }

    /// Destroys the caches and their control-block storage. The arena must
    /// not be used afterwards.
    fn deinit(&self) {
        for slot in self.caches.iter().take(self.count) {
            let cache = slot.expect("cache index within count");
            // SAFETY: construction wrote a valid RawCache here; deinit is
            // called once, after which the arena is unusable by contract.
            unsafe {
                cache.as_ref().deinit();
                core::ptr::drop_in_place(cache.as_ptr());
            }
        }
        match &self.storage {
            QuantumCacheBacking::Normal(heap) => {
                for slot in self.caches.iter().take(self.count) {
                    let cache = slot.expect("cache index within count");
                    heap.deallocate(Allocation {
                        base: cache.as_ptr() as usize,
                        len: crate::mem::align_up(
                            core::mem::size_of::<RawCache>(),
                            heap.quantum(),
                        ),
                    });
                }
            }
            QuantumCacheBacking::Heap { frames, used } => {
                let mut list = crate::frame::FrameList::new();
                for frame in used.iter() {
                    list.push(*frame, frames.records());
                }
                frames.deallocate(list);
            }
        }
    }
}
