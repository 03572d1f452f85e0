//! Contracts between the allocation layers and the paging machinery.
//!
//! The allocators never walk page tables themselves. Mapping, unmapping,
//! protection changes and TLB shootdown are performed by an embedder-provided
//! [`AddressSpaceMapper`] and [`FlushBus`]; O(1) access to physical bytes
//! goes through a [`DirectMapping`]. This module defines those seams plus
//! [`OffsetDirectMap`], the fixed-offset translation a higher-half kernel
//! direct map actually is.

use crate::frame::FrameAllocator;
use crate::mem::{PhysicalAddress, PhysicalRange, VirtualAddress, VirtualRange};

/// Access permissions and cacheability for a mapped range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapType {
    KernelReadOnly,
    KernelReadWrite,
    KernelExecutable,
    /// Read-write with caching disabled, for MMIO and the non-cached direct
    /// map.
    NonCached,
}

/// Errors surfaced by the paging collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// A page in the requested range already has a mapping.
    AlreadyMapped,
    /// A page in the requested range has no mapping, or a mapping of the
    /// wrong shape for the requested change.
    MappingNotValid,
    /// The frame allocator could not supply backing or page-table frames.
    FramesExhausted,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => f.write_str("range is already mapped"),
            Self::MappingNotValid => f.write_str("range has no valid mapping"),
            Self::FramesExhausted => f.write_str("out of physical frames"),
        }
    }
}

impl core::error::Error for MapError {}

/// What to do with backing frames when a range is unmapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingDecision {
    /// Return the backing frames to the frame allocator.
    FreeBacking,
    /// Leave the frames alone; someone else owns them (e.g. MMIO).
    KeepBacking,
}

/// What to do with emptied top-level page-table entries when unmapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopLevelDecision {
    FreeTopLevel,
    KeepTopLevel,
}

/// Maximum number of ranges accumulated before a batch must be submitted.
pub const FLUSH_BATCH_CAPACITY: usize = 8;

/// A bounded batch of page-aligned virtual ranges awaiting a TLB flush.
#[derive(Debug, Default)]
pub struct FlushBatch {
    ranges: heapless::Vec<VirtualRange, FLUSH_BATCH_CAPACITY>,
}

impl FlushBatch {
    pub const fn new() -> Self {
        Self { ranges: heapless::Vec::new() }
    }

    /// Adds a range to the batch.
    ///
    /// Returns the range back when the batch is full; the caller must submit
    /// the batch and retry.
    pub fn push(&mut self, range: VirtualRange) -> Result<(), VirtualRange> {
        self.ranges.push(range)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[VirtualRange] {
        &self.ranges
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Identifies a user process for targeted shootdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessId(pub u32);

/// Which executors a flush must reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTarget {
    /// Every executor; kernel mappings are global.
    Kernel,
    /// Only executors currently running the given process.
    Process(ProcessId),
}

/// A shootdown request: a batch of ranges and the executors to flush.
#[derive(Debug)]
pub struct FlushRequest {
    pub batch: FlushBatch,
    pub target: FlushTarget,
}

/// Delivers [`FlushRequest`]s to the other executors.
///
/// Implementations decrement the request's internal counter once per
/// targeted executor; `submit_and_wait` spins until the counter reaches
/// zero. A single-executor embedder may complete requests immediately.
pub trait FlushBus: Sync {
    fn submit_and_wait(&self, request: FlushRequest);
}

/// Page-table manipulation for one address space.
///
/// Implementations own the page-table root and any intermediate-table
/// allocation policy. All ranges are page-aligned; violations are caller
/// bugs and may panic.
pub trait AddressSpaceMapper: Sync {
    /// Maps `range` and backs every page with a freshly allocated frame.
    fn map_range_and_back_with_frames(
        &self,
        range: VirtualRange,
        map_type: MapType,
        frames: &FrameAllocator,
    ) -> Result<(), MapError>;

    /// Maps `range` onto the caller-supplied physical range (MMIO and the
    /// direct maps). `physical.len()` must equal `range.len()`.
    fn map_range_to_physical_range(
        &self,
        range: VirtualRange,
        physical: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError>;

    /// Unmaps every range in `batch`. The caller follows up with a
    /// [`FlushBus`] submission; implementations must not flush themselves.
    fn unmap(
        &self,
        batch: &FlushBatch,
        backing: BackingDecision,
        top_level: TopLevelDecision,
        frames: &FrameAllocator,
    );

    /// Rewrites the protection of every range in `batch`.
    fn change_protection(&self, batch: &FlushBatch, map_type: MapType) -> Result<(), MapError>;
}

/// Error for a virtual address outside the direct map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressNotInDirectMap;

impl core::fmt::Display for AddressNotInDirectMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("virtual address is not inside the direct map")
    }
}

impl core::error::Error for AddressNotInDirectMap {}

/// O(1) translation between physical addresses and kernel-visible pointers.
pub trait DirectMapping: Sync {
    fn direct_map_from_physical(&self, physical: PhysicalAddress) -> VirtualAddress;

    fn physical_from_direct_map(
        &self,
        virtual_address: VirtualAddress,
    ) -> Result<PhysicalAddress, AddressNotInDirectMap>;

    /// Translation through the non-cached alias, for MMIO-adjacent uses.
    fn non_cached_direct_map_from_physical(&self, physical: PhysicalAddress) -> VirtualAddress;
}

/// The standard direct map: physical `[0, size)` is visible at a fixed
/// virtual offset, with an optional second non-cached alias.
pub struct OffsetDirectMap {
    cached: VirtualRange,
    non_cached_base: VirtualAddress,
}

impl OffsetDirectMap {
    /// `cached` covers physical `[0, cached.len())` at `cached.base()`.
    /// `non_cached_base` is the base of an equally sized non-cached alias;
    /// embedders without one pass `cached.base()` again.
    pub const fn new(cached: VirtualRange, non_cached_base: VirtualAddress) -> Self {
        Self { cached, non_cached_base }
    }
}

impl DirectMapping for OffsetDirectMap {
    fn direct_map_from_physical(&self, physical: PhysicalAddress) -> VirtualAddress {
        debug_assert!(physical.value() < self.cached.len());
        self.cached.base().offset(physical.value())
    }

    fn physical_from_direct_map(
        &self,
        virtual_address: VirtualAddress,
    ) -> Result<PhysicalAddress, AddressNotInDirectMap> {
        if !self.cached.contains(virtual_address) {
            return Err(AddressNotInDirectMap);
        }
        Ok(PhysicalAddress::new(virtual_address.value() - self.cached.base().value()))
    }

    fn non_cached_direct_map_from_physical(&self, physical: PhysicalAddress) -> VirtualAddress {
        debug_assert!(physical.value() < self.cached.len());
        self.non_cached_base.offset(physical.value())
    }
}
