//! The kernel memory region list and the layout builder that fills it.
//!
//! The layout carves the kernel's higher-half window into named regions:
//! the linker-exported image sections, the bootloader's direct map plus a
//! synthesized non-cached alias, top-level-aligned ranges for the heap,
//! special heap, kernel stacks and kernel address space, and a Pages region
//! sized for the highest usable frame index.

use heapless::Vec;

use crate::frame::FrameRecord;
use crate::mem::{align_up, VirtualAddress, VirtualRange, PAGE_SIZE};

/// Maximum regions a layout can carry.
pub const MAX_REGIONS: usize = 16;

/// What a region is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionType {
    /// Kernel image: executable code.
    ExecutableSection,
    /// Kernel image: read-only data.
    ReadonlySection,
    /// Kernel image: mutable data and bss.
    WriteableSection,
    /// Kernel image: the embedded structured debug format tables.
    SdfSection,
    DirectMap,
    NonCachedDirectMap,
    SpecialHeap,
    KernelHeap,
    KernelStacks,
    /// Backing for the frame-record array.
    Pages,
    KernelAddressSpace,
}

/// One named virtual range.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub range: VirtualRange,
    pub kind: RegionType,
}

/// Errors from region insertion and layout building.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    TooManyRegions,
    /// The new region overlaps an existing one.
    Overlap,
    /// No gap in the window fits the requested size and alignment.
    OutOfWindow,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooManyRegions => f.write_str("too many regions"),
            Self::Overlap => f.write_str("regions overlap"),
            Self::OutOfWindow => f.write_str("no free range fits in the window"),
        }
    }
}

impl core::error::Error for LayoutError {}

/// A small sorted list of tagged virtual ranges.
#[derive(Default)]
pub struct RegionList {
    regions: Vec<Region, MAX_REGIONS>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self { regions: Vec::new() }
    }

    /// Inserts a region, keeping the list sorted by base.
    pub fn insert(&mut self, region: Region) -> Result<(), LayoutError> {
        if self.regions.iter().any(|existing| existing.range.overlaps(region.range)) {
            return Err(LayoutError::Overlap);
        }
        let position = self
            .regions
            .iter()
            .position(|existing| existing.range.base() > region.range.base())
            .unwrap_or(self.regions.len());
        self.regions
            .push(region)
            .map_err(|_| LayoutError::TooManyRegions)?;
        self.regions[position..].rotate_right(1);
        Ok(())
    }

    /// The region containing `address`, if any.
    pub fn find_containing(&self, address: VirtualAddress) -> Option<&Region> {
        self.regions.iter().find(|region| region.range.contains(address))
    }

    /// The first region of the given type.
    pub fn find_by_type(&self, kind: RegionType) -> Option<&Region> {
        self.regions.iter().find(|region| region.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Scans the gaps between regions for `size` bytes aligned to `align`
    /// inside `window`.
    pub fn find_free_range(
        &self,
        size: usize,
        align: usize,
        window: VirtualRange,
    ) -> Option<VirtualRange> {
        let mut candidate = align_up(window.base().value(), align);
        for region in self.regions.iter() {
            let base = region.range.base().value();
            let end = region.range.end().value();
            if end <= candidate {
                continue;
            }
            if base >= candidate.checked_add(size)? {
                break;
            }
            candidate = align_up(end, align);
        }
        let range_end = candidate.checked_add(size)?;
        (range_end <= window.end().value())
            .then(|| VirtualRange::new(VirtualAddress::new(candidate), size))
    }
}

/// Linker-exported section ranges of the kernel image.
#[derive(Clone, Copy, Debug)]
pub struct KernelSections {
    pub executable: VirtualRange,
    pub readonly: VirtualRange,
    pub writeable: VirtualRange,
    pub sdf: VirtualRange,
}

/// Inputs to [`build_layout`].
#[derive(Clone, Copy)]
pub struct LayoutParams {
    pub sections: KernelSections,
    /// The bootloader-provided direct map.
    pub direct_map: VirtualRange,
    /// The window free ranges are carved from.
    pub window: VirtualRange,
    /// Alignment of one top-level page-table entry; carved regions use it
    /// so each owns whole top-level entries.
    pub top_level_alignment: usize,
    pub heap_size: usize,
    pub special_heap_size: usize,
    pub stacks_size: usize,
    pub address_space_size: usize,
    /// Frame count bound from the memory map
    /// (see [`highest_usable_frame_boundary`]).
    ///
    /// [`highest_usable_frame_boundary`]: crate::mem::map::highest_usable_frame_boundary
    pub highest_frame_boundary: usize,
}

/// Builds the full region list from the image sections, the direct map and
/// the carving parameters.
pub fn build_layout(params: LayoutParams) -> Result<RegionList, LayoutError> {
    let mut list = RegionList::new();

    for (range, kind) in [
        (params.sections.executable, RegionType::ExecutableSection),
        (params.sections.readonly, RegionType::ReadonlySection),
        (params.sections.writeable, RegionType::WriteableSection),
        (params.sections.sdf, RegionType::SdfSection),
        (params.direct_map, RegionType::DirectMap),
    ] {
        list.insert(Region { range, kind })?;
    }

    // The non-cached alias mirrors the direct map's size and alignment and
    // lands in the first matching gap.
    let carve = |list: &mut RegionList, size: usize, align: usize, kind: RegionType| {
        let range = list
            .find_free_range(size, align, params.window)
            .ok_or(LayoutError::OutOfWindow)?;
        list.insert(Region { range, kind })?;
        log::debug!("layout: {kind:?} at {range:?}");
        Ok::<VirtualRange, LayoutError>(range)
    };

    carve(
        &mut list,
        params.direct_map.len(),
        params.top_level_alignment,
        RegionType::NonCachedDirectMap,
    )?;
    carve(&mut list, params.heap_size, params.top_level_alignment, RegionType::KernelHeap)?;
    carve(
        &mut list,
        params.special_heap_size,
        params.top_level_alignment,
        RegionType::SpecialHeap,
    )?;
    carve(&mut list, params.stacks_size, params.top_level_alignment, RegionType::KernelStacks)?;
    carve(
        &mut list,
        params.address_space_size,
        params.top_level_alignment,
        RegionType::KernelAddressSpace,
    )?;

    let pages_bytes = align_up(
        params.highest_frame_boundary * core::mem::size_of::<FrameRecord>(),
        PAGE_SIZE,
    );
    carve(&mut list, pages_bytes, PAGE_SIZE, RegionType::Pages)?;

    Ok(list)
}
