//! Boot memory map contract.
//!
//! The bootloader hands the kernel a list of physical ranges tagged with how
//! they may be used. This crate only consumes the list: the bootstrap frame
//! allocator bumps through `Free` entries and [`FrameAllocator::populate`]
//! turns the remainder into the runtime free list.
//!
//! [`FrameAllocator::populate`]: crate::frame::FrameAllocator::populate

use crate::mem::PhysicalRange;

/// How a memory-map range may be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryMapEntryKind {
    /// Usable RAM.
    Free,
    /// In use by the kernel image or bootloader-loaded data.
    InUse,
    /// Firmware-reserved.
    Reserved,
    /// Reclaimable once bootloader services are no longer needed.
    BootloaderReclaimable,
    /// Reclaimable once ACPI tables have been consumed.
    AcpiReclaimable,
    /// Defective or otherwise unusable RAM.
    Unusable,
    /// Reported by firmware with a type this kernel does not know.
    Unknown,
}

/// One bootloader-reported physical range.
#[derive(Clone, Copy, Debug)]
pub struct MemoryMapEntry {
    pub range: PhysicalRange,
    pub kind: MemoryMapEntryKind,
}

impl MemoryMapEntry {
    pub const fn new(range: PhysicalRange, kind: MemoryMapEntryKind) -> Self {
        Self { range, kind }
    }

    pub fn is_free(&self) -> bool {
        self.kind == MemoryMapEntryKind::Free
    }
}

/// Iterates map entries front to back.
pub fn iter_forward(map: &[MemoryMapEntry]) -> impl Iterator<Item = &MemoryMapEntry> {
    map.iter()
}

/// Iterates map entries back to front, used when carving from the top of
/// memory.
pub fn iter_backward(map: &[MemoryMapEntry]) -> impl Iterator<Item = &MemoryMapEntry> {
    map.iter().rev()
}

/// The highest frame-sized boundary covered by any usable entry.
///
/// Sizes the frame-record array: every usable frame index is below the
/// returned frame count.
pub fn highest_usable_frame_boundary(map: &[MemoryMapEntry]) -> usize {
    map.iter()
        .filter(|entry| entry.is_free())
        .map(|entry| entry.range.end().value())
        .max()
        .unwrap_or(0)
        .div_ceil(crate::mem::PAGE_SIZE)
}
