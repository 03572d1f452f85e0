//! Small-object slab layout: one frame per slab.
//!
//! Items are laid out contiguously from the start of the page, each padded
//! so its suffix holds one in-band free-list node; the slab control block
//! sits at the tail of the page. Both relations are fixed offsets, so an
//! object pointer reaches its node and its slab in O(1) with no lookup
//! table:
//!
//! ```text
//! | item 0 | node | pad | item 1 | node | pad | ...      | SmallSlab |
//! ^ page base                                       page end ^
//! ```

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::mem::{align_down, align_up, PAGE_SIZE};

/// Smallest item count a small slab must carry; caches that cannot reach it
/// fall into the large class.
pub(crate) const MIN_ITEMS_PER_SLAB: usize = 8;

/// In-band free-list node stored after each item's payload.
#[repr(C)]
pub(crate) struct FreeNode {
    pub next: Option<NonNull<FreeNode>>,
}

/// Control block at the tail of every small-slab page.
#[repr(C)]
pub(crate) struct SmallSlab {
    /// Pointer to self, validating tail-derived lookups.
    pub this: NonNull<SmallSlab>,
    pub prev: Option<NonNull<SmallSlab>>,
    pub next: Option<NonNull<SmallSlab>>,
    pub free: Option<NonNull<FreeNode>>,
    pub allocated: usize,
}

/// Byte offset from an item to its free-list node.
pub(crate) const fn node_offset(item_size: usize) -> usize {
    align_up(item_size, align_of::<FreeNode>())
}

/// Item stride: payload, node, then padding out to the item alignment.
pub(crate) const fn effective_size(item_size: usize, alignment: usize) -> usize {
    let unpadded = node_offset(item_size) + size_of::<FreeNode>();
    let stride_align = if alignment > align_of::<FreeNode>() {
        alignment
    } else {
        align_of::<FreeNode>()
    };
    align_up(unpadded, stride_align)
}

/// Items one page carries at the given stride.
pub(crate) const fn items_per_slab(effective_size: usize) -> usize {
    (PAGE_SIZE - size_of::<SmallSlab>()) / effective_size
}

/// Whether a cache of this stride belongs to the small class.
pub(crate) const fn fits_small_class(effective_size: usize) -> bool {
    items_per_slab(effective_size) >= MIN_ITEMS_PER_SLAB
}

/// Recovers the control block from any item pointer inside the page.
#[inline]
pub(crate) fn slab_from_item(item: NonNull<u8>) -> NonNull<SmallSlab> {
    let page = align_down(item.as_ptr() as usize, PAGE_SIZE);
    let header = page + PAGE_SIZE - size_of::<SmallSlab>();
    // SAFETY: small-slab pages are page-aligned and always carry their
    // control block at this offset.
    unsafe { NonNull::new_unchecked(header as *mut SmallSlab) }
}

/// The node belonging to `item`.
#[inline]
pub(crate) fn node_from_item(item: NonNull<u8>, item_size: usize) -> NonNull<FreeNode> {
    // SAFETY: every item is followed by its node at a fixed offset.
    unsafe { NonNull::new_unchecked(item.as_ptr().add(node_offset(item_size)) as *mut FreeNode) }
}

/// The item owning `node`.
#[inline]
pub(crate) fn item_from_node(node: NonNull<FreeNode>, item_size: usize) -> NonNull<u8> {
    // SAFETY: inverse of `node_from_item`.
    unsafe { NonNull::new_unchecked((node.as_ptr() as *mut u8).sub(node_offset(item_size))) }
}

/// Initializes a fresh page: free list threaded through every item, control
/// block written at the tail. Constructors have already run.
///
/// # Safety
///
/// `page` must be an exclusively owned, page-aligned, writable page.
pub(crate) unsafe fn format_page(
    page: NonNull<u8>,
    item_size: usize,
    effective_size: usize,
    count: usize,
) -> NonNull<SmallSlab> {
    debug_assert!(crate::mem::is_aligned(page.as_ptr() as usize, PAGE_SIZE));

    let mut free = None;
    for index in (0..count).rev() {
        let item = NonNull::new_unchecked(page.as_ptr().add(index * effective_size));
        let mut node = node_from_item(item, item_size);
        node.as_mut().next = free;
        free = Some(node);
    }

    let header = slab_from_item(page);
    header.as_ptr().write(SmallSlab {
        this: header,
        prev: None,
        next: None,
        free,
        allocated: 0,
    });
    header
}

/// Doubly linked list of small slabs.
pub(crate) struct SmallSlabList {
    head: Option<NonNull<SmallSlab>>,
    len: usize,
}

impl SmallSlabList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn front(&self) -> Option<NonNull<SmallSlab>> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub unsafe fn push_front(&mut self, mut slab: NonNull<SmallSlab>) {
        {
            let slab = slab.as_mut();
            slab.prev = None;
            slab.next = self.head;
        }
        if let Some(mut head) = self.head {
            head.as_mut().prev = Some(slab);
        }
        self.head = Some(slab);
        self.len += 1;
    }

    pub unsafe fn remove(&mut self, mut slab: NonNull<SmallSlab>) {
        let (prev, next) = {
            let slab = slab.as_ref();
            (slab.prev, slab.next)
        };
        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }
        if let Some(mut next) = next {
            next.as_mut().prev = prev;
        }
        let slab = slab.as_mut();
        slab.prev = None;
        slab.next = None;
        self.len -= 1;
    }
}
