//! Single-page slab: header, bitmap, and object payload (C2).
//!
//! Every slab is exactly one page, acquired page-aligned from
//! [`crate::page_source`], so `address & !(PAGE_SIZE - 1)` always yields the
//! owning slab's header — the resolution trick free() uses to go from a
//! raw object pointer back to its slab without a side table.

use crate::config::{HEADER_RESERVE, MAX_BITMAP_WORDS, PAGE_SIZE};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub const SLAB_MAGIC: u32 = 0x5341_4230; // "SAB0"

/// Which list (if any) a slab is currently linked into. Mutated only while
/// the owning class lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListId {
    None = 0,
    Partial = 1,
    Full = 2,
    Cache = 3,
}

impl ListId {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ListId::None,
            1 => ListId::Partial,
            2 => ListId::Full,
            3 => ListId::Cache,
            other => panic!("corrupt slab list id {other}"),
        }
    }
}

/// A single page: header fields, a fixed-capacity bitmap, and (starting at
/// byte offset `HEADER_RESERVE`) the object payload area.
#[repr(C)]
pub struct Slab {
    magic: u32,
    pub object_size: u32,
    pub object_count: u32,
    pub free_count: AtomicU32,
    list_id: AtomicU8,
    pub generation: AtomicU32,
    pub slab_id: u32,
    /// Ring index this slab was stamped with at init time. Never changes
    /// for the lifetime of this occupant of the slab page — see the
    /// `free_obj`-against-a-reactivated-epoch resolution in `DESIGN.md`.
    pub epoch_index: u32,
    /// Era stamped at init time; likewise immutable thereafter.
    pub era: u64,
    /// Intrusive doubly-linked list pointers, usable only while holding the
    /// owning class lock (mirrors the donor's `Span` doubly-linked list so
    /// a slab can be unlinked from a partial/full list in O(1), §4.4).
    pub next: UnsafeCell<*mut Slab>,
    pub prev: UnsafeCell<*mut Slab>,
    bitmap: [AtomicU32; MAX_BITMAP_WORDS],
}

// Every field we mutate through a shared reference is already atomic or
// documented as lock-protected; the header itself can be freely shared.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

const _: () = assert!(
    std::mem::size_of::<Slab>() <= HEADER_RESERVE,
    "Slab header (incl. worst-case bitmap) must fit in build.rs's HEADER_RESERVE budget"
);

impl Slab {
    fn bitmap_words(object_count: u32) -> usize {
        (object_count as usize).div_ceil(32)
    }

    /// Initialize a freshly-acquired page as a slab for `epoch_index` at
    /// `era`, holding `object_count` objects of `object_size` bytes each.
    /// All slots start free.
    ///
    /// # Safety
    /// `page` must be a page-aligned, page-sized, writable region not
    /// currently in use as anything else.
    pub unsafe fn init(
        page: NonNull<u8>,
        object_size: u32,
        object_count: u32,
        epoch_index: u32,
        era: u64,
        slab_id: u32,
    ) -> NonNull<Slab> {
        let slab_ptr = page.as_ptr().cast::<Slab>();
        let words = Self::bitmap_words(object_count);
        debug_assert!(words <= MAX_BITMAP_WORDS);

        unsafe {
            slab_ptr.write(Slab {
                magic: SLAB_MAGIC,
                object_size,
                object_count,
                free_count: AtomicU32::new(object_count),
                list_id: AtomicU8::new(ListId::None as u8),
                generation: AtomicU32::new(0),
                slab_id,
                epoch_index,
                era,
                next: UnsafeCell::new(std::ptr::null_mut()),
                prev: UnsafeCell::new(std::ptr::null_mut()),
                bitmap: std::array::from_fn(|_| AtomicU32::new(0)),
            });

            let slab = &*slab_ptr;
            for i in 0..words {
                let bits = if i + 1 == words {
                    let rem = object_count as usize - i * 32;
                    if rem == 32 { u32::MAX } else { (1u32 << rem) - 1 }
                } else {
                    u32::MAX
                };
                slab.bitmap[i].store(bits, Ordering::Relaxed);
            }
        }

        NonNull::new(slab_ptr).expect("page pointer was non-null")
    }

    /// Resolve the owning slab header for any pointer inside its payload.
    #[inline]
    pub fn slab_of(ptr: NonNull<u8>) -> NonNull<Slab> {
        let addr = ptr.as_ptr() as usize & !(PAGE_SIZE - 1);
        NonNull::new(addr as *mut Slab).expect("page-masked address is never null")
    }

    #[inline]
    pub fn check_magic(&self) {
        assert_eq!(self.magic, SLAB_MAGIC, "slab magic tag corrupted");
    }

    #[inline]
    pub fn list_id(&self) -> ListId {
        ListId::from_u8(self.list_id.load(Ordering::Relaxed))
    }

    /// # Safety
    /// Caller must hold the owning class lock.
    #[inline]
    pub unsafe fn set_list_id(&self, id: ListId) {
        self.list_id.store(id as u8, Ordering::Relaxed);
    }

    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        (self as *const Slab as *mut u8).wrapping_add(HEADER_RESERVE)
    }

    #[inline]
    pub fn slot_ptr(&self, slot: u32) -> NonNull<u8> {
        debug_assert!(slot < self.object_count);
        let ptr = self
            .payload_ptr()
            .wrapping_add(slot as usize * self.object_size as usize);
        NonNull::new(ptr).expect("slot pointer within a live slab is never null")
    }

    #[inline]
    pub fn word_count(&self) -> usize {
        Self::bitmap_words(self.object_count)
    }

    #[inline]
    pub fn bitmap_word(&self, idx: usize) -> &AtomicU32 {
        &self.bitmap[idx]
    }

    /// True if every bit in the bitmap is clear (no free slots) — used by
    /// zombie repair to check the slab's real occupancy independent of
    /// `free_count`.
    pub fn bitmap_is_full(&self) -> bool {
        (0..self.word_count()).all(|i| self.bitmap[i].load(Ordering::Acquire) == 0)
    }

    /// Count of set bits across the whole bitmap — used by invariant tests
    /// to check `popcount(free bits) == free_count` at quiescence.
    pub fn bitmap_popcount(&self) -> u32 {
        (0..self.word_count())
            .map(|i| self.bitmap[i].load(Ordering::Acquire).count_ones())
            .sum()
    }

    /// Reset header fields for cache reuse. Does not touch the payload —
    /// object semantics are the caller's problem — and does not touch the
    /// bitmap; the next `init` call re-seeds it.
    ///
    /// # Safety
    /// Caller must hold the owning class lock and the slab must not be
    /// reachable via any live handle (the generation bump on recycle is
    /// what invalidates those).
    pub unsafe fn make_pristine(&self) {
        unsafe {
            self.set_list_id(ListId::Cache);
        }
    }
}
