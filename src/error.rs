//! Error taxonomy surfaced at the allocator boundary.
//!
//! Every caller-visible failure is a distinct variant here; none of them
//! are retried internally. CAS retries, trylock contention, and zombie
//! repairs are *not* represented here — they are normal operational events,
//! observable only through the counters in [`crate::stats`].

use thiserror::Error;

/// Failures `alloc_obj` and `free_obj` can return.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The page source could not deliver a new slab.
    #[error("out of memory")]
    OutOfMemory,

    /// Allocation was attempted against an epoch slot in the CLOSING state.
    #[error("epoch is closed for new allocations")]
    EpochClosed,

    /// The requested size exceeds the largest configured size class.
    #[error("requested size exceeds the largest configured size class")]
    SizeTooLarge,

    /// The handle's generation does not match the registry's current
    /// generation for that slab id — the slab has since been recycled.
    #[error(
        "stale handle: slab {slab_id} expected generation {expected_gen}, found {found_gen}"
    )]
    StaleHandle {
        slab_id: u32,
        expected_gen: u32,
        found_gen: u32,
    },

    /// The handle's slab id is out of range for the registry.
    #[error("unknown slab id {0}")]
    UnknownSlab(u32),

    /// A release was attempted on a slot that is already free.
    #[error("double free")]
    DoubleFree,

    /// The handle's slot index is out of range for its slab's object count.
    #[error("slot index out of range")]
    BadSlot,
}
