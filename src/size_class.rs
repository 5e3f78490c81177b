//! Size class table and lookup functions.
//!
//! Objects are bucketed into a fixed table of size classes generated at
//! build time from `slabcfg.toml`. Each class maps to exactly one page per
//! slab; there is no multi-page span concept here.

/// Information about a single size class.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this
    /// class are rounded up to this size.
    pub size: usize,
    /// Number of objects that fit in one slab page for this class.
    pub objects_per_slab: usize,
    /// Depth of the per-class slab cache stack before pushes overflow.
    pub cache_capacity: usize,
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Number of defined size classes, including the index-0 sentinel.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Map a requested allocation size to its size class index.
///
/// Returns `None` if `size` exceeds the largest configured class — this is
/// the allocator's `SizeTooLarge` condition; it never falls back to raw
/// pages. A request of zero is treated as the smallest class.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    let size = size.max(1);
    for cls in 1..NUM_SIZE_CLASSES {
        if SIZE_CLASSES[cls].size >= size {
            return Some(cls);
        }
    }
    None
}

/// Get the allocation size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}
