//! Observability substrate (C8): always-on relaxed atomic counters per
//! class, the global/class/epoch snapshot record shapes the embedding's
//! metrics exporter reads, and the trylock contention probe.
//!
//! All counters use `Relaxed` ordering — they are observational only, not
//! synchronization primitives. A [`Snapshot`]'s fields are each atomically
//! read but the snapshot as a whole is not globally consistent: a
//! deliberate cost trade so observability never perturbs the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Current schema version of the snapshot record shapes, bumped whenever
/// a field is added, removed, or renamed.
pub const SCHEMA_VERSION: u32 = 1;

/// Per-class relaxed counters (§4.8). One block per size class, owned by
/// [`crate::class::SizeClass`].
#[derive(Default)]
pub struct ClassCounters {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,

    pub slow_path_hits: AtomicU64,
    pub slow_cache_miss: AtomicU64,
    pub slow_epoch_closed: AtomicU64,
    pub slow_current_partial_null: AtomicU64,
    pub slow_current_partial_full: AtomicU64,

    pub list_move_partial_to_full: AtomicU64,
    pub list_move_full_to_partial: AtomicU64,
    pub list_move_partial_to_cache: AtomicU64,

    pub cas_attempts_alloc: AtomicU64,
    pub cas_retries_alloc: AtomicU64,
    pub cas_attempts_free: AtomicU64,
    pub cas_retries_free: AtomicU64,

    pub current_partial_cas_attempts: AtomicU64,
    pub current_partial_cas_failures: AtomicU64,

    pub lock_fast_acquire: AtomicU64,
    pub lock_contended: AtomicU64,

    pub slabs_created: AtomicU64,
    pub slabs_recycled: AtomicU64,

    pub repair_count: AtomicU64,
    pub repair_reason_full_bitmap: AtomicU64,
    pub repair_reason_list_mismatch: AtomicU64,
    pub repair_reason_other: AtomicU64,

    pub double_free: AtomicU64,
    pub stale_handle: AtomicU64,
    pub unknown_slab: AtomicU64,
    pub bad_slot: AtomicU64,

    pub epoch_close_calls: AtomicU64,
    pub epoch_close_noop: AtomicU64,
    pub epoch_close_scanned: AtomicU64,
    pub epoch_close_recycled: AtomicU64,
    pub epoch_close_nanos: AtomicU64,
}

impl ClassCounters {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Flat, point-in-time view of one size class's counters plus its cache
/// occupancy and scan-controller state, for `stats_class`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassStats {
    pub class_idx: usize,
    pub object_size: usize,
    pub allocations: u64,
    pub frees: u64,
    pub slow_path_hits: u64,
    pub slow_cache_miss: u64,
    pub slow_epoch_closed: u64,
    pub slow_current_partial_null: u64,
    pub slow_current_partial_full: u64,
    pub list_move_partial_to_full: u64,
    pub list_move_full_to_partial: u64,
    pub list_move_partial_to_cache: u64,
    pub cas_attempts_alloc: u64,
    pub cas_retries_alloc: u64,
    pub cas_attempts_free: u64,
    pub cas_retries_free: u64,
    pub current_partial_cas_attempts: u64,
    pub current_partial_cas_failures: u64,
    pub lock_fast_acquire: u64,
    pub lock_contended: u64,
    pub slabs_created: u64,
    pub slabs_recycled: u64,
    pub repair_count: u64,
    pub repair_reason_full_bitmap: u64,
    pub repair_reason_list_mismatch: u64,
    pub repair_reason_other: u64,
    pub double_free: u64,
    pub stale_handle: u64,
    pub unknown_slab: u64,
    pub bad_slot: u64,
    pub epoch_close_calls: u64,
    pub epoch_close_noop: u64,
    pub epoch_close_scanned: u64,
    pub epoch_close_recycled: u64,
    pub epoch_close_nanos: u64,
    pub cache_stack_len: usize,
    pub cache_stack_capacity: usize,
    pub cache_overflow_len: usize,
    pub cache_pushes: u64,
    pub cache_pops: u64,
    pub cache_overflows: u64,
    pub madvise_calls: u64,
    pub madvise_bytes: u64,
    pub madvise_failures: u64,
    pub partial_slab_count: usize,
    pub full_slab_count: usize,
    pub scan_mode_randomized: bool,
    pub scan_switches: u64,
}

pub(crate) fn class_stats_from_counters(
    class_idx: usize,
    object_size: usize,
    c: &ClassCounters,
    cache: crate::cache::CacheCounts,
    partial_slab_count: usize,
    full_slab_count: usize,
    scan_mode_randomized: bool,
    scan_switches: u64,
) -> ClassStats {
    macro_rules! l {
        ($f:ident) => {
            ClassCounters::load(&c.$f)
        };
    }
    ClassStats {
        class_idx,
        object_size,
        allocations: l!(allocations),
        frees: l!(frees),
        slow_path_hits: l!(slow_path_hits),
        slow_cache_miss: l!(slow_cache_miss),
        slow_epoch_closed: l!(slow_epoch_closed),
        slow_current_partial_null: l!(slow_current_partial_null),
        slow_current_partial_full: l!(slow_current_partial_full),
        list_move_partial_to_full: l!(list_move_partial_to_full),
        list_move_full_to_partial: l!(list_move_full_to_partial),
        list_move_partial_to_cache: l!(list_move_partial_to_cache),
        cas_attempts_alloc: l!(cas_attempts_alloc),
        cas_retries_alloc: l!(cas_retries_alloc),
        cas_attempts_free: l!(cas_attempts_free),
        cas_retries_free: l!(cas_retries_free),
        current_partial_cas_attempts: l!(current_partial_cas_attempts),
        current_partial_cas_failures: l!(current_partial_cas_failures),
        lock_fast_acquire: l!(lock_fast_acquire),
        lock_contended: l!(lock_contended),
        slabs_created: l!(slabs_created),
        slabs_recycled: l!(slabs_recycled),
        repair_count: l!(repair_count),
        repair_reason_full_bitmap: l!(repair_reason_full_bitmap),
        repair_reason_list_mismatch: l!(repair_reason_list_mismatch),
        repair_reason_other: l!(repair_reason_other),
        double_free: l!(double_free),
        stale_handle: l!(stale_handle),
        unknown_slab: l!(unknown_slab),
        bad_slot: l!(bad_slot),
        epoch_close_calls: l!(epoch_close_calls),
        epoch_close_noop: l!(epoch_close_noop),
        epoch_close_scanned: l!(epoch_close_scanned),
        epoch_close_recycled: l!(epoch_close_recycled),
        epoch_close_nanos: l!(epoch_close_nanos),
        cache_stack_len: cache.stack_len,
        cache_stack_capacity: cache.stack_capacity,
        cache_overflow_len: cache.overflow_len,
        cache_pushes: cache.pushes,
        cache_pops: cache.pops,
        cache_overflows: cache.overflows,
        madvise_calls: cache.advise_calls,
        madvise_bytes: cache.advise_bytes,
        madvise_failures: cache.advise_failures,
        partial_slab_count,
        full_slab_count,
        scan_mode_randomized,
        scan_switches,
    }
}

/// Flat, point-in-time view of one (class, epoch slot) pair, for
/// `stats_epoch`.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    pub class_idx: usize,
    pub object_size: usize,
    pub epoch_id: u32,
    pub era: u64,
    pub lifecycle_closing: bool,
    pub open_since_secs: f64,
    pub alloc_count: u64,
    pub label: Option<String>,
    pub pre_close_rss_bytes: u64,
    pub post_close_rss_bytes: u64,
    pub partial_slab_count: usize,
    pub full_slab_count: usize,
    pub reclaimable_slab_count: usize,
    pub estimated_bytes: u64,
    pub reclaimable_bytes: u64,
}

/// Process-global aggregate view, for `stats_global`.
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    pub schema_version: u32,
    pub current_epoch: u32,
    pub active_slot_count: usize,
    pub closing_slot_count: usize,
    pub total_slabs_allocated: u64,
    pub total_slabs_recycled: u64,
    pub total_slow_path_hits: u64,
    pub total_cache_overflows: u64,
    pub slow_cache_miss: u64,
    pub slow_epoch_closed: u64,
    pub slow_current_partial_null: u64,
    pub slow_current_partial_full: u64,
    pub madvise_calls: u64,
    pub madvise_bytes: u64,
    pub madvise_failures: u64,
    pub epoch_close_calls: u64,
    pub epoch_close_scanned: u64,
    pub epoch_close_recycled: u64,
    pub epoch_close_nanos: u64,
    pub current_rss_bytes: u64,
}

/// External collaborator that supplies a current RSS reading. Reading
/// RSS from OS-specific procfs sources is explicitly out of scope (§1);
/// the default implementation reports zero, and embedders that want a
/// real reading plug one in via [`crate::allocator::SlabAllocator::with_rss_reader`].
pub trait RssReader: Send + Sync {
    fn current_rss_bytes(&self) -> u64;
}

pub struct NullRssReader;

impl RssReader for NullRssReader {
    fn current_rss_bytes(&self) -> u64 {
        0
    }
}
