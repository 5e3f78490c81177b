//! Top-level composition root (C9): wires the size-class array, the
//! epoch ring, and the slab registry into the single entry point
//! embedders construct.
//!
//! This module owns no allocation logic of its own — every operation is a
//! thin dispatch into [`crate::class`], [`crate::epoch`], or
//! [`crate::registry`]. Its job is composition, lifetime (`Drop` hands
//! every cached page back to the OS), and the few operations (resolving a
//! handle to its owning class, epoch close timing) that genuinely span
//! more than one of those modules.

use crate::class::SizeClass;
use crate::config;
use crate::epoch::{EpochId, EpochRing, Lifecycle};
use crate::error::AllocError;
use crate::handle::Handle;
use crate::registry::{Registry, ResolveError};
use crate::size_class;
use crate::stats::{
    self, ClassCounters, ClassStats, EpochStats, GlobalStats, NullRssReader, RssReader,
};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// The allocator. One instance typically lives for the lifetime of the
/// process (or the embedding subsystem using it); `Drop` releases every
/// page it is still holding in a cache back to the OS.
///
/// Size classes are indexed exactly as [`crate::size_class`] indexes
/// them — index 0 is the unused sentinel, so `classes[1..]` are the real
/// classes.
pub struct SlabAllocator {
    classes: Vec<SizeClass>,
    epoch_ring: EpochRing,
    registry: Registry,
    rss_reader: Box<dyn RssReader>,
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator {
    pub fn new() -> Self {
        let ring_width = config::EPOCH_RING_WIDTH;
        let classes = (0..size_class::NUM_SIZE_CLASSES)
            .map(|idx| {
                let info = size_class::class_info(idx);
                SizeClass::new(idx, info.size as u32, info.objects_per_slab as u32, info.cache_capacity, ring_width)
            })
            .collect();

        Self {
            classes,
            epoch_ring: EpochRing::new(),
            registry: Registry::new(),
            rss_reader: Box::new(NullRssReader),
        }
    }

    /// Plug in a real RSS reader (§1/§6 leave reading process RSS to the
    /// embedder; the default reports zero everywhere).
    #[must_use]
    pub fn with_rss_reader(mut self, reader: impl RssReader + 'static) -> Self {
        self.rss_reader = Box::new(reader);
        self
    }

    fn class_for_size(&self, size: usize) -> Result<usize, AllocError> {
        size_class::size_to_class(size).ok_or(AllocError::SizeTooLarge)
    }

    /// Allocate one object of `size` bytes in `epoch`.
    pub fn alloc_obj(&self, size: usize, epoch: EpochId) -> Result<(std::ptr::NonNull<u8>, Handle), AllocError> {
        let class_idx = self.class_for_size(size)?;
        self.classes[class_idx].alloc_in_epoch(epoch, &self.epoch_ring, &self.registry)
    }

    /// Free a previously-allocated object by its handle.
    pub fn free_obj(&self, handle: Handle) -> Result<(), AllocError> {
        let slab_ptr = match self.registry.resolve(handle.slab_id(), handle.generation()) {
            Ok(p) => p,
            Err(ResolveError::UnknownSlab) => return Err(AllocError::UnknownSlab(handle.slab_id())),
            Err(ResolveError::StaleHandle { expected_gen, found_gen }) => {
                return Err(AllocError::StaleHandle {
                    slab_id: handle.slab_id(),
                    expected_gen,
                    found_gen,
                });
            }
        };
        // Class sizes are configured strictly increasing (build.rs), so a
        // slab's stamped object_size inverts to exactly one class.
        let object_size = unsafe { slab_ptr.as_ref() }.object_size as usize;
        let class_idx = size_class::size_to_class(object_size)
            .expect("a live slab's object_size always matches a configured class");
        self.classes[class_idx].free_by_handle(handle, &self.epoch_ring, &self.registry)
    }

    /// The currently-active epoch.
    pub fn epoch_current(&self) -> EpochId {
        self.epoch_ring.current()
    }

    /// Advance the ring: the current slot transitions to CLOSING, the
    /// next slot becomes ACTIVE at a fresh era, and every class's
    /// bookkeeping for that slot is reset (§9a). Returns the newly-active
    /// epoch id.
    pub fn epoch_advance(&self) -> EpochId {
        let next = self.epoch_ring.advance();
        for class in self.classes.iter().skip(1) {
            class.reset_epoch_slot(next, &self.registry);
        }
        next
    }

    /// Close `epoch`: mark it CLOSING (no-op if already CLOSING) and sweep
    /// every class's partial list for empties, handing them to their
    /// caches. Safe to call repeatedly; only the first call per era does
    /// any sweeping.
    pub fn epoch_close(&self, epoch: EpochId) {
        let pre_rss = self.rss_reader.current_rss_bytes();
        self.epoch_ring.record_pre_close_rss(epoch, pre_rss);

        if !self.epoch_ring.begin_close(epoch) {
            for class in self.classes.iter().skip(1) {
                ClassCounters::inc(&class.counters.epoch_close_noop);
            }
            return;
        }

        let start = Instant::now();
        for class in self.classes.iter().skip(1) {
            class.close_epoch_scan(epoch, &self.registry);
        }
        let nanos = start.elapsed().as_nanos() as u64;
        for class in self.classes.iter().skip(1) {
            ClassCounters::add(&class.counters.epoch_close_nanos, nanos);
        }

        let post_rss = self.rss_reader.current_rss_bytes();
        self.epoch_ring.record_post_close_rss(epoch, post_rss);
    }

    pub fn epoch_set_label(&self, epoch: EpochId, label: impl Into<String>) {
        self.epoch_ring.set_label(epoch, label);
    }

    pub fn epoch_domain_enter(&self, epoch: EpochId) -> u32 {
        self.epoch_ring.domain_enter(epoch)
    }

    pub fn epoch_domain_exit(&self, epoch: EpochId) -> u32 {
        self.epoch_ring.domain_exit(epoch)
    }

    /// Process-wide aggregate snapshot.
    pub fn stats_global(&self) -> GlobalStats {
        let mut g = GlobalStats {
            schema_version: stats::SCHEMA_VERSION,
            current_epoch: self.epoch_ring.current(),
            current_rss_bytes: self.rss_reader.current_rss_bytes(),
            ..Default::default()
        };

        for id in 0..self.epoch_ring.width() as EpochId {
            match self.epoch_ring.slot(id).lifecycle() {
                Lifecycle::Active => g.active_slot_count += 1,
                Lifecycle::Closing => g.closing_slot_count += 1,
            }
        }

        for class in self.classes.iter().skip(1) {
            let c = &class.counters;
            g.total_slabs_allocated += c.slabs_created.load(Ordering::Relaxed);
            g.total_slabs_recycled += c.slabs_recycled.load(Ordering::Relaxed);
            g.total_slow_path_hits += c.slow_path_hits.load(Ordering::Relaxed);
            g.slow_cache_miss += c.slow_cache_miss.load(Ordering::Relaxed);
            g.slow_epoch_closed += c.slow_epoch_closed.load(Ordering::Relaxed);
            g.slow_current_partial_null += c.slow_current_partial_null.load(Ordering::Relaxed);
            g.slow_current_partial_full += c.slow_current_partial_full.load(Ordering::Relaxed);
            g.epoch_close_calls += c.epoch_close_calls.load(Ordering::Relaxed);
            g.epoch_close_scanned += c.epoch_close_scanned.load(Ordering::Relaxed);
            g.epoch_close_recycled += c.epoch_close_recycled.load(Ordering::Relaxed);
            g.epoch_close_nanos += c.epoch_close_nanos.load(Ordering::Relaxed);

            let cache = class.cache_counts();
            g.total_cache_overflows += cache.overflows;
            g.madvise_calls += cache.advise_calls;
            g.madvise_bytes += cache.advise_bytes;
            g.madvise_failures += cache.advise_failures;
        }

        g
    }

    /// Snapshot of one class's counters, cache occupancy, and scan state.
    pub fn stats_class(&self, class_idx: usize) -> Option<ClassStats> {
        if class_idx == 0 {
            return None;
        }
        let class = self.classes.get(class_idx)?;
        let epoch = self.epoch_ring.current();
        let (partial, full) = class.epoch_slab_counts(epoch);
        Some(stats::class_stats_from_counters(
            class_idx,
            class.object_size as usize,
            &class.counters,
            class.cache_counts(),
            partial,
            full,
            class.scan_mode_randomized(),
            class.scan_switches(),
        ))
    }

    /// Snapshot every configured class.
    pub fn stats_classes(&self) -> Vec<ClassStats> {
        (1..self.classes.len())
            .filter_map(|idx| self.stats_class(idx))
            .collect()
    }

    /// Snapshot one class's view of `epoch`: its occupancy, reclaimable
    /// footprint, and the epoch slot's lifecycle/label/RSS bookkeeping.
    pub fn stats_epoch(&self, class_idx: usize, epoch: EpochId) -> Option<EpochStats> {
        if class_idx == 0 {
            return None;
        }
        let class = self.classes.get(class_idx)?;
        let slot = self.epoch_ring.slot(epoch);
        let (partial, full) = class.epoch_slab_counts(epoch);
        let alloc_count = class.alloc_count(epoch);
        let object_size = class.object_size as u64;
        let objects_per_slab = class.object_count as u64;

        // Partial slabs are assumed candidates for eventual reclaim; full
        // slabs are not (they hold no free slots to give back). This is
        // an estimate, not a precise byte accounting (§6).
        let estimated_bytes = (partial as u64 + full as u64) * objects_per_slab * object_size;
        let reclaimable_bytes = partial as u64 * objects_per_slab * object_size;

        Some(EpochStats {
            class_idx,
            object_size: object_size as usize,
            epoch_id: epoch,
            era: slot.era(),
            lifecycle_closing: slot.lifecycle() == Lifecycle::Closing,
            open_since_secs: slot.open_since().elapsed().as_secs_f64(),
            alloc_count,
            label: slot.label(),
            pre_close_rss_bytes: slot.pre_close_rss(),
            post_close_rss_bytes: slot.post_close_rss(),
            partial_slab_count: partial,
            full_slab_count: full,
            reclaimable_slab_count: partial,
            estimated_bytes,
            reclaimable_bytes,
        })
    }

    /// Every class's view of `epoch`, in class order.
    pub fn stats_epoch_all_classes(&self, epoch: EpochId) -> Vec<EpochStats> {
        (1..self.classes.len())
            .filter_map(|idx| self.stats_epoch(idx, epoch))
            .collect()
    }

    /// This thread's sampled timing buckets (§4.8). Always available
    /// (empty buckets) even when the `sampling` feature is disabled.
    pub fn stats_thread(&self) -> crate::sampling::ThreadSamples {
        crate::sampling::current_thread_samples()
    }

    /// Number of slab ids ever minted (live + retired).
    pub fn registry_capacity(&self) -> usize {
        self.registry.capacity()
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        for class in self.classes.iter().skip(1) {
            class.drain_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let alloc = SlabAllocator::new();
        let epoch = alloc.epoch_current();
        let (ptr, handle) = alloc.alloc_obj(100, epoch).expect("alloc");
        unsafe { *ptr.as_ptr() = 7 };
        alloc.free_obj(handle).expect("free");
    }

    #[test]
    fn oversized_request_is_rejected() {
        let alloc = SlabAllocator::new();
        let epoch = alloc.epoch_current();
        let huge = size_class::class_to_size(size_class::NUM_SIZE_CLASSES - 1) + 1;
        assert_eq!(alloc.alloc_obj(huge, epoch), Err(AllocError::SizeTooLarge));
    }

    #[test]
    fn global_stats_reflect_allocations() {
        let alloc = SlabAllocator::new();
        let epoch = alloc.epoch_current();
        for _ in 0..5 {
            alloc.alloc_obj(64, epoch).expect("alloc");
        }
        let snap = alloc.stats_global();
        assert_eq!(snap.total_slabs_allocated, 1, "five 64-byte objects fit one slab");
        assert_eq!(snap.active_slot_count, alloc.epoch_ring.width());
    }

    #[test]
    fn epoch_close_on_active_epoch_is_idempotent() {
        let alloc = SlabAllocator::new();
        let epoch = alloc.epoch_current();
        alloc.epoch_close(epoch);
        alloc.epoch_close(epoch);
        let num_real_classes = (size_class::NUM_SIZE_CLASSES - 1) as u64;
        let global = alloc.stats_global();
        assert_eq!(global.epoch_close_calls, num_real_classes, "second close is a no-op, not a re-scan");
    }

    #[test]
    fn closed_epoch_rejects_new_allocations_but_not_other_epochs() {
        let alloc = SlabAllocator::new();
        let e0 = alloc.epoch_current();
        alloc.epoch_close(e0);
        assert_eq!(alloc.alloc_obj(64, e0), Err(AllocError::EpochClosed));

        let e1 = alloc.epoch_advance();
        assert!(alloc.alloc_obj(64, e1).is_ok());
    }

    #[test]
    fn epoch_close_after_advancing_past_it_still_sweeps_drainable_empties() {
        let alloc = SlabAllocator::new();
        let e0 = alloc.epoch_current();
        let class_idx = size_class::size_to_class(64).expect("a 64-byte class is configured");
        let object_count = alloc.classes[class_idx].object_count as usize;

        // Fill one slab completely (so it moves off current_partial onto
        // the full list) and free every slot again (full -> partial ->
        // fully-empty-but-still-on-the-partial-list, since e0 is still
        // ACTIVE and this class doesn't eager-recycle outside CLOSING).
        let mut handles = Vec::with_capacity(object_count);
        for _ in 0..object_count {
            let (_, h) = alloc.alloc_obj(64, e0).expect("alloc");
            handles.push(h);
        }
        for h in handles {
            alloc.free_obj(h).expect("free");
        }

        // Move the ring cursor past e0 without ever closing it — advance()
        // alone must not have already marked e0 CLOSING (that would make
        // the close() below a permanent no-op).
        alloc.epoch_advance();

        let before = alloc.stats_global();
        alloc.epoch_close(e0);
        let after = alloc.stats_global();

        assert!(
            after.epoch_close_scanned > before.epoch_close_scanned,
            "close() on an advanced-past epoch must still scan its partial list"
        );
        assert!(
            after.epoch_close_recycled > before.epoch_close_recycled,
            "the empty slab left on e0's partial list must be recycled by close(), not silently skipped"
        );
    }

    #[test]
    fn epoch_stats_report_partial_occupancy_while_closing() {
        let alloc = SlabAllocator::new();
        let epoch = alloc.epoch_current();
        let (_, h1) = alloc.alloc_obj(64, epoch).expect("alloc");
        let (_, _h2) = alloc.alloc_obj(64, epoch).expect("alloc");
        alloc.epoch_close(epoch);
        alloc.free_obj(h1).expect("free");

        let snap = alloc.stats_epoch(1, epoch).expect("class 1 exists");
        assert!(snap.lifecycle_closing);
        assert!(snap.estimated_bytes > 0);
    }
}
