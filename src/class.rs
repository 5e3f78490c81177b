//! Size-class engine (C5): current-partial fast path, bitmap CAS slot
//! claim, zombie-partial repair, and the partial/full list slow path.
//!
//! One [`SizeClass`] per configured size. A single coarse [`SpinLock`]
//! (grounded on `central_free_list.rs`'s per-class `SpinMutex`) guards
//! every epoch slot's partial/full lists for this class; it is acquired
//! only for list reshuffles and cache pops/pushes, mirroring the donor's
//! `*_dropping_lock` idiom of releasing the lock before any OS call.

use crate::bitmap::{self, ScanController};
use crate::cache::SlabCache;
use crate::epoch::{EpochId, EpochRing, Lifecycle};
use crate::error::AllocError;
use crate::handle::Handle;
use crate::registry::{Registry, ResolveError};
use crate::sampling::{self, RepairReason};
use crate::slab::{ListId, Slab};
use crate::stats::ClassCounters;
use crate::sync::SpinLock;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// A doubly-linked intrusive list of slabs, mirroring the donor's
/// `SpanList` so removal of an arbitrary member is O(1).
struct SlabList {
    head: *mut Slab,
    count: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            count: 0,
        }
    }

    /// # Safety
    /// `slab` must not already be linked into any list.
    unsafe fn push(&mut self, slab: *mut Slab) {
        unsafe {
            *(*slab).next.get() = self.head;
            *(*slab).prev.get() = std::ptr::null_mut();
            if !self.head.is_null() {
                *(*self.head).prev.get() = slab;
            }
            self.head = slab;
            self.count += 1;
        }
    }

    /// # Safety
    /// `slab` must currently be linked into this list.
    unsafe fn remove(&mut self, slab: *mut Slab) {
        unsafe {
            let prev = *(*slab).prev.get();
            let next = *(*slab).next.get();
            if !prev.is_null() {
                *(*prev).next.get() = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                *(*next).prev.get() = prev;
            }
            *(*slab).prev.get() = std::ptr::null_mut();
            *(*slab).next.get() = std::ptr::null_mut();
            self.count -= 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

// Only ever mutated while the owning `SizeClass::lock` is held.
unsafe impl Send for SlabList {}

struct EpochLists {
    partial: SlabList,
    full: SlabList,
}

impl EpochLists {
    const fn new() -> Self {
        Self {
            partial: SlabList::new(),
            full: SlabList::new(),
        }
    }
}

/// Lock-free-readable half of one (class, epoch-slot) pair's state: the
/// current-partial pointer and the allocation counter. The list halves
/// ([`EpochLists`]) live alongside these, guarded by the class lock.
struct EpochAtomics {
    current_partial: AtomicPtr<Slab>,
    alloc_count: AtomicU64,
}

impl EpochAtomics {
    const fn new() -> Self {
        Self {
            current_partial: AtomicPtr::new(std::ptr::null_mut()),
            alloc_count: AtomicU64::new(0),
        }
    }
}

enum SlowOutcome {
    Installed,
    OutOfMemory,
}

pub struct SizeClass {
    pub class_idx: usize,
    pub object_size: u32,
    pub object_count: u32,
    lock: SpinLock,
    epoch_atomics: Vec<EpochAtomics>,
    epoch_lists: std::cell::UnsafeCell<Vec<EpochLists>>,
    cache: SlabCache,
    scan: ScanController,
    pub counters: ClassCounters,
}

// `epoch_lists` is only touched while `lock` is held; everything else is
// already atomic or internally synchronized.
unsafe impl Sync for SizeClass {}

impl SizeClass {
    pub fn new(class_idx: usize, object_size: u32, object_count: u32, cache_capacity: usize, ring_width: usize) -> Self {
        Self {
            class_idx,
            object_size,
            object_count,
            lock: SpinLock::new(),
            epoch_atomics: (0..ring_width).map(|_| EpochAtomics::new()).collect(),
            epoch_lists: std::cell::UnsafeCell::new((0..ring_width).map(|_| EpochLists::new()).collect()),
            cache: SlabCache::new(cache_capacity),
            scan: ScanController::new(),
            counters: ClassCounters::default(),
        }
    }

    /// Acquire the class lock, bumping the trylock contention probe
    /// (§4.8): a non-blocking attempt first, falling back to the blocking
    /// path only on contention.
    fn acquire_lock(&self) -> LockGuard<'_> {
        if self.lock.try_lock() {
            ClassCounters::inc(&self.counters.lock_fast_acquire);
        } else {
            ClassCounters::inc(&self.counters.lock_contended);
            self.lock.lock();
        }
        LockGuard { class: self }
    }

    #[inline]
    fn epoch_idx(&self, epoch: EpochId) -> usize {
        epoch as usize % self.epoch_atomics.len()
    }

    #[allow(clippy::mut_from_ref)]
    fn epoch_lists_mut(&self, epoch: EpochId) -> &mut EpochLists {
        let idx = self.epoch_idx(epoch);
        unsafe { &mut (*self.epoch_lists.get())[idx] }
    }

    /// Allocate one object in `epoch`. See `SPEC_FULL.md` §4.4.
    pub fn alloc_in_epoch(
        &self,
        epoch: EpochId,
        ring: &EpochRing,
        registry: &Registry,
    ) -> Result<(NonNull<u8>, Handle), AllocError> {
        loop {
            let slot = ring.slot(epoch);
            if slot.lifecycle() == Lifecycle::Closing {
                ClassCounters::inc(&self.counters.slow_path_hits);
                ClassCounters::inc(&self.counters.slow_epoch_closed);
                return Err(AllocError::EpochClosed);
            }

            let atomics = &self.epoch_atomics[self.epoch_idx(epoch)];
            let cp = atomics.current_partial.load(Ordering::Acquire);

            if cp.is_null() {
                ClassCounters::inc(&self.counters.slow_path_hits);
                ClassCounters::inc(&self.counters.slow_current_partial_null);
            } else {
                let slab = unsafe { &*cp };
                let start = self.scan.start_word(slab.word_count());
                match bitmap::claim_slot(slab, start) {
                    Some(outcome) => {
                        self.scan.observe(outcome.attempts, outcome.retries);
                        ClassCounters::add(&self.counters.cas_attempts_alloc, outcome.attempts);
                        ClassCounters::add(&self.counters.cas_retries_alloc, outcome.retries);

                        let prev_free = slab.free_count.fetch_sub(1, Ordering::AcqRel);
                        debug_assert!(prev_free > 0, "claimed a slot on a slab free_count said was full");

                        let sample = sampling::begin();
                        if prev_free == 1 {
                            self.move_current_partial_to_full(atomics, cp, slab);
                        }
                        sampling::finish_allocation(sample);

                        ClassCounters::inc(&self.counters.allocations);
                        atomics.alloc_count.fetch_add(1, Ordering::Relaxed);

                        let handle = Handle::encode(
                            slab.slab_id,
                            slab.generation.load(Ordering::Relaxed),
                            outcome.slot,
                        );
                        return Ok((slab.slot_ptr(outcome.slot), handle));
                    }
                    None => {
                        if slab.free_count.load(Ordering::Acquire) > 0 {
                            self.repair_zombie(atomics, cp);
                            continue;
                        }
                        ClassCounters::inc(&self.counters.slow_path_hits);
                        ClassCounters::inc(&self.counters.slow_current_partial_full);
                    }
                }
            }

            match self.alloc_slow(epoch, atomics, ring, registry) {
                SlowOutcome::Installed => continue,
                SlowOutcome::OutOfMemory => return Err(AllocError::OutOfMemory),
            }
        }
    }

    /// Last decrement of `free_count` reaching zero: move the slab from
    /// current-partial to the full list. Exactly one thread ever observes
    /// `prev_free == 1`, so this never races itself.
    fn move_current_partial_to_full(&self, atomics: &EpochAtomics, cp: *mut Slab, slab: &Slab) {
        let _g = self.acquire_lock();
        let swapped = atomics
            .current_partial
            .compare_exchange(cp, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(swapped.is_ok(), "current_partial changed out from under its sole owner");
        unsafe { slab.set_list_id(ListId::Full) };
        let lists = self.epoch_lists_mut(slab.epoch_index);
        unsafe { lists.full.push(cp) };
        ClassCounters::inc(&self.counters.list_move_partial_to_full);
    }

    /// A bitmap scan found the slab full while `free_count` still claimed
    /// a slot was available: the classic zombie-partial race (§4.4 step
    /// 4). Resolve it by re-checking under the class lock and, if still
    /// inconsistent, performing the same full-transition the normal path
    /// would have done.
    fn repair_zombie(&self, atomics: &EpochAtomics, cp: *mut Slab) {
        let sample = sampling::begin();
        let g = self.acquire_lock();
        // Re-check under the lock: another thread may have already
        // repaired or legitimately transitioned this slab.
        if atomics.current_partial.load(Ordering::Acquire) == cp {
            let slab = unsafe { &*cp };
            if slab.bitmap_is_full() {
                atomics.current_partial.store(std::ptr::null_mut(), Ordering::Release);
                unsafe { slab.set_list_id(ListId::Full) };
                let lists = self.epoch_lists_mut(slab.epoch_index);
                unsafe { lists.full.push(cp) };
                ClassCounters::inc(&self.counters.repair_count);
                ClassCounters::inc(&self.counters.repair_reason_full_bitmap);
                tracing::debug!(class = self.class_idx, "zombie-partial repaired: full_bitmap");
                drop(g);
                sampling::finish_repair(sample, RepairReason::FullBitmap);
                return;
            }
        }
        drop(g);
        sampling::finish_repair(sample, RepairReason::Other);
    }

    fn alloc_slow(
        &self,
        epoch: EpochId,
        atomics: &EpochAtomics,
        ring: &EpochRing,
        registry: &Registry,
    ) -> SlowOutcome {
        loop {
            {
                let _g = self.acquire_lock();
                let lists = self.epoch_lists_mut(epoch);
                if !lists.partial.is_empty() {
                    let slab_ptr = lists.partial.head;
                    unsafe { lists.partial.remove(slab_ptr) };
                    let slab = unsafe { &*slab_ptr };
                    ClassCounters::inc(&self.counters.current_partial_cas_attempts);
                    match atomics.current_partial.compare_exchange(
                        std::ptr::null_mut(),
                        slab_ptr,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            unsafe { slab.set_list_id(ListId::None) };
                            return SlowOutcome::Installed;
                        }
                        Err(_) => {
                            ClassCounters::inc(&self.counters.current_partial_cas_failures);
                            unsafe { slab.set_list_id(ListId::Partial) };
                            unsafe { lists.partial.push(slab_ptr) };
                            drop(_g);
                            continue;
                        }
                    }
                }
            }

            // Partial list empty: get a page without holding the class
            // lock, mirroring the donor's `remove_range_dropping_lock`.
            let Some(page) = self.cache.pop() else {
                return SlowOutcome::OutOfMemory;
            };
            if self.cache.counts().page_source_misses > 0 {
                ClassCounters::inc(&self.counters.slow_cache_miss);
            }

            let (id, generation) = registry.allocate_id();
            let slot = ring.slot(epoch);
            let era = slot.era();
            let slab_ptr = unsafe {
                Slab::init(page, self.object_size, self.object_count, epoch, era, id)
            };
            unsafe { slab_ptr.as_ref().generation.store(generation, Ordering::Relaxed) };
            registry.publish(id, slab_ptr);
            ClassCounters::inc(&self.counters.slabs_created);

            let g = self.acquire_lock();
            let slab = unsafe { slab_ptr.as_ref() };
            ClassCounters::inc(&self.counters.current_partial_cas_attempts);
            match atomics.current_partial.compare_exchange(
                std::ptr::null_mut(),
                slab_ptr.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    drop(g);
                    return SlowOutcome::Installed;
                }
                Err(_) => {
                    ClassCounters::inc(&self.counters.current_partial_cas_failures);
                    unsafe { slab.set_list_id(ListId::Partial) };
                    let lists = self.epoch_lists_mut(epoch);
                    unsafe { lists.partial.push(slab_ptr.as_ptr()) };
                    drop(g);
                }
            }
        }
    }

    /// Free one object by handle. See `SPEC_FULL.md` §4.4.
    pub fn free_by_handle(
        &self,
        handle: Handle,
        ring: &EpochRing,
        registry: &Registry,
    ) -> Result<(), AllocError> {
        let slab_ptr = match registry.resolve(handle.slab_id(), handle.generation()) {
            Ok(p) => p,
            Err(ResolveError::UnknownSlab) => {
                ClassCounters::inc(&self.counters.unknown_slab);
                return Err(AllocError::UnknownSlab(handle.slab_id()));
            }
            Err(ResolveError::StaleHandle { expected_gen, found_gen }) => {
                ClassCounters::inc(&self.counters.stale_handle);
                return Err(AllocError::StaleHandle {
                    slab_id: handle.slab_id(),
                    expected_gen,
                    found_gen,
                });
            }
        };
        let slab = unsafe { slab_ptr.as_ref() };
        slab.check_magic();

        if handle.slot_index() >= slab.object_count {
            ClassCounters::inc(&self.counters.bad_slot);
            return Err(AllocError::BadSlot);
        }

        let outcome = match bitmap::release_slot(slab, handle.slot_index()) {
            Ok(o) => o,
            Err(()) => {
                ClassCounters::inc(&self.counters.double_free);
                return Err(AllocError::DoubleFree);
            }
        };
        ClassCounters::add(&self.counters.cas_attempts_free, outcome.attempts);
        ClassCounters::add(&self.counters.cas_retries_free, outcome.retries);
        ClassCounters::inc(&self.counters.frees);

        let atomics = &self.epoch_atomics[self.epoch_idx(slab.epoch_index)];

        if outcome.prev_free_count == 0 {
            self.move_full_to_partial(slab_ptr, slab);
        }

        let new_free_count = outcome.prev_free_count + 1;
        if new_free_count == slab.object_count {
            let slot = ring.slot(slab.epoch_index);
            // §9a: a slab whose stamped era no longer matches the ring
            // slot's current era has had its epoch unambiguously move on
            // (the slot was reset for reuse, §4.6/`reset_epoch_slot`) —
            // always eager-recycle. Otherwise apply the documented
            // policy: recycle only while the (still-current) epoch is
            // CLOSING, leave ACTIVE epochs' empties for close() to sweep.
            let recycle_now = slab.era != slot.era() || slot.lifecycle() == Lifecycle::Closing;
            if recycle_now {
                self.recycle_if_empty(atomics, slab_ptr, slab, registry);
            }
        }

        Ok(())
    }

    fn move_full_to_partial(&self, slab_ptr: NonNull<Slab>, slab: &Slab) {
        let _g = self.acquire_lock();
        match slab.list_id() {
            ListId::Full => {
                let lists = self.epoch_lists_mut(slab.epoch_index);
                unsafe { lists.full.remove(slab_ptr.as_ptr()) };
                unsafe { slab.set_list_id(ListId::Partial) };
                unsafe { lists.partial.push(slab_ptr.as_ptr()) };
                ClassCounters::inc(&self.counters.list_move_full_to_partial);
            }
            other => {
                // The slab wasn't where the free_count transition implied
                // (e.g. it was already swept out by `reset_epoch_slot`).
                // Self-heal: leave its list membership as-is and record
                // why, rather than double-link it.
                ClassCounters::inc(&self.counters.repair_count);
                ClassCounters::inc(&self.counters.repair_reason_list_mismatch);
                tracing::debug!(class = self.class_idx, observed = ?other, "zombie-partial repaired: list_mismatch");
            }
        }
    }

    fn recycle_if_empty(
        &self,
        atomics: &EpochAtomics,
        slab_ptr: NonNull<Slab>,
        slab: &Slab,
        registry: &Registry,
    ) {
        {
            let _g = self.acquire_lock();
            let _ = atomics.current_partial.compare_exchange(
                slab_ptr.as_ptr(),
                std::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            match slab.list_id() {
                ListId::Partial => {
                    let lists = self.epoch_lists_mut(slab.epoch_index);
                    unsafe { lists.partial.remove(slab_ptr.as_ptr()) };
                }
                ListId::None | ListId::Cache => {}
                ListId::Full => unreachable!("a just-freed slot can't still show Full"),
            }
            unsafe { slab.set_list_id(ListId::Cache) };
            ClassCounters::inc(&self.counters.list_move_partial_to_cache);
        }
        registry.retire_id(slab.slab_id);
        ClassCounters::inc(&self.counters.slabs_recycled);
        let page = NonNull::new(slab_ptr.as_ptr() as *mut u8).expect("slab pointer is page-aligned and non-null");
        unsafe { self.cache.push(page) };
    }

    /// Drain an epoch's partial list of fully-empty slabs, handing each to
    /// the cache. Called by `epoch_close` (§4.6); never touches the full
    /// list (a full slab is never empty by construction).
    pub fn close_epoch_scan(&self, epoch: EpochId, registry: &Registry) -> (u64, u64) {
        let mut to_recycle: Vec<NonNull<Slab>> = Vec::new();
        let scanned;
        {
            let _g = self.acquire_lock();
            let atomics = &self.epoch_atomics[self.epoch_idx(epoch)];
            let lists = self.epoch_lists_mut(epoch);
            scanned = lists.partial.count as u64;
            let mut cur = lists.partial.head;
            while !cur.is_null() {
                let next = unsafe { *(*cur).next.get() };
                let slab = unsafe { &*cur };
                if slab.free_count.load(Ordering::Acquire) == slab.object_count {
                    unsafe { lists.partial.remove(cur) };
                    let _ = atomics.current_partial.compare_exchange(
                        cur,
                        std::ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    unsafe { slab.set_list_id(ListId::Cache) };
                    to_recycle.push(NonNull::new(cur).unwrap());
                }
                cur = next;
            }
        }

        let recycled = to_recycle.len() as u64;
        for slab_ptr in to_recycle {
            let slab = unsafe { slab_ptr.as_ref() };
            registry.retire_id(slab.slab_id);
            ClassCounters::inc(&self.counters.slabs_recycled);
            let page = NonNull::new(slab_ptr.as_ptr() as *mut u8).unwrap();
            unsafe { self.cache.push(page) };
        }

        ClassCounters::add(&self.counters.epoch_close_calls, 1);
        ClassCounters::add(&self.counters.epoch_close_scanned, scanned);
        ClassCounters::add(&self.counters.epoch_close_recycled, recycled);
        (scanned, recycled)
    }

    /// Clear this class's bookkeeping for `epoch` as the ring slot is
    /// reactivated for a new era (§9a / `DESIGN.md`). Fully-empty slabs
    /// still sitting in the old era's lists are recycled; anything still
    /// holding live objects (retained handles) is orphaned from list
    /// bookkeeping — `free_by_handle` still resolves and frees it
    /// directly via the registry, and eager-recycles it the moment it
    /// empties, since its stamped era will no longer match the slot's.
    pub fn reset_epoch_slot(&self, epoch: EpochId, registry: &Registry) {
        let mut to_recycle: Vec<NonNull<Slab>> = Vec::new();
        {
            let _g = self.acquire_lock();
            let atomics = &self.epoch_atomics[self.epoch_idx(epoch)];
            let old_cp = atomics.current_partial.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !old_cp.is_null() {
                self.orphan_or_collect(old_cp, &mut to_recycle);
            }

            let lists = self.epoch_lists_mut(epoch);
            let mut cur = lists.partial.head;
            while !cur.is_null() {
                let next = unsafe { *(*cur).next.get() };
                self.orphan_or_collect(cur, &mut to_recycle);
                cur = next;
            }
            let mut cur = lists.full.head;
            while !cur.is_null() {
                let next = unsafe { *(*cur).next.get() };
                unsafe { (*cur).set_list_id(ListId::None) };
                cur = next;
            }
            lists.partial = SlabList::new();
            lists.full = SlabList::new();
            atomics.alloc_count.store(0, Ordering::Relaxed);
        }

        for slab_ptr in to_recycle {
            let slab = unsafe { slab_ptr.as_ref() };
            registry.retire_id(slab.slab_id);
            ClassCounters::inc(&self.counters.slabs_recycled);
            let page = NonNull::new(slab_ptr.as_ptr() as *mut u8).unwrap();
            unsafe { self.cache.push(page) };
        }
    }

    /// Held under the class lock: if `slab` is already fully empty,
    /// collect it for recycling by the caller (once the lock is
    /// dropped); otherwise mark it orphaned (no longer tracked by any
    /// list) so only a direct free can ever touch it again.
    fn orphan_or_collect(&self, slab_ptr: *mut Slab, to_recycle: &mut Vec<NonNull<Slab>>) {
        let slab = unsafe { &*slab_ptr };
        if slab.free_count.load(Ordering::Acquire) == slab.object_count {
            unsafe { slab.set_list_id(ListId::Cache) };
            to_recycle.push(NonNull::new(slab_ptr).unwrap());
        } else {
            unsafe { slab.set_list_id(ListId::None) };
        }
    }

    pub fn cache_counts(&self) -> crate::cache::CacheCounts {
        self.cache.counts()
    }

    pub fn scan_mode_randomized(&self) -> bool {
        matches!(self.scan.mode(), crate::bitmap::ScanMode::Randomized)
    }

    pub fn scan_switches(&self) -> u64 {
        self.scan.switches()
    }

    /// Partial/full slab counts for `epoch`, for stats snapshots. The
    /// partial count includes the current-partial slab, if any — it
    /// holds free slots exactly like a list-linked partial slab, it just
    /// isn't linked into the list while it's the active fast-path target.
    pub fn epoch_slab_counts(&self, epoch: EpochId) -> (usize, usize) {
        let _g = self.acquire_lock();
        let atomics = &self.epoch_atomics[self.epoch_idx(epoch)];
        let lists = self.epoch_lists_mut(epoch);
        let has_current = !atomics.current_partial.load(Ordering::Acquire).is_null();
        (lists.partial.count + has_current as usize, lists.full.count)
    }

    pub fn alloc_count(&self, epoch: EpochId) -> u64 {
        self.epoch_atomics[self.epoch_idx(epoch)]
            .alloc_count
            .load(Ordering::Relaxed)
    }

    /// Drain this class's cache back to the OS. Called from the top-level
    /// allocator's `Drop`.
    pub fn drain_cache(&self) {
        self.cache.drain_to_os();
    }
}

struct LockGuard<'a> {
    class: &'a SizeClass,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.class.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn make_class(object_count: u32) -> SizeClass {
        SizeClass::new(1, 64, object_count, 4, 4)
    }

    #[test]
    fn single_alloc_then_free_round_trips() {
        let class = make_class(10);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let (ptr, handle) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
        unsafe { *ptr.as_ptr() = 0xAB };
        assert_eq!(class.counters.allocations.load(Ordering::Relaxed), 1);

        class.free_by_handle(handle, &ring, &registry).expect("free");
        assert_eq!(class.counters.frees.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn alloc_fills_slab_then_moves_to_full_list() {
        let class = make_class(4);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (_, h) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
            handles.push(h);
        }
        assert_eq!(class.counters.list_move_partial_to_full.load(Ordering::Relaxed), 1);

        for h in handles {
            class.free_by_handle(h, &ring, &registry).expect("free");
        }
        assert_eq!(class.counters.list_move_full_to_partial.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn epoch_closed_rejects_allocation() {
        let class = make_class(4);
        let ring = EpochRing::new();
        let registry = Registry::new();

        ring.begin_close(0);
        let err = class.alloc_in_epoch(0, &ring, &registry).unwrap_err();
        assert_eq!(err, AllocError::EpochClosed);
        assert_eq!(class.counters.slow_epoch_closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn closing_epoch_still_accepts_frees_and_recycles_empties() {
        let class = make_class(4);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let (_, h) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
        ring.begin_close(0);
        class.free_by_handle(h, &ring, &registry).expect("free into closing epoch");
        assert_eq!(class.cache_counts().pushes, 1, "empty slab should eagerly recycle while CLOSING");
    }

    #[test]
    fn active_epoch_leaves_empty_slab_on_partial_list() {
        let class = make_class(4);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let (_, h) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
        class.free_by_handle(h, &ring, &registry).expect("free");
        assert_eq!(class.cache_counts().pushes, 0, "ACTIVE epoch should not eager-recycle");
        let (partial, _) = class.epoch_slab_counts(0);
        assert_eq!(partial, 1, "the empty slab is still current_partial, just not list-linked");
    }

    #[test]
    fn double_free_is_reported() {
        let class = make_class(4);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let (_, h) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
        class.free_by_handle(h, &ring, &registry).expect("first free");
        let err = class.free_by_handle(h, &ring, &registry).unwrap_err();
        assert_eq!(err, AllocError::DoubleFree);
    }

    #[test]
    fn stale_handle_after_recycle_is_reported() {
        let class = make_class(1);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let (_, h) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
        ring.begin_close(0);
        class.free_by_handle(h, &ring, &registry).expect("free triggers eager recycle");

        // Recycle means the page was handed to the cache and its id
        // retired; resolving the old handle must now fail.
        match class.free_by_handle(h, &ring, &registry) {
            Err(AllocError::StaleHandle { .. }) => {}
            other => panic!("expected StaleHandle, got {other:?}"),
        }
    }

    #[test]
    fn reactivated_epoch_orphans_retained_slab_and_still_frees_it() {
        let class = make_class(4);
        let ring = EpochRing::new();
        let registry = Registry::new();

        let (_, h) = class.alloc_in_epoch(0, &ring, &registry).expect("alloc");
        // Wrap the whole ring so slot 0 is reactivated at a new era
        // without the caller ever calling epoch_close(0).
        for _ in 0..ring.width() {
            let next = ring.advance();
            class.reset_epoch_slot(next, &registry);
        }

        // The old slab (era n) is no longer in any list, but the handle
        // still resolves and frees correctly, eager-recycling because its
        // stamped era no longer matches slot 0's current era.
        class.free_by_handle(h, &ring, &registry).expect("stale-era slab still frees");
        assert_eq!(class.cache_counts().pushes, 1);
    }
}

/// Property tests pinning the quantified invariants of `SPEC_FULL.md` §8
/// (popcount/free_count agreement and list-id consistency) over randomized
/// alloc/free sequences against a single class and epoch.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::registry::Registry;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Alloc,
        Free(usize),
    }

    fn op_sequence() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![
                Just(Op::Alloc),
                (0usize..64).prop_map(Op::Free),
            ],
            1..200,
        )
    }

    /// After every operation, every slab a live class still knows about
    /// (current-partial, or linked into a partial/full list) must satisfy
    /// popcount(free bits) == free_count (invariant 1) and must carry the
    /// list_id its actual residence implies (invariant 2).
    fn check_quiescent_invariants(class: &SizeClass, epoch: EpochId) {
        let _g = class.acquire_lock();
        let atomics = &class.epoch_atomics[class.epoch_idx(epoch)];
        let cp = atomics.current_partial.load(Ordering::Acquire);
        if !cp.is_null() {
            let slab = unsafe { &*cp };
            assert_eq!(
                slab.bitmap_popcount(),
                slab.free_count.load(Ordering::Acquire),
                "current_partial slab violates popcount == free_count"
            );
        }

        let lists = class.epoch_lists_mut(epoch);
        let mut cur = lists.partial.head;
        while !cur.is_null() {
            let slab = unsafe { &*cur };
            assert_eq!(
                slab.bitmap_popcount(),
                slab.free_count.load(Ordering::Acquire),
                "partial-list slab violates popcount == free_count"
            );
            assert_eq!(slab.list_id(), ListId::Partial, "partial-list slab has wrong list_id");
            cur = unsafe { *slab.next.get() };
        }
        let mut cur = lists.full.head;
        while !cur.is_null() {
            let slab = unsafe { &*cur };
            assert_eq!(
                slab.free_count.load(Ordering::Acquire),
                0,
                "full-list slab has a free slot"
            );
            assert_eq!(slab.list_id(), ListId::Full, "full-list slab has wrong list_id");
            cur = unsafe { *slab.next.get() };
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn popcount_and_list_id_stay_consistent(ops in op_sequence()) {
            let class = SizeClass::new(1, 64, 8, 4, 4);
            let ring = EpochRing::new();
            let registry = Registry::new();
            let mut live = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc => {
                        if let Ok((_, h)) = class.alloc_in_epoch(0, &ring, &registry) {
                            live.push(h);
                        }
                    }
                    Op::Free(idx) => {
                        if !live.is_empty() {
                            let h = live.remove(idx % live.len());
                            class.free_by_handle(h, &ring, &registry).unwrap();
                        }
                    }
                }
                check_quiescent_invariants(&class, 0);
            }

            for h in live {
                class.free_by_handle(h, &ring, &registry).unwrap();
            }
        }
    }
}
