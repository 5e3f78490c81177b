//! Epoch manager: ring of epoch slots, era stamping, lifecycle transitions
//! (C6).
//!
//! The ring has a fixed width (`config::EPOCH_RING_WIDTH`). Each slot's
//! lifecycle oscillates ACTIVE -> CLOSING -> (on `advance` wrapping back to
//! it) ACTIVE again at the next era. The era counter is what lets an
//! observer tell two different occupants of the same ring index apart —
//! see `DESIGN.md`/`SPEC_FULL.md` §9a for how a slab's own stamped era
//! (not the ring slot's *current* era) governs `free_obj`'s behavior once
//! a slot has moved on.

use crate::config::EPOCH_RING_WIDTH;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Active = 0,
    Closing = 1,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Active,
            1 => Lifecycle::Closing,
            other => panic!("corrupt epoch lifecycle state {other}"),
        }
    }
}

/// Process-global metadata for one ring slot: lifecycle, era, label,
/// domain refcount, timestamps, and RSS snapshots. Per-class partial/full
/// lists and `current_partial` live in the size-class engine's own
/// per-(class, slot) epoch state, keyed by this same ring index.
pub struct EpochSlot {
    lifecycle: AtomicU8,
    era: AtomicU64,
    refcount: AtomicU32,
    open_since: std::sync::Mutex<Instant>,
    label: std::sync::Mutex<Option<String>>,
    pre_close_rss: AtomicU64,
    post_close_rss: AtomicU64,
}

impl EpochSlot {
    fn new() -> Self {
        Self {
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            era: AtomicU64::new(0),
            refcount: AtomicU32::new(0),
            open_since: std::sync::Mutex::new(Instant::now()),
            label: std::sync::Mutex::new(None),
            pre_close_rss: AtomicU64::new(0),
            post_close_rss: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    #[inline]
    pub fn era(&self) -> u64 {
        self.era.load(Ordering::Acquire)
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> Option<String> {
        self.label.lock().unwrap().clone()
    }

    pub fn open_since(&self) -> Instant {
        *self.open_since.lock().unwrap()
    }

    pub fn pre_close_rss(&self) -> u64 {
        self.pre_close_rss.load(Ordering::Relaxed)
    }

    pub fn post_close_rss(&self) -> u64 {
        self.post_close_rss.load(Ordering::Relaxed)
    }
}

/// A stable identifier for one ring slot. Does not carry the era; callers
/// that need to disambiguate ring wraparound read `EpochRing::era_of`.
pub type EpochId = u32;

/// Fixed-width ring of epoch slots plus the monotonic `current_epoch`
/// cursor.
pub struct EpochRing {
    slots: Vec<EpochSlot>,
    current: AtomicU32,
    global_era: AtomicU64,
}

impl Default for EpochRing {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochRing {
    pub fn new() -> Self {
        let slots = (0..EPOCH_RING_WIDTH).map(|_| EpochSlot::new()).collect();
        Self {
            slots,
            current: AtomicU32::new(0),
            global_era: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, id: EpochId) -> &EpochSlot {
        &self.slots[id as usize % self.slots.len()]
    }

    /// The currently-active ring index.
    #[inline]
    pub fn current(&self) -> EpochId {
        self.current.load(Ordering::Acquire)
    }

    /// Move `current` to `(current + 1) mod width`. This only drives the
    /// newly-entered slot's transition — era bumped, lifecycle reset to
    /// ACTIVE, `open_since` stamped. The vacated slot's lifecycle is left
    /// untouched: per the state machine, ACTIVE -> CLOSING happens solely
    /// via [`Self::begin_close`]/`close()`, not as a side effect of the
    /// ring cursor moving past it (a vacated-but-not-yet-closed epoch may
    /// still legally accept new allocations). Readers that observe the new
    /// `(slot, era)` pair are guaranteed never to observe the prior
    /// occupant's era again for this index (era only moves forward).
    pub fn advance(&self) -> EpochId {
        let prev = self.current.load(Ordering::Acquire);
        let next = (prev + 1) % self.slots.len() as u32;

        let next_slot = &self.slots[next as usize];
        let new_era = self.global_era.fetch_add(1, Ordering::AcqRel);
        next_slot.era.store(new_era, Ordering::Release);
        next_slot.refcount.store(0, Ordering::Relaxed);
        *next_slot.label.lock().unwrap() = None;
        next_slot.pre_close_rss.store(0, Ordering::Relaxed);
        next_slot.post_close_rss.store(0, Ordering::Relaxed);
        *next_slot.open_since.lock().unwrap() = Instant::now();
        // Era precedes the lifecycle flip to ACTIVE so no allocator can
        // observe ACTIVE with a stale era (§5 ordering guarantee 4).
        next_slot.lifecycle.store(Lifecycle::Active as u8, Ordering::Release);

        self.current.store(next, Ordering::Release);
        tracing::debug!(prev, next, era = new_era, "epoch ring advanced");
        next
    }

    /// Mark `epoch` CLOSING. No-op (but counted by the caller) if it is
    /// already CLOSING.
    pub fn begin_close(&self, epoch: EpochId) -> bool {
        let slot = self.slot(epoch);
        let was_active = slot
            .lifecycle
            .compare_exchange(
                Lifecycle::Active as u8,
                Lifecycle::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if was_active {
            tracing::debug!(epoch, era = slot.era(), "epoch closing");
        }
        was_active
    }

    pub fn set_label(&self, epoch: EpochId, label: impl Into<String>) {
        *self.slot(epoch).label.lock().unwrap() = Some(label.into());
    }

    pub fn domain_enter(&self, epoch: EpochId) -> u32 {
        let slot = self.slot(epoch);
        slot.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn domain_exit(&self, epoch: EpochId) -> u32 {
        let slot = self.slot(epoch);
        let prev = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "domain_exit underflowed refcount for epoch {epoch}");
        prev.saturating_sub(1)
    }

    pub fn record_pre_close_rss(&self, epoch: EpochId, rss: u64) {
        self.slot(epoch).pre_close_rss.store(rss, Ordering::Relaxed);
    }

    pub fn record_post_close_rss(&self, epoch: EpochId, rss: u64) {
        self.slot(epoch).post_close_rss.store(rss, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_slot_zero_active_era_zero_indexed() {
        let ring = EpochRing::new();
        assert_eq!(ring.current(), 0);
        assert_eq!(ring.slot(0).lifecycle(), Lifecycle::Active);
    }

    #[test]
    fn advance_wraps_and_bumps_era() {
        let ring = EpochRing::new();
        let width = ring.width();
        let era0 = ring.slot(0).era();

        for _ in 0..width {
            ring.advance();
        }
        assert_eq!(ring.current(), 0);
        assert!(ring.slot(0).era() > era0, "era must strictly increase on reactivation");
    }

    #[test]
    fn advance_leaves_vacated_slot_active_until_explicitly_closed() {
        let ring = EpochRing::new();
        ring.advance();
        assert_eq!(
            ring.slot(0).lifecycle(),
            Lifecycle::Active,
            "advance() alone must not close the slot it moved away from"
        );
        assert_eq!(ring.slot(1).lifecycle(), Lifecycle::Active);
        assert!(ring.begin_close(0), "the vacated slot must still be closable on its own");
    }

    #[test]
    fn begin_close_on_already_closing_is_noop() {
        let ring = EpochRing::new();
        assert!(ring.begin_close(0));
        assert!(!ring.begin_close(0));
    }

    #[test]
    fn domain_enter_exit_track_refcount() {
        let ring = EpochRing::new();
        ring.set_label(0, "request-123");
        assert_eq!(ring.domain_enter(0), 1);
        assert_eq!(ring.domain_enter(0), 2);
        assert_eq!(ring.domain_exit(0), 1);
        assert_eq!(ring.slot(0).label().as_deref(), Some("request-123"));
    }

    #[test]
    fn reactivation_resets_label_and_refcount() {
        let ring = EpochRing::new();
        ring.set_label(0, "wave-a");
        ring.domain_enter(0);
        for _ in 0..ring.width() {
            ring.advance();
        }
        assert_eq!(ring.slot(0).label(), None);
        assert_eq!(ring.slot(0).refcount(), 0);
    }
}
