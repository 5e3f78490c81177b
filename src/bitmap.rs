//! Lock-free bitmap slot allocator and adaptive scan controller (C4).
//!
//! A set bit means **free**. Claiming a slot clears a bit; releasing one
//! sets it. Both operations are word-granular CAS loops: acquire on read,
//! release on a successful CAS. The caller (the size-class engine, C5)
//! owns `free_count` and the slab's list-membership state machine; this
//! module only ever touches bitmap words.

use crate::slab::Slab;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicU64, Ordering};

/// Outcome of a successful [`claim_slot`] call, including the CAS
/// attempt/retry counts the caller folds into its per-class stats.
pub struct ClaimOutcome {
    pub slot: u32,
    pub attempts: u64,
    pub retries: u64,
}

/// Attempt to claim one free slot, scanning bitmap words starting at
/// `start_word` (mod word count) and wrapping around once. Returns `None`
/// if every word is already zero (the slab is full).
pub fn claim_slot(slab: &Slab, start_word: usize) -> Option<ClaimOutcome> {
    let word_count = slab.word_count();
    if word_count == 0 {
        return None;
    }
    let mut attempts = 0u64;
    let mut retries = 0u64;

    for i in 0..word_count {
        let idx = (start_word + i) % word_count;
        let word = slab.bitmap_word(idx);

        loop {
            let current = word.load(Ordering::Acquire);
            if current == 0 {
                break;
            }
            attempts += 1;
            let bit = current.trailing_zeros();
            let new_val = current & !(1 << bit);
            match word.compare_exchange_weak(
                current,
                new_val,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let slot = (idx as u32) * 32 + bit;
                    if slot < slab.object_count {
                        return Some(ClaimOutcome {
                            slot,
                            attempts,
                            retries,
                        });
                    }
                    // Bit belonged to the padding past object_count in the
                    // last word; put it back and treat the word as empty.
                    word.fetch_or(1 << bit, Ordering::Release);
                    break;
                }
                Err(_) => {
                    retries += 1;
                    continue;
                }
            }
        }
    }
    None
}

/// Outcome of a successful [`release_slot`] call: the free_count value
/// immediately before this release, which drives the size-class engine's
/// full/partial transition logic, plus CAS attempt/retry counts.
pub struct ReleaseOutcome {
    pub prev_free_count: u32,
    pub attempts: u64,
    pub retries: u64,
}

/// Release one slot back to the bitmap. Returns `Err(())` (double-free) if
/// the bit was already set.
pub fn release_slot(slab: &Slab, slot: u32) -> Result<ReleaseOutcome, ()> {
    let word_idx = (slot / 32) as usize;
    let bit = slot % 32;
    let word = slab.bitmap_word(word_idx);

    let mut attempts = 0u64;
    let mut retries = 0u64;
    loop {
        let current = word.load(Ordering::Acquire);
        if current & (1 << bit) != 0 {
            return Err(());
        }
        attempts += 1;
        let new_val = current | (1 << bit);
        match word.compare_exchange_weak(current, new_val, Ordering::Release, Ordering::Acquire) {
            Ok(_) => {
                let prev_free_count = slab.free_count.fetch_add(1, Ordering::AcqRel);
                return Ok(ReleaseOutcome {
                    prev_free_count,
                    attempts,
                    retries,
                });
            }
            Err(_) => {
                retries += 1;
                continue;
            }
        }
    }
}

/// Per-class scan mode: sequential is cache-friendly and correct for a
/// single thread; randomized spreads CAS contention across bitmap words
/// under concurrent load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanMode {
    Sequential = 0,
    Randomized = 1,
}

/// Hysteresis bands (retries per attempt, as a fraction scaled by 1000) at
/// which the controller flips mode. Upper band must exceed lower band so
/// the mode doesn't flap at the boundary.
const UPPER_BAND_PER_MILLE: u64 = 250;
const LOWER_BAND_PER_MILLE: u64 = 50;

/// Tracks observed CAS retry rate in a sliding window and switches between
/// [`ScanMode::Sequential`] and [`ScanMode::Randomized`] on hysteresis
/// bands. Exposes only the mode and the two window counters — no clocks.
pub struct ScanController {
    mode: AtomicU8,
    window_attempts: AtomicU64,
    window_retries: AtomicU64,
    switches: AtomicU64,
}

const WINDOW_SIZE: u64 = 256;

impl Default for ScanController {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanController {
    pub const fn new() -> Self {
        Self {
            mode: AtomicU8::new(ScanMode::Sequential as u8),
            window_attempts: AtomicU64::new(0),
            window_retries: AtomicU64::new(0),
            switches: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ScanMode {
        match self.mode.load(Ordering::Relaxed) {
            0 => ScanMode::Sequential,
            _ => ScanMode::Randomized,
        }
    }

    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Choose a starting bitmap word for the next scan, given the slab's
    /// word count.
    pub fn start_word(&self, word_count: usize) -> usize {
        if word_count == 0 {
            return 0;
        }
        match self.mode() {
            ScanMode::Sequential => 0,
            ScanMode::Randomized => thread_local_offset() as usize % word_count,
        }
    }

    /// Fold a completed claim/release's CAS attempt/retry counts into the
    /// sliding window, flipping mode when a hysteresis band is crossed.
    pub fn observe(&self, attempts: u64, retries: u64) {
        let total_attempts = self.window_attempts.fetch_add(attempts, Ordering::Relaxed) + attempts;
        let total_retries = self.window_retries.fetch_add(retries, Ordering::Relaxed) + retries;

        if total_attempts < WINDOW_SIZE {
            return;
        }

        let rate_per_mille = if total_attempts == 0 {
            0
        } else {
            total_retries.saturating_mul(1000) / total_attempts
        };

        let current = self.mode();
        let next = if rate_per_mille > UPPER_BAND_PER_MILLE {
            ScanMode::Randomized
        } else if rate_per_mille < LOWER_BAND_PER_MILLE {
            ScanMode::Sequential
        } else {
            current
        };

        if next != current {
            self.mode.store(next as u8, Ordering::Relaxed);
            self.switches.fetch_add(1, Ordering::Relaxed);
        }

        self.window_attempts.store(0, Ordering::Relaxed);
        self.window_retries.store(0, Ordering::Relaxed);
    }
}

thread_local! {
    static SCAN_COUNTER: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// A cheap thread-varying value for the randomized scan offset: a
/// per-thread monotonic counter run through a fixed multiplicative hash.
/// No thread identity is tracked or exposed — only the derived offset.
fn thread_local_offset() -> u64 {
    SCAN_COUNTER.with(|c| {
        let v = c.get().wrapping_add(1);
        c.set(v);
        v.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    })
}
