//! Thread-local 1/1024 sampled wall+CPU timing tier (C8).
//!
//! Entirely per-thread: nothing here is ever shared across threads, and
//! nothing here calls a clock unless the `sampling` feature is enabled —
//! disabling the feature removes every clock call from the allocation
//! path, not just their reporting, per §4.8.

use std::cell::RefCell;
use std::time::Instant;

/// Reason a repair was triggered, for the per-thread repair tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairReason {
    FullBitmap,
    ListMismatch,
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimingBucket {
    pub count: u64,
    pub wall_ns_sum: u64,
    pub wall_ns_max: u64,
    pub cpu_ns_sum: u64,
    pub cpu_ns_max: u64,
    pub wait_ns_sum: u64,
    pub wait_ns_max: u64,
}

impl TimingBucket {
    fn record(&mut self, wall_ns: u64, cpu_ns: u64) {
        let wait_ns = wall_ns.saturating_sub(cpu_ns);
        self.count += 1;
        self.wall_ns_sum += wall_ns;
        self.wall_ns_max = self.wall_ns_max.max(wall_ns);
        self.cpu_ns_sum += cpu_ns;
        self.cpu_ns_max = self.cpu_ns_max.max(cpu_ns);
        self.wait_ns_sum += wait_ns;
        self.wait_ns_max = self.wait_ns_max.max(wait_ns);
    }
}

/// A snapshot of one thread's sampled timings, returned by
/// [`current_thread_samples`]. Never shared with any other thread;
/// aggregation across threads is left to the embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSamples {
    pub allocation: TimingBucket,
    pub repair_full_bitmap: TimingBucket,
    pub repair_list_mismatch: TimingBucket,
    pub repair_other: TimingBucket,
}

struct ThreadState {
    counter: u32,
    samples: ThreadSamples,
}

thread_local! {
    static STATE: RefCell<ThreadState> = RefCell::new(ThreadState {
        counter: 0,
        samples: ThreadSamples::default(),
    });
}

/// Sampling gate: true on roughly 1/1024 calls (low 10 bits of a
/// per-thread counter are zero). Always advances the counter even when
/// the `sampling` feature is compiled out, so behavior under the feature
/// flag differs only in whether a clock is ever read.
#[inline]
fn should_sample() -> bool {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.counter = s.counter.wrapping_add(1);
        s.counter & 0x3FF == 0
    })
}

#[inline]
fn cpu_time_ns() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
            ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
        } else {
            0
        }
    }
}

/// A started sample, or `None` if this call was not selected (or the
/// `sampling` feature is disabled). Holding the guard costs nothing
/// beyond the gate check when not sampling.
pub struct Sample {
    #[cfg(feature = "sampling")]
    start_wall: Instant,
    #[cfg(feature = "sampling")]
    start_cpu_ns: u64,
}

/// Begin a sample for the current operation, gated at 1/1024.
#[inline]
pub fn begin() -> Option<Sample> {
    #[cfg(feature = "sampling")]
    {
        if !should_sample() {
            return None;
        }
        Some(Sample {
            start_wall: Instant::now(),
            start_cpu_ns: cpu_time_ns(),
        })
    }
    #[cfg(not(feature = "sampling"))]
    {
        None
    }
}

/// Finish an allocation sample, folding it into this thread's allocation
/// bucket.
#[inline]
pub fn finish_allocation(sample: Option<Sample>) {
    #[cfg(feature = "sampling")]
    if let Some(sample) = sample {
        let wall_ns = sample.start_wall.elapsed().as_nanos() as u64;
        let cpu_ns = cpu_time_ns().saturating_sub(sample.start_cpu_ns);
        STATE.with(|s| s.borrow_mut().samples.allocation.record(wall_ns, cpu_ns));
    }
    #[cfg(not(feature = "sampling"))]
    let _ = sample;
}

/// Finish a repair sample, folding it into the bucket for `reason`.
#[inline]
pub fn finish_repair(sample: Option<Sample>, reason: RepairReason) {
    #[cfg(feature = "sampling")]
    if let Some(sample) = sample {
        let wall_ns = sample.start_wall.elapsed().as_nanos() as u64;
        let cpu_ns = cpu_time_ns().saturating_sub(sample.start_cpu_ns);
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            let bucket = match reason {
                RepairReason::FullBitmap => &mut s.samples.repair_full_bitmap,
                RepairReason::ListMismatch => &mut s.samples.repair_list_mismatch,
                RepairReason::Other => &mut s.samples.repair_other,
            };
            bucket.record(wall_ns, cpu_ns);
        });
    }
    #[cfg(not(feature = "sampling"))]
    {
        let _ = (sample, reason);
    }
}

/// Collect the calling thread's samples so far. Per §9, global aggregation
/// across threads is the embedder's responsibility, not this crate's.
pub fn current_thread_samples() -> ThreadSamples {
    STATE.with(|s| s.borrow().samples)
}
