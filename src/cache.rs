//! Per-size-class slab cache: a bounded stack of empty pages plus an
//! unbounded overflow list, backed by the page source for misses (C3).
//!
//! The cache holds raw pages, not live slabs — a page sitting in the cache
//! has no valid registry id (the caller retires it before pushing and
//! allocates a fresh id after popping, per §4.5/§4.7). `Slab::init`, not
//! this module, re-prepares the header on reuse.

use crate::page_source;
use crate::sync::SpinMutex;
use std::ptr::NonNull;

struct Inner {
    stack: Vec<NonNull<u8>>,
    overflow: Vec<NonNull<u8>>,
    capacity: usize,
}

// Raw page pointers sitting idle in the cache carry no aliasing.
unsafe impl Send for Inner {}

/// Per-class bookkeeping the cache exposes to stats snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounts {
    pub stack_len: usize,
    pub stack_capacity: usize,
    pub overflow_len: usize,
    pub pushes: u64,
    pub pops: u64,
    pub overflows: u64,
    pub page_source_misses: u64,
    pub advise_calls: u64,
    pub advise_bytes: u64,
    pub advise_failures: u64,
}

pub struct SlabCache {
    inner: SpinMutex<Inner>,
    pushes: std::sync::atomic::AtomicU64,
    pops: std::sync::atomic::AtomicU64,
    overflows: std::sync::atomic::AtomicU64,
    page_source_misses: std::sync::atomic::AtomicU64,
    advise_calls: std::sync::atomic::AtomicU64,
    advise_bytes: std::sync::atomic::AtomicU64,
    advise_failures: std::sync::atomic::AtomicU64,
}

use std::sync::atomic::Ordering;

impl SlabCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: SpinMutex::new(Inner {
                stack: Vec::with_capacity(capacity),
                overflow: Vec::new(),
                capacity,
            }),
            pushes: Default::default(),
            pops: Default::default(),
            overflows: Default::default(),
            page_source_misses: Default::default(),
            advise_calls: Default::default(),
            advise_bytes: Default::default(),
            advise_failures: Default::default(),
        }
    }

    /// Push an empty page into the cache, advising the kernel it is
    /// unused. Overflows into the unbounded secondary list once the
    /// bounded stack is full; an overflow push still advises but is
    /// counted separately so the snapshot can report both tiers.
    ///
    /// # Safety
    /// `page` must be page-aligned, page-sized, and not referenced by any
    /// live handle.
    pub unsafe fn push(&self, page: NonNull<u8>) {
        self.advise(page);
        let mut inner = self.inner.lock();
        if inner.stack.len() < inner.capacity {
            inner.stack.push(page);
        } else {
            inner.overflow.push(page);
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        self.pushes.fetch_add(1, Ordering::Relaxed);
    }

    fn advise(&self, page: NonNull<u8>) {
        self.advise_calls.fetch_add(1, Ordering::Relaxed);
        let ok = unsafe { page_source::advise_unused(page) };
        if ok {
            self.advise_bytes
                .fetch_add(crate::config::PAGE_SIZE as u64, Ordering::Relaxed);
        } else {
            self.advise_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("advise_unused failed for cached page");
        }
    }

    /// Pop a page from the cache (stack first, then overflow), falling
    /// through to the page source on a full miss. Returns `None` only if
    /// the page source itself is out of memory.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        {
            let mut inner = self.inner.lock();
            if let Some(p) = inner.stack.pop() {
                self.pops.fetch_add(1, Ordering::Relaxed);
                return Some(p);
            }
            if let Some(p) = inner.overflow.pop() {
                self.pops.fetch_add(1, Ordering::Relaxed);
                return Some(p);
            }
        }
        self.page_source_misses.fetch_add(1, Ordering::Relaxed);
        page_source::acquire_page()
    }

    /// Drain every page held by the cache back to the OS. Called from the
    /// top-level allocator's `Drop`.
    pub fn drain_to_os(&self) {
        let mut inner = self.inner.lock();
        for page in inner.stack.drain(..).chain(inner.overflow.drain(..)) {
            unsafe { page_source::release_page(page) };
        }
    }

    pub fn counts(&self) -> CacheCounts {
        let inner = self.inner.lock();
        CacheCounts {
            stack_len: inner.stack.len(),
            stack_capacity: inner.capacity,
            overflow_len: inner.overflow.len(),
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            page_source_misses: self.page_source_misses.load(Ordering::Relaxed),
            advise_calls: self.advise_calls.load(Ordering::Relaxed),
            advise_bytes: self.advise_bytes.load(Ordering::Relaxed),
            advise_failures: self.advise_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_on_empty_cache_falls_through_to_page_source() {
        let cache = SlabCache::new(2);
        let page = cache.pop().expect("page source should supply a page");
        assert_eq!(cache.counts().page_source_misses, 1);
        unsafe { page_source::release_page(page) };
    }

    #[test]
    fn push_then_pop_round_trips_within_capacity() {
        let cache = SlabCache::new(2);
        let page = page_source::acquire_page().unwrap();
        unsafe { cache.push(page) };
        assert_eq!(cache.counts().stack_len, 1);

        let popped = cache.pop().unwrap();
        assert_eq!(popped.as_ptr(), page.as_ptr());
        assert_eq!(cache.counts().stack_len, 0);
        unsafe { page_source::release_page(popped) };
    }

    #[test]
    fn pushes_past_capacity_overflow() {
        let cache = SlabCache::new(1);
        let pages: Vec<_> = (0..3).map(|_| page_source::acquire_page().unwrap()).collect();
        for &p in &pages {
            unsafe { cache.push(p) };
        }
        let counts = cache.counts();
        assert_eq!(counts.stack_len, 1);
        assert_eq!(counts.overflow_len, 2);
        assert_eq!(counts.overflows, 2);

        for _ in 0..3 {
            let p = cache.pop().unwrap();
            unsafe { page_source::release_page(p) };
        }
    }

    #[test]
    fn drain_releases_everything() {
        let cache = SlabCache::new(4);
        for _ in 0..3 {
            let p = page_source::acquire_page().unwrap();
            unsafe { cache.push(p) };
        }
        cache.drain_to_os();
        assert_eq!(cache.counts().stack_len, 0);
        assert_eq!(cache.counts().overflow_len, 0);
    }
}
