//! Slab registry: dense slab-id -> (pointer, generation) table (C7).
//!
//! Slabs never hold back-pointers to the class or epoch that own them —
//! the cyclic graph between slab, size-class engine, and epoch state is
//! broken by routing every stable reference through this table instead.
//! The registry grows but never shrinks; retired ids are recycled from a
//! free-id stack so long-running allocators don't grow it unboundedly.

use crate::slab::Slab;
use crate::sync::SpinMutex;
use std::ptr::NonNull;

/// One registry slot: the slab currently occupying this id, and the
/// generation a handle must match to be considered live.
#[derive(Clone, Copy)]
struct Entry {
    ptr: Option<NonNull<Slab>>,
    generation: u32,
}

// `Entry` is only ever touched under `Registry::inner`'s lock.
unsafe impl Send for Entry {}

struct Inner {
    entries: Vec<Entry>,
    free_ids: Vec<u32>,
}

/// Growable slab-id -> (pointer, generation) table.
///
/// The registry's own lock is held only while allocating/retiring an id or
/// bumping a generation — never across payload access or OS calls (§5).
pub struct Registry {
    inner: SpinMutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: SpinMutex::new(Inner {
                entries: Vec::new(),
                free_ids: Vec::new(),
            }),
        }
    }

    /// Allocate a fresh slab id, reusing a retired one when available.
    /// Returns the id and the generation the caller should stamp into the
    /// newly-initialized slab.
    pub fn allocate_id(&self) -> (u32, u32) {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free_ids.pop() {
            let entry = &mut inner.entries[id as usize];
            entry.generation = entry.generation.wrapping_add(1);
            let gen = entry.generation;
            (id, gen)
        } else {
            let id = inner.entries.len() as u32;
            inner.entries.push(Entry {
                ptr: None,
                generation: 0,
            });
            (id, 0)
        }
    }

    /// Publish the pointer for `id` once the slab has been initialized.
    /// Called while the id's entry still carries the generation handed
    /// back by [`Self::allocate_id`].
    pub fn publish(&self, id: u32, slab: NonNull<Slab>) {
        let mut inner = self.inner.lock();
        inner.entries[id as usize].ptr = Some(slab);
    }

    /// Retire `id`: clear its pointer, bump its generation (invalidating
    /// every handle minted against the previous occupant), and return the
    /// id to the free stack for reuse.
    pub fn retire_id(&self, id: u32) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[id as usize];
        entry.ptr = None;
        entry.generation = entry.generation.wrapping_add(1);
        inner.free_ids.push(id);
    }

    /// Resolve `(slab_id, generation)` to a live slab pointer.
    ///
    /// Errors: `UnknownSlab` if `slab_id` was never allocated, `StaleHandle`
    /// if the generation does not match the entry's current generation
    /// (the slab has since been recycled or retired).
    pub fn resolve(&self, slab_id: u32, generation: u32) -> Result<NonNull<Slab>, ResolveError> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(slab_id as usize)
            .ok_or(ResolveError::UnknownSlab)?;
        if entry.generation != generation || entry.ptr.is_none() {
            return Err(ResolveError::StaleHandle {
                expected_gen: entry.generation,
                found_gen: generation,
            });
        }
        Ok(entry.ptr.unwrap())
    }

    /// Number of ids ever minted (live + retired), for stats snapshots.
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    UnknownSlab,
    StaleHandle { expected_gen: u32, found_gen: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_source;

    fn fresh_slab(slab_id: u32, generation: u32) -> NonNull<Slab> {
        let page = page_source::acquire_page().expect("acquire_page");
        let slab = unsafe { Slab::init(page, 64, 10, 0, 1, slab_id) };
        unsafe { slab.as_ref() }.generation.store(generation, std::sync::atomic::Ordering::Relaxed);
        slab
    }

    #[test]
    fn allocate_then_resolve_round_trips() {
        let reg = Registry::new();
        let (id, gen) = reg.allocate_id();
        let slab = fresh_slab(id, gen);
        reg.publish(id, slab);

        let resolved = reg.resolve(id, gen).expect("resolve should succeed");
        assert_eq!(resolved.as_ptr(), slab.as_ptr());
    }

    #[test]
    fn unknown_slab_id_is_reported() {
        let reg = Registry::new();
        assert_eq!(reg.resolve(99, 0), Err(ResolveError::UnknownSlab));
    }

    #[test]
    fn stale_generation_is_reported() {
        let reg = Registry::new();
        let (id, gen) = reg.allocate_id();
        let slab = fresh_slab(id, gen);
        reg.publish(id, slab);

        reg.retire_id(id);
        let (id2, gen2) = reg.allocate_id();
        assert_eq!(id2, id, "retired id should be reused");
        assert_ne!(gen2, gen, "generation must advance on reuse");

        match reg.resolve(id, gen) {
            Err(ResolveError::StaleHandle { .. }) => {}
            other => panic!("expected StaleHandle, got {other:?}"),
        }
    }

    #[test]
    fn retired_id_without_republish_reports_stale() {
        let reg = Registry::new();
        let (id, gen) = reg.allocate_id();
        let slab = fresh_slab(id, gen);
        reg.publish(id, slab);
        reg.retire_id(id);

        match reg.resolve(id, gen) {
            Err(ResolveError::StaleHandle { .. }) => {}
            other => panic!("expected StaleHandle, got {other:?}"),
        }
    }
}
