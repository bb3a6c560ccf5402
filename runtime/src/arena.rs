// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Kind-labelled allocation.
//!
//! The Arena hands out memory stamped with a [`Kind`] and can answer
//! "which allocator owns this pointer?" in O(1) via the
//! [`KindMapper`]. Two interchangeable backends:
//!
//! - **Pools** (production): one `talc` pool per kind. The pool's
//!   out-of-memory handler is the extent hook: it maps fresh 2 MiB
//!   aligned extents, stamps them in the kind map, and claims them into
//!   the pool, so every OS reservation is labelled before any object
//!   lives in it.
//! - **Malloc** (debug/sanitizer): the global allocator plus red zones,
//!   with a sorted side table keyed by address; `memory_kind` does a
//!   predecessor lookup. Frees of unknown pointers abort.
//!
//! Obstack slabs do not go through the pools; the obstack maps them
//! directly and registers the range here (see `obstack::chunk`).

use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::Arc;

use talc::{OomHandler, Span, Talc, Talck};

use crate::kind_mapper::{KindMapper, SLAB_SIZE};
use crate::page;
use crate::util::round_up;
use crate::{Error, Result};

/// Which allocator a region of memory belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum Kind {
    Unknown = 0,
    /// Interned object storage.
    IObj = 1,
    /// Large obstack allocations, each with its own header.
    Large = 2,
    /// Obstack chunk slabs.
    Obstack = 3,
}

impl Kind {
    pub fn from_bits(bits: u8) -> Kind {
        match bits & 3 {
            1 => Kind::IObj,
            2 => Kind::Large,
            3 => Kind::Obstack,
            _ => Kind::Unknown,
        }
    }
}

/// Extent hook for a pool: maps kind-stamped 2 MiB extents on demand.
struct ExtentHooks {
    kind: Kind,
    mapper: Arc<KindMapper>,
    extents: Vec<(NonNull<u8>, usize)>,
}

// Safety: the extent list is only mutated under the pool lock.
unsafe impl Send for ExtentHooks {}

impl OomHandler for ExtentHooks {
    fn handle_oom(talc: &mut Talc<Self>, layout: Layout) -> core::result::Result<(), ()> {
        // Room for the request plus pool metadata, in whole slabs.
        let needed = layout.size() + layout.align() + 128;
        let len = round_up(needed.max(SLAB_SIZE), SLAB_SIZE);
        let base = page::map_aligned(len, SLAB_SIZE).map_err(|_| ())?;

        let hooks = &mut talc.oom_handler;
        hooks
            .mapper
            .set(base.as_ptr() as usize, base.as_ptr() as usize + len, hooks.kind);
        hooks.extents.push((base, len));
        log::trace!(
            "arena {:?}: claimed {len} byte extent at {:p}",
            hooks.kind,
            base.as_ptr()
        );

        // Safety: the extent was just mapped, is exclusively ours, and is
        // handed to the pool in full.
        unsafe { talc.claim(Span::from_base_size(base.as_ptr(), len)) }.map(|_| ())
    }
}

type Pool = Talck<spin::Mutex<()>, ExtentHooks>;

fn new_pool(kind: Kind, mapper: Arc<KindMapper>) -> Pool {
    Talc::new(ExtentHooks {
        kind,
        mapper,
        extents: Vec::new(),
    })
    .lock()
}

struct Pools {
    iobj: Pool,
    large: Pool,
}

impl Pools {
    fn pool(&self, kind: Kind) -> &Pool {
        match kind {
            Kind::IObj => &self.iobj,
            Kind::Large => &self.large,
            // Obstack memory is slab-granular and never pool-allocated.
            _ => unreachable!("no pool for {kind:?}"),
        }
    }
}

impl Drop for Pools {
    fn drop(&mut self) {
        for pool in [&self.iobj, &self.large] {
            let mut guard = pool.lock();
            let extents = core::mem::take(&mut guard.oom_handler.extents);
            let mapper = guard.oom_handler.mapper.clone();
            drop(guard);
            for (base, len) in extents {
                let addr = base.as_ptr() as usize;
                mapper.erase(addr, addr + len);
                // Safety: the extent was mapped by `handle_oom` and the
                // pool that carved it up is gone.
                unsafe { page::unmap(base, len) };
            }
        }
    }
}

#[derive(Clone, Copy)]
struct MemInfo {
    size: usize,
    /// Red-zone bytes before the returned pointer; zero for regions that
    /// were registered rather than allocated.
    offset: usize,
    align: usize,
    kind: Kind,
}

impl MemInfo {
    fn is_arena_allocated(&self) -> bool {
        self.offset != 0
    }
}

/// Malloc-backed debug arena: every pointer in a sorted side table.
#[derive(Default)]
struct MallocState {
    known: spin::Mutex<BTreeMap<usize, MemInfo>>,
}

impl MallocState {
    fn alloc_aligned(&self, size: usize, align: usize, kind: Kind) -> Result<NonNull<u8>> {
        let offset = align.max(16);
        let layout = Layout::from_size_align(size + 2 * offset, offset).unwrap();
        // Safety: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let Some(raw) = NonNull::new(raw) else {
            return Err(Error::OutOfMemory);
        };
        // Safety: `offset` is inside the allocation; red zones surround
        // the returned block.
        let p = unsafe { raw.add(offset) };
        self.known.lock().insert(
            p.as_ptr() as usize,
            MemInfo {
                size,
                offset,
                align: offset,
                kind,
            },
        );
        Ok(p)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _layout: Layout) {
        let info = self
            .known
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .unwrap_or_else(|| panic!("freeing unknown or already-freed pointer {ptr:p}"));
        assert!(info.is_arena_allocated(), "freeing a registered region");
        let raw_layout = Layout::from_size_align(info.size + 2 * info.offset, info.align).unwrap();
        // Safety: reverses the computation in `alloc_aligned`.
        unsafe { std::alloc::dealloc(ptr.as_ptr().sub(info.offset), raw_layout) };
    }

    fn memory_kind(&self, addr: usize) -> Kind {
        let known = self.known.lock();
        match known.range(..=addr).next_back() {
            Some((&base, info)) if addr - base < info.size => info.kind,
            _ => Kind::Unknown,
        }
    }

    fn register(&self, start: usize, end: usize, kind: Kind) {
        self.known.lock().insert(
            start,
            MemInfo {
                size: end - start,
                offset: 0,
                align: 0,
                kind,
            },
        );
    }

    fn unregister(&self, start: usize, end: usize) {
        let info = self
            .known
            .lock()
            .remove(&start)
            .expect("unregistering unknown region");
        assert!(!info.is_arena_allocated() && info.size == end - start);
    }
}

impl Drop for MallocState {
    fn drop(&mut self) {
        let known = core::mem::take(self.known.get_mut());
        for (addr, info) in known {
            if info.is_arena_allocated() {
                let layout =
                    Layout::from_size_align(info.size + 2 * info.offset, info.align).unwrap();
                // Safety: the block was allocated by `alloc_aligned` and
                // never freed.
                unsafe { std::alloc::dealloc((addr - info.offset) as *mut u8, layout) };
            }
        }
    }
}

enum Backend {
    Pools(Pools),
    Malloc(MallocState),
}

pub struct Arena {
    backend: Backend,
    mapper: Arc<KindMapper>,
}

impl Arena {
    pub fn new(mapper: Arc<KindMapper>, malloc_backend: bool) -> Self {
        let backend = if malloc_backend {
            Backend::Malloc(MallocState::default())
        } else {
            Backend::Pools(Pools {
                iobj: new_pool(Kind::IObj, mapper.clone()),
                large: new_pool(Kind::Large, mapper.clone()),
            })
        };
        Self { backend, mapper }
    }

    /// Allocate `size` bytes with the default object alignment.
    pub fn alloc(&self, size: usize, kind: Kind) -> Result<NonNull<u8>> {
        self.alloc_aligned(size, crate::obj::ALLOC_ALIGN, kind)
    }

    /// Allocate zeroed memory.
    pub fn calloc(&self, size: usize, kind: Kind) -> Result<NonNull<u8>> {
        let p = self.alloc(size, kind)?;
        // Safety: `p` is a fresh allocation of `size` bytes.
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    pub fn alloc_aligned(&self, size: usize, align: usize, kind: Kind) -> Result<NonNull<u8>> {
        debug_assert!(size > 0);
        debug_assert!(align <= 4096, "alignments above a page leak pool space");
        match &self.backend {
            Backend::Pools(pools) => {
                let layout = Layout::from_size_align(size, align).unwrap();
                unsafe { pools.pool(kind).lock().malloc(layout) }
                    .map_err(|()| Error::OutOfMemory)
            }
            Backend::Malloc(state) => state.alloc_aligned(size, align, kind),
        }
    }

    /// Free memory previously returned by this arena.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`/`alloc_aligned`/`calloc` on this
    /// arena with this `layout` and `kind`, and must not be used again.
    pub unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, kind: Kind) {
        match &self.backend {
            Backend::Pools(pools) => {
                // Safety: per the contract above, `ptr` was produced by
                // this pool with this layout.
                unsafe { pools.pool(kind).lock().free(ptr, layout) }
            }
            // Safety: as above.
            Backend::Malloc(state) => unsafe { state.free(ptr, layout) },
        }
    }

    /// The kind of memory `addr` points into; `Unknown` for anything not
    /// owned by this arena.
    pub fn memory_kind(&self, addr: usize) -> Kind {
        match &self.backend {
            Backend::Pools(_) => self.mapper.get(addr),
            Backend::Malloc(state) => state.memory_kind(addr),
        }
    }

    /// Label a range mapped outside the pools (obstack slabs). Both ends
    /// 2 MiB aligned.
    pub fn set_memory_kind(&self, start: usize, end: usize, kind: Kind) {
        match &self.backend {
            Backend::Pools(_) => self.mapper.set(start, end, kind),
            Backend::Malloc(state) => state.register(start, end, kind),
        }
    }

    pub fn erase_memory_kind(&self, start: usize, end: usize) {
        match &self.backend {
            Backend::Pools(_) => self.mapper.erase(start, end),
            Backend::Malloc(state) => state.unregister(start, end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arenas() -> Vec<Arena> {
        let mapper = Arc::new(KindMapper::new().unwrap());
        vec![
            Arena::new(mapper.clone(), false),
            Arena::new(mapper, true),
        ]
    }

    #[test]
    fn alloc_and_kind_round_trip() {
        for arena in arenas() {
            let p = arena.alloc(64, Kind::IObj).unwrap();
            assert_eq!(arena.memory_kind(p.as_ptr() as usize), Kind::IObj);
            assert_eq!(arena.memory_kind(p.as_ptr() as usize + 63), Kind::IObj);

            let q = arena.alloc(1 << 16, Kind::Large).unwrap();
            assert_eq!(arena.memory_kind(q.as_ptr() as usize), Kind::Large);

            // Safety: allocated above with the same layouts.
            unsafe {
                arena.free(p, Layout::from_size_align(64, 8).unwrap(), Kind::IObj);
                arena.free(q, Layout::from_size_align(1 << 16, 8).unwrap(), Kind::Large);
            }
        }
    }

    #[test]
    fn unknown_for_foreign_pointers() {
        for arena in arenas() {
            let local = 42u64;
            assert_eq!(
                arena.memory_kind(&local as *const u64 as usize),
                Kind::Unknown
            );
        }
    }

    #[test]
    fn aligned_allocation() {
        for arena in arenas() {
            let p = arena.alloc_aligned(256, 4096, Kind::IObj).unwrap();
            assert_eq!(p.as_ptr() as usize % 4096, 0);
            // Safety: allocated above.
            unsafe {
                arena.free(p, Layout::from_size_align(256, 4096).unwrap(), Kind::IObj);
            }
        }
    }

    #[test]
    fn registered_ranges() {
        for arena in arenas() {
            let len = 2 * SLAB_SIZE;
            let base = page::map_aligned(len, SLAB_SIZE).unwrap();
            let start = base.as_ptr() as usize;
            arena.set_memory_kind(start, start + len, Kind::Obstack);
            assert_eq!(arena.memory_kind(start + len / 2), Kind::Obstack);
            arena.erase_memory_kind(start, start + len);
            assert_eq!(arena.memory_kind(start + len / 2), Kind::Unknown);
            // Safety: mapped above, no longer referenced.
            unsafe { page::unmap(base, len) };
        }
    }

    #[test]
    fn calloc_zeroes() {
        for arena in arenas() {
            let p = arena.calloc(128, Kind::IObj).unwrap();
            // Safety: fresh 128-byte allocation.
            unsafe {
                assert!(core::slice::from_raw_parts(p.as_ptr(), 128).iter().all(|&b| b == 0));
                arena.free(p, Layout::from_size_align(128, 8).unwrap(), Kind::IObj);
            }
        }
    }
}
