// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Obstack chunks and the slab-backed chunk allocator.
//!
//! Chunks are the bump-allocation unit: `CHUNK_SIZE`-aligned, with a
//! one-word header packing the previous chunk pointer and this chunk's
//! generation. Chunks smaller than slabs act as semi-spaces during
//! collection — only the tail of the chunk containing the collect note
//! needs shadow copying, so a smaller chunk means less copying.
//!
//! Chunks are carved from 2 MiB slabs mapped directly (not through the
//! arena pools) and stamped [`Kind::Obstack`]. The allocator keeps a
//! free list and returns whole slabs to the OS when the list exceeds an
//! adaptive limit.

use core::ptr::NonNull;
use std::sync::Arc;

use hashbrown::HashMap;
use molt_tagged_ptr::TaggedPtr;

use crate::Runtime;
use crate::arena::Kind;
use crate::kind_mapper::SLAB_SIZE;
use crate::obstack::pos::Pos;
use crate::page;

pub(crate) const CHUNK_SIZE_LOG2: u32 = 16; // 64 KiB
pub(crate) const CHUNK_SIZE: usize = 1 << CHUNK_SIZE_LOG2;
pub(crate) const CHUNK_HEADER_SIZE: usize = 16;
pub(crate) const CHUNK_CAPACITY: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE;
pub(crate) const CHUNKS_PER_SLAB: usize = SLAB_SIZE / CHUNK_SIZE;

/// Header word: previous chunk pointer (chunk-aligned, so its low
/// `CHUNK_SIZE_LOG2` bits are free) and the generation in the tag.
type PrevGen = TaggedPtr<u8, 48, CHUNK_SIZE_LOG2>;

/// A live chunk, addressed by its aligned base.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Chunk(NonNull<u8>);

impl Chunk {
    /// The chunk containing `addr`.
    pub(crate) fn from_raw(addr: usize) -> Chunk {
        Chunk(NonNull::new((addr & !(CHUNK_SIZE - 1)) as *mut u8).expect("null chunk address"))
    }

    pub(crate) fn base(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn header(self) -> *mut u64 {
        self.0.as_ptr().cast()
    }

    fn prev_gen(self) -> PrevGen {
        // Safety: chunk bases are live mappings owned by the obstack.
        PrevGen::from_bits(unsafe { *self.header() })
    }

    fn set_prev_gen(self, value: PrevGen) {
        // Safety: as above.
        unsafe { *self.header() = value.bits() }
    }

    pub(crate) fn prev(self) -> Option<Chunk> {
        NonNull::new(self.prev_gen().ptr()).map(Chunk)
    }

    pub(crate) fn generation(self) -> u64 {
        self.prev_gen().tag()
    }

    pub(crate) fn set_prev(self, prev: Chunk) {
        self.set_prev_gen(PrevGen::new(prev.0.as_ptr(), prev.generation() + 1));
    }

    pub(crate) fn set_generation(self, generation: u64) {
        self.set_prev_gen(self.prev_gen().with_tag(generation));
    }

    fn init(self, prev: Option<Chunk>, generation: u64) {
        let prev_ptr = prev.map_or(core::ptr::null_mut(), |c| c.0.as_ptr());
        self.set_prev_gen(PrevGen::new(prev_ptr, generation));
    }

    pub(crate) fn begin_addr(self) -> *mut u8 {
        // Safety: within the chunk mapping.
        unsafe { self.0.as_ptr().add(CHUNK_HEADER_SIZE) }
    }

    pub(crate) fn end_addr(self) -> *mut u8 {
        // Safety: one past the chunk mapping, never dereferenced.
        unsafe { self.0.as_ptr().add(CHUNK_SIZE) }
    }

    pub(crate) fn begin_pos(self) -> Pos {
        Pos::from_parts(self.generation(), CHUNK_HEADER_SIZE)
    }

    pub(crate) fn end_pos(self) -> Pos {
        Pos::from_parts(self.generation() + 1, 0)
    }
}

fn slab_base(chunk_addr: usize) -> usize {
    chunk_addr & !(SLAB_SIZE - 1)
}

/// Carves chunks out of slabs, recycling through a free list.
pub(crate) struct ChunkAllocator {
    runtime: Arc<Runtime>,
    freelist: Vec<NonNull<u8>>,
    /// Free-list length beyond which [`collect_garbage`] tries to return
    /// whole slabs to the OS. Adapts up on failed sweeps, down on
    /// successful ones.
    garbage_limit: usize,
    allocated_slabs: usize,
}

// Safety: single-owner, moved between threads only via obstack stealing.
unsafe impl Send for ChunkAllocator {}

impl ChunkAllocator {
    pub(crate) fn new(runtime: Arc<Runtime>) -> ChunkAllocator {
        ChunkAllocator {
            runtime,
            freelist: Vec::with_capacity(2 * CHUNKS_PER_SLAB),
            // No point collecting before two slabs' worth of churn.
            garbage_limit: CHUNKS_PER_SLAB * 2,
            allocated_slabs: 0,
        }
    }

    pub(crate) fn new_chunk(&mut self, prev: Option<Chunk>) -> Chunk {
        let generation = prev.map_or(0, |p| p.generation() + 1);
        let raw = self.new_raw_chunk();
        let chunk = Chunk(raw);
        chunk.init(prev, generation);
        chunk
    }

    /// A first chunk whose positions sort after `pin` (used when a new
    /// obstack must be younger than a note in its parent).
    pub(crate) fn new_chunk_after(&mut self, pin: Pos) -> Chunk {
        let raw = self.new_raw_chunk();
        let chunk = Chunk(raw);
        chunk.init(None, pin.generation() + 1);
        chunk
    }

    pub(crate) fn delete_chunk(&mut self, chunk: Chunk) {
        self.freelist.push(chunk.0);
    }

    fn new_raw_chunk(&mut self) -> NonNull<u8> {
        if self.freelist.is_empty() {
            let slab = self.alloc_slab();
            for i in (0..CHUNKS_PER_SLAB).rev() {
                // Safety: stays within the slab mapping.
                self.freelist.push(unsafe { slab.add(i * CHUNK_SIZE) });
            }
        }
        self.freelist.pop().expect("freelist refilled above")
    }

    fn alloc_slab(&mut self) -> NonNull<u8> {
        let slab = page::map_aligned(SLAB_SIZE, SLAB_SIZE).expect("out-of-memory");
        let base = slab.as_ptr() as usize;
        self.runtime
            .arena
            .set_memory_kind(base, base + SLAB_SIZE, Kind::Obstack);
        self.allocated_slabs += 1;
        slab
    }

    fn free_slab(&mut self, base: usize) {
        self.runtime.arena.erase_memory_kind(base, base + SLAB_SIZE);
        // Safety: the slab was mapped by `alloc_slab` and every chunk of
        // it is on the free list (checked by the caller).
        unsafe { page::unmap(NonNull::new(base as *mut u8).unwrap(), SLAB_SIZE) };
        self.allocated_slabs -= 1;
    }

    /// Return fully free slabs to the OS once the free list has grown
    /// past the adaptive limit.
    pub(crate) fn collect_garbage(&mut self) {
        if self.freelist.len() < self.garbage_limit {
            return;
        }

        let mut free_per_slab: HashMap<usize, usize> = HashMap::new();
        let mut index = self.freelist.len();
        while index > 0 {
            index -= 1;
            let slab = slab_base(self.freelist[index].as_ptr() as usize);
            let count = free_per_slab.entry(slab).or_insert(0);
            *count += 1;
            if *count == CHUNKS_PER_SLAB {
                // A fully free slab: release it. Its chunks all sit at
                // positions >= index (this was the last one found), so
                // purging them leaves the unvisited prefix intact.
                self.free_slab(slab);
                self.freelist
                    .retain(|c| slab_base(c.as_ptr() as usize) != slab);
                if self.freelist.len() <= self.garbage_limit / 2 {
                    break;
                }
            }
        }

        if self.freelist.len() <= self.garbage_limit / 2 {
            // Successful sweep: keep less slack around next time.
            self.garbage_limit = (CHUNKS_PER_SLAB * 2).max(self.garbage_limit * 2 / 3);
        } else {
            // Failed to shrink: back off so we don't retry every free.
            self.garbage_limit = self.garbage_limit * 3 / 2;
        }
    }

    /// Absorb all slabs and free chunks from `source` (cross-obstack
    /// steal).
    pub(crate) fn steal_slabs(&mut self, source: &mut ChunkAllocator) {
        self.allocated_slabs += source.allocated_slabs;
        source.allocated_slabs = 0;
        self.freelist.append(&mut source.freelist);
    }

    pub(crate) fn allocated_slabs(&self) -> usize {
        self.allocated_slabs
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        // Everything the obstack handed back should coalesce into whole
        // slabs now.
        self.garbage_limit = 0;
        self.collect_garbage();
        debug_assert!(self.freelist.is_empty());
        debug_assert_eq!(self.allocated_slabs, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeOptions;

    #[test]
    fn chunk_header_round_trip() {
        let rt = Runtime::with_options(RuntimeOptions::default());
        let mut alloc = ChunkAllocator::new(rt.clone());

        let first = alloc.new_chunk(None);
        assert_eq!(first.generation(), 0);
        assert!(first.prev().is_none());
        assert_eq!(first.base() % CHUNK_SIZE, 0);
        assert_eq!(rt.arena.memory_kind(first.base()), Kind::Obstack);

        let second = alloc.new_chunk(Some(first));
        assert_eq!(second.generation(), 1);
        assert_eq!(second.prev(), Some(first));

        second.set_generation(41);
        assert_eq!(second.generation(), 41);
        assert_eq!(second.prev(), Some(first));

        let pinned = alloc.new_chunk_after(Pos::from_parts(7, 32));
        assert_eq!(pinned.generation(), 8);

        alloc.delete_chunk(pinned);
        alloc.delete_chunk(second);
        alloc.delete_chunk(first);
    }

    #[test]
    fn slabs_are_released_when_fully_free() {
        let rt = Runtime::with_options(RuntimeOptions::default());
        let mut alloc = ChunkAllocator::new(rt.clone());

        let chunks: Vec<_> = (0..3 * CHUNKS_PER_SLAB)
            .map(|_| alloc.new_chunk(None))
            .collect();
        assert_eq!(alloc.allocated_slabs(), 3);

        for chunk in chunks {
            alloc.delete_chunk(chunk);
        }
        alloc.collect_garbage();
        assert!(alloc.allocated_slabs() < 3);
    }
}
