// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The obstack: a per-worker bump allocator for short-lived uninterned
//! values, collected relative to caller-chosen *notes*.
//!
//! Memory is bump-allocated out of a chain of chunks. A [`Note`] records
//! the allocation cursor; everything allocated after a note is "young"
//! relative to it and reclaimable by [`Obstack::collect`] once proven
//! unreachable from the caller's roots and the obstack's handles.
//!
//! Large allocations get their own arena blocks, linked into a side
//! list with the position of a small *placeholder* allocation (the
//! placeholder keeps any note carrying external references non-empty).
//! References to interned objects are tracked in a per-obstack map so
//! collection can drop their refcounts when they die.

pub(crate) mod chunk;
mod collect;
mod freeze;
mod handle;
pub(crate) mod pos;

pub use handle::RObjHandle;

use core::alloc::Layout;
use core::ptr::NonNull;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::arena::Kind;
use crate::obj::{ALLOC_ALIGN, IObj, IObjOrFakePtr, RObj, RObjOrFakePtr};
use crate::process::{self, Process};
use crate::refcount::{decref, decref_to_non_zero, incref};
use crate::stats::AllocStats;
use crate::util::round_up;
use crate::{Result, Runtime};

use self::chunk::{CHUNK_SIZE, Chunk, ChunkAllocator};
use self::handle::HandleList;
use self::pos::Pos;

/// Allocations at or above this size get their own arena block.
pub(crate) const LARGE_ALLOC_SIZE: usize = CHUNK_SIZE / 2;

/// An opaque allocation-cursor cookie; the boundary between old and
/// young memory for a collection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Note {
    pub(crate) ptr: *const u8,
}

/// Header preceding every large allocation, linking it into the
/// obstack's side list.
#[repr(C)]
pub(crate) struct LargeObjHeader {
    pub(crate) prev: Option<NonNull<LargeObjHeader>>,
    /// Position at allocation time; collection temporarily parks marked
    /// survivors at the mark position.
    pub(crate) pos: Pos,
    /// User bytes, excluding this header.
    pub(crate) size: usize,
}

pub(crate) const LARGE_OBJ_HEADER_SIZE: usize = size_of::<LargeObjHeader>();
static_assertions::const_assert_eq!(LARGE_OBJ_HEADER_SIZE % ALLOC_ALIGN, 0);

impl LargeObjHeader {
    fn alloc(
        rt: &Runtime,
        size: usize,
        prev: Option<NonNull<LargeObjHeader>>,
        pos: Pos,
    ) -> Result<NonNull<LargeObjHeader>> {
        let raw = rt.arena.alloc(LARGE_OBJ_HEADER_SIZE + size, Kind::Large)?;
        let header = raw.cast::<LargeObjHeader>();
        // Safety: fresh allocation big enough for the header.
        unsafe {
            header.write(LargeObjHeader { prev, pos, size });
        }
        Ok(header)
    }

    /// The header of a large object, found just before its metadata.
    ///
    /// # Safety
    ///
    /// `robj` must live in a large allocation made by this obstack.
    pub(crate) unsafe fn from_object(robj: RObj) -> NonNull<LargeObjHeader> {
        let metadata = robj.type_().uninterned_metadata_byte_size();
        // Safety: per the contract, the header precedes the metadata.
        unsafe {
            NonNull::new_unchecked(
                robj.as_ptr().sub(metadata + LARGE_OBJ_HEADER_SIZE) as *mut LargeObjHeader
            )
        }
    }

    pub(crate) fn body(header: NonNull<LargeObjHeader>) -> *mut u8 {
        // Safety: points just past the header, inside the allocation.
        unsafe { header.as_ptr().add(1).cast() }
    }

    unsafe fn free(rt: &Runtime, header: NonNull<LargeObjHeader>) {
        // Safety: allocated by `alloc` with this layout.
        unsafe {
            let size = header.as_ref().size;
            let layout =
                Layout::from_size_align(LARGE_OBJ_HEADER_SIZE + size, ALLOC_ALIGN).unwrap();
            rt.arena.free(header.cast(), layout, Kind::Large);
        }
    }
}

/// Tracking entry for one interned object the obstack references.
pub(crate) struct IObjRef {
    pub(crate) pos: Pos,
    pub(crate) prev: Option<IObj>,
}

pub(crate) struct ObstackDetail {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) current_large_obj: Option<NonNull<LargeObjHeader>>,
    pub(crate) iobj_refs: HashMap<IObj, IObjRef>,
    pub(crate) current_iobj: Option<IObj>,
    pub(crate) chunk_allocator: ChunkAllocator,
    pub(crate) handles: HandleList,
    pub(crate) owner: Arc<Process>,
    pub(crate) first_note: *const u8,
    /// Auto-collect threshold; updated after every rooted collection.
    pub(crate) min_usage: usize,
    pub(crate) stats: AllocStats,
    /// Recorded notes, kept only under `OBSTACK_VERIFY_NOTE`.
    pub(crate) valid_notes: Vec<Pos>,
    pub(crate) profiler: crate::alloc_profiler::AllocProfiler,
}

pub struct Obstack {
    pub(crate) next_alloc: *mut u8,
    pub(crate) detail: Box<ObstackDetail>,
}

// Safety: an obstack is single-owner; sending it to another thread
// transfers that ownership wholesale (which is exactly what
// cross-obstack stealing relies on). Shared state it points into
// (runtime, processes) is Sync.
unsafe impl Send for Obstack {}

impl Obstack {
    pub fn new(runtime: Arc<Runtime>) -> Obstack {
        let mut obstack = Self::raw(runtime);
        let chunk = obstack.detail.chunk_allocator.new_chunk(None);
        obstack.init(chunk);
        obstack
    }

    /// An obstack whose every position sorts after `note` in its parent;
    /// used for workers whose results are later stolen back.
    pub fn new_child(runtime: Arc<Runtime>, note: Note) -> Obstack {
        let mut obstack = Self::raw(runtime);
        let pin = Pos::from_raw(&obstack.detail.runtime.arena, note.ptr as usize);
        let chunk = obstack.detail.chunk_allocator.new_chunk_after(pin);
        obstack.init(chunk);
        obstack
    }

    fn raw(runtime: Arc<Runtime>) -> Obstack {
        let owner = process::current();
        let detail = Box::new(ObstackDetail {
            chunk_allocator: ChunkAllocator::new(runtime.clone()),
            runtime,
            current_large_obj: None,
            iobj_refs: HashMap::new(),
            current_iobj: None,
            handles: HandleList::new(owner.clone()),
            owner,
            first_note: core::ptr::null(),
            min_usage: 0,
            stats: AllocStats::default(),
            valid_notes: Vec::new(),
            profiler: Default::default(),
        });
        Obstack {
            next_alloc: core::ptr::null_mut(),
            detail,
        }
    }

    fn init(&mut self, chunk: Chunk) {
        self.detail.stats.modify_chunk(1);
        self.next_alloc = chunk.begin_addr();
        // Preallocate one block so collections can never refer to a
        // negative offset.
        let _ = self.alloc(ALLOC_ALIGN);
        let first = self.note();
        self.detail.first_note = first.ptr;
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.detail.runtime
    }

    pub(crate) fn config(&self) -> &crate::Config {
        &self.detail.runtime.config
    }

    /// The cursor recorded at creation; collecting at this note reclaims
    /// everything.
    pub fn first_note(&self) -> Note {
        Note {
            ptr: self.detail.first_note,
        }
    }

    pub fn note(&mut self) -> Note {
        if self.config().verify_note {
            let note = Pos::from_raw(&self.detail.runtime.arena, self.next_alloc as usize);
            let valid_notes = &mut self.detail.valid_notes;
            debug_assert!(valid_notes.last().is_none_or(|&last| last <= note));
            if valid_notes.last() != Some(&note) {
                valid_notes.push(note);
            }
        }
        Note {
            ptr: self.next_alloc,
        }
    }

    pub(crate) fn note_pos(&self, note: Note) -> Pos {
        Pos::from_raw(&self.detail.runtime.arena, note.ptr as usize)
    }

    /// Allocate `size` bytes (rounded to the allocation alignment).
    /// Aborts with "out-of-memory" if the OS refuses more chunks.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        let size = round_up(size, ALLOC_ALIGN);

        if self.config().heap_profile != 0 {
            self.detail.profiler.log_allocation(size);
        }

        if size < LARGE_ALLOC_SIZE {
            // Non-null: chunk interiors are never null.
            NonNull::new(self.alloc_small(size)).unwrap()
        } else {
            self.alloc_large(size)
        }
    }

    /// Allocate zeroed memory.
    pub fn calloc(&mut self, size: usize) -> NonNull<u8> {
        let p = self.alloc(size);
        // Safety: fresh allocation of at least `size` bytes.
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0, size) };
        p
    }

    /// Bump allocation for sizes known to be small and aligned.
    pub(crate) fn alloc_small(&mut self, size: usize) -> *mut u8 {
        debug_assert_eq!(size, round_up(size, ALLOC_ALIGN));
        debug_assert!(size < LARGE_ALLOC_SIZE);
        let mem = self.next_alloc;
        // Safety: either stays in the current chunk (checked below) or
        // the value is discarded for the overflow path.
        let next = unsafe { mem.add(size) };
        if (next as usize ^ mem as usize) < CHUNK_SIZE {
            self.next_alloc = next;
            self.detail.stats.alloc_small(size);
            return mem;
        }
        self.alloc_overflow(size)
    }

    #[cold]
    fn alloc_overflow(&mut self, size: usize) -> *mut u8 {
        let prev = Chunk::from_raw(self.next_alloc as usize);
        self.detail
            .stats
            .alloc_fragment(prev.end_addr() as usize - self.next_alloc as usize);
        let chunk = self.detail.chunk_allocator.new_chunk(Some(prev));
        self.detail.stats.modify_chunk(1);
        let mem = chunk.begin_addr();
        // Safety: a fresh chunk always fits one small allocation.
        self.next_alloc = unsafe { mem.add(size) };
        debug_assert!((mem as usize ^ self.next_alloc as usize) < CHUNK_SIZE);
        self.detail.stats.alloc_small(size);
        mem
    }

    /// Allocate in a dedicated arena block, on the side list at the
    /// current position. A small placeholder makes the enclosing note
    /// provably non-empty.
    fn alloc_large(&mut self, size: usize) -> NonNull<u8> {
        debug_assert_eq!(size, round_up(size, ALLOC_ALIGN));
        self.detail.stats.alloc_placeholder(ALLOC_ALIGN);
        let placeholder = self.alloc_small(ALLOC_ALIGN);
        let pos = Pos::from_raw(&self.detail.runtime.arena, placeholder as usize);

        let header = LargeObjHeader::alloc(
            &self.detail.runtime,
            size,
            self.detail.current_large_obj,
            pos,
        )
        .expect("out-of-memory");
        self.detail.current_large_obj = Some(header);
        self.detail.stats.modify_large(1, size as i64);
        self.detail.stats.alloc_large(size);
        // Non-null: offset from a successful allocation.
        NonNull::new(LargeObjHeader::body(header)).unwrap()
    }

    /// An allocation the collector will never move (it gets a large
    /// block regardless of size).
    pub fn alloc_pinned(&mut self, size: usize) -> NonNull<u8> {
        let size = round_up(size, ALLOC_ALIGN);
        self.alloc_large(size)
    }

    /// Bytes allocated since `note`, including live large objects.
    pub fn usage(&self, note: Note) -> usize {
        let note_pos = self.note_pos(note);
        let mut sum = Pos::from_raw(&self.detail.runtime.arena, self.next_alloc as usize)
            .diff(note_pos) as usize;
        let mut cursor = self.detail.current_large_obj;
        while let Some(header) = cursor {
            // Safety: the large list holds live headers.
            let header = unsafe { header.as_ref() };
            if header.pos < note_pos {
                break;
            }
            sum += header.size;
            cursor = header.prev;
        }
        sum
    }

    pub fn total_usage(&self) -> usize {
        self.usage(self.first_note())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.next_alloc.cast_const() == self.detail.first_note
    }

    /// Intern the graph at `obj` and keep the result alive from this
    /// obstack until the enclosing note is collected.
    pub fn intern(&mut self, obj: RObjOrFakePtr) -> Result<IObjOrFakePtr> {
        match obj.as_ptr() {
            Some(robj) => {
                let runtime = self.detail.runtime.clone();
                let iobj = crate::intern::intern(&runtime, robj)?;
                self.adopt_iobj_reference(iobj, false);
                Ok(IObjOrFakePtr::from_iobj(iobj))
            }
            None => Ok(IObjOrFakePtr::from_bits(obj.bits())),
        }
    }

    /// Track an already-interned object as referenced by this obstack.
    pub fn register_iobj(&mut self, obj: IObjOrFakePtr) -> IObjOrFakePtr {
        if let Some(iobj) = obj.as_ptr() {
            debug_assert!(iobj.robj().is_interned(&self.detail.runtime.arena));
            self.adopt_iobj_reference(iobj, true);
        }
        obj
    }

    /// Shared tail of `intern`/`register_iobj`. When `needs_incref` is
    /// false the caller hands over a reference it already owns; a
    /// duplicate registration then drops the surplus.
    fn adopt_iobj_reference(&mut self, iobj: IObj, needs_incref: bool) {
        let delegate = iobj.refcount_delegate();
        let prev = self.detail.current_iobj;
        let fresh = match self.detail.iobj_refs.entry(delegate) {
            hashbrown::hash_map::Entry::Vacant(v) => {
                v.insert(IObjRef {
                    pos: Pos::ZERO,
                    prev,
                });
                true
            }
            hashbrown::hash_map::Entry::Occupied(_) => false,
        };

        if fresh {
            if needs_incref {
                incref(delegate);
            }
            self.detail.current_iobj = Some(delegate);
            self.detail.stats.modify_intern(1);
            self.detail.stats.alloc_placeholder(ALLOC_ALIGN);
            let placeholder = self.alloc_small(ALLOC_ALIGN);
            let pos = Pos::from_raw(&self.detail.runtime.arena, placeholder as usize);
            self.detail.iobj_refs.get_mut(&delegate).unwrap().pos = pos;
        } else if !needs_incref {
            // Already tracked: ditch the reference implied by intern().
            let live = decref_to_non_zero(delegate.refcount_atomic());
            debug_assert!(live);
        }
    }

    /// Take ownership of an iobj reference from a stolen obstack: no
    /// incref needed for a first sighting, the source's count transfers.
    pub(crate) fn steal_iobj(&mut self, iobj: IObj, pos: Pos) {
        let delegate = iobj.refcount_delegate();
        let prev = self.detail.current_iobj;
        match self.detail.iobj_refs.entry(delegate) {
            hashbrown::hash_map::Entry::Vacant(v) => {
                v.insert(IObjRef { pos, prev });
                self.detail.current_iobj = Some(delegate);
                self.detail.stats.modify_intern(1);
            }
            hashbrown::hash_map::Entry::Occupied(_) => {
                // Both sides tracked it; drop the duplicate count.
                decref_to_non_zero(delegate.refcount_atomic());
            }
        }
    }

    /// Deep-copy `obj` into this obstack with every copy frozen.
    pub fn freeze(&mut self, obj: RObjOrFakePtr) -> RObjOrFakePtr {
        freeze::freeze(self, obj)
    }

    /// A mutable shallow copy of `obj` in this obstack.
    pub fn shallow_clone(&mut self, obj: RObj) -> RObj {
        let ty = obj.type_();
        let metadata = ty.uninterned_metadata_byte_size();
        let user = obj.user_byte_size();
        let raw = self.alloc(metadata + user);
        // Safety: the new block holds metadata + body; the source is a
        // live object of the same shape.
        unsafe {
            core::ptr::copy_nonoverlapping(
                obj.as_ptr().sub(metadata),
                raw.as_ptr(),
                metadata + user,
            );
            RObj::from_ptr(NonNull::new_unchecked(raw.as_ptr().add(metadata)))
        }
    }

    /// A durable, cross-thread reference owned by this obstack's
    /// process. The handle must be dropped (on the owning thread) before
    /// the obstack.
    pub fn make_handle(&mut self, robj: RObjOrFakePtr) -> Box<RObjHandle> {
        let handle = RObjHandle::new(robj, self.detail.owner.clone());
        self.detail.handles.prepend(&handle);
        handle
    }

    pub fn any_handles(&self) -> bool {
        self.detail.handles.any_handles()
    }

    /// Reclaim everything allocated since `note` that is unreachable
    /// from this obstack's handles.
    pub fn collect(&mut self, note: Note) {
        collect::collect_manual(self, note);
    }

    /// As [`collect`](Self::collect), with explicit extra roots;
    /// surviving root pointers are rewritten in place.
    pub fn collect_with_roots(&mut self, note: Note, roots: &mut [RObjOrFakePtr]) {
        collect::collect_manual_with_roots(self, note, roots);
    }

    /// Collect only if the allocation volume since `note` has crossed
    /// the adaptive threshold.
    pub fn collect_auto(&mut self, note: Note) {
        collect::collect_auto(self, note);
    }

    pub fn collect_auto_with_roots(&mut self, note: Note, roots: &mut [RObjOrFakePtr]) {
        collect::collect_auto_with_roots(self, note, roots);
    }

    /// Collect the entire obstack (used by runtime teardown paths).
    pub fn collect_all(&mut self) {
        let note = self.first_note();
        collect::collect_runtime(self, note);
    }

    /// Move every allocation newer than `note` (and all handles) from
    /// `source` into this obstack, leaving `source` an empty zombie.
    pub fn steal(&mut self, note: Note, source: &mut Obstack) {
        collect::steal_objects_and_handles(self, note, source);
    }

    /// If the note is empty, allocate a placeholder so the next note is
    /// strictly newer (required when extrefs survive at `note`).
    pub(crate) fn allocate_placeholder(&mut self, note: Pos) {
        if Pos::from_raw(&self.detail.runtime.arena, self.next_alloc as usize) == note {
            self.detail.stats.alloc_placeholder(ALLOC_ALIGN);
            let _ = self.alloc_small(ALLOC_ALIGN);
        }
        debug_assert!(
            note < Pos::from_raw(&self.detail.runtime.arena, self.next_alloc as usize)
        );
    }

    /// Under `OBSTACK_VERIFY_NOTE`, discard recorded notes younger than
    /// `note` and assert that `note` itself was recorded.
    pub(crate) fn verify_note(&mut self, note: Pos) {
        if !self.config().verify_note {
            return;
        }
        let valid_notes = &mut self.detail.valid_notes;
        while valid_notes.last().is_some_and(|&last| last > note) {
            valid_notes.pop();
        }
        assert_eq!(valid_notes.last(), Some(&note), "collect target is not a note");
    }

    /// Verify chain/stats invariants (a no-op unless
    /// `OBSTACK_VERIFY_PARANOID` is set).
    pub fn verify_invariants(&self) {
        if !self.config().verify_paranoid {
            return;
        }
        let detail = &self.detail;
        let arena = &detail.runtime.arena;

        // iobj chain matches the map and the stats.
        let mut count = 0u64;
        let mut cursor = detail.current_iobj;
        while let Some(iobj) = cursor {
            assert_eq!(arena.memory_kind(iobj.robj().interior()), Kind::IObj);
            count += 1;
            cursor = detail.iobj_refs[&iobj].prev;
        }
        assert_eq!(detail.stats.cur_intern_count(), count);
        assert_eq!(detail.iobj_refs.len() as u64, count);

        // Large object chain matches the stats.
        let mut count = 0u64;
        let mut size = 0u64;
        let mut cursor = detail.current_large_obj;
        while let Some(header) = cursor {
            // Safety: live header on the large list.
            let header = unsafe { header.as_ref() };
            assert_eq!(
                arena.memory_kind(header as *const _ as usize),
                Kind::Large
            );
            count += 1;
            size += header.size as u64;
            cursor = header.prev;
        }
        assert_eq!(detail.stats.cur_large_count(), count);
        assert_eq!(detail.stats.cur_large_size(), size);

        // Chunk chain matches the stats.
        let mut count = 0u64;
        let mut cursor = Some(Chunk::from_raw(self.next_alloc as usize));
        while let Some(c) = cursor {
            count += 1;
            cursor = c.prev();
        }
        assert_eq!(detail.stats.cur_chunk_count(), count);
    }

    /// Test/diagnostic accessors.
    pub fn allocated_chunks(&self) -> u64 {
        self.detail.stats.cur_chunk_count()
    }

    pub fn large_count(&self) -> u64 {
        self.detail.stats.cur_large_count()
    }

    pub fn iobj_count(&self) -> u64 {
        self.detail.stats.cur_intern_count()
    }
}

impl Drop for Obstack {
    fn drop(&mut self) {
        if self.next_alloc.is_null() {
            // A stolen-from zombie; everything moved elsewhere.
            return;
        }

        let report = self.config().memstats != 0;
        let mut cursor = Some(Chunk::from_raw(self.next_alloc as usize));
        while let Some(c) = cursor {
            let prev = c.prev();
            if prev.is_none() && report && c.generation() == 0 {
                self.detail.stats.report_final();
            }
            self.detail.chunk_allocator.delete_chunk(c);
            cursor = prev;
        }

        self.detail
            .profiler
            .merge_into(&self.detail.runtime.profiler_shared);
    }
}

impl Drop for ObstackDetail {
    fn drop(&mut self) {
        let runtime = self.runtime.clone();

        // Drop the obstack's references into the interned heap.
        for (&iobj, _) in self.iobj_refs.iter() {
            decref(&runtime, iobj);
        }

        // Free any remaining large objects.
        let mut cursor = self.current_large_obj.take();
        while let Some(header) = cursor {
            // Safety: live header owned by this obstack, freed once.
            unsafe {
                cursor = header.as_ref().prev;
                self.stats
                    .modify_large(-1, -(header.as_ref().size as i64));
                LargeObjHeader::free(&runtime, header);
            }
        }

        // Otherwise, who owns them?
        debug_assert!(!self.handles.any_handles());
    }
}
