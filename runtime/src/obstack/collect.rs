// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The obstack collector: a semi-space compactor for the young portion
//! `[note, next_alloc)`.
//!
//! The allocation cursor is reset to the note *before* visiting roots,
//! so copies immediately reuse the reclaimed range. Copies destined for
//! the chunk containing the note are first written to a per-collection
//! shadow buffer and memcpy'd back once copying finishes — source and
//! destination ranges overlap in that chunk, everywhere else copies go
//! straight to their final address.
//!
//! Marking takes different forms per object class: young small objects
//! leave a forwarding pointer in their vtable slot; young large objects
//! and iobj references are parked at the *mark position* (one byte
//! before the collect note); old objects that merely need scanning go
//! into a hash set.
//!
//! Sweeping runs large objects, then chunks, then iobj references —
//! iobjs last so that refcount cascades may safely re-enter.

use core::ptr::NonNull;

use hashbrown::HashSet;

use crate::arena::Kind;
use crate::gc_type::{Stripe, Type};
use crate::obj::{ALLOC_ALIGN, IObj, RObj, RObjOrFakePtr};
use crate::obstack::chunk::{CHUNK_SIZE, Chunk};
use crate::obstack::pos::Pos;
use crate::obstack::{IObjRef, LargeObjHeader, Note, Obstack, RObjHandle};
use crate::refcount::{decref, decref_to_non_zero, incref};
use crate::stats::CollectMode;
use crate::util::round_up;

pub(crate) fn collect_manual(obstack: &mut Obstack, note: Note) {
    if obstack.config().gc_manual {
        collect_no_roots(obstack, note, CollectMode::Manual);
    } else {
        collect_auto(obstack, note);
    }
}

pub(crate) fn collect_manual_with_roots(
    obstack: &mut Obstack,
    note: Note,
    roots: &mut [RObjOrFakePtr],
) {
    if !obstack.config().gc_manual {
        return collect_auto_with_roots(obstack, note, roots);
    }
    collect_rooted(obstack, note, roots, CollectMode::Manual);
}

pub(crate) fn collect_auto(obstack: &mut Obstack, note: Note) {
    // No roots: a sweep is cheap, run it unconditionally.
    collect_no_roots(obstack, note, CollectMode::Auto);
}

pub(crate) fn collect_auto_with_roots(
    obstack: &mut Obstack,
    note: Note,
    roots: &mut [RObjOrFakePtr],
) {
    let eligible = obstack.usage(note);
    if eligible >= obstack.detail.min_usage {
        let new_min = collect_rooted(obstack, note, roots, CollectMode::Auto);
        obstack.detail.min_usage = new_min;
    }
}

pub(crate) fn collect_runtime(obstack: &mut Obstack, note: Note) {
    collect_no_roots(obstack, note, CollectMode::Runtime);
}

/// Zero-root collection: reset the cursor and sweep. Handles are extra
/// roots, so their presence punts to the general collector.
fn collect_no_roots(obstack: &mut Obstack, note: Note, mode: CollectMode) {
    if obstack.any_handles() {
        collect_rooted(obstack, note, &mut [], mode);
        return;
    }

    let note_pos = obstack.note_pos(note);
    debug_assert!(
        note_pos >= obstack.note_pos(obstack.first_note()),
        "collect target predates this obstack"
    );
    obstack.verify_note(note_pos);

    if obstack.config().memstats != 0 {
        obstack.detail.stats.count_sweep(mode);
        let eligible = obstack.usage(note);
        obstack.detail.stats.gc_reclaim(eligible);
    }
    let verbose = obstack.config().gc_verbose >= 3;
    let pre_usage = if verbose { obstack.usage(note) } else { 0 };

    let old_next_alloc = obstack.next_alloc;
    obstack.next_alloc = note.ptr.cast_mut();
    sweep(obstack, note, old_next_alloc);

    if verbose {
        log::trace!(
            "{} eligible {pre_usage} {} min {} total {}",
            mode.sweep_name(),
            if pre_usage >= obstack.detail.min_usage {
                ">="
            } else {
                "<"
            },
            obstack.detail.min_usage,
            obstack.total_usage(),
        );
    }
}

/// Rooted collection; returns the next auto-collect threshold.
fn collect_rooted(
    obstack: &mut Obstack,
    note: Note,
    roots: &mut [RObjOrFakePtr],
    mode: CollectMode,
) -> usize {
    let note_pos = obstack.note_pos(note);
    debug_assert!(
        note_pos >= obstack.note_pos(obstack.first_note()),
        "collect target predates this obstack"
    );
    obstack.verify_note(note_pos);
    obstack.detail.stats.count_collect(mode);

    Collector::new(obstack, note, mode).collect(roots)
}

#[derive(Clone, Copy)]
struct ObjectSize {
    metadata: usize,
    user: usize,
}

impl ObjectSize {
    fn of(robj: RObj, ty: &Type) -> ObjectSize {
        ObjectSize {
            metadata: ty.uninterned_metadata_byte_size(),
            user: robj.user_byte_size(),
        }
    }

    fn total(self) -> usize {
        self.metadata + self.user
    }

    /// # Safety
    ///
    /// Both bodies must be live with this shape, and non-overlapping.
    unsafe fn copy(self, dst: RObj, src: RObj) {
        // Safety: per the contract.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().sub(self.metadata),
                dst.as_ptr().sub(self.metadata),
                self.total(),
            );
        }
    }

    /// # Safety
    ///
    /// Both bodies must be live with this shape; ranges may overlap.
    unsafe fn copy_overlapping(self, dst: RObj, src: RObj) {
        // Safety: per the contract.
        unsafe {
            core::ptr::copy(
                src.as_ptr().sub(self.metadata),
                dst.as_ptr().sub(self.metadata),
                self.total(),
            );
        }
    }
}

struct WorkItem {
    target: RObj,
    ty: &'static Type,
}

struct Collector<'a> {
    obstack: &'a mut Obstack,
    collect_addr: *mut u8,
    collect_note: Pos,
    collect_chunk: Chunk,
    old_next_alloc: *mut u8,
    pre_usage: usize,
    mode: CollectMode,
    mark_count: usize,
    scan_count: usize,
    shadow_vol: usize,
    copy_vol: usize,
    large_young_count: usize,
    work_queue: Vec<WorkItem>,
    /// Stand-in for the collect chunk while copying; see module docs.
    shadow: Vec<u8>,
    /// Mark state for old objects that cannot carry a forwarding pointer
    /// or a parked position.
    marked: HashSet<usize>,
}

impl<'a> Collector<'a> {
    fn new(obstack: &'a mut Obstack, note: Note, mode: CollectMode) -> Collector<'a> {
        let collect_note = obstack.note_pos(note);
        let pre_usage = obstack.usage(note);
        let old_next_alloc = obstack.next_alloc;
        Collector {
            collect_addr: note.ptr.cast_mut(),
            collect_note,
            collect_chunk: Chunk::from_raw(note.ptr as usize),
            old_next_alloc,
            pre_usage,
            mode,
            mark_count: 0,
            scan_count: 0,
            shadow_vol: 0,
            copy_vol: 0,
            large_young_count: 0,
            work_queue: Vec::new(),
            shadow: vec![0u8; CHUNK_SIZE],
            marked: HashSet::new(),
            obstack,
        }
    }

    /// Positions before this are "old": scanned but never moved.
    /// Positions exactly here are marked extrefs. Everything later is
    /// young and reclaimable.
    fn mark_pos(&self) -> Pos {
        self.collect_note.pred()
    }

    fn collect(mut self, roots: &mut [RObjOrFakePtr]) -> usize {
        // Reclaimed space is reused immediately.
        self.obstack.next_alloc = self.collect_addr;

        let quick = roots.len() == 1 && self.quick_collect_one(&mut roots[0]);
        if !quick {
            for root in roots.iter_mut() {
                self.visit_root(root);
            }

            // Handles are roots too. Collected into raw pointers first:
            // visiting mutates the collector, not the list.
            let mut handles: Vec<*const RObjHandle> = Vec::new();
            self.obstack
                .detail
                .handles
                .each_handle(|h| handles.push(h));
            for &ptr in &handles {
                // Safety: handles stay linked (and alive) throughout the
                // collection; only their wrapped pointer is updated.
                let handle = unsafe { &*ptr };
                let mut root = handle.get();
                self.visit_root(&mut root);
                handle.set(root);
            }

            self.copy_shadow_to_collect_chunk();
        }

        let note = Note {
            ptr: self.collect_addr,
        };
        let large_young_count = self.large_young_count;
        let survivors = sweep(self.obstack, note, self.old_next_alloc);
        debug_assert_eq!(survivors.large_young_survivors, large_young_count);

        self.finish_stats()
    }

    /// Post-collection accounting; returns the next auto threshold:
    /// a multiple of the work (bytes scanned plus bytes copied) this
    /// collection performed, including old objects scanned in place.
    fn finish_stats(self) -> usize {
        let stats = &mut self.obstack.detail.stats;
        stats.alloc_gc(self.copy_vol);
        stats.alloc_shadow(self.shadow_vol);

        let post_usage = self.obstack.usage(Note {
            ptr: self.collect_addr,
        });
        let freed = self.pre_usage.saturating_sub(post_usage);
        let scan_vol = self.scan_count * size_of::<usize>();

        let stats = &mut self.obstack.detail.stats;
        stats.gc_reclaim(freed);
        stats.gc_visit(self.mark_count);
        stats.gc_scan(scan_vol);

        let config = &self.obstack.detail.runtime.config;
        let work_vol = scan_vol + self.copy_vol + self.shadow_vol;
        if config.gc_verbose >= 1 {
            if work_vol as f64 > freed.max(CHUNK_SIZE) as f64 * config.gc_squawk {
                log::warn!(
                    "{} low-yield: eligible {} min {} scan {scan_vol} copy {} freed {freed} \
                     survived {post_usage} total {}",
                    self.mode.collect_name(),
                    self.pre_usage,
                    self.obstack.detail.min_usage,
                    self.copy_vol,
                    self.obstack.total_usage(),
                );
            } else if config.gc_verbose >= 2 {
                log::debug!(
                    "{} eligible {} {} min {} survived {post_usage} work {work_vol} total {}",
                    self.mode.collect_name(),
                    self.pre_usage,
                    if self.pre_usage >= self.obstack.detail.min_usage {
                        ">="
                    } else {
                        "<"
                    },
                    self.obstack.detail.min_usage,
                    self.obstack.total_usage(),
                );
            }
        }

        (work_vol as f64 * config.gc_ratio) as usize
    }

    fn is_old_small_object(&self, robj: RObj) -> bool {
        Pos::from_raw(&self.obstack.detail.runtime.arena, robj.interior()) < self.mark_pos()
    }

    fn is_old_large_object(&self, robj: RObj) -> bool {
        // Safety: kind was checked as Large by the caller.
        let header = unsafe { LargeObjHeader::from_object(robj) };
        // Safety: live header.
        unsafe { header.as_ref() }.pos < self.mark_pos()
    }

    /// Fast path for a single root with no handles: objects without
    /// references move (or mark) without shadow bookkeeping.
    fn quick_collect_one(&mut self, root: &mut RObjOrFakePtr) -> bool {
        if self.obstack.any_handles() {
            // The general collector supports handles as roots.
            return false;
        }
        self.scan_count += 1;
        let Some(robj) = root.as_ptr() else {
            // A fake pointer (e.g. a returned short string) is always quick.
            return true;
        };
        match robj.memory_kind(&self.obstack.detail.runtime.arena) {
            Kind::Obstack => {
                let ty = robj.type_();
                if self.is_old_small_object(robj) {
                    // Old: no copying, maybe scanning.
                    let done = !ty.has_refs() || robj.is_frozen();
                    if done {
                        self.mark_count += 1;
                    }
                    return done;
                }
                if ty.has_refs() {
                    // Might reference other young objects; punt.
                    return false;
                }
                let obj_size = ObjectSize::of(robj, ty);
                let (read, _) = self.alloc_during_gc(obj_size);
                // No references to fix up, so copy straight to the final
                // address, ignoring the shadow; the ranges may overlap.
                if read != robj {
                    // Safety: both bodies are live with the same shape.
                    unsafe { obj_size.copy_overlapping(read, robj) };
                    root.set_ptr(read);
                }
                self.mark_count += 1;
                true
            }
            Kind::Large => {
                let ty = robj.type_();
                if self.is_old_large_object(robj) {
                    let done = !ty.has_refs() || robj.is_frozen();
                    if done {
                        self.mark_count += 1;
                    }
                    return done;
                }
                if ty.has_refs() {
                    return false;
                }
                // Young refless large object: just park it at the mark.
                // Safety: kind is Large.
                let mut header = unsafe { LargeObjHeader::from_object(robj) };
                // Safety: live header, single-owner obstack.
                unsafe { header.as_mut() }.pos = self.mark_pos();
                self.mark_count += 1;
                self.large_young_count += 1;
                true
            }
            Kind::IObj => {
                self.update_iobj(IObj::from_robj_unchecked(robj));
                true
            }
            Kind::Unknown => {
                // Not ours (a global?); leave it alone.
                true
            }
        }
    }

    fn visit_root(&mut self, root: &mut RObjOrFakePtr) {
        self.scan_count += 1;
        let Some(robj) = root.as_ptr() else { return };
        self.copy_object(robj, root);

        while let Some(item) = self.work_queue.pop() {
            // Safety: the work item's body is live (possibly in the
            // shadow buffer) and its slots come from its type's mask.
            unsafe {
                item.ty.any_ref(
                    item.target.as_ptr(),
                    Stripe::Gc,
                    &mut |slot| {
                        self.scan_count += 1;
                        let r = &mut *slot.cast::<RObjOrFakePtr>();
                        if let Some(obj) = r.as_ptr() {
                            self.copy_object(obj, r);
                        }
                        false
                    },
                );
            }
        }
    }

    /// Visit one reference. Marks the referent; young small objects are
    /// copied (leaving a forwarding pointer) and `reference` retargeted.
    fn copy_object(&mut self, robj: RObj, reference: &mut RObjOrFakePtr) {
        match robj.memory_kind(&self.obstack.detail.runtime.arena) {
            Kind::IObj => {
                return self.update_iobj(IObj::from_robj_unchecked(robj));
            }
            Kind::Large => {
                return self.update_large_object(robj);
            }
            Kind::Obstack => {}
            Kind::Unknown => {
                // No idea what this is; don't touch it.
                return;
            }
        }

        if self.is_old_small_object(robj) {
            // Old objects can't move, but may need scanning. Only count
            // it marked if we will actually scan it.
            let ty = robj.type_();
            if ty.has_refs() && !robj.is_frozen() && self.marked.insert(robj.addr()) {
                self.mark_count += 1;
                self.work_queue.push(WorkItem { target: robj, ty });
            }
            return;
        }

        if let crate::vtable::VTableSlot::Forwarded(target) = robj.vtable_slot() {
            // Already copied; just retarget the reference.
            reference.set_ptr(target);
            return;
        }

        self.mark_count += 1;
        let ty = robj.type_();
        let obj_size = ObjectSize::of(robj, ty);

        let (read, write) = self.alloc_during_gc(obj_size);
        // Copy now, fix up references later. The frozen bit travels with
        // the vtable word.
        // Safety: `write` is a fresh (shadow or chunk) block of the
        // right shape; `robj` is live.
        unsafe { obj_size.copy(write, robj) };

        robj.set_forwarded(read);

        if ty.has_refs() {
            self.work_queue.push(WorkItem { target: write, ty });
        }

        reference.set_ptr(read);
    }

    /// Allocate the copy's final address. `read` is the address every
    /// reference will use after collection; `write` is where the bytes
    /// go right now — inside the shadow buffer when the final address
    /// falls in the collect chunk, identical otherwise.
    fn alloc_during_gc(&mut self, obj_size: ObjectSize) -> (RObj, RObj) {
        let size = round_up(obj_size.total(), ALLOC_ALIGN);
        let raw = self.obstack.alloc_small(size);
        self.copy_vol += size;
        // Safety: metadata offset stays inside the fresh block.
        let read = unsafe { RObj::from_ptr(NonNull::new_unchecked(raw.add(obj_size.metadata))) };
        if Chunk::from_raw(read.addr()) != self.collect_chunk {
            return (read, read);
        }
        let offset = read.addr() & (CHUNK_SIZE - 1);
        // Safety: the shadow buffer spans a whole chunk.
        let write = unsafe {
            RObj::from_ptr(NonNull::new_unchecked(self.shadow.as_mut_ptr().add(offset)))
        };
        (read, write)
    }

    fn update_large_object(&mut self, robj: RObj) {
        if self.is_old_large_object(robj) {
            if self.marked.insert(robj.addr()) {
                // First sighting this collection: scan, don't move.
                self.work_queue.push(WorkItem {
                    target: robj,
                    ty: robj.type_(),
                });
                self.mark_count += 1;
            }
        } else {
            // Safety: kind is Large and the object is live.
            let mut header = unsafe { LargeObjHeader::from_object(robj) };
            // Safety: live header, single-owner obstack.
            let header = unsafe { header.as_mut() };
            if header.pos != self.mark_pos() {
                // Parking the position at the mark is the object's GC
                // mark; its placeholder guarantees later notes are newer.
                header.pos = self.mark_pos();
                self.work_queue.push(WorkItem {
                    target: robj,
                    ty: robj.type_(),
                });
                self.mark_count += 1;
                self.large_young_count += 1;
            }
        }
    }

    fn update_iobj(&mut self, iobj: IObj) {
        let delegate = iobj.refcount_delegate();
        let mark = self.collect_note.pred();
        let detail = &mut self.obstack.detail;

        if let Some(r) = detail.iobj_refs.get_mut(&delegate) {
            if r.pos > mark {
                // Known and young: mark it.
                r.pos = mark;
                self.mark_count += 1;
            }
            return;
        }

        // A reference the obstack didn't know about: user code saved a
        // pointer from inside a known iobj. Track it with a fresh count.
        let prev = detail.current_iobj;
        detail.iobj_refs.insert(delegate, IObjRef { pos: mark, prev });
        detail.current_iobj = Some(delegate);
        incref(delegate);
        detail.stats.modify_intern(1);
        self.mark_count += 1;
        // The sweep creates a placeholder if it survives.
    }

    fn copy_shadow_to_collect_chunk(&mut self) {
        let mut end_pos = Pos::from_raw(
            &self.obstack.detail.runtime.arena,
            self.obstack.next_alloc as usize,
        );
        if end_pos > self.collect_chunk.end_pos() {
            end_pos = self.collect_chunk.end_pos();
        }
        self.shadow_vol = end_pos.diff(self.collect_note) as usize;
        // Safety: copies the live prefix of the shadow back over the
        // collect chunk tail; both ranges are exactly `shadow_vol` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.shadow.as_ptr().add(self.collect_note.offset_in_chunk()),
                self.collect_addr,
                self.shadow_vol,
            );
        }
    }
}

#[derive(Default)]
struct SweepStats {
    large_young_survivors: usize,
}

fn sweep(obstack: &mut Obstack, note: Note, old_next_alloc: *mut u8) -> SweepStats {
    let mut stats = SweepStats::default();
    // If the note is empty we may allocate one placeholder for any
    // surviving extrefs.
    let collect_note = obstack.note_pos(note);
    let mark_pos = collect_note.pred();
    stats.large_young_survivors = sweep_large_objects(obstack, mark_pos, collect_note);
    sweep_chunks(obstack, Chunk::from_raw(note.ptr as usize), old_next_alloc);
    // Last, so refcount cascades may safely re-enter.
    sweep_iobjs(obstack, mark_pos, collect_note);
    stats
}

/// Visit large objects at positions >= `mark_pos`: anything younger is
/// reclaimed; anything parked exactly at the mark is re-linked (in
/// reverse order) at the collect note. Returns the survivor count.
fn sweep_large_objects(obstack: &mut Obstack, mark_pos: Pos, collect_note: Pos) -> usize {
    debug_assert!(mark_pos <= collect_note);
    let mut survivors = 0usize;

    // Safety note: the entire walk is over headers owned by this
    // obstack; survivors are re-linked in place via raw link slots.
    let mut last_prev_ptr: *mut Option<NonNull<LargeObjHeader>> =
        &mut obstack.detail.current_large_obj;
    let mut cursor = obstack.detail.current_large_obj;

    // Marked survivors had their pos changed but were not moved in the
    // chain, so the walk stops at the first pre-mark entry.
    while let Some(mut header_ptr) = cursor {
        // Safety: live header.
        let header = unsafe { header_ptr.as_mut() };
        if header.pos < mark_pos {
            break;
        }
        cursor = header.prev;

        if header.pos > mark_pos {
            // Unmarked young object: reclaim.
            obstack
                .detail
                .stats
                .modify_large(-1, -(header.size as i64));
            // Safety: unlinked, freed exactly once.
            unsafe { LargeObjHeader::free(&obstack.detail.runtime, header_ptr) };
        } else {
            // Marked: keep, re-attached at the collect note.
            header.pos = collect_note;
            // Safety: the link slot belongs to a header (or the list
            // head) we exclusively own.
            unsafe { *last_prev_ptr = Some(header_ptr) };
            last_prev_ptr = &mut header.prev;
            survivors += 1;
        }
    }
    // Safety: as above.
    unsafe { *last_prev_ptr = cursor };

    if survivors > 0 {
        obstack.allocate_placeholder(collect_note);
    }
    survivors
}

/// Return the evicted young chunks, newest first, stopping at (and
/// keeping) the chunk containing the collect note.
fn sweep_chunks(obstack: &mut Obstack, collect_chunk: Chunk, old_next_alloc: *mut u8) {
    let mut chunk = Chunk::from_raw(old_next_alloc as usize);
    if chunk == collect_chunk {
        return;
    }
    let mut delta = 0i64;
    loop {
        let prev = chunk.prev().expect("young chunk chain broken");
        obstack.detail.chunk_allocator.delete_chunk(chunk);
        delta -= 1;
        chunk = prev;
        if chunk == collect_chunk {
            break;
        }
    }
    obstack.detail.stats.modify_chunk(delta);
    obstack.detail.chunk_allocator.collect_garbage();
}

/// Walk young iobj references: marked ones re-link at the collect note,
/// the rest are dropped (their decref may cascade).
fn sweep_iobjs(obstack: &mut Obstack, mark_pos: Pos, collect_note: Pos) {
    let Some(current) = obstack.detail.current_iobj else {
        return;
    };
    if obstack.detail.iobj_refs[&current].pos < mark_pos {
        obstack.verify_invariants();
        return;
    }

    // Deferred full decrefs: run after re-linking so cascades see a
    // consistent obstack.
    let mut pending_decrefs: Vec<IObj> = Vec::new();

    let mut cursor = Some(current);
    let mut prev_saved: Option<IObj> = None;
    let mut oldest_saved: Option<IObj> = None;

    while let Some(iobj) = cursor {
        let (pos, prev) = {
            let r = &obstack.detail.iobj_refs[&iobj];
            (r.pos, r.prev)
        };
        if pos < mark_pos {
            break;
        }
        cursor = prev;

        if pos >= collect_note {
            // Young and unmarked: drop the reference.
            obstack.detail.stats.modify_intern(-1);
            obstack.detail.iobj_refs.remove(&iobj);
            if !decref_to_non_zero(iobj.refcount_atomic()) {
                pending_decrefs.push(iobj);
            }
        } else {
            // pos >= mark_pos and < collect_note implies pos == mark_pos.
            debug_assert_eq!(pos, mark_pos);
            let r = obstack.detail.iobj_refs.get_mut(&iobj).unwrap();
            r.pos = collect_note;
            r.prev = prev_saved;
            prev_saved = Some(iobj);
            if oldest_saved.is_none() {
                oldest_saved = Some(iobj);
            }
        }
    }

    if let Some(newest) = prev_saved {
        obstack.allocate_placeholder(collect_note);
        let oldest = oldest_saved.expect("survivor chain has an oldest entry");
        obstack.detail.iobj_refs.get_mut(&oldest).unwrap().prev = cursor;
        obstack.detail.current_iobj = Some(newest);
    } else {
        obstack.detail.current_iobj = cursor;
    }

    // Assumes large objects and chunks were swept first.
    obstack.verify_invariants();
    if !pending_decrefs.is_empty() {
        let runtime = obstack.detail.runtime.clone();
        for dead in pending_decrefs {
            decref(&runtime, dead);
        }
        obstack.verify_invariants();
    }
}

/// Move all allocations newer than `note` from `source` into `dest`,
/// along with every handle, leaving `source` an empty zombie.
pub(crate) fn steal_objects_and_handles(dest: &mut Obstack, note: Note, source: &mut Obstack) {
    let note_pos = dest.note_pos(note);

    if dest.config().verify_note {
        // Everything in the source must be strictly newer than the
        // note, so nothing needs repositioning after the move.
        let mut chunk = Some(Chunk::from_raw(source.next_alloc as usize));
        while let Some(c) = chunk {
            assert!(c.begin_pos() > note_pos);
            chunk = c.prev();
        }
        let mut large = source.detail.current_large_obj;
        while let Some(header) = large {
            // Safety: live header.
            let header = unsafe { header.as_ref() };
            assert!(header.pos > note_pos);
            large = header.prev;
        }
        let mut iobj = source.detail.current_iobj;
        while let Some(i) = iobj {
            let r = &source.detail.iobj_refs[&i];
            assert!(r.pos > note_pos);
            iobj = r.prev;
        }
    }

    // Absorb lifetime volume counters.
    let mut source_stats = core::mem::take(&mut source.detail.stats);
    dest.detail.stats.merge(&mut source_stats);

    if !source.is_empty() {
        // Renumber source chunk generations to lexically follow dest's
        // current highest generation, then splice the chains.
        let r#gen = |p: *const u8| Chunk::from_raw(p as usize).generation();
        let num_chunks = r#gen(source.next_alloc) - r#gen(note.ptr);
        let mut src_gen = r#gen(dest.next_alloc) + num_chunks;
        let mut chunk = Chunk::from_raw(source.next_alloc as usize);
        let mut stolen_chunks = 1i64;
        while let Some(prev) = chunk.prev() {
            chunk.set_generation(src_gen);
            src_gen -= 1;
            chunk = prev;
            stolen_chunks += 1;
        }
        debug_assert_eq!(src_gen, r#gen(dest.next_alloc) + 1);
        // set_prev also renumbers the oldest stolen chunk to follow dest.
        chunk.set_prev(Chunk::from_raw(dest.next_alloc as usize));
        dest.next_alloc = source.next_alloc;
        source.next_alloc = core::ptr::null_mut();
        dest.detail.stats.modify_chunk(stolen_chunks);

        // Chunks live in slabs; steal those too.
        let mut source_allocator =
            core::mem::replace(&mut source.detail.chunk_allocator, {
                // A fresh allocator keeps the zombie droppable.
                crate::obstack::chunk::ChunkAllocator::new(source.detail.runtime.clone())
            });
        dest.detail
            .chunk_allocator
            .steal_slabs(&mut source_allocator);

        // Prepend the source's large-object list. Their positions fall
        // within the renumbered chunk range, so they are already valid
        // in dest.
        if let Some(head) = source.detail.current_large_obj.take() {
            dest.allocate_placeholder(note_pos);
            let mut stolen = 0i64;
            let mut stolen_bytes = 0i64;
            let mut tail = head;
            loop {
                // Safety: live headers owned by source, now by dest.
                let h = unsafe { tail.as_ref() };
                stolen += 1;
                stolen_bytes += h.size as i64;
                match h.prev {
                    Some(prev) => tail = prev,
                    None => break,
                }
            }
            // Safety: `tail` is the oldest stolen header.
            unsafe { tail.as_mut().prev = dest.detail.current_large_obj };
            dest.detail.current_large_obj = Some(head);
            dest.detail.stats.modify_large(stolen, stolen_bytes);
        }

        // Transfer iobj references: ownership moves, counts only drop
        // when both sides tracked the same object.
        if source.detail.current_iobj.is_some() {
            dest.allocate_placeholder(note_pos);
            let mut cursor = source.detail.current_iobj;
            while let Some(iobj) = cursor {
                cursor = source.detail.iobj_refs[&iobj].prev;
                dest.steal_iobj(iobj, note_pos);
            }
            source.detail.current_iobj = None;
            source.detail.iobj_refs.clear();
        }
    }

    // Take ownership of every handle; even an empty source may own
    // handles wrapping null or fake pointers.
    let dest_owner = dest.detail.owner.clone();
    let mut handles: Vec<*const RObjHandle> = Vec::new();
    source.detail.handles.each_handle(|h| handles.push(h));
    for &ptr in &handles {
        // Safety: handles outlive their obstack registration; relinking
        // happens on the stealing thread, which owns both lists now.
        let handle = unsafe { &*ptr };
        handle.unlink();
        dest.detail.handles.prepend(handle);
        // Reassigning the owner is the only step other threads can
        // observe; it happens under the handle's own lock.
        handle.replace_owner(dest_owner.clone());
    }

    dest.verify_invariants();
}
