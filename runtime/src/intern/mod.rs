// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cloning and interning arbitrary object graphs into the canonical
//! reference-counted heap.
//!
//! Acyclic graphs are easy: intern children before parents (Tarjan's
//! algorithm conveniently yields that order), replacing each reference
//! with its canonical pointer, then hash-cons the raw bits. A single
//! acyclic object whose references are all provably acyclic skips the
//! machinery entirely ([`simple_intern`]).
//!
//! Cycles are the hard part. Because interned objects are immutable we
//! can detect each strongly connected component at interning time, mark
//! every member with a sentinel refcount, and delegate all of their
//! counting to one `CycleHandle`; intra-cycle references are not
//! counted and the whole SCC lives and dies as one.
//!
//! Two cases need real care (the examples reappear in the integration
//! tests):
//!
//! 1. An SCC can be isomorphic to an already-interned cycle that it
//!    *points to* — even a single non-self-referential object can
//!    intern to a cycle member. [`find_equal_neighbor`] compares against
//!    the predecessors of every referenced cycle, and a hit maps the
//!    whole SCC onto the existing cycle by lockstep traversal
//!    ([`record_intern_mapping`]).
//! 2. An SCC may contain internal duplicates, and isomorphic SCCs must
//!    elect the same *root* no matter which member interning started
//!    from. [`intern_complex_scc`] partitions members by a local hash,
//!    discards duplicates with a `deep_compare`-keyed quicksort, elects
//!    the head of the smallest-hash partition, and hashes the cycle by
//!    a DFS from that root.

mod compare;

pub use compare::{DeepCmpResult, deep_compare, deep_equal};

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet, hash_map::Entry};

use crate::Runtime;
use crate::arena::Kind;
use crate::gc_type::{StateChange, Stripe};
use crate::obj::{CycleHandle, IObj, IObjOrFakePtr, IOBJ_METADATA_SIZE, RObj, RObjOrFakePtr};
use crate::refcount::{
    BEING_INTERNED_REFCOUNT_SENTINEL, CYCLE_MEMBER_REFCOUNT_SENTINEL, DEAD_REFCOUNT_SENTINEL,
    MAX_REFCOUNT, Refcount, decref, incref,
};
use crate::util::{hash_combine, hash_memory};
use crate::Result;

/// Transient interning state for one uninterned object, used by the
/// iterative Tarjan walk and the later steps. Nodes live in a bump arena
/// so their addresses stay stable while the side map grows.
struct TarjanNode {
    /// The tentative interned object for this node; not necessarily the
    /// final canonical pointer until interning completes.
    interned: Option<IObj>,
    /// DFS discovery order.
    index: usize,
    /// Smallest index reachable from this node, itself included.
    lowlink: usize,
    /// Tarjan stack / partition list link.
    next: Option<NonNull<TarjanNode>>,
    /// DFS parent, for the iterative walk.
    prev: Option<NonNull<TarjanNode>>,
    in_cycle: bool,
    /// Used by `record_intern_mapping`.
    visited: bool,
    points_to_interned_cycle: bool,
    /// Visit order while hashing a cycle; 0 means unvisited.
    dfs_order: usize,
    local_hash: u64,
}

impl TarjanNode {
    fn new(index: usize) -> Self {
        Self {
            interned: None,
            index,
            lowlink: index,
            next: None,
            prev: None,
            in_cycle: false,
            visited: false,
            points_to_interned_cycle: false,
            dfs_order: 0,
            local_hash: 0,
        }
    }
}

/// The object's `next` word doubles as its TarjanNode link while
/// interning is in progress.
fn tarjan_node_of(iobj: IObj) -> NonNull<TarjanNode> {
    NonNull::new(iobj.next_word() as *mut TarjanNode).expect("object has no interning node")
}

fn set_tarjan_node(iobj: IObj, node: NonNull<TarjanNode>) {
    iobj.set_next_word(node.as_ptr() as usize);
}

// Safety: nodes live in the per-intern bump arena, are only reachable
// from this interning call, and no two live `&mut` borrows overlap.
unsafe fn node_mut<'a>(p: NonNull<TarjanNode>) -> &'a mut TarjanNode {
    unsafe { &mut *p.as_ptr() }
}

/// Allocation size of an interned body for `robj`'s type and size.
fn interned_layout(metadata_size: usize, user_size: usize) -> Layout {
    // A zero-size body would make the first user address fall outside
    // the allocation, breaking provenance lookups.
    let bytes = metadata_size + user_size.max(crate::obj::ALLOC_ALIGN);
    Layout::from_size_align(bytes, crate::obj::ALLOC_ALIGN).unwrap()
}

/// Allocates a shallow clone of `obj` in the interned heap with
/// refcount 1. Referenced objects are not incref'd (the references may
/// still point at uninterned memory).
///
/// The clone has interned layout and lives in interned memory but is
/// *not yet interned*; that is the caller's job.
pub(crate) fn shallow_clone_into_intern(rt: &Runtime, obj: RObj) -> Result<IObj> {
    let ty = obj.type_();
    let interned_meta = ty.interned_metadata_byte_size();
    let uninterned_meta = ty.uninterned_metadata_byte_size();
    let user_size = obj.user_byte_size();
    debug_assert!(interned_meta >= IOBJ_METADATA_SIZE);

    let layout = interned_layout(interned_meta, user_size);
    let raw = rt.arena.alloc(layout.size(), Kind::IObj)?;

    // Safety: the new block holds `interned_meta + user_size` bytes; the
    // copy brings over the vtable word (and array size) together with
    // the body.
    let body = unsafe {
        core::ptr::copy_nonoverlapping(
            obj.as_ptr().sub(uninterned_meta),
            raw.as_ptr().add(interned_meta - uninterned_meta),
            user_size + uninterned_meta,
        );
        raw.add(interned_meta)
    };

    let iobj = IObj::from_ptr(body);
    iobj.set_next_word(0);
    iobj.set_refcount(1);
    Ok(iobj)
}

/// Frees an object created by [`shallow_clone_into_intern`] (or a cycle
/// handle). Does not decref any referenced objects.
pub(crate) fn free_intern_object(rt: &Runtime, obj: IObj) {
    if let Some(handler) = obj.type_().state_change_handler() {
        handler(obj, StateChange::Finalize);
    }

    #[cfg(debug_assertions)]
    {
        assert_ne!(obj.current_refcount(), DEAD_REFCOUNT_SENTINEL, "double free");
        obj.set_refcount(DEAD_REFCOUNT_SENTINEL);
    }

    let ty = obj.type_();
    let layout = interned_layout(ty.interned_metadata_byte_size(), obj.user_byte_size());
    // Safety: the allocation began `interned_metadata` bytes before the
    // body and was produced by this arena with this layout.
    unsafe {
        let raw = NonNull::new_unchecked(obj.as_ptr().sub(ty.interned_metadata_byte_size()));
        rt.arena.free(raw, layout, Kind::IObj);
    }
}

/// An interned object already proven not to be part of any cycle. Its
/// pointer value is fixed, so it is safe to hash and compare bitwise.
///
/// False for objects still being interned (their intra-SCC pointer
/// values are not final) and for members of pre-interned cycles (the SCC
/// being interned might be isomorphic to theirs).
fn is_definitely_acyclic(iobj: IObj) -> bool {
    let rc = iobj.current_refcount();
    debug_assert!(rc < DEAD_REFCOUNT_SENTINEL);
    rc <= MAX_REFCOUNT
}

fn is_definitely_acyclic_robj(rt: &Runtime, robj: RObj) -> bool {
    robj.as_interned(&rt.arena).is_some_and(is_definitely_acyclic)
}

/// Interns an object whose references are all known canonical.
fn intern_object_with_known_refs(rt: &Runtime, robj: RObj) -> Result<IObj> {
    let hash = robj.hash();
    let table = &rt.intern_table;
    let bucket = table.lock_hash(hash);

    if let Some(existing) = table.find_assuming_locked(&bucket, robj, hash) {
        // An equal object is already interned.
        incref(existing);
        table.unlock(bucket);

        if let Some(iobj) = robj.as_interned(&rt.arena) {
            // We had allocated storage we no longer need.
            debug_assert_eq!(iobj.current_refcount(), BEING_INTERNED_REFCOUNT_SENTINEL);
            free_intern_object(rt, iobj);
        }

        return Ok(existing);
    }

    let iobj = match robj.as_interned(&rt.arena) {
        Some(iobj) => {
            // Promote the tentative clone to fully interned.
            debug_assert_eq!(iobj.current_refcount(), BEING_INTERNED_REFCOUNT_SENTINEL);
            iobj.set_refcount(1);
            iobj
        }
        None => {
            let iobj = shallow_clone_into_intern(rt, robj)?;
            iobj.robj().set_frozen();
            iobj
        }
    };

    // Safety: `iobj` is not yet visible to other threads.
    unsafe {
        iobj.each_valid_iref(incref);
    }

    // Run the initializer under the bucket lock so nobody sees the
    // object before it runs.
    if let Some(handler) = iobj.type_().state_change_handler() {
        handler(iobj, StateChange::Initialize);
    }

    table.insert_and_unlock(bucket, iobj, hash);
    Ok(iobj)
}

/// Fast path: intern `robj` only if every reference is definitely
/// acyclic. Returns `None` when the slow path must run.
fn simple_intern(rt: &Runtime, robj: RObj) -> Result<Option<IObj>> {
    debug_assert!(!robj.is_interned(&rt.arena));

    // Safety: the caller owns `robj` for the duration of interning.
    let maybe_cyclic =
        unsafe { robj.any_valid_ref(Stripe::Gc, |r| !is_definitely_acyclic_robj(rt, r)) };
    if maybe_cyclic {
        return Ok(None);
    }

    intern_object_with_known_refs(rt, robj).map(Some)
}

/// Hash of everything about `iobj` that cannot change however the
/// current SCC ends up interned: the vtable, array size, non-reference
/// bytes, and the pointer values of definitely-acyclic references.
fn compute_local_hash(rt: &Runtime, iobj: IObj) -> u64 {
    let vtable = iobj.vtable();
    let mut hash = vtable.unfrozen_bits() as u64;

    if vtable.is_array() {
        hash = hash_combine(hash, iobj.array_size() as u64);
    }

    let base = iobj.as_ptr();
    let mut prev_end = 0usize;

    // Safety: the clone is private to this interning call.
    unsafe {
        iobj.robj()
            .type_()
            .any_ref(base, Stripe::Gc, &mut |slot| {
                let word = *slot.cast::<IObjOrFakePtr>();
                if let Some(iref) = word.as_ptr() {
                    if !is_definitely_acyclic(iref) {
                        // Skip this reference: hash the bytes since the
                        // previous skip, then resume after the slot.
                        let start = slot as usize - base as usize;
                        if start != prev_end {
                            hash = hash_memory(base.add(prev_end), start - prev_end, hash);
                        }
                        prev_end = start + size_of::<usize>();
                    }
                }
                false
            });

        let remaining = iobj.user_byte_size() - prev_end;
        if remaining != 0 {
            hash = hash_memory(base.add(prev_end), remaining, hash);
        }
    }

    if rt.force_local_hash_zero.load(Ordering::Relaxed) {
        0
    } else {
        hash
    }
}

/// If `iobj` (which references `cycle_member`) is isomorphic to some
/// predecessor of `cycle_member` within the same SCC, return that
/// predecessor.
fn find_equal_predecessor(iobj: IObj, cycle_member: IObj) -> Option<IObj> {
    // The refcount delegate uniquely identifies the SCC.
    let handle = cycle_member.refcount_delegate();
    debug_assert_ne!(cycle_member, handle);

    let mut seen: HashSet<IObj> = HashSet::new();
    seen.insert(cycle_member);
    let mut stack = vec![cycle_member];

    while let Some(n) = stack.pop() {
        let mut compared = false;
        // Safety: fully interned objects are immutable.
        let found = unsafe {
            n.any_valid_iref(|r| {
                // Only consider objects in the same SCC.
                if r.refcount_delegate() == handle {
                    // If n points at cycle_member it is a predecessor.
                    if r == cycle_member && !compared {
                        if deep_equal(iobj, n) {
                            return true;
                        }
                        compared = true;
                    }
                    if seen.insert(r) {
                        stack.push(r);
                    }
                }
                false
            })
        };
        if found {
            return Some(n);
        }
    }

    None
}

/// Record that `dup` (uninterned) equals `canonical` (a member of an
/// interned cycle). The isomorphism extends to everything `dup` points
/// at, so the lockstep walk maps each uninterned object's TarjanNode to
/// the corresponding canonical member and frees the abandoned clones.
fn record_intern_mapping(rt: &Runtime, dup: IObj, canonical: IObj) {
    debug_assert!(!dup.is_fully_interned_rc());
    debug_assert!(canonical.is_fully_interned_rc());

    let mut dead: Vec<IObj> = Vec::new();
    let mut stack: Vec<(IObj, IObj)> = vec![(dup, canonical)];
    // Safety: node pointers were installed by this interning call.
    unsafe { node_mut(tarjan_node_of(dup)).visited = true };

    while let Some((r1, r2)) = stack.pop() {
        debug_assert!(!r1.is_fully_interned_rc());
        debug_assert!(r2.is_fully_interned_rc());
        debug_assert!(r2.is_cycle_member());
        debug_assert_eq!(r2.refcount_delegate(), canonical.refcount_delegate());
        debug_assert!(r1.vtable() == r2.vtable());

        let mem1 = r1.as_ptr();
        let mem2 = r2.as_ptr();

        // Safety: r1 is a private clone; r2 is immutable.
        unsafe {
            r1.robj()
                .type_()
                .any_ref(mem1, Stripe::Gc, &mut |slot| {
                    let word = *slot.cast::<IObjOrFakePtr>();
                    if let Some(n1) = word.as_ptr() {
                        if !n1.is_fully_interned_rc() {
                            let x = node_mut(tarjan_node_of(n1));
                            if !x.visited {
                                x.visited = true;
                                let offset = slot as usize - mem1 as usize;
                                let n2 = (*mem2.add(offset).cast::<IObjOrFakePtr>())
                                    .as_ptr()
                                    .expect("lockstep walk diverged");
                                stack.push((n1, n2));
                            }
                        }
                    }
                    false
                });

            let node = node_mut(tarjan_node_of(r1));
            node.interned = Some(r2);
        }
        incref(r2);

        dead.push(r1);
    }

    for d in dead {
        free_intern_object(rt, d);
    }
}

/// Check whether any SCC member is isomorphic to a member of an
/// already-interned cycle it references; if so, map the whole SCC onto
/// that cycle.
fn find_equal_neighbor(rt: &Runtime, scc_list: NonNull<TarjanNode>) -> bool {
    let mut cycles_seen: HashSet<IObj> = HashSet::new();

    let mut cursor = Some(scc_list);
    while let Some(p) = cursor {
        // Safety: nodes are alive for the whole interning call.
        let n = unsafe { node_mut(p) };
        cursor = n.next;
        if !n.points_to_interned_cycle {
            continue;
        }
        let iobj = n.interned.expect("unpopulated SCC node");
        // Safety: the clone is private to this interning call.
        let found = unsafe {
            iobj.any_valid_iref(|r| {
                if r.is_cycle_member() && cycles_seen.insert(r.refcount_delegate()) {
                    if let Some(eq) = find_equal_predecessor(iobj, r) {
                        record_intern_mapping(rt, iobj, eq);
                        return true;
                    }
                }
                false
            })
        };
        if found {
            return true;
        }
    }

    false
}

/// Sort a partition list with `deep_compare`, discarding objects equal
/// to the pivot (their TarjanNode pointer is redirected to the pivot's
/// node). Returns the sorted head, chained onto `following`.
fn qsort_and_deduplicate(
    list: Option<NonNull<TarjanNode>>,
    following: Option<NonNull<TarjanNode>>,
) -> Option<NonNull<TarjanNode>> {
    let Some(pivot_ptr) = list else {
        return following;
    };

    // The list comes from a graph walk, so the first entry is as good a
    // pivot as any.
    // Safety: nodes are alive and uniquely borrowed in turn.
    let (mut rest, pivot_obj) = unsafe {
        let pivot = node_mut(pivot_ptr);
        let rest = pivot.next;
        pivot.next = None;
        (rest, pivot.interned.expect("unpopulated SCC node"))
    };

    // partitions[0]: less than pivot; partitions[1]: greater.
    let mut partitions: [Option<NonNull<TarjanNode>>; 2] = [None, None];
    while let Some(p) = rest {
        // Safety: as above.
        let n = unsafe { node_mut(p) };
        rest = n.next;

        let c = deep_compare(n.interned.expect("unpopulated SCC node"), pivot_obj);
        if c != 0 {
            let which = usize::from(c > 0);
            n.next = partitions[which];
            partitions[which] = Some(p);
        } else {
            // Redundant duplicate inside the SCC; later lookups through
            // the object must find the pivot's node.
            set_tarjan_node(n.interned.unwrap(), pivot_ptr);
        }
    }

    // Safety: pivot is no longer aliased by the partition walk.
    unsafe {
        node_mut(pivot_ptr).next = qsort_and_deduplicate(partitions[1], following);
    }
    qsort_and_deduplicate(partitions[0], Some(pivot_ptr))
}

/// Rewrite every intra-SCC reference to its surviving interned body and
/// compute the whole-cycle hash by DFS from `root`, mixing each visited
/// node's local hash and its visit order.
fn canonicalize_refs_and_hash(root: NonNull<TarjanNode>) -> u64 {
    // Safety: node borrows in this function never overlap.
    let mut hash = unsafe { node_mut(root).local_hash };

    let mut dfs_order = 1usize;
    unsafe { node_mut(root).dfs_order = dfs_order };

    let mut stack = vec![root];
    while let Some(p) = stack.pop() {
        // Safety: as above.
        let iobj = unsafe { node_mut(p).interned.expect("unpopulated SCC node") };

        // Safety: the clone is private; slot rewrites are the point.
        unsafe {
            iobj.for_each_iref(|slot| {
                let Some(r) = slot.as_ptr() else { return };
                if r.is_fully_interned_rc() {
                    return;
                }
                let child_ptr = tarjan_node_of(r);
                let child = node_mut(child_ptr);
                // Snap the reference to the canonical member.
                slot.set_ptr(child.interned.expect("unpopulated SCC node"));

                if child.dfs_order == 0 {
                    dfs_order += 1;
                    child.dfs_order = dfs_order;
                    stack.push(child_ptr);
                }

                hash = hash_combine(hash, child.local_hash);
                // Mix in the visit order too, in case a pathological
                // graph has many equal local hashes; it encodes edge
                // structure.
                hash = hash_combine(hash, dfs_order as u64);
            });
        }
    }

    hash
}

fn cycle_handle_factory(rt: &Runtime, hash: u64, root: IObj) -> Result<CycleHandle> {
    let ty = &rt.cycle_handle_type;
    let meta = ty.interned_metadata_byte_size();
    let raw = rt.arena.calloc(meta + CycleHandle::USER_BYTE_SIZE, Kind::IObj)?;
    // Safety: fresh allocation sized for metadata + body.
    let body = unsafe { raw.add(meta) };

    let iobj = IObj::from_ptr(body);
    iobj.robj().set_vtable(rt.cycle_handle_vtable.frozen_ref());
    iobj.set_next_word(0);
    iobj.set_refcount(1);

    let handle = CycleHandle::from_iobj(iobj);
    handle.set_root(root);
    handle.set_cycle_hash(hash);
    Ok(handle)
}

/// Intern a nontrivial SCC known (via [`find_equal_neighbor`]) not to
/// duplicate an already-interned neighbor cycle.
fn intern_complex_scc(rt: &Runtime, scc_list: NonNull<TarjanNode>) -> Result<()> {
    // Partition by local hash; unequal hashes can never be equal objects.
    let mut partitions: HashMap<u64, NonNull<TarjanNode>> = HashMap::new();
    let mut cursor = Some(scc_list);
    while let Some(p) = cursor {
        // Safety: node borrows never overlap.
        let n = unsafe { node_mut(p) };
        cursor = n.next;
        n.local_hash = compute_local_hash(rt, n.interned.expect("unpopulated SCC node"));
        match partitions.entry(n.local_hash) {
            Entry::Vacant(v) => {
                n.next = None;
                v.insert(p);
            }
            Entry::Occupied(mut o) => {
                n.next = Some(*o.get());
                o.insert(p);
            }
        }
    }

    // Quicksort each partition to drop duplicates, accumulating all
    // survivors into one list; elect the cycle root deterministically:
    // the sorted head of the partition with the smallest local hash.
    // Anyone interning an isomorphic SCC from any starting member
    // arrives at the same root.
    let mut head: Option<NonNull<TarjanNode>> = None;
    let mut root: Option<(u64, NonNull<TarjanNode>)> = None;
    for (&local_hash, &list) in &partitions {
        head = qsort_and_deduplicate(Some(list), head);
        match root {
            Some((best, _)) if best <= local_hash => {}
            _ => root = Some((local_hash, head.unwrap())),
        }
    }
    let (_, root) = root.expect("empty SCC");

    let hash = canonicalize_refs_and_hash(root);
    // Safety: borrows of distinct nodes.
    let root_obj = unsafe { node_mut(root).interned.expect("unpopulated SCC node") };

    let handle = cycle_handle_factory(rt, hash, root_obj)?;

    let table = &rt.intern_table;
    let bucket = table.lock_hash(hash);

    if let Some(existing) = table.find_assuming_locked(&bucket, handle.iobj().robj(), hash) {
        // This cycle already exists; reuse it.
        free_intern_object(rt, handle.iobj());
        let old = CycleHandle::from_iobj(existing);
        record_intern_mapping(rt, root_obj, old.root());
        table.unlock(bucket);
        return Ok(());
    }

    // Keeping this cycle: count external references, then mark members.
    let mut cursor = head;
    while let Some(p) = cursor {
        // Safety: as above.
        let n = unsafe { node_mut(p) };
        cursor = n.next;
        // Safety: clones are private until the insert below publishes.
        unsafe {
            n.interned.unwrap().each_valid_iref(|r| {
                if r.is_fully_interned_rc() {
                    incref(r);
                }
            });
        }
    }

    let mut scc_size: Refcount = 0;
    let mut cursor = head;
    while let Some(p) = cursor {
        // Safety: as above.
        let n = unsafe { node_mut(p) };
        cursor = n.next;
        scc_size += 1;

        let member = n.interned.unwrap();
        member.set_refcount(CYCLE_MEMBER_REFCOUNT_SENTINEL);
        // Delegate refcounting through the next word.
        member.set_next_obj(Some(handle.iobj()));

        if let Some(handler) = member.type_().state_change_handler() {
            handler(member, StateChange::Initialize);
        }
    }

    // Each member contributes one count to the handle.
    handle.iobj().set_refcount(scc_size);

    table.insert_and_unlock(bucket, handle.iobj(), hash);
    Ok(())
}

/// The general path: partition the graph reachable from `root` into
/// strongly connected components with an iterative Tarjan walk,
/// interning each SCC as soon as it completes (children before parents).
fn partition_into_sccs_and_intern(rt: &Runtime, root: RObj) -> Result<IObj> {
    // Node addresses must survive map growth; hence the bump arena
    // behind a plain pointer map.
    let bump = Bump::new();
    let mut obj_to_node: HashMap<RObj, NonNull<TarjanNode>> = HashMap::new();

    // Pending reference slots of the nodes on the DFS path, LIFO. `None`
    // is the backtrack sentinel pushed below each node's slots.
    let mut refs: Vec<Option<NonNull<RObjOrFakePtr>>> = Vec::new();

    let alloc_node = |bump: &Bump, index: usize| -> NonNull<TarjanNode> {
        NonNull::from(bump.alloc(TarjanNode::new(index)))
    };

    // Clone an object into interned storage and adopt it into `node`.
    let populate = |node: NonNull<TarjanNode>, robj: RObj| -> Result<()> {
        let iobj = shallow_clone_into_intern(rt, robj)?;
        iobj.robj().set_frozen();
        iobj.set_refcount(BEING_INTERNED_REFCOUNT_SENTINEL);
        // Safety: freshly allocated node, no other borrows.
        unsafe { node_mut(node).interned = Some(iobj) };
        set_tarjan_node(iobj, node);
        Ok(())
    };

    let populate_refs = |refs: &mut Vec<Option<NonNull<RObjOrFakePtr>>>,
                         node: NonNull<TarjanNode>| {
        refs.push(None);
        // Safety: the clone's slots are private to this call.
        let iobj = unsafe { node_mut(node).interned.expect("unpopulated node") };
        unsafe {
            iobj.robj().type_().any_ref(
                iobj.as_ptr(),
                Stripe::Gc,
                &mut |slot| {
                    if (*slot.cast::<RObjOrFakePtr>()).is_ptr() {
                        refs.push(Some(NonNull::new_unchecked(slot.cast())));
                    }
                    false
                },
            );
        }
    };

    let root_node = alloc_node(&bump, 0);
    obj_to_node.insert(root, root_node);
    populate(root_node, root)?;
    populate_refs(&mut refs, root_node);

    let mut curr = root_node;
    // Safety: single borrow.
    unsafe { node_mut(curr).next = None };
    let mut stack: Option<NonNull<TarjanNode>> = Some(curr);

    loop {
        let top = *refs.last().expect("ref stack underflow");
        if let Some(slot) = top {
            // Safety: the slot belongs to a clone on the DFS path.
            let next_robj = unsafe { slot.as_ref() }
                .as_ptr()
                .expect("only valid refs are pushed");

            let mut next_iobj = next_robj.as_interned(&rt.arena);
            if next_iobj.is_none() {
                let index = obj_to_node.len();
                let (mut next_node, fresh) = match obj_to_node.entry(next_robj) {
                    Entry::Occupied(o) => (*o.get(), false),
                    Entry::Vacant(v) => {
                        let n = alloc_node(&bump, index);
                        v.insert(n);
                        (n, true)
                    }
                };

                if fresh {
                    if let Some(easy) = simple_intern(rt, next_robj)? {
                        // A quick acyclic intern; no recursion needed.
                        // Safety: fresh node, single borrow.
                        unsafe { node_mut(next_node).interned = Some(easy) };
                    } else {
                        populate(next_node, next_robj)?;
                        populate_refs(&mut refs, next_node);
                        // Safety: distinct nodes.
                        unsafe {
                            let n = node_mut(next_node);
                            n.prev = Some(curr);
                            n.next = stack;
                        }
                        stack = Some(next_node);

                        // "Recurse" into the child.
                        curr = next_node;
                        continue;
                    }
                } else {
                    // Seen before. If it is not fully interned it is
                    // still on the Tarjan stack (after accounting for
                    // duplicate merges), which makes this a back edge.
                    // Safety: borrows of distinct nodes, sequenced.
                    unsafe {
                        let mut n = next_node;
                        if !node_mut(n).interned.expect("visited node").is_fully_interned_rc() {
                            n = tarjan_node_of(node_mut(n).interned.unwrap());
                            next_node = n;
                            if !node_mut(n).interned.unwrap().is_fully_interned_rc() {
                                let n_index = node_mut(n).index;
                                let c = node_mut(curr);
                                c.lowlink = c.lowlink.min(n_index);
                                c.in_cycle = true;
                            }
                        }
                    }
                }
                // Safety: single borrow.
                next_iobj = unsafe { node_mut(next_node).interned };
            }

            let next_iobj = next_iobj.expect("child without interned object");
            // Replace the reference with its interned equivalent.
            // Safety: the slot is in a private clone.
            unsafe { (*slot.as_ptr()).set_ptr(next_iobj.robj()) };
            // Safety: single borrow.
            unsafe {
                node_mut(curr).points_to_interned_cycle |= next_iobj.is_cycle_member();
            }
        } else {
            // Finished the current node's references.
            refs.pop(); // the backtrack sentinel

            // Safety: borrows sequenced, never overlapping.
            unsafe {
                if node_mut(curr).lowlink == node_mut(curr).index {
                    // Found an SCC; intern it immediately.
                    let scc_list = stack.expect("empty Tarjan stack");
                    stack = node_mut(curr).next;
                    node_mut(curr).next = None;

                    if !find_equal_neighbor(rt, scc_list) {
                        let one_node = node_mut(scc_list).next.is_none();
                        if one_node && !node_mut(scc_list).in_cycle {
                            // A simple acyclic node after all.
                            let clone = node_mut(curr).interned.expect("unpopulated node");
                            let interned = intern_object_with_known_refs(rt, clone.robj())?;
                            node_mut(curr).interned = Some(interned);
                        } else {
                            intern_complex_scc(rt, scc_list)?;
                        }
                    }

                    // The Tarjan root is always the head (and therefore
                    // the pivot) of its local-hash partition, so its
                    // clone is never discarded as a duplicate.
                    debug_assert!(node_mut(curr).interned.unwrap().is_fully_interned_rc());
                }

                debug_assert_eq!(refs.is_empty(), node_mut(curr).prev.is_none());
                if let Some(prev) = node_mut(curr).prev {
                    // Tell the parent about our interned result. This can
                    // still change if both end up in the same SCC and the
                    // current object turns out to be a duplicate.
                    let result = node_mut(curr).interned.expect("unpopulated node");
                    let parent_slot = refs.last().expect("parent slot missing").unwrap();
                    (*parent_slot.as_ptr()).set_ptr(result.robj());

                    node_mut(prev).points_to_interned_cycle |= result.is_cycle_member();

                    let low = node_mut(curr).lowlink;
                    let p = node_mut(prev);
                    p.lowlink = p.lowlink.min(low);
                    curr = prev;
                } else {
                    break;
                }
            }
        }

        // Advance past the reference just processed.
        refs.pop();
    }

    // The root may itself have been merged into a duplicate.
    // Safety: borrows sequenced.
    let ret = unsafe {
        let mut rn = root_node;
        if !node_mut(rn).interned.expect("unpopulated root").is_fully_interned_rc() {
            rn = tarjan_node_of(node_mut(rn).interned.unwrap());
        }
        node_mut(rn).interned.expect("root not interned")
    };
    incref(ret);

    // Drop the transient references held by the TarjanNodes.
    for (&robj, &node) in &obj_to_node {
        rt.intern_stats.accrue(robj);
        // Safety: final pass, single borrow per node.
        if let Some(iobj) = unsafe { node_mut(node).interned } {
            if !iobj.is_fully_interned_rc() {
                // A duplicate that got discarded.
                free_intern_object(rt, iobj);
            } else {
                decref(rt, iobj);
            }
        }
    }

    debug_assert!(ret.is_fully_interned_rc());
    Ok(ret)
}

/// Interns the graph rooted at `robj`, returning the canonical
/// interned object with an incremented refcount.
pub(crate) fn intern(rt: &Runtime, robj: RObj) -> Result<IObj> {
    if let Some(ret) = robj.as_interned(&rt.arena) {
        // Already interned: just take a reference.
        incref(ret);
        Ok(ret)
    } else if let Some(easy) = simple_intern(rt, robj)? {
        rt.intern_stats.accrue(robj);
        Ok(easy)
    } else {
        partition_into_sccs_and_intern(rt, robj)
    }
}

/// Interns a maybe-fake reference; fake pointers intern to themselves.
pub(crate) fn intern_or_fake(rt: &Runtime, p: RObjOrFakePtr) -> Result<IObjOrFakePtr> {
    match p.as_ptr() {
        Some(robj) => intern(rt, robj).map(IObjOrFakePtr::from_iobj),
        None => Ok(IObjOrFakePtr::from_bits(p.bits())),
    }
}

/// Test hook: force every local hash to zero, exercising the
/// collision-handling paths of cycle interning.
pub fn force_fake_local_hash_collisions(rt: &Runtime, force: bool) -> bool {
    rt.force_local_hash_zero.swap(force, Ordering::Relaxed)
}
