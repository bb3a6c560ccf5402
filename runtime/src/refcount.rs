// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Atomic reference counting for interned objects.
//!
//! Refcounts live in the interned metadata prefix. A few values are
//! sentinels rather than counts; cycle members delegate their count to
//! their cycle handle, so a whole strongly connected component lives and
//! dies as one.
//!
//! Freeing is a cascade, not a recursion: dead objects are chained
//! through their (now unused) `next` words, so freeing a list of a
//! million nodes uses constant stack.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::Runtime;
use crate::intern::free_intern_object;
use crate::obj::{IObj, pop_iobj, push_iobj};

pub type Refcount = u32;

/// Debugging value stored into just-freed memory.
pub const DEAD_REFCOUNT_SENTINEL: Refcount = -55i32 as u32;

/// "Allocated in interned memory, but not yet proven canonical."
pub const BEING_INTERNED_REFCOUNT_SENTINEL: Refcount = -66i32 as u32;

/// "Cycle member; refcounting is delegated to the cycle handle."
pub const CYCLE_MEMBER_REFCOUNT_SENTINEL: Refcount = -99i32 as u32;

/// The maximum legal refcount (inclusive).
pub const MAX_REFCOUNT: Refcount = CYCLE_MEMBER_REFCOUNT_SENTINEL - 1;

/// Increments the refcount of `obj`'s delegate.
pub fn incref(obj: IObj) {
    let rc = obj
        .refcount_delegate()
        .refcount_atomic()
        .fetch_add(1, Ordering::Relaxed);
    debug_assert!(rc < MAX_REFCOUNT);
}

/// Atomically decrement the refcount if that can be done without
/// reaching zero. Returns false (leaving the count alone) when the
/// current value is 1, so the caller can take a zero-reaching slow path.
pub fn decref_to_non_zero(refcount: &AtomicU32) -> bool {
    let mut rc = refcount.load(Ordering::Relaxed);
    // Not a sentinel-carrying object.
    debug_assert!(rc <= MAX_REFCOUNT);
    while rc > 1 {
        match refcount.compare_exchange_weak(rc, rc - 1, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => rc = actual,
        }
    }
    debug_assert!(rc > 0);
    false
}

/// Atomically increment the refcount, but only if it is currently
/// nonzero (and not dead). Used to safely take a strong reference
/// through a weak one: a zero count means the owner is already on its
/// way to freeing the object.
pub fn incref_from_non_zero(refcount: &AtomicU32) -> bool {
    let mut rc = refcount.load(Ordering::Relaxed);
    while rc > 0 && rc != DEAD_REFCOUNT_SENTINEL {
        debug_assert!(rc < MAX_REFCOUNT);
        match refcount.compare_exchange_weak(rc, rc + 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => rc = actual,
        }
    }
    false
}

/// Decrement `obj`'s refcount (it must not be a cycle member).
///
/// Returns true iff the count hit zero, in which case the object has
/// been removed from the intern table but its memory is still the
/// caller's to reclaim.
fn decref_non_cycle_member(rt: &Runtime, obj: IObj) -> bool {
    debug_assert!(!obj.is_cycle_member());

    let refcount = obj.refcount_atomic();
    if decref_to_non_zero(refcount) {
        return false;
    }

    if !obj.uses_intern_table() {
        return refcount.fetch_sub(1, Ordering::AcqRel) == 1;
    }

    // We hold the last strong ref, but the intern table still holds a
    // weak one, so another thread could find `obj` there and revive it.
    // Locking the bucket makes that impossible before we commit.
    let table = &rt.intern_table;
    let bucket = table.lock_object(obj);

    let rc = refcount.fetch_sub(1, Ordering::AcqRel) - 1;
    if rc == 0 {
        table.erase_and_unlock(bucket, obj);
        true
    } else {
        // Someone took a ref before we got the lock; the object lives on.
        table.unlock(bucket);
        debug_assert!(rc < MAX_REFCOUNT);
        false
    }
}

/// Decrements the refcount of `obj` (or its cycle handle), freeing the
/// object — and transitively everything it exclusively owns — when the
/// count reaches zero.
pub fn decref(rt: &Runtime, obj: IObj) {
    let obj = obj.refcount_delegate();

    if !decref_non_cycle_member(rt, obj) {
        return;
    }

    // Stack of dead objects whose refs still need dropping.
    let mut scan_stack: Option<IObj> = None;
    push_iobj(&mut scan_stack, obj);

    while scan_stack.is_some() {
        // Objects to scan for refs before we free anything from this
        // connected batch.
        let mut scan_before_free: Option<IObj> = None;
        push_iobj(&mut scan_before_free, pop_iobj(&mut scan_stack));

        // Objects to free once the scanning loop is done.
        let mut free_stack: Option<IObj> = None;

        // Inner loop: chase down all intra-cycle refs before freeing, so
        // no pointer is read after its target is recycled.
        while scan_before_free.is_some() {
            let dead = pop_iobj(&mut scan_before_free);
            debug_assert!(!dead.is_cycle_member());

            push_iobj(&mut free_stack, dead);

            // Safety: `dead` is no longer reachable by any other thread;
            // we own its graph during the cascade.
            unsafe {
                dead.each_valid_iref(|mut iref| {
                    if iref.is_cycle_member() {
                        let handle = iref.refcount_delegate();

                        if handle.current_refcount() == 0 {
                            // Member of an already-dead cycle. Give it an
                            // "infinite" count so it stops looking like a
                            // cycle member and further intra-cycle decrefs
                            // are harmless no-ops, then make sure it gets
                            // scanned before anything is freed.
                            iref.set_refcount(MAX_REFCOUNT);
                            push_iobj(&mut scan_before_free, iref);
                            return;
                        }

                        iref = handle;
                    }

                    if decref_non_cycle_member(rt, iref) {
                        push_iobj(&mut scan_stack, iref);
                    }
                });
            }
        }

        // Free the batch now, while it is still warm in cache.
        while free_stack.is_some() {
            free_intern_object(rt, pop_iobj(&mut free_stack));
        }
    }
}
