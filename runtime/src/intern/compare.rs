// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structural comparison of interned object graphs.
//!
//! Each object's sort key is conceptually the (possibly infinite) string
//! of local states produced by a breadth-first walk that does not stop
//! at revisited nodes. Comparing two nodes walks both graphs in
//! lockstep; the walk terminates because no pair of pointers ever needs
//! to be enqueued twice — any difference reachable from a repeated pair
//! would already be found by the earlier copy, which sits earlier in the
//! BFS queue.
//!
//! The pending queue MUST be a deque (FIFO), not a stack: with a stack,
//! orderings produced while short-circuiting would not be transitive.

use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::gc_type::Stripe;
use crate::obj::{IObj, IObjOrFakePtr};

/// Result of a [`deep_compare`]: negative, zero, or positive for less,
/// equal, greater. The ordering is arbitrary but total and transitive up
/// to isomorphism.
pub type DeepCmpResult = i64;

fn cmp_bits(a: u64, b: u64) -> DeepCmpResult {
    // Never returns i64::MIN, so callers may negate freely.
    (a < b) as i64 - (a > b) as i64
}

fn cmp_memory(a: *const u8, b: *const u8, len: usize) -> DeepCmpResult {
    // Safety: callers compare live object bodies of at least `len` bytes.
    let (sa, sb) = unsafe {
        (
            core::slice::from_raw_parts(a, len),
            core::slice::from_raw_parts(b, len),
        )
    };
    match sa.cmp(sb) {
        core::cmp::Ordering::Less => -1,
        core::cmp::Ordering::Equal => 0,
        core::cmp::Ordering::Greater => 1,
    }
}

/// Pairs already queued for comparison, canonicalized (lower address
/// first) since equality is symmetric.
type PairSet = HashSet<(usize, usize)>;

/// If the pair is obviously equal return 0; obviously unequal, a nonzero
/// ordering; otherwise defer it onto the BFS queue and optimistically
/// report 0.
fn quick_compare_or_defer(
    r1: IObjOrFakePtr,
    r2: IObjOrFakePtr,
    seen: &mut PairSet,
    pending: &mut VecDeque<(IObj, IObj)>,
    need_ordering: bool,
) -> DeepCmpResult {
    if r1 != r2 {
        let (i1, i2) = match (r1.as_ptr(), r2.as_ptr()) {
            (Some(i1), Some(i2)) => (i1, i2),
            // A fake pointer can only equal an identical fake pointer.
            _ => return cmp_bits(r1.bits() as u64, r2.bits() as u64),
        };
        if !need_ordering && i1.is_fully_interned_rc() && i2.is_fully_interned_rc() {
            // Distinct canonical objects cannot be isomorphic.
            return cmp_bits(r1.bits() as u64, r2.bits() as u64);
        }
        let key = (i1.addr().min(i2.addr()), i1.addr().max(i2.addr()));
        if seen.insert(key) {
            pending.push_back((i1, i2));
        }
    }
    0
}

pub(crate) fn deep_compare_impl(root1: IObj, root2: IObj, need_ordering: bool) -> DeepCmpResult {
    let mut pending: VecDeque<(IObj, IObj)> = VecDeque::new();
    let mut seen: PairSet = PairSet::new();

    let c = quick_compare_or_defer(
        IObjOrFakePtr::from_iobj(root1),
        IObjOrFakePtr::from_iobj(root2),
        &mut seen,
        &mut pending,
        need_ordering,
    );
    if c != 0 {
        return c;
    }

    while let Some((r1, r2)) = pending.pop_front() {
        // r1 != r2 here, and neither is fake or null.

        if r1.vtable() != r2.vtable() {
            return cmp_bits(
                r1.vtable().unfrozen_bits() as u64,
                r2.vtable().unfrozen_bits() as u64,
            );
        }

        // Sizes only differ for arrays and strings once vtables match.
        let size1 = r1.user_byte_size();
        let size2 = r2.user_byte_size();
        if size1 != size2 {
            return size1 as i64 - size2 as i64;
        }

        let mem1 = r1.as_ptr();
        let mem2 = r2.as_ptr();

        // Compare both bodies: the raw bytes between reference slots
        // directly, the references by deferring them onto the queue.
        let mut prev_end = 0usize;
        let mut verdict: DeepCmpResult = 0;
        // Safety: both objects are live and private to this comparison;
        // slots come from the shared type's ref mask.
        let stopped = unsafe {
            r1.robj()
                .type_()
                .any_ref(mem1, Stripe::Gc, &mut |slot| {
                    let offset = slot as usize - mem1 as usize;
                    let c = cmp_memory(
                        mem1.add(prev_end),
                        mem2.add(prev_end),
                        offset - prev_end,
                    );
                    if c != 0 {
                        verdict = c;
                        return true;
                    }
                    prev_end = offset + size_of::<usize>();

                    let n1 = *slot.cast::<IObjOrFakePtr>();
                    let n2 = *mem2.add(offset).cast::<IObjOrFakePtr>();
                    let c =
                        quick_compare_or_defer(n1, n2, &mut seen, &mut pending, need_ordering);
                    if c != 0 {
                        verdict = c;
                        return true;
                    }
                    false
                })
        };
        if stopped {
            return verdict;
        }

        // Bytes after the last reference.
        // Safety: `prev_end <= size1` by construction.
        let c = unsafe { cmp_memory(mem1.add(prev_end), mem2.add(prev_end), size1 - prev_end) };
        if c != 0 {
            return c;
        }
    }

    0
}

/// Total ordering (up to isomorphism) of the graphs rooted at `root1`
/// and `root2`.
pub fn deep_compare(root1: IObj, root2: IObj) -> DeepCmpResult {
    deep_compare_impl(root1, root2, true)
}

/// Equivalent to `deep_compare(root1, root2) == 0`, but faster: distinct
/// canonical interned objects short-circuit as unequal.
pub fn deep_equal(root1: IObj, root2: IObj) -> bool {
    deep_compare_impl(root1, root2, false) == 0
}
