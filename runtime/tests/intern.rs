// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interning end to end: the fast path, cycles, isomorphic-cycle
//! deduplication, and the refcount engine.

mod common;

use common::*;
use molt_runtime::obj::RObjOrFakePtr;
use molt_runtime::refcount::CYCLE_MEMBER_REFCOUNT_SENTINEL;
use molt_runtime::{Obstack, deep_compare, deep_equal, force_fake_local_hash_collisions};

#[test]
fn simple_intern_twice() {
    for rt in [checked_runtime(), checked_malloc_runtime()] {
        let mut ob = Obstack::new(rt.clone());
        let tt = TestType::class("Point", 0, 3);

        let a = alloc_obj(&mut ob, &tt);
        set_word(a, 0, 10);
        set_word(a, 1, 20);
        set_word(a, 2, 30);

        let i1 = rt.intern(a).unwrap();
        assert_eq!(rt.intern_table_size(), 1);
        assert_eq!(i1.current_refcount(), 1);
        assert!(i1.robj().is_frozen());
        assert_eq!(get_word(i1.robj(), 0), 10);
        assert_eq!(get_word(i1.robj(), 2), 30);

        let i2 = rt.intern(a).unwrap();
        assert_eq!(i1, i2);
        assert_eq!(rt.intern_table_size(), 1);
        assert_eq!(i1.current_refcount(), 2);

        rt.verify_intern_table();

        rt.decref(i1);
        assert_eq!(i1.current_refcount(), 1);
        rt.decref(i2);
        assert_eq!(rt.intern_table_size(), 0);
        rt.verify_intern_table();
    }
}

#[test]
fn intern_is_idempotent() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Pair", 0, 2);

    let a = alloc_obj(&mut ob, &tt);
    set_word(a, 0, 1);
    set_word(a, 1, 2);

    let i1 = rt.intern(a).unwrap();
    // Interning the interned body returns the same pointer with one
    // more reference.
    let i2 = rt.intern(i1.robj()).unwrap();
    assert_eq!(i1, i2);
    assert_eq!(i1.current_refcount(), 2);

    rt.decref(i1);
    rt.decref(i2);
}

#[test]
fn isomorphic_graphs_intern_to_one_object() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let node = TestType::class("Node", 1, 1);
    let leaf = TestType::class("Leaf", 0, 1);

    let build = |ob: &mut Obstack| {
        let l = alloc_obj(ob, &leaf);
        set_word(l, 0, 7);
        let n = alloc_obj(ob, &node);
        set_ref(n, 0, RObjOrFakePtr::from_robj(l));
        set_word(n, 1, 42);
        n
    };

    let g1 = build(&mut ob);
    let g2 = build(&mut ob);
    assert_ne!(g1, g2);

    let i1 = rt.intern(g1).unwrap();
    let i2 = rt.intern(g2).unwrap();
    assert_eq!(i1, i2);
    // The leaf and the node.
    assert_eq!(rt.intern_table_size(), 2);
    assert!(deep_equal(i1, i2));

    rt.decref(i1);
    rt.decref(i2);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn self_cycle() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Cyclic", 1, 3);

    let a = alloc_obj(&mut ob, &tt);
    set_ref(a, 0, RObjOrFakePtr::from_robj(a));
    set_word(a, 1, 10);
    set_word(a, 2, 20);
    set_word(a, 3, 30);

    let i1 = rt.intern(a).unwrap();
    // Only the cycle handle is listed in the table.
    assert_eq!(rt.intern_table_size(), 1);
    assert!(i1.is_cycle_member());
    assert_eq!(i1.current_refcount(), CYCLE_MEMBER_REFCOUNT_SENTINEL);
    // The member's reference was rewritten to point at itself.
    assert_eq!(get_ref(i1.robj(), 0).bits(), i1.addr());

    let handle = i1.refcount_delegate();
    assert_ne!(handle, i1);
    assert_eq!(handle.current_refcount(), 1);

    // A fresh isomorphic self-cycle lands on the same member.
    let b = alloc_obj(&mut ob, &tt);
    set_ref(b, 0, RObjOrFakePtr::from_robj(b));
    set_word(b, 1, 10);
    set_word(b, 2, 20);
    set_word(b, 3, 30);

    let i2 = rt.intern(b).unwrap();
    assert_eq!(i1, i2);
    assert_eq!(rt.intern_table_size(), 1);
    assert_eq!(handle.current_refcount(), 2);

    rt.verify_intern_table();
    rt.decref(i1);
    rt.decref(i2);
    assert_eq!(rt.intern_table_size(), 0);
}

/// Build `a -> b -> a` with the given payloads and intern `a`.
fn intern_two_cycle(
    rt: &std::sync::Arc<molt_runtime::Runtime>,
    ob: &mut Obstack,
    tt: &TestType,
    first: u64,
    second: u64,
) -> molt_runtime::IObj {
    let a = alloc_obj(ob, tt);
    let b = alloc_obj(ob, tt);
    set_ref(a, 0, RObjOrFakePtr::from_robj(b));
    set_word(a, 1, first);
    set_ref(b, 0, RObjOrFakePtr::from_robj(a));
    set_word(b, 1, second);
    rt.intern(a).unwrap()
}

#[test]
fn isomorphic_two_cycles_from_different_roots() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("CNode", 1, 1);

    // SCC-1 interned starting at the node holding 10; SCC-2 is the same
    // cycle but interned starting at the node holding 20.
    let ia = intern_two_cycle(&rt, &mut ob, &tt, 10, 20);
    let ix = intern_two_cycle(&rt, &mut ob, &tt, 20, 10);

    // One cycle handle in the table, owning both requests.
    assert_eq!(rt.intern_table_size(), 1);
    let handle = ia.refcount_delegate();
    assert_eq!(handle, ix.refcount_delegate());
    assert_eq!(handle.current_refcount(), 2);

    // Each caller got the member matching its own root.
    assert_eq!(get_word(ia.robj(), 1), 10);
    assert_eq!(get_word(ix.robj(), 1), 20);
    assert_ne!(ia, ix);
    // And the members link to each other.
    assert_eq!(get_ref(ia.robj(), 0).bits(), ix.addr());
    assert_eq!(get_ref(ix.robj(), 0).bits(), ia.addr());

    assert!(deep_equal(ia, get_ref(ix.robj(), 0).as_ptr().map(|r| rt.intern(r).unwrap()).unwrap()));

    rt.verify_intern_table();
    rt.decref(ia);
    rt.decref(ix);
    // The deep_equal check above interned (incref'd) ia once more.
    rt.decref(ia);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn acyclic_object_can_intern_to_a_cycle_member() {
    // Example 1: an already-interned self-loop, and a fresh object that
    // points at it with the same payload. The two are isomorphic.
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Loop", 1, 1);

    let m = alloc_obj(&mut ob, &tt);
    set_ref(m, 0, RObjOrFakePtr::from_robj(m));
    set_word(m, 1, 7);
    let im = rt.intern(m).unwrap();
    let handle = im.refcount_delegate();
    assert_eq!(handle.current_refcount(), 1);

    let c = alloc_obj(&mut ob, &tt);
    set_ref(c, 0, RObjOrFakePtr::from_robj(im.robj()));
    set_word(c, 1, 7);
    let ic = rt.intern(c).unwrap();

    assert_eq!(ic, im);
    assert_eq!(rt.intern_table_size(), 1);
    assert_eq!(handle.current_refcount(), 2);

    rt.decref(im);
    rt.decref(ic);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn duplicate_members_collapse() {
    // Example 4: a two-node cycle whose halves are identical interns to
    // a one-member cycle, the same object a plain self-loop yields.
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Dup", 1, 1);

    let ia = intern_two_cycle(&rt, &mut ob, &tt, 7, 7);
    assert!(ia.is_cycle_member());
    // The surviving member points at itself.
    assert_eq!(get_ref(ia.robj(), 0).bits(), ia.addr());
    assert_eq!(rt.intern_table_size(), 1);

    let d = alloc_obj(&mut ob, &tt);
    set_ref(d, 0, RObjOrFakePtr::from_robj(d));
    set_word(d, 1, 7);
    let id = rt.intern(d).unwrap();

    assert_eq!(id, ia);
    assert_eq!(ia.refcount_delegate().current_refcount(), 2);

    rt.decref(ia);
    rt.decref(id);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn cycles_dedupe_under_forced_hash_collisions() {
    // With every local hash forced to zero, root election leans
    // entirely on the deep-compare ordering; isomorphic cycles must
    // still converge.
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Coll", 1, 1);

    assert!(!force_fake_local_hash_collisions(&rt, true));

    let ia = intern_two_cycle(&rt, &mut ob, &tt, 1, 2);
    let ix = intern_two_cycle(&rt, &mut ob, &tt, 2, 1);
    assert_eq!(ia.refcount_delegate(), ix.refcount_delegate());
    assert_eq!(ia.refcount_delegate().current_refcount(), 2);

    assert!(force_fake_local_hash_collisions(&rt, false));

    rt.decref(ia);
    rt.decref(ix);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn refcount_cascade_frees_deep_chains_iteratively() {
    // Scenario E: a 10000-deep linear list must free without recursing.
    const DEPTH: usize = 10_000;
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Link", 1, 1);

    let mut next = RObjOrFakePtr::NULL;
    let mut head = None;
    for i in 0..DEPTH {
        let n = alloc_obj(&mut ob, &tt);
        set_ref(n, 0, next);
        set_word(n, 1, i as u64);
        next = RObjOrFakePtr::from_robj(n);
        head = Some(n);
    }

    let ih = rt.intern(head.unwrap()).unwrap();
    assert_eq!(rt.intern_table_size(), DEPTH);
    assert_eq!(ih.current_refcount(), 1);

    rt.decref(ih);
    assert_eq!(rt.intern_table_size(), 0);
    rt.verify_intern_table();
}

#[test]
fn interior_references_keep_suffix_alive() {
    // Dropping the head of an interned chain must not free a tail
    // someone still references.
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Link2", 1, 1);

    let b = alloc_obj(&mut ob, &tt);
    set_word(b, 1, 2);
    let a = alloc_obj(&mut ob, &tt);
    set_ref(a, 0, RObjOrFakePtr::from_robj(b));
    set_word(a, 1, 1);

    let ia = rt.intern(a).unwrap();
    let ib = get_ref(ia.robj(), 0).as_ptr().unwrap();
    let ib = rt.intern(ib).unwrap();
    assert_eq!(rt.intern_table_size(), 2);

    rt.decref(ia);
    // The tail survives through our reference.
    assert_eq!(rt.intern_table_size(), 1);
    assert_eq!(get_word(ib.robj(), 1), 2);
    rt.decref(ib);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn arrays_intern_structurally() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let elem = TestType::class("Elem", 0, 1);
    let arr = TestType::array("Array<Elem>", 1);

    let build = |ob: &mut Obstack, payload: u64| {
        let e = alloc_obj(ob, &elem);
        set_word(e, 0, payload);
        let a = alloc_array(ob, &arr, 3);
        for i in 0..3 {
            set_ref(a, 2 * i, RObjOrFakePtr::from_robj(e));
            set_word(a, 2 * i + 1, i as u64);
        }
        a
    };

    let a1 = build(&mut ob, 5);
    let a2 = build(&mut ob, 5);
    let i1 = rt.intern(a1).unwrap();
    let i2 = rt.intern(a2).unwrap();
    assert_eq!(i1, i2);
    assert_eq!(i1.array_size(), 3);

    let a3 = build(&mut ob, 6);
    let i3 = rt.intern(a3).unwrap();
    assert_ne!(i1, i3);

    rt.decref(i1);
    rt.decref(i2);
    rt.decref(i3);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn fake_pointers_intern_to_themselves() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());

    // The empty short string: a fake pointer with only tag bits.
    let fake = RObjOrFakePtr::from_bits(1 << 63);
    let interned = rt.intern_or_fake(fake).unwrap();
    assert_eq!(interned.bits(), fake.bits());

    let via_obstack = ob.intern(fake).unwrap();
    assert_eq!(via_obstack.bits(), fake.bits());
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn deep_compare_is_a_total_order() {
    // Properties 2 and 3: agreement with deep_equal, reflexivity,
    // antisymmetry, transitivity over a pile of distinct graphs.
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let leaf = TestType::class("OLeaf", 0, 1);
    let node = TestType::class("ONode", 1, 1);

    let mut interned = Vec::new();
    for payload in [3u64, 1, 4, 1, 5, 9, 2, 6] {
        let l = alloc_obj(&mut ob, &leaf);
        set_word(l, 0, payload);
        let n = alloc_obj(&mut ob, &node);
        set_ref(n, 0, RObjOrFakePtr::from_robj(l));
        set_word(n, 1, payload % 3);
        interned.push(rt.intern(n).unwrap());
    }
    // Self-cycles join the party.
    let cyclic = TestType::class("OCycle", 1, 1);
    for payload in [11u64, 12] {
        let c = alloc_obj(&mut ob, &cyclic);
        set_ref(c, 0, RObjOrFakePtr::from_robj(c));
        set_word(c, 1, payload);
        interned.push(rt.intern(c).unwrap());
    }

    for &a in &interned {
        assert_eq!(deep_compare(a, a), 0);
        for &b in &interned {
            let ab = deep_compare(a, b);
            let ba = deep_compare(b, a);
            assert_eq!(ab == 0, deep_equal(a, b), "compare/equal disagree");
            assert_eq!(ab == 0, a == b, "equal interned graphs must be one object");
            assert_eq!(ab.signum(), -ba.signum(), "antisymmetry");
            for &c in &interned {
                let bc = deep_compare(b, c);
                if ab.signum() == bc.signum() && ab != 0 {
                    assert_eq!(
                        deep_compare(a, c).signum(),
                        ab.signum(),
                        "transitivity violated"
                    );
                }
            }
        }
    }

    for i in interned {
        rt.decref(i);
    }
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn randomized_isomorphic_dags_converge() {
    use rand::Rng;

    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("RandNode", 2, 1);
    let mut rng = rand::rng();

    let mut roots = Vec::new();
    for _ in 0..40 {
        // A random DAG shape: each node carries a payload and up to two
        // references to earlier nodes.
        let len = rng.random_range(1..10usize);
        let shape: Vec<(u64, Option<usize>, Option<usize>)> = (0..len)
            .map(|i| {
                let payload = rng.random_range(0..8u64);
                let pick = |rng: &mut rand::rngs::ThreadRng| {
                    (i > 0 && rng.random_bool(0.7)).then(|| rng.random_range(0..i))
                };
                (payload, pick(&mut rng), pick(&mut rng))
            })
            .collect();

        let build = |ob: &mut Obstack| {
            let mut nodes: Vec<molt_runtime::RObj> = Vec::new();
            for &(payload, a, b) in &shape {
                let n = alloc_obj(ob, &tt);
                if let Some(a) = a {
                    set_ref(n, 0, RObjOrFakePtr::from_robj(nodes[a]));
                }
                if let Some(b) = b {
                    set_ref(n, 1, RObjOrFakePtr::from_robj(nodes[b]));
                }
                set_word(n, 2, payload);
                nodes.push(n);
            }
            *nodes.last().unwrap()
        };

        let i1 = rt.intern(build(&mut ob)).unwrap();
        let i2 = rt.intern(build(&mut ob)).unwrap();
        assert_eq!(i1, i2, "isomorphic DAGs must intern to one object");
        rt.decref(i2);
        roots.push(i1);
    }

    rt.verify_intern_table();
    for root in roots {
        rt.decref(root);
    }
    assert_eq!(rt.intern_table_size(), 0);
}

mod chain_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn isomorphic_chains_intern_identically(
            values in proptest::collection::vec(0u64..16, 1..12),
        ) {
            let rt = checked_runtime();
            let mut ob = Obstack::new(rt.clone());
            let tt = TestType::class("PropLink", 1, 1);

            let build = |ob: &mut Obstack| {
                let mut next = RObjOrFakePtr::NULL;
                for &v in values.iter().rev() {
                    let n = alloc_obj(ob, &tt);
                    set_ref(n, 0, next);
                    set_word(n, 1, v);
                    next = RObjOrFakePtr::from_robj(n);
                }
                next.as_ptr().unwrap()
            };

            let i1 = rt.intern(build(&mut ob)).unwrap();
            let i2 = rt.intern(build(&mut ob)).unwrap();
            prop_assert_eq!(i1, i2);
            prop_assert!(molt_runtime::deep_equal(i1, i2));

            rt.decref(i1);
            rt.decref(i2);
            prop_assert_eq!(rt.intern_table_size(), 0);
        }

        #[test]
        fn deep_compare_antisymmetric_on_chains(
            a in proptest::collection::vec(0u64..4, 1..8),
            b in proptest::collection::vec(0u64..4, 1..8),
        ) {
            let rt = checked_runtime();
            let mut ob = Obstack::new(rt.clone());
            let tt = TestType::class("PropCmp", 1, 1);

            let build = |ob: &mut Obstack, values: &[u64]| {
                let mut next = RObjOrFakePtr::NULL;
                for &v in values.iter().rev() {
                    let n = alloc_obj(ob, &tt);
                    set_ref(n, 0, next);
                    set_word(n, 1, v);
                    next = RObjOrFakePtr::from_robj(n);
                }
                next.as_ptr().unwrap()
            };

            let ia = rt.intern(build(&mut ob, &a)).unwrap();
            let ib = rt.intern(build(&mut ob, &b)).unwrap();

            let ab = deep_compare(ia, ib);
            let ba = deep_compare(ib, ia);
            prop_assert_eq!(ab.signum(), -ba.signum());
            prop_assert_eq!(ab == 0, ia == ib);
            prop_assert_eq!(ab == 0, a == b);

            rt.decref(ia);
            rt.decref(ib);
        }
    }
}

#[test]
fn table_grows_and_rehashes_lazily() {
    let rt = checked_runtime();
    let mut ob = Obstack::new(rt.clone());
    let tt = TestType::class("Grow", 0, 2);
    let note = ob.note();

    // Push well past the initial 4096-bucket load limit.
    const N: usize = 6000;
    let mut interned = Vec::with_capacity(N);
    for i in 0..N {
        let o = alloc_obj(&mut ob, &tt);
        set_word(o, 0, i as u64);
        set_word(o, 1, !(i as u64));
        interned.push(rt.intern(o).unwrap());
    }
    assert_eq!(rt.intern_table_size(), N);

    let longest = rt.verify_intern_table();
    assert!(longest < 32, "suspiciously long chain: {longest}");

    // Lookups after the growth still find the originals.
    ob.collect(note);
    let o = alloc_obj(&mut ob, &tt);
    set_word(o, 0, 1234);
    set_word(o, 1, !1234u64);
    let again = rt.intern(o).unwrap();
    assert_eq!(again, interned[1234]);
    rt.decref(again);

    for i in interned {
        rt.decref(i);
    }
    assert_eq!(rt.intern_table_size(), 0);
    rt.verify_intern_table();
}
