// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Concurrent interning: one canonical object per value, whatever the
//! thread interleaving, and progress through table growth.

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use molt_runtime::obj::RObjOrFakePtr;
use molt_runtime::{IObj, Obstack, Runtime};

fn intern_value(rt: &Arc<Runtime>, ob: &mut Obstack, tt: &TestType, value: u64) -> IObj {
    let o = alloc_obj(ob, tt);
    set_word(o, 0, value);
    set_word(o, 1, value ^ 0xfeed);
    rt.intern(o).unwrap()
}

#[test]
fn equal_values_converge_across_threads() {
    const THREADS: usize = 8;
    const VALUES: u64 = 64;

    let rt = checked_runtime();
    let tt = TestType::class("CPoint", 0, 2);

    let results: Vec<Vec<IObj>> = thread::scope(|scope| {
        let mut joins = Vec::new();
        for _ in 0..THREADS {
            let rt = rt.clone();
            let tt = tt.clone();
            joins.push(scope.spawn(move || {
                let mut ob = Obstack::new(rt.clone());
                (0..VALUES)
                    .map(|v| intern_value(&rt, &mut ob, &tt, v))
                    .collect::<Vec<_>>()
            }));
        }
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    });

    // Every thread got the same canonical pointer for each value.
    assert_eq!(rt.intern_table_size(), VALUES as usize);
    for v in 0..VALUES as usize {
        for r in &results[1..] {
            assert_eq!(r[v], results[0][v]);
        }
        assert_eq!(results[0][v].current_refcount(), THREADS as u32);
    }
    rt.verify_intern_table();

    for r in &results {
        for &i in r {
            rt.decref(i);
        }
    }
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn concurrent_growth_keeps_the_table_consistent() {
    // Distinct values from every thread force growth and lazy rehashing
    // under contention.
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 3000;

    let rt = checked_runtime();
    let tt = TestType::class("GPoint", 0, 2);

    let results: Vec<Vec<IObj>> = thread::scope(|scope| {
        let mut joins = Vec::new();
        for t in 0..THREADS {
            let rt = rt.clone();
            let tt = tt.clone();
            joins.push(scope.spawn(move || {
                let mut ob = Obstack::new(rt.clone());
                (0..PER_THREAD)
                    .map(|v| intern_value(&rt, &mut ob, &tt, t * PER_THREAD + v))
                    .collect::<Vec<_>>()
            }));
        }
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    });

    assert_eq!(rt.intern_table_size(), (THREADS * PER_THREAD) as usize);
    rt.verify_intern_table();

    // Everything is still findable after growth.
    let mut ob = Obstack::new(rt.clone());
    let again = intern_value(&rt, &mut ob, &tt, 1);
    assert_eq!(again, results[0][1]);
    rt.decref(again);

    for r in &results {
        for &i in r {
            rt.decref(i);
        }
    }
    assert_eq!(rt.intern_table_size(), 0);
    rt.verify_intern_table();
}

#[test]
fn concurrent_intern_and_release_of_the_same_value() {
    // Decref racing lookup: the bucket lock arbitrates revival vs death.
    const THREADS: usize = 8;
    const ROUNDS: usize = 400;

    let rt = checked_runtime();
    let tt = TestType::class("RPoint", 0, 2);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let rt = rt.clone();
            let tt = tt.clone();
            scope.spawn(move || {
                let mut ob = Obstack::new(rt.clone());
                for _ in 0..ROUNDS {
                    let i = intern_value(&rt, &mut ob, &tt, 42);
                    assert_eq!(get_word(i.robj(), 0), 42);
                    rt.decref(i);
                }
            });
        }
    });

    assert_eq!(rt.intern_table_size(), 0);
    rt.verify_intern_table();
}
