// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-obstack transfer of objects, large blocks, interned references
//! and handles.

mod common;

use common::*;
use molt_runtime::obj::RObjOrFakePtr;
use molt_runtime::Obstack;

#[test]
fn steal_moves_objects_without_copying() {
    let rt = checked_runtime();
    let mut dest = Obstack::new(rt.clone());
    let tt = TestType::class("TNode", 1, 1);

    let note = dest.note();
    let mut source = Obstack::new_child(rt.clone(), note);

    // X -> Y, Y -> (interned I), on the source obstack.
    let itype = TestType::class("TInt", 0, 1);
    let raw_i = alloc_obj(&mut source, &itype);
    set_word(raw_i, 0, 99);
    let interned = source.intern(RObjOrFakePtr::from_robj(raw_i)).unwrap();
    let iobj = interned.as_ptr().unwrap();
    let rc_before = iobj.current_refcount();

    let y = alloc_obj(&mut source, &tt);
    set_ref(y, 0, RObjOrFakePtr::from_bits(interned.bits()));
    set_word(y, 1, 2);
    let x = alloc_obj(&mut source, &tt);
    set_ref(x, 0, RObjOrFakePtr::from_robj(y));
    set_word(x, 1, 1);

    let source_bytes = source.total_usage();
    let handle = source.make_handle(RObjOrFakePtr::from_robj(x));

    let dest_usage_before = dest.usage(note);
    dest.steal(note, &mut source);

    // Objects moved by reference, not by copy.
    assert_eq!(get_word(x, 1), 1);
    assert_eq!(get_ref(x, 0).as_ptr().unwrap(), y);
    assert_eq!(get_ref(y, 0).bits(), iobj.addr());

    // The destination now accounts for the stolen bytes.
    assert!(dest.usage(note) >= dest_usage_before + source_bytes);
    assert_eq!(dest.iobj_count(), 1);

    // Ownership of the interned reference transferred; no extra count.
    assert_eq!(iobj.current_refcount(), rc_before);

    // The handle follows, owned by the stealing process now.
    assert!(handle.is_owned_by_current_process());
    assert_eq!(handle.get().as_ptr().unwrap(), x);

    drop(source);

    // The stolen graph is collectable by the destination.
    let mut roots = [RObjOrFakePtr::from_robj(x)];
    dest.collect_with_roots(note, &mut roots);
    let x2 = roots[0].as_ptr().unwrap();
    assert_eq!(get_word(x2, 1), 1);
    let y2 = get_ref(x2, 0).as_ptr().unwrap();
    assert_eq!(get_word(y2, 1), 2);
    assert_eq!(get_ref(y2, 0).bits(), iobj.addr());
    assert_eq!(iobj.current_refcount(), rc_before);

    drop(handle);
    dest.collect(note);
    assert_eq!(dest.usage(note), 0);
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn steal_merges_duplicate_interned_references() {
    let rt = checked_runtime();
    let mut dest = Obstack::new(rt.clone());
    let tt = TestType::class("DPoint", 0, 1);

    // Both obstacks intern the same value.
    let a = alloc_obj(&mut dest, &tt);
    set_word(a, 0, 123);
    let ia = dest.intern(RObjOrFakePtr::from_robj(a)).unwrap();
    let iobj = ia.as_ptr().unwrap();
    assert_eq!(iobj.current_refcount(), 1);

    let note = dest.note();
    let mut source = Obstack::new_child(rt.clone(), note);
    let b = alloc_obj(&mut source, &tt);
    set_word(b, 0, 123);
    let ib = source.intern(RObjOrFakePtr::from_robj(b)).unwrap();
    assert_eq!(ib.bits(), ia.bits());
    assert_eq!(iobj.current_refcount(), 2);

    dest.steal(note, &mut source);
    drop(source);

    // Both sides tracked it, so one of the two counts was dropped.
    assert_eq!(dest.iobj_count(), 1);
    assert_eq!(iobj.current_refcount(), 1);

    dest.collect(dest.first_note());
    assert_eq!(rt.intern_table_size(), 0);
}

#[test]
fn steal_moves_large_objects_and_empty_sources() {
    let rt = checked_runtime();
    let mut dest = Obstack::new(rt.clone());

    let note = dest.note();

    // An empty source with one (null-wrapping) handle.
    let mut empty = Obstack::new_child(rt.clone(), note);
    let null_handle = empty.make_handle(RObjOrFakePtr::NULL);
    dest.steal(note, &mut empty);
    assert!(null_handle.is_owned_by_current_process());
    drop(null_handle);
    drop(empty);

    // A source with a large allocation.
    let mut source = Obstack::new_child(rt.clone(), note);
    let p = source.alloc(200 << 10);
    unsafe { p.as_ptr().write_bytes(0x11, 200 << 10) };
    assert_eq!(source.large_count(), 1);

    dest.steal(note, &mut source);
    drop(source);
    assert_eq!(dest.large_count(), 1);
    assert!(dest.usage(note) >= 200 << 10);
    unsafe { assert_eq!(*p.as_ptr(), 0x11) };

    dest.collect(note);
    assert_eq!(dest.large_count(), 0);
    assert_eq!(dest.usage(note), 0);
}
