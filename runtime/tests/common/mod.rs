// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Object-building helpers shared by the integration tests: hand-rolled
//! types whose instances are laid out on an obstack the same way a host
//! compiler would lay them out.

#![allow(dead_code)]

use std::ptr::NonNull;
use std::sync::Arc;

use molt_runtime::gc_type::Type;
use molt_runtime::obj::{RObj, RObjOrFakePtr};
use molt_runtime::vtable::RuntimeVTable;
use molt_runtime::{Obstack, Runtime, RuntimeOptions};

/// A `Type` with its vtable, kept alive for the duration of a test.
pub struct TestType {
    pub ty: Box<Type>,
    pub vtable: Box<RuntimeVTable>,
}

impl TestType {
    /// A class of `ref_slots` leading reference slots followed by
    /// `scalar_slots` word-sized scalar fields.
    pub fn class(name: &str, ref_slots: usize, scalar_slots: usize) -> Arc<TestType> {
        let offsets: Vec<usize> = (0..ref_slots).map(|i| i * 8).collect();
        let ty = Type::class_factory(name, (ref_slots + scalar_slots) * 8, &offsets, 0, None);
        let vtable = RuntimeVTable::factory(&ty, None);
        Arc::new(TestType { ty, vtable })
    }

    /// An array whose elements are one reference slot plus
    /// `scalar_slots` scalars.
    pub fn array(name: &str, scalar_slots: usize) -> Arc<TestType> {
        let ty = Type::array_factory(name, (1 + scalar_slots) * 8, &[0]);
        let vtable = RuntimeVTable::factory(&ty, None);
        Arc::new(TestType { ty, vtable })
    }
}

/// Allocate a zeroed instance of `tt` on the obstack.
pub fn alloc_obj(obstack: &mut Obstack, tt: &TestType) -> RObj {
    let metadata = tt.ty.uninterned_metadata_byte_size();
    let raw = obstack.calloc(metadata + tt.ty.user_byte_size());
    // Body pointer follows the metadata prefix.
    let body = unsafe { NonNull::new_unchecked(raw.as_ptr().add(metadata)) };
    let obj = RObj::from_ptr(body);
    obj.set_vtable(tt.vtable.vtable_ref());
    obj
}

/// Allocate a zeroed `len`-element array instance.
pub fn alloc_array(obstack: &mut Obstack, tt: &TestType, len: u32) -> RObj {
    let metadata = tt.ty.uninterned_metadata_byte_size();
    let raw = obstack.calloc(metadata + tt.ty.user_byte_size() * len as usize);
    let body = unsafe { NonNull::new_unchecked(raw.as_ptr().add(metadata)) };
    let obj = RObj::from_ptr(body);
    obj.set_vtable(tt.vtable.vtable_ref());
    obj.set_array_size(len);
    obj
}

pub fn set_word(obj: RObj, slot: usize, value: u64) {
    unsafe { *obj.as_ptr().cast::<u64>().add(slot) = value }
}

pub fn get_word(obj: RObj, slot: usize) -> u64 {
    unsafe { *obj.as_ptr().cast::<u64>().add(slot) }
}

pub fn set_ref(obj: RObj, slot: usize, target: RObjOrFakePtr) {
    set_word(obj, slot, target.bits() as u64);
}

pub fn get_ref(obj: RObj, slot: usize) -> RObjOrFakePtr {
    RObjOrFakePtr::from_bits(get_word(obj, slot) as usize)
}

/// A runtime with paranoid self-checking switched on, regardless of the
/// environment.
pub fn checked_runtime() -> Arc<Runtime> {
    let mut options = RuntimeOptions::default();
    options.config.verify_paranoid = true;
    options.config.verify_note = true;
    Runtime::with_options(options)
}

/// As [`checked_runtime`], on the malloc-backed debug arena.
pub fn checked_malloc_runtime() -> Arc<Runtime> {
    let mut options = RuntimeOptions::default();
    options.config.verify_paranoid = true;
    options.config.verify_note = true;
    options.malloc_arena = true;
    Runtime::with_options(options)
}
