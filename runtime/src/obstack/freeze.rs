// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Freezing: deep-copying a mutable graph into deeply immutable form.
//!
//! The copies stay on the obstack; only the frozen bit and the freeze
//! stripe of the type bitmaps distinguish this from a plain deep copy.
//! Already-frozen subgraphs are returned unchanged.
//!
//! The default freezer keeps an original-to-copy map so shared
//! subobjects stay shared (a DAG freezes to a DAG). Types hinted as
//! having no mutable aliases skip the map and traverse eagerly.

use hashbrown::HashMap;

use crate::gc_type::{Stripe, Type};
use crate::obj::{RObj, RObjOrFakePtr};
use crate::obstack::Obstack;

pub(crate) fn freeze(obstack: &mut Obstack, obj: RObjOrFakePtr) -> RObjOrFakePtr {
    let Some(root) = obj.as_ptr() else {
        // Fake pointers are immutable by construction.
        return obj;
    };
    let result = if root.type_().has_no_mutable_aliases() {
        no_alias_copy(obstack, root)
    } else {
        Freezer::default().copy(obstack, root)
    };
    obstack.verify_invariants();
    RObjOrFakePtr::from_robj(result)
}

fn shallow_clone_frozen(obstack: &mut Obstack, obj: RObj) -> RObj {
    let copy = obstack.shallow_clone(obj);
    copy.set_frozen();
    copy
}

/// Alias-preserving freezer: one copy per original, fix-ups deferred
/// through a work queue.
#[derive(Default)]
struct Freezer {
    copy_map: HashMap<RObj, RObj>,
    queue: Vec<(RObj, &'static Type)>,
}

impl Freezer {
    fn copy(mut self, obstack: &mut Obstack, root: RObj) -> RObj {
        let result = self.copy_object(obstack, root);
        while let Some((target, ty)) = self.queue.pop() {
            // Safety: `target` is a fresh copy this freezer owns; the
            // slots come from its type's freeze stripe.
            unsafe {
                ty.any_ref(
                    target.as_ptr(),
                    Stripe::Freeze,
                    &mut |slot| {
                        let r = &mut *slot.cast::<RObjOrFakePtr>();
                        if let Some(obj) = r.as_ptr() {
                            let copy = self.copy_object(obstack, obj);
                            r.set_ptr(copy);
                        }
                        false
                    },
                );
            }
        }
        result
    }

    fn copy_object(&mut self, obstack: &mut Obstack, obj: RObj) -> RObj {
        if obj.is_frozen() {
            return obj;
        }
        if let Some(&copy) = self.copy_map.get(&obj) {
            return copy;
        }
        let ty = obj.type_();
        let copy = shallow_clone_frozen(obstack, obj);
        self.copy_map.insert(obj, copy);
        // Types whose references are all frozen need no fix-ups; the
        // shallow copy is already correct.
        if !ty.is_all_frozen_refs() {
            self.queue.push((copy, ty));
        }
        copy
    }
}

/// Freezer for types hinted `no_mutable_aliases`: no sub-object can be
/// reached twice, so skip the copy map and recurse eagerly.
fn no_alias_copy(obstack: &mut Obstack, obj: RObj) -> RObj {
    if obj.is_frozen() {
        return obj;
    }
    let ty = obj.type_();
    let copy = shallow_clone_frozen(obstack, obj);
    if !ty.is_all_frozen_refs() {
        // Safety: `copy` is fresh and exclusively ours.
        unsafe {
            ty.any_ref(
                copy.as_ptr(),
                Stripe::Freeze,
                &mut |slot| {
                    let r = &mut *slot.cast::<RObjOrFakePtr>();
                    if let Some(child) = r.as_ptr() {
                        let child_copy = no_alias_copy(obstack, child);
                        r.set_ptr(child_copy);
                    }
                    false
                },
            );
        }
    }
    copy
}
