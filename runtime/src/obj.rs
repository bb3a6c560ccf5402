// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The managed object model.
//!
//! Every managed value is referenced by a pointer to its *body* (the
//! first field, array element, or character). A fixed metadata prefix
//! sits at negative offsets from the body:
//!
//! ```text
//!  ... -24        -16       -12   -8        0
//!  +---------+---------+--------+---------+------------------
//!  | next    | refcount| size   | vtable  | body (user data)
//!  +---------+---------+--------+---------+------------------
//! ```
//!
//! Uninterned objects only carry the vtable word (plus the size word for
//! arrays); interned objects carry the whole prefix. The `next` word is
//! a union: intern-table chain link, cycle-handle pointer, transient
//! interning node, or free-list link, depending on the object's state.
//!
//! # Validity
//!
//! [`RObj`] and [`IObj`] are raw body pointers. Holding one asserts the
//! pointee is a live managed object (and, for `IObj`, that it lives in
//! interned storage); all accessors rely on that invariant the same way
//! the rest of the runtime relies on pointer provenance.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arena::{Arena, Kind};
use crate::gc_type::{Stripe, Type, TypeKind};
use crate::refcount::{BEING_INTERNED_REFCOUNT_SENTINEL, CYCLE_MEMBER_REFCOUNT_SENTINEL, Refcount};
use crate::util::hash_memory;
use crate::vtable::{VTableRef, VTableSlot};

/// Alignment of every body pointer and reference slot.
pub const ALLOC_ALIGN: usize = 8;

/// Metadata bytes preceding an uninterned object body.
pub const ROBJ_METADATA_SIZE: usize = 8;
/// Metadata bytes preceding an uninterned array body.
pub const AOBJ_METADATA_SIZE: usize = 16;
/// Metadata bytes preceding an interned object body.
pub const IOBJ_METADATA_SIZE: usize = 24;

const VTABLE_OFFSET: isize = -8;
const ARRAY_SIZE_OFFSET: isize = -12;
const REFCOUNT_OFFSET: isize = -16;
const NEXT_OFFSET: isize = -24;

/// Body pointer to a managed object, not necessarily interned or frozen.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct RObj(NonNull<u8>);

impl RObj {
    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        debug_assert!(ptr.as_ptr() as usize % ALLOC_ALIGN == 0);
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn meta<T>(self, offset: isize) -> *mut T {
        // Safety: the metadata prefix precedes every live body.
        unsafe { self.0.as_ptr().offset(offset).cast::<T>() }
    }

    pub fn vtable(self) -> VTableRef {
        // Safety: see `meta`.
        VTableRef::from_bits(unsafe { *self.meta::<usize>(VTABLE_OFFSET) })
    }

    pub fn set_vtable(self, vtable: VTableRef) {
        // Safety: see `meta`.
        unsafe { *self.meta::<usize>(VTABLE_OFFSET) = vtable.bits() }
    }

    /// Decoded vtable word; the only way to observe a collector
    /// forwarding pointer.
    pub fn vtable_slot(self) -> VTableSlot {
        // Safety: see `meta`.
        VTableSlot::decode(unsafe { *self.meta::<usize>(VTABLE_OFFSET) })
    }

    pub fn set_forwarded(self, target: RObj) {
        // Safety: see `meta`.
        unsafe { *self.meta::<usize>(VTABLE_OFFSET) = VTableSlot::encode_forwarded(target) }
    }

    pub fn type_(self) -> &'static Type {
        self.vtable().type_()
    }

    /// Element count; only meaningful for arrays (and interned bodies).
    pub fn array_size(self) -> u32 {
        // Safety: see `meta`.
        unsafe { *self.meta::<u32>(ARRAY_SIZE_OFFSET) }
    }

    pub fn set_array_size(self, size: u32) {
        // Safety: see `meta`.
        unsafe { *self.meta::<u32>(ARRAY_SIZE_OFFSET) = size }
    }

    pub fn user_byte_size(self) -> usize {
        let ty = self.type_();
        match ty.kind() {
            TypeKind::Array => ty.user_byte_size() * self.array_size() as usize,
            _ => ty.user_byte_size(),
        }
    }

    pub fn hash(self) -> u64 {
        match self.type_().kind() {
            TypeKind::CycleHandle => CycleHandle::from_robj(self).cycle_hash(),
            _ => hash_memory(
                self.as_ptr(),
                self.user_byte_size(),
                self.vtable().unfrozen_bits() as u64,
            ),
        }
    }

    /// An address guaranteed inside this object's allocation, even when
    /// the body itself is empty.
    pub fn interior(self) -> usize {
        self.addr() - size_of::<usize>()
    }

    pub fn memory_kind(self, arena: &Arena) -> Kind {
        arena.memory_kind(self.interior())
    }

    pub fn is_interned(self, arena: &Arena) -> bool {
        self.memory_kind(arena) == Kind::IObj
    }

    pub fn as_interned(self, arena: &Arena) -> Option<IObj> {
        self.is_interned(arena).then_some(IObj(self))
    }

    /// True iff this object is the canonical interned copy. Objects in
    /// the middle of being interned return false even though they live
    /// in interned storage.
    pub fn is_fully_interned(self, arena: &Arena) -> bool {
        self.as_interned(arena)
            .is_some_and(|iobj| iobj.current_refcount() != BEING_INTERNED_REFCOUNT_SENTINEL)
    }

    pub fn is_frozen(self) -> bool {
        self.vtable().is_frozen()
    }

    pub fn set_frozen(self) {
        self.set_vtable(self.vtable().frozen());
    }

    pub fn clear_frozen(self) {
        self.set_vtable(self.vtable().unfrozen());
    }

    /// Visit every reference slot (valid or fake). Slots are visited as
    /// raw words so callers may rewrite them in place.
    ///
    /// # Safety
    ///
    /// The object must not be traversed or mutated concurrently.
    pub unsafe fn for_each_ref(self, stripe: Stripe, mut f: impl FnMut(&mut RObjOrFakePtr)) {
        // Safety: slots reported by the type mask are within the body.
        unsafe {
            self.type_()
                .any_ref(self.as_ptr(), stripe, &mut |slot| {
                    f(&mut *slot.cast::<RObjOrFakePtr>());
                    false
                });
        }
    }

    /// Visit each slot holding a real pointer; stop on the first `true`.
    ///
    /// # Safety
    ///
    /// As [`for_each_ref`](Self::for_each_ref).
    pub unsafe fn any_valid_ref(self, stripe: Stripe, mut f: impl FnMut(RObj) -> bool) -> bool {
        // Safety: as above.
        unsafe {
            self.type_()
                .any_ref(self.as_ptr(), stripe, &mut |slot| {
                    let word = *slot.cast::<RObjOrFakePtr>();
                    match word.as_ptr() {
                        Some(robj) => f(robj),
                        None => false,
                    }
                })
        }
    }

    /// # Safety
    ///
    /// As [`for_each_ref`](Self::for_each_ref).
    pub unsafe fn each_valid_ref(self, stripe: Stripe, mut f: impl FnMut(RObj)) {
        // Safety: as above.
        unsafe {
            self.any_valid_ref(stripe, |robj| {
                f(robj);
                false
            });
        }
    }
}

/// Body pointer to an object in interned storage. Not necessarily the
/// canonical copy while interning is still in progress.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct IObj(RObj);

// Safety: fully interned objects are deeply immutable; their refcounts
// are atomics. Objects still being interned are confined to the
// interning thread by construction.
unsafe impl Send for IObj {}
// Safety: as above.
unsafe impl Sync for IObj {}

impl IObj {
    /// Wrap a body pointer known to live in interned storage.
    pub fn from_robj_unchecked(robj: RObj) -> Self {
        Self(robj)
    }

    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(RObj::from_ptr(ptr))
    }

    pub fn robj(self) -> RObj {
        self.0
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.addr()
    }

    pub fn vtable(self) -> VTableRef {
        self.0.vtable()
    }

    pub fn type_(self) -> &'static Type {
        self.0.type_()
    }

    pub fn array_size(self) -> u32 {
        self.0.array_size()
    }

    pub fn user_byte_size(self) -> usize {
        self.0.user_byte_size()
    }

    pub fn hash(self) -> u64 {
        self.0.hash()
    }

    pub fn refcount_atomic(self) -> &'static AtomicU32 {
        // Safety: interned metadata always includes the refcount word,
        // and it is only accessed atomically.
        unsafe { &*self.0.meta::<AtomicU32>(REFCOUNT_OFFSET) }
    }

    pub fn current_refcount(self) -> Refcount {
        self.refcount_atomic().load(Ordering::Relaxed)
    }

    pub fn set_refcount(self, rc: Refcount) {
        self.refcount_atomic().store(rc, Ordering::Relaxed);
    }

    /// The raw `next` union word.
    pub fn next_word(self) -> usize {
        // Safety: interned metadata always includes the next word.
        unsafe { *self.0.meta::<usize>(NEXT_OFFSET) }
    }

    pub fn set_next_word(self, word: usize) {
        // Safety: as above.
        unsafe { *self.0.meta::<usize>(NEXT_OFFSET) = word }
    }

    /// Raw address of the `next` word, for intrusive chain splicing.
    pub(crate) fn next_word_slot(self) -> *mut usize {
        self.0.meta::<usize>(NEXT_OFFSET)
    }

    /// The `next` word read as an object pointer (cycle handle or
    /// free-list link).
    pub fn next_obj(self) -> Option<IObj> {
        NonNull::new(self.next_word() as *mut u8).map(IObj::from_ptr)
    }

    pub fn set_next_obj(self, next: Option<IObj>) {
        self.set_next_word(next.map_or(0, |o| o.addr()));
    }

    pub fn is_cycle_member(self) -> bool {
        self.current_refcount() == CYCLE_MEMBER_REFCOUNT_SENTINEL
    }

    /// The object whose refcount actually tracks this object's liveness:
    /// itself, unless it is a cycle member, in which case the cycle
    /// handle stored through the next word.
    pub fn refcount_delegate(self) -> IObj {
        if self.is_cycle_member() {
            self.next_obj().expect("cycle member without handle")
        } else {
            self
        }
    }

    pub fn uses_intern_table(self) -> bool {
        self.type_().uses_intern_table()
    }

    pub fn is_fully_interned_rc(self) -> bool {
        self.current_refcount() != BEING_INTERNED_REFCOUNT_SENTINEL
    }

    /// Visit every reference slot as a maybe-fake interned word.
    ///
    /// # Safety
    ///
    /// As [`RObj::for_each_ref`].
    pub unsafe fn for_each_iref(self, mut f: impl FnMut(&mut IObjOrFakePtr)) {
        // Safety: as RObj::for_each_ref; interned objects only reference
        // interned objects.
        unsafe {
            self.0
                .type_()
                .any_ref(self.as_ptr(), Stripe::Gc, &mut |slot| {
                    f(&mut *slot.cast::<IObjOrFakePtr>());
                    false
                });
        }
    }

    /// # Safety
    ///
    /// As [`RObj::for_each_ref`].
    pub unsafe fn any_valid_iref(self, mut f: impl FnMut(IObj) -> bool) -> bool {
        // Safety: as above.
        unsafe {
            self.0.any_valid_ref(Stripe::Gc, |robj| f(IObj(robj)))
        }
    }

    /// # Safety
    ///
    /// As [`RObj::for_each_ref`].
    pub unsafe fn each_valid_iref(self, mut f: impl FnMut(IObj)) {
        // Safety: as above.
        unsafe {
            self.any_valid_iref(|iobj| {
                f(iobj);
                false
            });
        }
    }
}

/// The body layout of a cycle handle: `{ root, hash }`.
#[derive(Clone, Copy)]
pub struct CycleHandle(IObj);

impl CycleHandle {
    pub fn from_iobj(iobj: IObj) -> Self {
        debug_assert_eq!(iobj.type_().kind(), TypeKind::CycleHandle);
        Self(iobj)
    }

    pub fn from_robj(robj: RObj) -> Self {
        Self(IObj(robj))
    }

    pub fn iobj(self) -> IObj {
        self.0
    }

    pub const USER_BYTE_SIZE: usize = 16;

    pub fn root(self) -> IObj {
        // Safety: cycle handle bodies hold the root pointer in word 0.
        IObj::from_ptr(NonNull::new(unsafe { *self.0.as_ptr().cast::<*mut u8>() }).unwrap())
    }

    pub fn set_root(self, root: IObj) {
        // Safety: as above.
        unsafe { *self.0.as_ptr().cast::<usize>() = root.addr() }
    }

    pub fn cycle_hash(self) -> u64 {
        // Safety: cycle handle bodies hold the hash in word 1.
        unsafe { *self.0.as_ptr().cast::<u64>().add(1) }
    }

    pub fn set_cycle_hash(self, hash: u64) {
        // Safety: as above.
        unsafe { *self.0.as_ptr().cast::<u64>().add(1) = hash }
    }
}

/// A reference slot: either a real object pointer or an inline value
/// with the high bit set (a "fake pointer", e.g. a short string). Fake
/// pointers are never dereferenced or traced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct RObjOrFakePtr(usize);

impl RObjOrFakePtr {
    pub const NULL: Self = Self(0);

    pub fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    pub fn from_robj(robj: RObj) -> Self {
        Self(robj.addr())
    }

    pub fn bits(self) -> usize {
        self.0
    }

    pub fn sbits(self) -> isize {
        self.0 as isize
    }

    pub fn is_ptr(self) -> bool {
        self.sbits() > 0
    }

    pub fn is_fake_ptr(self) -> bool {
        self.sbits() <= 0
    }

    pub fn as_ptr(self) -> Option<RObj> {
        if self.is_ptr() {
            // Non-null: sbits > 0.
            Some(RObj(NonNull::new(self.0 as *mut u8).unwrap()))
        } else {
            None
        }
    }

    pub fn set_ptr(&mut self, robj: RObj) {
        self.0 = robj.addr();
    }
}

/// As [`RObjOrFakePtr`], for slots known to hold interned references.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct IObjOrFakePtr(usize);

impl IObjOrFakePtr {
    pub fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    pub fn from_iobj(iobj: IObj) -> Self {
        Self(iobj.addr())
    }

    pub fn bits(self) -> usize {
        self.0
    }

    pub fn is_ptr(self) -> bool {
        self.0 as isize > 0
    }

    pub fn as_ptr(self) -> Option<IObj> {
        if self.is_ptr() {
            // Non-null: sbits > 0.
            Some(IObj::from_ptr(NonNull::new(self.0 as *mut u8).unwrap()))
        } else {
            None
        }
    }

    pub fn set_ptr(&mut self, iobj: IObj) {
        self.0 = iobj.addr();
    }
}

/// Intrusive stack of dead interned objects, linked through the `next`
/// word (which is free once an object leaves the intern table).
pub(crate) fn push_iobj(stack: &mut Option<IObj>, obj: IObj) {
    obj.set_next_obj(*stack);
    *stack = Some(obj);
}

pub(crate) fn pop_iobj(stack: &mut Option<IObj>) -> IObj {
    let top = stack.expect("pop from empty iobj stack");
    *stack = top.next_obj();
    top.set_next_obj(None);
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc_type::Type;
    use crate::vtable::RuntimeVTable;

    /// A hand-built object in ordinary memory: interned-shaped metadata
    /// prefix plus a 3-word body.
    #[repr(C, align(8))]
    struct RawObject {
        next: usize,
        refcount: u32,
        array_size: u32,
        vtable: usize,
        body: [u64; 3],
    }

    fn scalar_type() -> Box<Type> {
        Type::class_factory("Scalar3", 24, &[], 0, None)
    }

    #[test]
    fn metadata_accessors() {
        let ty = scalar_type();
        let vt = RuntimeVTable::factory(&ty, None);
        let mut raw = RawObject {
            next: 0,
            refcount: 1,
            array_size: 7,
            vtable: vt.vtable_ref().bits(),
            body: [10, 20, 30],
        };
        let obj = RObj::from_ptr(NonNull::from(&mut raw.body).cast());
        assert_eq!(obj.vtable(), vt.vtable_ref());
        assert_eq!(obj.array_size(), 7);
        assert_eq!(obj.user_byte_size(), 24);
        assert!(!obj.is_frozen());
        obj.set_frozen();
        assert!(obj.is_frozen());
        assert_eq!(obj.vtable(), vt.vtable_ref());

        let iobj = IObj::from_robj_unchecked(obj);
        assert_eq!(iobj.current_refcount(), 1);
        iobj.set_refcount(5);
        assert_eq!(iobj.current_refcount(), 5);
        assert!(!iobj.is_cycle_member());
        assert_eq!(iobj.refcount_delegate(), iobj);
    }

    #[test]
    fn hash_ignores_frozen_bit() {
        let ty = scalar_type();
        let vt = RuntimeVTable::factory(&ty, None);
        let mut a = RawObject {
            next: 0,
            refcount: 1,
            array_size: 0,
            vtable: vt.vtable_ref().bits(),
            body: [1, 2, 3],
        };
        let mut b = RawObject {
            next: 0,
            refcount: 1,
            array_size: 0,
            vtable: vt.frozen_ref().bits(),
            body: [1, 2, 3],
        };
        let oa = RObj::from_ptr(NonNull::from(&mut a.body).cast());
        let ob = RObj::from_ptr(NonNull::from(&mut b.body).cast());
        assert_eq!(oa.hash(), ob.hash());
        a.body[2] ^= 1;
        assert_ne!(oa.hash(), ob.hash());
    }

    #[test]
    fn fake_ptr_predicates() {
        assert!(RObjOrFakePtr::NULL.is_fake_ptr());
        assert!(RObjOrFakePtr::from_bits(1 << 63).is_fake_ptr());
        assert!(RObjOrFakePtr::from_bits(0x1000).is_ptr());
        assert_eq!(RObjOrFakePtr::from_bits(1 << 63).as_ptr(), None);
    }

    #[test]
    fn iobj_stack() {
        let ty = scalar_type();
        let vt = RuntimeVTable::factory(&ty, None);
        let mk = || RawObject {
            next: 0,
            refcount: 1,
            array_size: 0,
            vtable: vt.vtable_ref().bits(),
            body: [0; 3],
        };
        let mut a = mk();
        let mut b = mk();
        let ia = IObj::from_ptr(NonNull::from(&mut a.body).cast());
        let ib = IObj::from_ptr(NonNull::from(&mut b.body).cast());
        let mut stack = None;
        push_iobj(&mut stack, ia);
        push_iobj(&mut stack, ib);
        assert_eq!(pop_iobj(&mut stack), ib);
        assert_eq!(pop_iobj(&mut stack), ia);
        assert!(stack.is_none());
    }
}
