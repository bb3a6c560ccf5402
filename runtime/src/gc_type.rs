// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-class type descriptors.
//!
//! Each [`Type`] tells the runtime where the reference slots of its
//! instances live so that interning and collection can trace them. The
//! slot information is a bitmap with one bit per pointer-sized slot,
//! kept in two interleaved *stripes*: one consulted by the collector and
//! interner, one by freeze-time traversal.
//!
//! For arrays the bitmap describes one element; when several elements'
//! worth of bits fit in a single mask word the pattern is replicated
//! (`tiles_per_mask`) so traversal can stride whole words.

use crate::obj::{ALLOC_ALIGN, AOBJ_METADATA_SIZE, IOBJ_METADATA_SIZE, IObj, ROBJ_METADATA_SIZE};
use crate::util::round_up;

pub const STRIPE_COUNT: usize = 2;
const BITS_PER_MASK: usize = u64::BITS as usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum Stripe {
    Gc = 0,
    Freeze = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeKind {
    RefClass,
    Array,
    Invocation,
    String,
    CycleHandle,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateChange {
    Initialize,
    Finalize,
}

/// Hook invoked when an interned instance is published (`Initialize`,
/// under the intern bucket lock) or about to be freed (`Finalize`).
pub type StateChangeHandler = fn(IObj, StateChange);

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TypeHints: u8 {
        /// Instances may contain reference slots.
        const MIXED_REFS = 1 << 0;
        /// Every reference in an instance is guaranteed frozen.
        const ALL_FROZEN_REFS = 1 << 1;
        /// No sub-object can be referenced from two places; freezing may
        /// skip the alias-preserving copy map.
        const NO_MUTABLE_ALIASES = 1 << 2;
        /// Instances are interned without going through the intern table.
        const AVOID_INTERN_TABLE = 1 << 3;
    }
}

pub struct Type {
    name: Box<str>,
    kind: TypeKind,
    /// For arrays this is the byte size of one element.
    user_byte_size: usize,
    uninterned_metadata_byte_size: usize,
    interned_metadata_byte_size: usize,
    tiles_per_mask: u8,
    hints: TypeHints,
    on_state_change: Option<StateChangeHandler>,
    /// Interleaved stripes: word `i` of stripe `s` is at `i * STRIPE_COUNT + s`.
    ref_mask: Box<[u64]>,
}

#[cfg(debug_assertions)]
fn verify_ref_offsets(ref_offsets: &[usize], byte_size: usize) {
    let mut next = 0;
    for &offset in ref_offsets {
        assert!(offset % ALLOC_ALIGN == 0, "misaligned ref offset");
        assert!(offset >= next, "ref offsets must be sorted and unique");
        next = offset + size_of::<usize>();
    }
    assert!(next <= byte_size, "ref offset outside the object");
}

fn build_ref_mask(kind: TypeKind, slots: usize, ref_offsets: &[usize]) -> (Box<[u64]>, u8) {
    if ref_offsets.is_empty() {
        return (Box::new([]), 0);
    }

    let words = round_up(slots, BITS_PER_MASK) / BITS_PER_MASK;
    let mut mask = vec![0u64; words * STRIPE_COUNT].into_boxed_slice();

    let mut tiles: usize = 0;
    loop {
        for &offset in ref_offsets {
            let slot = offset / size_of::<usize>() + tiles * slots;
            let bit = 1u64 << (slot % BITS_PER_MASK);
            mask[slot / BITS_PER_MASK * STRIPE_COUNT + Stripe::Gc as usize] |= bit;
            mask[slot / BITS_PER_MASK * STRIPE_COUNT + Stripe::Freeze as usize] |= bit;
        }
        tiles += 1;
        // Array element patterns are replicated while another full
        // element still fits into the mask word.
        if kind != TypeKind::Array || (tiles + 1) * slots > BITS_PER_MASK {
            break;
        }
    }

    (mask, tiles as u8)
}

impl Type {
    pub fn factory(
        name: &str,
        kind: TypeKind,
        user_byte_size: usize,
        ref_offsets: &[usize],
        on_state_change: Option<StateChangeHandler>,
        uninterned_metadata_byte_size: usize,
        interned_metadata_byte_size: usize,
    ) -> Box<Type> {
        #[cfg(debug_assertions)]
        verify_ref_offsets(ref_offsets, user_byte_size);
        assert!(uninterned_metadata_byte_size >= ROBJ_METADATA_SIZE);
        assert!(interned_metadata_byte_size >= IOBJ_METADATA_SIZE);

        let user_byte_size = round_up(user_byte_size, size_of::<usize>());
        let slots = if ref_offsets.is_empty() {
            0
        } else {
            user_byte_size / size_of::<usize>()
        };
        let (ref_mask, tiles_per_mask) = build_ref_mask(kind, slots, ref_offsets);

        let mut hints = TypeHints::empty();
        if !ref_offsets.is_empty() {
            hints |= TypeHints::MIXED_REFS;
        }

        Box::new(Type {
            name: name.into(),
            kind,
            user_byte_size,
            uninterned_metadata_byte_size,
            interned_metadata_byte_size,
            tiles_per_mask,
            hints,
            on_state_change,
            ref_mask,
        })
    }

    /// An ordinary reference class.
    pub fn class_factory(
        name: &str,
        user_byte_size: usize,
        ref_offsets: &[usize],
        extra_metadata_size: usize,
        on_state_change: Option<StateChangeHandler>,
    ) -> Box<Type> {
        Type::factory(
            name,
            TypeKind::RefClass,
            user_byte_size,
            ref_offsets,
            on_state_change,
            ROBJ_METADATA_SIZE + extra_metadata_size,
            IOBJ_METADATA_SIZE + extra_metadata_size,
        )
    }

    /// An array type; instances point at the first element, with the
    /// element count in the metadata.
    pub fn array_factory(name: &str, slot_byte_size: usize, slot_ref_offsets: &[usize]) -> Box<Type> {
        Type::factory(
            name,
            TypeKind::Array,
            slot_byte_size,
            slot_ref_offsets,
            None,
            AOBJ_METADATA_SIZE,
            IOBJ_METADATA_SIZE,
        )
    }

    /// A memoizer invocation record. The extra interned metadata belongs
    /// to the invocation cache, which is outside this crate; the runtime
    /// only reserves space for it.
    pub fn invocation_factory(
        name: &str,
        user_byte_size: usize,
        ref_offsets: &[usize],
        extra_metadata_size: usize,
        on_state_change: Option<StateChangeHandler>,
    ) -> Box<Type> {
        Type::factory(
            name,
            TypeKind::Invocation,
            user_byte_size,
            ref_offsets,
            on_state_change,
            ROBJ_METADATA_SIZE,
            IOBJ_METADATA_SIZE + extra_metadata_size,
        )
    }

    /// Marks a type as bypassing the intern table: instances are
    /// refcounted but never looked up structurally.
    pub fn avoid_intern_table(mut ty: Box<Type>) -> Box<Type> {
        ty.hints |= TypeHints::AVOID_INTERN_TABLE;
        ty
    }

    /// Compiler hint setters, for hosts that know more than the factory
    /// signature can express.
    pub fn set_hints(&mut self, hints: TypeHints) {
        self.hints = hints;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn user_byte_size(&self) -> usize {
        self.user_byte_size
    }

    pub fn uninterned_metadata_byte_size(&self) -> usize {
        self.uninterned_metadata_byte_size
    }

    pub fn interned_metadata_byte_size(&self) -> usize {
        self.interned_metadata_byte_size
    }

    pub fn user_pointer_count(&self) -> usize {
        self.user_byte_size / size_of::<usize>()
    }

    pub fn tiles_per_mask(&self) -> u8 {
        self.tiles_per_mask
    }

    pub fn has_refs(&self) -> bool {
        self.hints.contains(TypeHints::MIXED_REFS)
    }

    pub fn is_all_frozen_refs(&self) -> bool {
        self.hints.contains(TypeHints::ALL_FROZEN_REFS)
    }

    pub fn has_no_mutable_aliases(&self) -> bool {
        self.hints.contains(TypeHints::NO_MUTABLE_ALIASES)
    }

    pub fn uses_intern_table(&self) -> bool {
        !self.hints.contains(TypeHints::AVOID_INTERN_TABLE)
    }

    pub fn state_change_handler(&self) -> Option<StateChangeHandler> {
        self.on_state_change
    }

    /// Visit every reference slot of an instance whose body starts at
    /// `base`. Stops early when `f` returns `true` and reports whether
    /// it did. For arrays the element count is read from the metadata
    /// prefix (present in both object layouts).
    ///
    /// # Safety
    ///
    /// `base` must point at a live instance of this type, and the
    /// visited slots must not be mutated concurrently.
    pub(crate) unsafe fn any_ref(
        &self,
        base: *mut u8,
        stripe: Stripe,
        f: &mut dyn FnMut(*mut usize) -> bool,
    ) -> bool {
        if !self.has_refs() {
            return false;
        }

        let slot_count = self.user_pointer_count();
        let (slots_per_mask, mut remaining) = if self.kind == TypeKind::Array {
            // Safety: array metadata always carries the element count
            // just below the vtable word.
            let len = unsafe { *base.offset(-12).cast::<u32>() } as usize;
            (slot_count * self.tiles_per_mask as usize, slot_count * len)
        } else {
            (slot_count, slot_count)
        };

        let mut refs = base.cast::<usize>();
        while remaining > 0 {
            let n = remaining.min(slots_per_mask);
            // Safety: the object provides `n` slots starting at `refs`.
            if unsafe { self.any_slot_refs(refs, stripe, n, f) } {
                return true;
            }
            // Safety: stays within (or one past) the instance body.
            refs = unsafe { refs.add(slots_per_mask) };
            remaining -= n;
        }
        false
    }

    /// Visit up to `slot_count` slots starting at `refs` under this
    /// type's mask.
    ///
    /// # Safety
    ///
    /// `refs` must point at `slot_count` readable pointer slots.
    pub(crate) unsafe fn any_slot_refs(
        &self,
        refs: *mut usize,
        stripe: Stripe,
        slot_count: usize,
        f: &mut dyn FnMut(*mut usize) -> bool,
    ) -> bool {
        let mut word_index = 0;
        let mut base = refs;
        let mut remaining = slot_count as isize;
        while remaining > 0 {
            let full = self.ref_mask[word_index * STRIPE_COUNT + stripe as usize];
            let mut mask = if (remaining as usize) < BITS_PER_MASK {
                full & ((1u64 << remaining) - 1)
            } else {
                full
            };
            while mask != 0 {
                let idx = mask.trailing_zeros() as usize;
                // Safety: bit `idx` is within the object per the ref mask.
                if f(unsafe { base.add(idx) }) {
                    return true;
                }
                mask &= mask - 1;
            }
            word_index += 1;
            // Safety: advances one mask word's worth of slots; the loop
            // bound keeps us within the instance.
            base = unsafe { base.add(BITS_PER_MASK) };
            remaining -= BITS_PER_MASK as isize;
        }
        false
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}
impl Eq for Type {}

#[cfg(test)]
mod tests {
    use super::*;

    /// An array instance with its metadata prefix, as tests need one.
    #[repr(C, align(8))]
    struct ArrayBox<const N: usize> {
        _pad: u32,
        len: u32,
        vtable: u64,
        slots: [usize; N],
    }

    impl<const N: usize> ArrayBox<N> {
        fn new(len: u32) -> Self {
            Self {
                _pad: 0,
                len,
                vtable: 0,
                slots: [0; N],
            }
        }

        fn base(&mut self) -> *mut u8 {
            self.slots.as_mut_ptr().cast()
        }
    }

    #[test]
    fn class_mask_marks_declared_slots() {
        // 5 words: refs at slots 1 and 3.
        let ty = Type::class_factory("T", 40, &[8, 24], 0, None);
        assert!(ty.has_refs());
        assert_eq!(ty.user_pointer_count(), 5);
        let mut slots = [0usize; 5];
        let base = slots.as_mut_ptr().cast::<u8>();
        let mut seen = vec![];
        // Safety: `slots` provides 5 pointer slots; non-arrays read no
        // metadata.
        unsafe {
            ty.any_ref(base, Stripe::Gc, &mut |p| {
                seen.push(p as usize - base as usize);
                false
            });
        }
        assert_eq!(seen, vec![8, 24]);
    }

    #[test]
    fn array_mask_tiles() {
        // 2-word elements with a ref in slot 0; 32 tiles fit in one word.
        let ty = Type::array_factory("Array<T>", 16, &[0]);
        assert_eq!(ty.tiles_per_mask(), 32);
        let mut arr = ArrayBox::<10>::new(5);
        let base = arr.base();
        let mut seen = vec![];
        // Safety: 5 elements of 2 slots each, metadata present.
        unsafe {
            ty.any_ref(base, Stripe::Gc, &mut |p| {
                seen.push((p as usize - base as usize) / 8);
                false
            });
        }
        assert_eq!(seen, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn array_mask_large_element() {
        // 3-word elements, refs at slots 0 and 2; 21 tiles fit.
        let ty = Type::array_factory("Array<U>", 24, &[0, 16]);
        assert_eq!(ty.tiles_per_mask(), 21);
        let mut arr = ArrayBox::<6>::new(2);
        let base = arr.base();
        let mut seen = vec![];
        // Safety: 2 elements of 3 slots each, metadata present.
        unsafe {
            ty.any_ref(base, Stripe::Gc, &mut |p| {
                seen.push((p as usize - base as usize) / 8);
                false
            });
        }
        assert_eq!(seen, vec![0, 2, 3, 5]);
    }

    #[test]
    fn no_refs_never_visits() {
        let ty = Type::class_factory("Scalar", 24, &[], 0, None);
        assert!(!ty.has_refs());
        // Safety: never dereferenced for a refless type.
        let visited = unsafe { ty.any_ref(core::ptr::null_mut(), Stripe::Gc, &mut |_| true) };
        assert!(!visited);
    }

    #[test]
    fn early_exit() {
        let ty = Type::class_factory("T", 32, &[0, 8, 16, 24], 0, None);
        let mut slots = [0usize; 4];
        let mut count = 0;
        // Safety: 4 slots provided.
        let stopped = unsafe {
            ty.any_ref(slots.as_mut_ptr().cast(), Stripe::Gc, &mut |_| {
                count += 1;
                count == 2
            })
        };
        assert!(stopped);
        assert_eq!(count, 2);
    }
}
