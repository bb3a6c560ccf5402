// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The canonical set of interned objects: a lock-striped hash set with
//! intrusive per-bucket chains and lazy power-of-two rehashing.
//!
//! Each bucket is a single word: two low lock bits, sixteen "extra hash"
//! bits of the head object's hash, and the head pointer. The chain runs
//! through each object's metadata `next` word.
//!
//! Memory for every bucket the table could ever use is reserved up
//! front; untouched pages read as all-zero, which is the *needs lazy
//! rehash* sentinel. When a zero bucket is first locked we lock its
//! parent (index with the highest set bit cleared, recursively) and
//! partition the parent's chain between the two using the stashed extra
//! hash bits. Growing the table just doubles the visible mask; no data
//! moves until a bucket is touched.
//!
//! Lock ordering: a thread only ever holds multiple bucket locks when
//! rehashing, and then strictly child (higher index) before parent
//! (lower), so lazy rehash recursion cannot deadlock.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use molt_tagged_ptr::TaggedPtr;

use crate::Result;
use crate::arena::{Arena, Kind};
use crate::gc_type::TypeKind;
use crate::intern::deep_equal;
use crate::obj::{CycleHandle, IObj, RObj};
use crate::page;
use crate::refcount::MAX_REFCOUNT;
use crate::util::equal_bytes_expecting_yes;

/// An `IObj` pointer plus tag bits: the bucket word and chain links.
/// Interned bodies are only guaranteed 4-byte aligned here, leaving
/// 18 tag bits: 2 for the bucket lock, 16 for extra hash bits.
type InternPtr = TaggedPtr<u8, 48, 2>;

const NUM_LOCK_BITS: u32 = 2;
const HELD: usize = 1;
const LOCK_BITS_MASK: usize = HELD;

pub const EXTRA_HASH_BITS: u32 = InternPtr::TAG_BITS - NUM_LOCK_BITS;

/// The table always has at least this many buckets, so the low
/// `LOG2_MIN_BUCKETS` bits of every hash are implied by the bucket index.
pub const LOG2_MIN_BUCKETS: u32 = 12;

/// Beyond this, rehashing could no longer recover hash bits from the
/// stashed extras.
pub const LOG2_MAX_BUCKETS: u32 = LOG2_MIN_BUCKETS + EXTRA_HASH_BITS;

/// Canonical empty chain: null pointer, nonzero tag, distinguishing it
/// from the all-zero lazy-rehash sentinel.
const EMPTY_LIST_BITS: usize = 1 << NUM_LOCK_BITS;

fn is_lazy_rehash_sentinel(bits: usize) -> bool {
    bits < (1 << NUM_LOCK_BITS)
}

fn extra_hash_bits(bits: usize) -> u64 {
    InternPtr::from_bits(bits as u64).tag() >> NUM_LOCK_BITS
}

fn chain_ptr(bits: usize) -> Option<IObj> {
    NonNull::new(InternPtr::from_bits(bits as u64).ptr()).map(IObj::from_ptr)
}

fn chain_bits(obj: IObj, extra_hash: u64) -> usize {
    InternPtr::new(obj.as_ptr(), (extra_hash << NUM_LOCK_BITS) & InternPtr::TAG_MASK).bits()
        as usize
}

/// See if two objects with equal hashes and vtables are equal. Bitwise,
/// except cycle handles, which compare their cached hash and then the
/// whole cycle structurally.
fn equal_if_same_vtable(key: RObj, obj: IObj) -> bool {
    match key.type_().kind() {
        TypeKind::CycleHandle => {
            let h1 = CycleHandle::from_robj(key);
            let h2 = CycleHandle::from_iobj(obj);
            h1.cycle_hash() == h2.cycle_hash() && deep_equal(h1.root(), h2.root())
        }
        TypeKind::Array => {
            key.array_size() == obj.array_size()
                && equal_bytes_expecting_yes(key.as_ptr(), obj.as_ptr(), obj.user_byte_size())
        }
        _ => equal_bytes_expecting_yes(key.as_ptr(), obj.as_ptr(), key.user_byte_size()),
    }
}

fn objects_equal(key: RObj, obj: IObj) -> bool {
    key.vtable() == obj.vtable() && equal_if_same_vtable(key, obj)
}

/// A locked bucket. Not RAII: every lock ends in one of the
/// `*_and_unlock` calls or [`InternTable::unlock`], mirroring how the
/// callers interleave bucket work with refcount transitions.
pub(crate) struct Bucket<'t> {
    word: &'t AtomicUsize,
}

pub struct InternTable {
    buckets: NonNull<AtomicUsize>,
    /// Visible bucket count minus one; grows monotonically.
    mask: AtomicUsize,
    max_buckets: usize,
    size: AtomicUsize,
}

// Safety: all bucket state is atomic; chain mutation happens only under
// the bucket spinlock.
unsafe impl Send for InternTable {}
// Safety: as above.
unsafe impl Sync for InternTable {}

impl InternTable {
    pub fn new(log2_max_buckets: u32) -> Result<Self> {
        assert!((LOG2_MIN_BUCKETS..=LOG2_MAX_BUCKETS).contains(&log2_max_buckets));
        static_assertions::const_assert_eq!(size_of::<usize>(), 8);

        let max_buckets = 1usize << log2_max_buckets;
        let buckets = page::reserve(max_buckets * size_of::<usize>())?;

        let initial = 1usize << LOG2_MIN_BUCKETS;
        page::dont_dump(
            // Safety: within the reservation.
            unsafe { buckets.add(initial * size_of::<usize>()) },
            (max_buckets - initial) * size_of::<usize>(),
        );

        let table = Self {
            buckets: buckets.cast(),
            mask: AtomicUsize::new(initial - 1),
            max_buckets,
            size: AtomicUsize::new(0),
        };

        // The initially visible buckets hold real (empty) chains, not the
        // lazy-rehash sentinel; they have no parent to rehash from.
        for i in 0..initial {
            table.word(i).store(EMPTY_LIST_BITS, Ordering::Relaxed);
        }

        Ok(table)
    }

    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.max_buckets);
        // Safety: `index` is within the bucket reservation, which lives
        // as long as `self`.
        unsafe { self.buckets.add(index).as_ref() }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn number_of_buckets(&self) -> usize {
        self.mask.load(Ordering::Relaxed) + 1
    }

    fn lock_word(word: &AtomicUsize) {
        loop {
            let prev = word.fetch_or(HELD, Ordering::Acquire);
            if prev & HELD == 0 {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Lock the bucket at `slot`, lazily rehashing into it first if it
    /// has never been populated. Slots may only be locked in order from
    /// higher index to lower.
    fn lock_bucket_index(&self, slot: usize) -> Bucket<'_> {
        let word = self.word(slot);
        Self::lock_word(word);

        if is_lazy_rehash_sentinel(word.load(Ordering::Relaxed)) {
            self.rehash(slot);
        }

        Bucket { word }
    }

    /// Populate `slot` from its parent bucket. `slot` is locked.
    fn rehash(&self, slot: usize) {
        // There must be a set bit, or the slot would have been one of the
        // initial buckets and never a sentinel.
        let highest_bit_index = usize::BITS - 1 - slot.leading_zeros();
        debug_assert!(highest_bit_index >= LOG2_MIN_BUCKETS);
        let parent_slot = slot - (1usize << highest_bit_index);

        // Recursively lock (and maybe populate) the parent.
        let parent = self.lock_bucket_index(parent_slot);

        // Partition the parent chain: an object belongs in `slot` iff the
        // relevant stashed hash bits match the child index.
        let move_extra_hash = (slot >> LOG2_MIN_BUCKETS) as u64;
        let partition_mask = !0u64 >> (63 - (highest_bit_index - LOG2_MIN_BUCKETS));

        // New chains for { parent_slot, slot }. Appending (not
        // prepending) keeps recently interned objects near the heads.
        let mut new_lists = [0usize; 2];
        let mut tails: [*mut usize; 2] = [&mut new_lists[0], &mut new_lists[1]];

        let mut p = parent.word.load(Ordering::Relaxed) & !LOCK_BITS_MASK;
        while let Some(obj) = chain_ptr(p) {
            let next = obj.next_word();
            let move_to_child = (extra_hash_bits(p) & partition_mask) == move_extra_hash;
            // Safety: tails point either at `new_lists` or at the intern
            // `next` word of an object in the locked chain.
            unsafe {
                *tails[usize::from(move_to_child)] = p;
            }
            tails[usize::from(move_to_child)] = obj.next_word_slot();
            p = next;
        }
        // Safety: as above.
        unsafe {
            *tails[0] = EMPTY_LIST_BITS;
            *tails[1] = EMPTY_LIST_BITS;
        }

        // Publish the child (keeping our lock bit) and the parent (whose
        // store doubles as the unlock). A reader either sees the sentinel
        // or a completed head, never a torn value.
        self.word(slot).store(new_lists[1] | HELD, Ordering::Release);
        parent.word.store(new_lists[0], Ordering::Release);
    }

    /// Lock the bucket a hash belongs to, retrying across concurrent
    /// growth. Terminates because the mask grows monotonically.
    pub(crate) fn lock_hash(&self, hash: u64) -> Bucket<'_> {
        let mut mask = self.mask.load(Ordering::Relaxed);
        loop {
            let bucket = self.lock_bucket_index(hash as usize & mask);
            let new_mask = self.mask.load(Ordering::Relaxed);
            if mask == new_mask {
                return bucket;
            }
            // The table grew while we were locking; start over.
            bucket.word.fetch_and(!HELD, Ordering::Release);
            mask = new_mask;
        }
    }

    pub(crate) fn lock_object(&self, obj: IObj) -> Bucket<'_> {
        self.lock_hash(obj.hash())
    }

    pub(crate) fn unlock(&self, bucket: Bucket<'_>) {
        bucket.word.fetch_and(!HELD, Ordering::Release);
    }

    /// Find an object equal to `key` (with hash `hash`) in the locked
    /// bucket.
    pub(crate) fn find_assuming_locked(
        &self,
        bucket: &Bucket<'_>,
        key: RObj,
        hash: u64,
    ) -> Option<IObj> {
        // Objects whose stashed extra hash bits differ can't be equal;
        // skip them without touching their memory.
        let extra_mask = (1u64 << EXTRA_HASH_BITS) - 1;
        let extra = (hash >> LOG2_MIN_BUCKETS) & extra_mask;

        let mut p = bucket.word.load(Ordering::Relaxed) & !LOCK_BITS_MASK;
        while let Some(obj) = chain_ptr(p) {
            if extra_hash_bits(p) == extra && objects_equal(key, obj) {
                return Some(obj);
            }
            p = obj.next_word();
        }
        None
    }

    /// Prepend `obj` (not currently in the table) to the locked bucket,
    /// then unlock and grow if the load factor calls for it.
    pub(crate) fn insert_and_unlock(&self, bucket: Bucket<'_>, obj: IObj, hash: u64) {
        let head = bucket.word.load(Ordering::Relaxed) & !LOCK_BITS_MASK;
        obj.set_next_word(head);

        let new_head = chain_bits(obj, hash >> LOG2_MIN_BUCKETS);
        // One release store both publishes the head and drops the lock.
        bucket.word.store(new_head, Ordering::Release);

        let size = self.size.fetch_add(1, Ordering::Relaxed) + 1;
        self.reserve(size);
    }

    /// Splice `obj` out of the locked bucket containing it, then unlock.
    pub(crate) fn erase_and_unlock(&self, bucket: Bucket<'_>, obj: IObj) {
        self.size.fetch_sub(1, Ordering::Relaxed);

        let head = bucket.word.load(Ordering::Relaxed) & !LOCK_BITS_MASK;
        if chain_ptr(head) == Some(obj) {
            // Replacing the head must stay atomic for concurrent lookups.
            bucket.word.store(obj.next_word(), Ordering::Release);
        } else {
            let mut prev = chain_ptr(head).expect("erasing from an empty bucket");
            loop {
                let next_bits = prev.next_word();
                let next = chain_ptr(next_bits)
                    .expect("attempted to erase missing object from intern table");
                if next == obj {
                    prev.set_next_word(obj.next_word());
                    break;
                }
                prev = next;
            }
            bucket.word.fetch_and(!HELD, Ordering::Release);
        }

        obj.set_next_word(0);
    }

    /// Double the visible bucket count whenever the load factor reaches
    /// 2/3, up to the reserved maximum. No chains move; newly visible
    /// buckets stay lazy-rehash sentinels until first touched.
    pub(crate) fn reserve(&self, new_size: usize) {
        let old_mask = self.mask.load(Ordering::Relaxed);
        if new_size * 3 >= old_mask * 2 {
            let target = new_size * 3 / 2;
            let mut new_mask = old_mask;
            loop {
                new_mask = (new_mask << 1) + 1;
                if new_mask > target {
                    break;
                }
            }
            if new_mask < self.max_buckets {
                // If another thread grew first, theirs wins.
                let _ = self.mask.compare_exchange(
                    old_mask,
                    new_mask,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Verify every table invariant; returns the longest chain length.
    /// Quiescent callers only (tests, shutdown).
    pub fn verify_invariants(&self, arena: &Arena) -> usize {
        let mut longest = 0;
        let mut total = 0usize;
        let min_buckets = 1usize << LOG2_MIN_BUCKETS;

        for slot in (0..=self.mask.load(Ordering::Relaxed)).rev() {
            let word = self.word(slot);

            if is_lazy_rehash_sentinel(word.load(Ordering::Relaxed)) {
                assert!(slot >= min_buckets);
                continue;
            }

            // A populated bucket implies its rehash parent is populated.
            let highest_bit_index = if slot == 0 {
                0
            } else {
                usize::BITS - 1 - slot.leading_zeros()
            };
            if slot >= min_buckets {
                let parent = slot - (1usize << highest_bit_index);
                assert!(!is_lazy_rehash_sentinel(self.word(parent).load(Ordering::Relaxed)));
            }

            if chain_ptr(word.load(Ordering::Relaxed) & !LOCK_BITS_MASK).is_none() {
                // Locking is expensive; skip visibly empty chains.
                continue;
            }

            Self::lock_word(word);

            let known_hash_bits = (highest_bit_index + 1).max(LOG2_MIN_BUCKETS);
            let known_mask = (1u64 << known_hash_bits) - 1;

            let mut len = 0;
            let mut p = word.load(Ordering::Relaxed) & !LOCK_BITS_MASK;
            while let Some(obj) = chain_ptr(p) {
                len += 1;

                // Everything listed has a plain positive refcount; cycle
                // members are never listed (their handles are).
                let rc = obj.current_refcount();
                assert!(rc > 0 && rc <= MAX_REFCOUNT);

                // Its hash must put it in this bucket.
                assert_eq!((obj.hash() ^ slot as u64) & known_mask, 0);

                // References only point at other interned objects.
                // Safety: the chain is locked and the object live.
                unsafe {
                    obj.each_valid_iref(|iref| {
                        assert_eq!(arena.memory_kind(iref.robj().interior()), Kind::IObj);
                    });
                }

                p = obj.next_word();
            }
            longest = longest.max(len);
            total += len;

            word.fetch_and(!HELD, Ordering::Release);
        }

        assert_eq!(total, self.size(), "size counter out of sync with chains");
        longest
    }
}

impl Drop for InternTable {
    fn drop(&mut self) {
        // Safety: the reservation made in `new`, unreferenced hereafter.
        unsafe { page::unmap(self.buckets.cast(), self.max_buckets * size_of::<usize>()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_word_layout() {
        assert_eq!(EXTRA_HASH_BITS, 16);
        assert_eq!(LOG2_MAX_BUCKETS, 28);
        assert!(is_lazy_rehash_sentinel(0));
        assert!(is_lazy_rehash_sentinel(HELD));
        assert!(!is_lazy_rehash_sentinel(EMPTY_LIST_BITS));
        assert!(!is_lazy_rehash_sentinel(EMPTY_LIST_BITS | HELD));
    }

    #[test]
    fn new_table_is_empty() {
        let table = InternTable::new(LOG2_MAX_BUCKETS).unwrap();
        assert_eq!(table.size(), 0);
        assert_eq!(table.number_of_buckets(), 1 << LOG2_MIN_BUCKETS);
    }

    #[test]
    fn reserve_grows_mask() {
        let table = InternTable::new(LOG2_MAX_BUCKETS).unwrap();
        let before = table.number_of_buckets();
        table.reserve(before); // load factor 1 >= 2/3
        assert!(table.number_of_buckets() > before);
    }

    #[test]
    fn lock_unlock_cycle() {
        let table = InternTable::new(LOG2_MAX_BUCKETS).unwrap();
        let b = table.lock_hash(0xdead_beef);
        assert!(b.word.load(Ordering::Relaxed) & HELD != 0);
        table.unlock(b);
        let b = table.lock_hash(0xdead_beef);
        table.unlock(b);
    }
}
