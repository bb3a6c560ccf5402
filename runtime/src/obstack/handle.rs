// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Durable cross-thread references to obstack roots.
//!
//! Every handle is doubly linked into its owning obstack (a sentinel
//! lives in the obstack detail), so collections treat all handles as
//! roots and cross-obstack stealing can relink them wholesale. The
//! wrapped pointer and the links belong to the obstack's owning thread;
//! the only cross-thread operations are reading the owner and posting
//! tasks to it.

use std::cell::Cell;
use std::ptr;
use std::sync::Arc;

use crate::obj::RObjOrFakePtr;
use crate::process::{self, Process, Task};

pub struct RObjHandle {
    robj: Cell<RObjOrFakePtr>,
    next: Cell<*mut RObjHandle>,
    prev: Cell<*mut RObjHandle>,
    owner: spin::Mutex<Arc<Process>>,
}

// Safety: `robj` and the links are only touched by the obstack's owning
// thread (collection, stealing, drop); other threads only go through
// `owner`, which is behind a mutex. Stealing hands the whole list, and
// with it this responsibility, to the destination thread.
unsafe impl Send for RObjHandle {}
// Safety: as above.
unsafe impl Sync for RObjHandle {}

impl RObjHandle {
    pub(crate) fn new(robj: RObjOrFakePtr, owner: Arc<Process>) -> Box<RObjHandle> {
        let handle = Box::new(RObjHandle {
            robj: Cell::new(robj),
            next: Cell::new(ptr::null_mut()),
            prev: Cell::new(ptr::null_mut()),
            owner: spin::Mutex::new(owner),
        });
        // Unlinked handles point at themselves.
        handle.next.set(&*handle as *const _ as *mut _);
        handle.prev.set(&*handle as *const _ as *mut _);
        handle
    }

    /// The wrapped root. Owner-thread only.
    pub fn get(&self) -> RObjOrFakePtr {
        self.robj.get()
    }

    pub(crate) fn set(&self, robj: RObjOrFakePtr) {
        self.robj.set(robj);
    }

    pub fn is_owned_by_current_process(&self) -> bool {
        Arc::ptr_eq(&self.owner.lock(), &process::current())
    }

    pub(crate) fn owner(&self) -> Arc<Process> {
        self.owner.lock().clone()
    }

    pub(crate) fn replace_owner(&self, new_owner: Arc<Process>) {
        let old = {
            let mut owner = self.owner.lock();
            core::mem::replace(&mut *owner, new_owner)
        };
        // Destroy the old owner reference outside the lock; dropping it
        // may run arbitrary teardown.
        drop(old);
    }

    /// Route a task to whichever process owns this handle's obstack.
    ///
    /// There is an unlikely race where the owner dies after we read it;
    /// stealing reassigns the owner, so retrying resolves it and the
    /// task is never lost.
    pub fn schedule(&self, mut task: Task) {
        loop {
            let owner = self.owner.lock().clone();
            match owner.schedule_task_if_not_dead(task) {
                Ok(()) => break,
                Err(rejected) => task = rejected,
            }
            core::hint::spin_loop();
        }
    }

    pub(crate) fn unlink(&self) {
        // Safety: neighbors are live handles (or the sentinel) on the
        // same list, mutated only by the owning thread.
        unsafe {
            (*self.next.get()).prev.set(self.prev.get());
            (*self.prev.get()).next.set(self.next.get());
        }
        self.next.set(self as *const _ as *mut _);
        self.prev.set(self as *const _ as *mut _);
    }
}

impl Drop for RObjHandle {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// The intrusive handle list: a boxed sentinel whose neighbors are the
/// handles. The sentinel's `robj` is never read as a root.
pub(crate) struct HandleList {
    sentinel: Box<RObjHandle>,
}

impl HandleList {
    pub(crate) fn new(owner: Arc<Process>) -> HandleList {
        HandleList {
            sentinel: RObjHandle::new(RObjOrFakePtr::NULL, owner),
        }
    }

    fn sentinel_ptr(&self) -> *mut RObjHandle {
        &*self.sentinel as *const _ as *mut _
    }

    pub(crate) fn prepend(&self, handle: &RObjHandle) {
        let sentinel = self.sentinel_ptr();
        let handle_ptr = handle as *const _ as *mut RObjHandle;
        // Safety: sentinel and its neighbor are live list members; only
        // the owning thread links.
        unsafe {
            handle.next.set((*sentinel).next.get());
            handle.prev.set(sentinel);
            (*(*sentinel).next.get()).prev.set(handle_ptr);
            (*sentinel).next.set(handle_ptr);
        }
    }

    pub(crate) fn any_handles(&self) -> bool {
        self.sentinel.next.get() != self.sentinel_ptr()
    }

    pub(crate) fn any_valid_handles(&self) -> bool {
        let mut any = false;
        self.each_handle(|h| any |= h.get().is_ptr());
        any
    }

    /// Visit every handle; `f` may unlink the handle it is given.
    pub(crate) fn each_handle(&self, mut f: impl FnMut(&RObjHandle)) {
        let sentinel = self.sentinel_ptr();
        let mut cursor = self.sentinel.next.get();
        while cursor != sentinel {
            // Safety: list members are live handles owned by callers who
            // must outlive their obstack registration.
            let handle = unsafe { &*cursor };
            let next = handle.next.get();
            f(handle);
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_unlink() {
        let owner = Process::new();
        let list = HandleList::new(owner.clone());
        assert!(!list.any_handles());

        let a = RObjHandle::new(RObjOrFakePtr::from_bits(0x1000), owner.clone());
        let b = RObjHandle::new(RObjOrFakePtr::from_bits(0x2000), owner.clone());
        list.prepend(&a);
        list.prepend(&b);
        assert!(list.any_handles());
        assert!(list.any_valid_handles());

        let mut seen = vec![];
        list.each_handle(|h| seen.push(h.get().bits()));
        assert_eq!(seen, vec![0x2000, 0x1000]);

        drop(b);
        let mut seen = vec![];
        list.each_handle(|h| seen.push(h.get().bits()));
        assert_eq!(seen, vec![0x1000]);

        drop(a);
        assert!(!list.any_handles());
    }

    #[test]
    fn schedule_lands_on_reassigned_owner() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dead = Process::new();
        dead.kill();
        let alive = Process::new();
        let h = RObjHandle::new(RObjOrFakePtr::NULL, dead);
        h.replace_owner(alive.clone());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        h.schedule(Box::new(move || flag.store(true, Ordering::Relaxed)));
        alive.run_pending();
        assert!(ran.load(Ordering::Relaxed));
    }
}
