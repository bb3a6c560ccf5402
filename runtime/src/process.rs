// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal owner-process abstraction.
//!
//! The real scheduler lives outside this crate; the runtime core only
//! needs processes as (a) the owner identity of an obstack's handles and
//! (b) a task queue that work can be routed to from other threads, and
//! that can *die*, at which point posting fails and the caller retries
//! against the handle's new owner.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

pub struct Process {
    id: u64,
    /// `None` once the process is dead.
    queue: spin::Mutex<Option<VecDeque<Task>>>,
}

impl Process {
    pub fn new() -> Arc<Process> {
        Arc::new(Process {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            queue: spin::Mutex::new(Some(VecDeque::new())),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Post a task unless the process has died; the task is handed back
    /// on failure so the caller can retry elsewhere.
    pub fn schedule_task_if_not_dead(&self, task: Task) -> Result<(), Task> {
        match &mut *self.queue.lock() {
            Some(queue) => {
                queue.push_back(task);
                Ok(())
            }
            None => Err(task),
        }
    }

    /// Run every queued task. Tests stand in for the scheduler with this.
    pub fn run_pending(&self) {
        loop {
            let task = self.queue.lock().as_mut().and_then(VecDeque::pop_front);
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Mark the process dead, dropping queued tasks. Subsequent posts
    /// fail and callers fall back to the retry path.
    pub fn kill(&self) {
        *self.queue.lock() = None;
    }

    pub fn is_dead(&self) -> bool {
        self.queue.lock().is_none()
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Process {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Process>>> = const { RefCell::new(None) };
}

/// The process owning work on the current thread, created on first use.
pub fn current() -> Arc<Process> {
    CURRENT.with(|c| {
        c.borrow_mut()
            .get_or_insert_with(|| Process::new())
            .clone()
    })
}

/// Replace the current thread's process, returning the previous one.
pub fn set_current(process: Arc<Process>) -> Option<Arc<Process>> {
    CURRENT.with(|c| c.borrow_mut().replace(process))
}
