// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The object runtime core: the machinery that allocates, identifies,
//! deduplicates, and reclaims program values at run time.
//!
//! Four interlocking subsystems:
//!
//! - the **arena** ([`arena`]): page-granular, kind-labelled allocation
//!   with O(1) pointer provenance via a process-wide kind map;
//! - the **obstack** ([`obstack`]): a per-worker generational bump
//!   allocator for short-lived uninterned values, compacted by a
//!   semi-space collector keyed off explicit notes;
//! - the **intern table and interner** ([`intern`]): a lock-striped
//!   concurrent hash set plus a strongly-connected-component based
//!   graph interner yielding canonical, reference-counted, immutable
//!   values — including cycles;
//! - the **refcount engine** ([`refcount`]): atomic counts with
//!   sentinel states, delegated counts for cycle members, and a
//!   non-recursive free cascade.
//!
//! All shared state hangs off an explicit [`Runtime`] value rather than
//! process singletons, so multiple isolated runtimes can coexist in one
//! process (tests lean on this).

mod alloc_profiler;
pub mod arena;
mod config;
mod error;
pub mod gc_type;
pub mod intern;
pub mod intern_table;
pub mod kind_mapper;
pub mod obj;
pub mod obstack;
mod page;
pub mod process;
pub mod refcount;
mod stats;
mod util;
pub mod vtable;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

pub use config::{Config, RuntimeOptions};
pub use error::{Error, throw_runtime_error};
pub use gc_type::{StateChange, StateChangeHandler, Stripe, Type, TypeHints, TypeKind};
pub use intern::{DeepCmpResult, deep_compare, deep_equal, force_fake_local_hash_collisions};
pub use obj::{IObj, IObjOrFakePtr, RObj, RObjOrFakePtr};
pub use obstack::{Note, Obstack, RObjHandle};
pub use refcount::{incref, incref_from_non_zero};
pub use stats::ObjectStats;
pub use vtable::{RuntimeVTable, VTableRef, VTableSlot};

pub type Result<T> = core::result::Result<T, Error>;

use crate::alloc_profiler::AllocLog;
use crate::arena::Arena;
use crate::intern_table::InternTable;
use crate::kind_mapper::KindMapper;
use crate::obj::IOBJ_METADATA_SIZE;

/// One isolated instance of the runtime core. Owns the kind map, the
/// arena pools, and the intern table; obstacks are created against it
/// and hold it alive.
pub struct Runtime {
    pub(crate) config: Config,
    pub(crate) kind_mapper: Arc<KindMapper>,
    pub(crate) arena: Arena,
    pub(crate) intern_table: InternTable,
    pub(crate) cycle_handle_type: Box<Type>,
    pub(crate) cycle_handle_vtable: Box<RuntimeVTable>,
    pub(crate) intern_stats: ObjectStats,
    pub(crate) profiler_shared: spin::Mutex<AllocLog>,
    pub(crate) force_local_hash_zero: AtomicBool,
}

impl Runtime {
    pub fn new() -> Arc<Runtime> {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Arc<Runtime> {
        let kind_mapper = Arc::new(KindMapper::new().expect("out-of-memory"));
        let arena = Arena::new(kind_mapper.clone(), options.malloc_arena);
        let intern_table =
            InternTable::new(options.log2_max_buckets).expect("out-of-memory");

        // The cycle handle type owns one reference: the cycle root.
        let cycle_handle_type = Type::factory(
            "CycleHandle",
            TypeKind::CycleHandle,
            obj::CycleHandle::USER_BYTE_SIZE,
            &[0],
            None,
            IOBJ_METADATA_SIZE,
            IOBJ_METADATA_SIZE,
        );
        let cycle_handle_vtable = RuntimeVTable::factory(&cycle_handle_type, None);

        let intern_stats = ObjectStats::new(options.config.intern_stats);

        Arc::new(Runtime {
            config: options.config,
            kind_mapper,
            arena,
            intern_table,
            cycle_handle_type,
            cycle_handle_vtable,
            intern_stats,
            profiler_shared: spin::Mutex::new(AllocLog::default()),
            force_local_hash_zero: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Intern the graph rooted at `robj`; the result carries an
    /// incremented refcount owned by the caller.
    pub fn intern(&self, robj: RObj) -> Result<IObj> {
        intern::intern(self, robj)
    }

    /// Intern a maybe-fake reference; fake pointers intern to themselves.
    pub fn intern_or_fake(&self, obj: RObjOrFakePtr) -> Result<IObjOrFakePtr> {
        intern::intern_or_fake(self, obj)
    }

    /// Increment an interned object's (delegated) refcount.
    pub fn incref(&self, iobj: IObj) {
        refcount::incref(iobj);
    }

    /// Decrement an interned object's (delegated) refcount, freeing the
    /// object graph it exclusively owns when the count reaches zero.
    pub fn decref(&self, iobj: IObj) {
        refcount::decref(self, iobj);
    }

    /// Number of canonical objects currently interned.
    pub fn intern_table_size(&self) -> usize {
        self.intern_table.size()
    }

    /// Verify every intern-table invariant; returns the longest
    /// collision chain observed.
    pub fn verify_intern_table(&self) -> usize {
        self.intern_table.verify_invariants(&self.arena)
    }

    /// The memory kind a raw address belongs to.
    pub fn raw_memory_kind(&self, addr: usize) -> arena::Kind {
        self.arena.memory_kind(addr)
    }

    pub fn dump_intern_stats(&self, sort_by_count: bool) {
        self.intern_stats.dump(sort_by_count);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.config.heap_profile != 0 {
            alloc_profiler::dump_shared_log(&self.profiler_shared);
        }
    }
}
