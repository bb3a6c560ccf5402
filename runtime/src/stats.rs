// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocation accounting.
//!
//! [`AllocStats`] tracks one obstack's current and peak footprint plus
//! lifetime volume counters; stats are absorbed into the destination on
//! cross-obstack steals, and the obstack holding generation zero prints
//! the peak report at teardown when `SKIP_MEMSTATS` is set.
//!
//! [`ObjectStats`] accumulates per-type intern counts
//! (`SKIP_INTERN_STATS`).

use hashbrown::HashMap;

use crate::obj::RObj;
use crate::obstack::chunk::CHUNK_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CollectMode {
    Runtime,
    Manual,
    Auto,
}

impl CollectMode {
    pub(crate) fn collect_name(self) -> &'static str {
        match self {
            CollectMode::Runtime => "runtime-collect",
            CollectMode::Manual => "manual-collect",
            CollectMode::Auto => "auto-collect",
        }
    }

    pub(crate) fn sweep_name(self) -> &'static str {
        match self {
            CollectMode::Runtime => "runtime-sweep",
            CollectMode::Manual => "manual-sweep",
            CollectMode::Auto => "auto-sweep",
        }
    }
}

#[derive(Default)]
pub(crate) struct AllocStats {
    cur_chunk_count: u64,
    max_chunk_count: u64,
    cur_large_count: u64,
    max_large_count: u64,
    cur_large_size: u64,
    max_large_size: u64,
    cur_intern_count: u64,
    max_intern_count: u64,
    max_total_size: u64,

    small_vol: u64,
    large_vol: u64,
    fragment_vol: u64,
    placeholder_vol: u64,
    gc_vol: u64,
    shadow_vol: u64,
    gc_reclaim_vol: u64,
    gc_visit_count: u64,
    gc_scan_vol: u64,

    runtime_collects: u64,
    manual_collects: u64,
    auto_collects: u64,
    runtime_sweeps: u64,
    manual_sweeps: u64,
    auto_sweeps: u64,
}

impl AllocStats {
    fn update_total(&mut self) {
        self.max_total_size = self
            .max_total_size
            .max(self.cur_chunk_count * CHUNK_SIZE as u64 + self.cur_large_size);
    }

    pub(crate) fn modify_chunk(&mut self, delta: i64) {
        self.cur_chunk_count = self.cur_chunk_count.saturating_add_signed(delta);
        self.max_chunk_count = self.max_chunk_count.max(self.cur_chunk_count);
        self.update_total();
    }

    pub(crate) fn modify_large(&mut self, delta_count: i64, delta_bytes: i64) {
        self.cur_large_count = self.cur_large_count.saturating_add_signed(delta_count);
        self.cur_large_size = self.cur_large_size.saturating_add_signed(delta_bytes);
        self.max_large_count = self.max_large_count.max(self.cur_large_count);
        self.max_large_size = self.max_large_size.max(self.cur_large_size);
        self.update_total();
    }

    pub(crate) fn modify_intern(&mut self, delta: i64) {
        self.cur_intern_count = self.cur_intern_count.saturating_add_signed(delta);
        self.max_intern_count = self.max_intern_count.max(self.cur_intern_count);
    }

    pub(crate) fn alloc_small(&mut self, bytes: usize) {
        self.small_vol += bytes as u64;
    }

    pub(crate) fn alloc_large(&mut self, bytes: usize) {
        self.large_vol += bytes as u64;
    }

    pub(crate) fn alloc_fragment(&mut self, bytes: usize) {
        self.fragment_vol += bytes as u64;
    }

    pub(crate) fn alloc_placeholder(&mut self, bytes: usize) {
        self.placeholder_vol += bytes as u64;
    }

    pub(crate) fn alloc_gc(&mut self, bytes: usize) {
        self.gc_vol += bytes as u64;
    }

    pub(crate) fn alloc_shadow(&mut self, bytes: usize) {
        self.shadow_vol += bytes as u64;
    }

    pub(crate) fn gc_reclaim(&mut self, bytes: usize) {
        self.gc_reclaim_vol += bytes as u64;
    }

    pub(crate) fn gc_visit(&mut self, count: usize) {
        self.gc_visit_count += count as u64;
    }

    pub(crate) fn gc_scan(&mut self, bytes: usize) {
        self.gc_scan_vol += bytes as u64;
    }

    pub(crate) fn count_collect(&mut self, mode: CollectMode) {
        match mode {
            CollectMode::Runtime => self.runtime_collects += 1,
            CollectMode::Manual => self.manual_collects += 1,
            CollectMode::Auto => self.auto_collects += 1,
        }
    }

    pub(crate) fn count_sweep(&mut self, mode: CollectMode) {
        match mode {
            CollectMode::Runtime => self.runtime_sweeps += 1,
            CollectMode::Manual => self.manual_sweeps += 1,
            CollectMode::Auto => self.auto_sweeps += 1,
        }
    }

    pub(crate) fn cur_chunk_count(&self) -> u64 {
        self.cur_chunk_count
    }

    pub(crate) fn cur_large_count(&self) -> u64 {
        self.cur_large_count
    }

    pub(crate) fn cur_large_size(&self) -> u64 {
        self.cur_large_size
    }

    pub(crate) fn cur_intern_count(&self) -> u64 {
        self.cur_intern_count
    }

    /// Absorb volume counters from a stolen obstack. Current counters
    /// were already transferred by the steal itself; peaks are per
    /// obstack and ignored.
    pub(crate) fn merge(&mut self, other: &mut AllocStats) {
        let mut take = |l: &mut u64, r: &mut u64| {
            *l += *r;
            *r = 0;
        };
        take(&mut self.small_vol, &mut other.small_vol);
        take(&mut self.large_vol, &mut other.large_vol);
        take(&mut self.fragment_vol, &mut other.fragment_vol);
        take(&mut self.placeholder_vol, &mut other.placeholder_vol);
        take(&mut self.gc_vol, &mut other.gc_vol);
        take(&mut self.shadow_vol, &mut other.shadow_vol);
        take(&mut self.gc_reclaim_vol, &mut other.gc_reclaim_vol);
        take(&mut self.gc_visit_count, &mut other.gc_visit_count);
        take(&mut self.gc_scan_vol, &mut other.gc_scan_vol);
        take(&mut self.runtime_collects, &mut other.runtime_collects);
        take(&mut self.manual_collects, &mut other.manual_collects);
        take(&mut self.auto_collects, &mut other.auto_collects);
        take(&mut self.runtime_sweeps, &mut other.runtime_sweeps);
        take(&mut self.manual_sweeps, &mut other.manual_sweeps);
        take(&mut self.auto_sweeps, &mut other.auto_sweeps);
    }

    pub(crate) fn report_final(&self) {
        let total_vol = self.small_vol + self.large_vol;
        let max_chunk_bytes = self.max_chunk_count * CHUNK_SIZE as u64;
        let collects = self.runtime_collects + self.manual_collects + self.auto_collects;
        let sweeps = self.runtime_sweeps + self.manual_sweeps + self.auto_sweeps;
        eprintln!("Obstack Peak Memory Usage Statistics");
        eprintln!("  total:      {}", self.max_total_size);
        eprintln!("  chunks:     {} ({max_chunk_bytes})", self.max_chunk_count);
        eprintln!(
            "  largeObj:   {} ({})",
            self.max_large_count, self.max_large_size
        );
        eprintln!("  iobj:       {}", self.max_intern_count);
        eprintln!("Obstack Volume");
        eprintln!("  allocated:  {total_vol}");
        eprintln!("  |-large:    {}", self.large_vol);
        eprintln!("  |-small:    {}", self.small_vol);
        eprintln!("    |-places: {}", self.placeholder_vol);
        eprintln!("    |-frags:  {}", self.fragment_vol);
        eprintln!("Collector Volume");
        eprintln!("  sweeps:    {sweeps}");
        eprintln!("  |-runtime: {}", self.runtime_sweeps);
        eprintln!("  |-manual:  {}", self.manual_sweeps);
        eprintln!("  |-auto:    {}", self.auto_sweeps);
        eprintln!("  collects:  {collects}");
        eprintln!("  |-runtime: {}", self.runtime_collects);
        eprintln!("  |-manual:  {}", self.manual_collects);
        eprintln!("  |-auto:    {}", self.auto_collects);
        eprintln!("  visited:   {}", self.gc_visit_count);
        eprintln!("  scanned:   {}", self.gc_scan_vol);
        eprintln!("  copied:    {}", self.gc_vol);
        eprintln!("  shadowed:  {}", self.shadow_vol);
        eprintln!("  reclaimed: {}", self.gc_reclaim_vol);
    }
}

#[derive(Clone, Copy, Default)]
struct Counters {
    count: u64,
    size: u64,
}

/// Per-type intern statistics, accumulated when `SKIP_INTERN_STATS` is
/// set.
pub struct ObjectStats {
    enabled: bool,
    counters: spin::Mutex<HashMap<String, Counters>>,
}

impl ObjectStats {
    pub(crate) fn new(enabled: bool) -> ObjectStats {
        ObjectStats {
            enabled,
            counters: spin::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn accrue(&self, robj: RObj) {
        if !self.enabled {
            return;
        }
        let name = robj.type_().name().to_owned();
        let size = robj.user_byte_size() as u64;
        let mut counters = self.counters.lock();
        let entry = counters.entry(name).or_default();
        entry.count += 1;
        entry.size += size;
    }

    pub fn dump(&self, sort_by_count: bool) {
        let counters = self.counters.lock();
        let mut rows: Vec<_> = counters
            .iter()
            .map(|(name, c)| (name.clone(), c.count, c.size))
            .collect();
        if sort_by_count {
            rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        } else {
            rows.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        }
        eprintln!("{{ intern: ");
        for (name, count, size) in rows {
            eprintln!("  {name}: count {count} size {size}");
        }
        eprintln!("}}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_track_current() {
        let mut stats = AllocStats::default();
        stats.modify_chunk(3);
        stats.modify_chunk(-2);
        stats.modify_large(2, 4096);
        stats.modify_large(-1, -1024);
        assert_eq!(stats.cur_chunk_count(), 1);
        assert_eq!(stats.cur_large_count(), 1);
        assert_eq!(stats.cur_large_size(), 3072);
        assert_eq!(stats.max_chunk_count, 3);
        assert_eq!(stats.max_large_size, 4096);
        assert!(stats.max_total_size >= 3 * CHUNK_SIZE as u64);
    }

    #[test]
    fn merge_moves_volumes() {
        let mut a = AllocStats::default();
        let mut b = AllocStats::default();
        b.alloc_small(100);
        b.alloc_large(200);
        b.count_collect(CollectMode::Manual);
        a.merge(&mut b);
        assert_eq!(a.small_vol, 100);
        assert_eq!(a.large_vol, 200);
        assert_eq!(a.manual_collects, 1);
        assert_eq!(b.small_vol, 0);
        assert_eq!(b.manual_collects, 0);
    }
}
