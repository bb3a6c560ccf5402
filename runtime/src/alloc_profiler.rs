// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Heap profiling by logging every obstack allocation.
//!
//! Controlled by `SKIP_HEAP_PROFILE` (0 = off, 1 = all programs, 2 =
//! include the compiler itself). Allocation sites are identified by
//! their top four caller program counters plus the allocation size.
//! Each obstack keeps its own log (no synchronization on the alloc
//! path) and merges it into the runtime's shared log at teardown; the
//! shared log is symbolized and dumped as CSV when the runtime is
//! dropped.

use std::io::Write;

use hashbrown::HashMap;
use smallvec::SmallVec;

/// Distinct return addresses inside one function make sites too fine
/// grained to be useful, but four frames of context disambiguate the
/// interesting call chains.
const DROP_FRAMES: usize = 2;
const KEEP_FRAMES: usize = 4;

pub(crate) type CallStack = SmallVec<[usize; KEEP_FRAMES]>;
type AllocSite = (CallStack, usize);
pub(crate) type AllocLog = HashMap<AllocSite, u64>;

fn capture_call_stack() -> CallStack {
    let mut stack = CallStack::new();
    let mut skip = DROP_FRAMES;
    backtrace::trace(|frame| {
        if skip > 0 {
            skip -= 1;
            return true;
        }
        stack.push(frame.ip() as usize);
        stack.len() < KEEP_FRAMES
    });
    stack
}

/// Per-obstack allocation log.
#[derive(Default)]
pub(crate) struct AllocProfiler {
    log: AllocLog,
}

impl AllocProfiler {
    pub(crate) fn log_allocation(&mut self, size: usize) {
        *self.log.entry((capture_call_stack(), size)).or_insert(0) += 1;
    }

    pub(crate) fn merge_into(&mut self, shared: &spin::Mutex<AllocLog>) {
        if self.log.is_empty() {
            return;
        }
        let mut shared = shared.lock();
        for (site, count) in self.log.drain() {
            *shared.entry(site).or_insert(0) += count;
        }
    }
}

fn symbolize(ip: usize) -> String {
    let mut name = None;
    backtrace::resolve(ip as *mut _, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name.unwrap_or_else(|| format!("{ip:#x}"))
}

/// Symbolize the shared log and dump it as CSV to a fresh temp file.
pub(crate) fn dump_shared_log(shared: &spin::Mutex<AllocLog>) {
    let log = core::mem::take(&mut *shared.lock());
    if log.is_empty() {
        return;
    }

    // Aggregate by symbolized site: distinct return addresses within the
    // same functions collapse into one row.
    let mut report: HashMap<(Vec<String>, usize), u64> = HashMap::new();
    for ((stack, size), count) in log {
        let symbols: Vec<String> = stack.iter().map(|&ip| symbolize(ip)).collect();
        *report.entry((symbols, size)).or_insert(0) += count;
    }

    let path = temp_csv_path();
    let mut file = match std::fs::File::create(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("heap profiler: could not open output log file ({err}), ignoring");
            return;
        }
    };

    let mut out = String::new();
    out.push_str("pc0,pc1,pc2,pc3,bytes allocated,call count,total bytes\n");
    for ((symbols, size), count) in report {
        for i in 0..KEEP_FRAMES {
            let name = symbols.get(i).map(String::as_str).unwrap_or("");
            out.push('"');
            out.push_str(&name.replace('"', "'"));
            out.push_str("\",");
        }
        out.push_str(&format!("{size},{count},{}\n", size as u64 * count));
    }

    if let Err(err) = file.write_all(out.as_bytes()) {
        eprintln!("heap profiler: write failed: {err}");
        return;
    }
    eprintln!("heap profiler: wrote allocation log to {}", path.display());
}

fn temp_csv_path() -> std::path::PathBuf {
    // mkstemps-style unique suffix.
    let nonce = {
        let pid = std::process::id() as u64;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(0);
        crate::util::munge_bits(pid ^ now)
    };
    let suffix: String = (0..6)
        .map(|i| {
            let c = (nonce >> (i * 5)) & 31;
            char::from(b'a' + (c % 26) as u8)
        })
        .collect();
    std::path::PathBuf::from(format!("/tmp/skip-alloc-log-{suffix}.csv"))
}
