// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration, parsed once per [`Runtime`](crate::Runtime)
//! from numeric environment variables. Unparseable values fall back to
//! the default.

/// Parse a numeric environment variable, falling back to `default`.
pub(crate) fn parse_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub(crate) fn parse_env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Environment-derived switches. See the repository documentation for
/// the meaning of each variable.
#[derive(Debug, Clone)]
pub struct Config {
    /// `SKIP_HEAP_PROFILE`: 0 = off, 1 = all programs, 2 = include the compiler.
    pub heap_profile: u64,
    /// `SKIP_GC_MANUAL`: 0 downgrades explicit collections to auto.
    pub gc_manual: bool,
    /// `SKIP_GC_RATIO`: auto-collect threshold multiplier.
    pub gc_ratio: f64,
    /// `SKIP_GC_SQUAWK`: work/reclaimed ratio above which a collection is
    /// reported as low-yield. Defaults to `gc_ratio * gc_ratio`.
    pub gc_squawk: f64,
    /// `SKIP_GC_VERBOSE`: 0 = none, 1 = abnormalities, 2 = all rooted
    /// collections, 3 = include zero-root sweeps.
    pub gc_verbose: u64,
    /// `SKIP_MEMSTATS`: emit a peak-memory summary at shutdown.
    pub memstats: u64,
    /// `SKIP_INTERN_STATS`: accumulate per-type intern statistics.
    pub intern_stats: bool,
    /// `OBSTACK_VERIFY_NOTE`: record every note and validate collect targets.
    pub verify_note: bool,
    /// `OBSTACK_VERIFY_PARANOID`: run full invariant verification after
    /// mutating operations.
    pub verify_paranoid: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let gc_ratio = parse_env_f64("SKIP_GC_RATIO", 3.0);
        Self {
            heap_profile: parse_env("SKIP_HEAP_PROFILE", 0),
            gc_manual: parse_env("SKIP_GC_MANUAL", 1) != 0,
            gc_ratio,
            gc_squawk: parse_env_f64("SKIP_GC_SQUAWK", gc_ratio * gc_ratio),
            gc_verbose: parse_env("SKIP_GC_VERBOSE", 0),
            memstats: parse_env("SKIP_MEMSTATS", 0),
            intern_stats: parse_env("SKIP_INTERN_STATS", 0) != 0,
            verify_note: parse_env("OBSTACK_VERIFY_NOTE", 0) != 0,
            verify_paranoid: parse_env("OBSTACK_VERIFY_PARANOID", 0) != 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Options that are not environment-derived; mainly for tests.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub config: Config,
    /// Use the malloc-backed debug arena instead of the chunk pools.
    pub malloc_arena: bool,
    /// Cap on the intern table size, `log2` of the bucket count.
    pub log2_max_buckets: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            config: Config::from_env(),
            malloc_arena: false,
            log2_max_buckets: crate::intern_table::LOG2_MAX_BUCKETS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        // Scrub any ambient configuration so the defaults are observable.
        // Safety: tests in this crate do not exercise the environment
        // concurrently.
        unsafe {
            std::env::remove_var("SKIP_GC_RATIO");
            std::env::remove_var("SKIP_GC_SQUAWK");
        }
        let config = Config::from_env();
        assert_eq!(config.gc_ratio, 3.0);
        assert_eq!(config.gc_squawk, 9.0);
        assert!(config.gc_manual);
    }
}
