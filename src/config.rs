//! Every tunable named in §4.D/§4.F, with hard-coded defaults matching the echo-server example
//! shape and one environment-variable override for the knob a deployment most often needs to
//! tune without a rebuild.
//!
//! Grounded on `options.rs`'s `Options { stack_size, name }` + `DEFAULT_STACK_SIZE` constant
//! pattern, extended with the runtime-level knobs the old `Options` didn't cover, and on
//! `stack/stack_pool.rs`'s `max_cached_stacks()` env-var-memoized-via-`AtomicUsize` pattern for
//! `max_count`'s override.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024; // 2M, matches the teacher's `Options` default
const DEFAULT_HEADER_SIZE: usize = 256;
const DEFAULT_MIN_COUNT: usize = 16;
const DEFAULT_MAX_COUNT: usize = 4096;
const DEFAULT_SHRINK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SHRINK_BATCH: usize = 8;
const DEFAULT_POLL_CAPACITY: usize = 256;

/// Every §4.D/§4.F tunable. Construct via [`Default`] or [`crate::builder::RuntimeBuilder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub stack_size: usize,
    pub header_size: usize,
    pub min_count: usize,
    pub max_count: usize,
    pub shrink_interval_ms: u64,
    pub shrink_batch: usize,
    pub poll_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
            min_count: DEFAULT_MIN_COUNT,
            max_count: env_max_count(),
            shrink_interval_ms: DEFAULT_SHRINK_INTERVAL_MS,
            shrink_batch: DEFAULT_SHRINK_BATCH,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

/// `max_count`, overridable via `EF_COROUTINE_MAX_COUNT` and memoized for the process, following
/// the same sentinel-plus-`AtomicUsize` trick `stack_pool.rs`'s `max_cached_stacks` uses (`0` is
/// reserved as "not yet read", so the stored value is the real one plus one).
fn env_max_count() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    match CACHED.load(Ordering::Relaxed) {
        0 => {}
        n => return n - 1,
    }
    let value = env::var("EF_COROUTINE_MAX_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_COUNT);
    CACHED.store(value + 1, Ordering::Relaxed);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(cfg.header_size, DEFAULT_HEADER_SIZE);
        assert_eq!(cfg.min_count, DEFAULT_MIN_COUNT);
        assert_eq!(cfg.shrink_interval_ms, DEFAULT_SHRINK_INTERVAL_MS);
        assert_eq!(cfg.shrink_batch, DEFAULT_SHRINK_BATCH);
        assert_eq!(cfg.poll_capacity, DEFAULT_POLL_CAPACITY);
    }
}
