//! Fluent construction of a [`Runtime`] from a [`Config`].
//!
//! Grounded on the crate's prior `Builder { opts: Options }` fluent pattern (same chained-setter
//! shape), generalized from a per-coroutine `stack_size`/`name` builder to the runtime-level knobs
//! §4.J names.

use crate::config::Config;
use crate::error::Result;
use crate::runtime::Runtime;

/// Builds a [`Runtime`] one tunable at a time; unset tunables keep [`Config`]'s defaults.
///
/// ```no_run
/// use ef_coroutine::RuntimeBuilder;
///
/// let mut runtime = RuntimeBuilder::new()
///     .stack_size(64 * 1024)
///     .min_count(8)
///     .max_count(1024)
///     .shrink_interval_ms(10_000)
///     .shrink_batch(4)
///     .build()
///     .expect("runtime init");
/// ```
pub struct RuntimeBuilder {
    cfg: Config,
}

impl Default for RuntimeBuilder {
    fn default() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder { cfg: Config::default() }
    }

    /// Per-coroutine reserved stack region size, rounded up to whole pages at allocation time.
    pub fn stack_size(mut self, size: usize) -> RuntimeBuilder {
        self.cfg.stack_size = size;
        self
    }

    /// Control-block reservation carved off the top of each coroutine's stack.
    pub fn header_size(mut self, size: usize) -> RuntimeBuilder {
        self.cfg.header_size = size;
        self
    }

    pub fn min_count(mut self, min_count: usize) -> RuntimeBuilder {
        self.cfg.min_count = min_count;
        self
    }

    pub fn max_count(mut self, max_count: usize) -> RuntimeBuilder {
        self.cfg.max_count = max_count;
        self
    }

    pub fn shrink_interval_ms(mut self, ms: u64) -> RuntimeBuilder {
        self.cfg.shrink_interval_ms = ms;
        self
    }

    pub fn shrink_batch(mut self, batch: usize) -> RuntimeBuilder {
        self.cfg.shrink_batch = batch;
        self
    }

    /// Size of the per-`wait` readiness event buffer.
    pub fn poll_capacity(mut self, capacity: usize) -> RuntimeBuilder {
        self.cfg.poll_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let cfg = self.cfg;
        Runtime::new(
            cfg.stack_size,
            cfg.header_size,
            cfg.min_count,
            cfg.max_count,
            cfg.shrink_interval_ms,
            cfg.shrink_batch,
            cfg.poll_capacity,
        )
    }
}
