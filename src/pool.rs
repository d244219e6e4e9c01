//! The coroutine pool: acquire/release/shrink, parameterized by population bounds and a shrink
//! interval, so the runtime isn't reserving and unmapping a fresh stack for every connection.

use std::time::Instant;

use crate::coroutine::Coroutine;
use crate::error::{Error, Result};

/// A pool of reusable [`Coroutine`]s, bounded between `min_count` and `max_count`, shrinking back
/// toward `min_count` at most `shrink_batch` at a time every `shrink_interval_ms`.
///
/// Grounded on `stack/stack_pool.rs`'s free-list-plus-global-count shape, generalized from a pool
/// of bare stacks to a pool of whole coroutine objects, since this crate's pool recycles the
/// coroutine's control block along with its stack (see `Coroutine::reset`).
pub struct Pool {
    stack_size: usize,
    header_size: usize,
    min_count: usize,
    max_count: usize,
    shrink_interval_ms: u64,
    shrink_batch: usize,

    free: Vec<Box<Coroutine>>,
    count: usize,
    last_shrink: Instant,
}

impl Pool {
    pub fn new(
        stack_size: usize,
        header_size: usize,
        min_count: usize,
        max_count: usize,
        shrink_interval_ms: u64,
        shrink_batch: usize,
    ) -> Pool {
        Pool {
            stack_size,
            header_size,
            min_count,
            max_count,
            shrink_interval_ms,
            shrink_batch,
            free: Vec::new(),
            count: 0,
            last_shrink: Instant::now(),
        }
    }

    /// Total number of coroutines currently allocated (free + in use).
    pub fn len(&self) -> usize {
        self.count
    }

    /// Number of coroutines sitting idle in the free list.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Hand back a coroutine ready to run `entry` from a fresh `Inited` state: either a recycled
    /// one from the free list (reconfigured via [`Coroutine::reset`]) or, if the pool is under
    /// `max_count`, a newly reserved one. Fails with [`Error::PoolExhausted`] if the free list is
    /// empty and the pool is already at `max_count`.
    pub fn acquire<F>(&mut self, entry: F) -> Result<Box<Coroutine>>
    where
        F: FnOnce(isize) -> isize + 'static,
    {
        if let Some(mut coro) = self.free.pop() {
            coro.reset(entry);
            return Ok(coro);
        }

        if self.count >= self.max_count {
            return Err(Error::PoolExhausted);
        }

        let coro = Coroutine::create(self.stack_size, self.header_size, entry)?;
        self.count += 1;
        Ok(coro)
    }

    /// Return a finished coroutine to the free list for later reuse.
    pub fn release(&mut self, coroutine: Box<Coroutine>) {
        self.free.push(coroutine);
    }

    /// Called once per event-loop iteration with the current monotonic time. If the shrink
    /// interval has elapsed and the free list holds more than `min_count`, destroys up to
    /// `shrink_batch` idle coroutines, unmapping their stacks.
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_shrink).as_millis() < self.shrink_interval_ms as u128 {
            return;
        }
        self.last_shrink = now;

        if self.free.len() <= self.min_count {
            return;
        }

        let surplus = self.free.len() - self.min_count;
        let to_drop = surplus.min(self.shrink_batch);
        for _ in 0..to_drop {
            // Drop unmaps the stack (`Stack::drop`); `count` tracks total allocation, not just
            // the free list, so it must shrink along with it.
            self.free.pop();
        }
        self.count -= to_drop;
        log::trace!("pool shrink: dropped {to_drop} idle coroutines, {} remain", self.count);
    }

    /// The coroutine currently running on this OS thread, if any.
    pub fn current(&self) -> Option<*mut Coroutine> {
        Coroutine::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(min: usize, max: usize) -> Pool {
        Pool::new(64 * 1024, 256, min, max, 1000, 2)
    }

    #[test]
    fn acquire_allocates_up_to_max_then_exhausts() {
        let mut pool = small_pool(0, 2);
        let a = pool.acquire(|_| 0).expect("first");
        let b = pool.acquire(|_| 0).expect("second");
        assert_eq!(pool.len(), 2);
        match pool.acquire(|_| 0) {
            Err(Error::PoolExhausted) => {}
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn release_then_acquire_reuses_without_growing_count() {
        let mut pool = small_pool(0, 4);
        let mut coro = pool.acquire(|_| 0).expect("acquire");
        Coroutine::resume(&mut coro, 0).expect("run to completion");
        assert_eq!(coro.status(), crate::coroutine::Status::Exited);
        pool.release(coro);
        assert_eq!(pool.len(), 1);

        let reused = pool.acquire(|_| 1).expect("reacquire");
        assert_eq!(pool.len(), 1);
        assert_eq!(reused.status(), crate::coroutine::Status::Inited);
    }

    #[test]
    fn tick_shrinks_at_most_batch_above_min() {
        let mut pool = small_pool(1, 10);
        let mut coros = Vec::new();
        for _ in 0..5 {
            let mut c = pool.acquire(|_| 0).expect("acquire");
            Coroutine::resume(&mut c, 0).expect("run");
            coros.push(c);
        }
        for c in coros {
            pool.release(c);
        }
        assert_eq!(pool.len(), 5);

        let t1 = Instant::now() + std::time::Duration::from_millis(1100);
        pool.tick(t1);
        // min_count=1, shrink_batch=2: drop 2, leaving 3.
        assert_eq!(pool.len(), 3);

        let t2 = t1 + std::time::Duration::from_millis(1100);
        pool.tick(t2);
        assert_eq!(pool.len(), 1);

        // Already at min_count: no further shrink.
        let t3 = t2 + std::time::Duration::from_millis(1100);
        pool.tick(t3);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn tick_before_interval_elapsed_is_a_no_op() {
        let mut pool = small_pool(0, 10);
        let mut c = pool.acquire(|_| 0).expect("acquire");
        Coroutine::resume(&mut c, 0).expect("run");
        pool.release(c);
        pool.tick(Instant::now());
        assert_eq!(pool.len(), 1);
    }
}
