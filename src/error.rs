//! Typed error hierarchy shared by coroutine lifecycle, pool, and I/O wrapper operations.

use std::io;

/// Errors surfaced by this crate's public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `resume` was called on a coroutine that is already active — currently running, or
    /// suspended as an ancestor somewhere in the chain that resumed into the coroutine presently
    /// running on this thread — rather than idle and ready to be resumed.
    #[error("coroutine is not initialized")]
    NotInited,

    /// `resume` was called on a coroutine whose entry procedure has already returned.
    #[error("coroutine has already exited")]
    Exited,

    /// `acquire` was called while the pool is already at `max_count`.
    #[error("coroutine pool exhausted (at max_count)")]
    PoolExhausted,

    /// Reserving or committing a coroutine's stack failed.
    #[error("stack allocation failed: {0}")]
    StackAlloc(#[source] io::Error),

    /// An I/O wrapper's underlying syscall failed for a reason other than would-block.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// A poller registration or wait call failed.
    #[error("poller error: {0}")]
    Poller(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
