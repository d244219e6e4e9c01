//! The apparently-synchronous I/O facade (§4.G): `connect`/`read`/`write`/`recv`/`send`/`close`,
//! each trying the nonblocking syscall first and, on would-block, registering with the active
//! runtime's poller and yielding until the coroutine is resumed with the observed readiness.
//!
//! Grounded on `net/tcp.rs`'s try-once / register-on-would-block shape, generalized from that
//! file's single-retry-then-break into the full retry loop §4.G step 6 calls for ("dissociate ...
//! and retry step 1"). Every wrapper here reads the current coroutine from the same thread-local
//! slot `Coroutine::current()` already exposes, which is this crate's rendering of the NULL-
//! coroutine convenience form (§4.G): there is no separate coroutine handle to thread through,
//! because every wrapper already resolves it implicitly.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::coroutine::Coroutine;
use crate::error::{Error, Result};
use crate::poller::{ERR, HUP, IN, OUT};
use crate::runtime::{rwc_cookie, with_active_poller};

fn would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

/// Register `fd` for `events` and yield, returning the readiness bitmask the coroutine was
/// resumed with. Implements §4.G steps 3-6 minus the final retry (left to the caller's loop).
fn block_on(fd: RawFd, events: u32) -> Result<u32> {
    let coro_ptr =
        Coroutine::current().expect("I/O wrapper invoked outside a running coroutine");
    let cookie = rwc_cookie(coro_ptr);

    with_active_poller(|p| p.associate(fd, events, cookie, false))
        .expect("I/O wrapper invoked outside a running runtime")?;

    let observed = Coroutine::yield_now(0) as u32;

    if observed & (ERR | HUP) != 0 {
        let _ = with_active_poller(|p| p.dissociate(fd, true, false));
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("fd {fd} reported err/hup (events={observed:#x})"),
        )));
    }

    with_active_poller(|p| p.dissociate(fd, true, false))
        .expect("I/O wrapper invoked outside a running runtime")?;
    Ok(observed)
}

/// Retry `$attempt` (an `io::Result<T>`-valued expression) until it succeeds or fails for a
/// reason other than would-block, yielding on each would-block per §4.G.
macro_rules! retry_would_block {
    ($fd:expr, $events:expr, $attempt:expr) => {{
        loop {
            match $attempt {
                Ok(v) => break Ok(v),
                Err(e) if would_block(&e) => {
                    log::debug!("fd={} would block on events={:#x}, yielding", $fd, $events);
                    block_on($fd, $events)?;
                }
                Err(e) => break Err(Error::Io(e)),
            }
        }
    }};
}

/// Connect `fd` (already created nonblocking) to `addr`, suspending until writable and then
/// inspecting `SO_ERROR` to distinguish a successful connection from a refused one.
pub fn connect(fd: RawFd, addr: &std::net::SocketAddr) -> Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let rc = unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(Error::Io(err));
    }

    block_on(fd, OUT)?;

    let mut so_err: libc::c_int = 0;
    let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_err as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        )
    };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if so_err != 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(so_err)));
    }
    Ok(())
}

/// Read up to `buf.len()` bytes. A `0` return means the peer closed the connection; propagated
/// to the caller unchanged, per §4.G.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    retry_would_block!(fd, IN, {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    retry_would_block!(fd, OUT, {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> Result<usize> {
    retry_would_block!(fd, IN, {
        let n =
            unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> Result<usize> {
    retry_would_block!(fd, OUT, {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    })
}

/// Dissociate `fd` from the active poller (if any) and close it. Never yields.
pub fn close(fd: RawFd) -> Result<()> {
    let _ = with_active_poller(|p| p.dissociate(fd, false, true));
    let rc = unsafe { libc::close(fd) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(io::Error::last_os_error()))
    }
}

fn to_sockaddr(addr: &std::net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        std::net::SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        std::net::SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises the non-blocking-fast-path only (no active runtime, so no yielding): a pipe
    /// with data already buffered never hits `would_block`.
    #[test]
    fn read_and_write_fast_path_without_an_active_runtime() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let [rd, wr] = fds;

        let n = write(wr, b"hello\n").expect("write");
        assert_eq!(n, 6);

        let mut buf = [0u8; 16];
        let n = read(rd, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"hello\n");

        close(rd).expect("close rd");
        close(wr).expect("close wr");
    }

    #[test]
    fn would_block_detects_eagain_and_ewouldblock() {
        assert!(would_block(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(would_block(&io::Error::from_raw_os_error(libc::EWOULDBLOCK)));
        assert!(!would_block(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
    }
}
