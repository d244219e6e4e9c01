//! The default [`Poller`] backend: `mio`'s cross-platform epoll/kqueue wrapper, translated
//! to/from the abstract `IN`/`OUT`/`ERR`/`HUP` bitmask.
//!
//! Grounded on this crate's prior `scheduler.rs`, which already depended on `mio` for exactly
//! this role (registering fds and waiting for readiness) — reusing the dependency rather than
//! inventing a new one. That file targeted a pre-1.0 `mio` API (`EventLoop`, old `Token`); this
//! backend is written against the modern (0.8) `mio::{Poll, Events, Interest, Token}` API, since
//! the pre-1.0 types no longer exist.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::{Event, Poller, ERR, HUP, IN, OUT};
use crate::error::{Error, Result};

/// `mio`-backed [`Poller`]. One fd at a time per registration; `Token(fd as usize)` is used
/// directly as the registration key since fds are unique while associated, avoiding a second
/// indirection table for the token itself (only the cookie needs a side table).
pub struct MioPoller {
    poll: Poll,
    events: Events,
    cookies: HashMap<RawFd, *mut ()>,
}

unsafe impl Send for MioPoller {}

impl MioPoller {
    pub fn new(capacity: usize) -> Result<MioPoller> {
        let poll = Poll::new().map_err(Error::Poller)?;
        Ok(MioPoller {
            poll,
            events: Events::with_capacity(capacity),
            cookies: HashMap::new(),
        })
    }

    fn interest_for(events: u32) -> Interest {
        match (events & IN != 0, events & OUT != 0) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE, // mio requires a non-empty interest set
        }
    }
}

impl Poller for MioPoller {
    fn associate(&mut self, fd: RawFd, events: u32, cookie: *mut (), fired: bool) -> Result<()> {
        let interest = Self::interest_for(events);
        let token = Token(fd as usize);
        let already_registered = self.cookies.contains_key(&fd);
        self.cookies.insert(fd, cookie);

        let result = if already_registered {
            self.poll.registry().reregister(&mut SourceFd(&fd), token, interest)
        } else {
            self.poll.registry().register(&mut SourceFd(&fd), token, interest)
        };

        log::debug!("poller associate fd={fd} events={events:#x} fired={fired}");
        result.map_err(Error::Poller)
    }

    fn dissociate(&mut self, fd: RawFd, fired: bool, onclose: bool) -> Result<()> {
        self.cookies.remove(&fd);
        log::debug!("poller dissociate fd={fd} fired={fired} onclose={onclose}");

        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            Ok(()) => Ok(()),
            // The fd is about to be (or already was) closed; the kernel may have already dropped
            // the registration on its own. Not an error worth surfacing.
            Err(_) if onclose => Ok(()),
            Err(e) => Err(Error::Poller(e)),
        }
    }

    fn wait(&mut self, out: &mut Vec<Event>, timeout_ms: Option<u64>) -> Result<usize> {
        let timeout = timeout_ms.map(Duration::from_millis);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // mio retries EINTR internally; any error reaching here is a genuine poller failure.
            Err(e) => return Err(Error::Poller(e)),
        }

        let mut count = 0;
        for ev in self.events.iter() {
            let fd = ev.token().0 as RawFd;
            let Some(&cookie) = self.cookies.get(&fd) else {
                continue; // raced with a dissociate already processed earlier in this batch
            };

            let mut mask = 0;
            if ev.is_readable() {
                mask |= IN;
            }
            if ev.is_writable() {
                mask |= OUT;
            }
            if ev.is_error() {
                mask |= ERR;
            }
            if ev.is_read_closed() || ev.is_write_closed() {
                mask |= HUP;
            }

            out.push(Event { events: mask, cookie });
            count += 1;
        }
        Ok(count)
    }
}
