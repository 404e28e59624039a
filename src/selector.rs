//! Readiness selector wrapper.
//!
//! A thin, uniform facade over the OS's readiness mechanism. Grounded on
//! `original_source/urllib3/sync_connection.py`'s use of Python's
//! `selectors.DefaultSelector` (`register`/`modify`/`unregister`/`select`),
//! re-expressed over `mio::Poll` — the pack's ecosystem choice for exactly
//! this kind of manually-polled, non-blocking socket code (see
//! `other_examples/manifests/tailhook-rotor-http` and
//! `HaveFunTrading-boomnet`).

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Poll, Token};
use mio::Interest as MioInterest;

/// The interest mask a registration can express: the `{READ, WRITE}` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };

    fn to_mio(self) -> MioInterest {
        match (self.read, self.write) {
            (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
            (true, false) => MioInterest::READABLE,
            (false, true) => MioInterest::WRITABLE,
            (false, false) => MioInterest::READABLE,
        }
    }
}

/// Which events were ready for a given registration after a `select()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

/// Wait time for `select()`. `None` means wait indefinitely; `Some(d)`
/// with `d.is_zero()` means a non-blocking poll.
pub type Timeout = Option<Duration>;

const CONN_TOKEN: Token = Token(0);

/// A readiness selector over exactly one registered source, since the
/// connection engine only ever manages a single non-blocking socket at a
/// time.
pub struct Selector {
    poll: Poll,
    events: Events,
    registered: bool,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector { poll: Poll::new()?, events: Events::with_capacity(4), registered: false })
    }

    pub fn register<S: Source + ?Sized>(&mut self, source: &mut S, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, CONN_TOKEN, interest.to_mio())?;
        self.registered = true;
        Ok(())
    }

    pub fn modify<S: Source + ?Sized>(&mut self, source: &mut S, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, CONN_TOKEN, interest.to_mio())
    }

    pub fn unregister<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.registered = false;
        self.poll.registry().deregister(source)
    }

    /// Waits for readiness, returning the set of ready events. An empty
    /// result (`readable: false, writable: false` never actually returned
    /// as a "ready" item — rather zero items observed) means the timeout
    /// expired with nothing ready.
    pub fn select(&mut self, timeout: Timeout) -> io::Result<Ready> {
        self.events.clear();
        log::trace!("waiting for readiness, timeout={:?}", timeout);
        self.poll.poll(&mut self.events, timeout)?;
        let mut ready = Ready::default();
        for event in self.events.iter() {
            if event.is_readable() {
                ready.readable = true;
            }
            if event.is_writable() {
                ready.writable = true;
            }
        }
        log::trace!("readiness: {:?}", ready);
        Ok(ready)
    }

    /// True iff `select(Some(Duration::ZERO))` found nothing ready.
    pub fn timed_out_immediately(&mut self) -> io::Result<bool> {
        Ok(self.select(Some(Duration::ZERO))?.is_empty())
    }

    pub fn close(&mut self) {
        self.registered = false;
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl Ready {
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}
