//! Poll controller: interest registration and wake-up over `mio`.
//!
//! The watch thread owns the `mio::Poll`; everything else goes through
//! [`PollCtl`], which holds a cloned registry handle and the waker used to
//! interrupt a blocked poll. Interest is tracked per fd side as a
//! [`PollSide`]: the desired kind plus a sticky "unsupported" flag for fds
//! the poller rejects (regular files).

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace};

/// Token reserved for the waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Interest level for one fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollKind {
    None,
    ReadOnly,
    WriteOnly,
    ReadWrite,
    /// Outbound connect pending; write-readiness completes it.
    Connected,
    /// Accept-readiness on a listener.
    Listen,
}

/// Registered interest state of one fd side.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSide {
    pub kind: PollKind,
    /// The poller rejected this fd; sticky for the connection's lifetime.
    pub unsupported: bool,
}

impl Default for PollSide {
    fn default() -> Self {
        Self {
            kind: PollKind::None,
            unsupported: false,
        }
    }
}

/// Map a desired connection-level kind onto (input side, output side)
/// interest, depending on whether the two sides share one fd.
pub(crate) fn map_sides(kind: PollKind, same_fd: bool) -> (PollKind, PollKind) {
    match kind {
        PollKind::None => (PollKind::None, PollKind::None),
        PollKind::Listen => (PollKind::Listen, PollKind::None),
        PollKind::Connected => {
            if same_fd {
                (PollKind::Connected, PollKind::None)
            } else {
                (PollKind::Connected, PollKind::Connected)
            }
        }
        PollKind::ReadOnly => (PollKind::ReadOnly, PollKind::None),
        PollKind::WriteOnly => {
            if same_fd {
                (PollKind::WriteOnly, PollKind::None)
            } else {
                (PollKind::None, PollKind::WriteOnly)
            }
        }
        PollKind::ReadWrite => {
            if same_fd {
                (PollKind::ReadWrite, PollKind::None)
            } else {
                (PollKind::ReadOnly, PollKind::WriteOnly)
            }
        }
    }
}

/// mio interest for a kind; `None` means the fd is not polled.
fn interest_of(kind: PollKind) -> Option<Interest> {
    match kind {
        PollKind::None => None,
        PollKind::ReadOnly | PollKind::Listen => Some(Interest::READABLE),
        PollKind::WriteOnly | PollKind::Connected => Some(Interest::WRITABLE),
        PollKind::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
    }
}

/// Encode (connection id, side) into a token. Input side is even, output
/// side odd.
pub(crate) fn token_for(id: usize, output_side: bool) -> Token {
    Token(id * 2 + output_side as usize)
}

/// Decode a readiness token back to (connection id, is-output-side).
pub(crate) fn token_target(token: Token) -> (usize, bool) {
    (token.0 / 2, token.0 & 1 == 1)
}

/// Registry handle + waker, shared by every thread that mutates interest.
pub(crate) struct PollCtl {
    registry: Registry,
    waker: Waker,
}

impl PollCtl {
    /// Create the controller and the `Poll` the watch thread will own.
    pub(crate) fn new() -> io::Result<(PollCtl, Poll)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok((PollCtl { registry, waker }, poll))
    }

    /// Wake a blocked [`Poll::poll`].
    pub(crate) fn interrupt(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "waker failed");
        }
    }

    /// Transition one fd side from its current interest to `new`, keeping
    /// the side record truthful on every path.
    ///
    /// Registration rejected with EPERM marks the side unsupported (sticky);
    /// any other registration failure is a programmer error and aborts.
    pub(crate) fn set_side(
        &self,
        fd: RawFd,
        token: Token,
        side: &mut PollSide,
        new: PollKind,
        name: &str,
    ) {
        if side.unsupported || side.kind == new {
            return;
        }

        trace!(conn = %name, fd, ?new, old = ?side.kind, "polling interest change");

        if new == PollKind::None {
            self.unlink(fd, name);
            side.kind = PollKind::None;
            return;
        }

        let interest = interest_of(new).expect("non-NONE kind maps to an interest");
        let mut source = SourceFd(&fd);
        let result = if side.kind == PollKind::None {
            self.registry.register(&mut source, token, interest)
        } else {
            self.registry.reregister(&mut source, token, interest)
        };

        match result {
            Ok(()) => side.kind = new,
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                debug!(conn = %name, fd, "fd cannot be polled; treating as always ready");
                side.unsupported = true;
                side.kind = PollKind::None;
            }
            Err(e) => panic!("unable to poll fd {fd} for {name}: {e}"),
        }
    }

    /// Deregister an fd. Failures are logged, not propagated (the fd may
    /// already be gone during teardown).
    pub(crate) fn unlink(&self, fd: RawFd, name: &str) {
        let mut source = SourceFd(&fd);
        if let Err(e) = self.registry.deregister(&mut source) {
            trace!(conn = %name, fd, error = %e, "deregister failed");
        }
    }
}

/// Block until readiness or interrupt; EINTR is retried.
pub(crate) fn poll_wait(
    poll: &mut Poll,
    events: &mut Events,
    timeout: Option<Duration>,
) -> io::Result<()> {
    loop {
        match poll.poll(events, timeout) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
