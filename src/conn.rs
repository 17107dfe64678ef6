//! Connection objects and the caller-facing [`Conn`] handle.
//!
//! A connection owns an fd pair (the two sides may be the same socket or a
//! distinct pipe pair), its buffers, its polling interest, and a FIFO of
//! pending work. All mutable state lives under the manager's primary mutex;
//! the public [`Conn`] handle re-locks per operation and is safe to clone
//! into callbacks. Handles are generation-checked: using one after
//! `on_finish` returned yields [`Error::ConnectionError`] instead of touching
//! a recycled slot.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::address::ConnAddress;
use crate::buffer::InputBuffer;
use crate::error::{Error, Result};
use crate::mgr::{close_con, Shared};
use crate::poll::{map_sides, token_for, PollCtl, PollKind, PollSide};
use crate::work::{Work, WorkFunc, WorkStatus};

/// Per-connection argument produced by `on_connection` and handed back to
/// `on_finish`. Opaque to the manager.
pub type ConArg = Box<dyn Any + Send>;

/// Registration-time argument, shared by every connection a listener
/// accepts.
pub type ListenArg = Arc<dyn Any + Send + Sync>;

/// How bytes are delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Stream delivery through `on_data`.
    Raw,
    /// Framed delivery through `on_msg` (4-byte big-endian length prefix).
    Rpc,
}

impl fmt::Display for ConnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnKind::Raw => write!(f, "RAW"),
            ConnKind::Rpc => write!(f, "RPC"),
        }
    }
}

pub type OnConnectionFn = dyn Fn(&Conn, Option<ListenArg>) -> Option<ConArg> + Send + Sync;
pub type OnDataFn = dyn Fn(&Conn, &mut ConArg) -> Result<()> + Send + Sync;
pub type OnMsgFn = dyn Fn(&Conn, BytesMut, &mut ConArg) -> Result<()> + Send + Sync;
pub type OnFinishFn = dyn Fn(&Conn, Option<ConArg>) + Send + Sync;

/// Callback table registered with every connection.
///
/// `on_connection` runs exactly once for non-listen connections; returning
/// `None` closes the connection. RAW connections must provide `on_data`, RPC
/// connections `on_msg`; `on_finish` runs exactly once at end of lifetime.
#[derive(Clone, Default)]
pub struct Events {
    pub(crate) on_connection: Option<Arc<OnConnectionFn>>,
    pub(crate) on_data: Option<Arc<OnDataFn>>,
    pub(crate) on_msg: Option<Arc<OnMsgFn>>,
    pub(crate) on_finish: Option<Arc<OnFinishFn>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection(
        mut self,
        f: impl Fn(&Conn, Option<ListenArg>) -> Option<ConArg> + Send + Sync + 'static,
    ) -> Self {
        self.on_connection = Some(Arc::new(f));
        self
    }

    pub fn on_data(
        mut self,
        f: impl Fn(&Conn, &mut ConArg) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_msg(
        mut self,
        f: impl Fn(&Conn, BytesMut, &mut ConArg) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_msg = Some(Arc::new(f));
        self
    }

    pub fn on_finish(
        mut self,
        f: impl Fn(&Conn, Option<ConArg>) + Send + Sync + 'static,
    ) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }

    /// Capability check: the kind must have its delivery callback, and
    /// non-listen connections need `on_connection`.
    pub(crate) fn validate(&self, kind: ConnKind, is_listen: bool) -> Result<()> {
        if !is_listen && self.on_connection.is_none() {
            return Err(Error::InvalidArgument("events.on_connection is required"));
        }
        match kind {
            ConnKind::Raw if self.on_data.is_none() => {
                Err(Error::InvalidArgument("RAW connections require on_data"))
            }
            ConnKind::Rpc if self.on_msg.is_none() => {
                Err(Error::InvalidArgument("RPC connections require on_msg"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("on_connection", &self.on_connection.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_msg", &self.on_msg.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

/// Snapshot of a connection's flags, for use inside callbacks.
#[derive(Debug, Clone)]
pub struct ConnStatus {
    pub is_socket: bool,
    pub unix_socket: Option<PathBuf>,
    pub is_listen: bool,
    pub read_eof: bool,
    pub is_connected: bool,
}

/// `on_connection` progress; it must run exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnConnState {
    Pending,
    Queued,
    Done,
}

/// Internal per-fd connection state. Guarded by the primary mutex.
pub(crate) struct Connection {
    pub(crate) gen: u64,
    pub(crate) name: String,
    pub(crate) kind: ConnKind,
    pub(crate) events: Events,

    pub(crate) input_fd: RawFd,
    pub(crate) output_fd: RawFd,
    pub(crate) polling_input: PollSide,
    pub(crate) polling_output: PollSide,

    pub(crate) is_socket: bool,
    pub(crate) is_listen: bool,
    pub(crate) is_connected: bool,
    pub(crate) read_eof: bool,
    pub(crate) can_read: bool,
    pub(crate) can_write: bool,
    pub(crate) work_active: bool,

    // duplicate-work suppression and delivery backpressure
    pub(crate) read_queued: bool,
    pub(crate) write_queued: bool,
    pub(crate) delivery_stalled: bool,
    pub(crate) on_conn: OnConnState,

    pub(crate) in_buf: InputBuffer,
    pub(crate) out_queue: VecDeque<Bytes>,
    pub(crate) work_queue: VecDeque<Work>,
    pub(crate) write_complete: Vec<WorkFunc>,

    pub(crate) address: ConnAddress,
    pub(crate) unix_socket_path: Option<PathBuf>,
    pub(crate) listen_arg: Option<ListenArg>,
    pub(crate) arg: Option<ConArg>,
}

impl Connection {
    /// Reconcile registered polling interest with `kind`, splitting it
    /// across the input/output sides per the mapping rules.
    pub(crate) fn set_polling(&mut self, idx: usize, ctl: &PollCtl, kind: PollKind) {
        let has_in = self.input_fd >= 0;
        let has_out = self.output_fd >= 0;
        if !has_in && !has_out {
            return;
        }
        let same = self.input_fd == self.output_fd;
        let (in_kind, out_kind) = map_sides(kind, same);

        if same {
            ctl.set_side(
                self.input_fd,
                token_for(idx, false),
                &mut self.polling_input,
                in_kind,
                &self.name,
            );
            return;
        }
        if has_in {
            ctl.set_side(
                self.input_fd,
                token_for(idx, false),
                &mut self.polling_input,
                in_kind,
                &self.name,
            );
        }
        if has_out {
            ctl.set_side(
                self.output_fd,
                token_for(idx, true),
                &mut self.polling_output,
                out_kind,
                &self.name,
            );
        }
    }

    pub(crate) fn status(&self) -> ConnStatus {
        ConnStatus {
            is_socket: self.is_socket,
            unix_socket: self.unix_socket_path.clone(),
            is_listen: self.is_listen,
            read_eof: self.read_eof,
            is_connected: self.is_connected,
        }
    }
}

/// Caller-facing connection handle.
///
/// Cheap to clone; every operation locks the manager. The handle stays valid
/// until `on_finish` returns, after which operations fail with
/// [`Error::ConnectionError`].
#[derive(Clone)]
pub struct Conn {
    pub(crate) shared: Arc<Shared>,
    pub(crate) idx: usize,
    pub(crate) gen: u64,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn").field("idx", &self.idx).finish()
    }
}

fn gone() -> Error {
    Error::ConnectionError("connection is gone".to_string())
}

impl Conn {
    /// Stable connection name, derived from the peer address or fd path.
    pub fn name(&self) -> Result<String> {
        let st = self.shared.state.lock();
        let con = st.reg.get_checked(self.idx, self.gen).ok_or_else(gone)?;
        Ok(con.name.clone())
    }

    /// Flag snapshot. Only meaningful from within a running callback.
    pub fn status(&self) -> Result<ConnStatus> {
        let st = self.shared.state.lock();
        let con = st.reg.get_checked(self.idx, self.gen).ok_or_else(gone)?;
        debug_assert!(con.work_active, "status() outside a running callback");
        Ok(con.status())
    }

    /// Peer credentials of a local-domain socket (`SO_PEERCRED`).
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn auth_creds(&self) -> Result<(u32, u32, i32)> {
        let fd = {
            let st = self.shared.state.lock();
            let con = st.reg.get_checked(self.idx, self.gen).ok_or_else(gone)?;
            if con.input_fd >= 0 {
                con.input_fd
            } else if con.output_fd >= 0 {
                con.output_fd
            } else {
                return Err(gone());
            }
        };
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let creds =
            nix::sys::socket::getsockopt(&borrowed, nix::sys::socket::sockopt::PeerCredentials)
                .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        Ok((creds.uid(), creds.gid(), creds.pid()))
    }

    /// Peer credentials are unavailable on this platform.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn auth_creds(&self) -> Result<(u32, u32, i32)> {
        Err(Error::NotSupported)
    }

    /// Switch between RAW and RPC delivery. Buffered input is preserved and
    /// handed to the new callback.
    pub fn change_kind(&self, kind: ConnKind) -> Result<()> {
        let mut st = self.shared.state.lock();
        let con = st
            .reg
            .get_checked_mut(self.idx, self.gen)
            .ok_or_else(gone)?;
        con.events.validate(kind, con.is_listen)?;
        if con.kind == kind {
            tracing::debug!(conn = %con.name, %kind, "ignoring unchanged kind");
            return Ok(());
        }
        tracing::debug!(
            conn = %con.name,
            from = %con.kind,
            to = %kind,
            pending_reads = con.in_buf.unread(),
            pending_writes = con.out_queue.len(),
            "changing kind"
        );
        con.kind = kind;
        con.delivery_stalled = false;
        drop(st);
        self.shared.kick();
        Ok(())
    }

    /// Append bytes to the output queue. They drain before any close takes
    /// effect.
    pub fn queue_write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let mut st = self.shared.state.lock();
        let con = st
            .reg
            .get_checked_mut(self.idx, self.gen)
            .ok_or_else(gone)?;
        if con.output_fd < 0 {
            return Err(Error::ConnectionError(format!(
                "{}: output is closed",
                con.name
            )));
        }
        if !data.is_empty() {
            con.out_queue.push_back(data);
        }
        drop(st);
        self.shared.kick();
        Ok(())
    }

    /// Request close: input stops, output drains, then the connection
    /// finishes. Idempotent; a no-op once the connection is gone.
    pub fn queue_close(&self) {
        let mut st = self.shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(self.idx, self.gen) else {
            return;
        };
        if con.work_active {
            // closing would mutate state the running callback relies on;
            // run it after the current work drains
            con.work_queue.push_back(Work::close(self.idx, self.gen));
        } else {
            close_con(&self.shared, &mut st, self.idx);
        }
        drop(st);
        self.shared.kick();
    }

    /// Copy of the unconsumed input, leaving the cursor in place.
    pub fn peek_input(&self) -> Result<Vec<u8>> {
        let st = self.shared.state.lock();
        let con = st.reg.get_checked(self.idx, self.gen).ok_or_else(gone)?;
        Ok(con.in_buf.peek().to_vec())
    }

    /// Bytes buffered and not yet consumed.
    pub fn input_len(&self) -> Result<usize> {
        let st = self.shared.state.lock();
        let con = st.reg.get_checked(self.idx, self.gen).ok_or_else(gone)?;
        Ok(con.in_buf.unread())
    }

    /// Take all unconsumed input.
    pub fn take_input(&self) -> Result<BytesMut> {
        let mut st = self.shared.state.lock();
        let con = st
            .reg
            .get_checked_mut(self.idx, self.gen)
            .ok_or_else(gone)?;
        let data = con.in_buf.take();
        drop(st);
        if !data.is_empty() {
            self.shared.kick();
        }
        Ok(data)
    }

    /// Consume exactly `n` bytes of input.
    pub fn consume_input(&self, n: usize) -> Result<BytesMut> {
        let mut st = self.shared.state.lock();
        let con = st
            .reg
            .get_checked_mut(self.idx, self.gen)
            .ok_or_else(gone)?;
        if con.in_buf.unread() < n {
            return Err(Error::InvalidArgument("not enough buffered input"));
        }
        let data = con.in_buf.consume(n);
        drop(st);
        self.shared.kick();
        Ok(data)
    }

    /// Queue a user callback against this connection's FIFO.
    pub fn queue_work(
        &self,
        f: impl FnOnce(Option<&Conn>, WorkStatus) + Send + 'static,
    ) -> Result<()> {
        let mut st = self.shared.state.lock();
        let con = st
            .reg
            .get_checked_mut(self.idx, self.gen)
            .ok_or_else(gone)?;
        con.work_queue
            .push_back(Work::call(Some((self.idx, self.gen)), Box::new(f)));
        drop(st);
        self.shared.kick();
        Ok(())
    }

    /// Queue a callback that runs once the output queue drains.
    pub fn queue_write_complete_work(
        &self,
        f: impl FnOnce(Option<&Conn>, WorkStatus) + Send + 'static,
    ) -> Result<()> {
        let mut st = self.shared.state.lock();
        let con = st
            .reg
            .get_checked_mut(self.idx, self.gen)
            .ok_or_else(gone)?;
        con.write_complete.push(Box::new(f));
        drop(st);
        self.shared.kick();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_events() -> Events {
        Events::new()
            .on_connection(|_c, _a| Some(Box::new(()) as ConArg))
            .on_data(|_c, _a| Ok(()))
            .on_msg(|_c, _m, _a| Ok(()))
    }

    #[test]
    fn test_events_validation() {
        let full = dummy_events();
        assert!(full.validate(ConnKind::Raw, false).is_ok());
        assert!(full.validate(ConnKind::Rpc, false).is_ok());

        let raw_only = Events::new()
            .on_connection(|_c, _a| Some(Box::new(()) as ConArg))
            .on_data(|_c, _a| Ok(()));
        assert!(raw_only.validate(ConnKind::Raw, false).is_ok());
        assert!(raw_only.validate(ConnKind::Rpc, false).is_err());

        let no_connection = Events::new().on_data(|_c, _a| Ok(()));
        assert!(no_connection.validate(ConnKind::Raw, false).is_err());
        // listeners do not run on_connection themselves
        assert!(no_connection.validate(ConnKind::Raw, true).is_ok());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ConnKind::Raw.to_string(), "RAW");
        assert_eq!(ConnKind::Rpc.to_string(), "RPC");
    }
}
