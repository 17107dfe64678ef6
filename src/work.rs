//! Work items and their execution.
//!
//! Work is either bound to a connection (run strictly FIFO, never two items
//! of the same connection concurrently) or unattached (signal dispatch,
//! caller-queued). Every queued item is eventually delivered exactly once,
//! with status [`WorkStatus::Run`] or, at shutdown, [`WorkStatus::Cancelled`]
//! so callbacks can release whatever they carry.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::conn::{ConArg, Conn, ConnKind, Events, ListenArg, OnConnState};
use crate::error::Result;
use crate::fd::{self, IoStep};
use crate::mgr::{close_con, Shared};

/// Delivery status handed to every callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Normal execution.
    Run,
    /// Shutdown reached the item before it ran; release resources and
    /// return.
    Cancelled,
}

/// Boxed caller-supplied work callback.
pub(crate) type WorkFunc = Box<dyn FnOnce(Option<&Conn>, WorkStatus) + Send>;

pub(crate) enum WorkKind {
    /// Run `on_connection` exactly once.
    OnConnection,
    /// Drain readable bytes and deliver them to `on_data`/`on_msg`.
    Read,
    /// Drain the output queue; deliver write-complete callbacks when empty.
    Write,
    /// Pass an fd to the peer, then close the local copy.
    SendFd(RawFd),
    /// Receive one fd and adopt it as a new connection.
    RecvFd {
        kind: ConnKind,
        events: Events,
        arg: Option<ListenArg>,
    },
    /// Deferred close, run once preceding work drains.
    Close,
    /// Caller-supplied callback.
    Call(WorkFunc),
}

pub(crate) struct Work {
    pub(crate) con: Option<(usize, u64)>,
    pub(crate) kind: WorkKind,
}

impl Work {
    pub(crate) fn on_connection(idx: usize, gen: u64) -> Self {
        Work {
            con: Some((idx, gen)),
            kind: WorkKind::OnConnection,
        }
    }

    pub(crate) fn read(idx: usize, gen: u64) -> Self {
        Work {
            con: Some((idx, gen)),
            kind: WorkKind::Read,
        }
    }

    pub(crate) fn write(idx: usize, gen: u64) -> Self {
        Work {
            con: Some((idx, gen)),
            kind: WorkKind::Write,
        }
    }

    pub(crate) fn close(idx: usize, gen: u64) -> Self {
        Work {
            con: Some((idx, gen)),
            kind: WorkKind::Close,
        }
    }

    pub(crate) fn send_fd(idx: usize, gen: u64, fd: RawFd) -> Self {
        Work {
            con: Some((idx, gen)),
            kind: WorkKind::SendFd(fd),
        }
    }

    pub(crate) fn recv_fd(
        idx: usize,
        gen: u64,
        kind: ConnKind,
        events: Events,
        arg: Option<ListenArg>,
    ) -> Self {
        Work {
            con: Some((idx, gen)),
            kind: WorkKind::RecvFd { kind, events, arg },
        }
    }

    pub(crate) fn call(con: Option<(usize, u64)>, f: WorkFunc) -> Self {
        Work {
            con,
            kind: WorkKind::Call(f),
        }
    }
}

/// Run one work item. The caller holds no locks; `work_active` is already
/// set for connection-bound items.
pub(crate) fn execute(shared: &Arc<Shared>, work: Work, status: WorkStatus) {
    match work.kind {
        WorkKind::OnConnection => {
            let (idx, gen) = work.con.expect("on_connection is connection-bound");
            on_connection_work(shared, idx, gen, status);
        }
        WorkKind::Read => {
            let (idx, gen) = work.con.expect("read is connection-bound");
            read_work(shared, idx, gen, status);
        }
        WorkKind::Write => {
            let (idx, gen) = work.con.expect("write is connection-bound");
            write_work(shared, idx, gen, status);
        }
        WorkKind::SendFd(fd) => {
            let (idx, gen) = work.con.expect("send_fd is connection-bound");
            crate::fdpass::send_fd_work(shared, idx, gen, fd, status);
        }
        WorkKind::RecvFd { kind, events, arg } => {
            let (idx, gen) = work.con.expect("recv_fd is connection-bound");
            crate::fdpass::recv_fd_work(shared, idx, gen, kind, events, arg, status);
        }
        WorkKind::Close => {
            let (idx, gen) = work.con.expect("close is connection-bound");
            let mut st = shared.state.lock();
            if st.reg.get_checked(idx, gen).is_some() {
                close_con(shared, &mut st, idx);
            }
            drop(st);
            shared.kick();
        }
        WorkKind::Call(f) => {
            let handle = work.con.map(|(idx, gen)| Conn {
                shared: shared.clone(),
                idx,
                gen,
            });
            f(handle.as_ref(), status);
        }
    }
}

/// Run `on_connection`; `None` from the callback closes the connection.
fn on_connection_work(shared: &Arc<Shared>, idx: usize, gen: u64, status: WorkStatus) {
    let (cb, new_arg, name) = {
        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        if status == WorkStatus::Cancelled || con.read_eof {
            con.on_conn = OnConnState::Done;
            return;
        }
        let Some(cb) = con.events.on_connection.clone() else {
            con.on_conn = OnConnState::Done;
            return;
        };
        (cb, con.listen_arg.clone(), con.name.clone())
    };

    trace!(conn = %name, "on_connection begin");
    let handle = Conn {
        shared: shared.clone(),
        idx,
        gen,
    };
    let result = cb(&handle, new_arg);

    let mut st = shared.state.lock();
    let Some(con) = st.reg.get_checked_mut(idx, gen) else {
        return;
    };
    con.on_conn = OnConnState::Done;
    match result {
        Some(arg) => con.arg = Some(arg),
        None => {
            error!(conn = %con.name, "closing connection: on_connection returned nothing");
            close_con(shared, &mut st, idx);
        }
    }
    drop(st);
    shared.kick();
}

/// Read until the fd would block (or the buffer fills), then deliver.
fn read_work(shared: &Arc<Shared>, idx: usize, gen: u64, status: WorkStatus) {
    {
        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        con.read_queued = false;
        if status == WorkStatus::Cancelled {
            return;
        }
    }

    loop {
        let (fd, chunk) = {
            let st = shared.state.lock();
            let Some(con) = st.reg.get_checked(idx, gen) else {
                return;
            };
            if !con.can_read || con.read_eof || con.in_buf.is_full() || con.input_fd < 0 {
                break;
            }
            (con.input_fd, con.in_buf.read_chunk())
        };

        let mut tmp = vec![0u8; chunk];
        let step = fd::read_fd(fd, &mut tmp);

        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        match step {
            IoStep::Done(n) => {
                con.in_buf.append(&tmp[..n]);
                con.delivery_stalled = false;
                if n < chunk {
                    con.can_read = false;
                }
            }
            IoStep::Eof => {
                trace!(conn = %con.name, "end of input");
                con.read_eof = true;
                con.can_read = false;
            }
            IoStep::WouldBlock => con.can_read = false,
            IoStep::Failed(e) => {
                warn!(conn = %con.name, error = %e, "read failed");
                con.read_eof = true;
                con.can_read = false;
            }
        }
    }

    deliver(shared, idx, gen);
    shared.kick();
}

enum Delivery {
    Raw(Arc<crate::conn::OnDataFn>, ConArg, usize),
    Rpc(Arc<crate::conn::OnMsgFn>, bytes::BytesMut, ConArg),
}

/// Hand buffered input to the connection's callback: RAW gets one `on_data`
/// call per work item, RPC gets one `on_msg` per complete frame.
fn deliver(shared: &Arc<Shared>, idx: usize, gen: u64) {
    loop {
        let step = {
            let mut st = shared.state.lock();
            let Some(con) = st.reg.get_checked_mut(idx, gen) else {
                return;
            };
            if con.on_conn != OnConnState::Done
                || con.delivery_stalled
                || con.in_buf.unread() == 0
                || con.arg.is_none()
            {
                return;
            }
            match con.kind {
                ConnKind::Raw => {
                    let Some(cb) = con.events.on_data.clone() else {
                        return;
                    };
                    let before = con.in_buf.unread();
                    let arg = con.arg.take().expect("checked above");
                    Delivery::Raw(cb, arg, before)
                }
                ConnKind::Rpc => {
                    let Some(cb) = con.events.on_msg.clone() else {
                        return;
                    };
                    let Some(frame) = con.in_buf.next_frame() else {
                        // a partial frame can never complete after EOF
                        if con.read_eof {
                            con.delivery_stalled = true;
                        }
                        return;
                    };
                    let arg = con.arg.take().expect("checked above");
                    Delivery::Rpc(cb, frame, arg)
                }
            }
        };

        let handle = Conn {
            shared: shared.clone(),
            idx,
            gen,
        };

        let (result, raw_watermark, arg): (Result<()>, Option<usize>, ConArg) = match step {
            Delivery::Raw(cb, mut arg, before) => {
                let rc = cb(&handle, &mut arg);
                (rc, Some(before), arg)
            }
            Delivery::Rpc(cb, frame, mut arg) => {
                let rc = cb(&handle, frame, &mut arg);
                (rc, None, arg)
            }
        };

        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        con.arg = Some(arg);
        let failed = result.is_err();
        if let Some(before) = raw_watermark {
            // a callback that consumed nothing is stalled until new input
            // (or a kind switch) arrives
            if con.kind == ConnKind::Raw && con.in_buf.unread() >= before {
                con.delivery_stalled = true;
            }
        }
        if let Err(e) = result {
            error!(conn = %con.name, error = %e, "data callback failed; closing connection");
        }
        if failed {
            close_con(shared, &mut st, idx);
            return;
        }
        if raw_watermark.is_some() {
            // RAW delivers once per work item
            return;
        }
        // RPC loops while complete frames remain
    }
}

/// Drain the output queue; once empty, run write-complete callbacks.
fn write_work(shared: &Arc<Shared>, idx: usize, gen: u64, status: WorkStatus) {
    {
        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        con.write_queued = false;
        if status == WorkStatus::Cancelled {
            return;
        }
    }

    loop {
        let (fd, front) = {
            let mut st = shared.state.lock();
            let Some(con) = st.reg.get_checked_mut(idx, gen) else {
                return;
            };
            if con.output_fd < 0 {
                // nothing can drain these bytes any more
                con.out_queue.clear();
                break;
            }
            let Some(front) = con.out_queue.front() else {
                break;
            };
            (con.output_fd, front.clone())
        };

        let step = fd::write_fd(fd, &front);

        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        match step {
            IoStep::Done(n) => {
                if let Some(head) = con.out_queue.front_mut() {
                    bytes::Buf::advance(head, n.min(head.len()));
                    if head.is_empty() {
                        con.out_queue.pop_front();
                    }
                }
                if n < front.len() {
                    // kernel buffer is full; wait for writability
                    con.can_write = false;
                    break;
                }
            }
            IoStep::WouldBlock => {
                con.can_write = false;
                break;
            }
            IoStep::Eof => {
                con.out_queue.clear();
                con.can_write = false;
                close_con(shared, &mut st, idx);
                break;
            }
            IoStep::Failed(e) => {
                warn!(conn = %con.name, error = %e, "write failed; closing connection");
                con.out_queue.clear();
                con.can_write = false;
                close_con(shared, &mut st, idx);
                break;
            }
        }
    }

    let pending = {
        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(idx, gen) else {
            return;
        };
        if con.out_queue.is_empty() && !con.write_complete.is_empty() {
            std::mem::take(&mut con.write_complete)
        } else {
            Vec::new()
        }
    };
    if !pending.is_empty() {
        let handle = Conn {
            shared: shared.clone(),
            idx,
            gen,
        };
        for f in pending {
            f(Some(&handle), WorkStatus::Run);
        }
    }

    shared.kick();
}
