//! The watch loop: the single orchestrator thread.
//!
//! Each iteration finalizes finished connections, reconciles every
//! connection's polling interest with its state, blocks in `poll`, and
//! converts readiness into per-connection state and runnable work. The loop
//! only ever blocks inside `poll`; every mutator interrupts it through the
//! waker.

use std::sync::Arc;

use mio::event::Event;
use mio::{Events, Poll};
use nix::errno::Errno;
use nix::sys::socket::{accept4, SockFlag};
use tracing::{debug, error, trace, warn};

use crate::address::{self, ConnAddress};
use crate::conn::{Connection, OnConnState};
use crate::fd;
use crate::mgr::{
    close_all, close_con, close_on_poll_error, insert_connection, AddConnection, Shared, State,
};
use crate::poll::{poll_wait, token_target, PollKind, WAKER_TOKEN};
use crate::work::{self, Work, WorkStatus};

pub(crate) fn watch_loop(shared: Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(256);
    trace!("watch loop started");
    loop {
        if control_tick(&shared) {
            break;
        }
        reconcile(&shared);

        if let Err(e) = poll_wait(&mut poll, &mut events, None) {
            // not recoverable; matches the original's fatal() discipline
            error!(error = %e, "poll failed");
            std::process::abort();
        }

        let mut st = shared.state.lock();
        for ev in events.iter() {
            if ev.token() == WAKER_TOKEN {
                continue;
            }
            handle_event(&shared, &mut st, ev);
        }
        drop(st);
    }
    trace!("watch loop exited");
}

/// Finalize completions and drive shutdown. Returns true when the manager
/// has fully drained.
fn control_tick(shared: &Arc<Shared>) -> bool {
    loop {
        let ready: Vec<usize> = {
            let mut st = shared.state.lock();
            if st.shutdown_requested {
                close_all(shared, &mut st);
            }

            for idx in st.reg.live_ids() {
                let eligible = st.reg.get(idx).map(finalize_eligible).unwrap_or(false);
                if eligible {
                    let needs_close = st
                        .reg
                        .get(idx)
                        .map(|c| !c.is_listen && c.input_fd >= 0)
                        .unwrap_or(false);
                    if needs_close {
                        close_con(shared, &mut st, idx);
                    }
                    st.reg.move_to_complete(idx);
                }
            }

            if st.reg.complete.is_empty() {
                if st.shutdown_requested && st.reg.is_empty() {
                    let leftovers: Vec<Work> = st.run_queue.drain(..).collect();
                    st.quit_workers = true;
                    st.drained = true;
                    drop(st);
                    shared.worker_sleep.notify_all();
                    shared.watch_sleep.notify_all();
                    for w in leftovers {
                        work::execute(shared, w, WorkStatus::Cancelled);
                    }
                    return true;
                }
                return false;
            }
            st.reg.complete.clone()
        };

        for idx in ready {
            finalize_one(shared, idx);
        }
    }
}

/// A connection is done once input ended, both buffers drained (or the
/// remaining input cannot be delivered), and no work is pending.
fn finalize_eligible(con: &Connection) -> bool {
    if con.is_listen {
        return con.input_fd < 0;
    }
    con.read_eof
        && con.out_queue.is_empty()
        && (con.in_buf.unread() == 0 || con.delivery_stalled)
        && con.work_queue.is_empty()
        && !con.work_active
        && con.on_conn != OnConnState::Queued
}

/// Run `on_finish`, close the output side, and free the slot.
fn finalize_one(shared: &Arc<Shared>, idx: usize) {
    let (handle, arg, on_finish, is_listen, name) = {
        let mut st = shared.state.lock();
        let Some(con) = st.reg.get_mut(idx) else {
            return;
        };
        // block workers and mark callbacks as running for status()
        con.work_active = true;
        let gen = con.gen;
        (
            crate::conn::Conn {
                shared: shared.clone(),
                idx,
                gen,
            },
            con.arg.take(),
            con.events.on_finish.clone(),
            con.is_listen,
            con.name.clone(),
        )
    };

    trace!(conn = %name, "finalizing");
    if !is_listen {
        if let Some(f) = on_finish {
            f(&handle, arg);
        }
    }

    let mut st = shared.state.lock();
    let Some(mut con) = st.reg.remove(idx) else {
        return;
    };
    drop(st);

    if con.input_fd >= 0 {
        fd::close_fd(con.input_fd);
    }
    if con.output_fd >= 0 && con.output_fd != con.input_fd {
        fd::close_fd(con.output_fd);
    }

    // anything queued during on_finish can never run
    let leftover: Vec<Work> = con.work_queue.drain(..).collect();
    let completions: Vec<_> = con.write_complete.drain(..).collect();
    drop(con);
    for w in leftover {
        work::execute(shared, w, WorkStatus::Cancelled);
    }
    for f in completions {
        f(None, WorkStatus::Cancelled);
    }

    shared.kick();
}

fn output_unsupported(con: &Connection) -> bool {
    if con.input_fd >= 0 && con.input_fd == con.output_fd {
        con.polling_input.unsupported
    } else {
        con.polling_output.unsupported
    }
}

/// Pick the polling interest a connection wants right now.
fn desired_kind(con: &Connection, shutdown: bool) -> PollKind {
    if con.is_listen {
        return if con.input_fd >= 0 && !shutdown {
            PollKind::Listen
        } else {
            PollKind::None
        };
    }
    if con.input_fd < 0 && con.output_fd < 0 {
        return PollKind::None;
    }
    if !con.is_connected {
        // a closed connection gives up on its pending connect
        return if con.read_eof {
            PollKind::None
        } else {
            PollKind::Connected
        };
    }
    if con.on_conn != OnConnState::Done {
        return PollKind::None;
    }

    let read = !con.read_eof
        && con.input_fd >= 0
        && !con.can_read
        && !con.in_buf.is_full()
        && !con.polling_input.unsupported;
    let write = !con.out_queue.is_empty()
        && con.output_fd >= 0
        && !con.can_write
        && !output_unsupported(con);

    match (read, write) {
        (true, true) => PollKind::ReadWrite,
        (true, false) => PollKind::ReadOnly,
        (false, true) => PollKind::WriteOnly,
        (false, false) => PollKind::None,
    }
}

/// Queue work implied by the connection's current state.
fn schedule_con_work(con: &mut Connection, idx: usize) {
    if con.is_listen {
        return;
    }

    if con.is_connected && con.on_conn == OnConnState::Pending && !con.read_eof {
        con.on_conn = OnConnState::Queued;
        con.work_queue.push_back(Work::on_connection(idx, con.gen));
    }
    if con.on_conn != OnConnState::Done {
        return;
    }

    let wants_read = (con.can_read && !con.read_eof && !con.in_buf.is_full())
        || (con.in_buf.unread() > 0 && !con.delivery_stalled);
    if wants_read && !con.read_queued {
        con.read_queued = true;
        con.work_queue.push_back(Work::read(idx, con.gen));
    }

    let wants_write = (con.can_write && !con.out_queue.is_empty())
        || (con.out_queue.is_empty() && !con.write_complete.is_empty());
    if wants_write && !con.write_queued {
        con.write_queued = true;
        con.work_queue.push_back(Work::write(idx, con.gen));
    }
}

/// Bring polling interest in line with every connection's state and wake
/// workers if anything became runnable.
fn reconcile(shared: &Arc<Shared>) {
    let mut st = shared.state.lock();
    let shutdown = st.shutdown_requested;
    let mut runnable = !st.run_queue.is_empty();

    for idx in st.reg.live_ids() {
        let Some(con) = st.reg.get_mut(idx) else {
            continue;
        };

        // unpollable fds count as permanently ready
        if con.polling_input.unsupported
            && !con.read_eof
            && con.input_fd >= 0
            && !con.in_buf.is_full()
        {
            con.can_read = true;
        }
        if output_unsupported(con) && con.output_fd >= 0 && !con.out_queue.is_empty() {
            con.can_write = true;
        }

        let desired = desired_kind(con, shutdown);
        con.set_polling(idx, &shared.pollctl, desired);
        schedule_con_work(con, idx);

        if !con.work_active && !con.work_queue.is_empty() {
            runnable = true;
        }
    }
    drop(st);

    if runnable {
        shared.worker_sleep.notify_all();
    }
}

enum Action {
    Nothing,
    PollError,
    Accept,
    CompleteConnect,
}

/// Convert one readiness event into connection state or work.
fn handle_event(shared: &Arc<Shared>, st: &mut State, ev: &Event) {
    let (idx, _output_side) = token_target(ev.token());

    let action = {
        let Some(con) = st.reg.get_mut(idx) else {
            return;
        };
        if con.is_listen {
            if ev.is_error() {
                Action::PollError
            } else {
                Action::Accept
            }
        } else if !con.is_connected {
            if con.input_fd < 0 && con.output_fd < 0 {
                Action::Nothing
            } else {
                Action::CompleteConnect
            }
        } else if ev.is_error() {
            Action::PollError
        } else {
            if ev.is_readable() || ev.is_read_closed() {
                con.can_read = true;
            }
            if ev.is_writable() {
                con.can_write = true;
            }
            Action::Nothing
        }
    };

    match action {
        Action::Nothing => {}
        Action::PollError => close_on_poll_error(shared, st, idx),
        Action::Accept => accept_ready(shared, st, idx),
        Action::CompleteConnect => complete_connect(shared, st, idx),
    }
}

/// Resolve a pending non-blocking connect via SO_ERROR.
fn complete_connect(shared: &Arc<Shared>, st: &mut State, idx: usize) {
    {
        let Some(con) = st.reg.get_mut(idx) else {
            return;
        };
        let fd = if con.input_fd >= 0 {
            con.input_fd
        } else {
            con.output_fd
        };
        if fd < 0 {
            return;
        }
        if !con.is_socket {
            con.is_connected = true;
            return;
        }
        match fd::socket_error(fd) {
            Ok(None) => {
                con.is_connected = true;
                debug!(conn = %con.name, "connected");
                return;
            }
            Ok(Some(err)) => {
                error!(conn = %con.name, error = %err, "connect failed");
            }
            Err(e) => {
                error!(conn = %con.name, error = %e, "unable to read connect status");
            }
        }
    }
    close_con(shared, st, idx);
}

/// Accept until the listener would block; each accepted socket becomes a
/// connection inheriting the listener's kind, events, and argument.
fn accept_ready(shared: &Arc<Shared>, st: &mut State, idx: usize) {
    loop {
        let (listen_fd, kind, events, listen_arg, inherited) = {
            let Some(con) = st.reg.get(idx) else {
                return;
            };
            if con.input_fd < 0 {
                return;
            }
            (
                con.input_fd,
                con.kind,
                con.events.clone(),
                con.listen_arg.clone(),
                con.unix_socket_path.clone(),
            )
        };

        match accept4(listen_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => {
                let address = address::peer_address(fd).unwrap_or(ConnAddress::None);
                let accepted = AddConnection {
                    kind,
                    input_fd: fd,
                    output_fd: fd,
                    events,
                    address,
                    is_listen: false,
                    unix_socket_path: None,
                    connected: true,
                    listen_arg,
                    inherited_unix_path: inherited,
                };
                match insert_connection(shared, st, accepted) {
                    Ok(new_idx) => {
                        trace!(conn_idx = new_idx, "accepted connection");
                    }
                    Err(e) => {
                        warn!(error = %e, "unable to register accepted connection");
                        fd::close_fd(fd);
                    }
                }
            }
            Err(Errno::EAGAIN) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}
