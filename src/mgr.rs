//! The connection manager: shared state, lifecycle, and the close
//! coordinator.
//!
//! One primary mutex guards the registry and all per-connection mutable
//! state. It is never held across a user callback. [`Manager::init`] spawns
//! the watch thread and the worker pool; teardown is an explicit shutdown
//! request that closes every connection, drains output, and delivers
//! leftover work as cancelled.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::address::{self, ConnAddress};
use crate::buffer::InputBuffer;
use crate::config::Config;
use crate::conn::{Conn, ConnKind, Connection, Events, ListenArg, OnConnState};
use crate::error::{Error, Result};
use crate::fd;
use crate::poll::{PollCtl, PollKind, PollSide};
use crate::registry::Registry;
use crate::work::{Work, WorkStatus};

/// State guarded by the primary mutex.
pub(crate) struct State {
    pub(crate) reg: Registry,
    /// Unattached runnable work (signal dispatch, caller-queued).
    pub(crate) run_queue: VecDeque<Work>,
    pub(crate) next_gen: u64,
    pub(crate) shutdown_requested: bool,
    pub(crate) quit_workers: bool,
    /// The watch loop exited with an empty registry.
    pub(crate) drained: bool,
}

/// State shared by the watch thread, workers, and caller threads.
pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    /// Signaled on every state change the watch loop (or a joiner) may care
    /// about.
    pub(crate) watch_sleep: Condvar,
    /// Workers park here while no work is runnable.
    pub(crate) worker_sleep: Condvar,
    pub(crate) pollctl: PollCtl,
    pub(crate) config: Config,
}

impl Shared {
    /// Wake everything that might have something new to look at.
    pub(crate) fn kick(&self) {
        self.pollctl.interrupt();
        self.watch_sleep.notify_all();
        self.worker_sleep.notify_all();
    }
}

/// Parameters for adopting an fd pair as a connection.
pub(crate) struct AddConnection {
    pub(crate) kind: ConnKind,
    pub(crate) input_fd: RawFd,
    pub(crate) output_fd: RawFd,
    pub(crate) events: Events,
    pub(crate) address: ConnAddress,
    pub(crate) is_listen: bool,
    pub(crate) unix_socket_path: Option<PathBuf>,
    /// Established already (accepted or adopted); dialer connections start
    /// false and complete through CONNECTED polling.
    pub(crate) connected: bool,
    pub(crate) listen_arg: Option<ListenArg>,
    /// Local-domain path inherited from the source connection (accept,
    /// received fd); suppresses keepalive, never unlinked by this
    /// connection.
    pub(crate) inherited_unix_path: Option<PathBuf>,
}

/// Validate, name, and register a connection. Caller holds the lock and
/// kicks afterwards. On error the fds stay owned by the caller.
pub(crate) fn insert_connection(
    shared: &Arc<Shared>,
    st: &mut State,
    p: AddConnection,
) -> Result<usize> {
    p.events.validate(p.kind, p.is_listen)?;

    let has_in = p.input_fd >= 0;
    let has_out = p.output_fd >= 0;
    let same = p.input_fd == p.output_fd;

    let in_stat = match has_in {
        true => Some(fd::stat_fd(p.input_fd).map_err(|e| {
            debug!(fd = p.input_fd, error = %e, "invalid input fd");
            Error::InvalidArgument("input fd is not open")
        })?),
        false => None,
    };
    let out_stat = match has_out {
        true => Some(fd::stat_fd(p.output_fd).map_err(|e| {
            debug!(fd = p.output_fd, error = %e, "invalid output fd");
            Error::InvalidArgument("output fd is not open")
        })?),
        false => None,
    };

    let is_socket = in_stat.as_ref().map(fd::is_socket).unwrap_or(false)
        || out_stat.as_ref().map(fd::is_socket).unwrap_or(false);

    let keep_alive = shared.config.keep_alive
        && is_socket
        && !p.is_listen
        && p.unix_socket_path.is_none()
        && p.inherited_unix_path.is_none();

    if has_in {
        if keep_alive {
            fd::set_keep_alive(p.input_fd);
        }
        fd::set_nonblocking(p.input_fd)?;
    }
    if has_out && !same {
        fd::set_nonblocking(p.output_fd)?;
        if keep_alive {
            fd::set_keep_alive(p.output_fd);
        }
    }

    let name = address::connection_name(
        p.input_fd,
        p.output_fd,
        in_stat.as_ref(),
        out_stat.as_ref(),
    );
    debug!(
        conn = %name,
        input_fd = p.input_fd,
        output_fd = p.output_fd,
        listen = p.is_listen,
        "new connection"
    );

    let gen = st.next_gen;
    st.next_gen += 1;

    let con = Connection {
        gen,
        name,
        kind: p.kind,
        events: p.events,
        input_fd: p.input_fd,
        output_fd: p.output_fd,
        polling_input: PollSide::default(),
        polling_output: PollSide::default(),
        is_socket,
        is_listen: p.is_listen,
        is_connected: p.connected,
        read_eof: !has_in,
        can_read: false,
        can_write: false,
        work_active: false,
        read_queued: false,
        write_queued: false,
        delivery_stalled: false,
        on_conn: if p.is_listen {
            OnConnState::Done
        } else {
            OnConnState::Pending
        },
        in_buf: InputBuffer::new(shared.config.buffer_start_size),
        out_queue: VecDeque::new(),
        work_queue: VecDeque::new(),
        write_complete: Vec::new(),
        address: p.address,
        unix_socket_path: p.unix_socket_path.or(p.inherited_unix_path),
        listen_arg: p.listen_arg,
        arg: None,
    };

    let idx = st.reg.insert(con);
    if st.shutdown_requested {
        close_con(shared, st, idx);
    }
    Ok(idx)
}

/// Locking wrapper around [`insert_connection`].
pub(crate) fn add_connection(shared: &Arc<Shared>, p: AddConnection) -> Result<()> {
    let mut st = shared.state.lock();
    if st.drained {
        return Err(Error::ConnectionError("manager is shut down".to_string()));
    }
    insert_connection(shared, &mut st, p)?;
    drop(st);
    shared.kick();
    Ok(())
}

/// The sole close path: stop reads, keep draining writes.
///
/// Idempotent. Unlinks a listener's local-domain path, drops polling
/// interest, flags EOF, resets the input cursor, and closes (or
/// half-shutdowns) the input side. Finalization happens later on the watch
/// loop once both queues drain and no work remains.
pub(crate) fn close_con(shared: &Shared, st: &mut State, idx: usize) {
    let Some(con) = st.reg.get_mut(idx) else {
        return;
    };
    if con.input_fd < 0 {
        trace!(conn = %con.name, "ignoring duplicate close request");
        return;
    }

    debug!(conn = %con.name, "closing input");

    if con.is_listen {
        if let Some(path) = con.unix_socket_path.clone() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        conn = %con.name,
                        path = %path.display(),
                        error = %e,
                        "unable to unlink socket path"
                    );
                }
            }
        }
    }

    // stop polling both sides; the watch loop re-selects what it needs
    con.set_polling(idx, &shared.pollctl, PollKind::None);

    con.read_eof = true;
    con.can_read = false;
    con.in_buf.reset();

    let input = con.input_fd;
    if con.is_listen {
        fd::close_fd(input);
        debug_assert!(con.output_fd < 0);
    } else if con.input_fd != con.output_fd {
        fd::close_fd(input);
    } else if con.is_socket {
        if let Err(e) = nix::sys::socket::shutdown(input, nix::sys::socket::Shutdown::Read) {
            trace!(conn = %con.name, error = %e, "unable to shutdown reads");
        }
    }

    con.input_fd = -1;
}

/// Close every live connection. Holds the lock; safe to repeat.
pub(crate) fn close_all(shared: &Shared, st: &mut State) {
    for idx in st.reg.live_ids() {
        close_con(shared, st, idx);
    }
}

/// Close a connection whose fd errored during polling, logging the socket
/// error if the kernel has one.
pub(crate) fn close_on_poll_error(shared: &Shared, st: &mut State, idx: usize) {
    let Some(con) = st.reg.get(idx) else {
        return;
    };
    if con.is_socket {
        let fd = if con.input_fd >= 0 {
            con.input_fd
        } else {
            con.output_fd
        };
        if fd >= 0 {
            match fd::socket_error(fd) {
                Ok(Some(err)) => {
                    error!(conn = %con.name, error = %err, "socket error while polling")
                }
                Ok(None) => {}
                Err(e) => error!(conn = %con.name, error = %e, "unable to read socket error"),
            }
        }
    }
    close_con(shared, st, idx);
}

/// Aggregate registry counts, mostly useful for tests and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    /// Connections in the active list (includes the internal signal
    /// bridge).
    pub active: usize,
    /// Registered listeners.
    pub listeners: usize,
}

/// Handle to a running connection manager.
///
/// Dropping the manager requests shutdown and joins the watch and worker
/// threads; shutdown drains every connection's output before the registry
/// empties.
pub struct Manager {
    pub(crate) shared: Arc<Shared>,
    watch: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Start a manager: one watch thread, a worker pool, and the signal
    /// bridge.
    pub fn init(config: Config) -> Result<Manager> {
        let (pollctl, poll) = PollCtl::new()?;
        let worker_count = config.effective_workers();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                reg: Registry::new(),
                run_queue: VecDeque::new(),
                next_gen: 1,
                shutdown_requested: false,
                quit_workers: false,
                drained: false,
            }),
            watch_sleep: Condvar::new(),
            worker_sleep: Condvar::new(),
            pollctl,
            config,
        });

        let watch = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("watch".to_string())
                .spawn(move || crate::watch::watch_loop(shared, poll))
                .map_err(Error::Io)?
        };

        let mut mgr = Manager {
            shared,
            watch: Some(watch),
            workers: Vec::with_capacity(worker_count),
        };

        for id in 0..worker_count {
            let shared = mgr.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || crate::workers::worker_loop(shared, id))
                .map_err(Error::Io)?;
            mgr.workers.push(handle);
        }

        crate::signals::start_bridge(&mgr.shared)?;

        info!(workers = worker_count, "connection manager started");
        Ok(mgr)
    }

    /// Adopt an already-open fd pair as a connection.
    pub fn process_fd(
        &self,
        kind: ConnKind,
        input_fd: RawFd,
        output_fd: RawFd,
        events: Events,
        address: ConnAddress,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        add_connection(
            &self.shared,
            AddConnection {
                kind,
                input_fd,
                output_fd,
                events,
                address,
                is_listen: false,
                unix_socket_path: None,
                connected: true,
                listen_arg: arg,
                inherited_unix_path: None,
            },
        )
    }

    /// Adopt an already-bound, already-listening fd.
    pub fn process_fd_listen(
        &self,
        kind: ConnKind,
        fd: RawFd,
        events: Events,
        address: ConnAddress,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        add_connection(
            &self.shared,
            AddConnection {
                kind,
                input_fd: fd,
                output_fd: -1,
                events,
                address,
                is_listen: true,
                unix_socket_path: None,
                connected: true,
                listen_arg: arg,
                inherited_unix_path: None,
            },
        )
    }

    /// Adopt a listening local-domain fd whose path this manager owns (and
    /// unlinks on close).
    pub fn process_fd_unix_listen(
        &self,
        kind: ConnKind,
        fd: RawFd,
        events: Events,
        path: impl Into<PathBuf>,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        let path = path.into();
        add_connection(
            &self.shared,
            AddConnection {
                kind,
                input_fd: fd,
                output_fd: -1,
                events,
                address: ConnAddress::Unix(path.clone()),
                is_listen: true,
                unix_socket_path: Some(path),
                connected: true,
                listen_arg: arg,
                inherited_unix_path: None,
            },
        )
    }

    /// Queue a callback, optionally bound to a connection's FIFO.
    pub fn queue_work(
        &self,
        con: Option<&Conn>,
        f: impl FnOnce(Option<&Conn>, WorkStatus) + Send + 'static,
    ) -> Result<()> {
        if let Some(con) = con {
            return con.queue_work(f);
        }
        let mut st = self.shared.state.lock();
        if st.drained {
            drop(st);
            f(None, WorkStatus::Cancelled);
            return Ok(());
        }
        st.run_queue.push_back(Work::call(None, Box::new(f)));
        drop(st);
        self.shared.kick();
        Ok(())
    }

    /// Run `f` each time `signo` is delivered to the process.
    pub fn add_signal_work(
        &self,
        signo: i32,
        f: impl Fn(WorkStatus) + Send + Sync + 'static,
    ) -> Result<()> {
        crate::signals::add_signal_work(signo, Arc::new(f))
    }

    /// Request close of a connection (see [`Conn::queue_close`]).
    pub fn queue_close(&self, con: &Conn) {
        con.queue_close();
    }

    /// Switch a connection between RAW and RPC delivery.
    pub fn change_mode(&self, con: &Conn, kind: ConnKind) -> Result<()> {
        con.change_kind(kind)
    }

    /// Queue sending `fd` to the peer of `con` (see [`Conn::queue_send_fd`]).
    pub fn queue_send_fd(&self, con: &Conn, fd: RawFd) -> Result<()> {
        con.queue_send_fd(fd)
    }

    /// Queue receiving an fd from the peer of `con` (see
    /// [`Conn::queue_receive_fd`]).
    pub fn queue_receive_fd(
        &self,
        con: &Conn,
        kind: ConnKind,
        events: Events,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        con.queue_receive_fd(kind, events, arg)
    }

    /// Registry counts.
    pub fn stats(&self) -> ManagerStats {
        let st = self.shared.state.lock();
        ManagerStats {
            active: st.reg.active_count(),
            listeners: st.reg.listen_count(),
        }
    }

    /// Flag shutdown: every connection closes (draining its output first)
    /// and the manager winds down.
    pub fn request_shutdown(&self) {
        request_shutdown(&self.shared);
    }

    /// A cloneable handle that can request shutdown from callbacks and
    /// signal work.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    /// Block until shutdown completes and the registry is empty.
    pub fn run(&self) {
        let mut st = self.shared.state.lock();
        while !st.drained {
            self.shared.watch_sleep.wait(&mut st);
        }
    }

    /// Shut down and join all threads.
    pub fn shutdown(self) {
        // Drop does the work
    }
}

fn request_shutdown(shared: &Shared) {
    let mut st = shared.state.lock();
    if !st.shutdown_requested {
        debug!("shutdown requested");
        st.shutdown_requested = true;
    }
    drop(st);
    shared.kick();
}

/// Requests manager shutdown; safe to invoke from any thread or callback.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        request_shutdown(&self.shared);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.request_shutdown();
        if let Some(watch) = self.watch.take() {
            let _ = watch.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        trace!("connection manager stopped");
    }
}
