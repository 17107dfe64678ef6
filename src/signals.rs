//! Signal bridge: UNIX signals funneled into the work queue via a
//! self-pipe.
//!
//! The OS-level handler is restricted to async-signal-safe operations: it
//! loads the pipe's write fd from an atomic and `write(2)`s the signal
//! number. The read end is an internal RAW connection whose `on_data` drains
//! `c_int`s and dispatches matching registered work items as unattached
//! work, so signal handling serializes with ordinary I/O.
//!
//! Handler dispositions survive `fork(2)` but the manager's threads do not;
//! an at-fork hook resets the bridge in the child so inherited handlers
//! become no-ops.

use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::conn::{ConArg, ConnKind, Events};
use crate::error::{Error, Result};
use crate::fd;
use crate::mgr::{add_connection, AddConnection, Shared};
use crate::work::{Work, WorkStatus};

/// Read without locks by the handler; -1 disables it (pre-init, post-fork,
/// post-shutdown).
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Work registered against a signal number; re-dispatched on every
/// delivery.
struct SignalWork {
    signo: i32,
    func: Arc<dyn Fn(WorkStatus) + Send + Sync>,
}

struct HandlerEntry {
    signo: i32,
    /// Saved disposition; teardown is not required for correctness, the
    /// handler simply goes quiet when the fd is gone.
    #[allow(dead_code)]
    prior: SigAction,
}

struct SignalTables {
    handlers: Vec<HandlerEntry>,
    work: Vec<SignalWork>,
    /// Manager currently owning the bridge connection.
    mgr: Option<Weak<Shared>>,
    bridge_active: bool,
    atfork_installed: bool,
}

impl SignalTables {
    const fn new() -> Self {
        SignalTables {
            handlers: Vec::new(),
            work: Vec::new(),
            mgr: None,
            bridge_active: false,
            atfork_installed: false,
        }
    }
}

/// Lock order: this lock before the primary mutex (dispatch path).
static TABLES: RwLock<SignalTables> = RwLock::new(SignalTables::new());

/// Async-signal-safe handler: forward the signal number into the pipe.
extern "C" fn bridge_signal_handler(signo: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        // inherited across fork() or racing shutdown; nothing to notify
        return;
    }
    let bytes = signo.to_ne_bytes();
    loop {
        let rc = unsafe {
            libc::write(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if rc == bytes.len() as isize {
            return;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            // write after shutdown closed the pipe; ignore the race
            Some(libc::EPIPE) | Some(libc::EBADF) => return,
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => std::process::abort(),
        }
    }
}

unsafe extern "C" fn atfork_child() {
    SIGNAL_WRITE_FD.store(-1, Ordering::Relaxed);
    // Single-threaded in the child; if the fork did not race a table
    // mutation the lock is free and the rest of the state resets too.
    if let Some(mut tables) = TABLES.try_write() {
        *tables = SignalTables::new();
    }
}

/// Install a handler for an already-validated signal unless one is ours.
/// Caller holds the write lock.
fn register_handler(tables: &mut SignalTables, signal: Signal) {
    let signo = signal as i32;
    if tables.handlers.iter().any(|h| h.signo == signo) {
        return;
    }
    let action = SigAction::new(
        SigHandler::Handler(bridge_signal_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let prior = unsafe { sigaction(signal, &action) }
        .unwrap_or_else(|e| panic!("unable to catch {signal}: {e}"));
    debug!(signal = %signal, "installed signal handler");
    tables.handlers.push(HandlerEntry { signo, prior });
}

/// Register work to run on every delivery of `signo`. A number the kernel
/// has no catchable signal for is rejected here, before any table changes.
pub(crate) fn add_signal_work(
    signo: i32,
    func: Arc<dyn Fn(WorkStatus) + Send + Sync>,
) -> Result<()> {
    let signal =
        Signal::try_from(signo).map_err(|_| Error::InvalidArgument("signal number"))?;
    let mut tables = TABLES.write();
    tables.work.push(SignalWork { signo, func });
    // the bridge already exists: install directly instead of waiting for
    // another bridge start
    if tables.bridge_active {
        register_handler(&mut tables, signal);
    }
    Ok(())
}

/// Dispatch one delivered signal to every matching registered work item.
fn dispatch(signo: i32) {
    let tables = TABLES.read();
    let target = tables.mgr.as_ref().and_then(Weak::upgrade);
    let mut matched = false;

    if let Some(shared) = target {
        let mut st = shared.state.lock();
        for w in tables.work.iter().filter(|w| w.signo == signo) {
            matched = true;
            let func = w.func.clone();
            st.run_queue
                .push_back(Work::call(None, Box::new(move |_, status| func(status))));
        }
        drop(st);
        if matched {
            shared.kick();
        }
    }

    if !matched {
        warn!(signo, "caught and ignoring signal");
    }
}

/// Create the self-pipe and register the bridge connection with `shared`.
pub(crate) fn start_bridge(shared: &Arc<Shared>) -> Result<()> {
    {
        let mut tables = TABLES.write();
        if tables.bridge_active {
            debug!("signal bridge already owned by another manager");
            return Ok(());
        }

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
        let read_fd = read_end.into_raw_fd();
        let write_fd = write_end.into_raw_fd();
        // the handler retries rather than drops; a blocking write end keeps
        // it simple
        fd::set_blocking(write_fd)?;

        if !tables.atfork_installed {
            let rc = unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
            if rc != 0 {
                panic!(
                    "pthread_atfork() failed: {}",
                    std::io::Error::from_raw_os_error(rc)
                );
            }
            tables.atfork_installed = true;
        }

        // a handler write racing teardown must see EPIPE, not die on SIGPIPE
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        if let Err(e) = unsafe { sigaction(Signal::SIGPIPE, &ignore) } {
            warn!(error = %e, "unable to ignore SIGPIPE");
        }

        SIGNAL_WRITE_FD.store(write_fd, Ordering::SeqCst);
        tables.bridge_active = true;
        tables.mgr = Some(Arc::downgrade(shared));

        let signos: Vec<i32> = tables.work.iter().map(|w| w.signo).collect();
        for signo in signos {
            // validated when the work was registered
            if let Ok(signal) = Signal::try_from(signo) {
                register_handler(&mut tables, signal);
            }
        }

        let events = Events::new()
            .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
            .on_data(|con, _arg| {
                while con.input_len()? >= std::mem::size_of::<libc::c_int>() {
                    let raw = con.consume_input(std::mem::size_of::<libc::c_int>())?;
                    let signo = libc::c_int::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    trace!(signo, "signal received");
                    dispatch(signo);
                }
                Ok(())
            })
            .on_finish(|_con, _arg| stop_bridge());

        drop(tables);

        if let Err(e) = add_connection(
            shared,
            AddConnection {
                kind: ConnKind::Raw,
                input_fd: read_fd,
                output_fd: -1,
                events,
                address: crate::address::ConnAddress::None,
                is_listen: false,
                unix_socket_path: None,
                connected: true,
                listen_arg: None,
                inherited_unix_path: None,
            },
        ) {
            stop_bridge();
            fd::close_fd(read_fd);
            return Err(e);
        }
    }
    Ok(())
}

/// Bridge connection finished: close the write end and release ownership.
fn stop_bridge() {
    let mut tables = TABLES.write();
    let write_fd = SIGNAL_WRITE_FD.swap(-1, Ordering::SeqCst);
    fd::close_fd(write_fd);
    tables.bridge_active = false;
    tables.mgr = None;
    trace!("signal bridge stopped");
}
