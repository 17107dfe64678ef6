//! Listener and dialer setup.
//!
//! Listeners come from `"unix:/path"` or `"host:port"` specs; every resolved
//! address gets its own listener unless one is already bound to it. Outbound
//! connects are non-blocking: EINPROGRESS parks the connection in the
//! CONNECTED polling kind until the poller reports completion.

use std::net::ToSocketAddrs;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::address::{unix_path_of, ConnAddress};
use crate::conn::{ConnKind, Events, ListenArg};
use crate::error::{Error, Result};
use crate::mgr::{add_connection, AddConnection, Manager, Shared};

impl Manager {
    /// Create listeners for every spec in `listen_on`: `"unix:/path"` or
    /// `"host:port"` (each resolved address gets a listener).
    ///
    /// A spec whose address is already being listened on is skipped with a
    /// warning; bind/listen failures on fresh sockets abort, matching the
    /// setup-is-programmer-error discipline.
    pub fn create_listen_sockets(
        &self,
        kind: ConnKind,
        listen_on: &[impl AsRef<str>],
        events: Events,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        for spec in listen_on {
            self.create_listen_socket(kind, spec.as_ref(), events.clone(), arg.clone())?;
        }
        Ok(())
    }

    fn create_listen_socket(
        &self,
        kind: ConnKind,
        listen_on: &str,
        events: Events,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        if let Some(path) = unix_path_of(listen_on) {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidArgument("empty unix socket path"));
            }

            let address = ConnAddress::Unix(path.to_path_buf());
            if self.is_duplicate_listener(&address) {
                warn!(%address, "ignoring duplicate listen request");
                return Ok(());
            }

            debug!(path = %path.display(), "binding local-domain listener");

            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "unable to unlink stale socket");
                }
            }
            let sockaddr = SockAddr::unix(path)?;
            socket
                .bind(&sockaddr)
                .unwrap_or_else(|e| panic!("unable to bind {listen_on}: {e}"));
            socket
                .listen(self.shared.config.backlog_depth)
                .unwrap_or_else(|e| panic!("unable to listen on {listen_on}: {e}"));

            return self.process_fd_unix_listen(kind, socket.into_raw_fd(), events, path, arg);
        }

        let addrs: Vec<std::net::SocketAddr> = listen_on
            .to_socket_addrs()
            .map_err(|e| {
                debug!(spec = listen_on, error = %e, "unable to resolve listen spec");
                Error::InvalidArgument("listen spec did not resolve")
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::InvalidArgument("listen spec did not resolve"));
        }

        for addr in addrs {
            let address = ConnAddress::from(addr);
            if self.is_duplicate_listener(&address) {
                warn!(%address, "ignoring duplicate listen request");
                continue;
            }

            debug!(%address, "binding stream listener");

            let domain = Domain::for_address(addr);
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            socket
                .set_reuse_address(true)
                .unwrap_or_else(|e| panic!("setsockopt(SO_REUSEADDR) failed for {addr}: {e}"));
            socket
                .bind(&addr.into())
                .unwrap_or_else(|e| panic!("unable to bind {addr}: {e}"));
            socket
                .listen(self.shared.config.backlog_depth)
                .unwrap_or_else(|e| panic!("unable to listen on {addr}: {e}"));

            self.process_fd_listen(
                kind,
                socket.into_raw_fd(),
                events.clone(),
                address,
                arg.clone(),
            )?;
        }
        Ok(())
    }

    fn is_duplicate_listener(&self, address: &ConnAddress) -> bool {
        let st = self.shared.state.lock();
        st.reg.is_listening(address)
    }

    /// Dial `addr` without blocking. The connection registers immediately;
    /// `on_connection` runs once the connect completes.
    pub fn create_connect_socket(
        &self,
        kind: ConnKind,
        addr: &ConnAddress,
        events: Events,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        let (socket, sockaddr) = match addr {
            ConnAddress::Unix(path) => {
                (Socket::new(Domain::UNIX, Type::STREAM, None)?, SockAddr::unix(path)?)
            }
            ConnAddress::Inet(sa) => (
                Socket::new(Domain::for_address(*sa), Type::STREAM, Some(Protocol::TCP))?,
                (*sa).into(),
            ),
            ConnAddress::None => return Err(Error::UnsupportedFamily),
        };

        socket.set_nonblocking(true)?;
        debug!(%addr, "attempting connect");

        match connect_nonblocking(&self.shared, &socket, &sockaddr)? {
            ConnectOutcome::DroppedAtShutdown => return Ok(()),
            ConnectOutcome::Pending => {}
        }

        let fd: RawFd = socket.into_raw_fd();
        add_connection(
            &self.shared,
            AddConnection {
                kind,
                input_fd: fd,
                output_fd: fd,
                events,
                address: addr.clone(),
                is_listen: false,
                unix_socket_path: None,
                connected: false,
                listen_arg: arg,
                inherited_unix_path: None,
            },
        )
    }
}

enum ConnectOutcome {
    /// Pending (or already complete); the poller resolves it.
    Pending,
    /// Shutdown raced an interrupted connect: socket dropped, report
    /// success.
    DroppedAtShutdown,
}

fn connect_nonblocking(
    shared: &Arc<Shared>,
    socket: &Socket,
    sockaddr: &SockAddr,
) -> Result<ConnectOutcome> {
    loop {
        match socket.connect(sockaddr) {
            Ok(()) => return Ok(ConnectOutcome::Pending),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {
                    return Ok(ConnectOutcome::Pending)
                }
                Some(libc::EINTR) => {
                    let shutdown = shared.state.lock().shutdown_requested;
                    if shutdown {
                        debug!("connect interrupted during shutdown; dropping socket");
                        return Ok(ConnectOutcome::DroppedAtShutdown);
                    }
                    continue;
                }
                _ => {
                    debug!(error = %e, "connect failed");
                    return Err(Error::Io(e));
                }
            },
        }
    }
}
