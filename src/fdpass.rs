//! File-descriptor passing over local-domain sockets.
//!
//! Both directions run as connection work so they serialize with the
//! connection's other activity. Sending always closes the local copy of the
//! fd afterwards; a failed receive closes the source connection, whose
//! stream position is no longer trustworthy.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use tracing::{debug, warn};

use crate::address::ConnAddress;
use crate::conn::{Conn, ConnKind, Events, ListenArg};
use crate::error::{Error, Result};
use crate::fd;
use crate::mgr::{close_con, AddConnection, Shared};
use crate::work::{Work, WorkStatus};

impl Conn {
    /// Queue sending `fd` to the peer as ancillary data. The manager owns
    /// the fd from here on and closes the local copy once sent (or
    /// cancelled).
    pub fn queue_send_fd(&self, fd: RawFd) -> Result<()> {
        let mut st = self.shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(self.idx, self.gen) else {
            return Err(Error::ConnectionError("connection is gone".to_string()));
        };
        if fd < 0 {
            debug!(conn = %con.name, fd, "refusing to send invalid fd");
            return Err(Error::InvalidArgument("fd to send"));
        }
        if !con.is_socket {
            debug!(conn = %con.name, fd, "unable to send fd over non-socket");
            return Err(Error::UnsupportedFamily);
        }
        if con.output_fd < 0 {
            debug!(conn = %con.name, fd, "unable to send fd over closed output");
            return Err(Error::MissingSocket("output is closed"));
        }
        con.work_queue
            .push_back(Work::send_fd(self.idx, self.gen, fd));
        drop(st);
        self.shared.kick();
        Ok(())
    }

    /// Queue receiving one fd from the peer. On success the fd becomes a
    /// fresh connection with the given kind, events, and argument.
    pub fn queue_receive_fd(
        &self,
        kind: ConnKind,
        events: Events,
        arg: Option<ListenArg>,
    ) -> Result<()> {
        events.validate(kind, false)?;
        let mut st = self.shared.state.lock();
        let Some(con) = st.reg.get_checked_mut(self.idx, self.gen) else {
            return Err(Error::ConnectionError("connection is gone".to_string()));
        };
        if !con.is_socket {
            debug!(conn = %con.name, "unable to receive fd over non-socket");
            return Err(Error::UnsupportedFamily);
        }
        if con.read_eof {
            debug!(conn = %con.name, "unable to receive fd after EOF");
            return Err(Error::MissingSocket("input has reached EOF"));
        }
        if con.input_fd < 0 {
            debug!(conn = %con.name, "unable to receive fd over closed input");
            return Err(Error::MissingSocket("input is closed"));
        }
        con.work_queue
            .push_back(Work::recv_fd(self.idx, self.gen, kind, events, arg));
        drop(st);
        self.shared.kick();
        Ok(())
    }
}

/// Worker body for send-fd. The local fd copy is closed on every path.
pub(crate) fn send_fd_work(
    shared: &Arc<Shared>,
    idx: usize,
    gen: u64,
    fd: RawFd,
    status: WorkStatus,
) {
    if status == WorkStatus::Cancelled {
        debug!(fd, "cancelled sending fd");
        fd::close_fd(fd);
        return;
    }

    let (out_fd, name) = {
        let st = shared.state.lock();
        let Some(con) = st.reg.get_checked(idx, gen) else {
            fd::close_fd(fd);
            return;
        };
        (con.output_fd, con.name.clone())
    };

    if out_fd < 0 {
        debug!(conn = %name, fd, "unable to send fd over closed output");
    } else {
        match send_fd_over_socket(out_fd, fd) {
            Ok(()) => debug!(conn = %name, fd, "sent fd"),
            // the source connection survives a failed send
            Err(e) => warn!(conn = %name, fd, error = %e, "unable to send fd"),
        }
    }

    fd::close_fd(fd);
}

/// Worker body for receive-fd. A failed receive closes the source.
pub(crate) fn recv_fd_work(
    shared: &Arc<Shared>,
    idx: usize,
    gen: u64,
    kind: ConnKind,
    events: Events,
    arg: Option<ListenArg>,
    status: WorkStatus,
) {
    if status == WorkStatus::Cancelled {
        debug!("cancelled receiving fd");
        return;
    }

    let (in_fd, name) = {
        let st = shared.state.lock();
        let Some(con) = st.reg.get_checked(idx, gen) else {
            return;
        };
        if con.read_eof || con.input_fd < 0 {
            debug!(conn = %con.name, "unable to receive fd on closed input");
            return;
        }
        (con.input_fd, con.name.clone())
    };

    match receive_fd_over_socket(in_fd) {
        Ok(fd) => {
            let adopted = AddConnection {
                kind,
                input_fd: fd,
                output_fd: fd,
                events,
                address: ConnAddress::None,
                is_listen: false,
                unix_socket_path: None,
                connected: true,
                listen_arg: arg,
                inherited_unix_path: None,
            };
            let mut st = shared.state.lock();
            match crate::mgr::insert_connection(shared, &mut st, adopted) {
                Ok(_) => debug!(conn = %name, fd, "received fd"),
                // registration failure says nothing about the source's state
                Err(e) => {
                    warn!(conn = %name, fd, error = %e, "unable to adopt received fd");
                    fd::close_fd(fd);
                }
            }
            drop(st);
            shared.kick();
        }
        Err(e) => {
            warn!(conn = %name, error = %e, "unable to receive fd; closing source");
            let mut st = shared.state.lock();
            if st.reg.get_checked(idx, gen).is_some() {
                close_con(shared, &mut st, idx);
            }
            drop(st);
            shared.kick();
        }
    }
}

/// Write one byte carrying `fd` as SCM_RIGHTS ancillary data.
fn send_fd_over_socket(socket_fd: RawFd, fd: RawFd) -> std::io::Result<()> {
    let payload = [0u8];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    loop {
        match sendmsg::<()>(socket_fd, &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e)),
        }
    }
}

/// Read one message and extract the first SCM_RIGHTS fd.
fn receive_fd_over_socket(socket_fd: RawFd) -> std::io::Result<RawFd> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    loop {
        match recvmsg::<()>(socket_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
            Ok(msg) => {
                let cmsgs = msg.cmsgs().map_err(std::io::Error::from)?;
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(&fd) = fds.first() {
                            return Ok(fd);
                        }
                    }
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "message carried no fd",
                ));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_fd_roundtrip_over_socketpair() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let file = std::fs::File::open("/dev/null").unwrap();

        send_fd_over_socket(a.as_raw_fd(), file.as_raw_fd()).unwrap();
        let received = receive_fd_over_socket(b.as_raw_fd()).unwrap();
        assert!(received >= 0);

        let stat = crate::fd::stat_fd(received).unwrap();
        assert!(!crate::fd::is_socket(&stat));
        crate::fd::close_fd(received);
    }

    #[test]
    fn test_receive_without_fd_fails() {
        use std::io::Write;
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.write_all(&[0u8]).unwrap();
        let err = receive_fd_over_socket(b.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
