//! Raw file-descriptor plumbing.
//!
//! Every fd the manager owns is probed with `fstat` at adoption and switched
//! to non-blocking mode; reads and writes afterwards go through the wrappers
//! here, which fold EINTR away and report EAGAIN as [`IoStep::WouldBlock`].

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::sys::stat::{fstat, FileStat};
use tracing::debug;

/// Outcome of one non-blocking read or write attempt.
#[derive(Debug)]
pub(crate) enum IoStep {
    /// Bytes transferred.
    Done(usize),
    /// EOF (read side only).
    Eof,
    /// The fd is not ready; wait for readiness.
    WouldBlock,
    /// Hard failure; the connection should close.
    Failed(io::Error),
}

/// Non-blocking `read(2)` with EINTR retry.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> IoStep {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc > 0 {
            return IoStep::Done(rc as usize);
        }
        if rc == 0 {
            return IoStep::Eof;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return IoStep::WouldBlock,
            // stale fd closed underneath us during teardown
            Some(libc::EBADF) => return IoStep::Eof,
            _ => return IoStep::Failed(err),
        }
    }
}

/// Non-blocking `write(2)` with EINTR retry.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> IoStep {
    loop {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc >= 0 {
            return IoStep::Done(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return IoStep::WouldBlock,
            _ => return IoStep::Failed(err),
        }
    }
}

/// Close an fd, logging (not propagating) failure.
pub(crate) fn close_fd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    if unsafe { libc::close(fd) } == -1 {
        debug!(fd, error = %io::Error::last_os_error(), "close failed");
    }
}

/// Switch an fd to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Switch an fd to blocking mode (the signal pipe's write end must block).
pub(crate) fn set_blocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `fstat` an fd, verifying it is valid and still open.
pub(crate) fn stat_fd(fd: RawFd) -> io::Result<FileStat> {
    fstat(fd).map_err(io::Error::from)
}

pub(crate) fn is_socket(stat: &FileStat) -> bool {
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

pub(crate) fn is_fifo(stat: &FileStat) -> bool {
    (stat.st_mode & libc::S_IFMT) == libc::S_IFIFO
}

/// Enable TCP keepalive. Applied to non-listen stream sockets that do not
/// sit on a local-domain path.
pub(crate) fn set_keep_alive(fd: RawFd) {
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = socket2::SockRef::from(&sock);
    if let Err(e) = sock.set_keepalive(true) {
        debug!(fd, error = %e, "unable to enable keepalive");
    }
}

/// Ask the kernel for the pending socket error (`SO_ERROR`).
pub(crate) fn socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    let err = nix::sys::socket::getsockopt(&sock, nix::sys::socket::sockopt::SocketError)
        .map_err(io::Error::from)?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_stat_and_type_probes() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let stat = stat_fd(a.as_raw_fd()).unwrap();
        assert!(is_socket(&stat));
        assert!(!is_fifo(&stat));

        assert!(stat_fd(-1).is_err());
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            read_fd(a.as_raw_fd(), &mut buf),
            IoStep::WouldBlock
        ));
    }

    #[test]
    fn test_write_then_read() {
        use std::io::Write;
        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        b.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        match read_fd(a.as_raw_fd(), &mut buf) {
            IoStep::Done(4) => assert_eq!(&buf[..4], b"ping"),
            other => panic!("unexpected: {other:?}"),
        }
        drop(b);
        assert!(matches!(read_fd(a.as_raw_fd(), &mut buf), IoStep::Eof));
    }
}
