//! Connection addresses and name resolution.
//!
//! Every connection carries a family-tagged address (when one is known) and a
//! stable human-readable name derived from the peer address or, failing that,
//! from what the fd resolves to on this host.

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::sys::socket::{getpeername, SockaddrLike, SockaddrStorage};

use crate::fd;

/// Family-tagged peer or bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAddress {
    /// No address captured (pipes, adopted fds without one).
    None,
    /// AF_INET / AF_INET6.
    Inet(SocketAddr),
    /// AF_UNIX, identified by path.
    Unix(PathBuf),
}

impl ConnAddress {
    /// Family-specific listener equality: AF_INET by (addr, port); AF_INET6
    /// by (addr, port, scope); AF_UNIX by path. Differing families never
    /// match.
    pub fn matches_listener(&self, other: &ConnAddress) -> bool {
        match (self, other) {
            (ConnAddress::Inet(SocketAddr::V4(a)), ConnAddress::Inet(SocketAddr::V4(b))) => {
                a.ip() == b.ip() && a.port() == b.port()
            }
            (ConnAddress::Inet(SocketAddr::V6(a)), ConnAddress::Inet(SocketAddr::V6(b))) => {
                a.ip() == b.ip() && a.port() == b.port() && a.scope_id() == b.scope_id()
            }
            (ConnAddress::Unix(a), ConnAddress::Unix(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ConnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnAddress::None => write!(f, "(unknown)"),
            ConnAddress::Inet(addr) => write!(f, "{addr}"),
            ConnAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for ConnAddress {
    fn from(addr: SocketAddr) -> Self {
        ConnAddress::Inet(addr)
    }
}

/// Convert a kernel-provided sockaddr into a [`ConnAddress`].
pub(crate) fn from_storage(storage: &SockaddrStorage) -> ConnAddress {
    if let Some(sin) = storage.as_sockaddr_in() {
        return ConnAddress::Inet(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }
    if let Some(sin6) = storage.as_sockaddr_in6() {
        return ConnAddress::Inet(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    if let Some(unix) = storage.as_unix_addr() {
        if let Some(path) = unix.path() {
            return ConnAddress::Unix(path.to_path_buf());
        }
    }
    ConnAddress::None
}

/// Peer address of a connected socket, if the kernel will tell us.
pub(crate) fn peer_address(fd: RawFd) -> Option<ConnAddress> {
    let storage: SockaddrStorage = getpeername(fd).ok()?;
    if storage.family().is_none() {
        return None;
    }
    match from_storage(&storage) {
        ConnAddress::None => None,
        addr => Some(addr),
    }
}

/// Best-effort description of what an fd refers to.
fn resolve_fd(fd: RawFd, stat: &nix::sys::stat::FileStat) -> Option<String> {
    if fd::is_socket(stat) {
        if let Some(peer) = peer_address(fd) {
            return Some(peer.to_string());
        }
    }

    let link = PathBuf::from(format!("/proc/self/fd/{fd}"));
    if let Ok(target) = std::fs::read_link(link) {
        return Some(target.display().to_string());
    }

    if fd::is_fifo(stat) {
        return Some("pipe".to_string());
    }

    None
}

/// Derive the stable connection name from its fd pair.
///
/// Both sides absent yields `"INVALID"`; identical descriptions collapse to
/// one side; otherwise the two halves are joined with `->`.
pub(crate) fn connection_name(
    input_fd: RawFd,
    output_fd: RawFd,
    in_stat: Option<&nix::sys::stat::FileStat>,
    out_stat: Option<&nix::sys::stat::FileStat>,
) -> String {
    let has_in = input_fd >= 0;
    let has_out = output_fd >= 0;

    if !has_in && !has_out {
        return "INVALID".to_string();
    }

    let in_str = in_stat
        .and_then(|s| resolve_fd(input_fd, s))
        .unwrap_or_else(|| "fd".to_string());
    let out_str = out_stat
        .and_then(|s| resolve_fd(output_fd, s))
        .unwrap_or_else(|| "fd".to_string());

    let is_same = input_fd == output_fd || (has_in && has_out && in_str == out_str);

    if is_same && has_in {
        format!("{in_str}(fd:{input_fd})")
    } else if has_in && has_out {
        format!("{in_str}(fd:{input_fd})->{out_str}(fd:{output_fd})")
    } else if has_in {
        format!("{in_str}(fd:{input_fd})->()")
    } else {
        format!("()->{out_str}(fd:{output_fd})")
    }
}

/// Strip the `unix:` prefix from a listener spec, if present.
pub(crate) fn unix_path_of(listen_on: &str) -> Option<&Path> {
    listen_on.strip_prefix("unix:").map(Path::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(ip: [u8; 4], port: u16) -> ConnAddress {
        ConnAddress::Inet(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
    }

    fn v6(port: u16, scope: u32) -> ConnAddress {
        ConnAddress::Inet(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::LOCALHOST,
            port,
            0,
            scope,
        )))
    }

    #[test]
    fn test_v4_listener_match() {
        assert!(v4([127, 0, 0, 1], 80).matches_listener(&v4([127, 0, 0, 1], 80)));
        assert!(!v4([127, 0, 0, 1], 80).matches_listener(&v4([127, 0, 0, 1], 81)));
        assert!(!v4([127, 0, 0, 1], 80).matches_listener(&v4([127, 0, 0, 2], 80)));
    }

    #[test]
    fn test_v6_listener_match_includes_scope() {
        assert!(v6(80, 1).matches_listener(&v6(80, 1)));
        assert!(!v6(80, 1).matches_listener(&v6(80, 2)));
        assert!(!v6(80, 1).matches_listener(&v4([127, 0, 0, 1], 80)));
    }

    #[test]
    fn test_unix_listener_match() {
        let a = ConnAddress::Unix(PathBuf::from("/tmp/a.sock"));
        let b = ConnAddress::Unix(PathBuf::from("/tmp/a.sock"));
        let c = ConnAddress::Unix(PathBuf::from("/tmp/c.sock"));
        assert!(a.matches_listener(&b));
        assert!(!a.matches_listener(&c));
        assert!(!ConnAddress::None.matches_listener(&ConnAddress::None));
    }

    #[test]
    fn test_invalid_name() {
        assert_eq!(connection_name(-1, -1, None, None), "INVALID");
    }

    #[test]
    fn test_pipe_name() {
        use std::os::unix::io::AsRawFd;
        let (r, w) = std::io::pipe().unwrap();
        let r_fd = r.as_raw_fd();
        let stat = crate::fd::stat_fd(r_fd).unwrap();
        let name = connection_name(r_fd, -1, Some(&stat), None);
        assert!(name.ends_with(&format!("(fd:{r_fd})->()")), "{name}");
        drop(w);
    }

    #[test]
    fn test_unix_prefix() {
        assert_eq!(
            unix_path_of("unix:/tmp/x.sock"),
            Some(Path::new("/tmp/x.sock"))
        );
        assert_eq!(unix_path_of("127.0.0.1:80"), None);
    }
}
