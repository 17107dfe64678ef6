//! Error taxonomy for the connection manager.
//!
//! Transient conditions (EINTR, EAGAIN, EINPROGRESS) are absorbed internally
//! and never surface here. Setup failures that indicate programmer error
//! (bind/listen on a requested listener, poll registration that is neither
//! success nor unsupported) panic instead of returning.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the connection-manager API.
#[derive(Debug)]
pub enum Error {
    /// Bad file descriptor or a required argument was missing.
    InvalidArgument(&'static str),
    /// Operation requires an IP or local-domain socket.
    UnsupportedFamily,
    /// Operation requires a socket in a valid state; the connection has
    /// reached EOF or its fd is closed.
    MissingSocket(&'static str),
    /// The peer disappeared, polling failed, or the connection is gone.
    ConnectionError(String),
    /// The platform cannot provide the requested information
    /// (e.g. peer credentials).
    NotSupported,
    /// Underlying I/O failure during adoption or setup.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::UnsupportedFamily => write!(f, "unsupported address family"),
            Error::MissingSocket(what) => write!(f, "socket unavailable: {what}"),
            Error::ConnectionError(what) => write!(f, "connection error: {what}"),
            Error::NotSupported => write!(f, "not supported on this platform"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
