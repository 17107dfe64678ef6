//! conmux: an event-driven connection manager.
//!
//! A single-process I/O subsystem that owns a set of file descriptors,
//! multiplexes readiness over a polling primitive, and dispatches
//! per-connection work (accept, read/parse, write, close) to a pool of
//! worker threads.
//!
//! Features:
//! - TCP and local-domain listeners, non-blocking outbound connects
//! - RAW (stream) and RPC (length-framed) delivery, switchable at runtime
//! - File-descriptor passing between processes over local-domain sockets
//! - UNIX signals serialized into the work queue via a self-pipe
//! - Writes drain before close; at most one worker per connection at a time
//!
//! ```no_run
//! use conmux::{Config, ConArg, ConnKind, Events, Manager};
//!
//! let mgr = Manager::init(Config::default())?;
//! let events = Events::new()
//!     .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
//!     .on_data(|con, _arg| {
//!         let data = con.take_input()?;
//!         con.queue_write(data.freeze())
//!     })
//!     .on_finish(|_con, _arg| {});
//! mgr.create_listen_sockets(ConnKind::Raw, &["unix:/tmp/echo.sock"], events, None)?;
//! mgr.run();
//! # Ok::<(), conmux::Error>(())
//! ```

mod address;
mod buffer;
mod config;
mod conn;
mod error;
mod fd;
mod fdpass;
mod listen;
mod mgr;
mod poll;
mod registry;
mod signals;
mod watch;
mod work;
mod workers;

pub use address::ConnAddress;
pub use config::Config;
pub use conn::{Conn, ConnKind, ConnStatus, ConArg, Events, ListenArg};
pub use error::{Error, Result};
pub use mgr::{Manager, ManagerStats, ShutdownHandle};
pub use work::WorkStatus;
