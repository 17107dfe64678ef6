//! Signal bridge: a raised signal drives queued work which closes a
//! connection.
//!
//! Kept to a single test: signal dispositions are process-wide.

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use conmux::{ConArg, Config, Conn, ConnAddress, ConnKind, Events, Manager};

#[test]
fn test_signal_closes_connection() {
    let (ours, peer) = UnixStream::pair().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    let slot: Arc<Mutex<Option<Conn>>> = Arc::new(Mutex::new(None));
    let (up_tx, up_rx) = mpsc::channel::<()>();
    let (fin_tx, fin_rx) = mpsc::channel::<()>();

    let events = {
        let slot = slot.clone();
        Events::new()
            .on_connection(move |con, _arg| {
                *slot.lock().unwrap() = Some(con.clone());
                let _ = up_tx.send(());
                Some(Box::new(()) as ConArg)
            })
            .on_data(|con, _arg| {
                let _ = con.take_input()?;
                Ok(())
            })
            .on_finish(move |_con, _arg| {
                let _ = fin_tx.send(());
            })
    };

    let fd = ours.into_raw_fd();
    mgr.process_fd(ConnKind::Raw, fd, fd, events, ConnAddress::None, None)
        .unwrap();
    up_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("connection never came up");

    // signal work: close the captured connection
    let close_slot = slot.clone();
    mgr.add_signal_work(libc::SIGUSR1, move |status| {
        if status == conmux::WorkStatus::Run {
            if let Some(con) = close_slot.lock().unwrap().as_ref() {
                con.queue_close();
            }
        }
    })
    .unwrap();

    unsafe {
        libc::raise(libc::SIGUSR1);
    }

    fin_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("signal never closed the connection");

    drop(peer);
    mgr.shutdown();
}
