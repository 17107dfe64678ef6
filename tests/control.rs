//! Connect completion, mode switching, and shutdown cancellation.

use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use conmux::{ConArg, Config, ConnAddress, ConnKind, Events, Manager, WorkStatus};

#[test]
fn test_refused_connect_finishes_unconnected() {
    // learn a port nothing is listening on
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let mgr = Manager::init(Config::default()).unwrap();

    let (tx, rx) = mpsc::channel::<bool>();
    let connected_ran = Arc::new(AtomicBool::new(false));
    let connected_flag = connected_ran.clone();
    let events = Events::new()
        .on_connection(move |_con, _arg| {
            connected_flag.store(true, Ordering::SeqCst);
            Some(Box::new(()) as ConArg)
        })
        .on_data(|con, _arg| {
            let _ = con.take_input()?;
            Ok(())
        })
        .on_finish(move |con, _arg| {
            let is_connected = con.status().map(|s| s.is_connected).unwrap_or(true);
            let _ = tx.send(is_connected);
        });

    match mgr.create_connect_socket(ConnKind::Raw, &ConnAddress::Inet(addr), events, None) {
        Ok(()) => {
            // refusal resolved by the poller: the connection finishes
            // without ever being connected
            let is_connected = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("refused connect never finished");
            assert!(!is_connected, "refused connect reported connected");
        }
        // loopback may refuse synchronously; the socket was closed and no
        // connection registered
        Err(conmux::Error::Io(e)) => {
            assert_eq!(e.raw_os_error(), Some(libc::ECONNREFUSED));
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
    assert!(
        !connected_ran.load(Ordering::SeqCst),
        "on_connection ran for a failed connect"
    );

    mgr.shutdown();
}

#[test]
fn test_unsupported_family_rejected() {
    let mgr = Manager::init(Config::default()).unwrap();
    let events = Events::new()
        .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
        .on_data(|con, _arg| {
            let _ = con.take_input()?;
            Ok(())
        });
    let err = mgr
        .create_connect_socket(ConnKind::Raw, &ConnAddress::None, events, None)
        .unwrap_err();
    assert!(matches!(err, conmux::Error::UnsupportedFamily));
    mgr.shutdown();
}

#[test]
fn test_mode_switch_preserves_buffered_bytes() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>();
    let events = Events::new()
        .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
        // RAW side refuses the bytes and flips to framed delivery instead
        .on_data(|con, _arg| con.change_kind(ConnKind::Rpc))
        .on_msg(move |_con, frame, _arg| {
            let _ = msg_tx.send(frame.to_vec());
            Ok(())
        })
        .on_finish(|_con, _arg| {});

    let fd = ours.into_raw_fd();
    mgr.process_fd(ConnKind::Raw, fd, fd, events, ConnAddress::None, None)
        .unwrap();

    let mut peer = theirs;
    let mut wire = Vec::new();
    wire.extend_from_slice(&3u32.to_be_bytes());
    wire.extend_from_slice(b"abc");
    peer.write_all(&wire).unwrap();

    let frame = msg_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("frame never delivered after mode switch");
    assert_eq!(frame, b"abc");

    drop(peer);
    mgr.shutdown();
}

#[test]
fn test_rpc_frames_delivered_in_order() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>();
    let events = Events::new()
        .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
        .on_data(|con, _arg| {
            let _ = con.take_input()?;
            Ok(())
        })
        .on_msg(move |_con, frame, _arg| {
            let _ = msg_tx.send(frame.to_vec());
            Ok(())
        })
        .on_finish(|_con, _arg| {});

    let fd = ours.into_raw_fd();
    mgr.process_fd(ConnKind::Rpc, fd, fd, events, ConnAddress::None, None)
        .unwrap();

    let mut peer = theirs;
    let mut wire = Vec::new();
    for body in [&b"first"[..], &b"second"[..], &b""[..]] {
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(body);
    }
    peer.write_all(&wire).unwrap();

    assert_eq!(
        msg_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        b"first"
    );
    assert_eq!(
        msg_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        b"second"
    );
    assert_eq!(msg_rx.recv_timeout(Duration::from_secs(10)).unwrap(), b"");

    drop(peer);
    mgr.shutdown();
}

#[test]
fn test_work_after_shutdown_is_cancelled() {
    let mgr = Manager::init(Config::default()).unwrap();
    mgr.request_shutdown();
    mgr.run();

    let (tx, rx) = mpsc::channel::<WorkStatus>();
    mgr.queue_work(None, move |_con, status| {
        let _ = tx.send(status);
    })
    .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        WorkStatus::Cancelled
    );
    mgr.shutdown();
}

#[test]
fn test_queued_work_runs_in_connection_order() {
    let (ours, _peer) = UnixStream::pair().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    let (order_tx, order_rx) = mpsc::channel::<u32>();
    let conn_slot: Arc<support::Slot> = Arc::new(support::Slot::default());
    let slot = conn_slot.clone();
    let ready_tx = order_tx.clone();
    let events = Events::new()
        .on_connection(move |con, _arg| {
            slot.put(con.clone());
            let _ = ready_tx.send(0);
            Some(Box::new(()) as ConArg)
        })
        .on_data(|con, _arg| {
            let _ = con.take_input()?;
            Ok(())
        })
        .on_finish(|_con, _arg| {});

    let fd = ours.into_raw_fd();
    mgr.process_fd(ConnKind::Raw, fd, fd, events, ConnAddress::None, None)
        .unwrap();

    assert_eq!(order_rx.recv_timeout(Duration::from_secs(10)).unwrap(), 0);
    let con = conn_slot.take().expect("connection handle captured");

    for i in 1..=5u32 {
        let tx = order_tx.clone();
        con.queue_work(move |_con, _status| {
            let _ = tx.send(i);
        })
        .unwrap();
    }
    for expect in 1..=5u32 {
        assert_eq!(
            order_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            expect
        );
    }

    mgr.shutdown();
}

/// Tiny shared slot for smuggling a Conn handle out of a callback.
mod support {
    use conmux::Conn;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Slot(Mutex<Option<Conn>>);

    impl Slot {
        pub fn put(&self, con: Conn) {
            *self.0.lock().unwrap() = Some(con);
        }
        pub fn take(&self) -> Option<Conn> {
            self.0.lock().unwrap().take()
        }
    }
}
