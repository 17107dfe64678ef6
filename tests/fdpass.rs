//! Passing file descriptors between connections over a local-domain pair.

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use conmux::{ConArg, Config, Conn, ConnAddress, ConnKind, Events, Manager};

fn sink_events() -> Events {
    Events::new()
        .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
        .on_data(|con, _arg| {
            let _ = con.take_input()?;
            Ok(())
        })
        .on_finish(|_con, _arg| {})
}

#[test]
fn test_send_and_receive_fd() {
    let (side_a, side_b) = UnixStream::pair().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    // capture A's handle so the test can queue work against it
    let a_slot: Arc<Mutex<Option<Conn>>> = Arc::new(Mutex::new(None));
    let (a_ready_tx, a_ready_rx) = mpsc::channel::<()>();
    let a_events = {
        let a_slot = a_slot.clone();
        Events::new()
            .on_connection(move |con, _arg| {
                *a_slot.lock().unwrap() = Some(con.clone());
                let _ = a_ready_tx.send(());
                Some(Box::new(()) as ConArg)
            })
            .on_data(|con, _arg| {
                let _ = con.take_input()?;
                Ok(())
            })
            .on_finish(|_con, _arg| {})
    };

    let a_fd = side_a.into_raw_fd();
    mgr.process_fd(ConnKind::Raw, a_fd, a_fd, a_events, ConnAddress::None, None)
        .unwrap();
    a_ready_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("sender connection never came up");
    let a_con = a_slot.lock().unwrap().take().unwrap();

    // the manager owns this fd once queued; it closes the local copy after
    // sending
    let devnull = std::fs::File::open("/dev/null").unwrap();
    a_con.queue_send_fd(devnull.into_raw_fd()).unwrap();

    // adopt B only after A's send finished, and queue the receive from B's
    // own on_connection so nothing reads the message ahead of it
    let (recv_tx, recv_rx) = mpsc::channel::<String>();
    let b_fd = side_b.into_raw_fd();

    let adopted_events = {
        let recv_tx = recv_tx.clone();
        Events::new()
            .on_connection(move |con, _arg| {
                let _ = recv_tx.send(con.name().unwrap_or_default());
                Some(Box::new(()) as ConArg)
            })
            .on_data(|con, _arg| {
                let _ = con.take_input()?;
                Ok(())
            })
            .on_finish(|_con, _arg| {})
    };

    let b_events = {
        let adopted_events = adopted_events.clone();
        Events::new()
            .on_connection(move |con, _arg| {
                con.queue_receive_fd(ConnKind::Raw, adopted_events.clone(), None)
                    .expect("receive queue failed");
                Some(Box::new(()) as ConArg)
            })
            .on_data(|con, _arg| {
                let _ = con.take_input()?;
                Ok(())
            })
            .on_finish(|_con, _arg| {})
    };

    // A's FIFO: this runs only after the send work, so once it signals, the
    // fd already sits in B's socket buffer
    let (sent_tx, sent_rx) = mpsc::channel::<()>();
    a_con
        .queue_work(move |_con, _status| {
            let _ = sent_tx.send(());
        })
        .unwrap();
    sent_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("send work never ran");

    mgr.process_fd(ConnKind::Raw, b_fd, b_fd, b_events, ConnAddress::None, None)
        .unwrap();

    let name = recv_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("received fd never became a connection");
    assert!(
        name.contains("null"),
        "received fd does not refer to /dev/null: {name}"
    );

    mgr.shutdown();
}

#[test]
fn test_send_fd_validations() {
    let (ours, _peer) = UnixStream::pair().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    let slot: Arc<Mutex<Option<Conn>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel::<()>();
    let events = {
        let slot = slot.clone();
        Events::new()
            .on_connection(move |con, _arg| {
                *slot.lock().unwrap() = Some(con.clone());
                let _ = tx.send(());
                Some(Box::new(()) as ConArg)
            })
            .on_data(|con, _arg| {
                let _ = con.take_input()?;
                Ok(())
            })
            .on_finish(|_con, _arg| {})
    };

    let fd = ours.into_raw_fd();
    mgr.process_fd(ConnKind::Raw, fd, fd, events, ConnAddress::None, None)
        .unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let con = slot.lock().unwrap().take().unwrap();

    assert!(matches!(
        con.queue_send_fd(-1),
        Err(conmux::Error::InvalidArgument(_))
    ));

    mgr.shutdown();
}

#[test]
fn test_receive_fd_rejected_on_pipe() {
    let (r, _w) = std::io::pipe().unwrap();
    let mgr = Manager::init(Config::default()).unwrap();

    let slot: Arc<Mutex<Option<Conn>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel::<()>();
    let events = {
        let slot = slot.clone();
        Events::new()
            .on_connection(move |con, _arg| {
                *slot.lock().unwrap() = Some(con.clone());
                let _ = tx.send(());
                Some(Box::new(()) as ConArg)
            })
            .on_data(|con, _arg| {
                let _ = con.take_input()?;
                Ok(())
            })
            .on_finish(|_con, _arg| {})
    };

    mgr.process_fd(
        ConnKind::Raw,
        r.into_raw_fd(),
        -1,
        events,
        ConnAddress::None,
        None,
    )
    .unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let con = slot.lock().unwrap().take().unwrap();

    // fd passing needs a socket
    assert!(matches!(
        con.queue_receive_fd(ConnKind::Raw, sink_events(), None),
        Err(conmux::Error::UnsupportedFamily)
    ));

    mgr.shutdown();
}
