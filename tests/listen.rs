//! Listener registration: duplicate detection per address family.

use std::path::PathBuf;

use conmux::{ConArg, Config, ConnKind, Events, Manager};

fn events() -> Events {
    Events::new()
        .on_connection(|_con, _arg| Some(Box::new(()) as ConArg))
        .on_data(|con, _arg| {
            let _ = con.take_input()?;
            Ok(())
        })
        .on_finish(|_con, _arg| {})
}

fn temp_sock(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("conmux-{}-{}.sock", tag, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn test_duplicate_tcp_listener_ignored() {
    // learn a free port, then release it for the manager
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let mgr = Manager::init(Config::default()).unwrap();
    let spec = format!("127.0.0.1:{port}");

    mgr.create_listen_sockets(ConnKind::Raw, &[spec.clone()], events(), None)
        .unwrap();
    assert_eq!(mgr.stats().listeners, 1);

    // second request for the identical address succeeds without a second
    // listener
    mgr.create_listen_sockets(ConnKind::Raw, &[spec], events(), None)
        .unwrap();
    assert_eq!(mgr.stats().listeners, 1);

    mgr.shutdown();
}

#[test]
fn test_duplicate_unix_listener_ignored() {
    let path = temp_sock("dup");
    let spec = format!("unix:{}", path.display());

    let mgr = Manager::init(Config::default()).unwrap();
    mgr.create_listen_sockets(ConnKind::Raw, &[spec.clone()], events(), None)
        .unwrap();
    assert_eq!(mgr.stats().listeners, 1);

    mgr.create_listen_sockets(ConnKind::Raw, &[spec], events(), None)
        .unwrap();
    assert_eq!(mgr.stats().listeners, 1);

    mgr.shutdown();
    assert!(!path.exists());
}

#[test]
fn test_distinct_listeners_coexist() {
    let a = temp_sock("multi-a");
    let b = temp_sock("multi-b");

    let mgr = Manager::init(Config::default()).unwrap();
    let specs = [
        format!("unix:{}", a.display()),
        format!("unix:{}", b.display()),
    ];
    mgr.create_listen_sockets(ConnKind::Raw, &specs, events(), None)
        .unwrap();
    assert_eq!(mgr.stats().listeners, 2);

    mgr.shutdown();
    assert!(!a.exists());
    assert!(!b.exists());
}

#[test]
fn test_invalid_listen_specs() {
    let mgr = Manager::init(Config::default()).unwrap();
    assert!(mgr
        .create_listen_sockets(ConnKind::Raw, &["unix:"], events(), None)
        .is_err());
    assert!(mgr
        .create_listen_sockets(ConnKind::Raw, &["no-port-here"], events(), None)
        .is_err());
    mgr.shutdown();
}
