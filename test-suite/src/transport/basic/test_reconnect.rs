use crate::*;
use rivet_rpc_tcp::adapter::{ClientAdapter, ServerAdapter};
use rivet_stream::{ClientConfig, ServerConfig};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn echo_server(addr: &str) -> Arc<ServerAdapter> {
    let receiver = Arc::new(EchoReceiver::default());
    let config = ServerConfig { num_channels: 1, ..Default::default() };
    let server = Arc::new(ServerAdapter::new(config, receiver, None));
    server.open(addr).expect("server open");
    let run_server = server.clone();
    std::thread::spawn(move || run_server.run());
    server
}

#[logfn]
#[rstest]
fn test_client_reconnects_after_server_restart(runner: TestRunner) {
    let _ = runner;
    let receiver = Arc::new(EchoReceiver::default());
    let first = Arc::new(ServerAdapter::new(
        ServerConfig { num_channels: 1, ..Default::default() },
        receiver,
        None,
    ));
    let addr = first.open("tcp://127.0.0.1:0").expect("server open");
    let run_first = first.clone();
    std::thread::spawn(move || run_first.run());

    let client_recv = Arc::new(CollectReceiver::default());
    let client_config =
        ClientConfig { reconnect_min: Duration::from_millis(200), ..Default::default() };
    let client = Arc::new(ClientAdapter::new(client_config, client_recv.clone(), None, None));
    client.open(&format!("tcp://{}", addr)).expect("client open");
    let run_client = client.clone();
    let client_thread = std::thread::spawn(move || run_client.run());

    assert!(wait_until(Duration::from_secs(2), || client.is_connected()));
    assert_eq!(client_recv.opened.load(Ordering::Acquire), 1);

    // Take the server down; the client must notice and start redialing.
    assert!(first.close());
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()));
    assert_eq!(client_recv.closed.load(Ordering::Acquire), 1);

    // Bring a fresh server up on the same port; the client comes back on
    // its own within the reconnect window.
    let second = echo_server(&format!("tcp://{}", addr));
    assert!(wait_until(Duration::from_secs(3), || client.is_connected()));
    assert_eq!(client_recv.opened.load(Ordering::Acquire), 2);

    // The revived connection still does work.
    client_recv.send(b"again");
    assert!(wait_until(Duration::from_secs(2), || {
        !client_recv.bodies.lock().unwrap().is_empty()
    }));
    assert_eq!(client_recv.bodies.lock().unwrap()[0], b"again");

    assert!(client.close());
    assert!(client_thread.join().unwrap());
    assert!(second.close());
}

#[logfn]
#[rstest]
fn test_connect_failure_surfaces_and_retries(runner: TestRunner) {
    let _ = runner;
    // Nothing listens here; every attempt fails and is reported.
    let client_recv = Arc::new(CollectReceiver::default());
    let client_config =
        ClientConfig { reconnect_min: Duration::from_millis(100), ..Default::default() };
    let client = Arc::new(ClientAdapter::new(client_config, client_recv.clone(), None, None));
    client.open("tcp://127.0.0.1:1").expect("client open");
    let run_client = client.clone();
    let client_thread = std::thread::spawn(move || run_client.run());

    assert!(wait_until(Duration::from_secs(3), || {
        client_recv.errors.lock().unwrap().len() >= 2
    }));
    assert!(!client.is_connected());
    assert_eq!(client_recv.opened.load(Ordering::Acquire), 0);

    assert!(client.close());
    assert!(client_thread.join().unwrap());
}
