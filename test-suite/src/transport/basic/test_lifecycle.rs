use crate::transport::{frame, write_all};
use crate::*;
use rivet_rpc_tcp::adapter::{ClientAdapter, ServerAdapter};
use rivet_stream::{ClientConfig, ServerConfig};
use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[logfn]
#[rstest]
fn test_malformed_frame_closes_conn(runner: TestRunner) {
    let _ = runner;
    let receiver = Arc::new(EchoReceiver::default());
    let config = ServerConfig { num_channels: 1, ..Default::default() };
    let server = Arc::new(ServerAdapter::new(config, receiver.clone(), None));
    let addr = server.open("tcp://127.0.0.1:0").expect("server open");
    let run_server = server.clone();
    std::thread::spawn(move || run_server.run());

    let mut sock = TcpStream::connect(addr).expect("connect");
    // Wrong magic byte up front; the framing layer must reject and close.
    write_all(&mut sock, &[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 1, 2, 3]);

    let mut tail = Vec::new();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = sock.read_to_end(&mut tail).unwrap_or(0);
    assert_eq!(n, 0);
    assert!(wait_until(Duration::from_secs(2), || {
        receiver.errors.lock().unwrap().len() == 1
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        receiver.closed.load(Ordering::Acquire) == 1
    }));
    assert_eq!(receiver.received.load(Ordering::Acquire), 0);
    assert!(server.close());
}

#[logfn]
#[rstest]
fn test_server_force_close_with_live_conns(runner: TestRunner) {
    let _ = runner;
    let receiver = Arc::new(EchoReceiver::default());
    let config = ServerConfig {
        num_channels: 1,
        server_close_wait: Duration::from_millis(200),
        ..Default::default()
    };
    let server = Arc::new(ServerAdapter::new(config, receiver.clone(), None));
    let addr = server.open("tcp://127.0.0.1:0").expect("server open");
    let run_server = server.clone();
    let run_thread = std::thread::spawn(move || run_server.run());

    let mut sock = TcpStream::connect(addr).expect("connect");
    write_all(&mut sock, &frame(b"keepalive"));
    assert!(wait_until(Duration::from_secs(2), || server.active_conns() == 1));

    // The conn never goes away on its own; the close must time out the
    // drain and force it.
    assert!(server.close());
    assert!(run_thread.join().unwrap());
    assert_eq!(server.active_conns(), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        receiver.closed.load(Ordering::Acquire) == 1
    }));
    assert!(!server.is_running());
}

#[logfn]
#[rstest]
fn test_server_reopen_after_close(runner: TestRunner) {
    let _ = runner;
    let receiver = Arc::new(EchoReceiver::default());
    let server = Arc::new(ServerAdapter::new(ServerConfig::default(), receiver, None));
    let addr = server.open("tcp://127.0.0.1:0").expect("first open");
    assert!(server.is_running());
    // A second open while running is refused.
    assert!(server.open("tcp://127.0.0.1:0").is_err());
    assert!(server.close());

    let addr2 = server.open(&format!("tcp://{}", addr)).expect("reopen");
    assert_eq!(addr2, addr);
    assert!(server.close());
}

#[logfn]
#[rstest]
fn test_peer_close_during_read_surfaces_transport_error(runner: TestRunner) {
    let _ = runner;
    // A hand-rolled peer: accept one conn, send a truncated frame, hang up.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let feeder = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        use std::io::Write;
        let wire = frame(&[0x42u8; 64 * 1024]);
        sock.write_all(&wire[..wire.len() / 2]).unwrap();
        // Dropping the socket closes it mid-message.
    });

    let client_recv = Arc::new(CollectReceiver::default());
    let client_config =
        ClientConfig { reconnect_min: Duration::from_secs(30), ..Default::default() };
    let client = Arc::new(ClientAdapter::new(client_config, client_recv.clone(), None, None));
    client.open(&format!("tcp://{}", addr)).expect("client open");
    let run_client = client.clone();
    std::thread::spawn(move || run_client.run());

    feeder.join().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        client_recv.closed.load(Ordering::Acquire) == 1
    }));
    let errors = client_recv.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code(), rivet_rpc_core::error::ERR_CONN_CLOSE.code());
    assert!(client_recv.bodies.lock().unwrap().is_empty());
    drop(errors);
    assert!(client.close());
}

#[logfn]
#[rstest]
fn test_server_rejects_websocket_scheme(runner: TestRunner) {
    let _ = runner;
    let receiver = Arc::new(EchoReceiver::default());
    let server = ServerAdapter::new(ServerConfig::default(), receiver, None);
    let err = server.open("ws://127.0.0.1:0").unwrap_err();
    assert_eq!(err.code(), rivet_rpc_core::error::ERR_UNSUPPORTED_PROTOCOL.code());
    assert!(!server.is_running());
}

#[logfn]
#[rstest]
fn test_client_ws_requires_handshake_adapter(runner: TestRunner) {
    let _ = runner;
    let receiver = Arc::new(CollectReceiver::default());
    let bus = rivet_rpc_core::panic_bus::PanicBus::new();
    let fatal = Arc::new(std::sync::Mutex::new(Vec::new()));
    let fatal2 = fatal.clone();
    let _sub = bus.subscribe(move |err| {
        fatal2.lock().unwrap().push(err.clone());
    });

    let client = ClientAdapter::new(ClientConfig::default(), receiver, None, Some(bus));
    let err = client.open("ws://127.0.0.1:9").unwrap_err();
    assert_eq!(err.code(), rivet_rpc_core::error::ERR_WS_HANDSHAKE.code());
    assert_eq!(fatal.lock().unwrap().len(), 1);
    assert!(!client.is_running());
}
