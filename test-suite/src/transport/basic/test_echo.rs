use crate::transport::{frame, read_frame, write_all};
use crate::*;
use rivet_rpc_tcp::adapter::{ClientAdapter, ServerAdapter};
use rivet_stream::{ClientConfig, ServerConfig};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

fn start_server(receiver: Arc<EchoReceiver>) -> (Arc<ServerAdapter>, SocketAddr) {
    let config = ServerConfig { num_channels: 2, ..Default::default() };
    let server = Arc::new(ServerAdapter::new(config, receiver, None));
    let addr = server.open("tcp://127.0.0.1:0").expect("server open");
    let run_server = server.clone();
    std::thread::spawn(move || run_server.run());
    (server, addr)
}

fn start_client(
    receiver: Arc<CollectReceiver>, addr: SocketAddr, config: ClientConfig,
) -> Arc<ClientAdapter> {
    let client = Arc::new(ClientAdapter::new(config, receiver, None, None));
    client.open(&format!("tcp://{}", addr)).expect("client open");
    let run_client = client.clone();
    std::thread::spawn(move || run_client.run());
    client
}

#[logfn]
#[rstest]
fn test_echo_roundtrip(runner: TestRunner) {
    let _ = runner;
    let server_recv = Arc::new(EchoReceiver::default());
    let (server, addr) = start_server(server_recv.clone());

    let client_recv = Arc::new(CollectReceiver::default());
    let client = start_client(client_recv.clone(), addr, ClientConfig::default());
    assert!(wait_until(Duration::from_secs(2), || client.is_connected()));

    client_recv.send(b"hello");
    assert!(wait_until(Duration::from_secs(2), || {
        !client_recv.bodies.lock().unwrap().is_empty()
    }));
    assert_eq!(client_recv.bodies.lock().unwrap()[0], b"hello");
    assert_eq!(server_recv.received.load(std::sync::atomic::Ordering::Acquire), 1);

    assert!(client.close());
    assert!(wait_until(Duration::from_secs(2), || !client.is_running()));
    assert!(server.close());
    assert!(wait_until(Duration::from_secs(2), || {
        server_recv.closed.load(std::sync::atomic::Ordering::Acquire) >= 1
    }));
    assert!(server_recv.errors.lock().unwrap().is_empty());
}

#[logfn]
#[rstest]
fn test_pipelined_frames_one_write(runner: TestRunner) {
    let _ = runner;
    let server_recv = Arc::new(EchoReceiver::default());
    let (server, addr) = start_server(server_recv.clone());

    let mut sock = TcpStream::connect(addr).expect("connect");
    let mut batch = frame(b"one");
    batch.extend_from_slice(&frame(b"two"));
    batch.extend_from_slice(&frame(b"three"));
    write_all(&mut sock, &batch);

    assert_eq!(read_frame(&mut sock).unwrap(), b"one");
    assert_eq!(read_frame(&mut sock).unwrap(), b"two");
    assert_eq!(read_frame(&mut sock).unwrap(), b"three");
    assert_eq!(server_recv.received.load(std::sync::atomic::Ordering::Acquire), 3);

    drop(sock);
    assert!(server.close());
}

#[logfn]
#[rstest]
fn test_empty_body_roundtrip(runner: TestRunner) {
    let _ = runner;
    let server_recv = Arc::new(EchoReceiver::default());
    let (server, addr) = start_server(server_recv);

    let mut sock = TcpStream::connect(addr).expect("connect");
    write_all(&mut sock, &frame(b""));
    assert_eq!(read_frame(&mut sock).unwrap(), b"");

    drop(sock);
    assert!(server.close());
}
