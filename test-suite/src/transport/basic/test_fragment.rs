use crate::transport::{frame, read_frame, write_all};
use crate::*;
use rivet_rpc_tcp::adapter::ServerAdapter;
use rivet_stream::ServerConfig;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn echo_server() -> (Arc<ServerAdapter>, std::net::SocketAddr, Arc<EchoReceiver>) {
    let receiver = Arc::new(EchoReceiver::default());
    let config = ServerConfig { num_channels: 1, ..Default::default() };
    let server = Arc::new(ServerAdapter::new(config, receiver.clone(), None));
    let addr = server.open("tcp://127.0.0.1:0").expect("server open");
    let run_server = server.clone();
    std::thread::spawn(move || run_server.run());
    (server, addr, receiver)
}

#[logfn]
#[rstest]
fn test_byte_at_a_time(runner: TestRunner) {
    let _ = runner;
    let (server, addr, receiver) = echo_server();

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.set_nodelay(true).unwrap();
    let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let wire = frame(&body);
    // Worst-case fragmentation: every read on the server side sees one byte.
    for b in &wire {
        sock.write_all(std::slice::from_ref(b)).expect("write");
    }
    assert_eq!(read_frame(&mut sock).unwrap(), body);
    assert_eq!(receiver.received.load(Ordering::Acquire), 1);

    drop(sock);
    assert!(server.close());
}

#[logfn]
#[rstest]
fn test_large_roundtrip(runner: TestRunner) {
    let _ = runner;
    let (server, addr, receiver) = echo_server();

    let mut sock = TcpStream::connect(addr).expect("connect");
    // Much larger than the 16 KiB conn buffers, so both directions go
    // through many partial reads and writes.
    let body: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();
    let wire = frame(&body);

    // Reader on a second thread, the echo comes back while we still write.
    let mut read_side = sock.try_clone().unwrap();
    let reader = std::thread::spawn(move || read_frame(&mut read_side).unwrap());
    write_all(&mut sock, &wire);
    let echoed = reader.join().unwrap();
    assert_eq!(echoed.len(), body.len());
    assert_eq!(echoed, body);
    assert_eq!(receiver.received.load(Ordering::Acquire), 1);

    drop(sock);
    assert!(server.close());
}

#[logfn]
#[rstest]
fn test_split_across_frame_boundary(runner: TestRunner) {
    let _ = runner;
    let (server, addr, receiver) = echo_server();

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.set_nodelay(true).unwrap();
    let mut wire = frame(b"first");
    wire.extend_from_slice(&frame(b"second"));
    // Split in the middle of the second frame's head.
    let cut = frame(b"first").len() + 3;
    write_all(&mut sock, &wire[..cut]);
    std::thread::sleep(Duration::from_millis(50));
    write_all(&mut sock, &wire[cut..]);

    assert_eq!(read_frame(&mut sock).unwrap(), b"first");
    assert_eq!(read_frame(&mut sock).unwrap(), b"second");
    assert_eq!(receiver.received.load(Ordering::Acquire), 2);

    drop(sock);
    assert!(server.close());
}
