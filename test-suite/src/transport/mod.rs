pub mod basic;

use rivet_stream::proto::RpcStream;
use rivet_stream::STREAM_HEAD_SIZE;
use std::io::{Read, Write};
use std::net::TcpStream;

/// A sealed wire frame around `body`, for raw-socket test clients.
pub fn frame(body: &[u8]) -> Vec<u8> {
    RpcStream::from_body(body).as_bytes().to_vec()
}

/// Blocking-read one whole frame off a raw socket, returning its body.
pub fn read_frame(sock: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = [0u8; STREAM_HEAD_SIZE];
    sock.read_exact(&mut head)?;
    let total = RpcStream::length_from_head(&head)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad head"))?;
    let mut msg = RpcStream::with_total(total);
    let consumed = msg.append(&head);
    assert_eq!(consumed, head.len());
    let mut rest = vec![0u8; total - STREAM_HEAD_SIZE];
    sock.read_exact(&mut rest)?;
    msg.append(&rest);
    assert!(msg.is_complete() && msg.check());
    Ok(msg.body().to_vec())
}

/// Write a whole buffer to a raw socket.
pub fn write_all(sock: &mut TcpStream, buf: &[u8]) {
    sock.write_all(buf).expect("socket write");
}
