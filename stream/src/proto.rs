//! The self-delimited wire format.
//!
//! Every message starts with a fixed [`STREAM_HEAD_SIZE`] byte head and
//! ends with a check byte:
//!
//! ```text
//!  0       1      2..6        6          7..N-1    N-1
//!  +-------+------+-----------+----------+--------+-------+
//!  | magic | kind | length LE | reserved | body   | check |
//!  +-------+------+-----------+----------+--------+-------+
//! ```
//!
//! `length` covers the entire message including the head and the check
//! byte, so the minimum valid message is [`STREAM_HEAD_SIZE`] bytes (empty
//! body, check byte in the head slot). The check byte is the XOR of every
//! preceding byte. The body is opaque to the transport.

/// Fixed head size; also the minimum total message length.
pub const STREAM_HEAD_SIZE: usize = 8;

/// First byte of every message.
pub const STREAM_MAGIC: u8 = 0x52;

/// Default message kind for opaque binary RPC payloads.
pub const STREAM_KIND_RPC: u8 = 0;

const LENGTH_OFFSET: usize = 2;

fn xor_of(bytes: &[u8]) -> u8 {
    let mut x = 0u8;
    for b in bytes {
        x ^= *b;
    }
    x
}

/// One framed message.
///
/// Built either by a writer (head template, body appended, then
/// [`RpcStream::seal`]) or by the inbound parser
/// ([`RpcStream::with_total`] plus [`RpcStream::append`]).
#[derive(Clone, PartialEq, Eq)]
pub struct RpcStream {
    buf: Vec<u8>,
    total: usize,
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "stream(total={}, filled={})", self.total, self.buf.len())
    }
}

impl RpcStream {
    /// A writer-side stream with an empty body.
    pub fn new() -> Self {
        Self::with_kind(STREAM_KIND_RPC)
    }

    pub fn with_kind(kind: u8) -> Self {
        // Head template without the trailing check-or-body byte; seal()
        // completes it.
        let mut buf = Vec::with_capacity(STREAM_HEAD_SIZE);
        buf.extend_from_slice(&[STREAM_MAGIC, kind, 0, 0, 0, 0, 0]);
        Self { buf, total: 0 }
    }

    /// Append body bytes on the writer side. Only valid before `seal`.
    pub fn write_bytes(&mut self, b: &[u8]) {
        debug_assert_eq!(self.total, 0, "stream already sealed");
        self.buf.extend_from_slice(b);
    }

    /// Finalize: fix the length field and append the check byte.
    pub fn seal(&mut self) {
        debug_assert_eq!(self.total, 0, "stream already sealed");
        let total = self.buf.len() + 1;
        self.buf[LENGTH_OFFSET..LENGTH_OFFSET + 4]
            .copy_from_slice(&(total as u32).to_le_bytes());
        let check = xor_of(&self.buf);
        self.buf.push(check);
        self.total = total;
    }

    /// Convenience: a sealed stream around `body`.
    pub fn from_body(body: &[u8]) -> Self {
        let mut s = Self::new();
        s.write_bytes(body);
        s.seal();
        s
    }

    /// Parser-side constructor for a message of known total length.
    pub fn with_total(total: usize) -> Self {
        Self { buf: Vec::with_capacity(total), total }
    }

    /// Copy as much of `b` as still fits; returns the number consumed.
    pub fn append(&mut self, b: &[u8]) -> usize {
        let remaining = self.total - self.buf.len();
        let n = remaining.min(b.len());
        self.buf.extend_from_slice(&b[..n]);
        n
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.buf.len() == self.total
    }

    /// Total message length including head and check byte.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn kind(&self) -> u8 {
        self.buf[1]
    }

    /// The opaque body between head and check byte.
    pub fn body(&self) -> &[u8] {
        &self.buf[STREAM_HEAD_SIZE - 1..self.total - 1]
    }

    /// The full message bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Verify the magic and the trailing check byte of a complete message.
    pub fn check(&self) -> bool {
        if !self.is_complete() || self.total < STREAM_HEAD_SIZE {
            return false;
        }
        self.buf[0] == STREAM_MAGIC && xor_of(&self.buf[..self.total - 1]) == self.buf[self.total - 1]
    }

    /// Read the total message length out of a complete head.
    ///
    /// Returns None when the head is malformed (bad magic or a length
    /// shorter than the head itself).
    pub fn length_from_head(head: &[u8]) -> Option<usize> {
        debug_assert!(head.len() >= STREAM_HEAD_SIZE);
        if head[0] != STREAM_MAGIC {
            return None;
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&head[LENGTH_OFFSET..LENGTH_OFFSET + 4]);
        let total = u32::from_le_bytes(len_bytes) as usize;
        if total < STREAM_HEAD_SIZE { None } else { Some(total) }
    }

    /// Outbound cursor read: the slice at `pos`, capped by `max`, and
    /// whether that slice reaches the end of the message.
    pub fn peek_buffer_slice(&self, pos: usize, max: usize) -> (&[u8], bool) {
        if pos >= self.total {
            return (&[], true);
        }
        let end = (pos + max).min(self.total);
        (&self.buf[pos..end], end == self.total)
    }
}

impl Default for RpcStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_is_head_sized() {
        let s = RpcStream::from_body(&[]);
        assert_eq!(s.total_len(), STREAM_HEAD_SIZE);
        assert!(s.check());
        assert_eq!(s.body(), &[] as &[u8]);
    }

    #[test]
    fn test_seal_and_check() {
        let body = b"hello rpc";
        let s = RpcStream::from_body(body);
        assert_eq!(s.total_len(), STREAM_HEAD_SIZE + body.len());
        assert!(s.check());
        assert_eq!(s.body(), body);
        assert_eq!(RpcStream::length_from_head(s.as_bytes()), Some(s.total_len()));
    }

    #[test]
    fn test_corrupted_check_byte() {
        let mut s = RpcStream::from_body(b"abc");
        let last = s.total_len() - 1;
        s.buf[last] ^= 0xff;
        assert!(!s.check());
    }

    #[test]
    fn test_length_from_head_rejects() {
        let mut bad_magic = RpcStream::from_body(b"x");
        bad_magic.buf[0] = 0;
        assert_eq!(RpcStream::length_from_head(bad_magic.as_bytes()), None);

        let mut short = RpcStream::from_body(b"x");
        short.buf[LENGTH_OFFSET..LENGTH_OFFSET + 4]
            .copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(RpcStream::length_from_head(short.as_bytes()), None);
    }

    #[test]
    fn test_append_caps_at_total() {
        let sealed = RpcStream::from_body(b"0123456789");
        let wire = sealed.as_bytes();
        let mut s = RpcStream::with_total(wire.len());
        let extra = [wire, b"tail of the next message"].concat();
        let n = s.append(&extra);
        assert_eq!(n, wire.len());
        assert!(s.is_complete());
        assert!(s.check());
    }

    #[test]
    fn test_peek_buffer_slice_cursor() {
        let s = RpcStream::from_body(b"0123456789");
        let mut pos = 0;
        let mut out = Vec::new();
        loop {
            let (slice, finished) = s.peek_buffer_slice(pos, 4);
            out.extend_from_slice(slice);
            pos += slice.len();
            if finished {
                break;
            }
        }
        assert_eq!(out, s.as_bytes());
    }
}
