//! The wire envelope: the outermost frame on every connection.
//!
//! ```text
//! envelope := flag : 1 byte ‖ length : unsigned varint ‖ body : length bytes
//! ```
//!
//! A connection carries exactly one envelope in each direction — push model.
//! The codec reads exactly `length` bytes; a short read means the frame is
//! still in flight and the decoder asks for more.

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{Result, TransportError};

/// Client registration request; body is a serialized [`crate::ClientDescriptor`].
pub const ASSIGN_FLAG: u8 = 0xA2;

/// Sphinx packet in transit, or a delivered plaintext payload.
pub const COMM_FLAG: u8 = 0xC6;

/// Provider-to-client bearer token reply.
pub const TOKEN_FLAG: u8 = 0xA9;

/// Inbox fetch request; body is a serialized [`PullRequest`].
pub const PULL_FLAG: u8 = 0xFF;

/// Provider reply on a pull whose token did not verify.
pub const AUTH_FAILED_FLAG: u8 = 0xE1;

/// Ceiling on envelope bodies; far above a packet, small enough to bound
/// a hostile frame.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// A single framed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Dispatch flag.
    pub flag: u8,
    /// Frame body.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Convenience constructor.
    pub fn new(flag: u8, body: Vec<u8>) -> Self {
        Self { flag, body }
    }
}

/// Fetch request carried in a `PULL` envelope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PullRequest {
    /// Registered client id.
    pub client_id: String,
    /// Bearer token returned at registration.
    pub token: Vec<u8>,
}

/// Codec implementing the envelope frame over a byte stream.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

fn put_uvarint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Returns `Ok(None)` while the varint is still incomplete.
fn get_uvarint(src: &[u8]) -> io::Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in src.iter().enumerate() {
        if i >= 10 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint longer than 10 bytes",
            ));
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Envelope>> {
        if src.is_empty() {
            return Ok(None);
        }
        let Some((length, varint_len)) = get_uvarint(&src[1..])? else {
            return Ok(None);
        };
        if length as usize > MAX_BODY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("envelope body of {length} bytes exceeds limit"),
            ));
        }
        let frame_len = 1 + varint_len + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let flag = src[0];
        src.advance(1 + varint_len);
        let body = src.split_to(length as usize).to_vec();
        Ok(Some(Envelope { flag, body }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> io::Result<()> {
        if item.body.len() > MAX_BODY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "envelope body exceeds limit",
            ));
        }
        dst.reserve(1 + 10 + item.body.len());
        dst.put_u8(item.flag);
        put_uvarint(dst, item.body.len() as u64);
        dst.put_slice(&item.body);
        Ok(())
    }
}

/// Dial `addr` and push one envelope, bounding both steps by `timeout`.
pub async fn send_to<A: ToSocketAddrs>(addr: A, envelope: Envelope, timeout: Duration) -> Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    let mut framed = Framed::new(stream, EnvelopeCodec);
    tokio::time::timeout(timeout, framed.send(envelope))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(())
}

/// Read one envelope off `framed`, bounded by `timeout`.
pub async fn recv_one(
    framed: &mut Framed<TcpStream, EnvelopeCodec>,
    timeout: Duration,
) -> Result<Envelope> {
    match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => Err(TransportError::Timeout),
        Ok(None) => Err(TransportError::ConnectionClosed),
        Ok(Some(result)) => Ok(result?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) -> Envelope {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new(COMM_FLAG, vec![0xAA; 3000]);
        assert_eq!(roundtrip(envelope.clone()), envelope);
    }

    #[test]
    fn empty_body_roundtrip() {
        let envelope = Envelope::new(PULL_FLAG, Vec::new());
        assert_eq!(roundtrip(envelope.clone()), envelope);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new(COMM_FLAG, vec![1, 2, 3, 4, 5]), &mut buf)
            .unwrap();

        let mut partial = BytesMut::from(&buf[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&buf[3..]);
        let envelope = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(envelope.body, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn oversized_length_is_an_error() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(COMM_FLAG);
        put_uvarint(&mut buf, (MAX_BODY_SIZE + 1) as u64);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new(TOKEN_FLAG, vec![9; 40]), &mut buf)
            .unwrap();
        codec
            .encode(Envelope::new(COMM_FLAG, vec![7; 200]), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.flag, TOKEN_FLAG);
        assert_eq!(second.flag, COMM_FLAG);
        assert_eq!(second.body.len(), 200);
    }

    #[test]
    fn varint_encoding_matches_reference() {
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, 300);
        assert_eq!(&buf[..], &[0xAC, 0x02]);
        assert_eq!(get_uvarint(&buf).unwrap(), Some((300, 2)));
    }
}
