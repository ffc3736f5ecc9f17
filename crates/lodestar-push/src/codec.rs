//! Push and ack datagram framing.
//!
//! All integers are big-endian.
//!
//! ```text
//! push: 'L' 'P' version flags  seq:u64  key_len:u16  key  body
//! ack:  'L' 'A' version 0      seq:u64  key_len:u16  key
//! ```
//!
//! Flag bit 0 marks a gzip-compressed body.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{PushError, PushResult};

const MAGIC: u8 = b'L';
const KIND_PUSH: u8 = b'P';
const KIND_ACK: u8 = b'A';
const VERSION: u8 = 1;
const FLAG_GZIP: u8 = 0b0000_0001;
const HEADER_LEN: usize = 4 + 8 + 2;

/// A decoded push frame. `body` is always uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    pub seq: u64,
    pub key: String,
    pub compressed: bool,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub seq: u64,
    pub key: String,
}

/// Frame `body` for `key`, gzip-compressing it when it is larger than
/// `compress_threshold` bytes.
pub fn encode_push(seq: u64, key: &str, body: &[u8], compress_threshold: usize) -> PushResult<Bytes> {
    let key_len = key_len(key)?;
    let (flags, payload) = if body.len() > compress_threshold {
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
        encoder
            .write_all(body)
            .map_err(|e| PushError::Codec(format!("gzip: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| PushError::Codec(format!("gzip: {e}")))?;
        (FLAG_GZIP, compressed)
    } else {
        (0, body.to_vec())
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + key.len() + payload.len());
    buf.put_u8(MAGIC);
    buf.put_u8(KIND_PUSH);
    buf.put_u8(VERSION);
    buf.put_u8(flags);
    buf.put_u64(seq);
    buf.put_u16(key_len);
    buf.put_slice(key.as_bytes());
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

pub fn decode_push(frame: &[u8]) -> PushResult<PushFrame> {
    let (flags, seq, key, mut rest) = decode_header(frame, KIND_PUSH)?;
    let compressed = flags & FLAG_GZIP != 0;
    let body = if compressed {
        let mut out = Vec::new();
        GzDecoder::new(rest.chunk())
            .read_to_end(&mut out)
            .map_err(|e| PushError::Codec(format!("gunzip: {e}")))?;
        Bytes::from(out)
    } else {
        rest.copy_to_bytes(rest.remaining())
    };
    Ok(PushFrame {
        seq,
        key,
        compressed,
        body,
    })
}

pub fn encode_ack(seq: u64, key: &str) -> PushResult<Bytes> {
    let key_len = key_len(key)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + key.len());
    buf.put_u8(MAGIC);
    buf.put_u8(KIND_ACK);
    buf.put_u8(VERSION);
    buf.put_u8(0);
    buf.put_u64(seq);
    buf.put_u16(key_len);
    buf.put_slice(key.as_bytes());
    Ok(buf.freeze())
}

pub fn decode_ack(frame: &[u8]) -> PushResult<Ack> {
    let (_, seq, key, rest) = decode_header(frame, KIND_ACK)?;
    if rest.has_remaining() {
        return Err(PushError::Codec(format!(
            "{} trailing bytes after ack",
            rest.remaining()
        )));
    }
    Ok(Ack { seq, key })
}

fn key_len(key: &str) -> PushResult<u16> {
    u16::try_from(key.len()).map_err(|_| PushError::Codec(format!("key of {} bytes", key.len())))
}

fn decode_header(frame: &[u8], kind: u8) -> PushResult<(u8, u64, String, &[u8])> {
    let mut buf = frame;
    if buf.remaining() < HEADER_LEN {
        return Err(PushError::Codec(format!("frame of {} bytes is truncated", frame.len())));
    }
    if buf.get_u8() != MAGIC {
        return Err(PushError::Codec("bad magic".to_string()));
    }
    let found = buf.get_u8();
    if found != kind {
        return Err(PushError::Codec(format!(
            "expected frame kind {:?}, got {:?}",
            kind as char, found as char
        )));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(PushError::Codec(format!("unsupported version {version}")));
    }
    let flags = buf.get_u8();
    let seq = buf.get_u64();
    let key_len = buf.get_u16() as usize;
    if buf.remaining() < key_len {
        return Err(PushError::Codec("key runs past end of frame".to_string()));
    }
    let key = std::str::from_utf8(&buf[..key_len])
        .map_err(|e| PushError::Codec(format!("key is not utf-8: {e}")))?
        .to_string();
    buf.advance(key_len);
    Ok((flags, seq, key, buf))
}
