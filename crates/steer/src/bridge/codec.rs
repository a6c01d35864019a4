//! Length-prefixed JSON framing for the control socket.
//!
//! Frames are a 4-byte big-endian length followed by a JSON body. The framing
//! is deliberately not wrapped in a tokio codec: descriptor-bearing frames
//! have to go through `sendmsg`/`recvmsg` so the ancillary data stays attached
//! to the right bytes, and that rules out handing the stream to a
//! `FramedRead`/`FramedWrite` pair.

use std::io;

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Control frames are tiny; anything larger is a corrupted stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode a message into a complete frame (prefix + JSON body).
pub fn encode<T: Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body of {} bytes exceeds limit", body.len()),
        ));
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to decode one message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// the consumed bytes are removed from `buf` only on a successful decode.
pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> io::Result<Option<T>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&buf[..LEN_PREFIX]);
    let body_len = u32::from_be_bytes(len_bytes) as usize;

    if body_len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {body_len} exceeds limit"),
        ));
    }
    if buf.len() < LEN_PREFIX + body_len {
        return Ok(None);
    }

    buf.advance(LEN_PREFIX);
    let body = buf.split_to(body_len);
    let msg = serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}
