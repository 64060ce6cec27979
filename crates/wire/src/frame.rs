//! Length-prefixed frame codec.
//!
//! Frames on the venue channel are `[uint32 big-endian length][payload]`.
//! `deframe` works against a caller-held accumulator so partial reads can
//! be appended and re-parsed as more bytes arrive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Wrap a payload in exactly one frame.
pub fn frame(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out
}

/// Consume zero or more complete frames from the accumulator.
///
/// The unconsumed tail stays in `buf`; callers append newly read bytes and
/// call again. A declared length of zero is treated as malformed and stops
/// parsing with the tail preserved, so the connection layer can log and
/// tear the channel down.
pub fn deframe(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < LENGTH_PREFIX_BYTES {
            break;
        }
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_BYTES]);
        let declared = u32::from_be_bytes(prefix) as usize;
        if declared == 0 {
            break;
        }
        if buf.len() < LENGTH_PREFIX_BYTES + declared {
            break;
        }
        buf.advance(LENGTH_PREFIX_BYTES);
        frames.push(buf.split_to(declared).freeze());
    }
    frames
}
