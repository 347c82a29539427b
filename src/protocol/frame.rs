//! Binary envelope shared by requests and responses
//!
//! On the wire every frame is `u32 length | u32 code | u64 sync | body`, all
//! integers big-endian. A `Link` carries whole frames without the length
//! prefix; the prefix only exists on stream transports.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of `code` + `sync`
pub const HEADER_LEN: usize = 12;

/// Upper bound on a single frame, guards against garbage length prefixes
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),
    #[error("Frame length {0} exceeds limit")]
    TooLarge(usize),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub sync: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn new(code: u32, sync: u64, body: Bytes) -> Self {
        Self { code, sync, body }
    }

    /// Encode header and body (no length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        buf.put_u32(self.code);
        buf.put_u64(self.sync);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a frame produced by [`Frame::encode`]
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }
        let code = buf.get_u32();
        let sync = buf.get_u64();
        Ok(Self { code, sync, body: buf })
    }
}

/// Append `payload` to `dst` with its length prefix
pub fn write_length_prefixed(dst: &mut BytesMut, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    dst.reserve(LENGTH_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Split one length-prefixed payload off the front of `src`.
///
/// Returns `Ok(None)` while the buffer holds an incomplete frame.
pub fn read_length_prefixed(src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    if src.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    if src.len() < LENGTH_PREFIX + len {
        src.reserve(LENGTH_PREFIX + len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX);
    Ok(Some(src.split_to(len).freeze()))
}
