//! Framing: length-prefix (4 bytes LE) + bincode payload. Used for control envelopes and
//! for the preamble at the head of a stream connection.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Envelope, StreamPreamble};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value: T =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((value, LEN_SIZE + len))
}

/// Payload length announced by the prefix at the front of `bytes`.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Encode an envelope into a single frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    encode(envelope)
}

/// Decode one envelope from the front of `bytes`. Returns it and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until a whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    decode(bytes)
}

pub fn encode_preamble(preamble: &StreamPreamble) -> Result<Vec<u8>, FrameEncodeError> {
    encode(preamble)
}

pub fn decode_preamble(bytes: &[u8]) -> Result<(StreamPreamble, usize), FrameDecodeError> {
    decode(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("bincode: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame exceeds {} bytes", MAX_FRAME_LEN)]
    TooLarge,
}

/// `NeedMore` is not an error for a reader; it means keep buffering.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("length prefix exceeds {} bytes", MAX_FRAME_LEN)]
    TooLarge,
    #[error("malformed frame: {0}")]
    Decode(#[from] bincode::Error),
}
