//! Length-prefixed JSON frames
//!
//! Every message on the link is a 4-byte big-endian length `L` followed by
//! `L` bytes of UTF-8 JSON.
//!
//! ```text
//! client -> peer   [len: u32 BE]{"seq": 7, "payload": {"buttons": {...}, "axes": {...}, "triggers": {...}}}
//! peer -> client   [len: u32 BE]{"ack": 7}
//! ```

use crate::event::InputEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Size of the big-endian length prefix
pub const HEADER_LEN: usize = 4;

/// Upper bound on a frame body unless configured otherwise
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// A frame that could not be produced or understood
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame header incomplete: {0} bytes available")]
    ShortHeader(usize),

    #[error("Frame length mismatch: header declares {declared} bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    #[error("Frame body of {0} bytes exceeds limit of {1} bytes")]
    TooLarge(usize, usize),

    #[error("Frame body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Ack frame has no 'ack' field")]
    MissingAck,

    #[error("Ack field is not an unsigned sequence number: {0}")]
    InvalidAck(String),
}

/// A sequence-numbered wrapper around one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub payload: InputEvent,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, P: Serialize> {
    seq: u64,
    payload: &'a P,
}

#[derive(Serialize)]
struct AckFrame {
    ack: u64,
}

/// Encodes `{seq, payload}` as one length-prefixed frame
pub fn encode<P: Serialize>(sequence: u64, payload: &P) -> Result<Vec<u8>, FrameError> {
    encode_limited(sequence, payload, DEFAULT_MAX_FRAME_LEN)
}

/// Like [`encode`], rejecting bodies longer than `max_len`
pub fn encode_limited<P: Serialize>(
    sequence: u64,
    payload: &P,
    max_len: usize,
) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(&EnvelopeRef {
        seq: sequence,
        payload,
    })?;
    with_header(body, max_len)
}

/// Encodes the peer's `{ack: sequence}` reply
pub fn encode_ack(sequence: u64) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(&AckFrame { ack: sequence })?;
    with_header(body, DEFAULT_MAX_FRAME_LEN)
}

/// Decodes a complete envelope frame, header included
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, FrameError> {
    let body = body_of(bytes)?;
    Ok(serde_json::from_slice(body)?)
}

/// Decodes a complete ack frame and returns the acknowledged sequence
///
/// The sequence may arrive as an integer, a float with no fractional part
/// (`42.0`) or a numeric string; all normalize to `u64`.
pub fn decode_ack(bytes: &[u8]) -> Result<u64, FrameError> {
    let body = body_of(bytes)?;
    let value: Value = serde_json::from_slice(body)?;
    let ack = value.get("ack").ok_or(FrameError::MissingAck)?;
    normalize_sequence(ack)
}

/// Total length of the first frame in `buf` once it is fully buffered
///
/// Returns `Ok(None)` while more bytes are needed. A declared body larger than
/// `max_len` is rejected before any of it is read.
pub fn frame_len(buf: &[u8], max_len: usize) -> Result<Option<usize>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let declared = declared_len(buf);
    if declared > max_len {
        return Err(FrameError::TooLarge(declared, max_len));
    }
    let total = HEADER_LEN + declared;
    if buf.len() < total {
        Ok(None)
    } else {
        Ok(Some(total))
    }
}

fn with_header(body: Vec<u8>, max_len: usize) -> Result<Vec<u8>, FrameError> {
    if body.len() > max_len {
        return Err(FrameError::TooLarge(body.len(), max_len));
    }
    let declared = u32::try_from(body.len())
        .map_err(|_| FrameError::TooLarge(body.len(), u32::MAX as usize))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&declared.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn declared_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

fn body_of(bytes: &[u8]) -> Result<&[u8], FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::ShortHeader(bytes.len()));
    }
    let declared = declared_len(bytes);
    let available = bytes.len() - HEADER_LEN;
    if declared != available {
        return Err(FrameError::LengthMismatch {
            declared,
            available,
        });
    }
    Ok(&bytes[HEADER_LEN..])
}

fn normalize_sequence(value: &Value) -> Result<u64, FrameError> {
    match value {
        Value::Number(number) => {
            if let Some(seq) = number.as_u64() {
                return Ok(seq);
            }
            match number.as_f64() {
                // u64::MAX rounds up to 2^64 as f64, so the bound is exclusive
                Some(float) if float >= 0.0 && float.fract() == 0.0 && float < u64::MAX as f64 => {
                    Ok(float as u64)
                }
                _ => Err(FrameError::InvalidAck(number.to_string())),
            }
        }
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| FrameError::InvalidAck(text.clone())),
        other => Err(FrameError::InvalidAck(other.to_string())),
    }
}
