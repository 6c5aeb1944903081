//! Wire format for the event link
//!
//! [`codec`] turns envelopes and acks into length-prefixed JSON frames and
//! back. It is pure and does no I/O; the transport and the peer both build
//! on it.

pub mod codec;

pub use codec::{
    decode_ack, decode_envelope, encode, encode_ack, encode_limited, frame_len, Envelope,
    FrameError, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
