//! Failure taxonomy of the delivery channel

use crate::protocol::FrameError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while connecting or delivering an event
///
/// None of these ever reach the producer: the session manager logs them and
/// either retries (connect), drops the event (delivery) or reconnects (link
/// loss).
#[derive(Debug, Error)]
pub enum TransportError {
    /// A single connect attempt failed; the manager retries after a delay
    #[error("Connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// No open connection when the send was issued
    #[error("Not connected")]
    NotConnected,

    /// No reply for the pending sequence within the ack timeout
    #[error("No ack for seq {0} within timeout")]
    AckTimeout(u64),

    /// Only acks for other sequences arrived within the ack timeout
    #[error("Expected ack for seq {expected}, last received {received}")]
    AckMismatch { expected: u64, received: u64 },

    /// The reply could not be decoded as an ack frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Every attempt failed; the event is dropped
    #[error("Delivery of seq {seq} failed after {attempts} attempts")]
    DeliveryFailed { seq: u64, attempts: u32 },

    /// The event never got its first attempt within its delivery budget
    #[error("Event not sent within {0:?}")]
    Expired(Duration),

    /// The stream broke while sending; the connection has been closed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The send was abandoned because the manager shut down
    #[error("Send cancelled by shutdown")]
    Cancelled,

    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}

impl TransportError {
    /// Whether another attempt of the same envelope may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::AckTimeout(_)
                | TransportError::AckMismatch { .. }
                | TransportError::MalformedFrame(_)
        )
    }
}
