//! Reliable delivery of controller samples
//!
//! - [`session`] owns one connection and pushes a single event through it
//!   with ack, retry and timeout
//! - [`manager`] keeps that session connected from a background task and
//!   turns producer submissions into independent send tasks
//!
//! # Architecture
//!
//! ```text
//! Producer ──submit()──► SessionManager ──spawn──► send task ──lock──► TransportSession ──► peer
//!                              │                                            ▲
//!                              └── supervisor: connect / reconnect ─────────┘
//! ```
//!
//! Failures stay inside this module. The producer only ever sees a
//! `submit` call that returns immediately.

pub mod error;
pub mod manager;
pub mod session;

pub use error::TransportError;
pub use manager::{DeliveryOutcome, LinkState, SessionManager, SessionStats};
pub use session::{ByteStream, Outgoing, TransportSession};
