//! Streams controller input to a remote consumer over an acknowledged,
//! self-healing TCP link.
//!
//! ```text
//! source ──InputEvent──► transport::SessionManager ──frames──► peer::PeerServer
//!                                   ▲                                │
//!                                   └──────────── {"ack": seq} ◄─────┘
//! ```

pub mod config;
pub mod event;
pub mod peer;
pub mod protocol;
pub mod source;
pub mod transport;

pub use config::BridgeConfig;
pub use event::{EventSink, InputEvent};
pub use transport::{SessionManager, TransportError};
