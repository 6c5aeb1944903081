//! Receiving end of the event link
//!
//! Accepts sender connections, decodes envelopes, forwards every new sample
//! to a channel and answers each envelope with `{"ack": seq}`. What the
//! consumer does with the samples (virtual gamepad, emulator input, logging)
//! is up to whoever drains the channel.
//!
//! Per connection the peer remembers the most recent forwarded sequences. A
//! retry of one of them is acknowledged again but not forwarded twice, even
//! when attempts of different envelopes arrive interleaved.
//! Envelopes whose JSON cannot be parsed are logged and left unacknowledged,
//! which makes the sender retry them.

use crate::event::InputEvent;
use crate::protocol::{self, HEADER_LEN};
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

// Sequences remembered per connection for duplicate suppression
const DEDUP_WINDOW: usize = 256;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("Failed to accept connection: {0}")]
    Accept(io::Error),
}

/// One sample as it arrived at the peer
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub client: SocketAddr,
    pub seq: u64,
    pub event: InputEvent,
}

pub struct PeerServer {
    listener: TcpListener,
    events: mpsc::Sender<ReceivedEvent>,
    max_frame_len: usize,
}

impl PeerServer {
    pub async fn bind(
        host: &str,
        port: u16,
        events: mpsc::Sender<ReceivedEvent>,
        max_frame_len: usize,
    ) -> Result<Self, PeerError> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| PeerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("Listening on {}", addr);
        Ok(Self {
            listener,
            events,
            max_frame_len,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `shutdown` fires, one task per client
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PeerError> {
        let clients = TaskTracker::new();
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted.map_err(PeerError::Accept)?,
            };
            info!("Client {} connected", addr);
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }

            let events = self.events.clone();
            let token = shutdown.clone();
            let max_len = self.max_frame_len;
            clients.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => debug!("Dropping client {} on shutdown", addr),
                    result = serve_client(stream, addr, events, max_len) => {
                        if let Err(e) = result {
                            warn!("Connection error with {}: {}", addr, e);
                        }
                    }
                }
                info!("Client {} disconnected", addr);
            });
        }

        clients.close();
        clients.wait().await;
        info!("Peer server stopped");
        Ok(())
    }
}

async fn serve_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::Sender<ReceivedEvent>,
    max_len: usize,
) -> io::Result<()> {
    let mut forwarded = BTreeSet::new();

    while let Some(frame) = read_frame(&mut stream, max_len).await? {
        let envelope = match protocol::decode_envelope(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", addr, e);
                continue;
            }
        };
        let seq = envelope.seq;
        debug!("Received seq {} from {}: {}", seq, addr, envelope.payload);

        if forwarded.contains(&seq) {
            debug!("Duplicate seq {} from {}, acknowledging again", seq, addr);
        } else {
            forwarded.insert(seq);
            if forwarded.len() > DEDUP_WINDOW {
                forwarded.pop_first();
            }
            let received = ReceivedEvent {
                client: addr,
                seq,
                event: envelope.payload.normalized(),
            };
            if events.send(received).await.is_err() {
                error!("Event consumer is gone, seq {} not forwarded", seq);
            }
        }

        let ack = protocol::encode_ack(seq)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stream.write_all(&ack).await?;
        stream.flush().await?;
    }
    Ok(())
}

/// Reads one frame, header included; `None` on clean end of stream
async fn read_frame(stream: &mut TcpStream, max_len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_len),
        ));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&header);
    frame.resize(HEADER_LEN + len, 0);
    stream.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(Some(frame))
}
