//! Transport session: one connection, one event in flight
//!
//! A [`TransportSession`] owns at most one open byte stream and pushes one
//! event at a time through it:
//!
//! ```text
//! send(event)
//!   │  assign seq, encode envelope
//!   ▼
//! write frame ──► wait for {"ack": seq} ──► Ok(seq)
//!   ▲                  │ timeout / stale ack / bad frame
//!   │                  ▼
//!   └── retry delay ◄── retry_count < max_retries
//!                      │ otherwise
//!                      ▼
//!                 DeliveryFailed
//! ```
//!
//! Retries rewrite the identical frame, so the peer sees the same sequence
//! number on every attempt. Reconnecting is not done here; a session that
//! lost its stream answers [`TransportError::NotConnected`] until someone
//! calls [`TransportSession::connect`] or [`TransportSession::attach`].
//!
//! [`TransportSession::send`] runs the whole loop above. Callers that share a
//! session between several events drive the steps themselves with
//! [`TransportSession::prepare`], [`TransportSession::transmit`] and
//! [`TransportSession::check_retry`], letting other envelopes use the stream
//! during a retry delay.

use super::error::TransportError;
use crate::config::TransportSettings;
use crate::event::InputEvent;
use crate::protocol::{self, FrameError};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 1024;

/// Any bidirectional byte stream the session can frame over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Open stream plus bytes received but not yet framed
struct Connection {
    stream: Box<dyn ByteStream>,
    label: String,
    read_buf: Vec<u8>,
    // Set while a frame write is underway; still set at the next send means
    // the previous write was abandoned halfway
    write_in_progress: bool,
}

enum ReadFailure {
    Io(io::Error),
    Closed,
    Frame(FrameError),
}

impl Connection {
    fn new(stream: Box<dyn ByteStream>, label: String) -> Self {
        Self {
            stream,
            label,
            read_buf: Vec::with_capacity(READ_CHUNK),
            write_in_progress: false,
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_in_progress = true;
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        self.write_in_progress = false;
        Ok(())
    }

    /// Reads until one whole frame is buffered
    ///
    /// Bytes are only appended after a read completes, so dropping this future
    /// on timeout never loses or splits data.
    async fn read_frame(&mut self, max_len: usize) -> Result<Vec<u8>, ReadFailure> {
        loop {
            if let Some(len) =
                protocol::frame_len(&self.read_buf, max_len).map_err(ReadFailure::Frame)?
            {
                return Ok(self.read_buf.drain(..len).collect());
            }
            let mut chunk = [0u8; READ_CHUNK];
            let read = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(ReadFailure::Io)?;
            if read == 0 {
                return Err(ReadFailure::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }
}

/// An envelope with its sequence number assigned, ready to be (re)written
#[derive(Debug, Clone)]
pub struct Outgoing {
    seq: u64,
    frame: Vec<u8>,
    attempts: u32,
}

impl Outgoing {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Writes made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Mutable state of one logical link
pub struct TransportSession {
    settings: TransportSettings,
    connection: Option<Connection>,
    next_seq: u64,
    pending: Option<u64>,
    retry_count: u32,
}

impl TransportSession {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            connection: None,
            next_seq: 1,
            pending: None,
            retry_count: 0,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Opens a TCP stream without touching any session
    ///
    /// Lets a supervisor dial without holding the session while the
    /// handshake is in progress.
    pub async fn open(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<TcpStream, TransportError> {
        let addr = format!("{}:{}", host, port);
        debug!("Attempting to connect to {}", addr);
        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectFailed {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectFailed {
                    addr,
                    reason: format!("timed out after {}ms", connect_timeout.as_millis()),
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        Ok(stream)
    }

    /// Single connect attempt; no retry here
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<(), TransportError> {
        let stream = Self::open(host, port, connect_timeout).await?;
        self.attach(stream, format!("{}:{}", host, port));
        Ok(())
    }

    /// Adopts a stream that was opened elsewhere
    pub fn attach<S: ByteStream + 'static>(&mut self, stream: S, label: impl Into<String>) {
        let label = label.into();
        if let Some(old) = self.connection.take() {
            info!("Replacing connection to {} with {}", old.label, label);
        }
        info!("Connected to {}", label);
        self.connection = Some(Connection::new(Box::new(stream), label));
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Drops the stream and any pending envelope
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!("Closing connection to {}", connection.label);
        }
        if let Some(seq) = self.pending.take() {
            debug!("Abandoning pending seq {}", seq);
        }
        self.retry_count = 0;
    }

    /// Sequence number the next originated envelope will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    /// Sequence whose attempt is currently awaiting its ack, if any
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// Retries made for the most recently transmitted envelope
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delivers one event and waits for its ack
    ///
    /// Returns the acknowledged sequence number. Fails immediately with
    /// [`TransportError::NotConnected`] when no stream is open, without
    /// consuming a sequence number.
    pub async fn send(&mut self, event: &InputEvent) -> Result<u64, TransportError> {
        let mut outgoing = self.prepare(event)?;
        loop {
            match self.transmit(&mut outgoing).await {
                Ok(seq) => return Ok(seq),
                Err(e) => self.check_retry(&outgoing, e)?,
            }
            tokio::time::sleep(self.settings.retry_delay()).await;
        }
    }

    /// Assigns the next sequence number and encodes the envelope
    pub fn prepare(&mut self, event: &InputEvent) -> Result<Outgoing, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(stale) = self.pending.take() {
            debug!("Previous send for seq {} was abandoned", stale);
        }

        let seq = self.next_seq;
        let frame = protocol::encode_limited(seq, event, self.settings.max_frame_len)?;
        self.next_seq += 1;
        debug!("Prepared seq {} ({} bytes): {}", seq, frame.len(), event);
        Ok(Outgoing {
            seq,
            frame,
            attempts: 0,
        })
    }

    /// Writes the envelope once and waits for its ack
    ///
    /// Other envelopes may be transmitted between two calls for the same
    /// `outgoing`; acks meant for them are discarded here.
    pub async fn transmit(&mut self, outgoing: &mut Outgoing) -> Result<u64, TransportError> {
        self.ensure_writable()?;
        outgoing.attempts += 1;
        self.retry_count = outgoing.attempts - 1;
        self.pending = Some(outgoing.seq);
        let result = self.attempt(outgoing.seq, &outgoing.frame).await;
        self.pending = None;
        result.map(|()| {
            debug!(
                "Received ack for seq {} after {} retries",
                outgoing.seq, self.retry_count
            );
            outgoing.seq
        })
    }

    /// Decides whether `outgoing` gets another attempt after `error`
    ///
    /// `Ok` means retry after the retry delay. Errors that closed the
    /// connection are passed through, an exhausted budget becomes
    /// [`TransportError::DeliveryFailed`].
    pub fn check_retry(
        &self,
        outgoing: &Outgoing,
        error: TransportError,
    ) -> Result<(), TransportError> {
        if !error.is_retryable() || !self.is_connected() {
            return Err(error);
        }
        let max_attempts = self.settings.max_retries;
        warn!(
            "Send attempt {}/{} for seq {} failed: {}",
            outgoing.attempts, max_attempts, outgoing.seq, error
        );
        if outgoing.attempts >= max_attempts {
            warn!(
                "Failed to send seq {} after {} tries",
                outgoing.seq, outgoing.attempts
            );
            return Err(TransportError::DeliveryFailed {
                seq: outgoing.seq,
                attempts: outgoing.attempts,
            });
        }
        Ok(())
    }

    fn ensure_writable(&mut self) -> Result<(), TransportError> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        if connection.write_in_progress {
            warn!(
                "Previous frame to {} was cut off mid-write, dropping connection",
                connection.label
            );
            self.close();
            return Err(TransportError::ConnectionLost(
                "previous frame was cut off mid-write".to_string(),
            ));
        }
        Ok(())
    }

    /// One write plus ack wait
    async fn attempt(&mut self, seq: u64, frame: &[u8]) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(TransportError::NotConnected)?;
        if let Err(e) = connection.write_frame(frame).await {
            let reason = format!("write failed: {}", e);
            self.close();
            return Err(TransportError::ConnectionLost(reason));
        }
        self.await_ack(seq).await
    }

    async fn await_ack(&mut self, seq: u64) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.settings.ack_timeout();
        let max_len = self.settings.max_frame_len;
        let mut mismatched = None;

        loop {
            let connection = self
                .connection
                .as_mut()
                .ok_or(TransportError::NotConnected)?;

            let read = timeout_at(deadline, connection.read_frame(max_len)).await;
            let frame = match read {
                Err(_) => {
                    return Err(match mismatched {
                        Some(received) => TransportError::AckMismatch {
                            expected: seq,
                            received,
                        },
                        None => TransportError::AckTimeout(seq),
                    })
                }
                Ok(Err(failure)) => {
                    self.close();
                    return Err(match failure {
                        ReadFailure::Io(e) => {
                            TransportError::ConnectionLost(format!("read failed: {}", e))
                        }
                        ReadFailure::Closed => {
                            TransportError::ConnectionLost("peer closed the stream".to_string())
                        }
                        // Cannot resynchronise past a bogus length prefix
                        ReadFailure::Frame(e) => TransportError::MalformedFrame(e),
                    });
                }
                Ok(Ok(frame)) => frame,
            };

            match protocol::decode_ack(&frame)? {
                ack if ack == seq => return Ok(()),
                ack => {
                    warn!("Discarding ack for seq {} while waiting for {}", ack, seq);
                    mismatched = Some(ack);
                }
            }
        }
    }
}
