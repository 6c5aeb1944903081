//! Session manager: keeps the link up without ever blocking the producer
//!
//! # Link state
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                     ▲  │ connect failed   │ connection lost
//!                     │  └─ reconnect delay │
//!                     └──── Disconnected ◄──┘
//!
//! any state ──shutdown()──► Closed
//! ```
//!
//! # Tasks
//!
//! - one supervisor task dials the peer, waits for link loss and redials
//! - one short-lived task per submitted event, holding the shared
//!   [`TransportSession`] for one attempt at a time
//!
//! [`SessionManager::submit`] only spawns; it never waits on the network.
//!
//! # Delivery budget
//!
//! A send task releases the session during its retry delay, so attempts of
//! different events interleave on the stream. Every event has
//! [`TransportSettings::delivery_budget`] from its submission to be
//! acknowledged. Once that passes it is dropped, whether it is waiting for
//! its first attempt or for a retry.

use super::error::TransportError;
use super::session::{Outgoing, TransportSession};
use crate::config::{PeerConfig, TransportSettings};
use crate::event::{EventSink, InputEvent};
use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const OUTCOME_CAPACITY: usize = 256;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub submitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// Established connections that later broke
    pub link_losses: u64,
    pub last_delivery: Option<DateTime<Local>>,
}

/// Final result of one submitted event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { seq: u64 },
    Dropped { reason: String },
}

struct Shared {
    settings: TransportSettings,
    session: Mutex<TransportSession>,
    state: watch::Sender<LinkState>,
    stats: std::sync::Mutex<SessionStats>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    link_lost: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Link state {:?} -> {:?}", previous, next);
        }
    }

    fn record(&self, outcome: DeliveryOutcome) {
        if let Ok(mut stats) = self.stats.lock() {
            match &outcome {
                DeliveryOutcome::Delivered { .. } => {
                    stats.delivered += 1;
                    stats.last_delivery = Some(Local::now());
                }
                DeliveryOutcome::Dropped { .. } => stats.dropped += 1,
            }
        }
        // Nobody listening is fine
        let _ = self.outcomes.send(outcome);
    }

    /// Body of one submission task
    async fn deliver(self: Arc<Self>, event: InputEvent) {
        let deadline = Instant::now() + self.settings.delivery_budget();
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Cancelled),
            result = self.deliver_before(&event, deadline) => result,
        };

        match result {
            Ok(seq) => {
                debug!("Delivered seq {}", seq);
                self.record(DeliveryOutcome::Delivered { seq });
            }
            Err(TransportError::NotConnected) => {
                info!("Dropping event, not connected: {}", event);
                self.record(DeliveryOutcome::Dropped {
                    reason: TransportError::NotConnected.to_string(),
                });
            }
            Err(TransportError::Cancelled) => {
                debug!("Send abandoned by shutdown");
                self.record(DeliveryOutcome::Dropped {
                    reason: TransportError::Cancelled.to_string(),
                });
            }
            Err(e) => {
                warn!("Dropping event: {}", e);
                self.record(DeliveryOutcome::Dropped {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Attempts `event` until acked, out of attempts or past `deadline`
    ///
    /// The session lock covers one write and its ack wait. Sequence
    /// assignment and the first write happen under the same lock, so first
    /// attempts reach the peer in sequence order.
    async fn deliver_before(
        &self,
        event: &InputEvent,
        deadline: Instant,
    ) -> Result<u64, TransportError> {
        let mut session = match timeout_at(deadline, self.session.lock()).await {
            Ok(session) => session,
            Err(_) => return Err(TransportError::Expired(self.settings.delivery_budget())),
        };
        let mut outgoing = session.prepare(event)?;

        loop {
            let was_connected = session.is_connected();
            let failure = match session.transmit(&mut outgoing).await {
                Ok(seq) => return Ok(seq),
                Err(e) => e,
            };
            if was_connected && !session.is_connected() {
                self.link_lost.notify_one();
            }
            session.check_retry(&outgoing, failure)?;
            drop(session);

            tokio::time::sleep(self.settings.retry_delay()).await;
            session = match timeout_at(deadline, self.session.lock()).await {
                Ok(session) if Instant::now() < deadline => session,
                _ => return Err(self.expired(&outgoing)),
            };
        }
    }

    fn expired(&self, outgoing: &Outgoing) -> TransportError {
        warn!(
            "Seq {} older than {}ms after {} attempts, giving up",
            outgoing.seq(),
            self.settings.delivery_budget().as_millis(),
            outgoing.attempts()
        );
        TransportError::DeliveryFailed {
            seq: outgoing.seq(),
            attempts: outgoing.attempts(),
        }
    }

    /// Connect loop; runs until shutdown
    async fn supervise(self: Arc<Self>, peer: PeerConfig) {
        let connect_timeout = self.settings.connect_timeout();
        let reconnect_delay = self.settings.reconnect_delay();
        let label = format!("{}:{}", peer.host, peer.port);

        loop {
            self.set_state(LinkState::Connecting);
            info!("Attempting to connect to {}", label);

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                opened = TransportSession::open(&peer.host, peer.port, connect_timeout) => opened,
            };

            match opened {
                Ok(stream) => {
                    self.session.lock().await.attach(stream, label.clone());
                    self.set_state(LinkState::Connected);
                    if !self.wait_for_link_loss().await {
                        break;
                    }
                    warn!("Connection to {} lost, reconnecting", label);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.link_losses += 1;
                    }
                    self.set_state(LinkState::Disconnected);
                }
                Err(e) => {
                    warn!(
                        "{}. Retrying in {}ms",
                        e,
                        reconnect_delay.as_millis()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }

        self.session.lock().await.close();
        self.set_state(LinkState::Closed);
        info!("Session supervisor for {} stopped", label);
    }

    /// Returns false when woken by shutdown instead of a lost link
    async fn wait_for_link_loss(&self) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.link_lost.notified() => {}
            }
            // A leftover notification from an older connection is ignored
            if !self.session.lock().await.is_connected() {
                return true;
            }
        }
    }
}

/// Owner of the delivery pipeline
///
/// Created once per peer configuration. Dropping the manager cancels its
/// tasks; call [`SessionManager::shutdown`] to also wait for the connection
/// to be closed.
pub struct SessionManager {
    shared: Arc<Shared>,
    tasks: TaskTracker,
    runtime: Handle,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Starts the connect loop on the current tokio runtime
    pub fn spawn(peer: PeerConfig, settings: TransportSettings) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|e| TransportError::Runtime(e.to_string()))?;
        Ok(Self::spawn_on(&runtime, peer, settings))
    }

    /// Starts the connect loop on the given runtime
    ///
    /// The returned manager can be used from threads outside the runtime.
    pub fn spawn_on(runtime: &Handle, peer: PeerConfig, settings: TransportSettings) -> Self {
        info!(
            "Starting session manager for {}:{} with {:?}",
            peer.host, peer.port, settings
        );
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let shared = Arc::new(Shared {
            settings: settings.clone(),
            session: Mutex::new(TransportSession::new(settings)),
            state,
            stats: std::sync::Mutex::new(SessionStats::default()),
            outcomes,
            link_lost: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let supervisor = runtime.spawn(shared.clone().supervise(peer));

        Self {
            shared,
            tasks: TaskTracker::new(),
            runtime: runtime.clone(),
            supervisor: std::sync::Mutex::new(Some(supervisor)),
        }
    }

    /// Hands the event to a background task and returns immediately
    pub fn submit(&self, event: InputEvent) {
        if self.shared.shutdown.is_cancelled() {
            debug!("Session closed, discarding event: {}", event);
            return;
        }
        if let Ok(mut stats) = self.shared.stats.lock() {
            stats.submitted += 1;
        }
        self.tasks
            .spawn_on(self.shared.clone().deliver(event), &self.runtime);
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Receives one [`DeliveryOutcome`] per submitted event from now on
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.shared.outcomes.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Number of submissions still being worked on
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stops the connect loop, abandons pending sends and closes the stream
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            debug!("Session manager already shut down");
        } else {
            info!("Shutting down session manager");
        }
        self.shared.shutdown.cancel();
        self.tasks.close();

        let supervisor = match self.supervisor.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!("Session supervisor panicked: {}", e);
            }
        }
    }
}

impl EventSink for SessionManager {
    fn submit(&self, event: InputEvent) {
        SessionManager::submit(self, event);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fast_settings() -> TransportSettings {
        TransportSettings {
            ack_timeout_ms: 50,
            retry_delay_ms: 10,
            connect_timeout_ms: 200,
            reconnect_delay_ms: 50,
            ..TransportSettings::default()
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn submit_without_peer_drops_and_keeps_connecting() {
        let peer = PeerConfig {
            host: "127.0.0.1".to_string(),
            port: unused_port().await,
        };
        let manager = SessionManager::spawn(peer, fast_settings()).unwrap();
        let mut outcomes = manager.subscribe_outcomes();

        manager.submit(InputEvent::builder().button("A", true).build());

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Dropped { .. }));
        let mut state = manager.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|state| *state == LinkState::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        let stats = manager.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 0);

        manager.shutdown().await;
        assert_eq!(manager.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_later_submits() {
        let peer = PeerConfig {
            host: "127.0.0.1".to_string(),
            port: unused_port().await,
        };
        let manager = SessionManager::spawn(peer, fast_settings()).unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), LinkState::Closed);

        manager.submit(InputEvent::default());
        assert_eq!(manager.stats().submitted, 0);
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn spawn_outside_runtime_is_an_error() {
        let result = SessionManager::spawn(PeerConfig::default(), fast_settings());
        assert!(matches!(result, Err(TransportError::Runtime(_))));
    }
}
