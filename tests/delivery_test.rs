use padlink::config::{PeerConfig, TransportSettings};
use padlink::event::InputEvent;
use padlink::peer::PeerServer;
use padlink::protocol::{self, DEFAULT_MAX_FRAME_LEN};
use padlink::transport::{DeliveryOutcome, LinkState, SessionManager};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn fast_settings() -> TransportSettings {
    TransportSettings {
        ack_timeout_ms: 50,
        retry_delay_ms: 10,
        connect_timeout_ms: 500,
        reconnect_delay_ms: 50,
        ..TransportSettings::default()
    }
}

fn local_peer(port: u16) -> PeerConfig {
    PeerConfig {
        host: "127.0.0.1".to_string(),
        port,
    }
}

fn sample(index: usize) -> InputEvent {
    InputEvent::builder()
        .button("A", index % 2 == 0)
        .axis("left_x", index as f64 / 100.0)
        .trigger("rt", 0.5)
        .build()
}

async fn wait_for_state(manager: &SessionManager, wanted: LinkState) {
    let mut state = manager.subscribe_state();
    timeout(WAIT, state.wait_for(|state| *state == wanted))
        .await
        .expect("timed out waiting for link state")
        .expect("state channel closed");
}

async fn next_outcome(outcomes: &mut broadcast::Receiver<DeliveryOutcome>) -> DeliveryOutcome {
    timeout(WAIT, outcomes.recv())
        .await
        .expect("timed out waiting for outcome")
        .expect("outcome channel closed")
}

/// Reads one envelope sequence; `None` once the sender closed the socket
async fn read_seq(stream: &mut TcpStream) -> Option<u64> {
    let len = stream.read_u32().await.ok()? as usize;
    let mut frame = (len as u32).to_be_bytes().to_vec();
    frame.resize(4 + len, 0);
    stream.read_exact(&mut frame[4..]).await.ok()?;
    protocol::decode_envelope(&frame).ok().map(|envelope| envelope.seq)
}

/// Acks everything it reads until the sender goes away
async fn ack_forever(mut stream: TcpStream) {
    while let Some(seq) = read_seq(&mut stream).await {
        if stream.write_all(&protocol::encode_ack(seq).unwrap()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn reliable_peer_receives_every_event_once() {
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let server = PeerServer::bind("127.0.0.1", 0, events_tx, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let server_token = CancellationToken::new();
    tokio::spawn(server.run(server_token.clone()));

    let manager = SessionManager::spawn(local_peer(port), fast_settings()).unwrap();
    wait_for_state(&manager, LinkState::Connected).await;
    let mut outcomes = manager.subscribe_outcomes();

    const COUNT: usize = 20;
    for index in 0..COUNT {
        manager.submit(sample(index));
    }

    let mut delivered = HashSet::new();
    for _ in 0..COUNT {
        match next_outcome(&mut outcomes).await {
            DeliveryOutcome::Delivered { seq } => assert!(delivered.insert(seq)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    let mut received = HashSet::new();
    for _ in 0..COUNT {
        let event = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert!(received.insert(event.seq), "seq {} forwarded twice", event.seq);
    }
    assert_eq!(received, delivered);
    assert_eq!(received, (1..=COUNT as u64).collect::<HashSet<u64>>());

    let stats = manager.stats();
    assert_eq!(stats.submitted, COUNT as u64);
    assert_eq!(stats.delivered, COUNT as u64);
    assert_eq!(stats.dropped, 0);
    assert!(stats.last_delivery.is_some());

    manager.shutdown().await;
    server_token.cancel();
}

#[tokio::test]
async fn unanswered_event_is_written_five_times_then_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = SessionManager::spawn(local_peer(port), fast_settings()).unwrap();
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_state(&manager, LinkState::Connected).await;

    let mut outcomes = manager.subscribe_outcomes();
    manager.submit(sample(0));

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(timeout(WAIT, read_seq(&mut stream)).await.unwrap().unwrap());
    }
    assert_eq!(seen, vec![1, 1, 1, 1, 1]);

    let outcome = next_outcome(&mut outcomes).await;
    assert!(
        matches!(&outcome, DeliveryOutcome::Dropped { reason } if reason.contains("5 attempts")),
        "unexpected outcome {:?}",
        outcome
    );

    let sixth = timeout(Duration::from_millis(200), read_seq(&mut stream)).await;
    assert!(sixth.is_err(), "a sixth attempt was written");

    manager.shutdown().await;
}

#[tokio::test]
async fn dropped_link_is_restored_for_later_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = SessionManager::spawn(local_peer(port), fast_settings()).unwrap();

    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_state(&manager, LinkState::Connected).await;
    drop(first);

    let mut outcomes = manager.subscribe_outcomes();
    manager.submit(sample(0));
    assert!(matches!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Dropped { .. }
    ));

    let (second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    tokio::spawn(ack_forever(second));
    wait_for_state(&manager, LinkState::Connected).await;

    manager.submit(sample(1));
    assert!(matches!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Delivered { .. }
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn second_event_is_written_while_first_is_retrying() {
    let settings = TransportSettings {
        ack_timeout_ms: 200,
        ..fast_settings()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = SessionManager::spawn(local_peer(port), settings.clone()).unwrap();
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_state(&manager, LinkState::Connected).await;

    // Silent peer: records every sequence it is sent, never acks
    let (seqs_tx, mut seqs_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(seq) = read_seq(&mut stream).await {
            if seqs_tx.send(seq).is_err() {
                break;
            }
        }
    });

    let mut outcomes = manager.subscribe_outcomes();
    manager.submit(sample(0));
    assert_eq!(timeout(WAIT, seqs_rx.recv()).await.unwrap(), Some(1));
    manager.submit(sample(1));

    assert_eq!(timeout(WAIT, seqs_rx.recv()).await.unwrap(), Some(2));
    assert_eq!(timeout(WAIT, seqs_rx.recv()).await.unwrap(), Some(1));

    // Both give up once their delivery budget is spent
    let mut reasons = Vec::new();
    for _ in 0..2 {
        match timeout(settings.delivery_budget() * 2, outcomes.recv())
            .await
            .unwrap()
            .unwrap()
        {
            DeliveryOutcome::Dropped { reason } => reasons.push(reason),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(
        reasons.iter().all(|reason| reason.starts_with("Delivery of seq")),
        "unexpected reasons {:?}",
        reasons
    );
    assert_eq!(manager.stats().dropped, 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn oversized_reply_drops_event_and_reconnects() {
    let settings = TransportSettings {
        max_frame_len: 1024,
        ..fast_settings()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = SessionManager::spawn(local_peer(port), settings).unwrap();
    let (mut first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_state(&manager, LinkState::Connected).await;

    let mut outcomes = manager.subscribe_outcomes();
    manager.submit(sample(0));
    assert_eq!(timeout(WAIT, read_seq(&mut first)).await.unwrap(), Some(1));
    first.write_all(&2048u32.to_be_bytes()).await.unwrap();

    let outcome = next_outcome(&mut outcomes).await;
    assert!(
        matches!(&outcome, DeliveryOutcome::Dropped { reason } if reason.starts_with("Malformed frame")),
        "unexpected outcome {:?}",
        outcome
    );
    assert_eq!(timeout(WAIT, read_seq(&mut first)).await.unwrap(), None);

    let (second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    tokio::spawn(ack_forever(second));
    wait_for_state(&manager, LinkState::Connected).await;
    assert_eq!(manager.stats().link_losses, 1);

    manager.submit(sample(1));
    assert_eq!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Delivered { seq: 2 }
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn submits_after_link_loss_are_dropped_until_reconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = SessionManager::spawn(local_peer(port), fast_settings()).unwrap();
    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_state(&manager, LinkState::Connected).await;

    // Peer goes away for good
    drop(listener);
    drop(first);

    let mut outcomes = manager.subscribe_outcomes();
    manager.submit(sample(0));
    let lost = next_outcome(&mut outcomes).await;
    assert!(
        matches!(&lost, DeliveryOutcome::Dropped { reason } if reason.starts_with("Connection lost")),
        "unexpected outcome {:?}",
        lost
    );

    wait_for_state(&manager, LinkState::Connecting).await;
    assert_eq!(manager.stats().link_losses, 1);

    manager.submit(sample(1));
    assert_eq!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Dropped {
            reason: "Not connected".to_string()
        }
    );
    assert_ne!(manager.state(), LinkState::Connected);

    let stats = manager.stats();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.delivered, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn events_before_first_connection_are_dropped_not_queued() {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let manager = SessionManager::spawn(local_peer(port), fast_settings()).unwrap();
    let mut outcomes = manager.subscribe_outcomes();

    manager.submit(sample(0));
    assert_eq!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Dropped {
            reason: "Not connected".to_string()
        }
    );

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    tokio::spawn(ack_forever(stream));
    wait_for_state(&manager, LinkState::Connected).await;

    manager.submit(sample(1));
    assert_eq!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Delivered { seq: 1 }
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_interrupts_retrying_send_and_closes_socket() {
    let settings = TransportSettings {
        ack_timeout_ms: 300,
        retry_delay_ms: 200,
        ..fast_settings()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = SessionManager::spawn(local_peer(port), settings).unwrap();
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_state(&manager, LinkState::Connected).await;

    let mut outcomes = manager.subscribe_outcomes();
    manager.submit(sample(0));
    assert_eq!(timeout(WAIT, read_seq(&mut stream)).await.unwrap(), Some(1));

    let started = Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(manager.state(), LinkState::Closed);

    assert_eq!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Dropped {
            reason: "Send cancelled by shutdown".to_string()
        }
    );

    // Socket is closed: the peer reads end of stream
    assert_eq!(timeout(WAIT, read_seq(&mut stream)).await.unwrap(), None);
}
