//! Peer Link Integration Tests
//!
//! Drives an Acceptor and an Initiator against each other over localhost
//! TCP: stream establishment, handshake-triggered queue drain, and the
//! reconnect loop.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use syncmq::config::{AcceptorConfig, InitiatorConfig};
use syncmq::peer::{Acceptor, Initiator, PeerCallback, PeerError, PeerLink, PeerStatus};
use syncmq::shutdown::ShutdownCoordinator;
use syncmq::SyncMessage;

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41500);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn acceptor_config(port: u16) -> AcceptorConfig {
    AcceptorConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port,
        tls: None,
        keepalive_interval: Duration::from_secs(60),
    }
}

fn initiator_config(port: u16) -> InitiatorConfig {
    InitiatorConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port,
        tls: None,
        reconnect_interval: Duration::from_millis(100),
        keepalive_interval: Duration::from_secs(60),
    }
}

fn channel_callback() -> (PeerCallback, mpsc::UnboundedReceiver<SyncMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: PeerCallback = Arc::new(move |message| {
        let _ = tx.send(message);
    });
    (callback, rx)
}

fn msg(topic: &str, payload: &[u8]) -> SyncMessage {
    SyncMessage::new(topic, Bytes::copy_from_slice(payload))
}

async fn wait_until(condition: impl Fn() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> SyncMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message received")
        .unwrap()
}

#[tokio::test]
async fn initiator_delivers_to_acceptor() {
    let port = next_port();
    let shutdown = ShutdownCoordinator::new();

    let (acceptor_cb, mut acceptor_rx) = channel_callback();
    let acceptor = Acceptor::new(acceptor_config(port), acceptor_cb, shutdown.clone())
        .await
        .unwrap();
    acceptor.start();

    let (initiator_cb, _initiator_rx) = channel_callback();
    let initiator = Initiator::new(initiator_config(port), initiator_cb, shutdown.clone()).unwrap();
    initiator.start().await.unwrap();

    wait_until(
        || initiator.status() == PeerStatus::Streaming && acceptor.status() == PeerStatus::Streaming,
        "both sides streaming",
    )
    .await;

    initiator
        .send(&msg("sensors/temp", b"{\"v\":21.5}"))
        .await
        .unwrap();

    let received = recv(&mut acceptor_rx).await;
    assert_eq!(received.topic(), "sensors/temp");
    assert_eq!(&received.payload()[..], b"{\"v\":21.5}");

    shutdown.trigger();
    shutdown.wait_idle().await;
}

#[tokio::test]
async fn bidirectional_flow_over_one_stream() {
    let port = next_port();
    let shutdown = ShutdownCoordinator::new();

    let (acceptor_cb, mut acceptor_rx) = channel_callback();
    let acceptor = Acceptor::new(acceptor_config(port), acceptor_cb, shutdown.clone())
        .await
        .unwrap();
    acceptor.start();

    let (initiator_cb, mut initiator_rx) = channel_callback();
    let initiator = Initiator::new(initiator_config(port), initiator_cb, shutdown.clone()).unwrap();
    initiator.start().await.unwrap();

    wait_until(|| acceptor.status() == PeerStatus::Streaming, "stream installed").await;

    initiator.send(&msg("a/b", b"from-initiator")).await.unwrap();
    acceptor.send(&msg("c/d", b"from-acceptor")).await.unwrap();

    let at_acceptor = recv(&mut acceptor_rx).await;
    assert_eq!(at_acceptor.topic(), "a/b");

    let at_initiator = recv(&mut initiator_rx).await;
    assert_eq!(at_initiator.topic(), "c/d");
    assert_eq!(&at_initiator.payload()[..], b"from-acceptor");

    shutdown.trigger();
    shutdown.wait_idle().await;
}

#[tokio::test]
async fn acceptor_buffers_and_drains_on_handshake() {
    let port = next_port();
    let shutdown = ShutdownCoordinator::new();

    let (acceptor_cb, _acceptor_rx) = channel_callback();
    let acceptor = Acceptor::new(acceptor_config(port), acceptor_cb, shutdown.clone())
        .await
        .unwrap();
    acceptor.start();

    // No stream yet: sends fail into the queue, coalescing per topic
    let err = acceptor.send(&msg("sensors/temp", b"old")).await.unwrap_err();
    assert!(matches!(err, PeerError::StreamDisabled));
    let err = acceptor.send(&msg("sensors/temp", b"new")).await.unwrap_err();
    assert!(matches!(err, PeerError::StreamDisabled));
    assert_eq!(acceptor.pending(), 1);

    // The incoming handshake drains the buffer without any new trigger
    let (initiator_cb, mut initiator_rx) = channel_callback();
    let initiator = Initiator::new(initiator_config(port), initiator_cb, shutdown.clone()).unwrap();
    initiator.start().await.unwrap();

    let drained = recv(&mut initiator_rx).await;
    assert_eq!(drained.topic(), "sensors/temp");
    assert_eq!(&drained.payload()[..], b"new");
    assert_eq!(acceptor.pending(), 0);

    // Nothing else was buffered; the overwritten value never arrives
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(initiator_rx.try_recv().is_err());

    shutdown.trigger();
    shutdown.wait_idle().await;
}

#[tokio::test]
async fn initiator_reconnects_until_acceptor_appears() {
    let port = next_port();
    let shutdown = ShutdownCoordinator::new();

    // Nothing is listening yet; the dial fails and schedules a retry
    let (initiator_cb, _initiator_rx) = channel_callback();
    let initiator = Initiator::new(initiator_config(port), initiator_cb, shutdown.clone()).unwrap();
    assert!(initiator.start().await.is_err());
    assert_eq!(initiator.status(), PeerStatus::ReconnectWait);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (acceptor_cb, mut acceptor_rx) = channel_callback();
    let acceptor = Acceptor::new(acceptor_config(port), acceptor_cb, shutdown.clone())
        .await
        .unwrap();
    acceptor.start();

    wait_until(|| initiator.status() == PeerStatus::Streaming, "reconnect").await;

    // The fresh stream carries data immediately after the handshake
    initiator.send(&msg("sensors/temp", b"back")).await.unwrap();
    let received = recv(&mut acceptor_rx).await;
    assert_eq!(&received.payload()[..], b"back");

    shutdown.trigger();
    shutdown.wait_idle().await;
}

#[tokio::test]
async fn initiator_send_without_stream_is_silent() {
    let shutdown = ShutdownCoordinator::new();
    let (callback, _rx) = channel_callback();
    let initiator = Initiator::new(initiator_config(next_port()), callback, shutdown).unwrap();

    // Never started: no stream, no queue, no error
    initiator.send(&msg("sensors/temp", b"lost")).await.unwrap();
    assert_eq!(initiator.status(), PeerStatus::Idle);
}

#[tokio::test]
async fn acceptor_rejects_double_bind() {
    let port = next_port();
    let shutdown = ShutdownCoordinator::new();

    let (first_cb, _rx1) = channel_callback();
    let _first = Acceptor::new(acceptor_config(port), first_cb, shutdown.clone())
        .await
        .unwrap();

    let (second_cb, _rx2) = channel_callback();
    let result = Acceptor::new(acceptor_config(port), second_cb, shutdown).await;
    assert!(matches!(result, Err(PeerError::InvalidConfig(_))));
}
