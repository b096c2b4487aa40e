//! Broker Module Tests

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::MqttConfig;
use crate::shutdown::ShutdownCoordinator;

use super::packet::{self, Packet};
use super::{topic_matches_filter, LocalBroker, MqttClient};

// =============================================================================
// Packet Codec Tests
// =============================================================================

#[test]
fn test_encode_connect_layout() {
    let data = packet::encode_connect("bridge-1", None, None, 60);

    assert_eq!(data[0], 0x10); // CONNECT
    assert_eq!(data[1] as usize, data.len() - 2); // remaining length
    assert_eq!(&data[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
    assert_eq!(data[8], 0x04); // protocol level
    assert_eq!(data[9], 0x02); // clean session only
    assert_eq!(&data[10..12], &[0x00, 60]); // keep alive
}

#[test]
fn test_encode_connect_credential_flags() {
    let data = packet::encode_connect("c", Some("user"), Some("pass"), 30);
    assert_eq!(data[9], 0x02 | 0x80 | 0x40);
}

#[test]
fn test_publish_roundtrip() {
    let encoded = packet::encode_publish("sensors/temp", b"{\"v\":21.5}");

    let mut buf = BytesMut::from(&encoded[..]);
    let decoded = packet::decode(&mut buf).unwrap().unwrap();

    match decoded {
        Packet::Publish { topic, payload } => {
            assert_eq!(topic, "sensors/temp");
            assert_eq!(&payload[..], b"{\"v\":21.5}");
        }
        other => panic!("unexpected packet: {:?}", other),
    }
    assert!(buf.is_empty());
}

#[test]
fn test_decode_partial_packet_needs_more() {
    let encoded = packet::encode_publish("t", b"payload");

    let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
    assert!(packet::decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&encoded[encoded.len() - 3..]);
    assert!(packet::decode(&mut buf).unwrap().is_some());
}

#[test]
fn test_decode_connack() {
    let mut buf = BytesMut::from(&[0x20, 0x02, 0x01, 0x00][..]);
    let decoded = packet::decode(&mut buf).unwrap().unwrap();
    assert_eq!(
        decoded,
        Packet::ConnAck {
            session_present: true,
            return_code: 0
        }
    );
}

#[test]
fn test_decode_connack_refused() {
    let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x05][..]);
    let decoded = packet::decode(&mut buf).unwrap().unwrap();
    assert_eq!(
        decoded,
        Packet::ConnAck {
            session_present: false,
            return_code: 5
        }
    );
}

#[test]
fn test_decode_suback() {
    let mut buf = BytesMut::from(&[0x90, 0x03, 0x00, 0x0A, 0x00][..]);
    let decoded = packet::decode(&mut buf).unwrap().unwrap();
    assert_eq!(
        decoded,
        Packet::SubAck {
            packet_id: 10,
            return_codes: vec![0]
        }
    );
}

#[test]
fn test_decode_skips_unconsumed_packet_types() {
    // PUBACK (0x40) is not consumed by the client; the PINGRESP behind it is
    let mut buf = BytesMut::from(&[0x40, 0x02, 0x00, 0x01, 0xD0, 0x00][..]);
    let decoded = packet::decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, Packet::PingResp);
    assert!(buf.is_empty());
}

#[test]
fn test_decode_multibyte_remaining_length() {
    let payload = vec![0x42u8; 300];
    let encoded = packet::encode_publish("big", &payload);

    // 2-byte varint for remaining length > 127
    assert!(encoded[1] & 0x80 != 0);

    let mut buf = BytesMut::from(&encoded[..]);
    match packet::decode(&mut buf).unwrap().unwrap() {
        Packet::Publish { payload: decoded, .. } => assert_eq!(decoded.len(), 300),
        other => panic!("unexpected packet: {:?}", other),
    }
}

// =============================================================================
// Topic Filter Tests
// =============================================================================

#[test]
fn test_topic_filter_exact() {
    assert!(topic_matches_filter("sensors/temp", "sensors/temp"));
    assert!(!topic_matches_filter("sensors/temp", "sensors/humidity"));
    assert!(!topic_matches_filter("sensors/temp", "sensors"));
    assert!(!topic_matches_filter("sensors", "sensors/temp"));
}

#[test]
fn test_topic_filter_single_level_wildcard() {
    assert!(topic_matches_filter("sensors/kitchen/temp", "sensors/+/temp"));
    assert!(!topic_matches_filter("sensors/kitchen/humidity", "sensors/+/temp"));
    assert!(!topic_matches_filter("sensors/a/b/temp", "sensors/+/temp"));
}

#[test]
fn test_topic_filter_multi_level_wildcard() {
    assert!(topic_matches_filter("sensors/temp", "sensors/#"));
    assert!(topic_matches_filter("sensors/a/b/c", "sensors/#"));
    assert!(topic_matches_filter("sensors", "sensors/#"));
    assert!(!topic_matches_filter("actuators/fan", "sensors/#"));
    assert!(topic_matches_filter("anything/at/all", "#"));
}

// =============================================================================
// Client Tests
// =============================================================================

fn test_config(port: u16) -> MqttConfig {
    MqttConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "test".to_string(),
        timeout: Duration::from_secs(2),
        connect_retry_interval: Duration::from_millis(100),
        keep_alive: 60,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_client_connects_and_publishes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Consume the CONNECT, then accept the session
        let mut buf = BytesMut::with_capacity(4096);
        stream.read_buf(&mut buf).await.unwrap();
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        // Wait for a PUBLISH to arrive
        let mut buf = BytesMut::new();
        loop {
            match packet::decode(&mut buf) {
                Ok(Some(Packet::Publish { topic, payload })) => {
                    assert_eq!(topic, "sensors/temp");
                    assert_eq!(&payload[..], b"{\"v\":1}");
                    return;
                }
                Ok(_) | Err(_) => {}
            }
            if stream.read_buf(&mut buf).await.unwrap() == 0 {
                panic!("client closed before publishing");
            }
        }
    });

    let shutdown = ShutdownCoordinator::new();
    let client = MqttClient::new(test_config(port), shutdown.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.set_connect_handler(Arc::new(move || {
        let _ = tx.send(());
    }));

    client.connect().await;
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("connect handler not fired");
    assert!(client.is_connected());

    client.publish("sensors/temp", b"{\"v\":1}").await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), broker)
        .await
        .expect("broker did not receive publish")
        .unwrap();

    shutdown.trigger();
    shutdown.wait_idle().await;
}

#[tokio::test]
async fn test_publish_without_session_fails() {
    let shutdown = ShutdownCoordinator::new();
    let client = MqttClient::new(test_config(1), shutdown).unwrap();

    let result = client.publish("t", b"x").await;
    assert!(matches!(result, Err(super::BrokerError::NotConnected)));
}
