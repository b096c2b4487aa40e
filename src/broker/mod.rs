//! Local Broker Client
//!
//! Minimal MQTT v3.1.1 client for the local broker side of the bridge:
//! connect with automatic retry, QoS 0 publish, topic subscriptions
//! dispatched to installed handlers, and connect/disconnect callbacks.
//! The bridge core depends only on the [`LocalBroker`] surface, not on
//! the MQTT wire protocol.

mod packet;

#[cfg(test)]
mod tests;

pub use packet::{Packet, PacketError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::tls::client_connector;

/// Handler invoked for each message arriving on a subscribed topic
pub type BrokerMessageHandler = Arc<dyn Fn(String, Bytes) + Send + Sync>;

/// Callback invoked when the broker session is (re)established
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked when the broker session is lost
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Error type for broker client operations
#[derive(Debug)]
pub enum BrokerError {
    /// No broker session is currently established
    NotConnected,
    /// Connection failed or was lost
    ConnectionLost(String),
    /// Broker refused the connection (CONNACK return code)
    Refused(u8),
    /// Operation timed out
    Timeout,
    /// Protocol violation
    Protocol(String),
    /// Invalid configuration
    InvalidConfig(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::NotConnected => write!(f, "not connected"),
            BrokerError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            BrokerError::Refused(code) => write!(f, "connection refused (code {})", code),
            BrokerError::Timeout => write!(f, "operation timed out"),
            BrokerError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            BrokerError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// The broker surface the bridge core depends on.
#[async_trait]
pub trait LocalBroker: Send + Sync {
    /// Publish at QoS 0
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Subscribe and install the handler for matching messages
    async fn subscribe(&self, filter: &str, handler: BrokerMessageHandler)
        -> Result<(), BrokerError>;
}

/// Check whether a topic matches an MQTT topic filter with `+`/`#`
/// wildcards.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_parts = topic.split('/');
    let mut filter_parts = filter.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BrokerReader = ReadHalf<Box<dyn Transport>>;
type BrokerWriter = WriteHalf<Box<dyn Transport>>;

/// MQTT client for the local broker.
pub struct MqttClient {
    config: MqttConfig,
    client_id: String,
    writer: tokio::sync::Mutex<Option<BrokerWriter>>,
    subscriptions: RwLock<HashMap<String, BrokerMessageHandler>>,
    connect_handler: Mutex<Option<ConnectCallback>>,
    disconnect_handler: Mutex<Option<DisconnectCallback>>,
    connected: AtomicBool,
    next_packet_id: AtomicU16,
    /// Incremented on every established session; a read loop only tears
    /// down the session it was spawned for.
    generation: AtomicU64,
    /// At most one reconnect task is pending at a time.
    reconnect_pending: AtomicBool,
    shutdown: ShutdownCoordinator,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    weak: Weak<MqttClient>,
}

impl MqttClient {
    /// Create the client. Malformed TLS material is a fatal configuration
    /// error.
    pub fn new(config: MqttConfig, shutdown: ShutdownCoordinator) -> Result<Arc<Self>, BrokerError> {
        let tls = match &config.tls {
            Some(tls_cfg) => {
                let connector = client_connector(tls_cfg)
                    .map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;
                let name = tls_cfg
                    .server_name
                    .clone()
                    .unwrap_or_else(|| config.host.clone());
                let server_name = ServerName::try_from(name).map_err(|e| {
                    BrokerError::InvalidConfig(format!("invalid server name: {}", e))
                })?;
                Some((connector, server_name))
            }
            None => None,
        };

        // Keep reconnecting instances distinct on the broker
        let client_id = format!("{}-{}", config.client_id, std::process::id());

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            client_id,
            writer: tokio::sync::Mutex::new(None),
            subscriptions: RwLock::new(HashMap::new()),
            connect_handler: Mutex::new(None),
            disconnect_handler: Mutex::new(None),
            connected: AtomicBool::new(false),
            next_packet_id: AtomicU16::new(1),
            generation: AtomicU64::new(0),
            reconnect_pending: AtomicBool::new(false),
            shutdown,
            tls,
            weak: weak.clone(),
        }))
    }

    pub fn set_connect_handler(&self, callback: ConnectCallback) {
        *self.connect_handler.lock() = Some(callback);
    }

    pub fn set_disconnect_handler(&self, callback: DisconnectCallback) {
        *self.disconnect_handler.lock() = Some(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_packet_id(&self) -> u16 {
        let id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            self.next_packet_id.fetch_add(1, Ordering::SeqCst)
        } else {
            id
        }
    }

    /// Establish the broker session. A failed attempt schedules a retry
    /// on the configured interval; the client keeps retrying until
    /// shutdown.
    pub async fn connect(&self) {
        if self.shutdown.is_shutdown() {
            return;
        }
        if let Err(e) = self.attempt_connect().await {
            warn!(addr = %self.config.address(), "MQTT connect failed: {}", e);
            self.schedule_reconnect();
        }
    }

    async fn attempt_connect(&self) -> Result<(), BrokerError> {
        let addr = self.config.address();

        let tcp = timeout(self.config.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::Timeout)?
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;

        let stream: Box<dyn Transport> = match &self.tls {
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        let (mut reader, mut writer) = tokio::io::split(stream);

        let connect = packet::encode_connect(
            &self.client_id,
            self.config.username.as_deref(),
            self.config.password.as_deref(),
            self.config.keep_alive,
        );
        writer
            .write_all(&connect)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;

        // Wait for CONNACK before installing the session
        let mut buf = BytesMut::with_capacity(4096);
        let connack = timeout(self.config.timeout, async {
            loop {
                if let Some(pkt) =
                    packet::decode(&mut buf).map_err(|e| BrokerError::Protocol(e.to_string()))?
                {
                    return Ok::<Packet, BrokerError>(pkt);
                }
                let n = reader
                    .read_buf(&mut buf)
                    .await
                    .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;
                if n == 0 {
                    return Err(BrokerError::ConnectionLost(
                        "connection closed".to_string(),
                    ));
                }
            }
        })
        .await
        .map_err(|_| BrokerError::Timeout)??;

        match connack {
            Packet::ConnAck { return_code: 0, .. } => {}
            Packet::ConnAck { return_code, .. } => return Err(BrokerError::Refused(return_code)),
            _ => return Err(BrokerError::Protocol("expected CONNACK".to_string())),
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        info!(addr = %addr, client_id = %self.client_id, "MQTT connected");

        self.spawn_read_loop(reader, buf, generation);

        // The connect handler re-subscribes the configured topics
        let handler = self.connect_handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }

        Ok(())
    }

    fn spawn_read_loop(&self, mut reader: BrokerReader, mut buf: BytesMut, generation: u64) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let guard = self.shutdown.register();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            let keep_alive = Duration::from_secs(this.config.keep_alive.max(1) as u64);
            let mut keepalive = tokio::time::interval(keep_alive);
            keepalive.reset();

            loop {
                // Dispatch every complete packet already buffered
                loop {
                    match packet::decode(&mut buf) {
                        Ok(Some(pkt)) => this.handle_packet(pkt),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("malformed MQTT packet: {}", e);
                            this.handle_disconnect(generation).await;
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        // Best-effort clean disconnect
                        if let Some(w) = this.writer.lock().await.as_mut() {
                            let _ = w.write_all(&packet::encode_disconnect()).await;
                        }
                        debug!("MQTT read loop stopped");
                        return;
                    }
                    result = reader.read_buf(&mut buf) => {
                        match result {
                            Ok(0) => {
                                warn!("MQTT connection closed by broker");
                                this.handle_disconnect(generation).await;
                                return;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("MQTT connection lost: {}", e);
                                this.handle_disconnect(generation).await;
                                return;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if let Err(e) = this.write_packet(&packet::encode_pingreq()).await {
                            warn!("MQTT ping failed: {}", e);
                            this.handle_disconnect(generation).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    fn handle_packet(&self, pkt: Packet) {
        match pkt {
            Packet::Publish { topic, payload } => {
                let handlers: Vec<BrokerMessageHandler> = {
                    let subscriptions = self.subscriptions.read();
                    subscriptions
                        .iter()
                        .filter(|(filter, _)| topic_matches_filter(&topic, filter))
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect()
                };
                for handler in handlers {
                    handler(topic.clone(), payload.clone());
                }
            }
            Packet::SubAck { packet_id, .. } => {
                debug!(packet_id, "SUBACK received");
            }
            Packet::PingResp => {
                debug!("PINGRESP received");
            }
            Packet::ConnAck { .. } => {}
        }
    }

    async fn handle_disconnect(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();

        let handler = self.disconnect_handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }

        self.schedule_reconnect();
    }

    /// Schedule a single reconnect attempt after the fixed retry
    /// interval.
    fn schedule_reconnect(&self) {
        if self.shutdown.is_shutdown() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };

        let interval = this.config.connect_retry_interval;
        info!(
            addr = %this.config.address(),
            "MQTT disconnected, retrying in {:?}", interval
        );

        let guard = this.shutdown.register();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(interval).await;
            this.reconnect_pending.store(false, Ordering::SeqCst);
            if this.shutdown.is_shutdown() {
                return;
            }
            this.connect().await;
        });
    }

    async fn write_packet(&self, data: &[u8]) -> Result<(), BrokerError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(BrokerError::NotConnected);
        };
        stream
            .write_all(data)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
    }
}

#[async_trait]
impl LocalBroker for MqttClient {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.write_packet(&packet::encode_publish(topic, payload))
            .await
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: BrokerMessageHandler,
    ) -> Result<(), BrokerError> {
        // Install the handler first so a message racing the SUBACK is not
        // missed, and so reconnect re-subscription finds it in place
        self.subscriptions
            .write()
            .insert(filter.to_string(), handler);

        let packet_id = self.next_packet_id();
        self.write_packet(&packet::encode_subscribe(packet_id, filter))
            .await
    }
}
