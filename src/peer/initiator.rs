//! Initiator Peer Link
//!
//! Dials the remote Acceptor and owns the reconnect loop: a failed dial
//! or a broken stream schedules a retry after a fixed interval,
//! indefinitely, until shutdown. There is no Initiator-side queue;
//! sending without a stream silently succeeds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::config::InitiatorConfig;
use crate::message::SyncMessage;
use crate::shutdown::ShutdownCoordinator;
use crate::tls::client_connector;

use super::protocol::{extract_frame, frame_message, SyncFrame};
use super::{PeerCallback, PeerError, PeerLink, PeerStatus, PeerStream, StreamReader, StreamWriter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The dialing peer link role.
pub struct Initiator {
    config: InitiatorConfig,
    status: RwLock<PeerStatus>,
    writer: Mutex<Option<StreamWriter>>,
    callback: PeerCallback,
    shutdown: ShutdownCoordinator,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    /// Incremented on every established stream; a receive loop only
    /// detaches the stream it was spawned for.
    generation: AtomicU64,
    /// At most one reconnect task is pending at a time.
    reconnect_pending: AtomicBool,
    weak: Weak<Initiator>,
}

impl Initiator {
    /// Create the initiator. Malformed TLS material is a fatal
    /// configuration error.
    pub fn new(
        config: InitiatorConfig,
        callback: PeerCallback,
        shutdown: ShutdownCoordinator,
    ) -> Result<Arc<Self>, PeerError> {
        let tls = match &config.tls {
            Some(tls_cfg) => {
                let connector = client_connector(tls_cfg)
                    .map_err(|e| PeerError::InvalidConfig(e.to_string()))?;
                let name = tls_cfg
                    .server_name
                    .clone()
                    .unwrap_or_else(|| config.host.clone());
                let server_name = ServerName::try_from(name)
                    .map_err(|e| PeerError::InvalidConfig(format!("invalid server name: {}", e)))?;
                Some((connector, server_name))
            }
            None => None,
        };

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            status: RwLock::new(PeerStatus::Idle),
            writer: Mutex::new(None),
            callback,
            shutdown,
            tls,
            generation: AtomicU64::new(0),
            reconnect_pending: AtomicBool::new(false),
            weak: weak.clone(),
        }))
    }

    /// Open a stream to the remote acceptor, send the handshake frame and
    /// spawn the receive loop. Failure schedules a reconnect attempt.
    pub async fn start(&self) -> Result<(), PeerError> {
        if self.shutdown.is_shutdown() || self.status() == PeerStatus::Closed {
            return Ok(());
        }

        *self.status.write() = PeerStatus::Connecting;

        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(addr = %self.config.address(), "initiator connect failed: {}", e);
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(), PeerError> {
        let addr = self.config.address();

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| PeerError::ConnectionLost("connect timed out".to_string()))?
            .map_err(|e| PeerError::ConnectionLost(e.to_string()))?;

        let stream: Box<dyn PeerStream> = match &self.tls {
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| PeerError::ConnectionLost(e.to_string()))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        let (reader, mut writer) = tokio::io::split(stream);

        // Announce the new stream; the acceptor drains its queue on receipt.
        let frame = frame_message(&SyncFrame::handshake())
            .map_err(|e| PeerError::Encode(e.to_string()))?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| PeerError::ConnectionLost(e.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);
        *self.status.write() = PeerStatus::Streaming;

        info!(tls = self.tls.is_some(), addr = %addr, "connected to peer acceptor");

        self.spawn_receive_loop(reader, generation);
        Ok(())
    }

    fn spawn_receive_loop(&self, mut reader: StreamReader, generation: u64) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let guard = self.shutdown.register();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            let mut keepalive = tokio::time::interval(this.config.keepalive_interval);
            keepalive.reset();
            let mut buf = BytesMut::with_capacity(8 * 1024);

            loop {
                // Dispatch every complete frame already buffered
                loop {
                    match extract_frame(&mut buf) {
                        Ok(Some(frame)) => {
                            if frame.is_handshake() {
                                // Liveness only; the initiator does not buffer.
                                continue;
                            }
                            (this.callback)(SyncMessage::new(
                                frame.topic,
                                Bytes::from(frame.payload),
                            ));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("initiator stream broken: {}", e);
                            if this.drop_stream(generation).await {
                                this.schedule_reconnect();
                            }
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("initiator receive loop stopped");
                        return;
                    }
                    result = reader.read_buf(&mut buf) => {
                        match result {
                            Ok(0) => {
                                info!("initiator stream closed by remote");
                                if this.drop_stream(generation).await {
                                    this.schedule_reconnect();
                                }
                                return;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("initiator stream broken: {}", e);
                                if this.drop_stream(generation).await {
                                    this.schedule_reconnect();
                                }
                                return;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        // send already detaches the stream and schedules the
                        // retry when the write fails
                        if this.send(&SyncMessage::handshake()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Detach the stream if it is still the one this caller observed.
    /// Returns false when a newer stream has already replaced it.
    async fn drop_stream(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.writer.lock().await.take();
        let mut status = self.status.write();
        if *status != PeerStatus::Closed {
            *status = PeerStatus::Idle;
        }
        true
    }

    /// Schedule a single reconnect attempt after the fixed retry interval.
    /// The sleep is not interrupted early; the shutdown signal is observed
    /// between sleep completion and the next connect attempt.
    fn schedule_reconnect(&self) {
        if self.shutdown.is_shutdown() || *self.status.read() == PeerStatus::Closed {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };

        {
            let mut status = this.status.write();
            if *status == PeerStatus::Closed {
                this.reconnect_pending.store(false, Ordering::SeqCst);
                return;
            }
            *status = PeerStatus::ReconnectWait;
        }

        let interval = this.config.reconnect_interval;
        info!(
            addr = %this.config.address(),
            "peer disconnected, retrying in {:?}", interval
        );

        let guard = this.shutdown.register();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(interval).await;
            this.reconnect_pending.store(false, Ordering::SeqCst);
            if this.shutdown.is_shutdown() {
                return;
            }
            let _ = this.start().await;
        });
    }
}

#[async_trait]
impl PeerLink for Initiator {
    fn name(&self) -> &'static str {
        "initiator"
    }

    fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// With no stream attached this silently succeeds - the initiator does
    /// not buffer. A failed write surfaces the error and triggers the
    /// reconnect sequence.
    async fn send(&self, message: &SyncMessage) -> Result<(), PeerError> {
        let frame = frame_message(&SyncFrame::data(
            message.topic(),
            message.payload().to_vec(),
        ))
        .map_err(|e| PeerError::Encode(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Ok(());
        };

        if let Err(e) = stream.write_all(&frame).await {
            writer.take();
            drop(writer);
            {
                let mut status = self.status.write();
                if *status != PeerStatus::Closed {
                    *status = PeerStatus::Idle;
                }
            }
            self.schedule_reconnect();
            return Err(PeerError::ConnectionLost(e.to_string()));
        }

        Ok(())
    }

    async fn stop(&self) {
        *self.status.write() = PeerStatus::Closed;
        self.writer.lock().await.take();
    }
}
