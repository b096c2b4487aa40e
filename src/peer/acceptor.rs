//! Acceptor Peer Link
//!
//! Listens for inbound peer connections. Passive: a lost stream is not
//! retried; sends fail into the outbound queue until the next connection
//! arrives and its handshake frame drains the buffer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;

use crate::config::AcceptorConfig;
use crate::message::SyncMessage;
use crate::shutdown::ShutdownCoordinator;
use crate::tls::server_acceptor;

use super::protocol::{extract_frame, frame_message, SyncFrame};
use super::queue::OutboundQueue;
use super::{PeerCallback, PeerError, PeerLink, PeerStatus, PeerStream, StreamReader, StreamWriter};

/// The listening peer link role.
pub struct Acceptor {
    config: AcceptorConfig,
    listener: TcpListener,
    status: RwLock<PeerStatus>,
    writer: Mutex<Option<StreamWriter>>,
    queue: OutboundQueue,
    callback: PeerCallback,
    shutdown: ShutdownCoordinator,
    tls: Option<TlsAcceptor>,
    /// Incremented on every installed stream; a receive loop only
    /// detaches the stream it was spawned for.
    generation: AtomicU64,
    weak: Weak<Acceptor>,
}

impl Acceptor {
    /// Bind the listener and prepare TLS. Both a bind failure and
    /// malformed TLS material are fatal configuration errors.
    pub async fn new(
        config: AcceptorConfig,
        callback: PeerCallback,
        shutdown: ShutdownCoordinator,
    ) -> Result<Arc<Self>, PeerError> {
        let tls = match &config.tls {
            Some(tls_cfg) => Some(
                server_acceptor(tls_cfg).map_err(|e| PeerError::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };

        let addr = config.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PeerError::InvalidConfig(format!("failed to bind {}: {}", addr, e)))?;

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            listener,
            status: RwLock::new(PeerStatus::Idle),
            writer: Mutex::new(None),
            queue: OutboundQueue::new(),
            callback,
            shutdown,
            tls,
            generation: AtomicU64::new(0),
            weak: weak.clone(),
        }))
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of messages buffered for the next stream.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Start accepting inbound peer connections.
    pub fn start(&self) {
        info!(
            tls = self.tls.is_some(),
            addr = %self.config.address(),
            "acceptor listening"
        );

        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let guard = self.shutdown.register();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("acceptor stopped");
                        return;
                    }
                    result = this.listener.accept() => {
                        match result {
                            Ok((tcp, peer_addr)) => this.install_stream(tcp, peer_addr).await,
                            Err(e) => warn!("accept failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Replace the active stream wholesale with a freshly accepted
    /// connection. The previous stream's receive loop exits on its own
    /// read error.
    async fn install_stream(&self, tcp: TcpStream, peer_addr: SocketAddr) {
        let stream: Box<dyn PeerStream> = match &self.tls {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    warn!(peer = %peer_addr, "TLS handshake failed: {}", e);
                    return;
                }
            },
            None => Box::new(tcp),
        };

        let (reader, writer) = tokio::io::split(stream);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);
        *self.status.write() = PeerStatus::Streaming;

        info!(peer = %peer_addr, "peer stream established");

        self.spawn_receive_loop(reader, generation, peer_addr);
    }

    fn spawn_receive_loop(&self, mut reader: StreamReader, generation: u64, peer_addr: SocketAddr) {
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
                                debug!(peer = %peer_addr, "peer connected");
                                this.drain_queue().await;
                                continue;
                            }
                            (this.callback)(SyncMessage::new(
                                frame.topic,
                                Bytes::from(frame.payload),
                            ));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer = %peer_addr, "peer stream broken: {}", e);
                            this.drop_stream(generation).await;
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("acceptor receive loop stopped");
                        return;
                    }
                    result = reader.read_buf(&mut buf) => {
                        match result {
                            Ok(0) => {
                                info!(peer = %peer_addr, "peer stream closed");
                                this.drop_stream(generation).await;
                                return;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(peer = %peer_addr, "peer stream broken: {}", e);
                                this.drop_stream(generation).await;
                                return;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        // Liveness signal; the initiator ignores it on receipt.
                        if let Err(e) = this.write_frame(&SyncFrame::handshake()).await {
                            debug!(peer = %peer_addr, "keepalive failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Send everything buffered onto the just-established stream.
    /// Individual failures are logged and the message is discarded, not
    /// re-queued, which bounds retry amplification.
    async fn drain_queue(&self) {
        let drained = self.queue.drain();
        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "sending buffered messages to peer");

        for message in drained {
            let frame = SyncFrame::data(message.topic(), message.payload().to_vec());
            if let Err(e) = self.write_frame(&frame).await {
                error!(topic = message.topic(), "failed to send buffered message: {}", e);
            }
        }
    }

    /// Write a frame to the active stream without touching the queue.
    async fn write_frame(&self, frame: &SyncFrame) -> Result<(), PeerError> {
        let data = frame_message(frame).map_err(|e| PeerError::Encode(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(PeerError::StreamDisabled);
        };

        stream
            .write_all(&data)
            .await
            .map_err(|e| PeerError::ConnectionLost(e.to_string()))
    }

    async fn drop_stream(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.writer.lock().await.take();
        let mut status = self.status.write();
        if *status != PeerStatus::Closed {
            *status = PeerStatus::Idle;
        }
    }
}

#[async_trait]
impl PeerLink for Acceptor {
    fn name(&self) -> &'static str {
        "acceptor"
    }

    fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Fails with [`PeerError::StreamDisabled`] when no stream is
    /// attached; on any failure the message is pushed to the queue and
    /// delivered by the next connection's handshake drain.
    async fn send(&self, message: &SyncMessage) -> Result<(), PeerError> {
        let frame = SyncFrame::data(message.topic(), message.payload().to_vec());
        match self.write_frame(&frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.queue.push(message.clone());
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        *self.status.write() = PeerStatus::Closed;
        self.writer.lock().await.take();
    }
}
