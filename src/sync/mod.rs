//! Sync Orchestration
//!
//! The routing policy between the local broker and the peer links: tag
//! or drop on the broker side, verbatim republish on the peer side. The
//! orchestrator holds no state of its own beyond references to its
//! collaborators; retry and buffering live in the peer links.

mod tagger;


pub use tagger::{MarkerTagger, TagError};

// Re-export the forward mode from the config module for convenience
pub use crate::config::ForwardMode;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use bytes::Bytes;

use crate::broker::{BrokerMessageHandler, ConnectCallback, LocalBroker};
use crate::config::SyncConfig;
use crate::message::SyncMessage;
use crate::peer::{PeerCallback, PeerLink};

/// Wires the local broker subscription/publish calls to the peer links.
pub struct SyncOrchestrator {
    topics: Vec<String>,
    mode: ForwardMode,
    tagger: MarkerTagger,
    broker: Arc<dyn LocalBroker>,
    /// Peer links in priority order; the acceptor is attached first
    links: RwLock<Vec<Arc<dyn PeerLink>>>,
}

impl SyncOrchestrator {
    pub fn new(config: &SyncConfig, broker: Arc<dyn LocalBroker>) -> Arc<Self> {
        Arc::new(Self {
            topics: config.topics.clone(),
            mode: config.forward,
            tagger: MarkerTagger::new(config.marker_key.clone()),
            broker,
            links: RwLock::new(Vec::new()),
        })
    }

    /// Attach a peer link. Under acceptor-priority forwarding the first
    /// attached link wins; attach the acceptor before the initiator.
    pub fn attach_link(&self, link: Arc<dyn PeerLink>) {
        self.links.write().push(link);
    }

    /// Callback for frames received from a peer link.
    pub fn peer_callback(self: &Arc<Self>) -> PeerCallback {
        let this = Arc::clone(self);
        Arc::new(move |message| this.on_peer_message(message))
    }

    /// Callback wired into the broker client's connect handler.
    pub fn connect_callback(self: &Arc<Self>) -> ConnectCallback {
        let this = Arc::clone(self);
        Arc::new(move || {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                this.on_broker_connect().await;
            });
        })
    }

    /// Handler installed for every subscribed topic.
    fn broker_handler(self: &Arc<Self>) -> BrokerMessageHandler {
        let this = Arc::clone(self);
        Arc::new(move |topic, payload| this.on_broker_message(topic, payload))
    }

    /// Subscribe every configured topic. A subscribe failure here is a
    /// configuration problem retries cannot fix and aborts the process.
    async fn on_broker_connect(self: &Arc<Self>) {
        for topic in &self.topics {
            let handler = self.broker_handler();
            if let Err(e) = self.broker.subscribe(topic, handler).await {
                error!(topic = %topic, "failed to subscribe: {}", e);
                std::process::exit(1);
            }
            info!(topic = %topic, "subscribed to topic");
        }
    }

    /// A raw message observed on the local broker: tag it, and drop it if
    /// it already crossed the bridge.
    fn on_broker_message(&self, topic: String, payload: Bytes) {
        let (tagged, has_marker) = match self.tagger.tag(&payload) {
            Ok(result) => result,
            Err(e) => {
                error!(topic = %topic, "failed to decode message payload: {}", e);
                return;
            }
        };

        if has_marker {
            debug!(topic = %topic, "dropping already-bridged message");
            return;
        }

        debug!(topic = %topic, "MQTT message");
        self.forward(SyncMessage::tagged(topic, tagged, has_marker));
    }

    /// Forward to the selected peer link(s). Send errors are logged only;
    /// retry and buffering are the links' responsibility.
    fn forward(&self, message: SyncMessage) {
        let targets: Vec<Arc<dyn PeerLink>> = {
            let links = self.links.read();
            match self.mode {
                ForwardMode::AcceptorPriority => links.first().cloned().into_iter().collect(),
                ForwardMode::FanOut => links.iter().cloned().collect(),
            }
        };

        for link in targets {
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = link.send(&message).await {
                    error!(
                        link = link.name(),
                        topic = message.topic(),
                        "failed to send message: {}", e
                    );
                }
            });
        }
    }

    /// A message received from a peer link: republish verbatim onto the
    /// local broker.
    fn on_peer_message(&self, message: SyncMessage) {
        if message.is_handshake() {
            return;
        }

        debug!(topic = message.topic(), "peer message");

        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.publish(message.topic(), message.payload()).await {
                error!(
                    topic = message.topic(),
                    "failed to publish peer message: {}", e
                );
            }
        });
    }
}
