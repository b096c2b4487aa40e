//! SyncMQ - MQTT topic synchronization bridge
//!
//! Mirrors a configured set of topics between two MQTT brokers over a
//! long-lived, TLS-capable bidirectional peer stream. One side dials out
//! (Initiator), the other listens (Acceptor); messages are tagged with a
//! marker key so mirrored topics never echo back and forth.

pub mod broker;
pub mod config;
pub mod message;
pub mod peer;
pub mod shutdown;
pub mod sync;
pub mod tls;

pub use broker::{LocalBroker, MqttClient};
pub use config::Config;
pub use message::SyncMessage;
pub use peer::{Acceptor, Initiator, OutboundQueue, PeerError, PeerLink, PeerStatus};
pub use shutdown::ShutdownCoordinator;
pub use sync::{ForwardMode, MarkerTagger, SyncOrchestrator};
