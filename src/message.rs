//! Sync Message
//!
//! The value that crosses the bridge: a broker topic plus its opaque
//! payload. The empty topic is reserved for the handshake/liveness frame
//! and never carries data.

use bytes::Bytes;

/// A message in flight between the local broker and the remote peer.
///
/// Identity is the topic; there are no message IDs or sequence numbers, so
/// redelivery after a reconnect is indistinguishable from a fresh publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    topic: String,
    payload: Bytes,
    has_marker: bool,
}

impl SyncMessage {
    /// Create a message with an undetermined marker state.
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            has_marker: false,
        }
    }

    /// Create a message whose marker state was determined by the tagger.
    pub fn tagged(topic: impl Into<String>, payload: Bytes, has_marker: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            has_marker,
        }
    }

    /// The empty-topic handshake/liveness frame.
    pub fn handshake() -> Self {
        Self::new(String::new(), Bytes::new())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the payload already carried the loop-prevention marker when
    /// it was first observed on the local broker.
    pub fn has_marker(&self) -> bool {
        self.has_marker
    }

    /// Whether this is the empty-topic handshake frame.
    pub fn is_handshake(&self) -> bool {
        self.topic.is_empty()
    }
}
