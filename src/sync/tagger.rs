//! Loop-Prevention Tagger
//!
//! Marks every message first observed on the local broker with a marker
//! key inside its JSON payload. A payload already carrying the key has
//! crossed the bridge at least once before and must not be forwarded
//! again. The check runs exactly once per message, on the local-broker
//! side only; peer-link messages are republished verbatim.

use bytes::Bytes;
use serde_json::{Map, Value};

/// Sentinel value stored under the marker key
const MARKER_VALUE: u64 = 1;

/// Error type for payload tagging
#[derive(Debug)]
pub enum TagError {
    /// Payload is not a JSON object
    Decode(String),
    /// Re-encoding the tagged payload failed
    Encode(String),
}

impl std::fmt::Display for TagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagError::Decode(msg) => write!(f, "decode error: {}", msg),
            TagError::Encode(msg) => write!(f, "encode error: {}", msg),
        }
    }
}

impl std::error::Error for TagError {}

/// Stateless marker-key transform over JSON object payloads.
#[derive(Debug, Clone)]
pub struct MarkerTagger {
    key: String,
}

impl MarkerTagger {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Decode the payload and insert the marker key if absent.
    ///
    /// Returns the (possibly re-encoded) payload and whether the marker
    /// was already present. A payload with the marker is returned
    /// unchanged.
    pub fn tag(&self, payload: &[u8]) -> Result<(Bytes, bool), TagError> {
        let mut data: Map<String, Value> =
            serde_json::from_slice(payload).map_err(|e| TagError::Decode(e.to_string()))?;

        if data.contains_key(&self.key) {
            return Ok((Bytes::copy_from_slice(payload), true));
        }

        data.insert(self.key.clone(), Value::from(MARKER_VALUE));
        let encoded = serde_json::to_vec(&data).map_err(|e| TagError::Encode(e.to_string()))?;

        Ok((Bytes::from(encoded), false))
    }
}
