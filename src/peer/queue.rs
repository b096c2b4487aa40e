//! Outbound Queue
//!
//! Per-topic, last-write-wins buffer holding messages while no peer
//! stream is attached. At most one message is pending per topic; pushing
//! a topic already present overwrites it, so a topic published to several
//! times while disconnected delivers only its final value on reconnect.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::message::SyncMessage;

const INITIAL_QUEUE_SIZE: usize = 10;

/// Mutex-guarded per-topic buffer owned by one Acceptor instance.
pub struct OutboundQueue {
    messages: Mutex<HashMap<String, SyncMessage>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(HashMap::with_capacity(INITIAL_QUEUE_SIZE)),
        }
    }

    /// Upsert by topic. The older pending value for that topic is lost.
    pub fn push(&self, message: SyncMessage) {
        self.messages
            .lock()
            .insert(message.topic().to_string(), message);
    }

    /// Swap the buffer for an empty one and return what was pending, in
    /// arbitrary order. Pushes racing a drain land in the fresh buffer
    /// instead of being lost or double-sent; the caller sends the drained
    /// messages without any lock held.
    pub fn drain(&self) -> Vec<SyncMessage> {
        let drained = {
            let mut messages = self.messages.lock();
            std::mem::replace(&mut *messages, HashMap::with_capacity(INITIAL_QUEUE_SIZE))
        };
        drained.into_values().collect()
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
