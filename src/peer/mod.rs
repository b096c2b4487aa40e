//! Peer Link
//!
//! The bidirectional stream session between two bridge instances. Two
//! roles share one contract: the Initiator dials out and owns the
//! reconnect loop; the Acceptor listens and buffers outbound messages in
//! the per-topic queue while no stream is attached.
//!
//! # Handshake
//!
//! A frame with an empty topic is never data - it signals "stream
//! (re)established" and doubles as the liveness signal. The Acceptor
//! drains its queue onto the stream when it receives one; the Initiator
//! ignores it.

mod acceptor;
mod initiator;
mod protocol;
mod queue;


pub use acceptor::Acceptor;
pub use initiator::Initiator;
pub use protocol::{extract_frame, frame_message, read_frame_length, SyncFrame, MAX_FRAME_SIZE};
pub use queue::OutboundQueue;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::message::SyncMessage;

/// Callback invoked for every data frame received from the remote peer
pub type PeerCallback = Arc<dyn Fn(SyncMessage) + Send + Sync>;

/// Unified TCP/TLS stream for the peer session. The active stream is
/// replaced as a whole on every reconnect, never mutated in place.
pub(crate) trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub(crate) type StreamReader = ReadHalf<Box<dyn PeerStream>>;
pub(crate) type StreamWriter = WriteHalf<Box<dyn PeerStream>>;

/// Error type for peer link operations
#[derive(Debug)]
pub enum PeerError {
    /// No stream is currently attached
    StreamDisabled,
    /// Connection to the remote peer failed or was lost
    ConnectionLost(String),
    /// Frame encoding failed
    Encode(String),
    /// Invalid configuration
    InvalidConfig(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::StreamDisabled => write!(f, "stream disabled"),
            PeerError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            PeerError::Encode(msg) => write!(f, "encode error: {}", msg),
            PeerError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for PeerError {}

/// Session state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No stream attached and no attempt in progress
    Idle,
    /// Dial or TLS handshake in progress
    Connecting,
    /// Active stream attached
    Streaming,
    /// Waiting out the retry interval before the next dial
    ReconnectWait,
    /// Shut down; no further streams will be attached
    Closed,
}

/// Common contract for the two peer link roles, so the orchestrator can
/// forward through either without knowing which is active.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Role name for logging
    fn name(&self) -> &'static str;

    /// Current session state
    fn status(&self) -> PeerStatus;

    /// Send a message to the remote side. The no-stream contract differs
    /// by role: the Initiator silently drops, the Acceptor buffers and
    /// fails with [`PeerError::StreamDisabled`].
    async fn send(&self, message: &SyncMessage) -> Result<(), PeerError>;

    /// Close the link and detach any active stream.
    async fn stop(&self);
}
