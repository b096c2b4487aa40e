//! Peer Stream Protocol
//!
//! Frames exchanged between bridge peers over TCP/TLS. Frames are
//! length-prefixed and serialized with bincode. There is no protocol
//! version field; both ends must agree on the schema out of band.

use bincode::{Decode, Encode};
use bytes::{Buf, BytesMut};

/// Upper bound on a single frame body; larger prefixes indicate a corrupt
/// or hostile stream.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A single frame on the peer stream
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SyncFrame {
    /// Broker topic; empty for the handshake/liveness frame
    pub topic: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl SyncFrame {
    /// A data frame carrying a broker message
    pub fn data(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// The handshake/liveness frame
    pub fn handshake() -> Self {
        Self {
            topic: String::new(),
            payload: Vec::new(),
        }
    }

    /// Whether this is the handshake/liveness frame
    pub fn is_handshake(&self) -> bool {
        self.topic.is_empty()
    }

    /// Encode frame to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode frame from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(frame, _)| frame)
    }
}

/// Frame a message with a 4-byte big-endian length prefix for transmission
pub fn frame_message(frame: &SyncFrame) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = frame.encode()?;
    let len = payload.len() as u32;

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&payload);

    Ok(framed)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Extract one complete frame from the read buffer, if present.
///
/// Returns `Ok(None)` when more bytes are needed; consumed bytes are
/// advanced out of `buf`. Receive loops read into the buffer with a
/// cancel-safe `read_buf` and pull frames out here, so a raced select arm
/// never loses part of a frame.
pub fn extract_frame(buf: &mut BytesMut) -> std::io::Result<Option<SyncFrame>> {
    let Some(len) = read_frame_length(buf) else {
        return Ok(None);
    };
    let len = len as usize;

    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    if buf.len() < 4 + len {
        return Ok(None);
    }

    buf.advance(4);
    let body = buf.split_to(len);

    SyncFrame::decode(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_data_frame() {
        let frame = SyncFrame::data("sensors/temp", vec![1, 2, 3, 4]);

        let encoded = frame.encode().unwrap();
        let decoded = SyncFrame::decode(&encoded).unwrap();

        assert_eq!(decoded.topic, "sensors/temp");
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert!(!decoded.is_handshake());
    }

    #[test]
    fn test_handshake_frame() {
        let frame = SyncFrame::handshake();
        assert!(frame.is_handshake());

        let decoded = SyncFrame::decode(&frame.encode().unwrap()).unwrap();
        assert!(decoded.is_handshake());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_frame_message_length_prefix() {
        let frame = SyncFrame::data("t", b"payload".to_vec());
        let framed = frame_message(&frame).unwrap();

        // First 4 bytes are length
        let len = read_frame_length(&framed).unwrap();
        assert_eq!(len as usize, framed.len() - 4);

        let decoded = SyncFrame::decode(&framed[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_read_frame_length_short_input() {
        assert!(read_frame_length(&[0, 0, 1]).is_none());
        assert_eq!(read_frame_length(&[0, 0, 0, 5]), Some(5));
    }

    #[test]
    fn test_extract_frame_roundtrip() {
        let frame = SyncFrame::data("sync/a", b"{\"v\":1}".to_vec());
        let framed = frame_message(&frame).unwrap();

        let mut buf = BytesMut::from(&framed[..]);
        let decoded = extract_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_frame_partial_needs_more() {
        let frame = SyncFrame::data("t", vec![9; 32]);
        let framed = frame_message(&frame).unwrap();

        // Partial length prefix, then partial body
        let mut buf = BytesMut::from(&framed[..3]);
        assert!(extract_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&framed[3..framed.len() - 5]);
        assert!(extract_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&framed[framed.len() - 5..]);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_extract_frame_back_to_back() {
        let first = SyncFrame::handshake();
        let second = SyncFrame::data("t", b"x".to_vec());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame_message(&first).unwrap());
        buf.extend_from_slice(&frame_message(&second).unwrap());

        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), first);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), second);
        assert!(extract_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_extract_frame_rejects_oversized() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(b"junk");

        let err = extract_frame(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
