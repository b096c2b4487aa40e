//! Minimal MQTT v3.1.1 packet codec
//!
//! Covers the packet subset the bridge's broker client needs: CONNECT /
//! CONNACK, SUBSCRIBE / SUBACK, PUBLISH at QoS 0, PINGREQ / PINGRESP and
//! DISCONNECT. Packets the client never consumes are skipped on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Error type for packet decoding
#[derive(Debug)]
pub enum PacketError {
    /// Corrupt or truncated packet; the connection should be dropped
    Malformed(String),
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::Malformed(msg) => write!(f, "malformed packet: {}", msg),
        }
    }
}

impl std::error::Error for PacketError {}

/// Broker-to-client packets the client consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    PingResp,
}

fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn read_string(buf: &mut BytesMut) -> Result<String, PacketError> {
    if buf.len() < 2 {
        return Err(PacketError::Malformed("truncated string length".to_string()));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    buf.advance(2);
    if buf.len() < len {
        return Err(PacketError::Malformed("truncated string".to_string()));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| PacketError::Malformed("invalid UTF-8 in string".to_string()))
}

fn encode_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode the remaining-length varint. Returns `Ok(None)` when more bytes
/// are needed, otherwise the value and the number of bytes it occupied.
fn decode_remaining_length(data: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 4 {
            return Err(PacketError::Malformed(
                "remaining length exceeds 4 bytes".to_string(),
            ));
        }
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    Ok(None)
}

fn packet(first_byte: u8, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(first_byte);
    encode_remaining_length(&mut out, body.len());
    out.put_slice(body);
    out
}

/// Encode a CONNECT packet with clean session set.
pub fn encode_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive: u16,
) -> BytesMut {
    let mut body = BytesMut::new();
    write_string(&mut body, "MQTT");
    body.put_u8(0x04); // protocol level 3.1.1

    let mut flags = 0x02u8; // clean session
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }
    body.put_u8(flags);
    body.put_u16(keep_alive);

    write_string(&mut body, client_id);
    if let Some(username) = username {
        write_string(&mut body, username);
    }
    if let Some(password) = password {
        write_string(&mut body, password);
    }

    packet(0x10, &body)
}

/// Encode a SUBSCRIBE packet for a single filter at QoS 0.
pub fn encode_subscribe(packet_id: u16, filter: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    write_string(&mut body, filter);
    body.put_u8(0x00); // requested QoS

    packet(0x82, &body)
}

/// Encode a PUBLISH packet at QoS 0.
pub fn encode_publish(topic: &str, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    write_string(&mut body, topic);
    body.put_slice(payload);

    packet(0x30, &body)
}

pub fn encode_pingreq() -> BytesMut {
    BytesMut::from(&[0xC0, 0x00][..])
}

pub fn encode_disconnect() -> BytesMut {
    BytesMut::from(&[0xE0, 0x00][..])
}

/// Try to decode one packet from the buffer. Returns `Ok(None)` when more
/// bytes are needed; consumed bytes are advanced out of `buf`. Packet
/// types the client does not consume are skipped.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
    loop {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let (remaining, header_len) = match decode_remaining_length(&buf[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };

        let total = 1 + header_len + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let mut body = buf.split_to(total);
        body.advance(1 + header_len);

        match first_byte >> 4 {
            2 => {
                if body.len() < 2 {
                    return Err(PacketError::Malformed("short CONNACK".to_string()));
                }
                return Ok(Some(Packet::ConnAck {
                    session_present: body[0] & 0x01 != 0,
                    return_code: body[1],
                }));
            }
            3 => {
                let qos = (first_byte >> 1) & 0x03;
                let topic = read_string(&mut body)?;
                if qos > 0 {
                    // Skip the packet id if the broker did not downgrade to QoS 0
                    if body.len() < 2 {
                        return Err(PacketError::Malformed("short PUBLISH".to_string()));
                    }
                    body.advance(2);
                }
                return Ok(Some(Packet::Publish {
                    topic,
                    payload: body.freeze(),
                }));
            }
            9 => {
                if body.len() < 2 {
                    return Err(PacketError::Malformed("short SUBACK".to_string()));
                }
                let packet_id = u16::from_be_bytes([body[0], body[1]]);
                body.advance(2);
                return Ok(Some(Packet::SubAck {
                    packet_id,
                    return_codes: body.to_vec(),
                }));
            }
            13 => return Ok(Some(Packet::PingResp)),
            _ => continue,
        }
    }
}
