//! Gateway wire envelope: 16-byte big-endian header + body.
//!
//! | offset | bytes | field |
//! |---|---|---|
//! | 0 | 4 | packet length (header + body) |
//! | 4 | 2 | header length, always 16 |
//! | 6 | 2 | protocol version (echoed back on sends) |
//! | 8 | 4 | operation |
//! | 12 | 4 | sequence id |
//!
//! Bodies are JSON (auth, events) or empty (heartbeat). Each frame carries
//! exactly one body.

// ── Sizes and operations ───────────────────────────────────────────

pub const HEADER_SIZE: usize = 16;
pub const MAX_BODY_SIZE: usize = 2048;
pub const MAX_PACK_SIZE: usize = MAX_BODY_SIZE + HEADER_SIZE;

pub const OP_HEARTBEAT: u32 = 2;
pub const OP_HEARTBEAT_REPLY: u32 = 3;
pub const OP_EVENT: u32 = 5;
pub const OP_AUTH: u32 = 7;
pub const OP_AUTH_REPLY: u32 = 8;

/// One decoded gateway frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_length: u32,
    pub header_length: u16,
    pub version: u16,
    pub operation: u32,
    pub sequence_id: u32,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(operation: u32, body: Vec<u8>) -> Self {
        Self {
            packet_length: (HEADER_SIZE + body.len()) as u32,
            header_length: HEADER_SIZE as u16,
            version: 0,
            operation,
            sequence_id: 0,
            body,
        }
    }
}

// ── Encode / decode ────────────────────────────────────────────────

/// Serialize a frame for sending; `sequence_id` is assigned by the caller.
pub fn encode(operation: u32, sequence_id: u32, version: u16, body: &[u8]) -> Vec<u8> {
    let packet_length = (HEADER_SIZE + body.len()) as u32;
    let mut buf = Vec::with_capacity(packet_length as usize);
    buf.extend_from_slice(&packet_length.to_be_bytes());
    buf.extend_from_slice(&(HEADER_SIZE as u16).to_be_bytes());
    buf.extend_from_slice(&version.to_be_bytes());
    buf.extend_from_slice(&operation.to_be_bytes());
    buf.extend_from_slice(&sequence_id.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Decode one frame; malformed frames are logged and dropped (`None`).
pub fn decode(buf: &[u8]) -> Option<Frame> {
    if buf.len() < HEADER_SIZE {
        tracing::warn!(len = buf.len(), "gateway frame shorter than header, dropped");
        return None;
    }

    let packet_length = u32::from_be_bytes(buf[0..4].try_into().ok()?);
    let header_length = u16::from_be_bytes(buf[4..6].try_into().ok()?);
    let version = u16::from_be_bytes(buf[6..8].try_into().ok()?);
    let operation = u32::from_be_bytes(buf[8..12].try_into().ok()?);
    let sequence_id = u32::from_be_bytes(buf[12..16].try_into().ok()?);

    if packet_length as usize > MAX_PACK_SIZE {
        tracing::warn!(packet_length, "gateway frame exceeds max packet size, dropped");
        return None;
    }
    if header_length as usize != HEADER_SIZE {
        tracing::warn!(header_length, "gateway frame has invalid header length, dropped");
        return None;
    }
    if (packet_length as usize) < HEADER_SIZE {
        tracing::warn!(packet_length, "gateway frame shorter than its header, dropped");
        return None;
    }
    if buf.len() < packet_length as usize {
        tracing::warn!(
            have = buf.len(),
            need = packet_length,
            "gateway frame truncated, dropped"
        );
        return None;
    }

    Some(Frame {
        packet_length,
        header_length,
        version,
        operation,
        sequence_id,
        body: buf[HEADER_SIZE..packet_length as usize].to_vec(),
    })
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_body() {
        let body = br#"{"code":0}"#;
        let encoded = encode(OP_AUTH_REPLY, 7, 1, body);
        let frame = decode(&encoded).unwrap();

        assert_eq!(frame.packet_length as usize, HEADER_SIZE + body.len());
        assert_eq!(frame.header_length as usize, HEADER_SIZE);
        assert_eq!(frame.version, 1);
        assert_eq!(frame.operation, OP_AUTH_REPLY);
        assert_eq!(frame.sequence_id, 7);
        assert_eq!(frame.body, body);
    }

    #[test]
    fn roundtrip_empty_body() {
        let encoded = encode(OP_HEARTBEAT, 1, 0, &[]);
        assert_eq!(encoded.len(), HEADER_SIZE);

        let frame = decode(&encoded).unwrap();
        assert_eq!(frame.operation, OP_HEARTBEAT);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn header_is_big_endian() {
        let encoded = encode(OP_EVENT, 0x0102_0304, 0, &[]);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 5]);
        assert_eq!(&encoded[12..16], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn short_buffer_dropped() {
        assert!(decode(&[0u8; 8]).is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn oversized_packet_dropped() {
        let mut buf = encode(OP_EVENT, 1, 0, &[]);
        let bad_len = (MAX_PACK_SIZE as u32 + 1).to_be_bytes();
        buf[0..4].copy_from_slice(&bad_len);
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn wrong_header_length_dropped() {
        let mut buf = encode(OP_EVENT, 1, 0, b"x");
        buf[4..6].copy_from_slice(&12u16.to_be_bytes());
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn truncated_body_dropped() {
        let buf = encode(OP_EVENT, 1, 0, b"hello");
        assert!(decode(&buf[..HEADER_SIZE + 2]).is_none());
    }

    #[test]
    fn max_body_roundtrips() {
        let body = vec![0x42u8; MAX_BODY_SIZE];
        let frame = decode(&encode(OP_EVENT, 1, 0, &body)).unwrap();
        assert_eq!(frame.body.len(), MAX_BODY_SIZE);
    }

    #[test]
    fn packet_shorter_than_header_dropped() {
        let mut buf = encode(OP_EVENT, 1, 0, &[]);
        buf[0..4].copy_from_slice(&8u32.to_be_bytes());
        assert!(decode(&buf).is_none());
    }
}
