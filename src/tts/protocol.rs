//! Binary message framing for the TTS WebSocket.
//!
//! Every frame starts with a 4-byte header:
//!
//! | bits | field |
//! |---|---|
//! | `b[0] >> 4` | protocol version |
//! | `b[0] & 0xF` | header size in 4-byte words |
//! | `b[1] >> 4` | message type |
//! | `b[1] & 0xF` | type-specific flags (non-zero → a sequence follows) |
//! | `b[2] >> 4` | payload serialization (1 = JSON) |
//! | `b[2] & 0xF` | compression (0 = none) |
//! | `b[3]` | reserved |
//!
//! After the header: an optional big-endian `i32` sequence (when flagged),
//! then a big-endian `u32` payload size, then the payload. Error frames
//! carry a `u32` error code in place of the sequence.

// ── Message types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client → server: whole-payload submit request.
    FullClientRequest,
    /// Server → client: JSON result (front-end text metadata). Logged, skipped.
    FrontEndResultServer,
    /// Server → client: one audio chunk.
    AudioOnlyServer,
    /// Server → client: error report.
    Error,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::FullClientRequest => 0b0001,
            MessageType::FrontEndResultServer => 0b1001,
            MessageType::AudioOnlyServer => 0b1011,
            MessageType::Error => 0b1111,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0b0001 => Some(MessageType::FullClientRequest),
            0b1001 => Some(MessageType::FrontEndResultServer),
            0b1011 => Some(MessageType::AudioOnlyServer),
            0b1111 => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// One decoded server frame.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub msg_type: MessageType,
    /// Negative sequence terminates the response stream.
    pub sequence: i32,
    /// Error code for [`MessageType::Error`] frames.
    pub error_code: Option<u32>,
    pub payload: Vec<u8>,
}

const PROTOCOL_VERSION: u8 = 0b0001;
const HEADER_WORDS: u8 = 0b0001;
const SERIALIZATION_JSON: u8 = 0b0001;

// ── Encoding ───────────────────────────────────────────────────────

/// Wrap a JSON submit payload in the client framing.
pub fn encode_full_client_request(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push((PROTOCOL_VERSION << 4) | HEADER_WORDS);
    frame.push(MessageType::FullClientRequest.code() << 4);
    frame.push(SERIALIZATION_JSON << 4);
    frame.push(0);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ── Decoding ───────────────────────────────────────────────────────

fn read_u32(buf: &[u8], offset: usize) -> anyhow::Result<u32> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow::anyhow!("frame truncated at offset {offset}"))?
        .try_into()?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decode one server frame.
pub fn decode_server_message(buf: &[u8]) -> anyhow::Result<ServerMessage> {
    if buf.len() < 4 {
        anyhow::bail!("frame too short: {} bytes", buf.len());
    }

    let header_size = ((buf[0] & 0x0F) as usize) * 4;
    if header_size < 4 || buf.len() < header_size {
        anyhow::bail!("invalid header size: {header_size}");
    }

    let type_code = buf[1] >> 4;
    let flags = buf[1] & 0x0F;
    let msg_type = MessageType::from_code(type_code)
        .ok_or_else(|| anyhow::anyhow!("unknown message type: {type_code:#06b}"))?;

    let mut offset = header_size;
    let mut sequence = 0i32;
    let mut error_code = None;

    match msg_type {
        MessageType::Error => {
            error_code = Some(read_u32(buf, offset)?);
            offset += 4;
        }
        MessageType::AudioOnlyServer | MessageType::FrontEndResultServer => {
            if flags != 0 {
                sequence = read_u32(buf, offset)? as i32;
                offset += 4;
            }
        }
        MessageType::FullClientRequest => {}
    }

    let payload_size = read_u32(buf, offset)? as usize;
    offset += 4;
    let payload = buf
        .get(offset..offset + payload_size)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "payload truncated: declared {payload_size}, available {}",
                buf.len().saturating_sub(offset)
            )
        })?
        .to_vec();

    Ok(ServerMessage {
        msg_type,
        sequence,
        error_code,
        payload,
    })
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a server frame the way the service would.
    pub(crate) fn encode_server_message(
        msg_type: MessageType,
        sequence: i32,
        error_code: Option<u32>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.push((PROTOCOL_VERSION << 4) | HEADER_WORDS);
        let flags = if msg_type == MessageType::Error || sequence != 0 {
            0b0001
        } else {
            0
        };
        frame.push((msg_type.code() << 4) | flags);
        frame.push(SERIALIZATION_JSON << 4);
        frame.push(0);
        if let Some(code) = error_code {
            frame.extend_from_slice(&code.to_be_bytes());
        } else if flags != 0 {
            frame.extend_from_slice(&(sequence as u32).to_be_bytes());
        }
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn client_request_layout() {
        let frame = encode_full_client_request(b"{\"a\":1}");
        assert_eq!(frame[0], 0x11);
        assert_eq!(frame[1], 0x10);
        assert_eq!(frame[2], 0x10);
        assert_eq!(frame[3], 0x00);
        assert_eq!(u32::from_be_bytes(frame[4..8].try_into().unwrap()), 7);
        assert_eq!(&frame[8..], b"{\"a\":1}");
    }

    #[test]
    fn audio_chunk_roundtrip() {
        let frame = encode_server_message(MessageType::AudioOnlyServer, 3, None, &[1, 2, 3, 4]);
        let msg = decode_server_message(&frame).unwrap();
        assert_eq!(msg.msg_type, MessageType::AudioOnlyServer);
        assert_eq!(msg.sequence, 3);
        assert_eq!(msg.payload, vec![1, 2, 3, 4]);
        assert!(msg.error_code.is_none());
    }

    #[test]
    fn negative_sequence_survives_roundtrip() {
        let frame = encode_server_message(MessageType::AudioOnlyServer, -5, None, &[9]);
        let msg = decode_server_message(&frame).unwrap();
        assert_eq!(msg.sequence, -5);
        assert!(msg.sequence < 0);
    }

    #[test]
    fn unflagged_message_has_zero_sequence() {
        let frame = encode_server_message(MessageType::FrontEndResultServer, 0, None, b"{}");
        let msg = decode_server_message(&frame).unwrap();
        assert_eq!(msg.sequence, 0);
        assert_eq!(msg.payload, b"{}");
    }

    #[test]
    fn error_message_carries_code_and_text() {
        let frame = encode_server_message(MessageType::Error, 0, Some(3003), b"quota exceeded");
        let msg = decode_server_message(&frame).unwrap();
        assert_eq!(msg.msg_type, MessageType::Error);
        assert_eq!(msg.error_code, Some(3003));
        assert_eq!(msg.payload, b"quota exceeded");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_server_message(&[]).is_err());
        assert!(decode_server_message(&[0x11, 0xB1]).is_err());

        // Declared payload longer than the buffer.
        let mut frame = encode_server_message(MessageType::AudioOnlyServer, 1, None, &[1, 2, 3]);
        frame.truncate(frame.len() - 2);
        assert!(decode_server_message(&frame).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let frame = [0x11, 0x00, 0x10, 0x00, 0, 0, 0, 0];
        assert!(decode_server_message(&frame).is_err());
    }
}
