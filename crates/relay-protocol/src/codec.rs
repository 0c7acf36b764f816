//! Codec for encoding and decoding chat messages.
//!
//! Every message is a fixed 24-byte header followed by the raw payload:
//!
//! ```text
//! [0..10)   sender, zero-padded
//! [10..20)  recipient, zero-padded
//! [20..22)  big-endian u16 payload length
//! [22]      message kind
//! [23]      reserved, zero
//! [24..)    payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use crate::message::{ChatMessage, MessageKind};

/// Header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Maximum encoded length of a sender or recipient name.
pub const NAME_LEN: usize = 10;

/// Maximum payload size, bounded by the 16-bit length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const SENDER_OFFSET: usize = 0;
const RECIPIENT_OFFSET: usize = 10;
const LENGTH_OFFSET: usize = 20;
const KIND_OFFSET: usize = 22;

/// Protocol errors that can occur while encoding, decoding or reading.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload does not fit the 16-bit length field.
    #[error("Payload size {0} exceeds maximum {max}", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    /// Not enough bytes to decode a message.
    #[error("Truncated message: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        got: usize,
    },

    /// Unknown message kind byte.
    #[error("Invalid message kind: {0}")]
    InvalidKind(u8),

    /// The peer closed the stream before a new header started.
    #[error("Connection closed")]
    Closed,

    /// The header did not complete within the retry budget.
    #[error(
        "Incomplete header: read {received} of {len} bytes after {attempts} attempts",
        len = HEADER_LEN
    )]
    HeaderIncomplete {
        /// Header bytes read so far.
        received: usize,
        /// Attempts made.
        attempts: u32,
    },

    /// Reading the payload failed.
    #[error("Payload read failed: {0}")]
    Payload(#[source] io::Error),

    /// I/O error while reading the header.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether this error is an orderly close rather than a failure.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}

/// Encode a message to bytes.
///
/// Names longer than [`NAME_LEN`] bytes are truncated.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode(msg: &ChatMessage) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.data.len());
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_into(msg: &ChatMessage, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if msg.data.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(msg.data.len()));
    }

    buf.reserve(HEADER_LEN + msg.data.len());
    put_name(buf, &msg.sender);
    put_name(buf, &msg.recipient);
    buf.put_u16(msg.data.len() as u16);
    buf.put_u8(msg.kind.into());
    buf.put_u8(0);
    buf.extend_from_slice(&msg.data);

    Ok(())
}

/// Decode one complete message.
///
/// Bytes past the declared payload length are ignored.
///
/// # Errors
///
/// Returns an error if the data is shorter than the header or the declared
/// payload, or if the kind byte is unknown.
pub fn decode(data: &[u8]) -> Result<ChatMessage, ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LEN,
            got: data.len(),
        });
    }

    let total = HEADER_LEN + payload_len(&data[..HEADER_LEN]);
    if data.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total,
            got: data.len(),
        });
    }

    let kind = MessageKind::try_from(data[KIND_OFFSET])
        .map_err(|_| ProtocolError::InvalidKind(data[KIND_OFFSET]))?;

    Ok(ChatMessage {
        sender: read_name(&data[SENDER_OFFSET..SENDER_OFFSET + NAME_LEN]),
        recipient: read_name(&data[RECIPIENT_OFFSET..RECIPIENT_OFFSET + NAME_LEN]),
        kind,
        data: Bytes::copy_from_slice(&data[HEADER_LEN..total]),
    })
}

/// Payload length declared by a header.
///
/// `header` must hold at least [`HEADER_LEN`] bytes.
#[must_use]
pub fn payload_len(header: &[u8]) -> usize {
    u16::from_be_bytes([header[LENGTH_OFFSET], header[LENGTH_OFFSET + 1]]) as usize
}

/// Write `name` cut to [`NAME_LEN`] bytes at a char boundary, zero-padded.
fn put_name(buf: &mut BytesMut, name: &str) {
    let mut n = name.len().min(NAME_LEN);
    while !name.is_char_boundary(n) {
        n -= 1;
    }
    buf.extend_from_slice(&name.as_bytes()[..n]);
    buf.put_bytes(0, NAME_LEN - n);
}

/// Read a name field up to the first zero byte, keeping only the leading
/// valid UTF-8 so the result never exceeds [`NAME_LEN`] bytes.
fn read_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let name = &field[..end];
    match std::str::from_utf8(name) {
        Ok(s) => s.to_owned(),
        Err(e) => String::from_utf8_lossy(&name[..e.valid_up_to()]).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let messages = vec![
            ChatMessage::init("Silvermoon", "Silvermoon is online"),
            ChatMessage::chat("John", "Adam", "helloworld"),
            ChatMessage::chat("John", "", "hello everyone"),
            ChatMessage::in_cache("Bill", "127.0.0.1:50000"),
            ChatMessage::chat("a", "b", Bytes::new()),
        ];

        for msg in messages {
            let encoded = encode(&msg).unwrap();
            assert_eq!(encoded.len(), HEADER_LEN + msg.data.len());
            assert_eq!(decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_header_layout() {
        let msg = ChatMessage::chat("Bill", "Jill", "hi");
        let encoded = encode(&msg).unwrap();

        assert_eq!(encoded.len(), 26);
        assert_eq!(&encoded[0..4], b"Bill");
        assert!(encoded[4..10].iter().all(|&b| b == 0));
        assert_eq!(&encoded[10..14], b"Jill");
        assert!(encoded[14..20].iter().all(|&b| b == 0));
        assert_eq!(&encoded[20..22], &[0, 2]);
        assert_eq!(encoded[22], 1);
        assert_eq!(encoded[23], 0);
        assert_eq!(&encoded[24..], b"hi");
    }

    #[test]
    fn test_names_truncated_to_ten_bytes() {
        let msg = ChatMessage::chat("Swiftbreeze", "Quickrunner", "hello");
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded.len(), 29);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.sender, "Swiftbreez");
        assert_eq!(decoded.recipient, "Quickrunne");
        assert_eq!(decoded.data, msg.data);
    }

    #[test]
    fn test_multibyte_name_cut_at_char_boundary() {
        // 11 bytes; byte 10 falls inside the last 'Ä'
        let msg = ChatMessage::chat("aÄÄÄÄÄ", "", "hi");
        let encoded = encode(&msg).unwrap();
        assert_eq!(&encoded[..9], "aÄÄÄÄ".as_bytes());
        assert_eq!(encoded[9], 0);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.sender, "aÄÄÄÄ");
        assert!(decoded.sender.len() <= NAME_LEN);
        assert_eq!(encode(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_invalid_name_bytes_are_dropped() {
        let mut raw = encode(&ChatMessage::chat("bill", "jill", "hi"))
            .unwrap()
            .to_vec();
        raw[..NAME_LEN].copy_from_slice(&[0xFF; NAME_LEN]);
        raw[10..14].copy_from_slice(b"ab\xFFc");

        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.sender, "");
        assert_eq!(decoded.recipient, "ab");
        assert!(decoded.sender.len() <= NAME_LEN);
        assert_eq!(&decoded.data[..], b"hi");
    }

    #[test]
    fn test_full_width_names() {
        let msg = ChatMessage::chat("Silvermoon", "Lightbeam", "Wolverine");
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.sender, "Silvermoon");
        assert_eq!(decoded.recipient, "Lightbeam");
    }

    #[test]
    fn test_payload_may_contain_nul() {
        let msg = ChatMessage::chat("bill", "", b"a\0b\0".to_vec());
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(&decoded.data[..], b"a\0b\0");
    }

    #[test]
    fn test_payload_too_large() {
        let msg = ChatMessage::chat("bill", "", vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        match encode(&msg) {
            Err(ProtocolError::PayloadTooLarge(n)) => assert_eq!(n, MAX_PAYLOAD_SIZE + 1),
            other => panic!("Expected PayloadTooLarge error, got {:?}", other),
        }

        let msg = ChatMessage::chat("bill", "", vec![7u8; MAX_PAYLOAD_SIZE]);
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.data.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = encode(&ChatMessage::chat("bill", "jill", "hello")).unwrap();

        match decode(&encoded[..10]) {
            Err(ProtocolError::Truncated { needed, got }) => {
                assert_eq!(needed, HEADER_LEN);
                assert_eq!(got, 10);
            }
            other => panic!("Expected Truncated error, got {:?}", other),
        }

        match decode(&encoded[..HEADER_LEN + 2]) {
            Err(ProtocolError::Truncated { needed, .. }) => assert_eq!(needed, HEADER_LEN + 5),
            other => panic!("Expected Truncated error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_kind() {
        let mut encoded = BytesMut::new();
        encode_into(&ChatMessage::chat("bill", "", "x"), &mut encoded).unwrap();
        encoded[22] = 9;

        assert!(matches!(
            decode(&encoded),
            Err(ProtocolError::InvalidKind(9))
        ));
    }

    #[test]
    fn test_encode_into_appends() {
        let first = ChatMessage::chat("bill", "", "one");
        let second = ChatMessage::chat("jill", "", "two");

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        let split = buf.len();
        encode_into(&second, &mut buf).unwrap();

        assert_eq!(decode(&buf[..split]).unwrap(), first);
        assert_eq!(decode(&buf[split..]).unwrap(), second);
    }
}
