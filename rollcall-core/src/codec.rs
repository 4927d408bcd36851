//! Framing: one `|`-delimited ASCII line per message, payload gzip'd (when it helps) and base64'd.
//!
//! `TYPE|COMPRESSION|BASE64_PAYLOAD|ID|TIMESTAMP_MS|PRIORITY`

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::protocol::{Compression, Message, MessageType, QueueNotice, StudentRecord};

pub const FIELD_DELIMITER: char = '|';
const FIELD_COUNT: usize = 6;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Inflated payloads larger than this are treated as corrupt.
const MAX_INFLATED_LEN: u64 = 64 * 1024;

/// Encode a message into a single frame line. Never fails: if compression errors or does not
/// shrink the payload, the frame carries the raw bytes tagged `NONE`.
pub fn encode(msg: &Message) -> String {
    let (tag, body) = match msg.compression {
        Compression::Gzip => match compress(&msg.payload) {
            Ok(packed) if packed.len() < msg.payload.len() => (Compression::Gzip, packed),
            Ok(_) => (Compression::None, msg.payload.clone()),
            Err(e) => {
                debug!(id = %msg.id, error = %e, "gzip failed, sending raw payload");
                (Compression::None, msg.payload.clone())
            }
        },
        Compression::None => (Compression::None, msg.payload.clone()),
    };
    format!(
        "{}|{}|{}|{}|{}|{}",
        msg.kind.tag(),
        tag.tag(),
        BASE64.encode(body),
        msg.id,
        msg.timestamp_ms,
        msg.priority
    )
}

/// Encode into the bytes handed to the transport.
pub fn encode_frame(msg: &Message) -> Vec<u8> {
    encode(msg).into_bytes()
}

/// Decode one frame line. Trailing CR/LF is ignored. `retry_count` is always 0 on the
/// receiving side.
pub fn decode(line: &str) -> Result<Message, FrameDecodeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, FIELD_DELIMITER).collect();
    if fields.len() < FIELD_COUNT {
        return Err(FrameDecodeError::MissingFields {
            found: fields.len(),
        });
    }
    let kind = MessageType::from_tag(fields[0])
        .ok_or_else(|| FrameDecodeError::UnknownType(fields[0].to_string()))?;
    let timestamp_ms: i64 = fields[4]
        .parse()
        .map_err(|_| FrameDecodeError::InvalidNumber {
            field: "timestamp",
            value: fields[4].to_string(),
        })?;
    let priority: i32 = fields[5]
        .parse()
        .map_err(|_| FrameDecodeError::InvalidNumber {
            field: "priority",
            value: fields[5].to_string(),
        })?;
    let body = BASE64.decode(fields[2])?;
    let (compression, payload) = match Compression::from_tag(fields[1]) {
        Some(Compression::Gzip) => (Compression::Gzip, decompress(&body)?),
        Some(Compression::None) => (Compression::None, body),
        None if is_gzip(&body) => (Compression::Gzip, decompress(&body)?),
        None => (Compression::None, body),
    };
    Ok(Message {
        id: fields[3].to_string(),
        kind,
        payload,
        timestamp_ms,
        compression,
        retry_count: 0,
        priority,
    })
}

/// Decode raw transport bytes. Non-UTF-8 input is a malformed frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let line = std::str::from_utf8(bytes).map_err(|_| FrameDecodeError::NotText)?;
    decode(line)
}

/// Error decoding a frame line.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame has {found} fields, need 6")]
    MissingFields { found: usize },
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{field} is not numeric: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("payload is not valid base64: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
    #[error("compressed payload is corrupt: {0}")]
    CorruptPayload(#[from] std::io::Error),
    #[error("inflated payload exceeds 64 KiB")]
    PayloadTooLarge,
    #[error("frame is not text")]
    NotText,
}

/// Older senders' frame shapes. Only attempted after [`decode`] fails.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyFrame {
    /// `name|rollNumber`, `ATTENDANCE|name|roll` or `ATTENDANCE|name|roll|timestamp`.
    Record {
        record: StudentRecord,
        timestamp_ms: Option<i64>,
    },
    /// `QUEUE|pos|wait`
    Queue(QueueNotice),
    /// `RECONNECT|pos|wait`
    Reconnect(QueueNotice),
}

pub fn decode_legacy(line: &str) -> Option<LegacyFrame> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("QUEUE|") {
        return QueueNotice::from_payload(rest).map(LegacyFrame::Queue);
    }
    if let Some(rest) = line.strip_prefix("RECONNECT|") {
        return QueueNotice::from_payload(rest).map(LegacyFrame::Reconnect);
    }
    let record = StudentRecord::from_payload(line)?;
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    let timestamp_ms = match fields.as_slice() {
        [_, _, _, ts] => ts.trim().parse().ok(),
        _ => None,
    };
    Some(LegacyFrame::Record {
        record,
        timestamp_ms,
    })
}

/// True if `bytes` starts with the gzip magic header.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= GZIP_MAGIC.len() && bytes[..2] == GZIP_MAGIC
}

pub fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(bytes.len()), flate2::Compression::best());
    enc.write_all(bytes)?;
    enc.finish()
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, FrameDecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(FrameDecodeError::PayloadTooLarge);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attendance(payload: &str) -> Message {
        Message::new("a1f3c0-65f2a1-7", MessageType::Attendance, payload)
            .with_timestamp(1_700_000_000_123)
            .with_priority(2)
    }

    #[test]
    fn roundtrip_attendance_payload() {
        let msg = attendance("ATTENDANCE|Jane Doe|CS001");
        let line = encode(&msg);
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.payload_str(), Some("ATTENDANCE|Jane Doe|CS001"));
    }

    #[test]
    fn field_order() {
        let msg = attendance("x");
        let line = encode(&msg);
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(fields[0], "ATTENDANCE");
        assert_eq!(fields[1], "NONE");
        assert_eq!(fields[2], "eA==");
        assert_eq!(fields[3], "a1f3c0-65f2a1-7");
        assert_eq!(fields[4], "1700000000123");
        assert_eq!(fields[5], "2");
    }

    #[test]
    fn gzip_used_when_it_shrinks() {
        let text = "ATTENDANCE|".repeat(20);
        let msg = attendance(&text).with_compression(Compression::Gzip);
        let line = encode(&msg);
        assert!(line.starts_with("ATTENDANCE|GZIP|"));
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn gzip_falls_back_when_payload_grows() {
        let msg = attendance("Jo|R1").with_compression(Compression::Gzip);
        let line = encode(&msg);
        assert!(line.starts_with("ATTENDANCE|NONE|"));
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.compression, Compression::None);
    }

    #[test]
    fn short_frame_is_malformed() {
        let err = decode("ATTENDANCE|GZIP|abc").unwrap_err();
        assert!(matches!(err, FrameDecodeError::MissingFields { found: 3 }));
        let err = decode("ATTENDANCE|GZIP|abc|id1").unwrap_err();
        assert!(matches!(err, FrameDecodeError::MissingFields { found: 4 }));
    }

    #[test]
    fn unknown_type_and_bad_numbers() {
        assert!(matches!(
            decode("HELLO|NONE|eA==|id|1|0"),
            Err(FrameDecodeError::UnknownType(_))
        ));
        assert!(matches!(
            decode("ACK|NONE|eA==|id|later|0"),
            Err(FrameDecodeError::InvalidNumber {
                field: "timestamp",
                ..
            })
        ));
        assert!(matches!(
            decode("ACK|NONE|eA==|id|1|high"),
            Err(FrameDecodeError::InvalidNumber {
                field: "priority",
                ..
            })
        ));
        assert!(matches!(
            decode("ACK|NONE|!!!|id|1|0"),
            Err(FrameDecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn untagged_payload_sniffed_by_magic() {
        let packed = compress(b"Jane Doe|CS001").unwrap();
        let line = format!("ATTENDANCE||{}|id9|5|0", BASE64.encode(&packed));
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.compression, Compression::Gzip);
        assert_eq!(decoded.payload, b"Jane Doe|CS001");

        let line = format!("ATTENDANCE||{}|id9|5|0", BASE64.encode(b"Jane Doe|CS001"));
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.compression, Compression::None);
        assert_eq!(decoded.payload, b"Jane Doe|CS001");
    }

    #[test]
    fn corrupt_gzip_rejected() {
        let line = format!("ATTENDANCE|GZIP|{}|id|1|0", BASE64.encode([0x1f, 0x8b, 0, 1]));
        assert!(matches!(
            decode(&line),
            Err(FrameDecodeError::CorruptPayload(_))
        ));
    }

    #[test]
    fn trailing_newline_ignored() {
        let msg = attendance("ATTENDANCE|Jane Doe|CS001");
        let line = format!("{}\r\n", encode(&msg));
        assert_eq!(decode(&line).unwrap(), msg);
        assert!(matches!(
            decode_frame(&[0xff, 0xfe]),
            Err(FrameDecodeError::NotText)
        ));
    }

    #[test]
    fn legacy_forms() {
        assert_eq!(
            decode_legacy("Jane Doe|CS001"),
            Some(LegacyFrame::Record {
                record: StudentRecord::new("Jane Doe", "CS001"),
                timestamp_ms: None,
            })
        );
        assert_eq!(
            decode_legacy("ATTENDANCE|Jane Doe|CS001|1700000000000"),
            Some(LegacyFrame::Record {
                record: StudentRecord::new("Jane Doe", "CS001"),
                timestamp_ms: Some(1_700_000_000_000),
            })
        );
        match decode_legacy("QUEUE|4|9") {
            Some(LegacyFrame::Queue(n)) => {
                assert_eq!(n.position, 4);
                assert_eq!(n.wait_secs, 9);
            }
            other => panic!("expected Queue, got {other:?}"),
        }
        assert!(matches!(
            decode_legacy("RECONNECT|1|3"),
            Some(LegacyFrame::Reconnect(_))
        ));
        assert_eq!(decode_legacy("garbage"), None);
    }

    #[test]
    fn structured_frame_not_taken_as_legacy_first() {
        // Six fields parse structurally even though the legacy parser would reject them.
        let msg = attendance("Jane Doe|CS001");
        assert!(decode(&encode(&msg)).is_ok());
    }
}
