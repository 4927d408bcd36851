//! Rollcall wire protocol: message types, attendance records, status payloads.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Practical payload ceiling of the proximity link, in bytes per write.
pub const MAX_PAYLOAD_BYTES: usize = 512;

/// Longest accepted attendee name, in characters.
pub const MAX_NAME_LEN: usize = 30;

/// Longest accepted roll number, in characters.
pub const MAX_ROLL_LEN: usize = 15;

const FORBIDDEN_CHARS: [char; 2] = ['|', ':'];

/// Application message kinds. The tag is the first field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Attendance,
    Ack,
    Confirmed,
    Error,
    Duplicate,
    QueueStatus,
    BatchAck,
    Heartbeat,
    Retry,
    Compressed,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Attendance,
        MessageType::Ack,
        MessageType::Confirmed,
        MessageType::Error,
        MessageType::Duplicate,
        MessageType::QueueStatus,
        MessageType::BatchAck,
        MessageType::Heartbeat,
        MessageType::Retry,
        MessageType::Compressed,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            MessageType::Attendance => "ATTENDANCE",
            MessageType::Ack => "ACK",
            MessageType::Confirmed => "CONFIRMED",
            MessageType::Error => "ERROR",
            MessageType::Duplicate => "DUPLICATE",
            MessageType::QueueStatus => "QUEUE_STATUS",
            MessageType::BatchAck => "BATCH_ACK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Retry => "RETRY",
            MessageType::Compressed => "COMPRESSED",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Payload compression requested by the sender (and carried as the frame's second field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub fn tag(self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Gzip => "GZIP",
        }
    }

    /// `None` for a missing or unrecognized tag; the decoder then sniffs the payload.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "NONE" => Some(Compression::None),
            "GZIP" => Some(Compression::Gzip),
            _ => None,
        }
    }
}

/// One application message. Identity is `id`; a resend keeps the id and bumps `retry_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageType,
    pub payload: Vec<u8>,
    pub timestamp_ms: i64,
    pub compression: Compression,
    /// Local only: not carried on the wire.
    pub retry_count: u32,
    pub priority: i32,
}

impl Message {
    pub fn new(id: impl Into<String>, kind: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: payload.into(),
            timestamp_ms: wall_clock_ms(),
            compression: Compression::None,
            retry_count: 0,
            priority: 0,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// The next logical attempt of this message: same id, `retry_count + 1`.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count = next.retry_count.saturating_add(1);
        next
    }
}

/// Milliseconds since the Unix epoch; 0 if the clock is before the epoch.
pub fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The domain record handed to the storage/sync sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentRecord {
    pub name: String,
    pub roll_number: String,
}

impl StudentRecord {
    pub fn new(name: impl Into<String>, roll_number: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roll_number: roll_number.into(),
        }
    }

    /// Reject blank, oversized, or delimiter-carrying fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::BlankName);
        }
        if self.roll_number.trim().is_empty() {
            return Err(ValidationError::BlankRollNumber);
        }
        let name_len = self.name.chars().count();
        if name_len > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong(name_len));
        }
        let roll_len = self.roll_number.chars().count();
        if roll_len > MAX_ROLL_LEN {
            return Err(ValidationError::RollNumberTooLong(roll_len));
        }
        if let Some(c) = self
            .name
            .chars()
            .chain(self.roll_number.chars())
            .find(|c| FORBIDDEN_CHARS.contains(c))
        {
            return Err(ValidationError::ForbiddenCharacter(c));
        }
        Ok(())
    }

    /// Attendance payload text: `ATTENDANCE|name|roll`.
    pub fn to_payload(&self) -> String {
        format!(
            "{}|{}|{}",
            MessageType::Attendance.tag(),
            self.name,
            self.roll_number
        )
    }

    /// Parse an attendance payload. Accepts `ATTENDANCE|name|roll`, `ATTENDANCE|name|roll|timestamp`
    /// and the bare `name|roll` form. Does not validate field contents.
    pub fn from_payload(text: &str) -> Option<Self> {
        let text = text.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = text.split('|').collect();
        match fields.as_slice() {
            [tag, name, roll] if *tag == MessageType::Attendance.tag() => {
                Some(Self::new(name.trim(), roll.trim()))
            }
            [tag, name, roll, ts]
                if *tag == MessageType::Attendance.tag() && ts.trim().parse::<i64>().is_ok() =>
            {
                Some(Self::new(name.trim(), roll.trim()))
            }
            [name, roll] => Some(Self::new(name.trim(), roll.trim())),
            _ => None,
        }
    }
}

/// Why a record was refused before reaching the sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name is blank")]
    BlankName,
    #[error("roll number is blank")]
    BlankRollNumber,
    #[error("name is {0} characters (max 30)")]
    NameTooLong(usize),
    #[error("roll number is {0} characters (max 15)")]
    RollNumberTooLong(usize),
    #[error("forbidden character {0:?}")]
    ForbiddenCharacter(char),
}

/// Queue position and service estimates sent to a peer that could not be admitted.
/// Payload text: `position|waitSeconds|processingRate|successRate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueNotice {
    pub position: u32,
    pub wait_secs: u64,
    pub processing_rate: f32,
    pub success_rate: f32,
}

impl QueueNotice {
    pub fn to_payload(&self) -> String {
        format!(
            "{}|{}|{:.3}|{:.3}",
            self.position, self.wait_secs, self.processing_rate, self.success_rate
        )
    }

    /// Rates are optional so the two-field legacy body (`pos|wait`) parses too.
    pub fn from_payload(text: &str) -> Option<Self> {
        let mut fields = text.trim().split('|');
        let position = fields.next()?.trim().parse().ok()?;
        let wait_secs = fields.next()?.trim().parse().ok()?;
        let processing_rate = match fields.next() {
            Some(f) => f.trim().parse().ok()?,
            None => 0.0,
        };
        let success_rate = match fields.next() {
            Some(f) => f.trim().parse().ok()?,
            None => 0.0,
        };
        Some(Self {
            position,
            wait_secs,
            processing_rate,
            success_rate,
        })
    }
}

/// Failure classes carried in `ERROR` frames. Payload text: `CODE:detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    MalformedFrame,
    Validation,
    PayloadTooLarge,
    SessionCompleting,
}

impl FailureCode {
    pub fn tag(self) -> &'static str {
        match self {
            FailureCode::MalformedFrame => "MALFORMED_FRAME",
            FailureCode::Validation => "VALIDATION",
            FailureCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            FailureCode::SessionCompleting => "SESSION_COMPLETING",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        [
            FailureCode::MalformedFrame,
            FailureCode::Validation,
            FailureCode::PayloadTooLarge,
            FailureCode::SessionCompleting,
        ]
        .into_iter()
        .find(|c| c.tag() == tag)
    }
}

pub fn failure_payload(code: FailureCode, detail: &str) -> String {
    format!("{}:{}", code.tag(), detail)
}

/// Split an `ERROR` payload into its code and free-text detail.
pub fn parse_failure(text: &str) -> Option<(FailureCode, &str)> {
    let (code, detail) = text.split_once(':').unwrap_or((text, ""));
    FailureCode::from_tag(code).map(|c| (c, detail))
}
