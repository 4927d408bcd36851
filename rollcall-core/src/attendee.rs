//! Attendee side of the exchange: send one record, wait for the ACK, honor queue notices.
//!
//! Host-driven like the collector engine. The host opens a link when asked (`Connect`), reports
//! link events and frames, and calls [`AttendeeSession::tick`] periodically. The record keeps
//! one message id across every resend and reconnect so the collector can dedupe it.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::{self, LegacyFrame};
use crate::config::EngineConfig;
use crate::protocol::{
    parse_failure, wall_clock_ms, Compression, FailureCode, Message, MessageType, QueueNotice,
    StudentRecord, ValidationError,
};
use crate::retry::{RetryExhausted, RetryManager};
use crate::sequencer::Sequencer;

/// Floor on how soon a queued attendee comes back, whatever the notice says.
const MIN_QUEUE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendeePhase {
    /// Waiting to (re)connect.
    Idle,
    Connecting,
    AwaitingAck,
    /// Told to wait; reconnects on the notice's estimate.
    Queued,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttendeeError {
    #[error("collector refused the record ({code:?}): {detail}")]
    Rejected { code: FailureCode, detail: String },
    #[error(transparent)]
    Unacknowledged(#[from] RetryExhausted),
    #[error("collector unreachable after {0} attempts")]
    Unreachable(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttendeeAction {
    /// Open a link to the collector, then call `on_connected`.
    Connect,
    Send(Vec<u8>),
    Disconnect,
    /// The collector acked the record with this id.
    Confirmed(String),
    Failed(AttendeeError),
}

pub struct AttendeeSession {
    record: StudentRecord,
    message: Message,
    retry: RetryManager,
    max_retries: u32,
    phase: AttendeePhase,
    connected: bool,
    reconnect_at: Option<Instant>,
    /// Links that dropped before an answer; queue-directed reconnects do not count.
    failed_links: u32,
    /// Immediate resends after `MALFORMED_FRAME`, bounded by `max_retries`.
    garbled_resends: u32,
    last_notice: Option<QueueNotice>,
}

impl AttendeeSession {
    pub fn new(record: StudentRecord, config: &EngineConfig) -> Result<Self, ValidationError> {
        record.validate()?;
        let now_ms = wall_clock_ms();
        let message = Message::new(
            Sequencer::new().next_id(now_ms),
            MessageType::Attendance,
            record.to_payload(),
        )
        .with_timestamp(now_ms)
        .with_compression(Compression::Gzip);
        Ok(Self {
            record,
            message,
            retry: RetryManager::new(config.max_retries, config.retry_backoff()),
            max_retries: config.max_retries,
            phase: AttendeePhase::Idle,
            connected: false,
            reconnect_at: None,
            failed_links: 0,
            garbled_resends: 0,
            last_notice: None,
        })
    }

    /// First step: ask the host for a link.
    pub fn start(&mut self) -> Vec<AttendeeAction> {
        if self.phase != AttendeePhase::Idle {
            return Vec::new();
        }
        self.phase = AttendeePhase::Connecting;
        vec![AttendeeAction::Connect]
    }

    /// Link is up: send the record (retry count starts over on every link).
    pub fn on_connected(&mut self, now: Instant) -> Vec<AttendeeAction> {
        self.connected = true;
        if self.is_finished() {
            return vec![AttendeeAction::Disconnect];
        }
        self.reconnect_at = None;
        self.phase = AttendeePhase::AwaitingAck;
        let attempt = Message {
            retry_count: 0,
            ..self.message.clone()
        };
        if let Err(e) = self.retry.schedule_retry(&attempt, now) {
            debug!(id = %e.id, "no resends configured");
        }
        debug!(id = %self.message.id, "record sent");
        vec![AttendeeAction::Send(codec::encode_frame(&attempt))]
    }

    pub fn on_frame(&mut self, bytes: &[u8], now: Instant) -> Vec<AttendeeAction> {
        let Ok(line) = std::str::from_utf8(bytes) else {
            debug!(len = bytes.len(), "non-text frame ignored");
            return Vec::new();
        };
        match codec::decode(line) {
            Ok(msg) => self.handle_message(msg, now),
            Err(err) => match codec::decode_legacy(line) {
                Some(LegacyFrame::Queue(notice)) => self.queued(notice, now),
                Some(LegacyFrame::Reconnect(_)) => self.reconnect_now(now),
                _ => {
                    debug!(error = %err, "undecodable frame ignored");
                    Vec::new()
                }
            },
        }
    }

    /// Link dropped, by either side.
    pub fn on_disconnected(&mut self, now: Instant) -> Vec<AttendeeAction> {
        self.connected = false;
        self.retry.cancel(&self.message.id);
        match self.phase {
            AttendeePhase::AwaitingAck | AttendeePhase::Connecting => {
                self.failed_links += 1;
                if self.failed_links > self.max_retries {
                    warn!(attempts = self.failed_links, "giving up on collector");
                    self.phase = AttendeePhase::Failed;
                    return vec![AttendeeAction::Failed(AttendeeError::Unreachable(
                        self.failed_links,
                    ))];
                }
                let delay = self.retry.delay(self.failed_links - 1);
                info!(delay_ms = delay.as_millis() as u64, "link lost before ack, will reconnect");
                self.phase = AttendeePhase::Idle;
                self.reconnect_at = Some(now + delay);
            }
            _ => {}
        }
        Vec::new()
    }

    pub fn tick(&mut self, now: Instant) -> Vec<AttendeeAction> {
        let mut actions = Vec::new();
        for due in self.retry.drain_due(now) {
            if !self.connected || self.phase != AttendeePhase::AwaitingAck {
                continue;
            }
            debug!(id = %due.id, attempt = due.retry_count, "resending record");
            actions.push(AttendeeAction::Send(codec::encode_frame(&due)));
            if let Err(exhausted) = self.retry.schedule_retry(&due, now) {
                warn!(id = %exhausted.id, "record never acknowledged");
                self.phase = AttendeePhase::Failed;
                actions.push(AttendeeAction::Failed(exhausted.into()));
                actions.push(AttendeeAction::Disconnect);
            }
        }
        if let Some(at) = self.reconnect_at {
            if now >= at && !self.connected {
                self.reconnect_at = None;
                self.phase = AttendeePhase::Connecting;
                actions.push(AttendeeAction::Connect);
            }
        }
        actions
    }

    pub fn phase(&self) -> AttendeePhase {
        self.phase
    }

    pub fn record(&self) -> &StudentRecord {
        &self.record
    }

    pub fn message_id(&self) -> &str {
        &self.message.id
    }

    pub fn last_notice(&self) -> Option<QueueNotice> {
        self.last_notice
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, AttendeePhase::Confirmed | AttendeePhase::Failed)
    }

    fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<AttendeeAction> {
        match msg.kind {
            // A late ACK still upgrades a failed attempt.
            MessageType::Ack if msg.payload_str() == Some(self.message.id.as_str()) => {
                self.confirm()
            }
            MessageType::Duplicate => {
                info!("collector already has this record");
                self.confirm()
            }
            MessageType::QueueStatus => match msg.payload_str().and_then(QueueNotice::from_payload)
            {
                Some(notice) => self.queued(notice, now),
                None => {
                    debug!(id = %msg.id, "unreadable queue notice");
                    Vec::new()
                }
            },
            MessageType::Retry => {
                let ack = Message::new(
                    Sequencer::new().next_id(wall_clock_ms()),
                    MessageType::Ack,
                    msg.id.as_bytes(),
                );
                let mut actions = vec![AttendeeAction::Send(codec::encode_frame(&ack))];
                actions.extend(self.reconnect_now(now));
                actions
            }
            MessageType::Error => {
                let text = msg.payload_str().unwrap_or_default();
                let (code, detail) =
                    parse_failure(text).unwrap_or((FailureCode::MalformedFrame, text));
                if self.is_finished() {
                    return Vec::new();
                }
                match code {
                    FailureCode::Validation | FailureCode::PayloadTooLarge => {
                        self.refused(code, detail)
                    }
                    FailureCode::MalformedFrame => self.resend_garbled(detail),
                    FailureCode::SessionCompleting => {
                        debug!(detail, "collector still settling, waiting for ack");
                        Vec::new()
                    }
                }
            }
            other => {
                debug!(kind = %other, id = %msg.id, "frame ignored");
                Vec::new()
            }
        }
    }

    fn refused(&mut self, code: FailureCode, detail: &str) -> Vec<AttendeeAction> {
        warn!(?code, detail, "record refused");
        self.retry.cancel(&self.message.id);
        self.phase = AttendeePhase::Failed;
        vec![
            AttendeeAction::Failed(AttendeeError::Rejected {
                code,
                detail: detail.to_string(),
            }),
            AttendeeAction::Disconnect,
        ]
    }

    /// The collector could not read our frame. Send it again now; the scheduled resend stays.
    fn resend_garbled(&mut self, detail: &str) -> Vec<AttendeeAction> {
        if !self.connected || self.phase != AttendeePhase::AwaitingAck {
            return Vec::new();
        }
        self.garbled_resends += 1;
        if self.garbled_resends > self.max_retries {
            return self.refused(FailureCode::MalformedFrame, detail);
        }
        debug!(detail, attempt = self.garbled_resends, "frame garbled on the link, resending");
        vec![AttendeeAction::Send(codec::encode_frame(&self.message))]
    }

    fn confirm(&mut self) -> Vec<AttendeeAction> {
        self.retry.cancel(&self.message.id);
        self.reconnect_at = None;
        if self.phase == AttendeePhase::Confirmed {
            return Vec::new();
        }
        self.phase = AttendeePhase::Confirmed;
        info!(id = %self.message.id, roll = %self.record.roll_number, "attendance confirmed");
        vec![
            AttendeeAction::Confirmed(self.message.id.clone()),
            AttendeeAction::Disconnect,
        ]
    }

    fn queued(&mut self, notice: QueueNotice, now: Instant) -> Vec<AttendeeAction> {
        if self.is_finished() {
            return Vec::new();
        }
        self.retry.cancel(&self.message.id);
        self.last_notice = Some(notice);
        self.phase = AttendeePhase::Queued;
        let wait = Duration::from_secs(notice.wait_secs).max(MIN_QUEUE_BACKOFF);
        self.reconnect_at = Some(now + wait);
        info!(
            position = notice.position,
            wait_secs = notice.wait_secs,
            "queued by collector"
        );
        vec![AttendeeAction::Disconnect]
    }

    fn reconnect_now(&mut self, now: Instant) -> Vec<AttendeeAction> {
        if self.is_finished() || self.connected {
            return Vec::new();
        }
        self.phase = AttendeePhase::Queued;
        self.reconnect_at = Some(now);
        Vec::new()
    }
}
