//! Host-driven API: AttendanceEngine receives link events from the host, returns actions.
//!
//! Per link: `Connected -> AwaitingData -> Processing -> Completing`, then gone. A link that
//! cannot be admitted is queued, told its position, and closed; the peer reconnects on its own
//! estimate. Every phase has a deadline that [`AttendanceEngine::tick`] enforces.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::admission::{
    AdmissionError, AdmissionQueue, PeerState, QueueStatus, RollPrefixFastTrack,
    ThroughputEstimator,
};
use crate::codec::{self, LegacyFrame};
use crate::config::EngineConfig;
use crate::protocol::{
    failure_payload, wall_clock_ms, FailureCode, Message, MessageType, QueueNotice, StudentRecord,
};
use crate::quality::QualityMonitor;
use crate::retry::{RetryExhausted, RetryManager};
use crate::sequencer::Sequencer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Link up, services not yet discovered.
    Connected,
    AwaitingData,
    /// Record validated and being handed to the sink.
    Processing,
    /// Acked; settling before the link is released.
    Completing,
    /// No live link: a slot held for a dequeued peer until it reconnects.
    Reserved,
}

struct LinkSession {
    phase: LinkPhase,
    /// Engine-originated message ids this peer has not acked yet.
    pending_acks: HashSet<String>,
    deadline: Instant,
}

/// Failures surfaced to whoever initiated the affected send. Everything else is answered on
/// the link itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("{peer}: {source}")]
    RetryExhausted {
        peer: String,
        source: RetryExhausted,
    },
    #[error("link to {peer} timed out while {phase:?}")]
    LinkTimeout {
        peer: String,
        phase: LinkPhase,
        pending_acks: Vec<String>,
    },
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Write a frame on the peer's open link.
    Send(String, Vec<u8>),
    /// Push a frame on the peer's notification channel, if it still has one. May be dropped.
    Notify(String, Vec<u8>),
    /// Hand a validated record to the storage/sync sink. Fire-and-forget.
    Deliver(String, StudentRecord),
    /// Close the link after flushing queued writes.
    Close(String),
    QueueChanged(QueueStatus),
    Failed(DeliveryFailure),
}

/// Main coordinator. Host passes events; engine returns actions. Owns all admission, dedupe and
/// retry state, so the host must serialize calls (one owner task or one lock).
pub struct AttendanceEngine {
    config: EngineConfig,
    sequencer: Sequencer,
    quality: QualityMonitor,
    retry: RetryManager,
    admission: AdmissionQueue,
    links: HashMap<String, LinkSession>,
    /// Dequeued peers that have not reconnected yet, with the instant the hold lapses.
    reservations: HashMap<String, Instant>,
    /// Engine-originated message id -> addressed peer, for messages that expect an ACK.
    awaiting_ack: HashMap<String, String>,
    published_revision: u64,
}

impl AttendanceEngine {
    pub fn new(config: EngineConfig) -> Self {
        let mut admission = AdmissionQueue::new(
            config.max_connections,
            config.per_peer_processing_secs,
            config.connection_overhead_secs,
        );
        if !config.fast_track_prefixes.is_empty() {
            admission = admission.with_category_policy(Box::new(RollPrefixFastTrack::new(
                config.fast_track_prefixes.clone(),
            )));
        }
        let retry = RetryManager::new(config.max_retries, config.retry_backoff());
        let published_revision = admission.revision();
        Self {
            config,
            sequencer: Sequencer::new(),
            quality: QualityMonitor::new(),
            retry,
            admission,
            links: HashMap::new(),
            reservations: HashMap::new(),
            awaiting_ack: HashMap::new(),
            published_revision,
        }
    }

    /// Keep the configured queue policy but measure the processing rate with `estimator`.
    pub fn with_throughput_estimator(mut self, estimator: Box<dyn ThroughputEstimator>) -> Self {
        let admission = std::mem::take(&mut self.admission);
        self.admission = admission.with_throughput_estimator(estimator);
        self
    }

    pub fn with_quality_monitor(mut self, quality: QualityMonitor) -> Self {
        self.quality = quality;
        self
    }

    /// Link came up.
    pub fn on_connect(&mut self, peer: &str, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.links.contains_key(peer) {
            debug!(peer, "connect for a link already open");
            return actions;
        }
        if self.admission.is_served(peer) {
            info!(peer, "already recorded, refusing link");
            self.send(peer, MessageType::Duplicate, b"already recorded".to_vec(), &mut actions);
            actions.push(OutboundAction::Close(peer.to_string()));
            return self.publish(actions);
        }
        if self.reservations.remove(peer).is_some() {
            self.clear_acks_for(peer);
            info!(peer, "reserved peer reconnected");
            self.open_link(peer, now);
            return self.publish(actions);
        }
        match self.admission.admit(peer, now) {
            Ok(()) | Err(AdmissionError::AlreadyAdmitted) => self.open_link(peer, now),
            Err(AdmissionError::Full(_)) | Err(AdmissionError::AlreadyServed) => {
                self.queue_peer(peer, None, now, &mut actions)
            }
        }
        self.publish(actions)
    }

    /// The host finished service discovery on the link; data exchange may begin.
    pub fn on_services_discovered(&mut self, peer: &str, now: Instant) -> Vec<OutboundAction> {
        if self.link_phase(peer) == Some(LinkPhase::Connected) {
            self.enter_awaiting_data(peer, now);
        }
        Vec::new()
    }

    /// Bytes arrived on the peer's link.
    pub fn on_data(&mut self, peer: &str, bytes: &[u8], now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let Some(phase) = self.links.get(peer).map(|l| l.phase) else {
            debug!(peer, len = bytes.len(), "data on unknown link dropped");
            return actions;
        };
        if phase == LinkPhase::Connected {
            self.enter_awaiting_data(peer, now);
        }
        if bytes.len() > self.config.max_payload_bytes {
            warn!(peer, len = bytes.len(), "oversized payload, closing link");
            let detail = format!("{} bytes", bytes.len());
            self.send(
                peer,
                MessageType::Error,
                failure_payload(FailureCode::PayloadTooLarge, &detail).into_bytes(),
                &mut actions,
            );
            self.drop_link(peer, now);
            actions.push(OutboundAction::Close(peer.to_string()));
            self.fill_slots(now, &mut actions);
            return self.publish(actions);
        }
        let Ok(line) = std::str::from_utf8(bytes) else {
            self.reject_malformed(peer, "frame is not text", &mut actions);
            return self.publish(actions);
        };
        match codec::decode(line) {
            Ok(msg) => self.handle_message(peer, msg, now, &mut actions),
            Err(err) => match codec::decode_legacy(line) {
                Some(LegacyFrame::Record { record, .. }) => {
                    let id = format!("legacy-{}", record.roll_number);
                    self.handle_attendance(peer, &id, Some(record), now, &mut actions);
                }
                Some(_) => debug!(peer, "queue notice from a peer ignored"),
                None => self.reject_malformed(peer, &err.to_string(), &mut actions),
            },
        }
        self.publish(actions)
    }

    /// Link went down (peer-initiated or after our own `Close`).
    pub fn on_disconnect(&mut self, peer: &str, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.links.contains_key(peer) {
            self.drop_link(peer, now);
            self.fill_slots(now, &mut actions);
        } else {
            debug!(peer, "disconnect without open link");
        }
        self.publish(actions)
    }

    /// A transport write failed. The link is closed; nothing is retried at this layer.
    pub fn on_write_failed(&mut self, peer: &str, now: Instant) -> Vec<OutboundAction> {
        warn!(peer, "write failed, closing link");
        let mut actions = vec![OutboundAction::Close(peer.to_string())];
        actions.extend(self.on_disconnect(peer, now));
        actions
    }

    /// The peer left for good (out of range, session ended on its side). Drops every trace of
    /// it from the queue and reservations.
    pub fn on_peer_departed(&mut self, peer: &str, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        self.admission.remove(peer);
        if self.reservations.remove(peer).is_some() {
            self.clear_acks_for(peer);
            self.admission.release(peer);
        }
        if self.links.contains_key(peer) {
            self.drop_link(peer, now);
            actions.push(OutboundAction::Close(peer.to_string()));
        }
        self.quality.forget(peer);
        self.fill_slots(now, &mut actions);
        self.publish(actions)
    }

    /// Fresh link metrics. A queued peer is re-ranked with its new score.
    pub fn on_link_metrics(
        &mut self,
        peer: &str,
        signal_dbm: i32,
        latency_ms: u64,
    ) -> Vec<OutboundAction> {
        let quality = self.quality.update(peer, signal_dbm, latency_ms);
        if self.admission.state_of(peer) == PeerState::Queued {
            if let Some(position) = self.admission.reprioritize(peer, quality) {
                debug!(peer, quality, position, "queued peer re-ranked");
            }
        }
        self.publish(Vec::new())
    }

    /// Periodic tick: resend due messages, expire phase deadlines and reservations, drop queued
    /// peers that stopped coming back, hand freed slots to the queue.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();

        for msg in self.retry.drain_due(now) {
            let Some(target) = self.awaiting_ack.get(&msg.id).cloned() else {
                continue;
            };
            let frame = codec::encode_frame(&msg);
            if self.links.contains_key(&target) {
                actions.push(OutboundAction::Send(target.clone(), frame));
            } else {
                actions.push(OutboundAction::Notify(target.clone(), frame));
            }
            if let Err(exhausted) = self.retry.schedule_retry(&msg, now) {
                warn!(peer = %target, id = %exhausted.id, "no ack after retries");
                self.forget_ack(&exhausted.id);
                actions.push(OutboundAction::Failed(DeliveryFailure::RetryExhausted {
                    peer: target,
                    source: exhausted,
                }));
            }
        }

        let expired: Vec<(String, LinkPhase)> = self
            .links
            .iter()
            .filter(|(_, l)| now >= l.deadline)
            .map(|(p, l)| (p.clone(), l.phase))
            .collect();
        for (peer, phase) in expired {
            if phase == LinkPhase::Completing {
                self.drop_link(&peer, now);
                info!(peer = %peer, "exchange complete, link released");
            } else {
                warn!(peer = %peer, ?phase, "link timed out");
                let pending_acks = self.close_link(&peer);
                self.admission.release(&peer);
                actions.push(OutboundAction::Failed(DeliveryFailure::LinkTimeout {
                    peer: peer.clone(),
                    phase,
                    pending_acks,
                }));
            }
            actions.push(OutboundAction::Close(peer));
        }

        let lapsed: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in lapsed {
            warn!(peer = %peer, "reserved slot not claimed");
            self.reservations.remove(&peer);
            self.clear_acks_for(&peer);
            self.admission.release(&peer);
            actions.push(OutboundAction::Failed(DeliveryFailure::LinkTimeout {
                peer,
                phase: LinkPhase::Reserved,
                pending_acks: Vec::new(),
            }));
        }

        for gone in self.admission.expire_stale(now, self.config.queue_grace()) {
            let waited = now.saturating_duration_since(gone.enqueued_at);
            info!(peer = %gone.peer, waited_secs = waited.as_secs(), "queued peer never came back");
        }

        self.fill_slots(now, &mut actions);
        self.publish(actions)
    }

    pub fn status(&self) -> QueueStatus {
        self.admission.status()
    }

    pub fn link_phase(&self, peer: &str) -> Option<LinkPhase> {
        if let Some(link) = self.links.get(peer) {
            return Some(link.phase);
        }
        self.reservations
            .contains_key(peer)
            .then_some(LinkPhase::Reserved)
    }

    pub fn admission(&self) -> &AdmissionQueue {
        &self.admission
    }

    pub fn quality(&self) -> &QualityMonitor {
        &self.quality
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn open_links(&self) -> usize {
        self.links.len()
    }

    /// Engine-originated messages still waiting for an ACK.
    pub fn awaiting_ack(&self) -> usize {
        self.awaiting_ack.len()
    }

    fn handle_message(
        &mut self,
        peer: &str,
        msg: Message,
        now: Instant,
        actions: &mut Vec<OutboundAction>,
    ) {
        match msg.kind {
            MessageType::Attendance => {
                let record = msg.payload_str().and_then(StudentRecord::from_payload);
                self.handle_attendance(peer, &msg.id, record, now, actions);
            }
            MessageType::Ack => match msg.payload_str() {
                Some(acked) => self.on_ack(peer, acked),
                None => debug!(peer, "ack with non-text payload"),
            },
            MessageType::Heartbeat => {
                let data_timeout = self.config.data_timeout();
                if let Some(link) = self.links.get_mut(peer) {
                    if link.phase == LinkPhase::AwaitingData {
                        link.deadline = now + data_timeout;
                    }
                }
            }
            other => debug!(peer, kind = %other, id = %msg.id, "frame ignored"),
        }
    }

    fn handle_attendance(
        &mut self,
        peer: &str,
        id: &str,
        record: Option<StudentRecord>,
        now: Instant,
        actions: &mut Vec<OutboundAction>,
    ) {
        if self.sequencer.is_duplicate(id) {
            debug!(peer, id, "duplicate attendance, acking again");
            self.send(peer, MessageType::Ack, id.as_bytes().to_vec(), actions);
            return;
        }
        if self.link_phase(peer) != Some(LinkPhase::AwaitingData) {
            self.send(
                peer,
                MessageType::Error,
                failure_payload(FailureCode::SessionCompleting, "link is closing").into_bytes(),
                actions,
            );
            return;
        }
        let Some(record) = record else {
            self.reject_malformed(peer, "unrecognized attendance payload", actions);
            return;
        };
        if let Err(e) = record.validate() {
            info!(peer, error = %e, "record rejected");
            self.send(
                peer,
                MessageType::Error,
                failure_payload(FailureCode::Validation, &e.to_string()).into_bytes(),
                actions,
            );
            return;
        }

        self.set_phase(peer, LinkPhase::Processing);
        self.admission.mark_processing(peer);
        info!(peer, roll = %record.roll_number, "attendance recorded");
        actions.push(OutboundAction::Deliver(peer.to_string(), record));
        self.sequencer.mark_received(id);
        self.send(peer, MessageType::Ack, id.as_bytes().to_vec(), actions);

        let settle = self.config.settle_delay();
        if let Some(link) = self.links.get_mut(peer) {
            link.phase = LinkPhase::Completing;
            link.deadline = now + settle;
        }
    }

    fn on_ack(&mut self, peer: &str, acked: &str) {
        if self.sequencer.untrack(acked).is_none() {
            debug!(peer, id = acked, "ack for unknown message");
            return;
        }
        self.retry.cancel(acked);
        self.awaiting_ack.remove(acked);
        if let Some(link) = self.links.get_mut(peer) {
            link.pending_acks.remove(acked);
        }
        debug!(peer, id = acked, "acked");
    }

    fn queue_peer(
        &mut self,
        peer: &str,
        record: Option<StudentRecord>,
        now: Instant,
        actions: &mut Vec<OutboundAction>,
    ) {
        let quality = self.quality.quality(peer);
        match self.admission.enqueue(peer, record, quality, now) {
            Ok(entry) => {
                let status = self.admission.status();
                let notice = QueueNotice {
                    position: entry.queue_position,
                    wait_secs: entry.estimated_wait_secs,
                    processing_rate: status.processing_rate,
                    success_rate: status.success_rate,
                };
                self.send(
                    peer,
                    MessageType::QueueStatus,
                    notice.to_payload().into_bytes(),
                    actions,
                );
            }
            Err(e) => debug!(peer, error = %e, "could not queue"),
        }
        actions.push(OutboundAction::Close(peer.to_string()));
    }

    /// Hand every free slot to the next queued peer. The peer holds a reservation and gets a
    /// best-effort RETRY push; its own reconnect timer is what actually brings it back.
    fn fill_slots(&mut self, now: Instant, actions: &mut Vec<OutboundAction>) {
        while let Some(next) = self.admission.dequeue_next(now) {
            let peer = next.peer;
            self.reservations
                .insert(peer.clone(), now + self.config.reservation_timeout());
            let status = self.admission.status();
            let notice = QueueNotice {
                position: 0,
                wait_secs: 0,
                processing_rate: status.processing_rate,
                success_rate: status.success_rate,
            };
            let msg = self
                .message(MessageType::Retry, notice.to_payload().into_bytes())
                .with_priority(1);
            actions.push(OutboundAction::Notify(peer.clone(), codec::encode_frame(&msg)));
            self.expect_ack(&peer, msg, now);
            info!(peer = %peer, "slot reserved, reconnect requested");
        }
    }

    fn expect_ack(&mut self, peer: &str, msg: Message, now: Instant) {
        if self.retry.schedule_retry(&msg, now).is_err() {
            return;
        }
        if let Some(link) = self.links.get_mut(peer) {
            link.pending_acks.insert(msg.id.clone());
        }
        self.awaiting_ack.insert(msg.id.clone(), peer.to_string());
        self.sequencer.track(msg);
    }

    fn forget_ack(&mut self, id: &str) {
        self.retry.cancel(id);
        self.sequencer.untrack(id);
        if let Some(peer) = self.awaiting_ack.remove(id) {
            if let Some(link) = self.links.get_mut(&peer) {
                link.pending_acks.remove(id);
            }
        }
    }

    fn clear_acks_for(&mut self, peer: &str) {
        let ids: Vec<String> = self
            .awaiting_ack
            .iter()
            .filter(|(_, p)| p.as_str() == peer)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.forget_ack(&id);
        }
    }

    fn open_link(&mut self, peer: &str, now: Instant) {
        self.links.insert(
            peer.to_string(),
            LinkSession {
                phase: LinkPhase::Connected,
                pending_acks: HashSet::new(),
                deadline: now + self.config.discovery_timeout(),
            },
        );
        debug!(peer, "link open");
    }

    fn enter_awaiting_data(&mut self, peer: &str, now: Instant) {
        let data_timeout = self.config.data_timeout();
        if let Some(link) = self.links.get_mut(peer) {
            link.phase = LinkPhase::AwaitingData;
            link.deadline = now + data_timeout;
        }
    }

    fn set_phase(&mut self, peer: &str, phase: LinkPhase) {
        if let Some(link) = self.links.get_mut(peer) {
            link.phase = phase;
        }
    }

    /// Remove the link's session state. Returns the ids it still owed acks for.
    fn close_link(&mut self, peer: &str) -> Vec<String> {
        let Some(link) = self.links.remove(peer) else {
            return Vec::new();
        };
        let pending: Vec<String> = link.pending_acks.into_iter().collect();
        for id in &pending {
            self.forget_ack(id);
        }
        pending
    }

    /// Close the link and settle its admission slot: a peer that already got its ACK counts as
    /// served, anyone else just frees the slot.
    fn drop_link(&mut self, peer: &str, now: Instant) {
        let phase = self.link_phase(peer);
        self.close_link(peer);
        match phase {
            Some(LinkPhase::Completing) => {
                self.admission.complete(peer, now);
            }
            _ => {
                self.admission.release(peer);
            }
        }
    }

    fn reject_malformed(&mut self, peer: &str, detail: &str, actions: &mut Vec<OutboundAction>) {
        debug!(peer, detail, "malformed frame");
        self.send(
            peer,
            MessageType::Error,
            failure_payload(FailureCode::MalformedFrame, detail).into_bytes(),
            actions,
        );
    }

    fn message(&self, kind: MessageType, payload: Vec<u8>) -> Message {
        let now_ms = wall_clock_ms();
        Message::new(self.sequencer.next_id(now_ms), kind, payload).with_timestamp(now_ms)
    }

    fn send(
        &self,
        peer: &str,
        kind: MessageType,
        payload: Vec<u8>,
        actions: &mut Vec<OutboundAction>,
    ) {
        let msg = self.message(kind, payload);
        actions.push(OutboundAction::Send(peer.to_string(), codec::encode_frame(&msg)));
    }

    fn publish(&mut self, mut actions: Vec<OutboundAction>) -> Vec<OutboundAction> {
        let revision = self.admission.revision();
        if revision != self.published_revision {
            self.published_revision = revision;
            actions.push(OutboundAction::QueueChanged(self.admission.status()));
        }
        actions
    }
}

impl Default for AttendanceEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_failure;
    use std::time::Duration;

    fn engine(max_connections: usize) -> AttendanceEngine {
        AttendanceEngine::new(EngineConfig {
            max_connections,
            ..EngineConfig::default()
        })
    }

    fn attendance(id: &str, name: &str, roll: &str) -> Vec<u8> {
        let record = StudentRecord::new(name, roll);
        codec::encode_frame(&Message::new(id, MessageType::Attendance, record.to_payload()))
    }

    fn sent_to(actions: &[OutboundAction], peer: &str) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send(p, frame) if p == peer => codec::decode_frame(frame).ok(),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[OutboundAction]) -> Vec<StudentRecord> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Deliver(_, r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn closes(actions: &[OutboundAction], peer: &str) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, OutboundAction::Close(p) if p == peer))
    }

    fn error_code(msgs: &[Message]) -> Option<FailureCode> {
        msgs.iter()
            .find(|m| m.kind == MessageType::Error)
            .and_then(|m| parse_failure(m.payload_str()?).map(|(c, _)| c))
    }

    #[test]
    fn valid_record_delivered_and_acked() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_services_discovered("p1", t0);
        assert_eq!(e.link_phase("p1"), Some(LinkPhase::AwaitingData));

        let actions = e.on_data("p1", &attendance("m1", "Jane Doe", "R-101"), t0);
        assert_eq!(delivered(&actions), vec![StudentRecord::new("Jane Doe", "R-101")]);
        let replies = sent_to(&actions, "p1");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Ack);
        assert_eq!(replies[0].payload_str(), Some("m1"));
        assert_eq!(e.link_phase("p1"), Some(LinkPhase::Completing));
        assert!(actions
            .iter()
            .any(|a| matches!(a, OutboundAction::QueueChanged(s) if s.processing_connections == 1)));

        let actions = e.tick(t0 + Duration::from_secs(2));
        assert!(closes(&actions, "p1"));
        assert_eq!(e.link_phase("p1"), None);
        assert!(e.admission().is_served("p1"));
        assert_eq!(e.status().total_connections, 0);
    }

    #[test]
    fn duplicate_id_delivered_once_acked_twice() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        let first = e.on_data("p1", &attendance("m1", "Jane", "R1"), t0);
        let second = e.on_data("p1", &attendance("m1", "Jane", "R1"), t0);
        assert_eq!(delivered(&first).len(), 1);
        assert!(delivered(&second).is_empty());
        assert_eq!(sent_to(&second, "p1")[0].kind, MessageType::Ack);
        assert_eq!(sent_to(&second, "p1")[0].payload_str(), Some("m1"));
    }

    #[test]
    fn overflow_queued_then_reserved_when_slot_frees() {
        let mut e = engine(2);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_connect("p2", t0);

        let actions = e.on_connect("p3", t0);
        let replies = sent_to(&actions, "p3");
        assert_eq!(replies[0].kind, MessageType::QueueStatus);
        let notice = QueueNotice::from_payload(replies[0].payload_str().unwrap()).unwrap();
        assert_eq!(notice.position, 1);
        assert_eq!(notice.wait_secs, 3);
        assert!(closes(&actions, "p3"));
        assert_eq!(e.status().queue_size, 1);
        assert_eq!(e.status().total_connections, 2);

        // Expected disconnect after the notice does not drop the queue entry.
        e.on_disconnect("p3", t0);
        assert_eq!(e.status().queue_size, 1);

        e.on_data("p1", &attendance("m1", "Jane", "R1"), t0);
        let actions = e.tick(t0 + Duration::from_secs(2));
        assert!(closes(&actions, "p1"));
        let pushed = actions.iter().find_map(|a| match a {
            OutboundAction::Notify(p, frame) if p == "p3" => codec::decode_frame(frame).ok(),
            _ => None,
        });
        assert_eq!(pushed.map(|m| m.kind), Some(MessageType::Retry));
        assert_eq!(e.link_phase("p3"), Some(LinkPhase::Reserved));
        assert_eq!(e.status().queue_size, 0);
        assert_eq!(e.status().total_connections, 2);

        let later = t0 + Duration::from_secs(3);
        e.on_connect("p3", later);
        assert_eq!(e.link_phase("p3"), Some(LinkPhase::Connected));
        assert_eq!(e.awaiting_ack(), 0);
        let actions = e.on_data("p3", &attendance("m3", "Ravi", "R3"), later);
        assert_eq!(delivered(&actions).len(), 1);
    }

    #[test]
    fn served_peer_refused_on_reconnect() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_data("p1", &attendance("m1", "Jane", "R1"), t0);
        e.on_disconnect("p1", t0 + Duration::from_millis(500));
        assert!(e.admission().is_served("p1"));

        let actions = e.on_connect("p1", t0 + Duration::from_secs(5));
        assert_eq!(sent_to(&actions, "p1")[0].kind, MessageType::Duplicate);
        assert!(closes(&actions, "p1"));
        assert_eq!(e.open_links(), 0);
    }

    #[test]
    fn blank_name_rejected_link_stays_open() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        let actions = e.on_data("p1", &attendance("m1", "   ", "R1"), t0);
        assert!(delivered(&actions).is_empty());
        assert_eq!(error_code(&sent_to(&actions, "p1")), Some(FailureCode::Validation));
        assert!(!closes(&actions, "p1"));
        assert_eq!(e.link_phase("p1"), Some(LinkPhase::AwaitingData));

        let actions = e.on_data("p1", &attendance("m2", "Jane", "R1"), t0);
        assert_eq!(delivered(&actions).len(), 1);
    }

    #[test]
    fn malformed_frame_answered_link_kept() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        let actions = e.on_data("p1", b"garbage", t0);
        assert_eq!(error_code(&sent_to(&actions, "p1")), Some(FailureCode::MalformedFrame));
        assert!(!closes(&actions, "p1"));
        assert!(e.link_phase("p1").is_some());
    }

    #[test]
    fn oversized_payload_closes_and_frees_slot() {
        let mut e = engine(1);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_connect("p2", t0);
        let actions = e.on_data("p1", &vec![b'x'; 600], t0);
        assert_eq!(error_code(&sent_to(&actions, "p1")), Some(FailureCode::PayloadTooLarge));
        assert!(closes(&actions, "p1"));
        assert!(!e.admission().is_served("p1"));
        // The freed slot goes straight to the queued peer.
        assert_eq!(e.link_phase("p2"), Some(LinkPhase::Reserved));
    }

    #[test]
    fn legacy_plain_record_accepted() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        let actions = e.on_data("p1", b"ATTENDANCE|Jane Doe|R-7", t0);
        assert_eq!(delivered(&actions), vec![StudentRecord::new("Jane Doe", "R-7")]);
        assert_eq!(sent_to(&actions, "p1")[0].payload_str(), Some("legacy-R-7"));
    }

    #[test]
    fn second_record_while_completing_refused() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_data("p1", &attendance("m1", "Jane", "R1"), t0);
        let actions = e.on_data("p1", &attendance("m2", "Other", "R2"), t0);
        assert!(delivered(&actions).is_empty());
        assert_eq!(
            error_code(&sent_to(&actions, "p1")),
            Some(FailureCode::SessionCompleting)
        );
    }

    #[test]
    fn silent_link_times_out() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        assert!(e.tick(t0 + Duration::from_secs(5)).is_empty());
        let actions = e.tick(t0 + Duration::from_secs(6));
        assert!(closes(&actions, "p1"));
        assert!(actions.iter().any(|a| matches!(
            a,
            OutboundAction::Failed(DeliveryFailure::LinkTimeout { phase: LinkPhase::Connected, .. })
        )));
        assert_eq!(e.status().total_connections, 0);
        assert!(!e.admission().is_served("p1"));
    }

    #[test]
    fn unclaimed_reservation_retried_then_released() {
        let mut e = engine(1);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_connect("p2", t0);
        e.on_peer_departed("p1", t0);
        assert_eq!(e.link_phase("p2"), Some(LinkPhase::Reserved));
        assert_eq!(e.awaiting_ack(), 1);

        let mut notices = 0;
        let mut exhausted = false;
        for s in 1..=30 {
            for a in e.tick(t0 + Duration::from_secs(s)) {
                match a {
                    OutboundAction::Notify(p, _) if p == "p2" => notices += 1,
                    OutboundAction::Failed(DeliveryFailure::RetryExhausted { peer, .. }) => {
                        assert_eq!(peer, "p2");
                        exhausted = true;
                    }
                    _ => {}
                }
            }
        }
        assert_eq!(notices, 3);
        assert!(exhausted);
        assert_eq!(e.link_phase("p2"), None);
        assert_eq!(e.status().total_connections, 0);
    }

    #[test]
    fn departed_peer_leaves_queue() {
        let mut e = engine(1);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_connect("p2", t0);
        e.on_connect("p3", t0);
        assert_eq!(e.status().queue_size, 2);
        e.on_peer_departed("p2", t0);
        assert_eq!(e.status().queue_size, 1);
        assert_eq!(e.admission().queued()[0].peer, "p3");
        assert_eq!(e.admission().queued()[0].queue_position, 1);
    }

    #[test]
    fn better_link_moves_up_queue() {
        let mut e = engine(1);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        e.on_connect("p2", t0);
        e.on_connect("p3", t0);
        assert_eq!(e.admission().queued()[0].peer, "p2");
        let actions = e.on_link_metrics("p3", -40, 20);
        assert_eq!(e.admission().queued()[0].peer, "p3");
        assert!(actions
            .iter()
            .any(|a| matches!(a, OutboundAction::QueueChanged(_))));
    }

    #[test]
    fn abandoned_queued_peer_does_not_hold_next_slot() {
        let mut e = AttendanceEngine::new(EngineConfig {
            max_connections: 1,
            data_timeout_ms: 60_000,
            ..EngineConfig::default()
        });
        let t0 = Instant::now();
        let at = |s: u64| t0 + Duration::from_secs(s);
        e.on_connect("p1", t0);
        e.on_services_discovered("p1", t0);

        e.on_connect("gone", t0);
        e.on_disconnect("gone", t0);
        e.on_connect("p3", at(1));
        e.on_disconnect("p3", at(1));
        assert_eq!(e.status().queue_size, 2);

        for s in 2..=14 {
            if s == 6 {
                // p3 comes back when its quoted wait is up; "gone" never does.
                e.on_connect("p3", at(s));
                e.on_disconnect("p3", at(s));
            }
            e.tick(at(s));
        }
        assert_eq!(e.status().queue_size, 1);
        assert_eq!(e.admission().queued()[0].peer, "p3");
        assert_eq!(e.admission().queued()[0].queue_position, 1);

        e.on_data("p1", &attendance("m1", "Jane", "R1"), at(14));
        let actions = e.tick(at(16));
        assert!(closes(&actions, "p1"));
        assert_eq!(e.link_phase("p3"), Some(LinkPhase::Reserved));
        assert_eq!(e.link_phase("gone"), None);

        e.on_connect("p3", at(17));
        let actions = e.on_data("p3", &attendance("m3", "Ravi", "R3"), at(17));
        assert_eq!(delivered(&actions).len(), 1);
    }

    #[test]
    fn write_failure_frees_slot() {
        let mut e = engine(5);
        let t0 = Instant::now();
        e.on_connect("p1", t0);
        let actions = e.on_write_failed("p1", t0);
        assert!(closes(&actions, "p1"));
        assert_eq!(e.open_links(), 0);
        assert_eq!(e.status().total_connections, 0);
    }
}
