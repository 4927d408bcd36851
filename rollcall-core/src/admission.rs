//! Admission control: a hard ceiling on concurrent links and a priority queue for overflow.
//!
//! Peer lifecycle: `Unseen -> Queued -> Active -> Processing -> Complete`. A queued peer only
//! becomes active through [`AdmissionQueue::dequeue_next`] (or [`AdmissionQueue::admit`] when
//! a slot is free), so `active + processing <= max_connections` always holds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::protocol::StudentRecord;

/// Hardware link ceiling of typical BLE peripherals.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub const DEFAULT_PER_PEER_PROCESSING_SECS: u64 = 2;
pub const DEFAULT_CONNECTION_OVERHEAD_SECS: u64 = 1;

const MAX_CATEGORY_BONUS: u8 = 2;

/// A peer waiting for a free slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedPeer {
    pub peer: String,
    /// Known only if the peer has already sent its record.
    pub record: Option<StudentRecord>,
    /// 1-based; 1 is served next.
    pub queue_position: u32,
    #[serde(skip)]
    pub enqueued_at: Instant,
    pub connection_quality: f32,
    pub priority: u8,
    pub estimated_wait_secs: u64,
    /// When the peer was last told to come back; moves on every re-enqueue.
    #[serde(skip)]
    pub last_seen: Instant,
    /// Wait quoted to the peer at `last_seen`.
    #[serde(skip)]
    quoted_wait_secs: u64,
    #[serde(skip)]
    seq: u64,
}

/// Read-only snapshot; computed on every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub active_connections: usize,
    pub processing_connections: usize,
    pub total_connections: usize,
    pub max_connections: usize,
    /// Wait a newly arriving peer should expect.
    pub estimated_wait_secs: u64,
    /// Peers served per second.
    pub processing_rate: f32,
    pub success_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unseen,
    Queued,
    Active,
    Processing,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("all {0} link slots are in use")]
    Full(usize),
    #[error("peer already holds a link slot")]
    AlreadyAdmitted,
    #[error("peer already served")]
    AlreadyServed,
}

/// Extra queue priority (0..=2) for a record, e.g. a cohort fast track.
pub trait CategoryPolicy: Send {
    fn bonus(&self, record: Option<&StudentRecord>) -> u8;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCategory;

impl CategoryPolicy for NoCategory {
    fn bonus(&self, _record: Option<&StudentRecord>) -> u8 {
        0
    }
}

/// Full bonus for roll numbers starting with one of `prefixes` (ASCII case-insensitive).
#[derive(Debug, Clone)]
pub struct RollPrefixFastTrack {
    prefixes: Vec<String>,
}

impl RollPrefixFastTrack {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(|p| p.to_ascii_uppercase()).collect(),
        }
    }
}

impl CategoryPolicy for RollPrefixFastTrack {
    fn bonus(&self, record: Option<&StudentRecord>) -> u8 {
        let Some(record) = record else {
            return 0;
        };
        let roll = record.roll_number.to_ascii_uppercase();
        if self.prefixes.iter().any(|p| roll.starts_with(p.as_str())) {
            MAX_CATEGORY_BONUS
        } else {
            0
        }
    }
}

/// Estimates how many peers per second the collector serves.
pub trait ThroughputEstimator: Send {
    fn processing_rate(&self) -> f32;
    /// Called with the admitted-to-complete time of every served peer.
    fn record_service(&mut self, _elapsed: Duration) {}
}

/// Constant rate; does not measure anything.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate(pub f32);

impl ThroughputEstimator for FixedRate {
    fn processing_rate(&self) -> f32 {
        self.0
    }
}

/// Rate from the mean of the last `capacity` service times; `fallback` until one is seen.
#[derive(Debug, Clone)]
pub struct MovingAverageRate {
    samples: VecDeque<Duration>,
    capacity: usize,
    fallback: f32,
}

impl MovingAverageRate {
    pub fn new(capacity: usize, fallback: f32) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            fallback,
        }
    }
}

impl ThroughputEstimator for MovingAverageRate {
    fn processing_rate(&self) -> f32 {
        if self.samples.is_empty() {
            return self.fallback;
        }
        let total: Duration = self.samples.iter().sum();
        let mean = total.as_secs_f32() / self.samples.len() as f32;
        if mean <= f32::EPSILON {
            self.fallback
        } else {
            1.0 / mean
        }
    }

    fn record_service(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }
}

/// Maps a quality score to 0..=3.
pub fn quality_bucket(quality: f32) -> u8 {
    match quality {
        q if q >= 0.8 => 3,
        q if q >= 0.6 => 2,
        q if q >= 0.4 => 1,
        _ => 0,
    }
}

pub struct AdmissionQueue {
    max_connections: usize,
    per_peer_processing_secs: u64,
    connection_overhead_secs: u64,
    /// Admitted peers and when they were admitted.
    active: HashMap<String, Instant>,
    processing: HashMap<String, Instant>,
    /// Sorted: priority descending, then enqueue order.
    queue: Vec<QueuedPeer>,
    served: HashSet<String>,
    next_seq: u64,
    revision: u64,
    category: Box<dyn CategoryPolicy>,
    throughput: Box<dyn ThroughputEstimator>,
}

impl AdmissionQueue {
    pub fn new(
        max_connections: usize,
        per_peer_processing_secs: u64,
        connection_overhead_secs: u64,
    ) -> Self {
        let rate = 1.0 / per_peer_processing_secs.max(1) as f32;
        Self {
            max_connections,
            per_peer_processing_secs,
            connection_overhead_secs,
            active: HashMap::new(),
            processing: HashMap::new(),
            queue: Vec::new(),
            served: HashSet::new(),
            next_seq: 0,
            revision: 0,
            category: Box::new(NoCategory),
            throughput: Box::new(FixedRate(rate)),
        }
    }

    pub fn with_category_policy(mut self, policy: Box<dyn CategoryPolicy>) -> Self {
        self.category = policy;
        self
    }

    pub fn with_throughput_estimator(mut self, estimator: Box<dyn ThroughputEstimator>) -> Self {
        self.throughput = estimator;
        self
    }

    pub fn can_admit(&self) -> bool {
        self.active.len() + self.processing.len() < self.max_connections
    }

    pub fn state_of(&self, peer: &str) -> PeerState {
        if self.processing.contains_key(peer) {
            PeerState::Processing
        } else if self.active.contains_key(peer) {
            PeerState::Active
        } else if self.queue.iter().any(|e| e.peer == peer) {
            PeerState::Queued
        } else if self.served.contains(peer) {
            PeerState::Complete
        } else {
            PeerState::Unseen
        }
    }

    /// Take a free slot directly. A queued peer admitted this way leaves the queue.
    pub fn admit(&mut self, peer: &str, now: Instant) -> Result<(), AdmissionError> {
        match self.state_of(peer) {
            PeerState::Active | PeerState::Processing => return Err(AdmissionError::AlreadyAdmitted),
            PeerState::Complete => return Err(AdmissionError::AlreadyServed),
            PeerState::Queued | PeerState::Unseen => {}
        }
        if !self.can_admit() {
            return Err(AdmissionError::Full(self.max_connections));
        }
        if let Some(idx) = self.index_of(peer) {
            self.queue.remove(idx);
            self.renumber();
        }
        self.active.insert(peer.to_string(), now);
        self.touch();
        info!(peer, active = self.active.len(), "admitted");
        Ok(())
    }

    /// Queue a peer that could not be admitted. Re-queueing a peer already waiting keeps its
    /// original place in line (fills in the record if it was missing).
    pub fn enqueue(
        &mut self,
        peer: &str,
        record: Option<StudentRecord>,
        quality: f32,
        now: Instant,
    ) -> Result<QueuedPeer, AdmissionError> {
        match self.state_of(peer) {
            PeerState::Active | PeerState::Processing => return Err(AdmissionError::AlreadyAdmitted),
            PeerState::Complete => return Err(AdmissionError::AlreadyServed),
            PeerState::Queued => {
                if let Some(idx) = self.index_of(peer) {
                    if record.is_some() && self.queue[idx].record.is_none() {
                        let mut entry = self.queue.remove(idx);
                        entry.record = record;
                        entry.priority = self.priority_for(entry.connection_quality, entry.record.as_ref());
                        self.insert_sorted(entry);
                        self.renumber();
                        self.touch();
                    }
                }
                if let Some(idx) = self.index_of(peer) {
                    let entry = &mut self.queue[idx];
                    entry.last_seen = now;
                    entry.quoted_wait_secs = entry.estimated_wait_secs;
                }
                return self.position_of(peer).ok_or(AdmissionError::AlreadyAdmitted);
            }
            PeerState::Unseen => {}
        }
        let quality = quality.clamp(0.0, 1.0);
        let priority = self.priority_for(quality, record.as_ref());
        let entry = QueuedPeer {
            peer: peer.to_string(),
            record,
            queue_position: 0,
            enqueued_at: now,
            connection_quality: quality,
            priority,
            estimated_wait_secs: 0,
            last_seen: now,
            quoted_wait_secs: 0,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.insert_sorted(entry);
        self.renumber();
        self.touch();
        if let Some(idx) = self.index_of(peer) {
            let entry = &mut self.queue[idx];
            entry.quoted_wait_secs = entry.estimated_wait_secs;
        }
        let queued = self.position_of(peer).ok_or(AdmissionError::AlreadyAdmitted)?;
        info!(
            peer,
            position = queued.queue_position,
            priority = queued.priority,
            wait_secs = queued.estimated_wait_secs,
            "queued"
        );
        Ok(queued)
    }

    /// Pop the highest-priority waiting peer into a free slot. `None` if the queue is empty or
    /// every slot is taken.
    pub fn dequeue_next(&mut self, now: Instant) -> Option<QueuedPeer> {
        if self.queue.is_empty() || !self.can_admit() {
            return None;
        }
        let next = self.queue.remove(0);
        self.active.insert(next.peer.clone(), now);
        self.renumber();
        self.touch();
        info!(peer = %next.peer, remaining = self.queue.len(), "dequeued for service");
        Some(next)
    }

    /// Recompute a waiting peer's priority from a new quality score. Returns its new position.
    pub fn reprioritize(&mut self, peer: &str, quality: f32) -> Option<u32> {
        let idx = self.index_of(peer)?;
        let mut entry = self.queue.remove(idx);
        entry.connection_quality = quality.clamp(0.0, 1.0);
        entry.priority = self.priority_for(entry.connection_quality, entry.record.as_ref());
        self.insert_sorted(entry);
        self.renumber();
        self.touch();
        self.position_of(peer).map(|e| e.queue_position)
    }

    /// Active peer has handed over its record.
    pub fn mark_processing(&mut self, peer: &str) -> bool {
        match self.active.remove(peer) {
            Some(admitted_at) => {
                self.processing.insert(peer.to_string(), admitted_at);
                self.touch();
                true
            }
            None => self.processing.contains_key(peer),
        }
    }

    /// Free the peer's slot and remember it as served.
    pub fn complete(&mut self, peer: &str, now: Instant) -> bool {
        let admitted_at = self
            .processing
            .remove(peer)
            .or_else(|| self.active.remove(peer));
        let Some(admitted_at) = admitted_at else {
            return false;
        };
        self.throughput
            .record_service(now.saturating_duration_since(admitted_at));
        self.served.insert(peer.to_string());
        self.touch();
        debug!(peer, served = self.served.len(), "completed");
        true
    }

    /// A waiting peer left for good.
    pub fn remove(&mut self, peer: &str) -> Option<QueuedPeer> {
        let idx = self.index_of(peer)?;
        let entry = self.queue.remove(idx);
        self.renumber();
        self.touch();
        debug!(peer, "removed from queue");
        Some(entry)
    }

    /// Drop waiting peers that did not come back within their quoted wait plus `grace`. A live
    /// queued peer reconnects on that wait and re-enqueues, which moves its `last_seen`.
    pub fn expire_stale(&mut self, now: Instant, grace: Duration) -> Vec<QueuedPeer> {
        let (stale, keep): (Vec<_>, Vec<_>) = self.queue.drain(..).partition(|e| {
            now >= e.last_seen + Duration::from_secs(e.quoted_wait_secs) + grace
        });
        self.queue = keep;
        if !stale.is_empty() {
            self.renumber();
            self.touch();
            for e in &stale {
                debug!(peer = %e.peer, "queued peer expired");
            }
        }
        stale
    }

    /// An admitted peer left without completing; its slot is freed and it is not marked served.
    pub fn release(&mut self, peer: &str) -> bool {
        let freed = self.active.remove(peer).is_some() || self.processing.remove(peer).is_some();
        if freed {
            self.touch();
            debug!(peer, "slot released");
        }
        freed
    }

    pub fn position_of(&self, peer: &str) -> Option<QueuedPeer> {
        self.queue.iter().find(|e| e.peer == peer).cloned()
    }

    pub fn queued(&self) -> &[QueuedPeer] {
        &self.queue
    }

    pub fn is_served(&self, peer: &str) -> bool {
        self.served.contains(peer)
    }

    pub fn status(&self) -> QueueStatus {
        let queue_size = self.queue.len();
        let served = self.served.len();
        let success_rate = if served + queue_size == 0 {
            1.0
        } else {
            served as f32 / (served + queue_size) as f32
        };
        QueueStatus {
            queue_size,
            active_connections: self.active.len(),
            processing_connections: self.processing.len(),
            total_connections: self.active.len() + self.processing.len(),
            max_connections: self.max_connections,
            estimated_wait_secs: self.wait_for_position(queue_size as u32 + 1),
            processing_rate: self.throughput.processing_rate(),
            success_rate,
        }
    }

    /// Bumped on every mutation so callers can tell when to publish a queue change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn priority_for(&self, quality: f32, record: Option<&StudentRecord>) -> u8 {
        quality_bucket(quality) + self.category.bonus(record).min(MAX_CATEGORY_BONUS) + 1
    }

    fn wait_for_position(&self, position: u32) -> u64 {
        u64::from(position) * self.per_peer_processing_secs + self.connection_overhead_secs
    }

    fn index_of(&self, peer: &str) -> Option<usize> {
        self.queue.iter().position(|e| e.peer == peer)
    }

    fn insert_sorted(&mut self, entry: QueuedPeer) {
        let pos = self
            .queue
            .iter()
            .position(|e| {
                e.priority < entry.priority || (e.priority == entry.priority && e.seq > entry.seq)
            })
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
    }

    fn renumber(&mut self) {
        for i in 0..self.queue.len() {
            let position = i as u32 + 1;
            let wait = self.wait_for_position(position);
            let entry = &mut self.queue[i];
            entry.queue_position = position;
            entry.estimated_wait_secs = wait;
        }
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_PER_PEER_PROCESSING_SECS,
            DEFAULT_CONNECTION_OVERHEAD_SECS,
        )
    }
}
