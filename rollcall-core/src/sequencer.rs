//! Message ids, receive-side dedupe, and send-side in-flight tracking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::Message;

const TAG_LEN: usize = 6;

/// Issues ids of the form `tag-secondsHex-counter`. The tag is random per sequencer so two
/// runs on the same device never collide; the counter is atomic so concurrent callers sharing
/// one sequencer never collide either.
pub struct Sequencer {
    tag: String,
    counter: AtomicU64,
    received: HashSet<String>,
    in_flight: HashMap<String, Message>,
}

impl Sequencer {
    pub fn new() -> Self {
        let full = uuid::Uuid::new_v4().simple().to_string();
        Self::with_tag(&full[..TAG_LEN])
    }

    pub fn with_tag(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            counter: AtomicU64::new(0),
            received: HashSet::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn next_id(&self, now_ms: i64) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:x}-{}", self.tag, now_ms.max(0) / 1000, n)
    }

    /// Record an inbound id. Returns false if it was already recorded.
    pub fn mark_received(&mut self, id: &str) -> bool {
        self.received.insert(id.to_string())
    }

    pub fn is_duplicate(&self, id: &str) -> bool {
        self.received.contains(id)
    }

    /// Start tracking a sent message for ack matching. Returns false (and keeps the original)
    /// if the id is already tracked.
    pub fn track(&mut self, msg: Message) -> bool {
        if self.in_flight.contains_key(&msg.id) {
            return false;
        }
        self.in_flight.insert(msg.id.clone(), msg);
        true
    }

    pub fn untrack(&mut self, id: &str) -> Option<Message> {
        self.in_flight.remove(id)
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}
