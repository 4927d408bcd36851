//! Retransmission of unacknowledged messages on a fixed backoff table.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::protocol::Message;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(1000),
    Duration::from_millis(2000),
    Duration::from_millis(4000),
];

/// A message was dropped after `attempts` retransmissions without an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message {id} unacknowledged after {attempts} retries")]
pub struct RetryExhausted {
    pub id: String,
    pub attempts: u32,
}

struct ScheduledRetry {
    due: Instant,
    message: Message,
}

/// Holds the next attempt of each unacknowledged message. At most one pending attempt per id.
pub struct RetryManager {
    max_retries: u32,
    backoff: Vec<Duration>,
    scheduled: Vec<ScheduledRetry>,
}

impl RetryManager {
    pub fn new(max_retries: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_retries,
            backoff,
            scheduled: Vec::new(),
        }
    }

    /// Delay before attempt `retry_count + 1`. The last table entry repeats.
    pub fn delay(&self, retry_count: u32) -> Duration {
        self.backoff
            .get(retry_count as usize)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Schedule the next attempt of `message` (same id, `retry_count + 1`). Fails once the
    /// message has used all its retries; it is then forgotten.
    pub fn schedule_retry(&mut self, message: &Message, now: Instant) -> Result<Instant, RetryExhausted> {
        self.cancel(&message.id);
        if message.retry_count >= self.max_retries {
            debug!(id = %message.id, attempts = message.retry_count, "retries exhausted");
            return Err(RetryExhausted {
                id: message.id.clone(),
                attempts: message.retry_count,
            });
        }
        let due = now + self.delay(message.retry_count);
        self.scheduled.push(ScheduledRetry {
            due,
            message: message.next_attempt(),
        });
        Ok(due)
    }

    /// Remove and return every attempt whose delay has elapsed, earliest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<Message> {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|s| s.due <= now);
        self.scheduled = pending;
        due.sort_by_key(|s| s.due);
        due.into_iter().map(|s| s.message).collect()
    }

    /// Stop retrying `id` (acknowledged or abandoned). Returns true if an attempt was pending.
    pub fn cancel(&mut self, id: &str) -> bool {
        let before = self.scheduled.len();
        self.scheduled.retain(|s| s.message.id != id);
        self.scheduled.len() != before
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.scheduled.iter().any(|s| s.message.id == id)
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.scheduled.iter().map(|s| s.due).min()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn msg() -> Message {
        Message::new("m1", MessageType::Attendance, "Jane|R1")
    }

    #[test]
    fn backoff_table_caps_at_last_entry() {
        let r = RetryManager::default();
        assert_eq!(r.delay(0), Duration::from_secs(1));
        assert_eq!(r.delay(1), Duration::from_secs(2));
        assert_eq!(r.delay(2), Duration::from_secs(4));
        assert_eq!(r.delay(7), Duration::from_secs(4));
    }

    #[test]
    fn not_due_before_delay() {
        let mut r = RetryManager::default();
        let t0 = Instant::now();
        r.schedule_retry(&msg(), t0).unwrap();
        assert!(r.drain_due(t0 + Duration::from_millis(999)).is_empty());
        let due = r.drain_due(t0 + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn retried_exactly_max_times() {
        let mut r = RetryManager::default();
        let mut now = Instant::now();
        let mut current = msg();
        let mut resent = 0;
        loop {
            match r.schedule_retry(&current, now) {
                Ok(due) => {
                    now = due;
                    let mut out = r.drain_due(now);
                    assert_eq!(out.len(), 1);
                    current = out.remove(0);
                    resent += 1;
                }
                Err(e) => {
                    assert_eq!(e.attempts, DEFAULT_MAX_RETRIES);
                    break;
                }
            }
        }
        assert_eq!(resent, DEFAULT_MAX_RETRIES);
        assert_eq!(r.pending(), 0);
        assert!(r.schedule_retry(&current, now).is_err());
    }

    #[test]
    fn cancel_stops_retry() {
        let mut r = RetryManager::default();
        let t0 = Instant::now();
        r.schedule_retry(&msg(), t0).unwrap();
        assert!(r.is_scheduled("m1"));
        assert!(r.cancel("m1"));
        assert!(!r.cancel("m1"));
        assert!(r.drain_due(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn rescheduling_same_id_replaces() {
        let mut r = RetryManager::default();
        let t0 = Instant::now();
        r.schedule_retry(&msg(), t0).unwrap();
        r.schedule_retry(&msg(), t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(r.pending(), 1);
        assert_eq!(r.next_due(), Some(t0 + Duration::from_millis(1500)));
    }
}
