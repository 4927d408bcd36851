use proptest::prelude::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rollcall_core::admission::{AdmissionQueue, PeerState};
use rollcall_core::codec;
use rollcall_core::protocol::{Compression, Message, MessageType, StudentRecord};
use rollcall_core::{AttendanceEngine, EngineConfig, OutboundAction};

fn assert_queue_consistent(q: &AdmissionQueue) -> Result<(), TestCaseError> {
    let queued = q.queued();
    for (i, e) in queued.iter().enumerate() {
        prop_assert_eq!(e.queue_position, i as u32 + 1);
        prop_assert_eq!(e.estimated_wait_secs, (i as u64 + 1) * 2 + 1);
    }
    for w in queued.windows(2) {
        prop_assert!(w[0].priority >= w[1].priority);
        if w[0].priority == w[1].priority {
            prop_assert!(w[0].enqueued_at < w[1].enqueued_at);
        }
    }
    Ok(())
}

fn attendance_frame(id: &str, peer: usize) -> Vec<u8> {
    let record = StudentRecord::new(format!("Student {peer}"), format!("R{peer}"));
    codec::encode_frame(&Message::new(id, MessageType::Attendance, record.to_payload()))
}

proptest! {
    #[test]
    fn test_frame_roundtrip(
        id in "[A-Za-z0-9-]{1,24}",
        kind_idx in 0..MessageType::ALL.len(),
        payload in prop::collection::vec(any::<u8>(), 0..400),
        timestamp_ms in any::<i64>(),
        priority in any::<i32>(),
    ) {
        let msg = Message::new(id, MessageType::ALL[kind_idx], payload)
            .with_timestamp(timestamp_ms)
            .with_priority(priority);
        let decoded = codec::decode(&codec::encode(&msg)).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn test_gzip_requested_payload_survives(
        text in "[a-z |]{0,300}",
    ) {
        let msg = Message::new("m1", MessageType::Attendance, text.as_bytes())
            .with_compression(Compression::Gzip);
        let decoded = codec::decode_frame(&codec::encode_frame(&msg)).unwrap();
        prop_assert_eq!(decoded.payload, text.into_bytes());
    }

    #[test]
    fn test_queue_ordering(
        qualities in prop::collection::vec(0.0f32..=1.0, 1..40),
    ) {
        let mut q = AdmissionQueue::new(0, 2, 1);
        let t0 = Instant::now();
        for (i, quality) in qualities.iter().enumerate() {
            let at = t0 + Duration::from_millis(i as u64);
            q.enqueue(&format!("p{i}"), None, *quality, at).unwrap();
        }
        let queued = q.queued();
        prop_assert_eq!(queued.len(), qualities.len());
        for (i, e) in queued.iter().enumerate() {
            prop_assert_eq!(e.queue_position, i as u32 + 1);
            prop_assert_eq!(e.estimated_wait_secs, (i as u64 + 1) * 2 + 1);
        }
        for w in queued.windows(2) {
            prop_assert!(w[0].priority >= w[1].priority);
            if w[0].priority == w[1].priority {
                prop_assert!(w[0].enqueued_at < w[1].enqueued_at);
            }
        }
    }

    #[test]
    fn test_queue_ordering_under_mixed_ops(
        ops in prop::collection::vec((0u8..7, 0usize..10, 0.0f32..=1.0), 1..150),
    ) {
        let mut q = AdmissionQueue::new(2, 2, 1);
        let t0 = Instant::now();
        for (n, (op, peer, quality)) in ops.into_iter().enumerate() {
            let now = t0 + Duration::from_millis(n as u64);
            let peer = format!("p{peer}");
            match op {
                0 | 1 => {
                    let _ = q.enqueue(&peer, None, quality, now);
                }
                2 => {
                    let head = q.queued().first().map(|e| e.peer.clone());
                    let could_admit = q.can_admit();
                    match q.dequeue_next(now) {
                        Some(next) => {
                            prop_assert_eq!(Some(next.peer.clone()), head);
                            prop_assert_eq!(q.state_of(&next.peer), PeerState::Active);
                        }
                        None => {
                            prop_assert!(head.is_none() || !could_admit);
                        }
                    }
                }
                3 => {
                    let was_queued = q.state_of(&peer) == PeerState::Queued;
                    prop_assert_eq!(q.reprioritize(&peer, quality).is_some(), was_queued);
                }
                4 => {
                    q.remove(&peer);
                    prop_assert_ne!(q.state_of(&peer), PeerState::Queued);
                }
                5 => {
                    q.complete(&peer, now);
                }
                _ => {
                    q.release(&peer);
                }
            }
            assert_queue_consistent(&q)?;
            let status = q.status();
            prop_assert!(status.total_connections <= 2);
            prop_assert_eq!(status.queue_size, q.queued().len());
        }
    }

    #[test]
    fn test_admission_ceiling_holds(
        max in 1usize..4,
        ops in prop::collection::vec((0usize..8, 0u8..5), 1..120),
    ) {
        let mut engine = AttendanceEngine::new(EngineConfig {
            max_connections: max,
            ..EngineConfig::default()
        });
        let mut now = Instant::now();
        let mut delivered: HashMap<String, usize> = HashMap::new();
        for (n, (peer, op)) in ops.into_iter().enumerate() {
            let peer_addr = format!("peer-{peer}");
            let actions = match op {
                0 => engine.on_connect(&peer_addr, now),
                1 => engine.on_data(&peer_addr, &attendance_frame(&format!("m{peer}"), peer), now),
                2 => engine.on_disconnect(&peer_addr, now),
                3 => engine.on_data(&peer_addr, format!("junk {n}").as_bytes(), now),
                _ => {
                    now += Duration::from_millis(700);
                    engine.tick(now)
                }
            };
            for a in actions {
                if let OutboundAction::Deliver(p, _) = a {
                    *delivered.entry(p).or_default() += 1;
                }
            }
            let status = engine.status();
            prop_assert!(status.total_connections <= max);
            prop_assert!(engine.open_links() <= max);
            for queued in engine.admission().queued() {
                prop_assert!(engine.link_phase(&queued.peer).is_none());
            }
        }
        for (peer, count) in delivered {
            prop_assert_eq!(count, 1, "{} delivered more than once", peer);
        }
    }
}
