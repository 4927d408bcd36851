//! Single owner of the engine. Link events and ticks are applied in arrival order, so engine
//! state never needs a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rollcall_core::{AttendanceEngine, OutboundAction};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sink::{spawn_deliver, RecordSink};
use crate::transport::{ConnId, LinkEvent};

struct Link {
    conn: ConnId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct Coordinator {
    engine: AttendanceEngine,
    links: HashMap<String, Link>,
    sink: Arc<dyn RecordSink>,
}

impl Coordinator {
    pub fn new(engine: AttendanceEngine, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            engine,
            links: HashMap::new(),
            sink,
        }
    }

    /// Runs until every event sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<LinkEvent>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle(ev, Instant::now()),
                    None => break,
                },
                _ = interval.tick() => {
                    let actions = self.engine.tick(Instant::now());
                    self.dispatch(actions);
                }
            }
        }
        info!("link events closed, coordinator stopping");
    }

    pub fn handle(&mut self, ev: LinkEvent, now: Instant) {
        match ev {
            LinkEvent::Connected { peer, conn, tx } => {
                if let Some(old) = self.links.insert(peer.clone(), Link { conn, tx }) {
                    debug!(peer = %peer, old = old.conn, conn, "link replaced");
                }
                let mut actions = self.engine.on_connect(&peer, now);
                // TCP has no service discovery step.
                actions.extend(self.engine.on_services_discovered(&peer, now));
                self.dispatch(actions);
            }
            LinkEvent::Data { peer, conn, bytes } => {
                if !self.is_current(&peer, conn) {
                    debug!(peer = %peer, conn, "data from stale link dropped");
                    return;
                }
                let actions = self.engine.on_data(&peer, &bytes, now);
                self.dispatch(actions);
            }
            LinkEvent::Disconnected { peer, conn } => {
                if self.links.get(&peer).is_some_and(|l| l.conn != conn) {
                    return;
                }
                self.links.remove(&peer);
                let actions = self.engine.on_disconnect(&peer, now);
                self.dispatch(actions);
            }
            LinkEvent::WriteFailed { peer, conn } => {
                if !self.is_current(&peer, conn) {
                    return;
                }
                let actions = self.engine.on_write_failed(&peer, now);
                self.dispatch(actions);
            }
        }
    }

    pub fn engine(&self) -> &AttendanceEngine {
        &self.engine
    }

    fn is_current(&self, peer: &str, conn: ConnId) -> bool {
        self.links.get(peer).is_some_and(|l| l.conn == conn)
    }

    fn dispatch(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send(peer, frame) => match self.links.get(&peer) {
                    Some(link) => {
                        let _ = link.tx.send(frame);
                    }
                    None => debug!(peer = %peer, "send to closed link dropped"),
                },
                // A TCP peer has no channel besides its link.
                OutboundAction::Notify(peer, frame) => {
                    if let Some(link) = self.links.get(&peer) {
                        let _ = link.tx.send(frame);
                    } else {
                        debug!(peer = %peer, "no channel for notification");
                    }
                }
                OutboundAction::Deliver(peer, record) => {
                    spawn_deliver(self.sink.clone(), peer, record);
                }
                OutboundAction::Close(peer) => {
                    // Dropping the sender ends the writer after queued frames are flushed.
                    self.links.remove(&peer);
                }
                OutboundAction::QueueChanged(status) => {
                    info!(
                        queued = status.queue_size,
                        active = status.active_connections,
                        processing = status.processing_connections,
                        wait_secs = status.estimated_wait_secs,
                        "queue"
                    );
                }
                OutboundAction::Failed(failure) => warn!(error = %failure, "delivery failure"),
            }
        }
    }
}
