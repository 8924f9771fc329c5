//! Per-session event fanout.
//!
//! The coordinator merges everything a session's turn produces (assistant
//! content, tool lifecycle, errors) into one ordered stream per session.
//! Delivery is transport-only: no persistence, and publishing never blocks
//! the agent. Each subscriber sits behind a bounded queue; on overflow the
//! oldest events are dropped and counted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::events::{SessionEvent, SessionEventKind};

struct SessionChannel {
    sender: broadcast::Sender<SessionEvent>,
    seq: u64,
}

/// Merges a session's content stream and tool-lifecycle events into a single
/// ordered push stream per subscriber.
pub struct StreamCoordinator {
    queue_size: usize,
    sessions: Mutex<HashMap<String, SessionChannel>>,
    dropped: Arc<AtomicU64>,
}

impl StreamCoordinator {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(1),
            sessions: Mutex::new(HashMap::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event for a session. Fire-and-forget: a session without
    /// subscribers swallows the event.
    pub fn publish(&self, session_id: &str, kind: SessionEventKind) -> SessionEvent {
        let mut sessions = self.sessions.lock();
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionChannel {
                sender: broadcast::channel(self.queue_size).0,
                seq: 0,
            });
        channel.seq += 1;
        let event = SessionEvent {
            seq: channel.seq,
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            session_id: session_id.to_string(),
            kind,
        };
        let _ = channel.sender.send(event.clone());
        event
    }

    /// Attach a subscriber to a session's stream. Events published after
    /// this call are observed in FIFO order.
    pub fn subscribe(&self, session_id: &str) -> EventSubscriber {
        let mut sessions = self.sessions.lock();
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionChannel {
                sender: broadcast::channel(self.queue_size).0,
                seq: 0,
            });
        EventSubscriber {
            receiver: channel.sender.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Total events dropped from saturated subscriber queues.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop a session's channel (called when the session is released).
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

/// A bounded-queue subscriber over one session's events.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSubscriber {
    /// Next event in FIFO order. Skips over dropped spans (counting them)
    /// and returns `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("subscriber lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and the heartbeat loop.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}
