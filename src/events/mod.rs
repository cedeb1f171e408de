//! In-process event bus
//!
//! Harvest cycles publish lifecycle events here; the `--watch` CLI mode
//! and tests subscribe. Delivery is best effort: `publish` never blocks
//! and never fails, a subscriber whose queue is full simply misses that
//! event, and subscribers that hung up are pruned on the next publish.
//! A small ring buffer of recent events is kept for introspection.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Queue depth per subscriber
const SUBSCRIBER_QUEUE_SIZE: usize = 256;

/// Number of recent events retained for `recent()`
const RECENT_RING_SIZE: usize = 64;

/// A harvest lifecycle event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A poll cycle completed for a target
    Tick { target_id: i64 },

    /// New posts were stored for a target (count is rows actually
    /// inserted, never published with count 0)
    NewPost { target_id: i64, count: usize },

    /// A cycle failed; instance is set when the failure came from a
    /// specific mirror
    Error {
        target_id: Option<i64>,
        instance: Option<String>,
        message: String,
    },

    /// No instance was eligible; the target retries shortly
    Cooldown {
        target_id: i64,
        next_run_in_seconds: u64,
    },
}

struct BusInner {
    subscribers: Vec<mpsc::Sender<Event>>,
    recent: VecDeque<Event>,
}

/// Cheaply cloneable handle to the shared event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscribers: Vec::new(),
                recent: VecDeque::with_capacity(RECENT_RING_SIZE),
            })),
        }
    }

    /// Registers a new subscriber and returns its receiving end
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(tx);
        rx
    }

    /// Publishes an event to every live subscriber
    ///
    /// Non-blocking: a full queue drops the event for that subscriber
    /// only, a closed queue removes the subscriber.
    pub fn publish(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();

        inner.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Subscriber queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if inner.recent.len() == RECENT_RING_SIZE {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event);
    }

    /// Returns the most recent events, oldest first
    pub fn recent(&self) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        inner.recent.iter().cloned().collect()
    }

    /// Number of live subscribers (after the last publish pruned)
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
