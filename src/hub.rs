use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::EngineError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("subscriber queue full")]
    Backpressure,
    #[error("subscriber closed")]
    Closed,
}

/// Abstract outbound capability of one observer connection. Implementations
/// must not block: a sink that cannot accept a payload right now reports
/// backpressure and is treated as dead.
pub trait ObserverSink: Send + Sync {
    fn try_send(&self, payload: String) -> Result<(), SinkError>;
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFilter {
    pub course_id: String,
    pub role: Option<String>,
}

impl SubscriberFilter {
    fn matches(&self, course_id: &str, audience: Option<&str>) -> bool {
        if self.course_id != course_id {
            return false;
        }
        match (audience, self.role.as_deref()) {
            (Some(wanted), Some(role)) => wanted == role,
            _ => true,
        }
    }
}

struct Subscriber {
    id: u64,
    filter: SubscriberFilter,
    sink: Arc<dyn ObserverSink>,
}

/// Registry of live dashboard connections, keyed by course filter. Delivery
/// is best-effort; a failing subscriber is pruned on the spot and never
/// stalls the rest.
pub struct BroadcastHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self, filter: SubscriberFilter, sink: Arc<dyn ObserverSink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().await;
        debug!(subscriber = id, course = %filter.course_id, "observer subscribed");
        subscribers.push(Subscriber { id, filter, sink });
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(pos) = subscribers.iter().position(|sub| sub.id == id) {
            let sub = subscribers.swap_remove(pos);
            sub.sink.close();
            debug!(subscriber = id, "observer unsubscribed");
        }
    }

    /// Pushes `payload` to every subscriber watching `course_id` (optionally
    /// narrowed to one role). Returns how many deliveries were accepted.
    pub async fn broadcast(&self, course_id: &str, audience: Option<&str>, payload: &str) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        let mut dead = Vec::new();

        for sub in subscribers.iter() {
            if !sub.filter.matches(course_id, audience) {
                continue;
            }
            match sub.sink.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    let err = EngineError::Delivery(reason.to_string());
                    debug!(subscriber = sub.id, %err, "pruning dead observer");
                    dead.push(sub.id);
                }
            }
        }

        if !dead.is_empty() {
            subscribers.retain(|sub| {
                if dead.contains(&sub.id) {
                    sub.sink.close();
                    false
                } else {
                    true
                }
            });
        }

        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink backed by a bounded channel; the connection's writer task drains the
/// other end onto the socket.
pub struct ChannelSink {
    tx: std::sync::Mutex<Option<mpsc::Sender<String>>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
        }
    }
}

impl ObserverSink for ChannelSink {
    fn try_send(&self, payload: String) -> Result<(), SinkError> {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(SinkError::Closed),
        };
        match guard.as_ref() {
            Some(tx) => tx.try_send(payload).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SinkError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
            }),
            None => Err(SinkError::Closed),
        }
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}
