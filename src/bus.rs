//! Topic-based message bus between scheduler, dispatcher, and workers.
//!
//! Delivery is at-least-once: subscribers must tolerate duplicates of the
//! same `(topic, correlation_id, payload hash)`; [`IdempotencyGuard`]
//! implements exactly that keying. Messages on one topic reach each
//! subscriber in publish order. Backpressure is explicit: a subscriber
//! whose queue is full blocks the publisher, never a silent drop, and
//! never delays delivery to the other subscribers of the topic.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clog_trace;
use crate::core::task::{Priority, TaskId};

/// Well-known topics used by the orchestration core.
pub mod topics {
    /// Lifecycle transition applied to a task.
    pub const TASK_TRANSITION: &str = "task.transition";
    /// A worker produced a result (success or failure).
    pub const TASK_RESULT: &str = "task.result";
    /// A conflict resolution decision was recorded.
    pub const CONFLICT_DECISION: &str = "conflict.decision";
}

/// A message published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of this publish.
    pub id: Uuid,
    /// Topic the message was published on.
    pub topic: String,
    /// Task this message concerns, when task-scoped.
    pub correlation_id: Option<TaskId>,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Publisher-declared priority.
    pub priority: Priority,
    /// When the message was published.
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: &str, correlation_id: Option<TaskId>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            correlation_id,
            payload,
            priority: Priority::default(),
            published_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The at-least-once deduplication key for this message.
    pub fn delivery_key(&self) -> DeliveryKey {
        let mut hasher = Sha256::new();
        hasher.update(self.payload.to_string().as_bytes());
        DeliveryKey {
            topic: self.topic.clone(),
            correlation_id: self.correlation_id,
            payload_hash: format!("{:x}", hasher.finalize()),
        }
    }
}

/// Deduplication key: `(topic, correlation_id, sha256(payload))`.
///
/// Two publishes of the same logical event map to the same key even
/// though their `Message::id` values differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub topic: String,
    pub correlation_id: Option<TaskId>,
    pub payload_hash: String,
}

/// Seen-set for idempotent message handling.
///
/// Handlers call [`IdempotencyGuard::first_delivery`] before acting; a
/// redelivered message returns `false` and must cause no state change.
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    seen: std::collections::HashSet<DeliveryKey>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once per delivery key.
    pub fn first_delivery(&mut self, message: &Message) -> bool {
        self.seen.insert(message.delivery_key())
    }
}

#[derive(Clone)]
struct TopicSubscriber {
    id: Uuid,
    tx: mpsc::Sender<Message>,
}

/// An active subscription to one topic.
///
/// Dropping the subscription lets the bus prune the sender on the next
/// publish.
pub struct Subscription {
    /// Identifier of this subscription.
    pub id: Uuid,
    /// Topic subscribed to.
    pub topic: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Receive the next message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking receive for polling consumers.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// The topic-based publish/subscribe channel.
///
/// The registry lock is held only to read or edit the subscriber list,
/// never across a send, so a full queue blocks the publisher without
/// blocking registration or other topics.
pub struct MessageBus {
    topics: Mutex<HashMap<String, Vec<TopicSubscriber>>>,
    queue_depth: usize,
}

impl MessageBus {
    /// Create a bus whose subscriber queues hold `queue_depth` messages
    /// before publishers block.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Subscribe to a topic.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = Uuid::new_v4();
        let mut topics = self.topics.lock().expect("bus topic registry poisoned");
        topics
            .entry(topic.to_string())
            .or_default()
            .push(TopicSubscriber { id, tx });
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Publish a message to every subscriber of its topic.
    ///
    /// Completes once every live subscriber has accepted the message;
    /// deliveries run concurrently so one full queue does not delay the
    /// others. Subscribers whose receivers are gone are pruned.
    pub async fn publish(&self, message: Message) {
        let subscribers: Vec<TopicSubscriber> = {
            let topics = self.topics.lock().expect("bus topic registry poisoned");
            topics.get(&message.topic).cloned().unwrap_or_default()
        };
        clog_trace!(
            "bus publish topic={} correlation={:?} subscribers={}",
            message.topic,
            message.correlation_id.map(|id| id.short()),
            subscribers.len()
        );

        let sends = subscribers
            .iter()
            .map(|s| {
                let tx = s.tx.clone();
                let msg = message.clone();
                let id = s.id;
                async move { (id, tx.send(msg).await) }
            })
            .collect::<Vec<_>>();
        let results = futures::future::join_all(sends).await;

        let dead: Vec<Uuid> = results
            .into_iter()
            .filter(|(_, r)| r.is_err())
            .map(|(id, _)| id)
            .collect();
        if !dead.is_empty() {
            let mut topics = self.topics.lock().expect("bus topic registry poisoned");
            if let Some(subscribers) = topics.get_mut(&message.topic) {
                subscribers.retain(|s| !dead.contains(&s.id));
            }
        }
    }

    /// Convenience publish of a payload on a topic.
    pub async fn publish_payload(
        &self,
        topic: &str,
        correlation_id: Option<TaskId>,
        payload: serde_json::Value,
    ) {
        self.publish(Message::new(topic, correlation_id, payload))
            .await;
    }

    /// Number of live subscribers on a topic. Test and introspection aid.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().expect("bus topic registry poisoned");
        topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}
