//! Streaming event bus for execution observability
//!
//! A per-process map of `execution_id → broadcast channel`. Subscribers
//! attach by execution id and receive every subsequent event in publication
//! order with monotonically increasing sequence numbers; cross-subscriber
//! ordering is not guaranteed. Queues are bounded: a subscriber that falls
//! too far behind loses the oldest events (never blocking the publisher)
//! and keeps receiving from the current position.
//!
//! There is no replay. A client that reconnects mid-execution must fetch
//! the current state through a query and then re-attach.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// Queue depth per subscriber before oldest-drop kicks in.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionAborted,
    ExecutionUpdate,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
}

impl EventType {
    /// Whether this event ends the execution's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::ExecutionCompleted | EventType::ExecutionFailed | EventType::ExecutionAborted
        )
    }
}

/// One event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    /// Monotonically increasing per execution; subscribers see a strictly
    /// increasing suffix of the publish order.
    pub sequence: u64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

struct ExecutionChannel {
    tx: broadcast::Sender<ExecutionEvent>,
    sequence: Arc<AtomicU64>,
    last_publish: Instant,
}

/// Per-process event bus.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, ExecutionChannel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber, creating the per-execution entry if absent.
    pub fn subscribe(&self, execution_id: &str) -> EventStream {
        let mut channels = self.channels.lock();
        let channel = channels.entry(execution_id.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_CAPACITY);
            ExecutionChannel {
                tx,
                sequence: Arc::new(AtomicU64::new(0)),
                last_publish: Instant::now(),
            }
        });
        EventStream { rx: channel.tx.subscribe() }
    }

    /// Publish an event to every current subscriber. Never blocks: slow
    /// subscribers drop their oldest events. A terminal event tears the
    /// per-execution entry down; pending deliveries already enqueued are
    /// still drained by their receivers.
    pub fn publish(
        &self,
        execution_id: &str,
        event_type: EventType,
        node_id: Option<String>,
        data: Value,
    ) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(execution_id) else {
            tracing::debug!(execution_id, ?event_type, "publish with no subscribers");
            return;
        };

        let event = ExecutionEvent {
            execution_id: execution_id.to_string(),
            sequence: channel.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now().timestamp_millis(),
            event_type,
            node_id,
            data,
        };
        channel.last_publish = Instant::now();

        // A send error only means there are no receivers right now.
        let _ = channel.tx.send(event);

        if event_type.is_terminal() {
            channels.remove(execution_id);
        }
    }

    /// Seconds since the last publish for this execution, if it is live.
    pub fn idle_seconds(&self, execution_id: &str) -> Option<u64> {
        self.channels
            .lock()
            .get(execution_id)
            .map(|c| c.last_publish.elapsed().as_secs())
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.channels
            .lock()
            .get(execution_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the per-execution entry without a terminal event (abort paths).
    pub fn remove(&self, execution_id: &str) {
        self.channels.lock().remove(execution_id);
    }
}

/// A subscriber's view of one execution's events.
///
/// Dropping the stream unsubscribes; any pending deliveries are discarded.
pub struct EventStream {
    rx: broadcast::Receiver<ExecutionEvent>,
}

impl EventStream {
    /// Next event, or `None` once the execution has terminated and the
    /// queue is drained. Overflow is absorbed by skipping to the oldest
    /// retained event.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscriber lagged, dropping oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a [`tokio_stream::Stream`] for combinator-style consumers.
    pub fn into_stream(mut self) -> impl tokio_stream::Stream<Item = ExecutionEvent> {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }

    /// Collect events until a terminal execution event (inclusive).
    pub async fn collect_to_end(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            let terminal = event.event_type.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe("e1");

        bus.publish("e1", EventType::ExecutionStarted, None, json!({}));
        bus.publish("e1", EventType::NodeStarted, Some("n".into()), json!({}));
        bus.publish("e1", EventType::ExecutionCompleted, None, json!({}));

        let a = stream.next().await.unwrap();
        let b = stream.next().await.unwrap();
        let c = stream.next().await.unwrap();
        assert_eq!(a.event_type, EventType::ExecutionStarted);
        assert_eq!(b.event_type, EventType::NodeStarted);
        assert_eq!(b.node_id.as_deref(), Some("n"));
        assert_eq!(c.event_type, EventType::ExecutionCompleted);
        assert_eq!((a.sequence, b.sequence, c.sequence), (0, 1, 2));

        // Channel torn down after the terminal event.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_two_subscribers_see_the_same_sequence() {
        let bus = EventBus::new();
        let mut s1 = bus.subscribe("e1");
        let mut s2 = bus.subscribe("e1");

        bus.publish("e1", EventType::ExecutionStarted, None, json!({}));
        bus.publish("e1", EventType::ExecutionCompleted, None, json!({}));

        for stream in [&mut s1, &mut s2] {
            let first = stream.next().await.unwrap();
            let second = stream.next().await.unwrap();
            assert_eq!(first.sequence, 0);
            assert_eq!(second.sequence, 1);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_only_subsequent_events() {
        let bus = EventBus::new();
        let mut early = bus.subscribe("e1");
        bus.publish("e1", EventType::ExecutionStarted, None, json!({}));

        let mut late = bus.subscribe("e1");
        bus.publish("e1", EventType::NodeStarted, Some("n".into()), json!({}));

        assert_eq!(early.next().await.unwrap().sequence, 0);
        assert_eq!(early.next().await.unwrap().sequence, 1);
        // The late subscriber has no claim on sequence 0.
        assert_eq!(late.next().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_contained() {
        let bus = EventBus::new();
        // No entry exists; publish is a no-op rather than an error.
        bus.publish("ghost", EventType::ExecutionStarted, None, json!({}));
        assert_eq!(bus.subscriber_count("ghost"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let bus = EventBus::new();
        let stream = bus.subscribe("e1");
        assert_eq!(bus.subscriber_count("e1"), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count("e1"), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_not_publisher() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe("e1");

        // Overflow the bounded queue without ever reading.
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish("e1", EventType::ExecutionUpdate, None, json!({ "i": i }));
        }

        // The subscriber resumes at the oldest retained event.
        let first = stream.next().await.unwrap();
        assert!(first.sequence >= 10);
    }
}
