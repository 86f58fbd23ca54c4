//! Pub/sub layer binding mutations to live subscribers.
//!
//! The core treats the pub/sub collaborator as opaque behind the [`PubSub`]
//! trait; [`MemoryPubSub`] is the in-process reference implementation used by
//! the server default and by tests. Delivery preserves publish order per
//! channel; publishing to a channel with zero subscribers is a no-op, not an
//! error.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::error::Result;

/// Event published on a channel when an entity changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub channel: String,
    /// The new value of the changed entity (or streamed field).
    pub data: Value,
    /// Prior value, when the publisher knows it (update/delete hooks do).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    /// Set when the event carries a single streamed field rather than the
    /// whole entity, so auto mode can pick delta encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ChangeEvent {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
            previous: None,
            field: None,
        }
    }

    /// Attach the prior value (builder pattern).
    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Mark this event as carrying one streamed field (builder pattern).
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Boxed stream of change events.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// Pub/sub collaborator interface.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish an event to a channel. Zero subscribers is a no-op.
    async fn publish(&self, channel: &str, event: ChangeEvent) -> Result<()>;

    /// Subscribe to a channel. Dropping the returned [`Subscription`]
    /// deterministically releases the channel slot.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Current subscriber count for a channel.
    async fn subscriber_count(&self, channel: &str) -> usize;

    /// Release any underlying connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Live subscription to one channel.
///
/// Implements [`Stream`]; the attached guard runs when the subscription is
/// dropped so unsubscribe never leaks a channel entry.
pub struct Subscription {
    stream: ChangeStream,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Wrap a stream with an unsubscribe action run on drop.
    pub fn new(stream: ChangeStream, on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stream,
            _guard: SubscriptionGuard(Some(Box::new(on_drop))),
        }
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

struct SubscriptionGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

struct Channel {
    id: u64,
    tx: mpsc::Sender<ChangeEvent>,
}

type ChannelMap = HashMap<String, Vec<Channel>>;

/// In-memory ordered fan-out pub/sub.
///
/// Channel map mutations (subscribe/unsubscribe) are atomic under a mutex;
/// per-channel delivery order matches publish order.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    channels: Arc<Mutex<ChannelMap>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryPubSub {
    const BUFFER: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, event: ChangeEvent) -> Result<()> {
        let senders: Vec<mpsc::Sender<ChangeEvent>> = {
            let mut channels = self.channels.lock().expect("pubsub lock poisoned");
            let Some(subscribers) = channels.get_mut(channel) else {
                tracing::trace!(channel, "publish to channel with no subscribers");
                return Ok(());
            };
            subscribers.retain(|entry| !entry.tx.is_closed());
            subscribers.iter().map(|entry| entry.tx.clone()).collect()
        };

        tracing::debug!(channel, subscribers = senders.len(), "publishing change event");
        for tx in senders {
            // A receiver dropped mid-send is an unsubscribe, not a failure.
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(Self::BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut channels = self.channels.lock().expect("pubsub lock poisoned");
            channels
                .entry(channel.to_string())
                .or_default()
                .push(Channel { id, tx });
        }

        let channels = Arc::clone(&self.channels);
        let name = channel.to_string();
        let on_drop = move || {
            let mut channels = match channels.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if let Some(subscribers) = channels.get_mut(&name) {
                subscribers.retain(|entry| entry.id != id);
                if subscribers.is_empty() {
                    channels.remove(&name);
                }
            }
        };

        Ok(Subscription::new(
            Box::pin(ReceiverStream::new(rx)),
            on_drop,
        ))
    }

    async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .expect("pubsub lock poisoned")
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock().map_err(|_| std::fmt::Error)?;
        f.debug_struct("MemoryPubSub")
            .field("channels", &channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let pubsub = MemoryPubSub::new();
        let mut sub = pubsub.subscribe("message:get:id:1").await.unwrap();

        pubsub
            .publish(
                "message:get:id:1",
                ChangeEvent::new("message:get:id:1", json!({"id": "1"})),
            )
            .await
            .unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.data, json!({"id": "1"}));
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let pubsub = MemoryPubSub::new();
        let mut sub = pubsub.subscribe("ch").await.unwrap();

        for i in 0..5 {
            pubsub
                .publish("ch", ChangeEvent::new("ch", json!(i)))
                .await
                .unwrap();
        }

        for i in 0..5 {
            assert_eq!(sub.next().await.unwrap().data, json!(i));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let pubsub = MemoryPubSub::new();

        let result = pubsub
            .publish("empty", ChangeEvent::new("empty", json!(1)))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_only_receive_their_channel() {
        let pubsub = MemoryPubSub::new();
        let mut sub_a = pubsub.subscribe("a").await.unwrap();
        let mut sub_b = pubsub.subscribe("b").await.unwrap();

        pubsub
            .publish("a", ChangeEvent::new("a", json!("for-a")))
            .await
            .unwrap();

        assert_eq!(sub_a.next().await.unwrap().data, json!("for-a"));

        // Nothing queued for b.
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), sub_b.next());
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn test_drop_releases_channel_slot() {
        let pubsub = MemoryPubSub::new();
        let sub = pubsub.subscribe("ch").await.unwrap();
        assert_eq!(pubsub.subscriber_count("ch").await, 1);

        drop(sub);
        assert_eq!(pubsub.subscriber_count("ch").await, 0);

        // Publishing after everyone left still succeeds and delivers to nobody.
        let result = pubsub.publish("ch", ChangeEvent::new("ch", json!(1))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_fan_out() {
        let pubsub = MemoryPubSub::new();
        let mut first = pubsub.subscribe("ch").await.unwrap();
        let mut second = pubsub.subscribe("ch").await.unwrap();
        assert_eq!(pubsub.subscriber_count("ch").await, 2);

        pubsub
            .publish("ch", ChangeEvent::new("ch", json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(first.next().await.unwrap().data, json!({"n": 1}));
        assert_eq!(second.next().await.unwrap().data, json!({"n": 1}));
    }

    #[test]
    fn test_change_event_serde() {
        let event = ChangeEvent::new("ch", json!({"id": "1"}))
            .with_previous(json!({"id": "0"}))
            .with_field("content");

        let text = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&text).unwrap();

        assert_eq!(back, event);
    }

    #[test]
    fn test_change_event_optional_fields_skipped() {
        let event = ChangeEvent::new("ch", json!(1));
        let text = serde_json::to_string(&event).unwrap();

        assert!(!text.contains("previous"));
        assert!(!text.contains("field"));
    }
}
