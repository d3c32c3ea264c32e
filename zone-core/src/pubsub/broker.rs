//! Process-wide pub/sub registry.
//!
//! Grounded in [`crate::transport::registry::ChannelRegistry`]'s member
//! map, but generalized: subscribers aren't WebSocket frame senders,
//! they're [`DomainEvent`] mailboxes, and the registry itself is a
//! lock-free concurrent map rather than an actor — per spec §5, updates
//! to the subscriber-set are meant to never serialize behind a single
//! mailbox.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::message::DomainEvent;
use super::topic::Topic;

/// A subscriber's unbounded mailbox. Sending never blocks (spec §5).
pub type Mailbox = mpsc::UnboundedSender<DomainEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

struct Subscription {
    id: SubscriberId,
    mailbox: Mailbox,
}

/// The fabric. Cheaply cloneable (an `Arc` around the map); typically one
/// instance lives in [`crate::state::AppState`] for the life of the process.
#[derive(Clone, Default)]
pub struct PubSub {
    topics: Arc<DashMap<String, Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl PubSub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox against a topic. Returns the subscriber id so
    /// the caller can `unsubscribe` the exact registration later — a
    /// channel that subscribes to several topics keeps one id per topic.
    pub fn subscribe(&self, topic: &Topic) -> (SubscriberId, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .entry(topic.as_str().to_string())
            .or_default()
            .push(Subscription { id, mailbox: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, topic: &Topic, id: SubscriberId) {
        if let Some(mut subs) = self.topics.get_mut(topic.as_str()) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Remove every subscription for `id` across all topics. Used on
    /// socket disconnect, when a channel doesn't keep track of every
    /// topic it joined (e.g. per-policy topics added/removed over time).
    pub fn unsubscribe_all(&self, id: SubscriberId) {
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().retain(|s| s.id != id);
        }
    }

    /// Publish to every current subscriber of `topic`. Dead mailboxes
    /// (receiver dropped) are pruned lazily on the next publish.
    pub fn publish(&self, topic: &Topic, event: DomainEvent) {
        let Some(mut subs) = self.topics.get_mut(topic.as_str()) else {
            return;
        };
        subs.retain(|s| s.mailbox.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic.as_str()).map_or(0, |s| s.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, ClientId};
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = PubSub::new();
        let topic = Topic::account(AccountId::new(Uuid::nil()));
        let (_id, mut rx) = bus.subscribe(&topic);

        bus.publish(&topic, DomainEvent::Disconnect);

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, DomainEvent::Disconnect));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = PubSub::new();
        let topic = Topic::client(ClientId::new(Uuid::nil()));
        let (id, mut rx) = bus.subscribe(&topic);
        bus.unsubscribe(&topic, id);

        bus.publish(&topic, DomainEvent::Disconnect);

        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = PubSub::new();
        let topic = Topic::client(ClientId::new(Uuid::nil()));
        let (_id, rx) = bus.subscribe(&topic);
        drop(rx);

        bus.publish(&topic, DomainEvent::Disconnect);

        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
