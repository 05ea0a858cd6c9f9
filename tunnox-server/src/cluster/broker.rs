//! # Message Broker
//!
//! Topic-based publish/subscribe used for cross-node control: locating
//! clients, fanning out config pushes and kicks. Delivery is at-least-once
//! within a subscriber's lifetime, and a single subscriber observes each
//! publisher's messages in publish order within one topic.
//!
//! The concrete backing is pluggable behind the [`Broker`] trait; the
//! in-memory implementation serves single-process clusters and tests, and
//! its identity never leaks above the trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-subscriber channel depth.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A live subscription; dropping it ends delivery.
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<BrokerMessage>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

/// The pub/sub fabric the cluster rides on.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;

    async fn unsubscribe(&self, topic: &str, subscription_id: u64) -> Result<(), BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

// ─── In-Memory Backing ──────────────────────────────────────────

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BrokerMessage>,
}

/// Process-local broker: a subscriber list per topic under a
/// reader/writer lock. Publishing snapshots the list under the read lock
/// and fans out without holding it.
#[derive(Default)]
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&self, topic: &str, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        let mut topics = self.topics.write().expect("broker lock poisoned");
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| !dead.contains(&s.id));
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let targets: Vec<(u64, mpsc::Sender<BrokerMessage>)> = {
            let topics = self.topics.read().expect("broker lock poisoned");
            topics
                .get(topic)
                .map(|subs| subs.iter().map(|s| (s.id, s.tx.clone())).collect())
                .unwrap_or_default()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            let message = BrokerMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if tx.send(message).await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            debug!(topic, dropped = dead.len(), "pruning dead subscribers");
            self.prune(topic, &dead);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.topics
            .write()
            .expect("broker lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            rx,
        })
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: u64) -> Result<(), BrokerError> {
        self.prune(topic, &[subscription_id]);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_publish_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();
        for i in 0u8..5 {
            broker.publish("t", vec![i]).await.unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(sub.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("a").await.unwrap();
        let _b = broker.subscribe("b").await.unwrap();

        broker.publish("a", b"for-a".to_vec()).await.unwrap();
        broker.publish("c", b"nobody".to_vec()).await.unwrap();

        let got = a.recv().await.unwrap();
        assert_eq!(got.topic, "a");
        assert_eq!(got.payload, b"for-a");
    }

    #[tokio::test]
    async fn every_subscriber_of_a_topic_gets_the_message() {
        let broker = MemoryBroker::new();
        let mut one = broker.subscribe("t").await.unwrap();
        let mut two = broker.subscribe("t").await.unwrap();

        broker.publish("t", b"x".to_vec()).await.unwrap();
        assert_eq!(one.recv().await.unwrap().payload, b"x");
        assert_eq!(two.recv().await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();
        broker.unsubscribe("t", sub.id()).await.unwrap();
        broker.publish("t", b"late".to_vec()).await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_publish() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("t").await.unwrap();
        drop(sub);
        // Publish twice: the first notices the dead channel and prunes.
        broker.publish("t", b"1".to_vec()).await.unwrap();
        broker.publish("t", b"2".to_vec()).await.unwrap();
        assert!(broker.topics.read().unwrap().get("t").is_none());
    }
}
