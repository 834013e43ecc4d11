use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub &'static str);

/// Payloads that know which topic they belong to.
pub trait Routed {
    fn topic(&self) -> Topic;
}

#[derive(Debug, Clone)]
pub struct EventEnvelope<T: Clone + Send + Sync + Debug + 'static> {
    pub topic: Topic,
    pub payload: T,
    pub ts_ms: u128,
}

/// Topic-keyed broadcast bus.
///
/// Publishing never awaits: events are handed to `tokio::sync::broadcast`
/// senders, so a publisher may emit from inside a synchronous critical
/// section. Slow subscribers lag and lose the oldest envelopes rather than
/// stalling the publisher.
#[derive(Clone)]
pub struct EventBus<T: Clone + Send + Sync + Debug + 'static> {
    inner: Arc<RwLock<Inner<T>>>,
    subscribe_buffer: usize,
}

struct Inner<T: Clone + Send + Sync + Debug + 'static> {
    topics: HashMap<&'static str, broadcast::Sender<EventEnvelope<T>>>,
    firehose: broadcast::Sender<EventEnvelope<T>>,
}

impl<T: Clone + Send + Sync + Debug + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> EventBus<T> {
    pub fn new(subscribe_buffer: usize) -> Self {
        let subscribe_buffer = subscribe_buffer.max(1);
        let (firehose, _rx) = broadcast::channel(subscribe_buffer);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                topics: HashMap::new(),
                firehose,
            })),
            subscribe_buffer,
        }
    }

    fn ensure_topic(&self, topic: Topic) -> broadcast::Sender<EventEnvelope<T>> {
        if let Some(tx) = self.inner.read().topics.get(topic.0) {
            return tx.clone();
        }
        let mut inner = self.inner.write();
        inner
            .topics
            .entry(topic.0)
            .or_insert_with(|| {
                info!(target: "event_bus", topic = topic.0, "created topic");
                broadcast::channel(self.subscribe_buffer).0
            })
            .clone()
    }

    /// Publishes `payload` on `topic` and returns how many receivers got it.
    pub fn publish(&self, topic: Topic, payload: T) -> usize {
        let envelope = EventEnvelope {
            topic,
            payload,
            ts_ms: current_ts_ms(),
        };
        let (topic_tx, firehose) = {
            let inner = self.inner.read();
            (inner.topics.get(topic.0).cloned(), inner.firehose.clone())
        };

        let mut delivered = firehose.send(envelope.clone()).unwrap_or(0);
        if let Some(tx) = topic_tx {
            delivered += tx.send(envelope).unwrap_or(0);
        }

        if delivered == 0 {
            debug!(target: "event_bus", topic = topic.0, "no subscribers");
        } else {
            debug!(target: "event_bus", topic = topic.0, delivered, "published");
        }
        delivered
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope<T>> {
        self.ensure_topic(topic).subscribe()
    }

    /// Receives every envelope regardless of topic.
    pub fn subscribe_all(&self) -> broadcast::Receiver<EventEnvelope<T>> {
        self.inner.read().firehose.subscribe()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .read()
            .topics
            .get(topic.0)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl<T: Routed + Clone + Send + Sync + Debug + 'static> EventBus<T> {
    pub fn emit(&self, payload: T) -> usize {
        let topic = payload.topic();
        self.publish(topic, payload)
    }
}

fn current_ts_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
