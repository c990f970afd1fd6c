//! In-process broker
//!
//! Topic exchanges with AMQP-style routing patterns, competing consumers per
//! queue and a publish log for inspection. Used in development mode and tests;
//! `sever_connections` simulates a broker connection loss.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{signalled, Broker, BrokerChannel, DeliveryStream, QueueError, Result};

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct BrokerState {
    identifier: String,
    queues: DashMap<String, MemoryQueue>,
    bindings: RwLock<Vec<Binding>>,
    published: Mutex<Vec<PublishedMessage>>,
    connections: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    refuse_connections: AtomicBool,
    reject_publishes: AtomicBool,
    connections_opened: AtomicUsize,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryBroker {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                identifier: identifier.into(),
                queues: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                refuse_connections: AtomicBool::new(false),
                reject_publishes: AtomicBool::new(false),
                connections_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn binding_count(&self) -> usize {
        self.state.bindings.read().len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Close every open connection, as a broker restart would.
    pub fn sever_connections(&self) {
        let connections: Vec<_> = self.state.connections.lock().drain(..).collect();
        debug!(broker = %self.state.identifier, count = connections.len(), "Severing connections");
        for connection in connections {
            connection.send_replace(true);
        }
    }

    /// Refuse new connections until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make every publish fail with a broker error.
    pub fn reject_publishes(&self, reject: bool) {
        self.state.reject_publishes.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn identifier(&self) -> &str {
        &self.state.identifier
    }

    async fn open_channel(&self, connection_name: &str) -> Result<Box<dyn BrokerChannel>> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed(format!(
                "{} refused connection {}",
                self.state.identifier, connection_name
            )));
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        self.state.connections.lock().push(closed_tx.clone());
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);

        debug!(broker = %self.state.identifier, connection = %connection_name, "Opened in-memory channel");

        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            closed_tx,
            closed_rx,
        }))
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueueError::ConnectionClosed("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.state.reject_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Broker(format!("publish to {} rejected", exchange)));
        }

        self.state.published.lock().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });

        // A queue bound more than once still receives a single copy
        let targets: BTreeSet<String> = self
            .state
            .bindings
            .read()
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue in targets {
            if let Some(q) = self.state.queues.get(&queue) {
                let _ = q.tx.send(payload.to_vec());
            }
        }

        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            MemoryQueue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, topic: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.state.queues.contains_key(queue) {
            return Err(QueueError::Broker(format!("queue {} is not declared", queue)));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: topic.to_string(),
        };
        let mut bindings = self.state.bindings.write();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let rx = self
            .state
            .queues
            .get(queue)
            .map(|q| q.rx.clone())
            .ok_or_else(|| QueueError::Broker(format!("queue {} is not declared", queue)))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consuming from in-memory queue");

        // Consumers of the same queue take turns on the receiver
        let closed = self.closed_rx.clone();
        let stream = futures::stream::unfold((rx, closed), |(rx, mut closed)| async move {
            let next = {
                let mut receiver = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = signalled(&mut closed) => None,
                    payload = receiver.recv() => payload,
                }
            };
            next.map(|payload| (Ok(payload), (rx, closed)))
        });

        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn close(&self) {
        self.closed_tx.send_replace(true);
        self.state
            .connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.closed_tx));
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern, key) {
        ([], []) => true,
        (["#", rest @ ..], _) => {
            words_match(rest, key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (["*", rest @ ..], [_, key_rest @ ..]) => words_match(rest, key_rest),
        ([word, rest @ ..], [k, key_rest @ ..]) if word == k => words_match(rest, key_rest),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("wins", "wins"));
        assert!(!topic_matches("wins", "clicks"));
        assert!(topic_matches("events.*", "events.wins"));
        assert!(!topic_matches("events.*", "events.wins.eu"));
        assert!(topic_matches("events.#", "events.wins.eu"));
        assert!(topic_matches("events.#", "events"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.wins", "rtb.wins"));
        assert!(!topic_matches("*.wins", "wins"));
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let broker = InMemoryBroker::default();
        let channel = broker.open_channel("test").await.unwrap();

        channel.declare_queue("q1").await.unwrap();
        channel.bind_queue("q1", "rtb.events", "wins").await.unwrap();
        channel.bind_queue("q1", "rtb.events", "wins").await.unwrap();

        let mut deliveries = channel.consume("q1", "c1").await.unwrap();
        channel.publish("rtb.events", "wins", b"w1").await.unwrap();
        channel.publish("rtb.events", "clicks", b"c1").await.unwrap();
        channel.publish("rtb.events", "wins", b"w2").await.unwrap();

        assert_eq!(deliveries.next().await.unwrap().unwrap(), b"w1".to_vec());
        assert_eq!(deliveries.next().await.unwrap().unwrap(), b"w2".to_vec());
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn test_severed_channel_rejects_and_ends_stream() {
        let broker = InMemoryBroker::default();
        let channel = broker.open_channel("test").await.unwrap();
        channel.declare_queue("q1").await.unwrap();
        let mut deliveries = channel.consume("q1", "c1").await.unwrap();

        broker.sever_connections();

        assert!(!channel.is_open());
        assert!(deliveries.next().await.is_none());
        assert!(matches!(
            channel.publish("x", "y", b"z").await,
            Err(QueueError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = InMemoryBroker::default();
        broker.refuse_connections(true);
        assert!(broker.open_channel("test").await.is_err());

        broker.refuse_connections(false);
        assert!(broker.open_channel("test").await.is_ok());
        assert_eq!(broker.connections_opened(), 1);
    }
}
