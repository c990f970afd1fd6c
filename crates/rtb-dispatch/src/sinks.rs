//! Downstream sinks of an event
//!
//! The dispatch core emits every live event to three collaborators:
//! - a stats sink (fire-and-forget counters)
//! - a durable store (insert keyed by topic)
//! - a message bus (publish keyed by topic)

use async_trait::async_trait;
use parking_lot::Mutex;
use rtb_common::EventRecord;
use rtb_queue::MessagingClient;

use crate::dispatch_metrics;
use crate::error::StoreError;

/// Best-effort counter sink
pub trait StatsSink: Send + Sync {
    fn increment(&self, counter: &str, amount: u64, sample_rate: f64);
}

/// Durable event storage. Failures are raised, never retried by the caller.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, topic: &str, record: &EventRecord) -> Result<(), StoreError>;
}

/// Fire-and-forget publish of a serialized record
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>);
}

/// Topics map one-to-one onto publisher names.
#[async_trait]
impl MessageBus for MessagingClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) {
        MessagingClient::publish(self, topic, payload).await
    }
}

/// Stats sink backed by the `metrics` facade.
///
/// Sampled increments are scaled back up by the sample rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsStatsSink;

impl StatsSink for MetricsStatsSink {
    fn increment(&self, counter: &str, amount: u64, sample_rate: f64) {
        if sample_rate >= 1.0 {
            dispatch_metrics::record_event_counter(counter, amount);
            return;
        }
        if sample_rate <= 0.0 {
            return;
        }
        if rand::random::<f64>() < sample_rate {
            let scaled = (amount as f64 / sample_rate).round() as u64;
            dispatch_metrics::record_event_counter(counter, scaled);
        }
    }
}

/// Process-local store, used in development mode and tests
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    records: Mutex<Vec<(String, EventRecord)>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, EventRecord)> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, topic: &str) -> Vec<EventRecord> {
        self.records
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, topic: &str, record: &EventRecord) -> Result<(), StoreError> {
        self.records.lock().push((topic.to_string(), record.clone()));
        Ok(())
    }
}
