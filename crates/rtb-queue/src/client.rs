//! MessagingClient - named publishers and subscribers over one broker
//!
//! Publishers are pools of channel workers registered by name. Publishing is
//! fire-and-forget: the payload is handed to a leased worker's mailbox and the
//! caller moves on. Faults (unknown publisher, no worker after the retry
//! budget) are logged and the payload is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rtb_common::{PublisherConfig, SubscriberConfig};
use rtb_pool::{PoolRegistry, ResourcePool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel_worker::ChannelWorker;
use crate::identity::QueueIdentityCache;
use crate::subscriber::spawn_subscriber;
use crate::{queue_metrics, Broker, DeliveryHandler, QueueError, RestartPolicy, Result, Supervisor};

/// Messaging client tuning
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Checkout attempts per publish before the payload is dropped
    pub publish_attempts: u32,
    /// Sleep between publish checkout attempts
    pub publish_retry_delay: Duration,
    /// Payload bytes kept when a dropped payload is logged
    pub log_payload_max: usize,
    pub restart: RestartPolicy,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            publish_attempts: 3,
            publish_retry_delay: Duration::from_millis(20),
            log_payload_max: 256,
            restart: RestartPolicy::default(),
        }
    }
}

pub struct MessagingClient {
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    publishers: PoolRegistry<ChannelWorker>,
    identities: QueueIdentityCache,
    subscribers: DashMap<String, Vec<JoinHandle<()>>>,
    supervisor: Supervisor,
    shutdown_tx: watch::Sender<bool>,
}

impl MessagingClient {
    pub fn new(broker: Arc<dyn Broker>, config: MessagingConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(config.restart.clone(), shutdown_rx);

        info!(
            broker = %broker.identifier(),
            publish_attempts = config.publish_attempts,
            "Messaging client created"
        );

        Self {
            broker,
            config,
            publishers: PoolRegistry::new(),
            identities: QueueIdentityCache::new(),
            subscribers: DashMap::new(),
            supervisor,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Start a named publisher with `pool_size` channel workers.
    ///
    /// Returns `false` (and changes nothing) if the name is already started.
    pub fn start_publisher(&self, config: PublisherConfig) -> bool {
        let (pool, created) = self.publishers.register_if_absent(&config.name, || {
            let broker = self.broker.clone();
            let supervisor = self.supervisor.clone();
            let settings = config.clone();
            let log_payload_max = self.config.log_payload_max;
            ResourcePool::new(config.name.clone(), config.pool_size, config.pool_size, move |id| {
                ChannelWorker::spawn(id, &settings, broker.clone(), &supervisor, log_payload_max)
            })
        });

        if created {
            info!(
                publisher = %config.name,
                exchange = %config.exchange,
                routing_key = %config.routing_key,
                pool_size = pool.max_count(),
                "Publisher started"
            );
        } else {
            warn!(publisher = %config.name, "Publisher already started, ignoring");
        }

        created
    }

    /// Start `pool_size` independent instances of a subscriber.
    ///
    /// Every call adds instances; repeated names are not rejected. All
    /// instances of a name consume from the same queue.
    pub fn start_subscriber(&self, config: SubscriberConfig, handler: Arc<dyn DeliveryHandler>) -> usize {
        let queue = self.identities.lookup_or_generate(&config.name);
        let offset = self.subscriber_count(&config.name);

        let handles: Vec<JoinHandle<()>> = (0..config.pool_size)
            .map(|i| {
                spawn_subscriber(
                    offset + i,
                    &config,
                    queue.clone(),
                    self.broker.clone(),
                    handler.clone(),
                    &self.supervisor,
                )
            })
            .collect();

        let started = handles.len();
        self.subscribers
            .entry(config.name.clone())
            .or_default()
            .extend(handles);

        info!(
            subscriber = %config.name,
            queue = %queue,
            exchange = %config.exchange,
            topic = %config.topic,
            instances = started,
            "Subscriber started"
        );

        started
    }

    /// Fire-and-forget publish through the named publisher.
    ///
    /// Never reports failure to the caller; faults are logged and counted.
    pub async fn publish(&self, publisher: &str, payload: Vec<u8>) {
        let preview = self.preview(&payload);
        match self.try_publish(publisher, payload).await {
            Ok(()) => {}
            Err(QueueError::PublisherNotFound(name)) => {
                queue_metrics::record_publish_dropped(&name, "not_found");
                error!(publisher = %name, payload = %preview, "Publisher not found, message dropped");
            }
            Err(QueueError::PublishDropped { publisher, attempts }) => {
                queue_metrics::record_publish_dropped(&publisher, "pool_exhausted");
                error!(
                    publisher = %publisher,
                    attempts = attempts,
                    payload = %preview,
                    "No channel worker available, message dropped"
                );
            }
            Err(e) => {
                queue_metrics::record_publish_dropped(publisher, "error");
                error!(publisher = %publisher, error = %e, payload = %preview, "Publish failed");
            }
        }
    }

    /// Publish, reporting lookup and checkout faults to the caller.
    ///
    /// `Ok` means a channel worker accepted the payload; the broker outcome is
    /// logged by that worker.
    pub async fn try_publish(&self, publisher: &str, payload: Vec<u8>) -> Result<()> {
        let pool = self
            .publishers
            .get(publisher)
            .ok_or_else(|| QueueError::PublisherNotFound(publisher.to_string()))?;

        let attempts = self.config.publish_attempts.max(1);
        let mut payload = payload;

        for attempt in 1..=attempts {
            match pool.try_checkout() {
                Some(lease) => {
                    let worker_id = lease.id();
                    match ChannelWorker::submit(lease, payload) {
                        Ok(()) => {
                            debug!(publisher = %publisher, worker_id = worker_id, attempt = attempt, "Publish submitted");
                            return Ok(());
                        }
                        Err(returned) => {
                            payload = returned;
                            warn!(publisher = %publisher, worker_id = worker_id, attempt = attempt, "Channel worker not accepting work");
                        }
                    }
                }
                None => {
                    warn!(publisher = %publisher, attempt = attempt, max_attempts = attempts, "No channel worker available");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.publish_retry_delay).await;
            }
        }

        Err(QueueError::PublishDropped {
            publisher: publisher.to_string(),
            attempts,
        })
    }

    /// Channel-worker pool behind a publisher
    pub fn publisher_pool(&self, name: &str) -> Option<Arc<ResourcePool<ChannelWorker>>> {
        self.publishers.get(name)
    }

    pub fn publisher_names(&self) -> Vec<String> {
        self.publishers.names()
    }

    /// Instances started for a subscriber name
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers.get(name).map(|h| h.len()).unwrap_or(0)
    }

    pub fn queue_identity(&self, subscriber: &str) -> Option<String> {
        self.identities.lookup(subscriber)
    }

    /// Stop every actor and wait for subscribers to exit.
    pub async fn shutdown(&self) {
        info!("Messaging client shutting down");
        self.shutdown_tx.send_replace(true);

        let names: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handles)) = self.subscribers.remove(&name) {
                for handle in handles {
                    let _ = handle.await;
                }
            }
        }
    }

    fn preview(&self, payload: &[u8]) -> String {
        truncate_payload(payload, self.config.log_payload_max)
    }
}

/// Lossy UTF-8 rendering of at most `max` payload bytes.
pub fn truncate_payload(payload: &[u8], max: usize) -> String {
    let end = payload.len().min(max);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > max {
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_payload() {
        assert_eq!(truncate_payload(b"short", 256), "short");
        assert_eq!(truncate_payload(b"abcdefgh", 4), "abcd...");
        assert_eq!(truncate_payload(b"", 4), "");
    }
}
