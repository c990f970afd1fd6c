//! EventDispatcher - entry point of the event logging path
//!
//! Per call:
//! 1. Check out a dispatch worker (bounded immediate retries)
//! 2. Hand the event to the worker and wait for its reply
//! 3. The worker audits, emits to stats/store/bus unless in test mode,
//!    computes the decision and returns itself to the pool before replying

use std::sync::Arc;

use rtb_common::{Decision, Event, EventContext, EventOptions};
use rtb_pool::{PoolStats, PooledWorker, ResourcePool, DEFAULT_CHECKOUT_ATTEMPTS};
use tokio::sync::{oneshot, watch};
use tracing::{info, trace, warn};

use crate::creative::CreativeCache;
use crate::sinks::{EventStore, MessageBus, StatsSink};
use crate::worker::{DispatchWorker, WorkerContext};
use crate::{dispatch_metrics, DispatchError, Result};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub pool_name: String,
    pub max_workers: usize,
    /// Workers started up front
    pub init_workers: usize,
    pub checkout_attempts: u32,
    /// Sample rate passed to the stats sink
    pub stats_sample_rate: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_name: "event_workers".to_string(),
            max_workers: 50,
            init_workers: 10,
            checkout_attempts: DEFAULT_CHECKOUT_ATTEMPTS,
            stats_sample_rate: 1.0,
        }
    }
}

/// External collaborators of the dispatch core
#[derive(Clone)]
pub struct Collaborators {
    pub stats: Arc<dyn StatsSink>,
    pub store: Arc<dyn EventStore>,
    pub bus: Arc<dyn MessageBus>,
    pub creatives: Arc<dyn CreativeCache>,
}

pub struct EventDispatcher {
    config: DispatcherConfig,
    pool: Arc<ResourcePool<DispatchWorker>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EventDispatcher {
    /// Build the dispatcher and pre-warm its worker pool.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: DispatcherConfig, collaborators: Collaborators) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = Arc::new(WorkerContext {
            collaborators,
            stats_sample_rate: config.stats_sample_rate,
        });

        let pool = ResourcePool::with_checkout_attempts(
            config.pool_name.clone(),
            config.max_workers,
            config.init_workers,
            config.checkout_attempts,
            move |id| DispatchWorker::spawn(id, context.clone(), shutdown_rx.clone()),
        );

        info!(
            pool = %config.pool_name,
            max_workers = config.max_workers,
            init_workers = config.init_workers,
            "Event dispatcher started"
        );

        Self {
            config,
            pool,
            shutdown_tx,
        }
    }

    /// Log a win. Replies `Successful`.
    pub async fn log_win(&self, context: EventContext, win_price: f64, options: EventOptions) -> Result<Decision> {
        self.dispatch(Event::Win { context, win_price }, options).await
    }

    /// Log an impression. Replies with the creative's markup or asset path.
    pub async fn log_impression(&self, context: EventContext, options: EventOptions) -> Result<Decision> {
        self.dispatch(Event::Impression(context), options).await
    }

    /// Log a click. Replies with the click-through URL.
    pub async fn log_click(&self, context: EventContext, options: EventOptions) -> Result<Decision> {
        self.dispatch(Event::Click(context), options).await
    }

    /// Conversions are accepted and ignored.
    pub fn log_conversion(&self, context: &EventContext, _options: &EventOptions) {
        trace!(bid_id = %context.bid_id, "Conversion ignored");
    }

    pub async fn dispatch(&self, event: Event, options: EventOptions) -> Result<Decision> {
        if *self.shutdown_tx.borrow() {
            return Err(DispatchError::ShuttingDown);
        }

        let topic = event.kind().topic();
        let test = options.test;
        let lease = self.checkout(topic)?;
        let pending = self.submit(lease, event, options)?;

        let result = match pending.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::WorkerCrashed(format!(
                "worker in {} exited before replying",
                self.pool.name()
            ))),
        };

        if !test {
            dispatch_metrics::record_dispatched(topic, if result.is_ok() { "ok" } else { "error" });
        }
        result
    }

    fn checkout(&self, topic: &str) -> Result<PooledWorker<DispatchWorker>> {
        self.pool.checkout().map_err(|e| {
            dispatch_metrics::record_pool_exhausted(self.pool.name());
            warn!(pool = %self.pool.name(), topic = topic, error = %e, "Event rejected, no worker available");
            DispatchError::NoWorkerAvailable(e)
        })
    }

    /// Submit to the leased worker, moving on to another worker if it has
    /// stopped since checkout. Bounded by the checkout attempt budget.
    pub(crate) fn submit(
        &self,
        lease: PooledWorker<DispatchWorker>,
        event: Event,
        options: EventOptions,
    ) -> Result<oneshot::Receiver<Result<Decision>>> {
        let topic = event.kind().topic();
        let mut rejected = match DispatchWorker::submit(lease, event, options) {
            Ok(pending) => return Ok(pending),
            Err(rejected) => rejected,
        };

        for attempt in 2..=self.config.checkout_attempts {
            warn!(
                pool = %self.pool.name(),
                worker_id = rejected.worker_id,
                attempt = attempt,
                "Worker stopped after checkout, retrying on another"
            );
            let lease = self.checkout(topic)?;
            rejected = match DispatchWorker::submit(lease, rejected.event, rejected.options) {
                Ok(pending) => return Ok(pending),
                Err(rejected) => rejected,
            };
        }

        Err(DispatchError::WorkerCrashed(format!(
            "worker {} in {} is not accepting jobs",
            rejected.worker_id,
            self.pool.name()
        )))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Stop accepting events and stop idle workers.
    pub fn shutdown(&self) {
        info!(pool = %self.pool.name(), "Event dispatcher shutting down");
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rtb_pool::Poolable;

    use super::*;
    use crate::creative::InMemoryCreativeCache;
    use crate::sinks::{InMemoryEventStore, MetricsStatsSink};

    struct NullBus;

    #[async_trait]
    impl MessageBus for NullBus {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) {}
    }

    fn single_worker_dispatcher() -> EventDispatcher {
        EventDispatcher::new(
            DispatcherConfig {
                max_workers: 1,
                init_workers: 1,
                ..Default::default()
            },
            Collaborators {
                stats: Arc::new(MetricsStatsSink),
                store: Arc::new(InMemoryEventStore::new()),
                bus: Arc::new(NullBus),
                creatives: Arc::new(InMemoryCreativeCache::new()),
            },
        )
    }

    fn win() -> Event {
        Event::Win {
            context: EventContext {
                bid_id: "b1".to_string(),
                campaign_id: 7,
                creative_id: 3,
                timestamp_bucket: 1000,
                exchange_id: "ex1".to_string(),
            },
            win_price: 1.0,
        }
    }

    #[tokio::test]
    async fn test_submit_moves_past_worker_stopped_after_checkout() {
        let dispatcher = single_worker_dispatcher();
        let stale = dispatcher.pool.checkout().unwrap();

        // Stop the worker while its lease is held, then reopen the dispatcher
        dispatcher.shutdown_tx.send_replace(true);
        for _ in 0..200 {
            if !stale.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!stale.is_alive());
        dispatcher.shutdown_tx.send_replace(false);

        let pending = dispatcher.submit(stale, win(), EventOptions::default()).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Decision::Successful);

        let stats = dispatcher.pool_stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.checked_out, 0);
    }
}
