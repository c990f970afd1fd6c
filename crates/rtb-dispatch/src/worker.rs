//! Dispatch worker - one event at a time
//!
//! Each pooled worker is a task with a single-slot mailbox. A job carries the
//! caller's lease and a reply channel; the worker drops the lease before it
//! replies, so the pool has the worker back by the time the caller resumes.
//!
//! A job that panics discards its lease before the caller is told
//! `WorkerCrashed`. Discarding drops the last mailbox sender, so the task
//! exits and the pool constructs a replacement on a later checkout.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use rtb_common::{Decision, Event, EventOptions};
use rtb_pool::{Poolable, PooledWorker};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::decision::decide;
use crate::dispatcher::Collaborators;
use crate::{DispatchError, Result};

pub(crate) struct DispatchJob {
    event: Event,
    options: EventOptions,
    lease: PooledWorker<DispatchWorker>,
    reply: oneshot::Sender<Result<Decision>>,
}

/// Pool handle of a dispatch worker
#[derive(Debug)]
pub struct DispatchWorker {
    id: usize,
    mailbox: mpsc::Sender<DispatchJob>,
}

impl Poolable for DispatchWorker {
    fn is_alive(&self) -> bool {
        !self.mailbox.is_closed()
    }
}

/// Shared, read-only state of every worker in a dispatcher
pub(crate) struct WorkerContext {
    pub collaborators: Collaborators,
    pub stats_sample_rate: f64,
}

impl DispatchWorker {
    pub(crate) fn spawn(id: usize, context: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(run(id, rx, context, shutdown));
        Self { id, mailbox: tx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand the event to the leased worker and return the pending reply.
    ///
    /// A worker that stopped accepting jobs gives the event back; its lease
    /// has already been returned, and the pool discards the dead handle.
    pub(crate) fn submit(
        lease: PooledWorker<DispatchWorker>,
        event: Event,
        options: EventOptions,
    ) -> std::result::Result<oneshot::Receiver<Result<Decision>>, Rejected> {
        let (reply, pending) = oneshot::channel();
        let worker_id = lease.id;
        let mailbox = lease.mailbox.clone();

        match mailbox.try_send(DispatchJob {
            event,
            options,
            lease,
            reply,
        }) {
            Ok(()) => Ok(pending),
            Err(mpsc::error::TrySendError::Full(job)) | Err(mpsc::error::TrySendError::Closed(job)) => {
                drop(job.lease);
                Err(Rejected {
                    worker_id,
                    event: job.event,
                    options: job.options,
                })
            }
        }
    }
}

/// An event a leased worker refused
pub(crate) struct Rejected {
    pub worker_id: usize,
    pub event: Event,
    pub options: EventOptions,
}

async fn run(
    id: usize,
    mut mailbox: mpsc::Receiver<DispatchJob>,
    context: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id = id, "Dispatch worker started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            job = mailbox.recv() => match job {
                Some(DispatchJob { event, options, lease, reply }) => {
                    match AssertUnwindSafe(handle_event(&event, &options, &context)).catch_unwind().await {
                        Ok(result) => {
                            drop(lease);
                            let _ = reply.send(result);
                        }
                        Err(panic) => {
                            let reason = panic_message(panic.as_ref());
                            error!(worker_id = id, topic = event.kind().topic(), reason = %reason, "Dispatch worker crashed");
                            lease.discard();
                            let _ = reply.send(Err(DispatchError::WorkerCrashed(format!(
                                "worker {} panicked: {}",
                                id, reason
                            ))));
                        }
                    }
                }
                None => break,
            }
        }
    }

    debug!(worker_id = id, "Dispatch worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Audit, emit to the sinks (unless in test mode), then decide.
pub(crate) async fn handle_event(event: &Event, options: &EventOptions, context: &WorkerContext) -> Result<Decision> {
    let kind = event.kind();
    let topic = kind.topic();
    let record = event.to_record();

    info!(
        topic = topic,
        bid_id = %record.bid_id,
        campaign_id = record.campaign_id,
        creative_id = record.creative_id,
        exchange_id = %record.exchange_id,
        win_price = ?record.win_price,
        timestamp_bucket = record.timestamp_bucket,
        test = options.test,
        "Event received"
    );

    if !options.test {
        let sinks = &context.collaborators;
        sinks.stats.increment(&kind.counter_name(), 1, context.stats_sample_rate);
        sinks.store.insert(topic, &record).await?;
        let payload = serde_json::to_vec(&record)?;
        sinks.bus.publish(topic, payload).await;
    }

    Ok(decide(event, options, context.collaborators.creatives.as_ref()))
}
