//! Channel worker - pooled publisher actor
//!
//! Each worker owns one broker channel bound to a publisher's exchange and
//! routing key. The pooled handle is just the actor's mailbox; a publish
//! command carries the caller's lease, and the actor drops that lease once the
//! broker has answered, returning itself to the pool whatever the outcome.

use std::sync::Arc;

use rtb_common::PublisherConfig;
use rtb_pool::{Poolable, PooledWorker};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::client::truncate_payload;
use crate::{queue_metrics, signalled, Broker, QueueError, Result, Supervisor};

/// A command for a channel worker.
pub enum ChannelCommand {
    Publish {
        payload: Vec<u8>,
        lease: PooledWorker<ChannelWorker>,
    },
}

/// Pool handle for one publisher channel actor.
#[derive(Debug)]
pub struct ChannelWorker {
    id: usize,
    publisher: String,
    mailbox: mpsc::Sender<ChannelCommand>,
}

impl Poolable for ChannelWorker {
    fn is_alive(&self) -> bool {
        !self.mailbox.is_closed()
    }
}

/// Receiving end of a worker's mailbox, shared by its incarnations.
///
/// Outlives restarts. When the last incarnation is gone for good, anything
/// still queued is reported as dropped.
struct Mailbox {
    rx: mpsc::Receiver<ChannelCommand>,
    publisher: String,
    log_payload_max: usize,
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Closed first, so the leases below are discarded instead of pooled
        self.rx.close();
        while let Ok(ChannelCommand::Publish { payload, lease }) = self.rx.try_recv() {
            queue_metrics::record_publish_dropped(&self.publisher, "worker_stopped");
            error!(
                publisher = %self.publisher,
                worker_id = lease.id,
                payload = %truncate_payload(&payload, self.log_payload_max),
                "Publish dropped, channel worker stopped"
            );
        }
    }
}

type SharedMailbox = Arc<Mutex<Mailbox>>;

impl ChannelWorker {
    /// Start a supervised channel actor and return its pool handle.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        id: usize,
        config: &PublisherConfig,
        broker: Arc<dyn Broker>,
        supervisor: &Supervisor,
        log_payload_max: usize,
    ) -> Self {
        // A leased worker has at most one command in flight
        let (tx, rx) = mpsc::channel(1);
        let mailbox: SharedMailbox = Arc::new(Mutex::new(Mailbox {
            rx,
            publisher: config.name.clone(),
            log_payload_max,
        }));
        let actor = format!("{}-{}", config.name, id);
        let shutdown = supervisor.shutdown_signal();

        let settings = config.clone();
        let name = actor.clone();
        let _supervision: JoinHandle<()> = supervisor.spawn(actor, move || {
            run(
                name.clone(),
                settings.clone(),
                broker.clone(),
                mailbox.clone(),
                shutdown.clone(),
            )
        });

        Self {
            id,
            publisher: config.name.clone(),
            mailbox: tx,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// Hand a publish to this worker without waiting for it.
    ///
    /// On failure the payload comes back to the caller; the lease has already
    /// been returned to the pool.
    pub fn submit(lease: PooledWorker<ChannelWorker>, payload: Vec<u8>) -> std::result::Result<(), Vec<u8>> {
        let mailbox = lease.mailbox.clone();
        match mailbox.try_send(ChannelCommand::Publish { payload, lease }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(ChannelCommand::Publish { payload, lease }))
            | Err(mpsc::error::TrySendError::Closed(ChannelCommand::Publish { payload, lease })) => {
                drop(lease);
                Err(payload)
            }
        }
    }
}

/// One incarnation of a channel actor.
async fn run(
    actor: String,
    config: PublisherConfig,
    broker: Arc<dyn Broker>,
    mailbox: SharedMailbox,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let channel = broker.open_channel(&actor).await?;
    let mut closed = channel.close_signal();
    let mut mailbox = mailbox.lock().await;

    debug!(
        actor = %actor,
        exchange = %config.exchange,
        routing_key = %config.routing_key,
        "Channel worker bound to publisher"
    );

    loop {
        tokio::select! {
            _ = signalled(&mut shutdown) => {
                channel.close().await;
                return Ok(());
            }
            _ = signalled(&mut closed) => {
                return Err(QueueError::ActorFault(format!("{}: broker connection lost", actor)));
            }
            command = mailbox.rx.recv() => match command {
                Some(ChannelCommand::Publish { payload, lease }) => {
                    match channel.publish(&config.exchange, &config.routing_key, &payload).await {
                        Ok(()) => {
                            queue_metrics::record_published(&config.name);
                            debug!(
                                publisher = %config.name,
                                worker_id = lease.id,
                                bytes = payload.len(),
                                "Published message"
                            );
                        }
                        Err(e) => {
                            queue_metrics::record_publish_failed(&config.name);
                            error!(
                                publisher = %config.name,
                                worker_id = lease.id,
                                exchange = %config.exchange,
                                routing_key = %config.routing_key,
                                error = %e,
                                "Broker publish failed"
                            );
                        }
                    }
                    drop(lease);
                }
                None => {
                    channel.close().await;
                    return Ok(());
                }
            }
        }
    }
}
