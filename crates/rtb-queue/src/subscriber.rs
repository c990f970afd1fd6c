//! Subscriber actor
//!
//! Long-lived, not pooled: each instance opens its own channel, declares the
//! subscriber's queue, binds it and feeds deliveries to the handler one at a
//! time. Instances of the same subscriber share the queue and compete for its
//! messages.

use std::sync::Arc;

use futures::StreamExt;
use rtb_common::SubscriberConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{queue_metrics, signalled, Broker, DeliveryHandler, QueueError, Result, Supervisor};

/// Start one supervised subscriber instance consuming from `queue`.
pub fn spawn_subscriber(
    instance: usize,
    config: &SubscriberConfig,
    queue: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn DeliveryHandler>,
    supervisor: &Supervisor,
) -> JoinHandle<()> {
    let actor = format!("{}-{}", config.name, instance);
    let shutdown = supervisor.shutdown_signal();
    let settings = config.clone();
    let name = actor.clone();

    supervisor.spawn(actor, move || {
        run(
            name.clone(),
            settings.clone(),
            queue.clone(),
            broker.clone(),
            handler.clone(),
            shutdown.clone(),
        )
    })
}

async fn run(
    actor: String,
    config: SubscriberConfig,
    queue: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn DeliveryHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let channel = broker.open_channel(&actor).await?;
    channel.declare_queue(&queue).await?;
    channel.bind_queue(&queue, &config.exchange, &config.topic).await?;
    let mut deliveries = channel.consume(&queue, &actor).await?;
    let mut closed = channel.close_signal();

    info!(
        actor = %actor,
        queue = %queue,
        exchange = %config.exchange,
        topic = %config.topic,
        "Subscriber consuming"
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
            delivery = deliveries.next() => match delivery {
                Some(Ok(payload)) => {
                    debug!(actor = %actor, bytes = payload.len(), "Delivery received");
                    queue_metrics::record_delivery(&config.name);
                    handler.handle(payload).await;
                }
                Some(Err(e)) => {
                    return Err(QueueError::ActorFault(format!("{}: delivery failed: {}", actor, e)));
                }
                None => {
                    return Err(QueueError::ActorFault(format!("{}: delivery stream ended", actor)));
                }
            }
        }
    }
}
