//! Messaging client for the event bus
//!
//! A thin, broker-agnostic layer over a connection-oriented publish/subscribe
//! broker with exchange/topic routing:
//! - Named publishers backed by pools of channel-worker actors
//! - Subscribers as long-lived supervised actors feeding a delivery handler
//! - Cached queue identities so re-initialization reuses the same queue

use std::future::Future;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

pub mod channel_worker;
pub mod client;
pub mod error;
pub mod identity;
pub mod memory;
pub mod queue_metrics;
pub mod subscriber;
pub mod supervisor;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use channel_worker::ChannelWorker;
pub use client::{MessagingClient, MessagingConfig};
pub use error::QueueError;
pub use identity::QueueIdentityCache;
pub use memory::{InMemoryBroker, PublishedMessage};
pub use supervisor::{RestartPolicy, Supervisor};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Inbound payloads of a consumed queue. Ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Vec<u8>>>;

/// A broker that hands out independent channels.
#[async_trait]
pub trait Broker: Send + Sync {
    fn identifier(&self) -> &str;

    /// Open a fresh connection + channel pair.
    async fn open_channel(&self, connection_name: &str) -> Result<Box<dyn BrokerChannel>>;
}

/// One open broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Publish to an exchange with the given routing key.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Declare a non-exclusive queue; declaring an existing queue is a no-op.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, topic: &str) -> Result<()>;

    /// Start consuming with auto-acknowledge.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    /// Flips to `true` when the underlying connection is lost.
    fn close_signal(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}

/// Callback invoked for each inbound delivery of a subscriber.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>);
}

/// Adapts an async closure into a [`DeliveryHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> DeliveryHandler for HandlerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, payload: Vec<u8>) {
        (self.0)(payload).await
    }
}

/// Resolves once the watched flag is `true` or its sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
