//! MessagingClient Tests
//!
//! Tests for:
//! - Publisher registration (idempotent per name)
//! - Fire-and-forget publish and bounded checkout retry
//! - Subscriber delivery and competing consumers
//! - Actor restart after a broker connection loss
//! - Restart budget exhaustion and worker replacement
//! - Queued publishes reported when their worker stops for good

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rtb_common::{PublisherConfig, SubscriberConfig};
use rtb_queue::{
    handler_fn, Broker, InMemoryBroker, MessagingClient, MessagingConfig, QueueError, RestartPolicy,
};

fn publisher(name: &str, pool_size: usize) -> PublisherConfig {
    PublisherConfig {
        name: name.to_string(),
        exchange: "rtb.events".to_string(),
        routing_key: name.to_string(),
        pool_size,
    }
}

fn subscriber(name: &str, topic: &str, pool_size: usize) -> SubscriberConfig {
    SubscriberConfig {
        name: name.to_string(),
        exchange: "rtb.events".to_string(),
        topic: topic.to_string(),
        pool_size,
    }
}

fn fast_config() -> MessagingConfig {
    MessagingConfig {
        restart: RestartPolicy {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

/// Log output captured for the current thread
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}

fn client(broker: &InMemoryBroker, config: MessagingConfig) -> MessagingClient {
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    MessagingClient::new(broker, config)
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn recording_handler() -> (Arc<Mutex<Vec<Vec<u8>>>>, Arc<dyn rtb_queue::DeliveryHandler>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = handler_fn(move |payload: Vec<u8>| {
        let sink = sink.clone();
        async move {
            sink.lock().push(payload);
        }
    });
    (received, Arc::new(handler))
}

#[tokio::test]
async fn test_start_publisher_is_idempotent_per_name() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());

    assert!(client.start_publisher(publisher("wins", 2)));
    assert!(!client.start_publisher(publisher("wins", 8)));
    assert!(client.start_publisher(publisher("clicks", 1)));

    assert_eq!(client.publisher_names(), vec!["clicks".to_string(), "wins".to_string()]);
    assert_eq!(client.publisher_pool("wins").unwrap().max_count(), 2);
    assert_eq!(client.publisher_pool("clicks").unwrap().max_count(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_publish_reaches_broker() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("wins", 2));

    client.publish("wins", br#"{"bidId":"b1"}"#.to_vec()).await;

    assert!(wait_until(|| broker.published().len() == 1).await);
    let message = &broker.published()[0];
    assert_eq!(message.exchange, "rtb.events");
    assert_eq!(message.routing_key, "wins");
    assert_eq!(message.payload, br#"{"bidId":"b1"}"#.to_vec());

    // Worker went back to its pool
    let pool = client.publisher_pool("wins").unwrap();
    assert!(wait_until(|| pool.stats().checked_out == 0).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_unknown_publisher_is_reported_and_dropped() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());

    let err = tokio_test::assert_err!(client.try_publish("missing", b"payload".to_vec()).await);
    assert!(matches!(err, QueueError::PublisherNotFound(ref name) if name == "missing"));

    // The fire-and-forget form only logs
    client.publish("missing", vec![b'x'; 1024]).await;
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_publish_dropped_after_bounded_retries() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("wins", 1));

    let pool = client.publisher_pool("wins").unwrap();
    let held = pool.checkout().unwrap();

    let started = Instant::now();
    let err = client.try_publish("wins", b"lost".to_vec()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, QueueError::PublishDropped { attempts: 3, .. }));
    // Two sleeps of 20ms between three attempts
    assert!(elapsed >= Duration::from_millis(40));

    drop(held);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.published().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn test_publish_succeeds_on_later_attempt() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("wins", 1));

    let pool = client.publisher_pool("wins").unwrap();
    let held = pool.checkout().unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        drop(held);
    });

    tokio_test::assert_ok!(client.try_publish("wins", b"late".to_vec()).await);

    assert!(wait_until(|| broker.published().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.published().len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_broker_publish_failure_still_returns_worker() {
    let broker = InMemoryBroker::default();
    broker.reject_publishes(true);
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("wins", 1));

    client.try_publish("wins", b"refused".to_vec()).await.unwrap();

    let pool = client.publisher_pool("wins").unwrap();
    assert!(wait_until(|| pool.stats().available == 1).await);
    assert!(broker.published().is_empty());

    broker.reject_publishes(false);
    client.try_publish("wins", b"accepted".to_vec()).await.unwrap();
    assert!(wait_until(|| broker.published().len() == 1).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_receives_routed_messages() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("wins", 1));
    client.start_publisher(publisher("clicks", 1));

    let (received, handler) = recording_handler();
    assert_eq!(client.start_subscriber(subscriber("win_listener", "wins", 1), handler), 1);
    assert!(wait_until(|| broker.binding_count() == 1).await);

    client.publish("wins", b"w1".to_vec()).await;
    client.publish("clicks", b"c1".to_vec()).await;
    client.publish("wins", b"w2".to_vec()).await;

    assert!(wait_until(|| received.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let received = received.lock().clone();
    assert_eq!(received.len(), 2);
    assert!(received.contains(&b"w1".to_vec()));
    assert!(received.contains(&b"w2".to_vec()));

    let queue = client.queue_identity("win_listener").unwrap();
    assert_eq!(broker.queue_names(), vec![queue]);

    client.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_instances_compete_for_one_queue() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("impressions", 2));

    let (received, handler) = recording_handler();
    client.start_subscriber(subscriber("imp_listener", "impressions", 2), handler.clone());
    client.start_subscriber(subscriber("imp_listener", "impressions", 1), handler);
    assert_eq!(client.subscriber_count("imp_listener"), 3);

    assert!(wait_until(|| broker.binding_count() == 1 && broker.connections_opened() >= 5).await);

    for i in 0..10u8 {
        client.publish("impressions", vec![i]).await;
    }

    assert!(wait_until(|| received.lock().len() == 10).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(received.lock().len(), 10);
    assert_eq!(broker.queue_names().len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_actors_restart_after_connection_loss() {
    let broker = InMemoryBroker::default();
    let client = client(&broker, fast_config());
    client.start_publisher(publisher("wins", 1));

    let (received, handler) = recording_handler();
    client.start_subscriber(subscriber("win_listener", "wins", 1), handler);
    assert!(wait_until(|| broker.binding_count() == 1 && broker.connections_opened() == 2).await);

    broker.sever_connections();

    // Both actors come back on fresh connections
    assert!(wait_until(|| broker.connections_opened() >= 4).await);

    client.publish("wins", b"after-restart".to_vec()).await;
    assert!(wait_until(|| received.lock().len() == 1).await);
    assert_eq!(received.lock()[0], b"after-restart".to_vec());

    client.shutdown().await;
}

#[tokio::test]
async fn test_worker_replaced_when_restart_budget_spent() {
    let broker = InMemoryBroker::default();
    broker.refuse_connections(true);

    let config = MessagingConfig {
        restart: RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(1),
        },
        ..Default::default()
    };
    let client = client(&broker, config);
    client.start_publisher(publisher("wins", 1));

    let pool = client.publisher_pool("wins").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The first actor is down for good; checkout builds a replacement
    broker.refuse_connections(false);
    let lease = pool.try_checkout().unwrap();
    assert_ne!(lease.id(), 0);
    drop(lease);

    client.try_publish("wins", b"recovered".to_vec()).await.unwrap();
    assert!(wait_until(|| broker.published().len() == 1).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_publish_dropped_and_logged_when_worker_stops() {
    // Current-thread runtime: actor tasks log through this thread's subscriber
    let (logs, _guard) = capture_logs();

    let broker = InMemoryBroker::default();
    broker.refuse_connections(true);

    let config = MessagingConfig {
        restart: RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(20),
        },
        ..Default::default()
    };
    let client = client(&broker, config);
    client.start_publisher(publisher("wins", 1));

    // Accepted into the mailbox while the actor cannot connect
    tokio_test::assert_ok!(client.try_publish("wins", br#"{"bidId":"stranded"}"#.to_vec()).await);

    let pool = client.publisher_pool("wins").unwrap();
    assert!(wait_until(|| pool.stats().created == 0).await);
    assert!(broker.published().is_empty());

    let text = logs.text();
    assert!(text.contains("Publish dropped, channel worker stopped"), "logs: {}", text);
    assert!(text.contains("stranded"));
    assert!(text.contains("ERROR"));

    client.shutdown().await;
}
