//! RTB Event Logging Server
//!
//! Receives win, impression and click notifications over HTTP, records them
//! to stats, the durable store and the message bus, and answers with the
//! ad-serving decision for the creative.
//!
//! ## Configuration
//!
//! Loaded from `rtb.toml` (or `RTB_CONFIG`), with `RTB_*` environment
//! overrides. Build with `--features amqp` for a RabbitMQ broker and
//! `--features sqlite` for a SQLite event store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rtb_config::{AppConfig, BrokerKind, ConfigLoader, StoreKind};
use rtb_dispatch::{
    create_router, AppState, Collaborators, DispatcherConfig, EventDispatcher, EventStore,
    InMemoryCreativeCache, InMemoryEventStore, MetricsStatsSink,
};
use rtb_queue::{handler_fn, Broker, InMemoryBroker, MessagingClient, MessagingConfig, RestartPolicy};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    rtb_common::logging::init_logging("rtb-server");

    info!("Starting RTB event logging server");

    // 1. Configuration
    let config = ConfigLoader::new().load()?;
    config.validate()?;

    // 2. Metrics recorder
    let prometheus = if config.metrics.enabled {
        Some(install_prometheus()?)
    } else {
        info!("Metrics disabled");
        None
    };

    // 3. Messaging
    let broker = create_broker(&config)?;
    let messaging = Arc::new(MessagingClient::new(broker, messaging_config(&config)));

    for publisher in &config.publishers {
        messaging.start_publisher(publisher.clone());
    }
    let max = config.messaging.log_payload_max;
    for subscriber in &config.subscribers {
        let name = subscriber.name.clone();
        let handler = handler_fn(move |payload: Vec<u8>| {
            let name = name.clone();
            async move {
                debug!(
                    subscriber = %name,
                    payload = %rtb_queue::client::truncate_payload(&payload, max),
                    "Delivery received"
                );
            }
        });
        messaging.start_subscriber(subscriber.clone(), Arc::new(handler));
    }

    // 4. Creatives and event store
    let creatives = InMemoryCreativeCache::new();
    if let Some(path) = &config.creatives.path {
        creatives
            .load_json_file(path)
            .with_context(|| format!("loading creatives from {}", path))?;
    } else {
        warn!("No creatives configured - impressions and clicks will answer with no content");
    }

    let store = create_store(&config).await?;

    // 5. Dispatcher
    let dispatcher = Arc::new(EventDispatcher::new(
        dispatcher_config(&config),
        Collaborators {
            stats: Arc::new(MetricsStatsSink),
            store,
            bus: messaging.clone(),
            creatives: Arc::new(creatives),
        },
    ));

    // 6. HTTP server
    let app = create_router(AppState {
        dispatcher: dispatcher.clone(),
        prometheus,
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    log_startup_summary(&config, &addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Shutdown
    info!("Shutdown signal received, stopping");
    dispatcher.shutdown();
    messaging.shutdown().await;

    info!("RTB event logging server stopped");
    Ok(())
}

fn install_prometheus() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;
    info!("Prometheus recorder installed");
    Ok(handle)
}

fn create_broker(config: &AppConfig) -> Result<Arc<dyn Broker>> {
    match config.broker.kind {
        BrokerKind::Memory => {
            info!("Using in-memory broker");
            Ok(Arc::new(InMemoryBroker::default()))
        }
        #[cfg(feature = "amqp")]
        BrokerKind::Amqp => {
            info!(uri = %config.broker.uri, "Using AMQP broker");
            Ok(Arc::new(rtb_queue::amqp::AmqpBroker::with_uri(&config.broker.uri)))
        }
        #[cfg(not(feature = "amqp"))]
        BrokerKind::Amqp => anyhow::bail!("broker.kind = \"amqp\" requires the amqp feature"),
    }
}

async fn create_store(config: &AppConfig) -> Result<Arc<dyn EventStore>> {
    match config.store.kind {
        StoreKind::Memory => {
            info!("Using in-memory event store");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
        #[cfg(feature = "sqlite")]
        StoreKind::Sqlite => {
            info!(url = %config.store.sqlite_url, "Using SQLite event store");
            let store = rtb_dispatch::SqliteEventStore::connect(&config.store.sqlite_url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreKind::Sqlite => anyhow::bail!("store.kind = \"sqlite\" requires the sqlite feature"),
    }
}

fn messaging_config(config: &AppConfig) -> MessagingConfig {
    let settings = &config.messaging;
    MessagingConfig {
        publish_attempts: settings.publish_attempts,
        publish_retry_delay: Duration::from_millis(settings.publish_retry_delay_ms),
        log_payload_max: settings.log_payload_max,
        restart: RestartPolicy {
            max_restarts: settings.max_restarts,
            window: Duration::from_secs(settings.restart_window_secs),
            backoff: Duration::from_millis(settings.restart_backoff_ms),
        },
    }
}

fn dispatcher_config(config: &AppConfig) -> DispatcherConfig {
    DispatcherConfig {
        pool_name: config.dispatch.pool_name.clone(),
        max_workers: config.dispatch.max_workers,
        init_workers: config.dispatch.init_workers,
        checkout_attempts: config.dispatch.checkout_attempts,
        stats_sample_rate: config.metrics.stats_sample_rate,
    }
}

fn log_startup_summary(config: &AppConfig, addr: &str) {
    info!("=== RTB Event Logging Startup Summary ===");
    info!("  Listening: {}", addr);
    info!("  Broker: {:?}", config.broker.kind);
    info!("  Store: {:?}", config.store.kind);
    info!(
        "  Dispatch pool: {} ({} initial, {} max)",
        config.dispatch.pool_name, config.dispatch.init_workers, config.dispatch.max_workers
    );
    info!("  Publishers: {}", config.publishers.len());
    info!("  Subscribers: {}", config.subscribers.len());
    info!("=========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
