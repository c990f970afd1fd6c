//! Prometheus counters for the messaging client

use metrics::counter;

/// Record a payload the client gave up on
pub fn record_publish_dropped(publisher: &str, reason: &str) {
    counter!(
        "rtb_publish_dropped_total",
        "publisher" => publisher.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a broker-confirmed publish
pub fn record_published(publisher: &str) {
    counter!(
        "rtb_messages_published_total",
        "publisher" => publisher.to_string()
    )
    .increment(1);
}

/// Record a publish the broker refused or failed
pub fn record_publish_failed(publisher: &str) {
    counter!(
        "rtb_publish_failed_total",
        "publisher" => publisher.to_string()
    )
    .increment(1);
}

/// Record a supervised actor restart
pub fn record_actor_restart(actor: &str) {
    counter!(
        "rtb_actor_restarts_total",
        "actor" => actor.to_string()
    )
    .increment(1);
}

/// Record a delivery handed to a subscriber handler
pub fn record_delivery(subscriber: &str) {
    counter!(
        "rtb_deliveries_total",
        "subscriber" => subscriber.to_string()
    )
    .increment(1);
}
