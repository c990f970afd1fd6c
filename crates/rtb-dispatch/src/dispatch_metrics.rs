//! Prometheus counters for the dispatch path

use metrics::counter;

/// Record a `<topic>.total` style counter from the stats sink
pub fn record_event_counter(counter_name: &str, amount: u64) {
    counter!(
        "rtb_events_total",
        "counter" => counter_name.to_string()
    )
    .increment(amount);
}

/// Record a checkout that ran out of attempts
pub fn record_pool_exhausted(pool: &str) {
    counter!(
        "rtb_pool_exhausted_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}

/// Record a missing or malformed creative
pub fn record_data_integrity_fault(kind: &str) {
    counter!(
        "rtb_data_integrity_faults_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a dispatched event by topic and outcome
pub fn record_dispatched(topic: &str, outcome: &str) {
    counter!(
        "rtb_dispatched_total",
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
