//! Structured logging setup
//!
//! - JSON output for production (`LOG_FORMAT=json`)
//! - Human-readable output otherwise
//! - Level filtering through `RUST_LOG` (default: info), e.g.
//!   `RUST_LOG=rtb_dispatch=debug,rtb_queue=info`
//!
//! Event-level context travels as structured fields on the tracing macros:
//!
//! ```rust,ignore
//! tracing::info!(topic = "wins", bid_id = %id, "Event received");
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging for the given service.
///
/// Reads `LOG_FORMAT` to pick JSON or text output and `RUST_LOG` for the
/// filter. Calling this twice in one process is harmless: the second
/// installation attempt is ignored.
pub fn init_logging(service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(env_filter)
    } else {
        init_text_logging(env_filter)
    };

    if installed {
        tracing::debug!(service = service_name, format = %log_format, "Logging initialized");
    }
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .try_init()
        .is_ok()
}

/// Initialize logging with the default service name.
pub fn init_default_logging() {
    init_logging("rtb-server");
}
