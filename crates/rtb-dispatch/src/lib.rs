//! Event dispatch core
//!
//! Records win, impression and click notifications to the stats sink, the
//! durable store and the message bus, and answers each with an ad-serving
//! decision looked up from the creative cache.

pub mod api;
pub mod creative;
pub mod decision;
pub mod dispatch_metrics;
pub mod dispatcher;
pub mod error;
pub mod sinks;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use api::{create_router, AppState};
pub use creative::{CreativeCache, CreativeError, InMemoryCreativeCache};
pub use dispatcher::{Collaborators, DispatcherConfig, EventDispatcher};
pub use error::{DispatchError, StoreError};
pub use sinks::{EventStore, InMemoryEventStore, MessageBus, MetricsStatsSink, StatsSink};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;

pub type Result<T> = std::result::Result<T, DispatchError>;
