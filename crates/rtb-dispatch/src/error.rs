use rtb_common::OptionError;
use rtb_pool::PoolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No worker available: {0}")]
    NoWorkerAvailable(#[from] PoolError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dispatch worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Invalid option: {0}")]
    InvalidOption(#[from] OptionError),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

/// Failure reported by a durable event store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        DispatchError::Store(e.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
