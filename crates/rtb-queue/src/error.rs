use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Publisher not found: {0}")]
    PublisherNotFound(String),

    #[error("Publish dropped for {publisher} after {attempts} attempts")]
    PublishDropped { publisher: String, attempts: u32 },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Actor fault: {0}")]
    ActorFault(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Broker(e.to_string())
    }
}
