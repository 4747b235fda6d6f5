use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Consumer failed to start for queue {queue}: {source}")]
    ConsumerStart {
        queue: String,
        #[source]
        source: fc_queue::QueueError,
    },

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Config fetch failed: {0}")]
    ConfigFetch(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
