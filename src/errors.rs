use thiserror::Error;

/// Errors raised by the queue engine itself.
///
/// Handler failures never show up here. They are recorded on the job row
/// (`last_error`, `failed`/`dead` status) instead.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("max_retries must be between 1 and {max}, got {value}.")]
    InvalidMaxRetries { value: i32, max: i32 },

    #[error("Duration {0:?} is out of range.")]
    InvalidDuration(std::time::Duration),

    #[error("Error connecting to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: diesel::ConnectionError,
    },

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the error was caused by the caller's input rather than the store.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            QueueError::UnknownJobType(_)
                | QueueError::InvalidMaxRetries { .. }
                | QueueError::InvalidDuration(_)
                | QueueError::Serialization(_)
        )
    }
}
