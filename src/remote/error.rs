use thiserror::Error;

/// Failures while enumerating the bucket.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("Listing prefix '{prefix}' failed (status={status:?}): {message}")]
    Request {
        prefix: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Malformed listing response for prefix '{prefix}': {reason}")]
    Malformed { prefix: String, reason: String },

    #[error("No object with key {0}")]
    NotFound(String),

    #[error("{count} objects match key {key}")]
    Ambiguous { key: String, count: usize },
}

impl ListingError {
    /// Whether a listing request is worth repeating.
    ///
    /// Connection-level failures (no status) and throttling or server errors
    /// are transient; access and addressing errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ListingError::Request { status: None, .. } => true,
            ListingError::Request {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            ListingError::Malformed { .. }
            | ListingError::NotFound(_)
            | ListingError::Ambiguous { .. } => false,
        }
    }
}
