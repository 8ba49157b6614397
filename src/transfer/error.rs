use thiserror::Error;

/// Why a single object failed to land.
///
/// These never abort a batch: the scheduler records them against the key and
/// moves on.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Request for {key} failed (status={status:?}): {message}")]
    Request {
        key: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Stream for {key} broke after {bytes_so_far} bytes: {source}")]
    Stream {
        key: String,
        bytes_so_far: u64,
        source: std::io::Error,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Size mismatch for {key}: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Transfer task for {key} panicked")]
    Panicked { key: String },
}

impl TransferError {
    /// Whether the object arrived but failed verification.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, TransferError::SizeMismatch { .. })
    }
}
