//! Types for the status ledger.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Lifecycle status of a ledger entry.
///
/// Persisted as an integer code; the codes are stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntryStatus {
    /// Observed but not yet mirrored.
    Pending = 0,
    /// Legacy in-flight marker. Never written; read back as interrupted work.
    Processing = 1,
    /// Mirrored to its local path.
    Completed = 2,
    /// Key cannot be mapped to a local path. Terminal.
    Skipped = 3,
    /// Last download attempt failed.
    Failed = 4,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Skipped,
        Self::Failed,
    ];

    /// Convert to the code stored in the database.
    pub fn code(self) -> i64 {
        self as u8 as i64
    }

    /// Parse from the code stored in the database.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Processing),
            2 => Some(Self::Completed),
            3 => Some(Self::Skipped),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Skipped => "Skipped",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger record for one object key.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Object key in the bucket.
    pub key: String,
    /// Local destination; absent for skipped keys.
    pub local_path: Option<PathBuf>,
    /// Error message from the last failed attempt.
    pub last_error: Option<String>,
    /// Object size from the listing.
    pub size_bytes: u64,
    /// Last-modified timestamp from the listing.
    pub last_modified: DateTime<Utc>,
    /// When the key was first recorded.
    pub first_seen_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
    /// Number of failed attempts since the last reset.
    pub attempts: u32,
    pub status: EntryStatus,
}

impl Entry {
    /// Build the record for a key seen for the first time.
    ///
    /// The status follows from the mapped path: `Pending` when the key maps to
    /// a local file, `Skipped` otherwise.
    pub fn observed(
        key: String,
        local_path: Option<PathBuf>,
        last_modified: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        let status = if local_path.is_some() {
            EntryStatus::Pending
        } else {
            EntryStatus::Skipped
        };
        Self {
            key,
            local_path,
            last_error: None,
            size_bytes,
            last_modified,
            first_seen_at: now,
            updated_at: now,
            attempts: 0,
            status,
        }
    }
}

/// Statistics for a single cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub objects_listed: u64,
    pub objects_pending: u64,
    pub objects_completed: u64,
    pub objects_failed: u64,
    /// Whether the cycle was cut short by shutdown or an error.
    pub interrupted: bool,
}

/// Summary of the ledger for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_cycle_started: Option<DateTime<Utc>>,
    pub last_cycle_completed: Option<DateTime<Utc>>,
}

impl LedgerSummary {
    /// Count for a single status.
    pub fn count(&self, status: EntryStatus) -> u64 {
        match status {
            EntryStatus::Pending => self.pending,
            EntryStatus::Processing => self.processing,
            EntryStatus::Completed => self.completed,
            EntryStatus::Skipped => self.skipped,
            EntryStatus::Failed => self.failed,
        }
    }
}
