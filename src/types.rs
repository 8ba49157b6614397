use serde::Deserialize;

use crate::ledger::EntryStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// What a scan diffs the listing against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tracking {
    /// The status ledger, optionally reconciled with the local tree.
    #[default]
    Ledger,
    /// The local tree only; nothing is persisted.
    Snapshot,
}

/// When failed entries are attempted again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailedPolicy {
    /// Only after `retry-failed` or `reset`.
    #[default]
    Manual,
    NextCycle,
}

/// Status names accepted by `list --status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusFilter {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
}

impl From<StatusFilter> for EntryStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => EntryStatus::Pending,
            StatusFilter::Processing => EntryStatus::Processing,
            StatusFilter::Completed => EntryStatus::Completed,
            StatusFilter::Skipped => EntryStatus::Skipped,
            StatusFilter::Failed => EntryStatus::Failed,
        }
    }
}
