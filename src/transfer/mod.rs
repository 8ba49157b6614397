//! Bounded-concurrency transfer of a pending set.
//!
//! A semaphore sized to `max_downloads` gates admission: each pending object,
//! oldest first, waits for an owned permit and is then spawned as its own
//! task holding that permit until it settles. Every task is joined before the
//! batch report is returned.

pub mod error;
pub mod file;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::diff::PendingObject;
use crate::ledger::{EntryStatus, Ledger, LedgerError};
use crate::progress::{ProgressAggregate, ProgressEvent, ProgressTracker};
use crate::remote::RemoteStore;

pub use error::TransferError;
pub use file::{TransferOptions, TransferOutcome};

/// A key that failed in this batch, with the reason recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub admitted: u64,
    pub completed: u64,
    pub already_present: u64,
    pub failed: Vec<FailedTransfer>,
    /// Objects never started because shutdown was requested.
    pub not_admitted: u64,
    pub bytes_transferred: u64,
    pub progress: ProgressAggregate,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn interrupted(&self) -> bool {
        self.not_admitted > 0
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_downloads: usize,
    pub debug_mode: bool,
    pub temp_suffix: String,
    pub no_progress_bar: bool,
}

pub struct TransferScheduler {
    store: Arc<dyn RemoteStore>,
    /// Absent for ledger-free runs.
    ledger: Option<Arc<dyn Ledger>>,
    config: SchedulerConfig,
}

impl TransferScheduler {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        ledger: Option<Arc<dyn Ledger>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Transfer every pending object and wait for all of them to settle.
    ///
    /// Per-object failures are recorded, not returned. A ledger write failure
    /// is returned once the whole batch has settled.
    pub async fn run(
        &self,
        pending: Vec<PendingObject>,
        shutdown: &CancellationToken,
    ) -> Result<BatchReport, LedgerError> {
        let started = Instant::now();
        let total_objects = pending.len() as u64;
        let total_bytes: u64 = pending.iter().map(|p| p.size_bytes).sum();
        let tracker = ProgressTracker::start(total_objects, total_bytes, self.config.no_progress_bar);
        let semaphore = Arc::new(Semaphore::new(self.config.max_downloads.max(1)));
        let options = Arc::new(TransferOptions {
            temp_suffix: self.config.temp_suffix.clone(),
            debug_mode: self.config.debug_mode,
        });
        // The ledger is never written in debug mode.
        let ledger = if self.config.debug_mode {
            None
        } else {
            self.ledger.clone()
        };

        let mut report = BatchReport::default();
        let mut handles = Vec::with_capacity(pending.len());
        let mut queue = pending.into_iter();

        while let Some(object) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.not_admitted = 1 + queue.len() as u64;
                tracker.suspend(|| {
                    tracing::info!(
                        remaining = report.not_admitted,
                        "Shutdown requested, not starting further transfers"
                    )
                });
                break;
            };

            let store = self.store.clone();
            let ledger = ledger.clone();
            let options = options.clone();
            let progress = tracker.sender();
            let key = object.key.clone();
            let size_bytes = object.size_bytes;

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome =
                    file::transfer_object(store.as_ref(), &object, &options, &progress).await;
                let recorded = match &ledger {
                    Some(ledger) => record_outcome(ledger.as_ref(), &object.key, &outcome).await,
                    None => Ok(()),
                };
                (outcome, recorded)
            });
            handles.push((key, size_bytes, handle));
            report.admitted += 1;
        }

        let mut ledger_error: Option<LedgerError> = None;
        for (key, size_bytes, handle) in handles {
            let (outcome, recorded) = match handle.await {
                Ok(settled) => settled,
                Err(join_err) => {
                    // The panicking task never reported its own failure.
                    tracker.sender().send(ProgressEvent::Failed {
                        key: key.clone(),
                        size_bytes,
                    });
                    tracker.suspend(|| {
                        tracing::error!(key = %key, "Transfer task panicked: {}", join_err)
                    });
                    let outcome = TransferOutcome::Failed(TransferError::Panicked { key: key.clone() });
                    let recorded = match &ledger {
                        Some(ledger) => record_outcome(ledger.as_ref(), &key, &outcome).await,
                        None => Ok(()),
                    };
                    (outcome, recorded)
                }
            };

            if let Err(e) = recorded {
                tracker.suspend(|| tracing::error!(key = %key, "Failed to record outcome: {}", e));
                ledger_error.get_or_insert(e);
            }

            match outcome {
                TransferOutcome::Completed { bytes } => {
                    report.completed += 1;
                    report.bytes_transferred += bytes;
                }
                TransferOutcome::AlreadyPresent => report.already_present += 1,
                TransferOutcome::Failed(e) => {
                    if e.is_integrity_failure() {
                        tracker.suspend(|| tracing::error!(key = %key, "Integrity check failed: {}", e));
                    } else {
                        tracker.suspend(|| tracing::warn!(key = %key, "Transfer failed: {}", e));
                    }
                    report.failed.push(FailedTransfer {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.progress = tracker.finish().await;
        report.elapsed = started.elapsed();

        tracing::info!(
            completed = report.completed,
            already_present = report.already_present,
            failed = report.failed.len(),
            not_admitted = report.not_admitted,
            elapsed = %format_duration(report.elapsed),
            "Transfer batch settled"
        );

        match ledger_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn record_outcome(
    ledger: &dyn Ledger,
    key: &str,
    outcome: &TransferOutcome,
) -> Result<(), LedgerError> {
    match outcome {
        TransferOutcome::Completed { .. } | TransferOutcome::AlreadyPresent => {
            ledger.update_status(key, EntryStatus::Completed, None).await
        }
        TransferOutcome::Failed(e) => {
            ledger
                .update_status(key, EntryStatus::Failed, Some(&e.to_string()))
                .await
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
