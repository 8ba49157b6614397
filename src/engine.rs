//! Wires listing, diffing and transfer together for one source.

use std::sync::Arc;

use futures_util::TryStreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::diff::{DiffEngine, PendingObject, ScanResult};
use crate::ledger::{CycleStats, Entry, EntryStatus, Ledger, LedgerError, LedgerSummary};
use crate::mapper::{PathDecision, PathMapper, Rejection};
use crate::remote::{ListingError, RemoteLister, RemoteObject, RemoteStore};
use crate::snapshot::{LocalSnapshot, SnapshotError};
use crate::transfer::{BatchReport, SchedulerConfig, TransferScheduler};
use crate::types::Tracking;

/// Anything that aborts a cycle or an engine operation.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Listing(#[from] ListingError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Key {key} cannot be mirrored: {reason}")]
    Rejected { key: String, reason: Rejection },

    #[error("This operation needs the status ledger, but tracking is set to snapshot")]
    LedgerDisabled,
}

/// What one scan + transfer pass did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub listed: u64,
    pub skipped: u64,
    pub new_entries: u64,
    pub requeued: u64,
    pub pending: u64,
    pub batch: BatchReport,
}

/// Completed entries whose file is gone or has the wrong size.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checked: u64,
    pub missing: Vec<Entry>,
    /// Entries with the size found on disk.
    pub mismatched: Vec<(Entry, u64)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

pub struct SyncEngine {
    settings: Settings,
    store: Arc<dyn RemoteStore>,
    ledger: Option<Arc<dyn Ledger>>,
    mapper: PathMapper,
    lister: RemoteLister,
}

impl SyncEngine {
    /// `ledger` must be present when tracking is `ledger`; it is ignored for
    /// scans in snapshot mode but still serves the ledger commands.
    pub fn new(
        settings: Settings,
        store: Arc<dyn RemoteStore>,
        ledger: Option<Arc<dyn Ledger>>,
    ) -> Self {
        let mapper = PathMapper::new(&settings.included_paths, &settings.destination_root);
        let lister = RemoteLister::new(
            store.clone(),
            &settings.included_paths,
            settings.list_retry.clone(),
        );
        Self {
            settings,
            store,
            ledger,
            mapper,
            lister,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn ledger(&self) -> Result<&Arc<dyn Ledger>, CycleError> {
        self.ledger.as_ref().ok_or(CycleError::LedgerDisabled)
    }

    /// The ledger used for diffing, if tracking uses one.
    fn tracking_ledger(&self) -> Option<Arc<dyn Ledger>> {
        match self.settings.tracking {
            Tracking::Ledger => self.ledger.clone(),
            Tracking::Snapshot => None,
        }
    }

    fn scheduler(&self) -> TransferScheduler {
        TransferScheduler::new(
            self.store.clone(),
            self.tracking_ledger(),
            SchedulerConfig {
                max_downloads: self.settings.max_downloads,
                debug_mode: self.settings.debug_mode,
                temp_suffix: self.settings.temp_suffix.clone(),
                no_progress_bar: self.settings.no_progress_bar,
            },
        )
    }

    /// List the bucket and work out the pending set.
    ///
    /// In ledger mode this records newly seen keys; nothing is transferred.
    pub async fn scan_once(&self) -> Result<ScanResult, CycleError> {
        let ledger = self.tracking_ledger();
        let needs_snapshot = ledger.is_none() || self.settings.reconcile_local;
        let snapshot = if needs_snapshot {
            Some(self.local_snapshot().await?)
        } else {
            None
        };

        let mut diff = match ledger {
            Some(ledger) => DiffEngine::with_ledger(
                self.mapper.clone(),
                ledger,
                self.settings.failed_policy,
                snapshot,
            ),
            None => DiffEngine::with_snapshot(self.mapper.clone(), snapshot.unwrap_or_default()),
        };

        let mut pages = self.lister.pages_for_included();
        while let Some(page) = pages.try_next().await? {
            diff.absorb_page(page).await?;
        }
        let result = diff.finish();

        tracing::info!(
            listed = result.listed,
            skipped = result.skipped,
            new_entries = result.new_entries,
            requeued = result.requeued,
            pending = result.pending_count(),
            pending_bytes = result.total_bytes(),
            "Scan complete"
        );
        Ok(result)
    }

    /// One scan followed by a transfer batch, recorded as a cycle.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport, CycleError> {
        let ledger = self.tracking_ledger();
        let cycle_id = match &ledger {
            Some(ledger) => Some(ledger.start_cycle().await?),
            None => None,
        };

        let result = self.scan_and_transfer(shutdown).await;

        if let (Some(ledger), Some(cycle_id)) = (&ledger, cycle_id) {
            let stats = match &result {
                Ok(report) => CycleStats {
                    objects_listed: report.listed,
                    objects_pending: report.pending,
                    objects_completed: report.batch.completed + report.batch.already_present,
                    objects_failed: report.batch.failed.len() as u64,
                    interrupted: report.batch.interrupted(),
                },
                Err(_) => CycleStats {
                    interrupted: true,
                    ..Default::default()
                },
            };
            if let Err(e) = ledger.complete_cycle(cycle_id, &stats).await {
                tracing::warn!("Failed to record cycle statistics: {}", e);
            }
        }

        result
    }

    async fn scan_and_transfer(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let scan = self.scan_once().await?;
        let mut report = CycleReport {
            listed: scan.listed,
            skipped: scan.skipped,
            new_entries: scan.new_entries,
            requeued: scan.requeued,
            pending: scan.pending_count() as u64,
            batch: BatchReport::default(),
        };
        if scan.pending.is_empty() {
            return Ok(report);
        }
        report.batch = self.scheduler().run(scan.pending, shutdown).await?;
        Ok(report)
    }

    /// Mirror a single key regardless of its ledger status.
    pub async fn sync_key(
        &self,
        key: &str,
        shutdown: &CancellationToken,
    ) -> Result<BatchReport, CycleError> {
        let object = self.lister.load(key).await?;
        let local_path = match self.mapper.map(&object.key) {
            PathDecision::Accepted(path) => path,
            PathDecision::Rejected(reason) => {
                return Err(CycleError::Rejected {
                    key: object.key,
                    reason,
                })
            }
        };

        if let Some(ledger) = self.tracking_ledger() {
            ledger
                .put_new(&[Entry::observed(
                    object.key.clone(),
                    Some(local_path.clone()),
                    object.last_modified,
                    object.size_bytes,
                )])
                .await?;
        }

        let pending = PendingObject {
            key: object.key,
            local_path,
            last_modified: object.last_modified,
            size_bytes: object.size_bytes,
        };
        Ok(self.scheduler().run(vec![pending], shutdown).await?)
    }

    pub async fn summarize(&self) -> Result<LedgerSummary, CycleError> {
        Ok(self.ledger()?.summary().await?)
    }

    pub async fn list_entries(&self, statuses: &[EntryStatus]) -> Result<Vec<Entry>, CycleError> {
        Ok(self.ledger()?.list(statuses).await?)
    }

    pub async fn reset_ledger(&self) -> Result<u64, CycleError> {
        let removed = self.ledger()?.reset().await?;
        tracing::info!(removed, "Ledger cleared");
        Ok(removed)
    }

    pub async fn reset_failed(&self) -> Result<u64, CycleError> {
        let reset = self.ledger()?.reset_failed().await?;
        tracing::info!(reset, "Failed entries moved back to pending");
        Ok(reset)
    }

    /// Check that every completed entry still exists with its recorded size.
    pub async fn verify(&self) -> Result<VerifyReport, CycleError> {
        let completed = self.ledger()?.list(&[EntryStatus::Completed]).await?;
        let mut report = VerifyReport::default();

        for entry in completed {
            report.checked += 1;
            let Some(path) = &entry.local_path else {
                report.missing.push(entry);
                continue;
            };
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() && meta.len() == entry.size_bytes => {}
                Ok(meta) if meta.is_file() => {
                    let actual = meta.len();
                    report.mismatched.push((entry, actual));
                }
                _ => report.missing.push(entry),
            }
        }
        Ok(report)
    }

    pub async fn local_snapshot(&self) -> Result<LocalSnapshot, CycleError> {
        Ok(LocalSnapshot::scan(&self.settings.destination_root, &self.settings.included_paths).await?)
    }

    /// Every object under the included prefixes, in listing order.
    pub async fn remote_snapshot(&self) -> Result<Vec<RemoteObject>, CycleError> {
        let pages: Vec<Vec<RemoteObject>> = self.lister.pages_for_included().try_collect().await?;
        Ok(pages.into_iter().flatten().collect())
    }
}
