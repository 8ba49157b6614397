//! Decides which listed objects need a transfer this cycle.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ledger::{Entry, EntryStatus, Ledger, LedgerError};
use crate::mapper::{PathDecision, PathMapper};
use crate::remote::RemoteObject;
use crate::snapshot::LocalSnapshot;
use crate::types::FailedPolicy;

/// An object scheduled for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObject {
    pub key: String,
    pub local_path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Outcome of a full scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Oldest first, key as tie-break.
    pub pending: Vec<PendingObject>,
    /// Distinct keys observed.
    pub listed: u64,
    pub skipped: u64,
    /// Entries created in the ledger by this scan.
    pub new_entries: u64,
    /// Completed entries queued again because their file is gone.
    pub requeued: u64,
    /// Failed entries left alone under the manual failed policy.
    pub held_failed: u64,
    /// Repeat observations of a key already seen this scan.
    pub duplicates: u64,
}

impl ScanResult {
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.pending.iter().map(|p| p.size_bytes).sum()
    }
}

/// Folds listing pages into a pending set.
///
/// With a ledger, new keys are recorded once per page and existing entries
/// decide by status. Without one, the local snapshot alone decides.
pub struct DiffEngine {
    mapper: PathMapper,
    ledger: Option<Arc<dyn Ledger>>,
    snapshot: Option<LocalSnapshot>,
    failed_policy: FailedPolicy,
    seen: HashSet<String>,
    result: ScanResult,
}

impl DiffEngine {
    /// Ledger-backed diff. `reconcile` enables re-queuing completed entries
    /// whose local file is missing.
    pub fn with_ledger(
        mapper: PathMapper,
        ledger: Arc<dyn Ledger>,
        failed_policy: FailedPolicy,
        reconcile: Option<LocalSnapshot>,
    ) -> Self {
        Self {
            mapper,
            ledger: Some(ledger),
            snapshot: reconcile,
            failed_policy,
            seen: HashSet::new(),
            result: ScanResult::default(),
        }
    }

    /// Ledger-free diff against the local tree only.
    pub fn with_snapshot(mapper: PathMapper, snapshot: LocalSnapshot) -> Self {
        Self {
            mapper,
            ledger: None,
            snapshot: Some(snapshot),
            failed_policy: FailedPolicy::Manual,
            seen: HashSet::new(),
            result: ScanResult::default(),
        }
    }

    pub async fn absorb_page(&mut self, page: Vec<RemoteObject>) -> Result<(), LedgerError> {
        let total = page.len() as u64;
        let fresh: Vec<RemoteObject> = page
            .into_iter()
            .filter(|o| self.seen.insert(o.key.clone()))
            .collect();
        self.result.duplicates += total - fresh.len() as u64;
        self.result.listed += fresh.len() as u64;

        match self.ledger.clone() {
            Some(ledger) => self.absorb_with_ledger(ledger.as_ref(), fresh).await,
            None => {
                self.absorb_with_snapshot(fresh);
                Ok(())
            }
        }
    }

    async fn absorb_with_ledger(
        &mut self,
        ledger: &dyn Ledger,
        objects: Vec<RemoteObject>,
    ) -> Result<(), LedgerError> {
        if objects.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = objects.iter().map(|o| o.key.clone()).collect();
        let known = ledger.get_many(&keys).await?;

        let mut staged = Vec::new();
        let mut refresh = Vec::new();
        let mut newly_skipped = Vec::new();

        for object in objects {
            let Some(entry) = known.get(&object.key) else {
                let decision = self.mapper.map(&object.key);
                if let PathDecision::Rejected(reason) = &decision {
                    tracing::debug!(key = %object.key, %reason, "Skipping key");
                    self.result.skipped += 1;
                }
                let local_path = decision.local_path();
                if let Some(path) = &local_path {
                    self.push_pending(&object, path.clone());
                }
                staged.push(Entry::observed(
                    object.key,
                    local_path,
                    object.last_modified,
                    object.size_bytes,
                ));
                continue;
            };

            match entry.status {
                EntryStatus::Skipped => self.result.skipped += 1,
                EntryStatus::Completed => {
                    let missing = match (&self.snapshot, &entry.local_path) {
                        (Some(snapshot), Some(path)) => !snapshot.contains(path),
                        _ => false,
                    };
                    if let (true, Some(path)) = (missing, &entry.local_path) {
                        tracing::info!(key = %object.key, "Completed object missing locally, queuing again");
                        self.result.requeued += 1;
                        self.push_pending(&object, path.clone());
                    }
                }
                // Mapped again so a change to the included paths takes effect.
                EntryStatus::Pending | EntryStatus::Processing => {
                    match self.mapper.map(&object.key) {
                        PathDecision::Accepted(path) => {
                            self.push_pending(&object, path);
                            refresh.push(object);
                        }
                        PathDecision::Rejected(reason) => {
                            tracing::info!(key = %object.key, %reason, "Outstanding key no longer mirrored, skipping");
                            self.result.skipped += 1;
                            newly_skipped.push(object.key);
                        }
                    }
                }
                EntryStatus::Failed => match (self.failed_policy, &entry.local_path) {
                    (FailedPolicy::NextCycle, Some(path)) => {
                        self.push_pending(&object, path.clone());
                    }
                    _ => self.result.held_failed += 1,
                },
            }
        }

        if !staged.is_empty() {
            self.result.new_entries += ledger.put_new(&staged).await?;
        }
        if !refresh.is_empty() {
            ledger.refresh_observed(&refresh).await?;
        }
        if !newly_skipped.is_empty() {
            ledger.mark_skipped(&newly_skipped).await?;
        }
        Ok(())
    }

    fn absorb_with_snapshot(&mut self, objects: Vec<RemoteObject>) {
        for object in objects {
            match self.mapper.map(&object.key) {
                PathDecision::Rejected(reason) => {
                    tracing::debug!(key = %object.key, %reason, "Skipping key");
                    self.result.skipped += 1;
                }
                PathDecision::Accepted(path) => {
                    let present = self
                        .snapshot
                        .as_ref()
                        .is_some_and(|snapshot| snapshot.contains(&path));
                    if !present {
                        self.push_pending(&object, path);
                    }
                }
            }
        }
    }

    fn push_pending(&mut self, object: &RemoteObject, local_path: PathBuf) {
        self.result.pending.push(PendingObject {
            key: object.key.clone(),
            local_path,
            last_modified: object.last_modified,
            size_bytes: object.size_bytes,
        });
    }

    pub fn finish(mut self) -> ScanResult {
        self.result.pending.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        });
        self.result
    }
}
