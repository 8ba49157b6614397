//! Ledger trait and SQLite implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};

use super::error::LedgerError;
use super::schema;
use super::types::{CycleStats, Entry, EntryStatus, LedgerSummary};
use crate::remote::RemoteObject;

/// Keys per `IN (...)` lookup, well under SQLite's bound-parameter limit.
const LOOKUP_CHUNK: usize = 500;

const ENTRY_COLUMNS: &str = "key, local_path, last_error, size_bytes, last_modified, first_seen_at, updated_at, attempts, status";

/// Durable key → status mapping for one source.
///
/// Object-safe so the engine can hold it as `Arc<dyn Ledger>` and share it
/// across transfer tasks. Implementations must serialise writes so that
/// concurrent updates for different keys never corrupt each other.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Look up a single key.
    async fn get(&self, key: &str) -> Result<Option<Entry>, LedgerError>;

    /// Look up many keys at once. Keys with no entry are absent from the map.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Entry>, LedgerError>;

    /// Insert entries whose key is not yet recorded.
    ///
    /// Existing keys are left untouched, so inserting the same key twice is a
    /// no-op. Returns the number of rows actually inserted.
    async fn put_new(&self, entries: &[Entry]) -> Result<u64, LedgerError>;

    /// Refresh listing metadata for keys that are still outstanding.
    ///
    /// Terminal entries keep the metadata they had when they settled.
    async fn refresh_observed(&self, objects: &[RemoteObject]) -> Result<u64, LedgerError>;

    /// Mark outstanding entries `Skipped` and forget their local path. Used
    /// when a key no longer maps to a destination.
    async fn mark_skipped(&self, keys: &[String]) -> Result<u64, LedgerError>;

    /// Set the status of one key. `Failed` records `error` and bumps the
    /// attempt counter; any other status clears the last error.
    async fn update_status(
        &self,
        key: &str,
        status: EntryStatus,
        error: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Entries with one of `statuses` (all entries when empty), ordered by
    /// status then last-modified.
    async fn list(&self, statuses: &[EntryStatus]) -> Result<Vec<Entry>, LedgerError>;

    /// Counts per status plus the last cycle timestamps.
    async fn summary(&self) -> Result<LedgerSummary, LedgerError>;

    /// Delete every entry of this source. Returns the number removed.
    async fn reset(&self) -> Result<u64, LedgerError>;

    /// Move all failed entries back to pending. Returns the number reset.
    async fn reset_failed(&self) -> Result<u64, LedgerError>;

    /// Start a new cycle and return its ID.
    async fn start_cycle(&self) -> Result<i64, LedgerError>;

    /// Complete a cycle with statistics.
    async fn complete_cycle(&self, cycle_id: i64, stats: &CycleStats) -> Result<(), LedgerError>;
}

/// SQLite implementation of the ledger.
pub struct SqliteLedger {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
    source_id: i64,
    source_name: String,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .field("source", &self.source_name)
            .finish_non_exhaustive()
    }
}

/// Open a connection with the pragmas every ledger handle uses, and migrate.
fn connect(path: &Path) -> Result<Connection, LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path).map_err(|e| LedgerError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;

    // WAL keeps readers (status, list) from blocking a running monitor.
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(LedgerError::Migration)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(LedgerError::Migration)?;

    schema::migrate(&conn)?;
    Ok(conn)
}

fn lookup_source(conn: &Connection, name: &str) -> Result<Option<i64>, LedgerError> {
    conn.query_row("SELECT id FROM sources WHERE name = ?1", [name], |row| {
        row.get(0)
    })
    .optional()
    .map_err(LedgerError::query)
}

fn register_source(conn: &Connection, name: &str) -> Result<bool, LedgerError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO sources (name, created_at) VALUES (?1, ?2)",
            rusqlite::params![name, Utc::now().timestamp()],
        )
        .map_err(LedgerError::query)?;
    Ok(inserted > 0)
}

/// Run `body` inside a transaction, rolling back if it fails.
fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(LedgerError::query)?;

    match body(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(LedgerError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

impl SqliteLedger {
    /// Register `bucket` as a source in the ledger at `path`, creating the
    /// database if needed. Returns false when it was already registered.
    pub async fn configure(path: &Path, bucket: &str) -> Result<bool, LedgerError> {
        let path = path.to_path_buf();
        let bucket = bucket.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&path)?;
            register_source(&conn, &bucket)
        })
        .await?
    }

    /// Open the ledger at `path` for a previously configured `bucket`.
    pub async fn open(path: &Path, bucket: &str) -> Result<Self, LedgerError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();
        let bucket_clone = bucket.to_string();

        let (conn, source_id) = tokio::task::spawn_blocking(move || {
            let conn = connect(&path_clone)?;
            let source_id = lookup_source(&conn, &bucket_clone)?
                .ok_or_else(|| LedgerError::SourceNotConfigured(bucket_clone.clone()))?;
            Ok::<_, LedgerError>((conn, source_id))
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            source_id,
            source_name: bucket.to_string(),
        })
    }

    /// Open an in-memory ledger with `bucket` already registered (for testing).
    #[cfg(test)]
    pub fn open_in_memory(bucket: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        register_source(&conn, bucket)?;
        let source_id = lookup_source(&conn, bucket)?
            .ok_or_else(|| LedgerError::SourceNotConfigured(bucket.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            source_id,
            source_name: bucket.to_string(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Query(e.to_string()))
    }

    fn select_entries(
        &self,
        conn: &Connection,
        filter: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Entry>, LedgerError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE source_id = ?1{filter} ORDER BY status, last_modified, key"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(LedgerError::query)?;
        let mut all_params = Vec::with_capacity(params.len() + 1);
        all_params.push(Value::Integer(self.source_id));
        all_params.extend(params);

        let entries = stmt
            .query_map(rusqlite::params_from_iter(all_params), row_to_entry)
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;
        Ok(entries)
    }
}

/// Build a `, ?2, ?3 ...` style placeholder list starting at `first`.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get(&self, key: &str) -> Result<Option<Entry>, LedgerError> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE source_id = ?1 AND key = ?2"),
                rusqlite::params![self.source_id, key],
                row_to_entry,
            )
            .optional()
            .map_err(LedgerError::query)?;
        Ok(entry)
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Entry>, LedgerError> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(found);
        }

        let conn = self.lock()?;
        for chunk in keys.chunks(LOOKUP_CHUNK) {
            let filter = format!(" AND key IN ({})", placeholders(2, chunk.len()));
            let params = chunk.iter().map(|k| Value::Text(k.clone())).collect();
            for entry in self.select_entries(&conn, &filter, params)? {
                found.insert(entry.key.clone(), entry);
            }
        }
        Ok(found)
    }

    async fn put_new(&self, entries: &[Entry]) -> Result<u64, LedgerError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached(
                    r#"
                    INSERT OR IGNORE INTO entries
                        (source_id, key, local_path, last_modified, size_bytes, status, first_seen_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .map_err(LedgerError::query)?;

            let mut inserted = 0u64;
            for entry in entries {
                inserted += stmt
                    .execute(rusqlite::params![
                        self.source_id,
                        entry.key,
                        entry
                            .local_path
                            .as_ref()
                            .map(|p| p.to_string_lossy().into_owned()),
                        entry.last_modified.timestamp_millis(),
                        entry.size_bytes as i64,
                        entry.status.code(),
                        entry.first_seen_at.timestamp(),
                        entry.updated_at.timestamp(),
                    ])
                    .map_err(LedgerError::query)? as u64;
            }
            Ok(inserted)
        })
    }

    async fn refresh_observed(&self, objects: &[RemoteObject]) -> Result<u64, LedgerError> {
        if objects.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let updated_at = Utc::now().timestamp();
        in_transaction(&conn, |conn| {
            // Only rewrite rows whose metadata moved, so a quiet bucket leaves
            // the ledger byte-for-byte unchanged between cycles.
            let mut stmt = conn
                .prepare_cached(
                    r#"
                    UPDATE entries SET last_modified = ?1, size_bytes = ?2, updated_at = ?3
                    WHERE source_id = ?4 AND key = ?5 AND status IN (?6, ?7)
                      AND (last_modified != ?1 OR size_bytes != ?2)
                    "#,
                )
                .map_err(LedgerError::query)?;

            let mut updated = 0u64;
            for object in objects {
                updated += stmt
                    .execute(rusqlite::params![
                        object.last_modified.timestamp_millis(),
                        object.size_bytes as i64,
                        updated_at,
                        self.source_id,
                        object.key,
                        EntryStatus::Pending.code(),
                        EntryStatus::Processing.code(),
                    ])
                    .map_err(LedgerError::query)? as u64;
            }
            Ok(updated)
        })
    }

    async fn mark_skipped(&self, keys: &[String]) -> Result<u64, LedgerError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let updated_at = Utc::now().timestamp();
        in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached(
                    r#"
                    UPDATE entries SET status = ?1, local_path = NULL, last_error = NULL, updated_at = ?2
                    WHERE source_id = ?3 AND key = ?4 AND status IN (?5, ?6)
                    "#,
                )
                .map_err(LedgerError::query)?;

            let mut updated = 0u64;
            for key in keys {
                updated += stmt
                    .execute(rusqlite::params![
                        EntryStatus::Skipped.code(),
                        updated_at,
                        self.source_id,
                        key,
                        EntryStatus::Pending.code(),
                        EntryStatus::Processing.code(),
                    ])
                    .map_err(LedgerError::query)? as u64;
            }
            Ok(updated)
        })
    }

    async fn update_status(
        &self,
        key: &str,
        status: EntryStatus,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let updated_at = Utc::now().timestamp();
        let conn = self.lock()?;

        let rows = if status == EntryStatus::Failed {
            conn.execute(
                "UPDATE entries SET status = ?1, attempts = attempts + 1, last_error = ?2, updated_at = ?3 WHERE source_id = ?4 AND key = ?5",
                rusqlite::params![status.code(), error, updated_at, self.source_id, key],
            )
        } else {
            conn.execute(
                "UPDATE entries SET status = ?1, last_error = NULL, updated_at = ?2 WHERE source_id = ?3 AND key = ?4",
                rusqlite::params![status.code(), updated_at, self.source_id, key],
            )
        }
        .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::MissingEntry(key.to_string()));
        }
        Ok(())
    }

    async fn list(&self, statuses: &[EntryStatus]) -> Result<Vec<Entry>, LedgerError> {
        let conn = self.lock()?;
        if statuses.is_empty() {
            return self.select_entries(&conn, "", Vec::new());
        }
        let filter = format!(" AND status IN ({})", placeholders(2, statuses.len()));
        let params = statuses.iter().map(|s| Value::Integer(s.code())).collect();
        self.select_entries(&conn, &filter, params)
    }

    async fn summary(&self) -> Result<LedgerSummary, LedgerError> {
        let conn = self.lock()?;
        let mut summary = LedgerSummary::default();

        let mut stmt = conn
            .prepare_cached(
                "SELECT status, COUNT(*) FROM entries WHERE source_id = ?1 GROUP BY status",
            )
            .map_err(LedgerError::query)?;
        let counts = stmt
            .query_map([self.source_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;

        for (code, count) in counts {
            let count = count as u64;
            summary.total += count;
            match EntryStatus::from_code(code) {
                Some(EntryStatus::Pending) => summary.pending += count,
                Some(EntryStatus::Processing) => summary.processing += count,
                Some(EntryStatus::Completed) => summary.completed += count,
                Some(EntryStatus::Skipped) => summary.skipped += count,
                Some(EntryStatus::Failed) => summary.failed += count,
                None => tracing::warn!(code, count, "Ledger rows with unknown status code"),
            }
        }

        let last_cycle: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM cycles WHERE source_id = ?1 ORDER BY id DESC LIMIT 1",
                [self.source_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(LedgerError::query)?;

        if let Some((started, completed)) = last_cycle {
            summary.last_cycle_started = started.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
            summary.last_cycle_completed =
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
        }

        Ok(summary)
    }

    async fn reset(&self) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let rows = conn
            .execute("DELETE FROM entries WHERE source_id = ?1", [self.source_id])
            .map_err(LedgerError::query)?;
        Ok(rows as u64)
    }

    async fn reset_failed(&self) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE entries SET status = ?1, attempts = 0, last_error = NULL, updated_at = ?2 WHERE source_id = ?3 AND status = ?4",
                rusqlite::params![
                    EntryStatus::Pending.code(),
                    Utc::now().timestamp(),
                    self.source_id,
                    EntryStatus::Failed.code(),
                ],
            )
            .map_err(LedgerError::query)?;
        Ok(rows as u64)
    }

    async fn start_cycle(&self) -> Result<i64, LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cycles (source_id, started_at) VALUES (?1, ?2)",
            rusqlite::params![self.source_id, Utc::now().timestamp()],
        )
        .map_err(LedgerError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_cycle(&self, cycle_id: i64, stats: &CycleStats) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE cycles SET completed_at = ?1, objects_listed = ?2, objects_pending = ?3, objects_completed = ?4, objects_failed = ?5, interrupted = ?6 WHERE id = ?7",
            rusqlite::params![
                Utc::now().timestamp(),
                stats.objects_listed as i64,
                stats.objects_pending as i64,
                stats.objects_completed as i64,
                stats.objects_failed as i64,
                stats.interrupted as i64,
                cycle_id,
            ],
        )
        .map_err(LedgerError::query)?;
        Ok(())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Convert a database row (selected with `ENTRY_COLUMNS`) to an Entry.
fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let local_path: Option<String> = row.get(1)?;
    let size_bytes: i64 = row.get(3)?;
    let last_modified_ms: i64 = row.get(4)?;
    let attempts: i64 = row.get(7)?;
    let status_code: i64 = row.get(8)?;

    Ok(Entry {
        key: row.get(0)?,
        local_path: local_path.map(PathBuf::from),
        last_error: row.get(2)?,
        size_bytes: size_bytes.max(0) as u64,
        last_modified: Utc
            .timestamp_millis_opt(last_modified_ms)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        first_seen_at: timestamp(row.get(5)?),
        updated_at: timestamp(row.get(6)?),
        attempts: attempts.max(0) as u32,
        status: EntryStatus::from_code(status_code).unwrap_or(EntryStatus::Pending),
    })
}
