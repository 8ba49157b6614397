use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rand::Rng as _;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::TransferError;
use crate::diff::PendingObject;
use crate::progress::{ProgressEvent, ProgressSender};
use crate::remote::{ObjectBody, RemoteStore};

/// How one object's transfer ended.
#[derive(Debug)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    /// A file of the expected size was already at the destination.
    AlreadyPresent,
    Failed(TransferError),
}

/// Per-transfer settings shared by every task in a batch.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub temp_suffix: String,
    /// Count the bytes but write nothing.
    pub debug_mode: bool,
}

/// Attempts at finding an unused temp name before giving up.
const TEMP_NAME_ATTEMPTS: usize = 8;

/// `.<name>.<token><suffix>` beside the destination, so the final rename stays
/// on one filesystem. The token is random on every call.
fn temp_path(destination: &Path, suffix: &str) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token: u32 = rand::thread_rng().gen();
    destination.with_file_name(format!(".{name}.{token:08x}{suffix}"))
}

/// Create a temp file that did not exist before.
///
/// Opened with `create_new`, so a name that happens to belong to another
/// object's mirrored file is never truncated; a fresh name is drawn instead.
async fn create_temp_file(destination: &Path, suffix: &str) -> std::io::Result<(PathBuf, File)> {
    let mut last_err = None;
    for _ in 0..TEMP_NAME_ATTEMPTS {
        let path = temp_path(destination, suffix);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AlreadyExists)))
}

/// Mirror one object into place.
///
/// Never returns an error: every failure is folded into
/// [`TransferOutcome::Failed`] after the temp file is cleaned up.
pub async fn transfer_object(
    store: &dyn RemoteStore,
    object: &PendingObject,
    options: &TransferOptions,
    progress: &ProgressSender,
) -> TransferOutcome {
    if let Ok(meta) = fs::metadata(&object.local_path).await {
        if meta.is_file() && meta.len() == object.size_bytes {
            tracing::debug!(key = %object.key, "Already present locally");
            progress.send(ProgressEvent::AlreadyPresent {
                key: object.key.clone(),
                size_bytes: object.size_bytes,
            });
            return TransferOutcome::AlreadyPresent;
        }
        tracing::debug!(
            key = %object.key,
            local_size = meta.len(),
            remote_size = object.size_bytes,
            "Local copy differs in size, replacing"
        );
    }

    progress.send(ProgressEvent::Started {
        key: object.key.clone(),
        size_bytes: object.size_bytes,
    });

    let result = if options.debug_mode {
        count_object(store, object, progress).await
    } else {
        download_object(store, object, &options.temp_suffix, progress).await
    };

    match result {
        Ok(bytes) => {
            progress.send(ProgressEvent::Completed {
                key: object.key.clone(),
            });
            TransferOutcome::Completed { bytes }
        }
        Err(e) => {
            progress.send(ProgressEvent::Failed {
                key: object.key.clone(),
                size_bytes: object.size_bytes,
            });
            TransferOutcome::Failed(e)
        }
    }
}

fn verify_size(object: &PendingObject, actual: u64) -> Result<(), TransferError> {
    if actual != object.size_bytes {
        return Err(TransferError::SizeMismatch {
            key: object.key.clone(),
            expected: object.size_bytes,
            actual,
        });
    }
    Ok(())
}

/// Dry run: read the whole body and discard it.
async fn count_object(
    store: &dyn RemoteStore,
    object: &PendingObject,
    progress: &ProgressSender,
) -> Result<u64, TransferError> {
    let mut body = store.get_object(&object.key).await?;
    let mut received: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| TransferError::Stream {
            key: object.key.clone(),
            bytes_so_far: received,
            source,
        })?;
        received += chunk.len() as u64;
        progress.send(ProgressEvent::Transferred {
            key: object.key.clone(),
            bytes: chunk.len() as u64,
        });
    }
    verify_size(object, received)?;
    tracing::info!(key = %object.key, bytes = received, "[DEBUG] Received and discarded");
    Ok(received)
}

/// Stream into a fresh temp file, verify, then rename into place. The temp
/// file is removed on any failure.
async fn download_object(
    store: &dyn RemoteStore,
    object: &PendingObject,
    temp_suffix: &str,
    progress: &ProgressSender,
) -> Result<u64, TransferError> {
    if let Some(parent) = object.local_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let body = store.get_object(&object.key).await?;
    let (part_path, file) = create_temp_file(&object.local_path, temp_suffix).await?;
    let result = write_and_place(object, body, file, &part_path, progress).await;
    if result.is_err() {
        let _ = fs::remove_file(&part_path).await;
    }
    result
}

async fn write_and_place(
    object: &PendingObject,
    mut body: ObjectBody,
    mut file: File,
    part_path: &Path,
    progress: &ProgressSender,
) -> Result<u64, TransferError> {
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| {
            tracing::warn!(
                key = %object.key,
                bytes_so_far = written,
                error = %source,
                "Body stream error"
            );
            TransferError::Stream {
                key: object.key.clone(),
                bytes_so_far: written,
                source,
            }
        })?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress.send(ProgressEvent::Transferred {
            key: object.key.clone(),
            bytes: chunk.len() as u64,
        });
    }
    file.flush().await?;
    drop(file);

    verify_size(object, written)?;
    fs::rename(part_path, &object.local_path).await?;

    let mtime_path = object.local_path.clone();
    let modified = object.last_modified;
    match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, modified)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            "Could not set mtime on {}: {}",
            object.local_path.display(),
            e
        ),
        Err(e) => tracing::warn!("mtime task failed: {}", e),
    }

    tracing::debug!(key = %object.key, path = %object.local_path.display(), "Downloaded");
    Ok(written)
}

/// Stamp the file with the object's last-modified time. Times before 1970
/// clamp to the epoch.
fn set_file_mtime(path: &Path, modified: DateTime<Utc>) -> std::io::Result<()> {
    let millis = modified.timestamp_millis();
    let time = if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        SystemTime::UNIX_EPOCH
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)
}
