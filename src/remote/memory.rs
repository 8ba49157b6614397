//! In-process [`RemoteStore`] for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};

use super::{ListingError, ObjectBody, ObjectPage, RemoteObject, RemoteStore};
use crate::transfer::TransferError;

const CHUNK_SIZE: usize = 4;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// How a body stream misbehaves.
#[derive(Clone, Copy)]
enum Fault {
    /// End cleanly after this many bytes.
    Truncate(usize),
    /// Yield an I/O error after this many bytes.
    Interrupt(usize),
}

pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<HashMap<String, Fault>>,
    failing_gets: Mutex<HashMap<String, u16>>,
    panicking_gets: Mutex<HashSet<String>>,
    /// Remaining listing calls to fail, with the status to report.
    listing_failures: Mutex<(usize, Option<u16>)>,
    page_size: usize,
    delay: Duration,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            failing_gets: Mutex::new(HashMap::new()),
            panicking_gets: Mutex::new(HashSet::new()),
            listing_failures: Mutex::new((0, None)),
            page_size: 1000,
            delay: Duration::ZERO,
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Simulated time each `get_object` call takes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn insert(&self, key: &str, data: &[u8], last_modified: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                last_modified,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    /// Serve only the first `bytes` of `key`, then end the stream cleanly.
    pub fn truncate(&self, key: &str, bytes: usize) {
        self.faults
            .lock()
            .unwrap()
            .insert(key.to_string(), Fault::Truncate(bytes));
    }

    /// Break the stream for `key` with an I/O error after `bytes`.
    pub fn interrupt(&self, key: &str, bytes: usize) {
        self.faults
            .lock()
            .unwrap()
            .insert(key.to_string(), Fault::Interrupt(bytes));
    }

    /// Reject every `get_object` for `key` with `status`.
    pub fn fail_get(&self, key: &str, status: u16) {
        self.failing_gets
            .lock()
            .unwrap()
            .insert(key.to_string(), status);
    }

    /// Panic inside every `get_object` for `key`.
    pub fn panic_on_get(&self, key: &str) {
        self.panicking_gets.lock().unwrap().insert(key.to_string());
    }

    /// Fail the next `count` listing calls.
    pub fn fail_next_listings(&self, count: usize, status: Option<u16>) {
        *self.listing_failures.lock().unwrap() = (count, status);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `get_object` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_page(
        &self,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ObjectPage, ListingError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.listing_failures.lock().unwrap();
            if failures.0 > 0 {
                failures.0 -= 1;
                return Err(ListingError::Request {
                    prefix: prefix.unwrap_or("").to_string(),
                    status: failures.1,
                    message: "injected listing failure".to_string(),
                });
            }
        }

        let prefix = prefix.unwrap_or("");
        let objects = self.objects.lock().unwrap();
        // Continuation tokens are the last key served, like S3's StartAfter.
        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| {
                continuation
                    .as_deref()
                    .map_or(true, |after| key.as_str() > after)
            });

        let page: Vec<RemoteObject> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(key, stored)| RemoteObject {
                key: key.clone(),
                last_modified: stored.last_modified,
                size_bytes: stored.data.len() as u64,
            })
            .collect();
        let is_truncated = matching.next().is_some();

        Ok(ObjectPage {
            next_token: if is_truncated {
                page.last().map(|o| o.key.clone())
            } else {
                None
            },
            objects: page,
            is_truncated,
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody, TransferError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let panics = self.panicking_gets.lock().unwrap().contains(key);
        if panics {
            panic!("injected panic fetching {key}");
        }

        if let Some(status) = self.failing_gets.lock().unwrap().get(key) {
            return Err(TransferError::Request {
                key: key.to_string(),
                status: Some(*status),
                message: "injected get failure".to_string(),
            });
        }

        let stored = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| TransferError::Request {
                key: key.to_string(),
                status: Some(404),
                message: "NoSuchKey".to_string(),
            })?;

        let fault = self.faults.lock().unwrap().get(key).copied();
        let served = match fault {
            Some(Fault::Truncate(n)) | Some(Fault::Interrupt(n)) => {
                stored.data.slice(..n.min(stored.data.len()))
            }
            None => stored.data,
        };

        let mut chunks: Vec<Result<Bytes, std::io::Error>> = served
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if let Some(Fault::Interrupt(_)) = fault {
            chunks.push(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }

        Ok(stream::iter(chunks).boxed())
    }
}
