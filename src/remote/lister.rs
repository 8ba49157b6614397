use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};

use super::{ListingError, RemoteObject, RemoteStore};
use crate::mapper::normalize_prefixes;
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};

/// Lazy sequence of listing pages.
pub type PageStream = BoxStream<'static, Result<Vec<RemoteObject>, ListingError>>;

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Enumerates the bucket page by page.
///
/// Streams are lazy: nothing is requested until the first page is polled, and
/// each call starts a fresh listing from the beginning.
#[derive(Clone)]
pub struct RemoteLister {
    store: Arc<dyn RemoteStore>,
    included: Vec<String>,
    retry: RetryConfig,
}

impl RemoteLister {
    pub fn new(store: Arc<dyn RemoteStore>, included_prefixes: &[String], retry: RetryConfig) -> Self {
        Self {
            store,
            included: normalize_prefixes(included_prefixes),
            retry,
        }
    }

    /// Pages of every key starting with `prefix` (the whole bucket for `None`).
    ///
    /// Each request is retried on transient failures. Once retries run out
    /// the stream yields the error and ends.
    pub fn pages(&self, prefix: Option<String>) -> PageStream {
        let store = self.store.clone();
        let retry = self.retry.clone();

        stream::try_unfold(Cursor::Start, move |cursor| {
            let store = store.clone();
            let retry = retry.clone();
            let prefix = prefix.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(token) => Some(token),
                };

                let page = retry_with_backoff(
                    &retry,
                    |e: &ListingError| {
                        if e.is_retryable() {
                            RetryAction::Retry
                        } else {
                            RetryAction::Abort
                        }
                    },
                    || store.list_page(prefix.as_deref(), token.clone()),
                )
                .await?;

                let next = match (page.is_truncated, page.next_token) {
                    (false, _) => Cursor::Done,
                    (true, Some(token)) => Cursor::Next(token),
                    (true, None) => {
                        return Err(ListingError::Malformed {
                            prefix: prefix.unwrap_or_default(),
                            reason: "truncated page without a continuation token".to_string(),
                        })
                    }
                };

                tracing::debug!(
                    prefix = prefix.as_deref().unwrap_or(""),
                    objects = page.objects.len(),
                    "Listed page"
                );
                Ok(Some((page.objects, next)))
            }
        })
        .boxed()
    }

    /// One stream per included prefix, interleaved so every prefix makes
    /// progress. Without included prefixes this is a single bucket-wide
    /// stream. Keys from overlapping prefixes are not de-duplicated.
    pub fn pages_for_included(&self) -> PageStream {
        if self.included.is_empty() {
            return self.pages(None);
        }
        let streams: Vec<PageStream> = self
            .included
            .iter()
            .map(|prefix| self.pages(Some(format!("{prefix}/"))))
            .collect();
        stream::select_all(streams).boxed()
    }

    /// Look up a single object by exact key.
    pub async fn load(&self, key: &str) -> Result<RemoteObject, ListingError> {
        let mut pages = self.pages(Some(key.to_string()));
        let mut matches = Vec::new();
        while let Some(page) = pages.try_next().await? {
            matches.extend(page.into_iter().filter(|o| o.key == key));
        }

        match matches.len() {
            0 => Err(ListingError::NotFound(key.to_string())),
            1 => Ok(matches.remove(0)),
            count => Err(ListingError::Ambiguous {
                key: key.to_string(),
                count,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryStore;
    use chrono::Utc;

    fn lister(store: Arc<MemoryStore>, included: &[&str]) -> RemoteLister {
        let included: Vec<String> = included.iter().map(|s| s.to_string()).collect();
        RemoteLister::new(store, &included, RetryConfig::none())
    }

    async fn collect_keys(stream: PageStream) -> Vec<String> {
        let pages: Vec<Vec<RemoteObject>> = stream.try_collect().await.unwrap();
        pages.into_iter().flatten().map(|o| o.key).collect()
    }

    #[tokio::test]
    async fn test_paginates_until_not_truncated() {
        let store = Arc::new(MemoryStore::new().with_page_size(2));
        for i in 0..5 {
            store.insert(&format!("k{i}"), b"x", Utc::now());
        }

        let pages: Vec<Vec<RemoteObject>> =
            lister(store.clone(), &[]).pages(None).try_collect().await.unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 5);
        assert_eq!(store.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_bucket_yields_one_empty_page() {
        let store = Arc::new(MemoryStore::new());
        let keys = collect_keys(lister(store, &[]).pages(None)).await;
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"x", Utc::now());
        let _stream = lister(store.clone(), &[]).pages(None);
        assert_eq!(store.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_included_prefixes_merged() {
        let store = Arc::new(MemoryStore::new().with_page_size(1));
        for key in ["photos/a", "photos/b", "scans/c", "other/d"] {
            store.insert(key, b"x", Utc::now());
        }

        let mut keys = collect_keys(lister(store, &["photos", "scans/"]).pages_for_included()).await;
        keys.sort();
        assert_eq!(keys, vec!["photos/a", "photos/b", "scans/c"]);
    }

    #[tokio::test]
    async fn test_overlapping_prefixes_keep_duplicates() {
        let store = Arc::new(MemoryStore::new());
        store.insert("photos/a", b"x", Utc::now());

        let keys = collect_keys(lister(store, &["photos", "photos/"]).pages_for_included()).await;
        assert_eq!(keys, vec!["photos/a", "photos/a"]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"x", Utc::now());
        store.fail_next_listings(1, Some(503));

        let retry = RetryConfig {
            max_retries: 2,
            base_delay_secs: 0,
            max_delay_secs: 0,
        };
        let lister = RemoteLister::new(store.clone(), &[], retry);
        let keys = collect_keys(lister.pages(None)).await;
        assert_eq!(keys, vec!["a"]);
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_ends_stream() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"x", Utc::now());
        store.fail_next_listings(1, Some(403));

        let retry = RetryConfig {
            max_retries: 3,
            base_delay_secs: 0,
            max_delay_secs: 0,
        };
        let lister = RemoteLister::new(store.clone(), &[], retry);
        let result: Result<Vec<_>, _> = lister.pages(None).try_collect().await;
        assert!(matches!(
            result,
            Err(ListingError::Request { status: Some(403), .. })
        ));
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_pages_restartable() {
        let store = Arc::new(MemoryStore::new().with_page_size(1));
        store.insert("a", b"x", Utc::now());
        store.insert("b", b"x", Utc::now());
        let lister = lister(store, &[]);

        assert_eq!(collect_keys(lister.pages(None)).await, vec!["a", "b"]);
        assert_eq!(collect_keys(lister.pages(None)).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_load_exact_key() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a.txt", b"hello", Utc::now());
        store.insert("a.txt.bak", b"old", Utc::now());

        let object = lister(store, &[]).load("a.txt").await.unwrap();
        assert_eq!(object.key, "a.txt");
        assert_eq!(object.size_bytes, 5);
    }

    #[tokio::test]
    async fn test_load_missing_key() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a.txt.bak", b"old", Utc::now());
        let result = lister(store, &[]).load("a.txt").await;
        assert!(matches!(result, Err(ListingError::NotFound(k)) if k == "a.txt"));
    }
}
