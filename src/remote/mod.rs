//! Remote object store access.
//!
//! [`RemoteStore`] is the seam between the engine and the bucket: the S3
//! client implements it in production and an in-memory store stands in for
//! it in tests. [`RemoteLister`] layers pagination, retries and per-prefix
//! fan-in on top of it.

pub mod error;
pub mod lister;
#[cfg(test)]
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::transfer::TransferError;

pub use error::ListingError;
pub use lister::RemoteLister;
pub use s3::S3Store;

/// One object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// A single page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    /// Token for the following page, present while the listing is truncated.
    pub next_token: Option<String>,
    pub is_truncated: bool,
}

/// Object content as a stream of chunks.
pub type ObjectBody = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one page of keys under `prefix`, continuing from `continuation`.
    async fn list_page(
        &self,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ObjectPage, ListingError>;

    /// Open the content of `key` for streaming.
    async fn get_object(&self, key: &str) -> Result<ObjectBody, TransferError>;
}
