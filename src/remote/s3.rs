//! S3 (and S3-compatible) implementation of [`RemoteStore`].

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};

use super::{ListingError, ObjectBody, ObjectPage, RemoteObject, RemoteStore};
use crate::config::Settings;
use crate::transfer::TransferError;

/// Provider name attached to credentials taken from the settings file.
const STATIC_PROVIDER: &str = "bucket-mirror-settings";

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from the settings.
    ///
    /// Static credentials are used when configured, otherwise the default
    /// provider chain (environment, profile, instance metadata). A custom
    /// endpoint switches to path-style addressing, which most S3-compatible
    /// stores expect.
    pub async fn connect(settings: &Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if let Some(creds) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key.clone(),
                creds.secret_key.clone(),
                None,
                None,
                STATIC_PROVIDER,
            ));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if settings.endpoint_url.is_some() {
            builder = builder.force_path_style(true);
        }

        tracing::debug!(
            bucket = %settings.bucket_name,
            region = %settings.region,
            endpoint = ?settings.endpoint_url,
            "S3 client ready"
        );

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket_name.clone(),
        }
    }
}

fn to_utc(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.secs(), ts.subsec_nanos()).single()
}

/// Adapt the SDK body into a plain chunk stream.
fn body_stream(body: ByteStream) -> ObjectBody {
    stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        match body.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), Some(body))),
            // Stop after the first error; the body is not resumable.
            Some(Err(e)) => Some((Err(std::io::Error::other(e)), None)),
            None => None,
        }
    })
    .boxed()
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn list_page(
        &self,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ObjectPage, ListingError> {
        let prefix_label = prefix.unwrap_or("").to_string();
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(prefix.map(str::to_string))
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| ListingError::Request {
                prefix: prefix_label.clone(),
                status: e.raw_response().map(|r| r.status().as_u16()),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let mut objects = Vec::with_capacity(resp.contents().len());
        for object in resp.contents() {
            let key = object.key().ok_or_else(|| ListingError::Malformed {
                prefix: prefix_label.clone(),
                reason: "object without a key".to_string(),
            })?;
            objects.push(RemoteObject {
                key: key.to_string(),
                last_modified: object
                    .last_modified()
                    .and_then(to_utc)
                    .unwrap_or(DateTime::UNIX_EPOCH),
                size_bytes: object.size().unwrap_or(0).max(0) as u64,
            });
        }

        Ok(ObjectPage {
            objects,
            next_token: resp.next_continuation_token().map(str::to_string),
            is_truncated: resp.is_truncated().unwrap_or(false),
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody, TransferError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| TransferError::Request {
                key: key.to_string(),
                status: e.raw_response().map(|r| r.status().as_u16()),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(body_stream(resp.body))
    }
}
