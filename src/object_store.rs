// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Object-store port (C1): `put`/`exists`/`size`/`delete`/`url` against an
//! S3-compatible bucket, via `aws-sdk-s3`.

use async_trait::async_trait;
use base::{err, Error};
use std::path::Path;
use std::time::Duration;

/// Maps a file extension to a content type, per the fixed table of spec.md §4.1.
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "flv" => "video/x-flv",
        _ => "video/mp4",
    }
}

/// `30s per MB, clamped [5, 15] minutes`, per spec.md §5's object-store put timeout.
pub fn put_timeout(size_bytes: u64) -> Duration {
    let size_mb = (size_bytes / (1024 * 1024)).max(1);
    let secs = (size_mb * 30).clamp(5 * 60, 15 * 60);
    Duration::from_secs(secs)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `local_path` to `key`. Idempotent on identical content.
    /// Returns `Ok(false)` when the backend is disabled ("not configured");
    /// the caller treats the file as local-only in that case.
    async fn put(&self, key: &str, local_path: &Path, content_type: &str) -> Result<bool, Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    async fn size(&self, key: &str) -> Result<Option<u64>, Error>;

    /// Idempotent: deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Builds a URL for `key`. When `signed`, applies `ttl` (default 120 min
    /// for playback/download, per spec.md §4.1); the caller decides `ttl`.
    async fn url(&self, key: &str, signed: bool, ttl: Duration) -> Result<String, Error>;
}

/// Default signed-URL TTL for playback/download (spec.md §4.1).
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(120 * 60);

/// Backend that reports itself disabled everywhere; used when no bucket is
/// configured (spec.md §4.1: "the port is still instantiable").
pub struct NullObjectStore;

#[async_trait]
impl ObjectStore for NullObjectStore {
    async fn put(&self, _key: &str, _local_path: &Path, _content_type: &str) -> Result<bool, Error> {
        Ok(false)
    }

    async fn exists(&self, _key: &str) -> Result<bool, Error> {
        Ok(false)
    }

    async fn size(&self, _key: &str) -> Result<Option<u64>, Error> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn url(&self, _key: &str, _signed: bool, _ttl: Duration) -> Result<String, Error> {
        Err(err!(FailedPrecondition, msg("object store is not configured")))
    }
}

/// S3-compatible production backend. Grounded on `aws-sdk-s3`'s client/
/// presigning API as used by `MattJeff-BROZ/backend/broz-shared`.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: Option<String>,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, public_base_url: Option<String>) -> Self {
        S3ObjectStore {
            client,
            bucket,
            public_base_url,
        }
    }

    /// Builds a client from the ambient AWS config (region/credentials/endpoint
    /// resolved by `aws-config`, same as spec.md §6's env-driven backend selector).
    pub async fn from_env(bucket: String, endpoint: Option<String>, public_base_url: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let config = loader.load().await;
        let client = aws_sdk_s3::Client::new(&config);
        S3ObjectStore::new(client, bucket, public_base_url)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, local_path: &Path, content_type: &str) -> Result<bool, Error> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(local_path)
            .await
            .map_err(|e| err!(Unavailable, msg("reading {}", local_path.display()), source(e)))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("uploading {key} to {}", self.bucket), source(e)))?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(err!(Unavailable, msg("checking existence of {key}"), source(e)))
                }
            }
        }
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, Error> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(resp) => Ok(resp.content_length().map(|l| l as u64)),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(err!(Unavailable, msg("getting size of {key}"), source(e)))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("deleting {key}"), source(e)))?;
        Ok(())
    }

    async fn url(&self, key: &str, signed: bool, ttl: Duration) -> Result<String, Error> {
        if !signed {
            if let Some(base) = &self.public_base_url {
                return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
            }
        }
        let expires = aws_sdk_s3::presigning::PresigningConfig::expires_in(ttl)
            .map_err(|e| err!(InvalidArgument, msg("invalid presign ttl"), source(e)))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(expires)
            .await
            .map_err(|e| err!(Unavailable, msg("presigning {key}"), source(e)))?;
        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types() {
        assert_eq!(content_type_for_extension("mp4"), "video/mp4");
        assert_eq!(content_type_for_extension("MKV"), "video/x-matroska");
        assert_eq!(content_type_for_extension("xyz"), "video/mp4");
    }

    #[test]
    fn timeout_clamped() {
        assert_eq!(put_timeout(1024 * 1024).as_secs(), 5 * 60);
        assert_eq!(put_timeout(1024 * 1024 * 100).as_secs(), 15 * 60);
        assert_eq!(put_timeout(1024 * 1024 * 1000).as_secs(), 15 * 60);
    }

    #[tokio::test]
    async fn null_store_disabled() {
        let store = NullObjectStore;
        assert!(!store.put("k", Path::new("/nonexistent"), "video/mp4").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.size("k").await.unwrap(), None);
        store.delete("k").await.unwrap();
    }
}
