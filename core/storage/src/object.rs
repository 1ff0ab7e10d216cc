//! Blob service contract.

use async_trait::async_trait;
use std::time::Duration;

use poleshift_common::Result;

/// Object storage organised in buckets.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Check whether an object exists at `path`.
    async fn exists(&self, bucket: &str, path: &str) -> Result<bool>;

    /// Upload `data` to `path`.
    ///
    /// # Errors
    /// - `RemoteRejected` with status 409 if the object already exists
    /// - `Network` on transport failure
    async fn upload(&self, bucket: &str, path: &str, data: Vec<u8>) -> Result<()>;

    /// Remove objects. Missing paths are ignored.
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()>;

    /// Create a time-limited download URL.
    async fn create_signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String>;
}
