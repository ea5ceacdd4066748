//! Seams between the transfer pipelines and the platform.
//!
//! The HTTP client implements both traits; tests substitute in-memory
//! implementations that can corrupt, delay or fail individual operations.

use crate::{
    errors::TransferResult,
    models::{ObjectDescription, TransferObject, UploadOptions},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Object lifecycle and part upload operations.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Create a new object in the `open` state.
    async fn create_object(&self, options: &UploadOptions) -> TransferResult<TransferObject>;

    /// Store `data` as part `index` (1-based) of an open object.
    async fn upload_part(
        &self,
        object_id: &str,
        index: u32,
        data: Bytes,
        md5: &str,
    ) -> TransferResult<()>;

    /// Ask the server to finalize the object (`open` → `closing`).
    async fn close_object(&self, object_id: &str) -> TransferResult<()>;

    async fn describe_object(&self, object_id: &str) -> TransferResult<ObjectDescription>;
}

/// Bytes of one fetched range plus the checksum to verify them against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRange {
    pub bytes: Bytes,
    /// Hex MD5 of the range, when the server provided or recorded one.
    pub checksum: Option<String>,
}

/// Random-access byte source for a closed object.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Fetch bytes `[start, end)`.
    async fn fetch_range(&self, start: u64, end: u64) -> TransferResult<FetchedRange>;
}

#[async_trait]
impl<T: RangeFetcher + ?Sized> RangeFetcher for Arc<T> {
    async fn fetch_range(&self, start: u64, end: u64) -> TransferResult<FetchedRange> {
        (**self).fetch_range(start, end).await
    }
}
