//! Resilient upload and download of large binary objects.
//!
//! Uploads stream bytes into numbered parts of an open object and then
//! close it. Downloads read a closed object through ranged, checksum
//! verified requests. Every API request goes through a retrying executor
//! that reuses one idempotency nonce across all attempts of a call.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use config::{ApiArgs, ApiConfig, SecurityContext};
pub use errors::{ApiError, TransferError, TransferResult, TransportError};
pub use models::{ObjectDescription, ObjectState, TransferObject, UploadOptions};
pub use services::{
    BackoffPolicy, DownloadOptions, DownloadStream, PlatformClient, RetryPolicy, RetryStrategy,
    RetryableRequestExecutor, UploadPipeline,
};
