//! Transfer engine services.
//!
//! Layered bottom-up: `backoff` computes waits, `transport` performs one
//! HTTP exchange, `retry` turns exchanges into resilient logical requests,
//! `api` maps platform routes onto those requests, and the `upload` and
//! `download` pipelines drive whole transfers through the `backend` seams.

pub mod api;
pub mod backend;
pub mod backoff;
pub mod checksum;
pub mod chunk_planner;
pub mod download;
pub mod retry;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{HttpRangeFetcher, PlatformClient, TransferUrl};
pub use backend::{FetchedRange, ObjectBackend, RangeFetcher};
pub use backoff::{BackoffPolicy, FixedJitter, JitterSource, SeededJitter, ThreadRngJitter};
pub use chunk_planner::{ByteRange, DownloadRamp, UploadChunkPlanner};
pub use download::{DownloadCursor, DownloadOptions, DownloadStream};
pub use retry::{RequestSpec, RetryPolicy, RetryStrategy, RetryableRequestExecutor};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use upload::UploadPipeline;
