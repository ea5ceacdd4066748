//! Typed wrappers over the platform's RPC routes for file objects.
//!
//! Every route is a `POST {api_server}/{resource}/{method}` with a JSON
//! body. Part payloads and range downloads go to pre-signed URLs returned
//! by `upload` and `download`; those requests carry no API credentials.

use crate::{
    config::{API_VERSION, ApiConfig},
    errors::{TransferError, TransferResult},
    models::{ObjectDescription, ObjectState, TransferObject, UploadOptions},
    services::{
        backend::{FetchedRange, ObjectBackend, RangeFetcher},
        checksum::{decode_content_md5, hex_to_content_md5},
        chunk_planner::ByteRange,
        retry::{RequestSpec, RetryStrategy, RetryableRequestExecutor},
        transport::ReqwestTransport,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, warn};

/// Pre-signed URL plus the headers that must accompany it.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferUrl {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Expiry as epoch milliseconds, when the server reports one.
    #[serde(default)]
    pub expires: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NewObject {
    id: String,
}

/// Client for the file-object routes.
#[derive(Clone)]
pub struct PlatformClient {
    executor: RetryableRequestExecutor,
    api_server: String,
}

impl PlatformClient {
    pub fn new(executor: RetryableRequestExecutor, api_server: impl Into<String>) -> Self {
        Self {
            executor,
            api_server: api_server.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build a client on the production transport from resolved settings.
    pub fn from_config(config: &ApiConfig) -> TransferResult<Self> {
        let transport = ReqwestTransport::new(&ApiConfig::user_agent(), config.request_timeout)?;
        let mut executor = RetryableRequestExecutor::new(Arc::new(transport))
            .with_total_timeout(config.total_timeout)
            .with_api_header("DNAnexus-API", API_VERSION);
        match &config.security_context {
            Some(ctx) => executor = executor.with_api_header("Authorization", ctx.authorization()),
            None => warn!("no security context configured; requests are unauthenticated"),
        }
        Ok(Self::new(executor, config.api_server()))
    }

    pub fn executor(&self) -> &RetryableRequestExecutor {
        &self.executor
    }

    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    /// Invoke `/{resource}/{method}` and decode the JSON reply.
    pub async fn call<T: DeserializeOwned>(
        &self,
        resource: &str,
        method: &str,
        input: Value,
        strategy: RetryStrategy,
    ) -> TransferResult<T> {
        if resource.is_empty() || method.is_empty() {
            return Err(TransferError::InvalidArgument(
                "resource and method must be non-empty".into(),
            ));
        }
        let url = format!("{}/{}/{}", self.api_server, resource, method);
        let response = self
            .executor
            .execute(RequestSpec::post_json(url, input), strategy)
            .await?;
        serde_json::from_slice(&response.body).map_err(|e| {
            TransferError::Protocol(format!("/{resource}/{method} returned invalid JSON: {e}"))
        })
    }

    pub async fn file_new(&self, options: &UploadOptions) -> TransferResult<String> {
        let mut input = Map::new();
        if let Some(project) = &options.project {
            input.insert("project".into(), json!(project));
        }
        if let Some(name) = &options.name {
            input.insert("name".into(), json!(name));
        }
        if let Some(folder) = &options.folder {
            input.insert("folder".into(), json!(folder));
            input.insert("parents".into(), json!(true));
        }
        if let Some(media) = &options.media_type {
            input.insert("media".into(), json!(media));
        }
        let created: NewObject = self
            .call("file", "new", Value::Object(input), RetryStrategy::SafeToRetry)
            .await?;
        Ok(created.id)
    }

    pub async fn file_upload(
        &self,
        object_id: &str,
        index: u32,
        size: usize,
        md5: &str,
    ) -> TransferResult<TransferUrl> {
        require_id(object_id)?;
        self.call(
            object_id,
            "upload",
            json!({ "index": index, "size": size, "md5": md5 }),
            RetryStrategy::SafeToRetry,
        )
        .await
    }

    pub async fn file_close(&self, object_id: &str) -> TransferResult<()> {
        require_id(object_id)?;
        let _: Value = self
            .call(object_id, "close", json!({}), RetryStrategy::SafeToRetry)
            .await?;
        Ok(())
    }

    pub async fn file_describe(&self, object_id: &str) -> TransferResult<ObjectDescription> {
        require_id(object_id)?;
        self.call(
            object_id,
            "describe",
            json!({ "fields": { "id": true, "project": true, "name": true, "state": true,
                                 "size": true, "created": true, "modified": true, "parts": true } }),
            RetryStrategy::SafeToRetry,
        )
        .await
    }

    pub async fn file_download(&self, object_id: &str) -> TransferResult<TransferUrl> {
        require_id(object_id)?;
        self.call(
            object_id,
            "download",
            json!({ "preauthenticated": true }),
            RetryStrategy::SafeToRetry,
        )
        .await
    }

    /// Resolve a download URL and part table for a closed object.
    pub async fn range_fetcher(
        &self,
        description: &ObjectDescription,
    ) -> TransferResult<HttpRangeFetcher> {
        if description.state != ObjectState::Closed {
            return Err(TransferError::InvalidState(format!(
                "{} is {}, only closed objects can be downloaded",
                description.id,
                description.state.as_str()
            )));
        }
        let target = self.file_download(&description.id).await?;
        Ok(HttpRangeFetcher::new(self.executor.clone(), target))
    }
}

fn require_id(object_id: &str) -> TransferResult<()> {
    if object_id.is_empty() {
        return Err(TransferError::InvalidArgument(
            "object id must be non-empty".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl ObjectBackend for PlatformClient {
    async fn create_object(&self, options: &UploadOptions) -> TransferResult<TransferObject> {
        let id = self.file_new(options).await?;
        info!(object = %id, project = ?options.project, "created object");
        Ok(TransferObject::new(id, options.project.clone(), ObjectState::Open))
    }

    async fn upload_part(
        &self,
        object_id: &str,
        index: u32,
        data: Bytes,
        md5: &str,
    ) -> TransferResult<()> {
        let content_md5 = hex_to_content_md5(md5).ok_or_else(|| {
            TransferError::InvalidArgument(format!("part {index} md5 {md5:?} is not a hex digest"))
        })?;
        let target = self.file_upload(object_id, index, data.len(), md5).await?;
        let mut spec = RequestSpec::put(target.url, data).unauthenticated();
        for (name, value) in target.headers {
            // reqwest derives the length from the body.
            if !name.eq_ignore_ascii_case("content-length") {
                spec = spec.header(name, value);
            }
        }
        if !spec
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("content-md5"))
        {
            spec = spec.header("Content-MD5", content_md5);
        }
        self.executor
            .execute(spec, RetryStrategy::SafeToRetry)
            .await?;
        Ok(())
    }

    async fn close_object(&self, object_id: &str) -> TransferResult<()> {
        self.file_close(object_id).await?;
        info!(object = %object_id, "close requested");
        Ok(())
    }

    async fn describe_object(&self, object_id: &str) -> TransferResult<ObjectDescription> {
        self.file_describe(object_id).await
    }
}

/// Range fetcher over a pre-signed download URL.
///
/// A range's checksum comes from the response `Content-MD5` header. Ranges
/// served without one are verified by the download stream against the
/// recorded part checksums.
#[derive(Clone)]
pub struct HttpRangeFetcher {
    executor: RetryableRequestExecutor,
    target: TransferUrl,
}

impl HttpRangeFetcher {
    pub fn new(executor: RetryableRequestExecutor, target: TransferUrl) -> Self {
        Self { executor, target }
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch_range(&self, start: u64, end: u64) -> TransferResult<FetchedRange> {
        if end <= start {
            return Ok(FetchedRange {
                bytes: Bytes::new(),
                checksum: None,
            });
        }
        let range = ByteRange::new(start, end);
        let mut spec = RequestSpec::get(self.target.url.clone())
            .unauthenticated()
            .header("Range", range.to_header());
        for (name, value) in &self.target.headers {
            spec = spec.header(name.clone(), value.clone());
        }

        let response = self
            .executor
            .execute(spec, RetryStrategy::SafeToRetry)
            .await?;
        let checksum = match response.header_str("content-md5") {
            Some(value) => Some(decode_content_md5(value).ok_or_else(|| {
                TransferError::Protocol(format!(
                    "unreadable Content-MD5 {value:?} for bytes {start}..{end}"
                ))
            })?),
            None => None,
        };
        Ok(FetchedRange {
            bytes: response.body,
            checksum,
        })
    }
}
