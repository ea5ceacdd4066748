//! Retrying request executor.
//!
//! One call to [`RetryableRequestExecutor::execute`] is one logical request.
//! Its retry state lives in a [`RetryContext`] local to that call, so the
//! executor itself is immutable and can be shared by concurrent transfers.

use crate::{
    errors::{ApiError, TransferError, TransferResult},
    services::{
        backoff::{BackoffPolicy, JitterSource, ThreadRngJitter, parse_retry_after},
        transport::{HttpRequest, HttpResponse, HttpTransport},
    },
};
use bytes::Bytes;
use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

/// Whether re-sending a request after a failure is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    SafeToRetry,
    Unsafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed for failures without a server wait directive.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Raw(Bytes),
}

/// Description of a logical request before nonce injection and rendering.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Attach API credentials; pre-signed transfer URLs must not get them.
    pub authenticated: bool,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            authenticated: true,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        let mut spec = Self::new(Method::POST, url);
        spec.body = RequestBody::Json(body);
        spec
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn put(url: impl Into<String>, body: Bytes) -> Self {
        let mut spec = Self::new(Method::PUT, url);
        spec.body = RequestBody::Raw(body);
        spec
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    fn idempotent_method(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
        )
    }
}

/// Generate an idempotency token: 128 random bits followed by a timestamp.
pub fn new_nonce() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Utc::now().timestamp_millis()
    )
}

/// Per-call retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Requests sent so far.
    pub requests: u32,
    /// Failures that count against `max_attempts`.
    pub failures: u32,
    /// Sum of all waits so far.
    pub waited: Duration,
    /// Token reused verbatim by every retry of this call.
    pub nonce: Option<String>,
    pub retry_safe: bool,
    started: Instant,
}

impl RetryContext {
    fn new(nonce: Option<String>, retry_safe: bool) -> Self {
        Self {
            requests: 0,
            failures: 0,
            waited: Duration::ZERO,
            nonce,
            retry_safe,
            started: Instant::now(),
        }
    }

    fn exhausted(&self, last: TransferError) -> TransferError {
        TransferError::RetriesExhausted {
            attempts: self.requests,
            last: Box::new(last),
        }
    }
}

#[derive(Clone)]
pub struct RetryableRequestExecutor {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
    api_headers: Vec<(String, String)>,
    total_timeout: Option<Duration>,
}

impl RetryableRequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            jitter: Arc::new(ThreadRngJitter),
            api_headers: Vec::new(),
            total_timeout: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Headers sent with every authenticated request.
    pub fn with_api_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.api_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one logical request, retrying transient failures when allowed.
    pub async fn execute(
        &self,
        spec: RequestSpec,
        strategy: RetryStrategy,
    ) -> TransferResult<HttpResponse> {
        let (request, ctx) = self.prepare(spec, strategy)?;
        self.run(&request, ctx).await
    }

    fn prepare(
        &self,
        spec: RequestSpec,
        strategy: RetryStrategy,
    ) -> TransferResult<(HttpRequest, RetryContext)> {
        let safe = strategy == RetryStrategy::SafeToRetry;
        let idempotent_method = spec.idempotent_method();
        let mut request = HttpRequest::new(spec.method, spec.url);
        let mut nonce = None;

        if spec.authenticated {
            for (name, value) in &self.api_headers {
                request = request.header(name.clone(), value.clone());
            }
        }
        for (name, value) in spec.headers {
            request = request.header(name, value);
        }

        match spec.body {
            RequestBody::Empty => {}
            RequestBody::Raw(bytes) => request = request.body(bytes),
            RequestBody::Json(mut value) => {
                if let Value::Object(map) = &mut value {
                    match map.get("nonce").and_then(Value::as_str) {
                        Some(existing) => nonce = Some(existing.to_string()),
                        None if safe => {
                            let fresh = new_nonce();
                            map.insert("nonce".into(), Value::String(fresh.clone()));
                            nonce = Some(fresh);
                        }
                        None => {}
                    }
                }
                let rendered = serde_json::to_vec(&value)?;
                request = request
                    .header("Content-Type", "application/json")
                    .body(rendered);
            }
        }

        let retry_safe = safe && (nonce.is_some() || idempotent_method);
        Ok((request, RetryContext::new(nonce, retry_safe)))
    }

    async fn run(&self, request: &HttpRequest, mut ctx: RetryContext) -> TransferResult<HttpResponse> {
        loop {
            ctx.requests += 1;
            let outcome = match self.remaining_budget(&ctx) {
                Some(budget) => match tokio::time::timeout(budget, self.transport.send(request)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(TransferError::DeadlineExceeded {
                            elapsed: ctx.started.elapsed(),
                        });
                    }
                },
                None => self.transport.send(request).await,
            };

            let (failure, hint) = match outcome {
                Ok(response) if response.status.is_success() => {
                    debug!(
                        method = %request.method,
                        url = %request.url,
                        status = response.status.as_u16(),
                        requests = ctx.requests,
                        "request succeeded"
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    let err = ApiError::from_response(response.status, &response.body);
                    if !response.status.is_server_error() {
                        return Err(err.into());
                    }
                    let hint = response
                        .header_str("retry-after")
                        .and_then(parse_retry_after);
                    (TransferError::Api(err), hint)
                }
                Err(err) => (TransferError::Network(err), None),
            };

            if !ctx.retry_safe {
                return Err(failure);
            }

            if hint.is_none() {
                ctx.failures += 1;
                if ctx.failures >= self.policy.max_attempts {
                    return Err(ctx.exhausted(failure));
                }
            }

            let ceiling = self.policy.backoff.ceiling;
            let remaining = ceiling.saturating_sub(ctx.waited);
            if remaining.is_zero() {
                return Err(ctx.exhausted(failure));
            }
            let wait = self
                .policy
                .backoff
                .delay(ctx.failures.max(1), hint, self.jitter.as_ref())
                .min(remaining);

            if let Some(total) = self.total_timeout {
                let elapsed = ctx.started.elapsed();
                if elapsed + wait > total {
                    return Err(TransferError::DeadlineExceeded { elapsed });
                }
            }

            warn!(
                method = %request.method,
                url = %request.url,
                error = %failure,
                "waiting {:.3}s before retry {} of {}",
                wait.as_secs_f64(),
                ctx.failures.max(1),
                self.policy.max_attempts.saturating_sub(1)
            );
            tokio::time::sleep(wait).await;
            ctx.waited += wait;
        }
    }

    fn remaining_budget(&self, ctx: &RetryContext) -> Option<Duration> {
        self.total_timeout
            .map(|total| total.saturating_sub(ctx.started.elapsed()))
    }
}
