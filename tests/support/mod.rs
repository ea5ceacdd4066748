//! In-process mock of the platform API, served by axum on a random port.
//!
//! Routes:
//! - `POST /file/new` and `POST /{object}/{method}`: JSON RPC with nonce replay
//! - `PUT  /F/U/{object}/{index}`: part payloads from pre-signed upload URLs
//! - `GET  /F/D/{object}`: ranged reads from pre-signed download URLs
//!
//! Faults queued with [`MockServer::inject`] hit the next matching request.

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use dx_transfer::{
    BackoffPolicy, PlatformClient, RetryPolicy, RetryableRequestExecutor,
    services::{ReqwestTransport, checksum::content_md5},
};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::net::TcpListener;

pub const TOKEN: &str = "test-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Rpc(&'static str),
    PartPut,
    RangeGet,
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Reply with this status without doing anything.
    Status(u16),
    /// 503 with `Retry-After`.
    Throttle(u64),
    /// Apply the request, then reply with this status.
    AfterCommit(u16),
    /// Flip one byte of the returned range.
    Corrupt,
}

#[derive(Debug, Default)]
struct MockObject {
    project: Option<String>,
    name: Option<String>,
    state: String,
    parts: BTreeMap<u32, Vec<u8>>,
    closing_polls_left: u32,
}

impl MockObject {
    fn content(&self) -> Vec<u8> {
        self.parts.values().flatten().copied().collect()
    }
}

#[derive(Default)]
struct Inner {
    base_url: String,
    objects: HashMap<String, MockObject>,
    nonces: HashMap<String, (Value, Value)>,
    faults: Vec<(Target, Fault)>,
    next_id: u64,
    closing_polls: u32,
    /// Serve ranges without a `Content-MD5` header.
    bare_ranges: bool,
    rpc_log: Vec<String>,
    part_puts: usize,
    range_gets: usize,
}

impl Inner {
    fn take_fault(&mut self, target: Target) -> Option<Fault> {
        let pos = self.faults.iter().position(|(t, _)| *t == target)?;
        Some(self.faults.remove(pos).1)
    }
}

#[derive(Clone, Default)]
pub struct MockState {
    inner: Arc<Mutex<Inner>>,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

pub struct MockServer {
    pub base_url: String,
    state: MockState,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = MockState::default();
        let app = Router::new()
            .route("/{resource}/{method}", post(rpc))
            .route("/F/U/{object}/{index}", put(put_part))
            .route("/F/D/{object}", get(get_range))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        state.lock().base_url = base_url.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { base_url, state }
    }

    /// Client with a millisecond-scale backoff.
    pub fn client(&self) -> PlatformClient {
        let transport = ReqwestTransport::new("dx-transfer-tests", Duration::from_secs(10)).unwrap();
        let executor = RetryableRequestExecutor::new(Arc::new(transport))
            .with_policy(RetryPolicy {
                max_attempts: 7,
                backoff: BackoffPolicy::scaled(Duration::from_millis(1)),
            })
            .with_api_header("Authorization", format!("Bearer {TOKEN}"))
            .with_api_header("DNAnexus-API", "1.0.0");
        PlatformClient::new(executor, &self.base_url)
    }

    pub fn inject(&self, target: Target, fault: Fault) {
        self.state.lock().faults.push((target, fault));
    }

    pub fn set_closing_polls(&self, polls: u32) {
        self.state.lock().closing_polls = polls;
    }

    /// Stop sending `Content-MD5` on range responses.
    pub fn omit_range_checksums(&self) {
        self.state.lock().bare_ranges = true;
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn content(&self, id: &str) -> Vec<u8> {
        self.state.lock().objects[id].content()
    }

    pub fn part_sizes(&self, id: &str) -> Vec<usize> {
        self.state.lock().objects[id]
            .parts
            .values()
            .map(Vec::len)
            .collect()
    }

    pub fn rpc_count(&self, route_suffix: &str) -> usize {
        self.state
            .lock()
            .rpc_log
            .iter()
            .filter(|r| r.ends_with(route_suffix))
            .count()
    }

    pub fn range_gets(&self) -> usize {
        self.state.lock().range_gets
    }

    pub fn part_puts(&self) -> usize {
        self.state.lock().part_puts
    }
}

fn api_error(status: u16, error_type: &str, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "error": { "type": error_type, "message": message } })),
    )
        .into_response()
}

fn throttled(secs: u64) -> Response {
    let mut response = api_error(503, "ServiceUnavailable", "try again later");
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// `POST /{resource}/{method}`
async fn rpc(
    State(state): State<MockState>,
    Path((resource, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"));
    if !authorized {
        return api_error(401, "InvalidAuthentication", "missing or bad token");
    }
    let input: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return api_error(400, "InvalidInput", "body is not JSON"),
    };

    let mut inner = state.lock();
    inner.rpc_log.push(format!("/{resource}/{method}"));

    let target = match method.as_str() {
        "new" => Target::Rpc("new"),
        "upload" => Target::Rpc("upload"),
        "close" => Target::Rpc("close"),
        "describe" => Target::Rpc("describe"),
        "download" => Target::Rpc("download"),
        _ => Target::Rpc("other"),
    };
    let mut after_commit = None;
    match inner.take_fault(target) {
        Some(Fault::Status(code)) => return api_error(code, "InternalError", "injected"),
        Some(Fault::Throttle(secs)) => return throttled(secs),
        Some(Fault::AfterCommit(code)) => after_commit = Some(code),
        Some(Fault::Corrupt) | None => {}
    }

    let nonce = input.get("nonce").and_then(Value::as_str).map(str::to_string);
    if let Some(nonce) = &nonce
        && let Some((seen_input, seen_output)) = inner.nonces.get(nonce)
    {
        if *seen_input == input {
            return (StatusCode::OK, Json(seen_output.clone())).into_response();
        }
        return api_error(
            422,
            "InvalidInput",
            "Nonce was reused for an earlier API request that had a different input",
        );
    }

    let output = match dispatch(&mut inner, &resource, &method, &input) {
        Ok(output) => output,
        Err(response) => return response,
    };
    if let Some(nonce) = nonce {
        inner.nonces.insert(nonce, (input, output.clone()));
    }
    if let Some(code) = after_commit {
        return api_error(code, "InternalError", "response lost after commit");
    }
    (StatusCode::OK, Json(output)).into_response()
}

fn dispatch(inner: &mut Inner, resource: &str, method: &str, input: &Value) -> Result<Value, Response> {
    if resource == "file" && method == "new" {
        inner.next_id += 1;
        let id = format!("file-{:024}", inner.next_id);
        inner.objects.insert(
            id.clone(),
            MockObject {
                project: input["project"].as_str().map(str::to_string),
                name: input["name"].as_str().map(str::to_string),
                state: "open".into(),
                ..MockObject::default()
            },
        );
        return Ok(json!({ "id": id }));
    }

    let base_url = inner.base_url.clone();
    let closing_polls = inner.closing_polls;
    let Some(object) = inner.objects.get_mut(resource) else {
        return Err(api_error(
            404,
            "ResourceNotFound",
            &format!("\"{resource}\" could not be found"),
        ));
    };

    match method {
        "upload" => {
            if object.state != "open" {
                return Err(api_error(422, "InvalidState", "object is not open"));
            }
            let index = input["index"].as_u64().unwrap_or(1);
            if !(1..=10_000).contains(&index) {
                return Err(api_error(422, "InvalidInput", "index out of range"));
            }
            Ok(json!({
                "url": format!("{base_url}/F/U/{resource}/{index}"),
                "headers": { "x-upload-token": "signed" },
                "expires": 4_102_444_800_000u64
            }))
        }
        "close" => {
            if object.state == "open" {
                object.state = "closing".into();
                object.closing_polls_left = closing_polls;
            }
            Ok(json!({ "id": resource }))
        }
        "describe" => {
            if object.state == "closing" {
                if object.closing_polls_left == 0 {
                    object.state = "closed".into();
                } else {
                    object.closing_polls_left -= 1;
                }
            }
            let parts: serde_json::Map<String, Value> = object
                .parts
                .iter()
                .map(|(i, data)| {
                    (
                        i.to_string(),
                        json!({ "state": "complete", "size": data.len(), "md5": hex_md5(data) }),
                    )
                })
                .collect();
            let mut out = json!({
                "id": resource,
                "class": "file",
                "project": object.project,
                "name": object.name,
                "state": object.state,
                "created": 1_700_000_000_000u64,
                "parts": parts,
            });
            if object.state == "closed" {
                out["size"] = json!(object.content().len());
            }
            Ok(out)
        }
        "download" => {
            if object.state != "closed" {
                return Err(api_error(422, "InvalidState", "object is not closed"));
            }
            Ok(json!({ "url": format!("{base_url}/F/D/{resource}"), "headers": {} }))
        }
        _ => Err(api_error(404, "MethodNotFound", "unknown method")),
    }
}

/// `PUT /F/U/{object}/{index}`
async fn put_part(
    State(state): State<MockState>,
    Path((object_id, index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut inner = state.lock();
    inner.part_puts += 1;
    if headers.contains_key(header::AUTHORIZATION) {
        return api_error(400, "InvalidInput", "pre-signed URLs take no credentials");
    }
    if headers.get("x-upload-token").is_none() {
        return api_error(403, "PermissionDenied", "missing upload token");
    }
    match inner.take_fault(Target::PartPut) {
        Some(Fault::Status(code)) => return api_error(code, "InternalError", "injected"),
        Some(Fault::Throttle(secs)) => return throttled(secs),
        _ => {}
    }
    let expected = headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if expected != content_md5(&body) {
        return api_error(400, "InvalidInput", "Content-MD5 mismatch");
    }
    let Some(object) = inner.objects.get_mut(&object_id) else {
        return api_error(404, "ResourceNotFound", "no such object");
    };
    if object.state != "open" {
        return api_error(422, "InvalidState", "object is not open");
    }
    object.parts.insert(index, body.to_vec());
    StatusCode::OK.into_response()
}

/// `GET /F/D/{object}` with an optional `Range: bytes=a-b` header.
async fn get_range(
    State(state): State<MockState>,
    Path(object_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut inner = state.lock();
    inner.range_gets += 1;
    let fault = inner.take_fault(Target::RangeGet);
    match fault {
        Some(Fault::Status(code)) => return api_error(code, "InternalError", "injected"),
        Some(Fault::Throttle(secs)) => return throttled(secs),
        _ => {}
    }
    let Some(object) = inner.objects.get(&object_id) else {
        return api_error(404, "ResourceNotFound", "no such object");
    };
    let content = object.content();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
    let (status, start, end) = match range {
        Some((a, b)) if a <= b && b < content.len() => (StatusCode::PARTIAL_CONTENT, a, b + 1),
        Some(_) => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (StatusCode::OK, 0, content.len()),
    };

    let clean = &content[start..end];
    let checksum = (!inner.bare_ranges).then(|| content_md5(clean));
    let mut body = clean.to_vec();
    if matches!(fault, Some(Fault::Corrupt))
        && let Some(first) = body.first_mut()
    {
        *first ^= 0xff;
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if let Some(Ok(value)) = checksum.as_deref().map(HeaderValue::from_str) {
        response.headers_mut().insert("content-md5", value);
    }
    response
}
