//! In-memory doubles shared by the unit tests.

use crate::{
    errors::{ApiError, TransferError, TransferResult, TransportError},
    models::{ObjectDescription, ObjectState, PartDescription, TransferObject, UploadOptions},
    services::{
        backend::{FetchedRange, ObjectBackend, RangeFetcher},
        transport::{HttpRequest, HttpResponse, HttpTransport},
    },
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;

type Scripted = Result<HttpResponse, TransportError>;

/// Transport replaying a fixed list of outcomes and recording every request.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    repeat: Option<Scripted>,
    log: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with the same outcome.
    pub(crate) fn repeating(outcome: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(outcome),
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Time between consecutive requests.
    pub(crate) fn gaps(&self) -> Vec<Duration> {
        let log = self.log.lock().unwrap();
        log.windows(2).map(|w| w[1].0 - w[0].0).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.log
            .lock()
            .unwrap()
            .push((Instant::now(), request.clone()));
        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(outcome), _) => outcome,
            (None, Some(outcome)) => outcome.clone(),
            (None, None) => Err(TransportError::Other("script exhausted".into())),
        }
    }
}

pub(crate) trait RequestExt {
    fn body_json(&self) -> Value;
}

impl RequestExt for HttpRequest {
    fn body_json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

pub(crate) use crate::services::checksum::hex_md5;

/// Deterministic payload of `len` bytes.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub(crate) struct MemoryObject {
    name: Option<String>,
    project: Option<String>,
    state: ObjectState,
    parts: BTreeMap<u32, (Bytes, String)>,
    closing_polls_left: u32,
}

impl MemoryObject {
    fn content(&self) -> Bytes {
        let mut out = BytesMut::new();
        for (data, _) in self.parts.values() {
            out.extend_from_slice(data);
        }
        out.freeze()
    }
}

/// Object backend keeping everything in memory.
#[derive(Default)]
pub(crate) struct MemoryPlatform {
    pub(crate) objects: Mutex<HashMap<String, MemoryObject>>,
    pub(crate) next_id: AtomicU32,
    /// `describe` calls reporting `closing` before the object turns `closed`.
    pub(crate) closing_polls: u32,
    /// Part index whose upload always fails.
    pub(crate) fail_part: Option<u32>,
    /// Simulated latency of each part upload.
    pub(crate) part_delay: Duration,
    pub(crate) active_uploads: AtomicUsize,
    pub(crate) peak_uploads: AtomicUsize,
    pub(crate) describes: AtomicUsize,
}

impl MemoryPlatform {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert an already closed object built from `parts`.
    pub(crate) fn insert_closed(&self, id: &str, parts: &[&[u8]]) {
        let parts = parts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                (
                    i as u32 + 1,
                    (Bytes::copy_from_slice(p), hex_md5(p)),
                )
            })
            .collect();
        self.objects.lock().unwrap().insert(
            id.to_string(),
            MemoryObject {
                name: None,
                project: None,
                state: ObjectState::Closed,
                parts,
                closing_polls_left: 0,
            },
        );
    }

    pub(crate) fn insert_open(&self, id: &str) {
        self.objects.lock().unwrap().insert(
            id.to_string(),
            MemoryObject {
                name: None,
                project: None,
                state: ObjectState::Open,
                parts: BTreeMap::new(),
                closing_polls_left: 0,
            },
        );
    }

    pub(crate) fn content(&self, id: &str) -> Bytes {
        self.objects.lock().unwrap()[id].content()
    }

    pub(crate) fn part_sizes(&self, id: &str) -> Vec<usize> {
        self.objects.lock().unwrap()[id]
            .parts
            .values()
            .map(|(d, _)| d.len())
            .collect()
    }

    pub(crate) fn state(&self, id: &str) -> ObjectState {
        self.objects.lock().unwrap()[id].state
    }

    pub(crate) fn peak_uploads(&self) -> usize {
        self.peak_uploads.load(Ordering::SeqCst)
    }

    pub(crate) fn describe_count(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    fn missing(id: &str) -> TransferError {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "ResourceNotFound",
            format!("\"{id}\" could not be found"),
        )
        .into()
    }
}

#[async_trait]
impl ObjectBackend for MemoryPlatform {
    async fn create_object(&self, options: &UploadOptions) -> TransferResult<TransferObject> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("file-{n:024}");
        self.objects.lock().unwrap().insert(
            id.clone(),
            MemoryObject {
                name: options.name.clone(),
                project: options.project.clone(),
                state: ObjectState::Open,
                parts: BTreeMap::new(),
                closing_polls_left: 0,
            },
        );
        Ok(TransferObject::new(id, options.project.clone(), ObjectState::Open))
    }

    async fn upload_part(
        &self,
        object_id: &str,
        index: u32,
        data: Bytes,
        md5: &str,
    ) -> TransferResult<()> {
        let active = self.active_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_uploads.fetch_max(active, Ordering::SeqCst);
        if !self.part_delay.is_zero() {
            tokio::time::sleep(self.part_delay).await;
        }
        self.active_uploads.fetch_sub(1, Ordering::SeqCst);

        if self.fail_part == Some(index) {
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                format!("part {index} rejected"),
            )
            .into());
        }
        if hex_md5(&data) != md5 {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "InvalidInput",
                "Content-MD5 does not match",
            )
            .into());
        }

        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(object_id)
            .ok_or_else(|| Self::missing(object_id))?;
        if object.state != ObjectState::Open {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "InvalidState",
                "object is not open",
            )
            .into());
        }
        object.parts.insert(index, (data, md5.to_string()));
        Ok(())
    }

    async fn close_object(&self, object_id: &str) -> TransferResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(object_id)
            .ok_or_else(|| Self::missing(object_id))?;
        if object.state == ObjectState::Open {
            object.state = ObjectState::Closing;
            object.closing_polls_left = self.closing_polls;
        }
        Ok(())
    }

    async fn describe_object(&self, object_id: &str) -> TransferResult<ObjectDescription> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(object_id)
            .ok_or_else(|| Self::missing(object_id))?;
        if object.state == ObjectState::Closing {
            if object.closing_polls_left == 0 {
                object.state = ObjectState::Closed;
            } else {
                object.closing_polls_left -= 1;
            }
        }

        let parts = object
            .parts
            .iter()
            .map(|(i, (data, md5))| {
                (
                    i.to_string(),
                    PartDescription {
                        state: Some("complete".into()),
                        size: data.len() as u64,
                        md5: Some(md5.clone()),
                    },
                )
            })
            .collect();
        Ok(ObjectDescription {
            id: object_id.to_string(),
            project: object.project.clone(),
            name: object.name.clone(),
            state: object.state,
            size: (object.state == ObjectState::Closed).then(|| object.content().len() as u64),
            created: None,
            modified: None,
            parts,
        })
    }
}

/// Range source over a fixed payload with injectable corruption.
pub(crate) struct MemoryFetcher {
    data: Bytes,
    /// Range starts whose bytes get one flipped bit.
    corrupt: Mutex<HashSet<u64>>,
    /// Range starts served one byte short.
    truncate: Mutex<HashSet<u64>>,
    with_checksums: bool,
    log: Mutex<Vec<(u64, u64)>>,
}

impl MemoryFetcher {
    pub(crate) fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            corrupt: Mutex::new(HashSet::new()),
            truncate: Mutex::new(HashSet::new()),
            with_checksums: true,
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn without_checksums(mut self) -> Self {
        self.with_checksums = false;
        self
    }

    pub(crate) fn corrupt_at(&self, start: u64) {
        self.corrupt.lock().unwrap().insert(start);
    }

    pub(crate) fn heal(&self) {
        self.corrupt.lock().unwrap().clear();
        self.truncate.lock().unwrap().clear();
    }

    pub(crate) fn truncate_at(&self, start: u64) {
        self.truncate.lock().unwrap().insert(start);
    }

    pub(crate) fn fetches(&self) -> Vec<(u64, u64)> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn fetch_sizes(&self) -> Vec<u64> {
        self.fetches().iter().map(|(s, e)| e - s).collect()
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn fetch_range(&self, start: u64, end: u64) -> TransferResult<FetchedRange> {
        self.log.lock().unwrap().push((start, end));
        let clean = self.data.slice(start as usize..end as usize);
        let checksum = self.with_checksums.then(|| hex_md5(&clean));

        let mut bytes = clean;
        if self.corrupt.lock().unwrap().contains(&start) && !bytes.is_empty() {
            let mut tampered = BytesMut::from(&bytes[..]);
            tampered[0] ^= 0x01;
            bytes = tampered.freeze();
        }
        if self.truncate.lock().unwrap().contains(&start) && !bytes.is_empty() {
            bytes = bytes.slice(..bytes.len() - 1);
        }
        Ok(FetchedRange { bytes, checksum })
    }
}
