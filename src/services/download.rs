//! Sequential, checksum-verified reads over a closed object.
//!
//! Bytes are fetched in ranges sized by a [`DownloadRamp`] and never span a
//! part boundary. A range served with a `Content-MD5` is checked against
//! it. A range served without one is buffered up to its whole part, and the
//! part is checked against the MD5 recorded at upload. Nothing reaches the
//! caller unverified; a failed check fails the read and leaves both the
//! cursor and the ramp where they were.

use crate::{
    errors::{TransferError, TransferResult},
    models::{ObjectDescription, ObjectState},
    services::{
        backend::{FetchedRange, ObjectBackend, RangeFetcher},
        checksum::hex_md5,
        chunk_planner::{
            ByteRange, DEFAULT_INITIAL_RANGE, DEFAULT_MAX_RANGE, DEFAULT_RAMP_EVERY, DownloadRamp,
        },
    },
};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

const READ_TO_END_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub initial_range: usize,
    pub max_range: usize,
    /// Successful fetches between two doublings of the range size.
    pub ramp_every: u32,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            initial_range: DEFAULT_INITIAL_RANGE,
            max_range: DEFAULT_MAX_RANGE,
            ramp_every: DEFAULT_RAMP_EVERY,
        }
    }
}

impl DownloadOptions {
    fn ramp(&self) -> DownloadRamp {
        DownloadRamp::new(self.initial_range, self.max_range, self.ramp_every)
    }
}

/// Read position plus ramp state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCursor {
    /// Bytes handed to the caller so far.
    pub position: u64,
    pub ramp: DownloadRamp,
}

/// Byte span and recorded checksum of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartSpan {
    start: u64,
    end: u64,
    md5: Option<String>,
}

pub struct DownloadStream<F: RangeFetcher> {
    fetcher: F,
    object_id: String,
    length: u64,
    parts: Vec<PartSpan>,
    cursor: DownloadCursor,
    options: DownloadOptions,
    /// Verified bytes starting at `cursor.position` not yet delivered.
    pending: Bytes,
}

impl<F: RangeFetcher> DownloadStream<F> {
    /// Describe `object_id` and open a stream over it.
    pub async fn open<B: ObjectBackend + ?Sized>(
        backend: &B,
        object_id: &str,
        fetcher: F,
        options: DownloadOptions,
    ) -> TransferResult<Self> {
        if object_id.is_empty() {
            return Err(TransferError::InvalidArgument(
                "object id must be non-empty".into(),
            ));
        }
        let description = backend.describe_object(object_id).await?;
        Self::from_description(&description, fetcher, options)
    }

    pub fn from_description(
        description: &ObjectDescription,
        fetcher: F,
        options: DownloadOptions,
    ) -> TransferResult<Self> {
        if description.state != ObjectState::Closed {
            return Err(TransferError::InvalidState(format!(
                "{} is {}, only closed objects can be downloaded",
                description.id,
                description.state.as_str()
            )));
        }
        let parts: Vec<PartSpan> = description
            .part_ranges()
            .into_iter()
            .filter(|(_, start, end, _)| end > start)
            .map(|(_, start, end, md5)| PartSpan { start, end, md5 })
            .collect();
        let length = match description.size {
            Some(size) => size,
            None => parts.last().map_or(0, |p| p.end),
        };
        debug!(object = %description.id, length, parts = parts.len(), "opened download");
        Ok(Self {
            fetcher,
            object_id: description.id.clone(),
            length,
            parts,
            cursor: DownloadCursor {
                position: 0,
                ramp: options.ramp(),
            },
            options,
            pending: Bytes::new(),
        })
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.cursor.position
    }

    pub fn cursor(&self) -> &DownloadCursor {
        &self.cursor
    }

    /// Read into `buf`.
    ///
    /// Returns `Some(0)` for an empty buffer and `None` once the object is
    /// exhausted. A read may span several fetched ranges. If a later range
    /// fails after some bytes were copied, those bytes are returned and the
    /// failure surfaces on the next call.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransferResult<Option<usize>> {
        if buf.is_empty() {
            return Ok(Some(0));
        }
        if self.remaining() == 0 {
            return Ok(None);
        }

        let mut copied = 0;
        while copied < buf.len() && self.remaining() > 0 {
            if self.pending.is_empty() {
                match self.fill().await {
                    Ok(()) => {}
                    Err(err) if copied > 0 => {
                        debug!(error = %err, "deferring range failure to the next read");
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            let n = (buf.len() - copied).min(self.pending.len());
            buf[copied..copied + n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            self.cursor.position += n as u64;
            copied += n;
        }
        Ok(Some(copied))
    }

    /// Drain the rest of the object.
    pub async fn read_to_end(&mut self) -> TransferResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining().min(DEFAULT_MAX_RANGE as u64) as usize);
        let mut buf = vec![0u8; READ_TO_END_BUFFER];
        while let Some(n) = self.read(&mut buf).await? {
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Fetch `[start, end)` independently of the stream position.
    ///
    /// `end` defaults to the object length. Uses a fresh ramp.
    pub async fn download_range(&self, start: u64, end: Option<u64>) -> TransferResult<Bytes> {
        let end = end.unwrap_or(self.length);
        if start > end || end > self.length {
            return Err(TransferError::InvalidArgument(format!(
                "range {}..{} outside object of {} bytes",
                start, end, self.length
            )));
        }

        let mut ramp = self.options.ramp();
        let mut out = BytesMut::with_capacity((end - start) as usize);
        let mut offset = start;
        while offset < end {
            let bytes = self.fetch_verified(&mut ramp, offset, end).await?;
            offset += bytes.len() as u64;
            out.extend_from_slice(&bytes);
        }
        Ok(out.freeze())
    }

    fn remaining(&self) -> u64 {
        self.length - self.cursor.position
    }

    async fn fill(&mut self) -> TransferResult<()> {
        let mut ramp = self.cursor.ramp;
        let bytes = self
            .fetch_verified(&mut ramp, self.cursor.position, self.length)
            .await
            .inspect_err(|err| {
                warn!(object = %self.object_id, error = %err, "range failed verification");
            })?;
        self.cursor.ramp = ramp;
        self.pending = bytes;
        Ok(())
    }

    fn part_at(&self, offset: u64) -> Option<&PartSpan> {
        self.parts
            .iter()
            .find(|p| p.start <= offset && offset < p.end)
    }

    /// Verified bytes starting at `offset`, ending at or before `limit`.
    async fn fetch_verified(
        &self,
        ramp: &mut DownloadRamp,
        offset: u64,
        limit: u64,
    ) -> TransferResult<Bytes> {
        let part = self.part_at(offset);
        let mut range = ramp.next_range(offset, limit);
        if let Some(part) = part {
            range.end = range.end.min(part.end);
        }
        debug!(
            object = %self.object_id,
            start = range.start,
            end = range.end,
            "fetching range"
        );
        let fetched = self.fetcher.fetch_range(range.start, range.end).await?;
        if fetched.checksum.is_some() {
            let bytes = verify(range, fetched)?;
            ramp.record_success();
            return Ok(bytes);
        }

        let Some((part, expected)) = part.and_then(|p| p.md5.as_deref().map(|m| (p, m))) else {
            return Err(TransferError::Protocol(format!(
                "no checksum available for bytes {}..{} of {}",
                range.start, range.end, self.object_id
            )));
        };
        let first = verify(range, fetched)?;
        ramp.record_success();

        debug!(
            object = %self.object_id,
            start = part.start,
            end = part.end,
            "range has no checksum, verifying whole part"
        );
        let mut whole = BytesMut::with_capacity((part.end - part.start) as usize);
        self.fetch_span(ramp, part.start, range.start, &mut whole).await?;
        whole.extend_from_slice(&first);
        self.fetch_span(ramp, range.end, part.end, &mut whole).await?;

        let actual = hex_md5(&whole);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(TransferError::Integrity {
                start: part.start,
                end: part.end,
                expected: expected.to_string(),
                actual,
            });
        }
        let whole = whole.freeze();
        let end = part.end.min(limit);
        Ok(whole.slice((offset - part.start) as usize..(end - part.start) as usize))
    }

    /// Append `[start, end)` to `out` in ramp-sized ranges.
    async fn fetch_span(
        &self,
        ramp: &mut DownloadRamp,
        start: u64,
        end: u64,
        out: &mut BytesMut,
    ) -> TransferResult<()> {
        let mut offset = start;
        while offset < end {
            let range = ramp.next_range(offset, end);
            let fetched = self.fetcher.fetch_range(range.start, range.end).await?;
            out.extend_from_slice(&verify(range, fetched)?);
            ramp.record_success();
            offset = range.end;
        }
        Ok(())
    }
}

/// Check a fetched range's length and, when present, its MD5.
fn verify(range: ByteRange, fetched: FetchedRange) -> TransferResult<Bytes> {
    let FetchedRange { bytes, checksum } = fetched;
    if bytes.len() as u64 != range.len() {
        return Err(TransferError::Integrity {
            start: range.start,
            end: range.end,
            expected: format!("{} bytes", range.len()),
            actual: format!("{} bytes", bytes.len()),
        });
    }
    if let Some(expected) = checksum {
        let actual = hex_md5(&bytes);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(TransferError::Integrity {
                start: range.start,
                end: range.end,
                expected,
                actual,
            });
        }
    }
    Ok(bytes)
}
