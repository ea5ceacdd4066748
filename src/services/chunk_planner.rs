//! Range planning for both transfer directions.
//!
//! Uploads cut the payload into fixed-size parts. Downloads start with a
//! small range and double the range size after a run of successful
//! fetches, up to a cap.

use crate::{
    errors::{TransferError, TransferResult},
    models::PartLimits,
};

pub const DEFAULT_INITIAL_RANGE: usize = 64 * 1024;
pub const DEFAULT_MAX_RANGE: usize = 16 * 1024 * 1024;
pub const DEFAULT_RAMP_EVERY: u32 = 4;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Value for an HTTP `Range` header; the end bound there is inclusive.
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Fixed-size part planner for uploads.
#[derive(Debug, Clone, Copy)]
pub struct UploadChunkPlanner {
    chunk_size: u64,
    limits: PartLimits,
}

impl UploadChunkPlanner {
    pub fn new(chunk_size: usize, limits: PartLimits) -> TransferResult<Self> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidArgument(
                "chunk size must be positive".into(),
            ));
        }
        if chunk_size > limits.max_part_size {
            return Err(TransferError::InvalidArgument(format!(
                "chunk size {} exceeds maximum part size {}",
                chunk_size, limits.max_part_size
            )));
        }
        Ok(Self {
            chunk_size: chunk_size as u64,
            limits,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Parts needed for `total` bytes. An empty payload still takes one part.
    pub fn part_count(&self, total: u64) -> u64 {
        total.div_ceil(self.chunk_size).max(1)
    }

    /// Reject payloads that would need more parts than the platform allows.
    pub fn check_total(&self, total: u64) -> TransferResult<()> {
        let parts = self.part_count(total);
        if parts > u64::from(self.limits.max_parts) {
            return Err(TransferError::InvalidArgument(format!(
                "{} bytes need {} parts of {} bytes, more than the limit of {}",
                total, parts, self.chunk_size, self.limits.max_parts
            )));
        }
        Ok(())
    }

    /// Ranges covering `[0, total)`; a single empty range when `total` is 0.
    pub fn ranges(&self, total: u64) -> UploadRanges {
        UploadRanges {
            next: 0,
            total,
            chunk_size: self.chunk_size,
            emitted_empty: false,
        }
    }
}

/// Iterator returned by [`UploadChunkPlanner::ranges`].
#[derive(Debug, Clone)]
pub struct UploadRanges {
    next: u64,
    total: u64,
    chunk_size: u64,
    emitted_empty: bool,
}

impl Iterator for UploadRanges {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        if self.total == 0 {
            if self.emitted_empty {
                return None;
            }
            self.emitted_empty = true;
            return Some(ByteRange::new(0, 0));
        }
        if self.next >= self.total {
            return None;
        }
        let start = self.next;
        let end = (start + self.chunk_size).min(self.total);
        self.next = end;
        Some(ByteRange::new(start, end))
    }
}

/// Download range sizing.
///
/// The size doubles after every `ramp_every` successful fetches and never
/// exceeds `max`. Failures leave both the size and the success count alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRamp {
    current: usize,
    max: usize,
    ramp_every: u32,
    successes: u32,
}

impl Default for DownloadRamp {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RANGE, DEFAULT_MAX_RANGE, DEFAULT_RAMP_EVERY)
    }
}

impl DownloadRamp {
    pub fn new(initial: usize, max: usize, ramp_every: u32) -> Self {
        let max = max.max(1);
        Self {
            current: initial.clamp(1, max),
            max,
            ramp_every: ramp_every.max(1),
            successes: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Next range starting at `offset` of an object of `length` bytes.
    pub fn next_range(&self, offset: u64, length: u64) -> ByteRange {
        let end = offset.saturating_add(self.current as u64).min(length);
        ByteRange::new(offset, end.max(offset))
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
        if self.successes >= self.ramp_every {
            self.successes = 0;
            self.current = self.current.saturating_mul(2).min(self.max);
        }
    }
}
