//! Represents multipart upload sessions and parts.

use serde::{Deserialize, Serialize};

/// A single uploaded part of a multipart object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// Part number (1-based).
    pub index: u32,

    /// First byte of the part within the object.
    pub start: u64,

    /// One past the last byte of the part.
    pub end: u64,

    /// Hex MD5 of the part payload.
    pub md5: String,
}

impl Part {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Client-side bookkeeping for one upload.
///
/// Owned by exactly one pipeline; the chunk size is frozen once the first
/// byte has been accepted.
#[derive(Clone, Debug)]
pub struct UploadSession {
    chunk_size: usize,
    next_index: u32,
    bytes_accepted: u64,
    bytes_dispatched: u64,
    parts: Vec<Part>,
}

impl UploadSession {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            next_index: 1,
            bytes_accepted: 0,
            bytes_dispatched: 0,
            parts: Vec::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Change the chunk size; refused once any byte was accepted.
    pub fn set_chunk_size(&mut self, chunk_size: usize) -> bool {
        if self.bytes_accepted > 0 {
            return false;
        }
        self.chunk_size = chunk_size;
        true
    }

    pub fn record_accepted(&mut self, n: usize) {
        self.bytes_accepted += n as u64;
    }

    pub fn bytes_accepted(&self) -> u64 {
        self.bytes_accepted
    }

    pub fn parts_dispatched(&self) -> u32 {
        self.next_index - 1
    }

    /// Assign the next sequence number and byte range to a payload.
    pub fn next_part(&mut self, len: usize, md5: String) -> Part {
        let start = self.bytes_dispatched;
        let end = start + len as u64;
        let part = Part {
            index: self.next_index,
            start,
            end,
            md5,
        };
        self.next_index += 1;
        self.bytes_dispatched = end;
        part
    }

    /// Record a part the server acknowledged.
    pub fn complete(&mut self, part: Part) {
        let pos = self
            .parts
            .binary_search_by_key(&part.index, |p| p.index)
            .unwrap_or_else(|pos| pos);
        self.parts.insert(pos, part);
    }

    /// Acknowledged parts in index order.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }
}
