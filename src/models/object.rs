//! Represents a binary object (file) on the platform and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a data object.
///
/// Objects accept parts only while `Open`; `close` moves them to `Closing`
/// and the server finishes the transition to `Closed` asynchronously.
/// Downloads are only allowed once the object is `Closed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    Open,
    Closing,
    Closed,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Open => "open",
            ObjectState::Closing => "closing",
            ObjectState::Closed => "closed",
        }
    }
}

/// Client-side handle on a platform object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferObject {
    /// Object identifier, e.g. `file-B0123456789ABCDEF0123456`.
    pub id: String,

    /// Project the object lives in, when known.
    pub project: Option<String>,

    /// Last state observed by this client.
    pub state: ObjectState,
}

impl TransferObject {
    pub fn new(id: impl Into<String>, project: Option<String>, state: ObjectState) -> Self {
        Self {
            id: id.into(),
            project,
            state,
        }
    }
}

/// Per-part entry of a `describe` response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartDescription {
    #[serde(default)]
    pub state: Option<String>,

    pub size: u64,

    /// Hex MD5 recorded by the server when the part was uploaded.
    #[serde(default)]
    pub md5: Option<String>,
}

/// Subset of a `describe` response used by the transfer engine.
///
/// Fields the engine does not know are ignored, so newer servers can add
/// metadata without breaking older clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescription {
    pub id: String,

    #[serde(default)]
    pub project: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    pub state: ObjectState,

    /// Total size in bytes; only meaningful once closed.
    #[serde(default)]
    pub size: Option<u64>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub modified: Option<DateTime<Utc>>,

    /// Uploaded parts keyed by their 1-based index rendered as a string.
    #[serde(default)]
    pub parts: BTreeMap<String, PartDescription>,
}

impl ObjectDescription {
    pub fn to_object(&self) -> TransferObject {
        TransferObject::new(self.id.clone(), self.project.clone(), self.state)
    }

    /// Parts ordered by index with their absolute `[start, end)` offsets.
    ///
    /// Keys that are not numeric are skipped.
    pub fn part_ranges(&self) -> Vec<(u32, u64, u64, Option<String>)> {
        let mut indexed: Vec<(u32, &PartDescription)> = self
            .parts
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|i| (i, v)))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);

        let mut offset = 0u64;
        let mut out = Vec::with_capacity(indexed.len());
        for (index, part) in indexed {
            let end = offset + part.size;
            out.push((index, offset, end, part.md5.clone()));
            offset = end;
        }
        out
    }
}
