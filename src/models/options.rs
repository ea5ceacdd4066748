//! Construction-time options for uploads.
//!
//! `UploadOptions` is immutable once built. The builder records every setter
//! call and `build()` rejects a field that was set twice, so conflicting
//! configuration is caught before any byte leaves the process.

use crate::errors::{TransferError, TransferResult};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CLOSE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// Platform limits on part sizes and counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartLimits {
    /// Smallest allowed part, except for the final one.
    pub min_part_size: usize,
    pub max_part_size: usize,
    pub max_parts: u32,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 5 * 1024 * 1024 * 1024,
            max_parts: 10_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub name: Option<String>,
    pub project: Option<String>,
    pub folder: Option<String>,
    pub media_type: Option<String>,
    pub chunk_size: usize,
    pub concurrency: usize,
    pub part_limits: PartLimits,
    pub require_content: bool,
    pub close_poll_interval: Duration,
    pub close_timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            name: None,
            project: None,
            folder: None,
            media_type: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            part_limits: PartLimits::default(),
            require_content: false,
            close_poll_interval: DEFAULT_CLOSE_POLL_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl UploadOptions {
    pub fn builder() -> UploadOptionsBuilder {
        UploadOptionsBuilder::default()
    }
}

#[derive(Default, Debug)]
pub struct UploadOptionsBuilder {
    options: UploadOptions,
    set: Vec<&'static str>,
    conflict: Option<&'static str>,
}

impl UploadOptionsBuilder {
    fn mark(&mut self, field: &'static str) {
        if self.set.contains(&field) {
            self.conflict.get_or_insert(field);
        } else {
            self.set.push(field);
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.mark("name");
        self.options.name = Some(name.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.mark("project");
        self.options.project = Some(project.into());
        self
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.mark("folder");
        self.options.folder = Some(folder.into());
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.mark("media_type");
        self.options.media_type = Some(media_type.into());
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.mark("chunk_size");
        self.options.chunk_size = chunk_size;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.mark("concurrency");
        self.options.concurrency = concurrency;
        self
    }

    pub fn part_limits(mut self, limits: PartLimits) -> Self {
        self.mark("part_limits");
        self.options.part_limits = limits;
        self
    }

    pub fn require_content(mut self, require: bool) -> Self {
        self.mark("require_content");
        self.options.require_content = require;
        self
    }

    pub fn close_poll_interval(mut self, interval: Duration) -> Self {
        self.mark("close_poll_interval");
        self.options.close_poll_interval = interval;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.mark("close_timeout");
        self.options.close_timeout = timeout;
        self
    }

    pub fn build(self) -> TransferResult<UploadOptions> {
        if let Some(field) = self.conflict {
            return Err(TransferError::SetMoreThanOnce(field));
        }
        let opts = self.options;
        let limits = opts.part_limits;
        if opts.chunk_size == 0
            || opts.chunk_size < limits.min_part_size
            || opts.chunk_size > limits.max_part_size
        {
            return Err(TransferError::InvalidArgument(format!(
                "chunk size {} outside part limits [{}, {}]",
                opts.chunk_size, limits.min_part_size, limits.max_part_size
            )));
        }
        if opts.concurrency == 0 {
            return Err(TransferError::InvalidArgument(
                "concurrency must be at least 1".into(),
            ));
        }
        if let Some(folder) = &opts.folder
            && !folder.starts_with('/')
        {
            return Err(TransferError::InvalidArgument(format!(
                "folder `{}` must be an absolute path",
                folder
            )));
        }
        Ok(opts)
    }
}
