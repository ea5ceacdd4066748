//! Streaming multipart upload.
//!
//! Bytes are buffered until a full chunk is available, then the chunk is
//! uploaded as the next numbered part on a spawned task. At most
//! `concurrency` parts are in flight; writers wait for a slot once that
//! limit is reached. The final short chunk, or a single empty part for a
//! zero-byte upload, is sent by [`UploadPipeline::finish`].

use crate::{
    errors::{TransferError, TransferResult},
    models::{ObjectState, Part, TransferObject, UploadOptions, UploadSession},
    services::{backend::ObjectBackend, checksum::hex_md5, chunk_planner::UploadChunkPlanner},
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut, stream::FuturesUnordered};
use std::{
    future::poll_fn,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Longest pause between two `describe` polls while waiting for `closed`.
pub const MAX_CLOSE_POLL_INTERVAL: Duration = Duration::from_secs(30);

const READER_CAPACITY: usize = 1024 * 1024;

type PartTask = JoinHandle<TransferResult<Part>>;

pub struct UploadPipeline<B: ObjectBackend + 'static> {
    backend: Arc<B>,
    object: TransferObject,
    options: UploadOptions,
    session: UploadSession,
    buffer: BytesMut,
    in_flight: FuturesUnordered<PartTask>,
    /// Final part has been handed off; no more bytes are accepted.
    finished: bool,
    /// A part failed; the upload cannot complete.
    failed: bool,
}

impl<B: ObjectBackend + 'static> UploadPipeline<B> {
    /// Create a new object and return a pipeline writing into it.
    pub async fn create(backend: Arc<B>, options: UploadOptions) -> TransferResult<Self> {
        let object = backend.create_object(&options).await?;
        Self::for_object(backend, object, options)
    }

    /// Attach to an existing open object.
    pub fn for_object(
        backend: Arc<B>,
        object: TransferObject,
        options: UploadOptions,
    ) -> TransferResult<Self> {
        if object.id.is_empty() {
            return Err(TransferError::InvalidArgument(
                "object id must be non-empty".into(),
            ));
        }
        if object.state != ObjectState::Open {
            return Err(TransferError::InvalidState(format!(
                "{} is {}, parts can only be added to open objects",
                object.id,
                object.state.as_str()
            )));
        }
        UploadChunkPlanner::new(options.chunk_size, options.part_limits)?;
        let session = UploadSession::new(options.chunk_size);
        Ok(Self {
            backend,
            object,
            options,
            session,
            buffer: BytesMut::new(),
            in_flight: FuturesUnordered::new(),
            finished: false,
            failed: false,
        })
    }

    pub fn object(&self) -> &TransferObject {
        &self.object
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Change the part size. Only allowed before the first byte is written.
    pub fn set_chunk_size(&mut self, chunk_size: usize) -> TransferResult<()> {
        let limits = self.options.part_limits;
        if chunk_size < limits.min_part_size {
            return Err(TransferError::InvalidArgument(format!(
                "chunk size {} below minimum part size {}",
                chunk_size, limits.min_part_size
            )));
        }
        UploadChunkPlanner::new(chunk_size, limits)?;
        if !self.session.set_chunk_size(chunk_size) {
            return Err(TransferError::InvalidState(
                "chunk size cannot change after data was written".into(),
            ));
        }
        Ok(())
    }

    /// Append bytes to the upload, dispatching every full chunk.
    pub async fn write(&mut self, mut data: &[u8]) -> TransferResult<()> {
        self.ensure_writable()?;
        while !data.is_empty() {
            let chunk_size = self.session.chunk_size();
            if self.buffer.len() + data.len() >= chunk_size {
                poll_fn(|cx| self.poll_capacity(cx)).await?;
            }
            let n = self.buffer_some(data);
            data = &data[n..];
            self.dispatch_if_full()?;
        }
        Ok(())
    }

    /// Upload an in-memory payload. Full chunks are sliced without copying
    /// when nothing is buffered yet.
    pub async fn upload_bytes(&mut self, data: Bytes) -> TransferResult<()> {
        self.ensure_writable()?;
        if !self.buffer.is_empty() {
            return self.write(&data).await;
        }
        let planner = UploadChunkPlanner::new(self.session.chunk_size(), self.options.part_limits)?;
        for range in planner.ranges(data.len() as u64) {
            let slice = data.slice(range.start as usize..range.end as usize);
            if (slice.len() as u64) < planner.chunk_size() {
                // Tail stays buffered until finish or more data arrives.
                self.write(&slice).await?;
                break;
            }
            poll_fn(|cx| self.poll_capacity(cx)).await?;
            self.session.record_accepted(slice.len());
            self.spawn_part(slice)?;
        }
        Ok(())
    }

    pub async fn upload_stream<S>(&mut self, stream: S) -> TransferResult<()>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            self.write(&chunk?).await?;
        }
        Ok(())
    }

    pub async fn upload_reader<R: AsyncRead>(&mut self, reader: R) -> TransferResult<()> {
        self.upload_stream(ReaderStream::with_capacity(reader, READER_CAPACITY))
            .await
    }

    /// Send the final part and wait for every in-flight part.
    ///
    /// A zero-byte upload sends one empty part unless the options require
    /// content. Idempotent.
    pub async fn finish(&mut self) -> TransferResult<()> {
        poll_fn(|cx| self.poll_finish(cx)).await
    }

    /// Ask the server to close the object.
    ///
    /// Fails with `InvalidState` while bytes are buffered or a part upload
    /// has not been collected; call [`finish`](Self::finish) first.
    pub async fn close(&mut self) -> TransferResult<()> {
        if self.failed {
            return Err(TransferError::InvalidState(
                "a part upload failed; the object cannot be closed".into(),
            ));
        }
        if !self.buffer.is_empty() || !self.in_flight.is_empty() {
            return Err(TransferError::InvalidState(format!(
                "cannot close {}: {} bytes buffered, {} parts in flight",
                self.object.id,
                self.buffer.len(),
                self.in_flight.len()
            )));
        }
        if self.options.require_content && self.session.bytes_accepted() == 0 {
            return Err(TransferError::InvalidState(format!(
                "cannot close {}: no data was written",
                self.object.id
            )));
        }
        if self.session.parts().is_empty() {
            return Err(TransferError::InvalidState(format!(
                "cannot close {}: no parts were uploaded",
                self.object.id
            )));
        }

        self.backend.close_object(&self.object.id).await?;
        self.finished = true;
        self.object.state = ObjectState::Closing;
        info!(
            object = %self.object.id,
            parts = self.session.parts().len(),
            bytes = self.session.bytes_accepted(),
            "upload complete, object closing"
        );
        Ok(())
    }

    /// Finish, close, and poll until the server reports `closed`.
    pub async fn close_and_wait(mut self) -> TransferResult<TransferObject> {
        if self.options.require_content && self.session.bytes_accepted() == 0 {
            return Err(TransferError::InvalidState(format!(
                "cannot close {}: no data was written",
                self.object.id
            )));
        }
        self.finish().await?;
        self.close().await?;
        self.wait_until_closed().await
    }

    async fn wait_until_closed(&mut self) -> TransferResult<TransferObject> {
        let started = Instant::now();
        let mut interval = self.options.close_poll_interval;
        loop {
            let description = self.backend.describe_object(&self.object.id).await?;
            match description.state {
                ObjectState::Closed => {
                    self.object.state = ObjectState::Closed;
                    info!(object = %self.object.id, "object closed");
                    return Ok(self.object.clone());
                }
                ObjectState::Closing => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.options.close_timeout {
                        return Err(TransferError::DeadlineExceeded { elapsed });
                    }
                    let remaining = self.options.close_timeout - elapsed;
                    debug!(object = %self.object.id, ?interval, "object still closing");
                    tokio::time::sleep(interval.min(remaining)).await;
                    interval = (interval * 2).min(MAX_CLOSE_POLL_INTERVAL);
                }
                ObjectState::Open => {
                    return Err(TransferError::InvalidState(format!(
                        "{} reported open after close was requested",
                        self.object.id
                    )));
                }
            }
        }
    }

    fn ensure_writable(&self) -> TransferResult<()> {
        if self.failed {
            return Err(TransferError::InvalidState(
                "a previous part upload failed".into(),
            ));
        }
        if self.finished {
            return Err(TransferError::InvalidState(
                "upload already finished; no more data accepted".into(),
            ));
        }
        Ok(())
    }

    /// Copy as much of `data` as fits in the current chunk.
    fn buffer_some(&mut self, data: &[u8]) -> usize {
        let room = self.session.chunk_size() - self.buffer.len();
        let n = room.min(data.len());
        self.buffer.extend_from_slice(&data[..n]);
        self.session.record_accepted(n);
        n
    }

    fn dispatch_if_full(&mut self) -> TransferResult<()> {
        if self.buffer.len() >= self.session.chunk_size() {
            let chunk = self.buffer.split().freeze();
            self.spawn_part(chunk)?;
        }
        Ok(())
    }

    fn spawn_part(&mut self, chunk: Bytes) -> TransferResult<()> {
        let max_parts = self.options.part_limits.max_parts;
        if self.session.parts_dispatched() >= max_parts {
            self.failed = true;
            return Err(TransferError::InvalidArgument(format!(
                "upload needs more than {} parts of {} bytes",
                max_parts,
                self.session.chunk_size()
            )));
        }

        let part = self.session.next_part(chunk.len(), hex_md5(&chunk));
        debug!(
            object = %self.object.id,
            index = part.index,
            size = part.size(),
            "dispatching part"
        );

        let backend = Arc::clone(&self.backend);
        let object_id = self.object.id.clone();
        self.in_flight.push(tokio::spawn(async move {
            backend
                .upload_part(&object_id, part.index, chunk, &part.md5)
                .await?;
            Ok(part)
        }));
        Ok(())
    }

    fn collect(&mut self, joined: Result<TransferResult<Part>, JoinError>) -> TransferResult<()> {
        let outcome = match joined {
            Ok(result) => result,
            Err(err) => Err(TransferError::Io(io::Error::other(err))),
        };
        match outcome {
            Ok(part) => {
                self.session.complete(part);
                Ok(())
            }
            Err(err) => {
                warn!(object = %self.object.id, error = %err, "part upload failed");
                self.failed = true;
                for task in self.in_flight.iter() {
                    task.abort();
                }
                Err(err)
            }
        }
    }

    /// Ready once fewer than `concurrency` parts are in flight.
    fn poll_capacity(&mut self, cx: &mut Context<'_>) -> Poll<TransferResult<()>> {
        while self.in_flight.len() >= self.options.concurrency {
            match ready!(self.in_flight.poll_next_unpin(cx)) {
                Some(joined) => self.collect(joined)?,
                None => break,
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Ready once every in-flight part has been collected.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<TransferResult<()>> {
        while let Some(joined) = ready!(self.in_flight.poll_next_unpin(cx)) {
            self.collect(joined)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<TransferResult<()>> {
        if self.failed {
            return Poll::Ready(Err(TransferError::InvalidState(
                "a previous part upload failed".into(),
            )));
        }
        if !self.finished {
            ready!(self.poll_capacity(cx))?;
            if !self.buffer.is_empty() {
                let chunk = self.buffer.split().freeze();
                self.spawn_part(chunk)?;
            } else if self.session.parts_dispatched() == 0 && !self.options.require_content {
                self.spawn_part(Bytes::new())?;
            }
            self.finished = true;
        }
        self.poll_drain(cx)
    }
}

impl<B: ObjectBackend + 'static> Drop for UploadPipeline<B> {
    fn drop(&mut self) {
        for task in self.in_flight.iter() {
            task.abort();
        }
    }
}

impl<B: ObjectBackend + 'static> AsyncWrite for UploadPipeline<B> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.ensure_writable()?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.buffer.len() + buf.len() >= this.session.chunk_size() {
            ready!(this.poll_capacity(cx))?;
        }
        let n = this.buffer_some(buf);
        this.dispatch_if_full()?;
        Poll::Ready(Ok(n))
    }

    /// Waits for in-flight parts; a partial chunk stays buffered.
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_finish(cx))?;
        Poll::Ready(Ok(()))
    }
}
