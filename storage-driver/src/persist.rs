//! The persist protocol: a caller-supplied [`Persister`] produces content
//! into a bounded pipe while an upload task drains it into the medium.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use sha2::{Digest as _, Sha256};
use tokio::io::{self, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::driver::Writer;
use crate::error::{StorageError, StorageErrorKind};

/// Capacity of the in-memory pipe between a persister and its upload.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Error type returned by persisters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The result reported by a persister: the content digest and the number
/// of bytes written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Persisted {
    /// Content fingerprint computed by the persister, e.g. `sha256:<hex>`.
    pub digest: String,

    /// Number of bytes written to the sink.
    pub size: u64,
}

impl Persisted {
    /// Create a new persist result.
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        Self {
            digest: digest.into(),
            size,
        }
    }
}

/// Produces the content of an object, and its fingerprint.
///
/// The persister is the only source of truth for what gets written: a
/// backend streams whatever the persister writes to the sink, and returns
/// the digest and size the persister reports.
#[async_trait::async_trait]
pub trait Persister: Send {
    /// Write the content to `sink`, returning its digest and size.
    async fn persist(&mut self, sink: &mut Writer<'_>) -> Result<Persisted, BoxError>;
}

/// Error from [`Backend::persist`](crate::Backend::persist).
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The persister failed. Nothing was committed to the medium.
    #[error("persister failed: {0}")]
    Persister(#[source] BoxError),

    /// The persister succeeded but the medium write failed.
    ///
    /// The persister's result is kept for diagnostics only, the object
    /// does not exist in the medium and these values must not be trusted.
    #[error("upload failed after persisting {} bytes ({}): {source}", .persisted.size, .persisted.digest)]
    Upload {
        /// What the persister reported before the upload failed.
        persisted: Persisted,

        /// The medium error.
        #[source]
        source: StorageError,
    },

    /// The medium failed before the persister finished, or could not be
    /// prepared at all. Nothing was committed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PersistError {
    /// The storage error behind this failure, if the medium failed.
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            PersistError::Persister(_) => None,
            PersistError::Upload { source, .. } => Some(source),
            PersistError::Storage(error) => Some(error),
        }
    }
}

/// A persister which writes a fixed buffer, fingerprinting it with SHA-256.
#[derive(Debug, Clone)]
pub struct BytesPersister {
    data: Bytes,
}

impl BytesPersister {
    /// Create a persister for the given content.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// The digest this persister will report.
    pub fn digest(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(&self.data)))
    }
}

#[async_trait::async_trait]
impl Persister for BytesPersister {
    async fn persist(&mut self, sink: &mut Writer<'_>) -> Result<Persisted, BoxError> {
        sink.write_all(&self.data).await?;
        Ok(Persisted::new(self.digest(), self.data.len() as u64))
    }
}

/// The read side of the persist pipe, handed to an upload task.
///
/// End of stream is only reported once the persister has finished
/// successfully. If the persist call is abandoned, reads fail with
/// [`io::ErrorKind::Interrupted`] so that a truncated object is never
/// committed.
#[derive(Debug)]
pub struct UploadStream {
    reader: DuplexStream,
    cancel: CancellationToken,
    finished: bool,
}

impl UploadStream {
    fn new(reader: DuplexStream, cancel: CancellationToken) -> Self {
        Self {
            reader,
            cancel,
            finished: false,
        }
    }

    /// Read up to `limit` bytes, returning a shorter chunk only at the end
    /// of the stream, and `None` once the stream is exhausted.
    pub async fn next_chunk(&mut self, limit: usize) -> io::Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let mut buffer = BytesMut::with_capacity(limit.min(PIPE_CAPACITY * 4));
        while buffer.len() < limit {
            let remaining = limit - buffer.len();
            buffer.reserve(remaining.min(PIPE_CAPACITY));
            let mut limited = (&mut self.reader).take(remaining as u64);

            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(cancelled()),
                n = limited.read_buf(&mut buffer) => n?,
            };

            if n == 0 {
                // Cancellation happens before the pipe closes, so an end of
                // stream observed after it is an abandoned write.
                if self.cancel.is_cancelled() {
                    return Err(cancelled());
                }
                self.finished = true;
                break;
            }
        }

        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buffer.freeze()))
        }
    }

    /// Read the remainder of the stream into memory.
    pub async fn read_all(&mut self) -> io::Result<Bytes> {
        let mut data = BytesMut::new();
        while let Some(chunk) = self.next_chunk(PIPE_CAPACITY).await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }

    /// Convert into a stream of chunks of at most `chunk` bytes.
    pub fn into_stream(self, chunk: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync {
        futures::stream::try_unfold(self, move |mut upload| async move {
            let next = upload.next_chunk(chunk).await?;
            Ok::<_, io::Error>(next.map(|bytes| (bytes, upload)))
        })
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "persist was cancelled")
}

/// The write side of the persist pipe, as seen by the persister.
///
/// Shutting it down only flushes: the pipe is closed by [`pipe_upload`]
/// once the persister has returned successfully.
#[derive(Debug)]
struct PipeWriter {
    inner: DuplexStream,
    reader_gone: bool,
}

impl PipeWriter {
    fn new(inner: DuplexStream) -> Self {
        Self {
            inner,
            reader_gone: false,
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(error)) = &poll {
            if error.kind() == io::ErrorKind::BrokenPipe {
                this.reader_gone = true;
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// Run a persister concurrently with an upload of its output.
///
/// The upload is spawned as its own task and reads from a bounded pipe
/// which the persister writes into on the calling task, so the two sides
/// are ordered byte by byte and memory use stays bounded.
///
/// If the persister fails, the upload is cancelled before the pipe is
/// closed and the persister's error is returned. If the upload failed first
/// and the persister only saw the pipe break, the upload's error is returned
/// as [`PersistError::Storage`]. If the caller drops the returned future,
/// the upload is cancelled as well.
pub async fn pipe_upload<U, F>(
    engine: &'static str,
    persister: &mut (dyn Persister + '_),
    upload: U,
) -> Result<Persisted, PersistError>
where
    U: FnOnce(UploadStream) -> F,
    F: Future<Output = Result<(), StorageError>> + Send + 'static,
{
    let (sink, source) = io::duplex(PIPE_CAPACITY);
    let mut sink = PipeWriter::new(sink);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(upload(UploadStream::new(source, cancel.clone())).in_current_span());

    // Dropped before `sink`, so an abandoned call cancels before the pipe closes.
    let _guard = cancel.clone().drop_guard();

    let persisted = match persister.persist(&mut sink).await {
        Ok(persisted) => persisted,
        Err(error) => {
            cancel.cancel();
            let upload = task.await;
            tracing::error!(%error, "failed to write to upload pipe");
            return Err(match upload {
                // The upload gave up first, the persister only saw the pipe break.
                Ok(Err(upload))
                    if sink.reader_gone && upload.kind() != StorageErrorKind::Cancelled =>
                {
                    tracing::error!(%upload, "upload failed while persisting");
                    PersistError::Storage(upload)
                }
                Ok(Err(upload)) if upload.kind() != StorageErrorKind::Cancelled => {
                    tracing::warn!(%upload, "upload failed after persister error");
                    PersistError::Persister(error)
                }
                Err(join) => {
                    tracing::warn!(error = %join, "upload task failed after persister error");
                    PersistError::Persister(error)
                }
                _ => PersistError::Persister(error),
            });
        }
    };

    if let Err(error) = sink.inner.shutdown().await {
        tracing::warn!(%error, "failed to close upload pipe");
    }
    drop(sink);

    let result = match task.await {
        Ok(result) => result,
        Err(error) => Err(StorageError::builder(engine, StorageErrorKind::Other, error)
            .context("upload task")
            .build()),
    };

    match result {
        Ok(()) => Ok(persisted),
        Err(source) => {
            tracing::error!(error = %source, "failed to complete upload");
            Err(PersistError::Upload { persisted, source })
        }
    }
}
