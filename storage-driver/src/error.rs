use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the storage medium which produced them.
///
/// The HTTP layer uses this to decide what a client sees, without
/// inspecting messages or knowing backend-specific error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object or bucket was not found.
    ///
    /// **Retryable:** No - the object doesn't exist.
    NotFound,

    /// The configured credentials do not permit the operation.
    ///
    /// **Retryable:** No - unless credentials are updated.
    PermissionDenied,

    /// The operation failed due to I/O errors (network, disk, etc.).
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    Io,

    /// The storage service is temporarily unavailable or timed out.
    ///
    /// **Retryable:** Yes - the service should recover.
    ServiceUnavailable,

    /// The request was rejected by the medium as invalid.
    ///
    /// **Retryable:** No - the request itself is invalid.
    InvalidRequest,

    /// A time-limited URL for the object could not be signed.
    ///
    /// **Retryable:** No - usually a credentials problem.
    Signing,

    /// The operation was cancelled before it could complete.
    ///
    /// **Retryable:** Yes - nothing was committed.
    Cancelled,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// This layer never retries on its own, the answer is advisory for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable
                | StorageErrorKind::Cancelled
                | StorageErrorKind::Io // May be transient
        )
    }

    /// Classify an I/O error from a local medium.
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut => StorageErrorKind::ServiceUnavailable,
            io::ErrorKind::Interrupted => StorageErrorKind::Cancelled,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Signing => write!(f, "signing failed"),
            StorageErrorKind::Cancelled => write!(f, "cancelled"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

/// Where an error was raised. The backtrace is only captured when
/// `RUST_BACKTRACE` is set.
#[derive(Debug)]
struct ErrorTrace {
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

/// Error produced by a storage backend.
///
/// Carries the semantic [`StorageErrorKind`], the engine which produced it,
/// and whatever bucket / object path context was available. Backends never
/// retry; these fields exist so that a failure can be diagnosed from a log
/// line alone.
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "S3",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such key"),
/// )
/// .bucket("layers-bucket")
/// .path("layers/sha256:abcd")
/// .build();
///
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Start an error of `kind` from `engine`, caused by `error`.
    ///
    /// Traces are captured here, so the builder should be finished where
    /// the failure is observed.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder(StorageError {
            kind,
            engine,
            bucket: None,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace {
                backtrace: Backtrace::capture(),
                span_trace: SpanTrace::capture(),
            }),
        })
    }

    /// Create a storage error from an I/O error, classifying the kind from
    /// the I/O error kind.
    pub fn io(engine: &'static str, error: io::Error) -> StorageErrorBuilder {
        let kind = StorageErrorKind::from_io(&error);
        StorageError::builder(engine, kind, error)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns whether the object was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, StorageErrorKind::NotFound)
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Adds bucket, path and context to a [`StorageError`].
#[derive(Debug)]
pub struct StorageErrorBuilder(StorageError);

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.0.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.0.path = Some(path.into());
        self
    }

    /// Describe the operation which failed.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.0.context = Some(context.into());
        self
    }

    /// Finish the error.
    pub fn build(self) -> StorageError {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let error = StorageError::builder(
            "S3",
            StorageErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, "no such key"),
        )
        .bucket("layers")
        .path("layers/sha256:abcd")
        .context("head object")
        .build();

        assert_eq!(
            error.to_string(),
            "Storage error [not found] from S3 (bucket: layers) (path: layers/sha256:abcd) (head object): no such key"
        );
        assert!(error.is_not_found());
        assert!(!error.is_retryable());
    }

    #[test]
    fn io_kinds_are_classified() {
        let error = StorageError::io(
            "filesystem",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        )
        .build();
        assert_eq!(error.kind(), StorageErrorKind::PermissionDenied);

        let error = StorageError::io("filesystem", io::Error::other("disk on fire")).build();
        assert_eq!(error.kind(), StorageErrorKind::Io);
        assert!(error.is_retryable());
    }

    #[test]
    fn source_is_kept_without_context() {
        let error = StorageError::builder("memory", StorageErrorKind::Other, "boom").build();

        assert_eq!(error.engine(), "memory");
        assert!(error.bucket().is_none() && error.path().is_none());
        assert_eq!(error.to_string(), "Storage error [other error] from memory: boom");
        assert_eq!(StdError::source(&error).unwrap().to_string(), "boom");
    }
}
