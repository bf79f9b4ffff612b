use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::TryStreamExt as _;
use http::{header, Method, StatusCode};
use http_body::Frame;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt as _, Empty, StreamBody};
use mime::Mime;
use tokio::io;
use tokio_util::io::ReaderStream;

use crate::error::{StorageError, StorageErrorKind};
use crate::persist::{PersistError, Persisted, Persister};

/// A writer stream handed to a [`Persister`].
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + 'w;

/// A reader stream for object contents, positioned at the first byte.
pub type FetchReader = dyn io::AsyncRead + Unpin + Send + 'static;

/// Response body produced by [`Backend::serve`].
pub type ServeBody = UnsyncBoxBody<Bytes, io::Error>;

/// Prefix under which layer blobs are stored, keyed by digest.
///
/// Layer producers name objects with this prefix, so it must not change.
pub const LAYERS_PREFIX: &str = "layers";

/// The object path for a layer blob with the given digest.
pub fn layer_path(digest: &str) -> Utf8PathBuf {
    Utf8Path::new(LAYERS_PREFIX).join(digest)
}

/// A storage backend for layer blobs.
///
/// One backend is constructed per process from configuration, and shared
/// by all requests. Callers are only ever polymorphic over this trait.
#[async_trait::async_trait]
pub trait Backend: fmt::Debug + Send + Sync {
    /// A human-readable identifier for this backend, e.g. the medium
    /// and bucket name.
    fn name(&self) -> &str;

    /// Store an object at `path`, with contents produced by the persister.
    ///
    /// The returned digest and size are exactly those reported by the
    /// persister, the backend never re-hashes content.
    async fn persist(
        &self,
        path: &Utf8Path,
        content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError>;

    /// Open a stream to read the object at `path`.
    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError>;

    /// Move an object from `old` to `new`.
    ///
    /// On success the object exists at `new`. The object at `old` may
    /// survive when the medium has no rename primitive and the cleanup
    /// after copying fails.
    async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError>;

    /// Build the response for a client request to download the layer
    /// with the given digest.
    async fn serve(
        &self,
        digest: &str,
        request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError>;
}

/// Respond with a `303 See Other` to a (usually signed) URL.
pub fn redirect_response(
    engine: &'static str,
    location: &str,
) -> Result<http::Response<ServeBody>, StorageError> {
    http::Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::LOCATION, location)
        .body(empty_body())
        .map_err(|err| {
            StorageError::builder(engine, StorageErrorKind::Signing, err)
                .context("redirect location")
                .build()
        })
}

/// Respond with the object bytes, or only headers for a `HEAD` request.
pub fn stream_response(
    engine: &'static str,
    request: &http::request::Parts,
    reader: Box<FetchReader>,
    size: u64,
) -> Result<http::Response<ServeBody>, StorageError> {
    let body = if request.method == Method::HEAD {
        empty_body()
    } else {
        StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed_unsync()
    };

    http::Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            mime::APPLICATION_OCTET_STREAM.as_ref(),
        )
        .header(header::CONTENT_LENGTH, size)
        .body(body)
        .map_err(|err| {
            StorageError::builder(engine, StorageErrorKind::Other, err)
                .context("build layer response")
                .build()
        })
}

fn empty_body() -> ServeBody {
    Empty::<Bytes>::new()
        .map_err(|never| -> io::Error { match never {} })
        .boxed_unsync()
}

#[async_trait::async_trait]
impl<B> Backend for Arc<B>
where
    B: ?Sized + Backend,
{
    fn name(&self) -> &str {
        self.deref().name()
    }

    async fn persist(
        &self,
        path: &Utf8Path,
        content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        self.deref().persist(path, content_type, persister).await
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError> {
        self.deref().fetch(path).await
    }

    async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError> {
        self.deref().move_object(old, new).await
    }

    async fn serve(
        &self,
        digest: &str,
        request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError> {
        self.deref().serve(digest, request).await
    }
}
