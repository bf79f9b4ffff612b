//! # Storage backends
//!
//! Configuration and unification for the layer storage backends. Exactly one
//! backend is built per process from a [`StorageConfig`], and shared as a
//! [`Storage`] handle.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use mime::Mime;
use serde::Deserialize;
use tokio::io::{self, AsyncWriteExt as _};

pub(crate) mod filesystem;
#[cfg(feature = "gcs")]
pub(crate) mod gcs;
pub(crate) mod memory;
#[cfg(feature = "s3")]
pub(crate) mod s3;

#[doc(inline)]
pub use filesystem::FilesystemBackend;

#[cfg(feature = "gcs")]
#[doc(inline)]
pub use gcs::{GcsBackend, GcsConfig};

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "s3")]
#[doc(inline)]
pub use s3::{S3Backend, S3Config};

#[doc(inline)]
pub use storage_driver::{
    Backend, PersistError, Persisted, Persister, ServeBody, StorageError, StorageErrorKind,
};

/// Which storage backend to use, and how to connect to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Objects kept in process memory.
    Memory,

    /// Objects kept as files below a root directory.
    Filesystem {
        /// Root directory, created if missing.
        path: Utf8PathBuf,
    },

    /// Amazon S3 or an S3-compatible store.
    #[cfg(feature = "s3")]
    S3(S3Config),

    /// Google Cloud Storage.
    #[cfg(feature = "gcs")]
    Gcs(GcsConfig),
}

impl StorageConfig {
    /// Build the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let storage: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            StorageConfig::Filesystem { path } => FilesystemBackend::open(path).await?.into(),
            #[cfg(feature = "s3")]
            StorageConfig::S3(config) => S3Backend::new(config).await.into(),
            #[cfg(feature = "gcs")]
            StorageConfig::Gcs(config) => GcsBackend::new(config).await?.into(),
        };
        tracing::info!(backend = storage.name(), "storage backend ready");
        Ok(storage)
    }
}

/// Shared handle to the process's storage backend.
#[derive(Debug, Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
}

impl<B> From<B> for Storage
where
    B: Backend + 'static,
{
    fn from(value: B) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a backend.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Human readable name of the backend, e.g. `S3 (bucket)`.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// The shared backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Persist the persister's output at `path`. See [`Backend::persist`].
    #[tracing::instrument(skip(self, persister), fields(backend = self.backend.name()))]
    pub async fn persist(
        &self,
        path: &Utf8Path,
        content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        let persisted = self.backend.persist(path, content_type, persister).await?;
        tracing::debug!(%path, digest = %persisted.digest, size = persisted.size, "persisted object");
        Ok(persisted)
    }

    /// Open an object for reading.
    #[tracing::instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn fetch(
        &self,
        path: &Utf8Path,
    ) -> Result<Box<storage_driver::FetchReader>, StorageError> {
        self.backend.fetch(path).await
    }

    /// Copy an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(backend = self.backend.name()))]
    pub async fn download<W>(&self, path: &Utf8Path, writer: &mut W) -> Result<u64, StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut reader = self.backend.fetch(path).await?;
        let copied = io::copy(&mut reader, writer).await.map_err(|err| {
            StorageError::io("storage", err)
                .path(path.as_str())
                .context("download")
                .build()
        })?;
        writer.flush().await.map_err(|err| {
            StorageError::io("storage", err)
                .path(path.as_str())
                .context("flush download")
                .build()
        })?;
        Ok(copied)
    }

    /// Rename an object.
    #[tracing::instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError> {
        tracing::trace!(%old, %new, "moving object");
        self.backend.move_object(old, new).await
    }

    /// Respond to a client request for the layer with `digest`.
    #[tracing::instrument(skip(self, request), fields(backend = self.backend.name(), method = %request.method))]
    pub async fn serve(
        &self,
        digest: &str,
        request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError> {
        self.backend.serve(digest, request).await
    }
}

#[cfg(test)]
mod tests {
    use storage_driver::BytesPersister;

    use super::*;

    static_assertions::assert_impl_all!(Storage: Send, Sync, Clone);

    #[test]
    fn config_selects_variant() {
        let config: StorageConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));

        let config: StorageConfig =
            serde_json::from_str(r#"{"filesystem": {"path": "/srv/layers"}}"#).unwrap();
        assert!(matches!(
            config,
            StorageConfig::Filesystem { path } if path.as_str() == "/srv/layers"
        ));
    }

    #[tokio::test]
    async fn build_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("layers")).unwrap();

        let storage = StorageConfig::Filesystem { path: path.clone() }
            .build()
            .await
            .unwrap();

        assert!(storage.name().starts_with("Filesystem ("));
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn download_copies_object() {
        let storage = StorageConfig::Memory.build().await.unwrap();
        let mut persister = BytesPersister::new(&b"tarball"[..]);
        storage
            .persist(
                Utf8Path::new("layers/sha256:1"),
                &mime::APPLICATION_OCTET_STREAM,
                &mut persister,
            )
            .await
            .unwrap();

        let mut buf = Vec::new();
        let copied = storage
            .download(Utf8Path::new("layers/sha256:1"), &mut buf)
            .await
            .unwrap();
        assert_eq!(copied, 7);
        assert_eq!(buf, b"tarball");
    }
}
