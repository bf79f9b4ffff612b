use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use eyre::eyre;
use mime::Mime;
use tokio::io::AsyncWriteExt;

use storage_driver::{
    layer_path, stream_response, Backend, FetchReader, PersistError, Persisted, Persister,
    ServeBody, StorageError, StorageErrorKind,
};

const FILESYSTEM_STORAGE_NAME: &str = "filesystem";

/// Storage backend which keeps objects as files below a root directory.
///
/// Persisting writes directly to disk (there is no remote leg), and moves
/// are atomic renames.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: Utf8PathBuf,
    name: String,
}

impl FilesystemBackend {
    /// Open a filesystem backend rooted at `root`, creating the directory
    /// if required.
    pub async fn open(root: impl AsRef<Utf8Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await.map_err(|err| {
            StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(root.as_str())
                .context("create storage root")
                .build()
        })?;

        let root = tokio::fs::canonicalize(root).await.map_err(|err| {
            StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(root.as_str())
                .context("resolve storage root")
                .build()
        })?;
        let root = Utf8PathBuf::try_from(root).map_err(|err| {
            StorageError::builder(FILESYSTEM_STORAGE_NAME, StorageErrorKind::InvalidRequest, err)
                .context("storage root is not UTF-8")
                .build()
        })?;

        tracing::debug!(%root, "using filesystem storage");
        Ok(Self {
            name: format!("Filesystem ({root})"),
            root,
        })
    }

    /// The root directory of this backend.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if !remote
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
        {
            return Err(StorageError::builder(
                FILESYSTEM_STORAGE_NAME,
                StorageErrorKind::InvalidRequest,
                eyre!("object path must be relative and normalized: {remote}"),
            )
            .path(remote.as_str())
            .build());
        }

        Ok(self.root.join(remote))
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                    .path(parent.as_str())
                    .context("create_dir_all")
                    .build()
            })?;
        }
        Ok(())
    }

    async fn open_file(&self, path: &Utf8Path) -> Result<(tokio::fs::File, u64), StorageError> {
        let file = tokio::fs::File::open(path).await.map_err(|err| {
            StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(path.as_str())
                .context("open file")
                .build()
        })?;
        let metadata = file.metadata().await.map_err(|err| {
            StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(path.as_str())
                .context("metadata")
                .build()
        })?;
        Ok((file, metadata.len()))
    }

    /// Write the persister output to `partial`, then rename it into place.
    async fn write_partial(
        &self,
        partial: &Utf8Path,
        target: &Utf8Path,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        let file = tokio::fs::File::create(partial).await.map_err(|err| {
            StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(partial.as_str())
                .context("create file")
                .build()
        })?;
        let mut writer = tokio::io::BufWriter::new(file);

        let persisted = persister
            .persist(&mut writer)
            .await
            .map_err(PersistError::Persister)?;

        let finish = async {
            writer.shutdown().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(partial, target).await
        };

        if let Err(err) = finish.await {
            let source = StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(target.as_str())
                .context("commit file")
                .build();
            return Err(PersistError::Upload { persisted, source });
        }

        Ok(persisted)
    }
}

#[async_trait::async_trait]
impl Backend for FilesystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn persist(
        &self,
        path: &Utf8Path,
        _content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        let target = self.path(path)?;
        self.create_parent(&target).await?;

        let partial = target.with_file_name(format!(
            ".{}.{}.partial",
            target.file_name().unwrap_or("object"),
            uuid::Uuid::new_v4()
        ));

        let result = self.write_partial(&partial, &target, persister).await;
        if let Err(error) = &result {
            tracing::error!(%error, %path, "failed to persist file");
            if let Err(err) = tokio::fs::remove_file(&partial).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%partial, "failed to remove partial file: {err}");
                }
            }
        }
        result
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError> {
        let path = self.path(path)?;
        let (file, _) = self.open_file(&path).await?;
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }

    async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError> {
        let old = self.path(old)?;
        let new = self.path(new)?;
        self.create_parent(&new).await?;

        tokio::fs::rename(&old, &new).await.map_err(|err| {
            StorageError::io(FILESYSTEM_STORAGE_NAME, err)
                .path(old.as_str())
                .context(format!("rename to {new}"))
                .build()
        })
    }

    async fn serve(
        &self,
        digest: &str,
        request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError> {
        let path = self.path(&layer_path(digest))?;
        tracing::debug!(%digest, %path, "serving layer from filesystem");

        let (file, size) = self.open_file(&path).await?;
        stream_response(
            FILESYSTEM_STORAGE_NAME,
            request,
            Box::new(tokio::io::BufReader::new(file)),
            size,
        )
    }
}
