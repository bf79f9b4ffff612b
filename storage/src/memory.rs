use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use mime::Mime;
use tokio::sync::RwLock;

use storage_driver::{
    layer_path, pipe_upload, stream_response, Backend, FetchReader, PersistError, Persisted,
    Persister, ServeBody, StorageError, StorageErrorKind,
};

const MEMORY_STORAGE_NAME: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryObject {
    content_type: Mime,
    data: Bytes,
}

type Objects = Arc<RwLock<HashMap<Utf8PathBuf, MemoryObject>>>;

fn not_found(path: &Utf8Path) -> StorageError {
    StorageError::builder(
        MEMORY_STORAGE_NAME,
        StorageErrorKind::NotFound,
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Path not found: {path}"),
        ),
    )
    .path(path.as_str())
    .build()
}

/// Storage backend that keeps objects in memory.
///
/// Uploads still go through the persist pipe, so this backend behaves like a
/// remote medium without any network access.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    objects: Objects,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The content type an object was stored with.
    pub async fn content_type(&self, path: &Utf8Path) -> Option<Mime> {
        let objects = self.objects.read().await;
        objects.get(path).map(|object| object.content_type.clone())
    }

    /// Whether an object exists at `path`.
    pub async fn contains(&self, path: &Utf8Path) -> bool {
        self.objects.read().await.contains_key(path)
    }

    async fn get(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        let objects = self.objects.read().await;
        objects
            .get(path)
            .map(|object| object.data.clone())
            .ok_or_else(|| not_found(path))
    }
}

#[async_trait::async_trait]
impl Backend for MemoryStorage {
    fn name(&self) -> &str {
        MEMORY_STORAGE_NAME
    }

    async fn persist(
        &self,
        path: &Utf8Path,
        content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        let objects = self.objects.clone();
        let path = path.to_owned();
        let content_type = content_type.clone();

        pipe_upload(MEMORY_STORAGE_NAME, persister, move |mut stream| async move {
            let data = stream.read_all().await.map_err(|err| {
                StorageError::io(MEMORY_STORAGE_NAME, err)
                    .path(path.as_str())
                    .build()
            })?;

            let mut objects = objects.write().await;
            objects.insert(path, MemoryObject { content_type, data });
            Ok(())
        })
        .await
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError> {
        let data = self.get(path).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        let object = objects.remove(old).ok_or_else(|| not_found(old))?;
        objects.insert(new.to_owned(), object);
        Ok(())
    }

    async fn serve(
        &self,
        digest: &str,
        request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError> {
        let data = self.get(&layer_path(digest)).await?;
        let size = data.len() as u64;
        stream_response(
            MEMORY_STORAGE_NAME,
            request,
            Box::new(Cursor::new(data)),
            size,
        )
    }
}

#[cfg(test)]
mod tests {
    use storage_driver::{BoxError, BytesPersister, Writer};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    struct Zeros;

    #[async_trait::async_trait]
    impl Persister for Zeros {
        async fn persist(&mut self, sink: &mut Writer<'_>) -> Result<Persisted, BoxError> {
            sink.write_all(&[0u8; 4096]).await?;
            Ok(Persisted::new("sha256:abcd", 4096))
        }
    }

    async fn read(storage: &MemoryStorage, path: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = storage.fetch(Utf8Path::new(path)).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        Ok(buf)
    }

    #[tokio::test]
    async fn persist_returns_persister_values() {
        let storage = MemoryStorage::new();

        let persisted = storage
            .persist(
                Utf8Path::new("layers/sha256:abcd"),
                &mime::APPLICATION_OCTET_STREAM,
                &mut Zeros,
            )
            .await
            .unwrap();

        assert_eq!(persisted, Persisted::new("sha256:abcd", 4096));
        assert_eq!(
            read(&storage, "layers/sha256:abcd").await.unwrap(),
            vec![0u8; 4096]
        );
        assert_eq!(
            storage
                .content_type(Utf8Path::new("layers/sha256:abcd"))
                .await,
            Some(mime::APPLICATION_OCTET_STREAM)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_persists_are_isolated() {
        let storage = MemoryStorage::new();

        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    let mut persister = BytesPersister::new(vec![i; 200_000 + i as usize]);
                    let path = Utf8PathBuf::from(format!("layers/{i}"));
                    storage
                        .persist(&path, &mime::APPLICATION_OCTET_STREAM, &mut persister)
                        .await
                        .unwrap()
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let persisted = task.await.unwrap();
            assert_eq!(persisted.size, 200_000 + i as u64);

            let data = read(&storage, &format!("layers/{i}")).await.unwrap();
            assert_eq!(data.len(), 200_000 + i);
            assert!(data.iter().all(|b| *b == i as u8));
        }
    }

    #[tokio::test]
    async fn move_keeps_bytes() {
        let storage = MemoryStorage::new();
        let mut persister = BytesPersister::new(&b"layer tarball"[..]);
        storage
            .persist(
                Utf8Path::new("staging/abc"),
                &mime::APPLICATION_OCTET_STREAM,
                &mut persister,
            )
            .await
            .unwrap();

        storage
            .move_object(Utf8Path::new("staging/abc"), Utf8Path::new("layers/abc"))
            .await
            .unwrap();

        assert_eq!(read(&storage, "layers/abc").await.unwrap(), b"layer tarball");
        assert!(!storage.contains(Utf8Path::new("staging/abc")).await);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let storage = MemoryStorage::new();

        let error = read(&storage, "layers/nope").await.unwrap_err();
        assert!(error.is_not_found());

        let error = storage
            .move_object(Utf8Path::new("layers/nope"), Utf8Path::new("layers/other"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());

        let (parts, ()) = http::Request::new(()).into_parts();
        let error = storage.serve("sha256:nope", &parts).await.unwrap_err();
        assert!(error.is_not_found());
    }
}
