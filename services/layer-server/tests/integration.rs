//! Integration tests for the layer routes

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use camino::Utf8Path;
use http_body_util::BodyExt as _;
use sha2::{Digest as _, Sha256};
use storage::{MemoryStorage, Storage, StorageConfig};
use storage_driver::{
    Backend, BytesPersister, FetchReader, PersistError, Persisted, Persister, ServeBody,
    StorageError, StorageErrorKind, layer_path, redirect_response,
};
use tower::ServiceExt;

fn stub_error(kind: StorageErrorKind, message: impl Into<String>) -> StorageError {
    StorageError::builder("stub", kind, message.into()).build()
}

/// A backend which always redirects, standing in for a signed object store.
#[derive(Debug)]
struct Redirecting {
    sign: bool,
}

#[async_trait::async_trait]
impl Backend for Redirecting {
    fn name(&self) -> &str {
        "redirecting"
    }

    async fn persist(
        &self,
        _path: &Utf8Path,
        _content_type: &mime::Mime,
        _persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        Err(stub_error(StorageErrorKind::PermissionDenied, "read only").into())
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError> {
        Err(stub_error(StorageErrorKind::NotFound, path.as_str()))
    }

    async fn move_object(&self, old: &Utf8Path, _new: &Utf8Path) -> Result<(), StorageError> {
        Err(stub_error(StorageErrorKind::NotFound, old.as_str()))
    }

    async fn serve(
        &self,
        digest: &str,
        _request: &axum::http::request::Parts,
    ) -> Result<axum::http::Response<ServeBody>, StorageError> {
        if !self.sign {
            return Err(stub_error(StorageErrorKind::Signing, "no signing key"));
        }
        redirect_response(
            "stub",
            &format!("https://layers.example.com/{}?signature=abc", layer_path(digest)),
        )
    }
}

fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

async fn with_layer(data: &'static [u8]) -> (Storage, String) {
    let storage: Storage = MemoryStorage::new().into();
    let mut persister = BytesPersister::new(data);
    let persisted = storage
        .persist(
            &layer_path(&persister.digest()),
            &mime::APPLICATION_OCTET_STREAM,
            &mut persister,
        )
        .await
        .unwrap();
    (storage, persisted.digest)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_api_version_check() {
    let app = layer_server::router(MemoryStorage::new().into());

    let response = app
        .oneshot(Request::builder().uri("/v2/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({}));
}

#[tokio::test]
async fn test_serve_layer_bytes() {
    let data = b"Hello, layer!";
    let (storage, digest) = with_layer(data).await;
    assert_eq!(digest, self::digest(data));
    let app = layer_server::router(storage);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/shell/git/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "13");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], data);
}

#[tokio::test]
async fn test_head_layer_has_no_body() {
    let (storage, digest) = with_layer(b"Hello, layer!").await;
    let app = layer_server::router(storage);

    let response = app
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/htop/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "13");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_missing_layer() {
    let app = layer_server::router(MemoryStorage::new().into());

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/htop/blobs/{}", digest(b"nothing here")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_digest() {
    let app = layer_server::router(MemoryStorage::new().into());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v2/htop/blobs/not-a-digest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");
}

#[tokio::test]
async fn test_redirect_to_signed_url() {
    let app = layer_server::router(Redirecting { sign: true }.into());
    let digest = digest(b"remote layer");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/shell/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("https://layers.example.com/layers/{digest}?signature=abc").as_str()
    );
}

#[tokio::test]
async fn test_signing_failure_is_server_error() {
    let app = layer_server::router(Redirecting { sign: false }.into());

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/shell/blobs/{}", digest(b"remote layer")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "UNKNOWN");
}

#[tokio::test]
async fn test_filesystem_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(dir.path()).unwrap().join("layers");
    let storage = StorageConfig::Filesystem { path }.build().await.unwrap();

    let data = b"filesystem layer";
    let mut persister = BytesPersister::new(&data[..]);
    let staging = Utf8Path::new("staging/build-1");
    let persisted = storage
        .persist(staging, &mime::APPLICATION_OCTET_STREAM, &mut persister)
        .await
        .unwrap();
    storage
        .move_object(staging, &layer_path(&persisted.digest))
        .await
        .unwrap();

    let app = layer_server::router(storage);
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/shell/blobs/{}", persisted.digest))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], data);
}
