//! Google Cloud Storage backend.

use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use futures::TryStreamExt as _;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::google_cloud_auth::error::Error as AuthError;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::copy::CopyObjectRequest;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::sign::{SignedURLMethod, SignedURLOptions};
use mime::Mime;
use serde::Deserialize;
use tokio_util::io::StreamReader;

use storage_driver::{
    layer_path, pipe_upload, redirect_response, Backend, FetchReader, PersistError, Persisted,
    Persister, ServeBody, StorageError, StorageErrorKind, PIPE_CAPACITY,
};

const GCS_STORAGE_NAME: &str = "GCS";

/// How long signed layer URLs stay valid.
pub const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Connection settings for a Google Cloud Storage bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GcsConfig {
    /// Bucket holding layers.
    pub bucket: String,

    /// Service account key file. Ambient credentials are used when unset,
    /// and URL signing then goes through the IAM credentials API.
    #[serde(default)]
    pub credentials: Option<Utf8PathBuf>,
}

/// Storage backend for a Google Cloud Storage bucket.
#[derive(Clone)]
pub struct GcsBackend {
    client: Client,
    bucket: String,
    name: String,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl GcsBackend {
    /// Connect to a bucket, authenticating with the configured key file or
    /// the ambient Google credentials.
    pub async fn new(config: GcsConfig) -> Result<Self, StorageError> {
        let denied = |err| auth_error(&config.bucket, err);

        let client_config = match &config.credentials {
            Some(path) => {
                let credentials = CredentialsFile::new_from_file(path.to_string())
                    .await
                    .map_err(denied)?;
                ClientConfig::default()
                    .with_credentials(credentials)
                    .await
                    .map_err(denied)?
            }
            None => ClientConfig::default().with_auth().await.map_err(denied)?,
        };

        tracing::debug!(bucket = %config.bucket, "using Google Cloud Storage");
        Ok(Self::from_client(Client::new(client_config), config.bucket))
    }

    /// Use an already configured client.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            name: format!("Google Cloud Storage ({bucket})"),
            client,
            bucket,
        }
    }

    /// The bucket this backend writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, object: &str) -> Result<(), StorageError> {
        self.client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: object.to_owned(),
                ..Default::default()
            })
            .await
            .map_err(|err| gcs_error(err, &self.bucket, object, "get object"))?;
        Ok(())
    }
}

fn auth_error(bucket: &str, error: AuthError) -> StorageError {
    StorageError::builder(GCS_STORAGE_NAME, StorageErrorKind::PermissionDenied, error)
        .bucket(bucket)
        .context("load credentials")
        .build()
}

fn gcs_error(error: GcsError, bucket: &str, object: &str, context: &str) -> StorageError {
    let kind = match &error {
        GcsError::Response(response) => match response.code {
            404 => StorageErrorKind::NotFound,
            401 | 403 => StorageErrorKind::PermissionDenied,
            400 => StorageErrorKind::InvalidRequest,
            code if code >= 500 => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Other,
        },
        _ => StorageErrorKind::Io,
    };

    StorageError::builder(GCS_STORAGE_NAME, kind, error)
        .bucket(bucket)
        .path(object)
        .context(context)
        .build()
}

#[async_trait::async_trait]
impl Backend for GcsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn persist(
        &self,
        path: &Utf8Path,
        content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let object = path.to_string();
        let content_type = content_type.to_string();

        pipe_upload(GCS_STORAGE_NAME, persister, move |stream| async move {
            let request = UploadObjectRequest {
                bucket: bucket.clone(),
                ..Default::default()
            };
            let mut media = Media::new(object.clone());
            media.content_type = content_type.into();

            client
                .upload_streamed_object(
                    &request,
                    stream.into_stream(PIPE_CAPACITY),
                    &UploadType::Simple(media),
                )
                .await
                .map_err(|err| gcs_error(err, &bucket, &object, "upload object"))?;
            Ok(())
        })
        .await
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError> {
        // The download stream only fails once polled, so check first.
        self.exists(path.as_str()).await?;

        let stream = self
            .client
            .download_streamed_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: path.to_string(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|err| gcs_error(err, &self.bucket, path.as_str(), "download object"))?;

        Ok(Box::new(StreamReader::new(Box::pin(
            stream.map_err(io::Error::other),
        ))))
    }

    async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError> {
        self.client
            .copy_object(&CopyObjectRequest {
                source_bucket: self.bucket.clone(),
                source_object: old.to_string(),
                destination_bucket: self.bucket.clone(),
                destination_object: new.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|err| gcs_error(err, &self.bucket, old.as_str(), "copy object"))?;

        if let Err(error) = self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: old.to_string(),
                ..Default::default()
            })
            .await
        {
            tracing::warn!(
                %error,
                bucket = %self.bucket,
                %old,
                %new,
                "failed to delete renamed object"
            );
        }

        Ok(())
    }

    async fn serve(
        &self,
        digest: &str,
        _request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError> {
        let object = layer_path(digest);
        self.exists(object.as_str()).await?;

        let url = self
            .client
            .signed_url(
                &self.bucket,
                object.as_str(),
                None,
                None,
                SignedURLOptions {
                    method: SignedURLMethod::GET,
                    expires: SIGNED_URL_EXPIRY,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| {
                StorageError::builder(GCS_STORAGE_NAME, StorageErrorKind::Signing, err)
                    .bucket(&self.bucket)
                    .path(object.as_str())
                    .context("sign URL")
                    .build()
            })?;

        tracing::info!(%digest, bucket = %self.bucket, "redirecting layer request to GCS");
        redirect_response(GCS_STORAGE_NAME, &url)
    }
}
