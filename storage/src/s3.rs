//! Amazon S3 (and S3-compatible) storage backend.
//!
//! Small layers are written with a single `PutObject`. Anything larger than
//! one part is written as a multipart upload, so memory stays bounded to a
//! single part regardless of layer size.

use std::io;
use std::time::Duration;

use aws_sdk_s3::client::Waiters as _;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use camino::Utf8Path;
use eyre::eyre;
use mime::Mime;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

use storage_driver::{
    layer_path, pipe_upload, redirect_response, Backend, FetchReader, PersistError, Persisted,
    Persister, ServeBody, StorageError, StorageErrorKind, UploadStream,
};

const S3_STORAGE_NAME: &str = "S3";

/// Size of each part of a multipart upload, and the threshold above which
/// multipart uploads are used.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// How long presigned layer URLs stay valid.
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// How long to wait for a copied object to become visible.
const COPY_WAIT: Duration = Duration::from_secs(60);

/// Characters escaped in a copy source. Path separators stay literal.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection settings for an S3 bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct S3Config {
    /// Bucket holding layers.
    pub bucket: String,

    /// Custom endpoint, for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use path-style addressing instead of virtual-hosted buckets.
    #[serde(default)]
    pub path_style: bool,

    /// Region override. The AWS default chain is used when unset.
    #[serde(default)]
    pub region: Option<String>,
}

/// Storage backend for an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    name: String,
}

impl S3Backend {
    /// Connect to a bucket using the AWS default configuration chain.
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk = loader.load().await;

        let s3 = aws_sdk_s3::config::Builder::from(&sdk)
            .force_path_style(config.path_style)
            .build();

        tracing::debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            path_style = config.path_style,
            "using S3 storage"
        );
        Self::from_client(Client::from_conf(s3), config.bucket)
    }

    /// Use an already configured client.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            name: format!("S3 ({bucket})"),
            client,
            bucket,
        }
    }

    /// The bucket this backend writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Sign a time-limited GET URL for an object.
    pub async fn presign_get(&self, key: &Utf8Path) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(PRESIGN_EXPIRY).map_err(|err| {
            StorageError::builder(S3_STORAGE_NAME, StorageErrorKind::Signing, err)
                .bucket(&self.bucket)
                .path(key.as_str())
                .build()
        })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(config)
            .await
            .map_err(|err| {
                let context = format!("presign: {}", DisplayErrorContext(&err));
                StorageError::builder(S3_STORAGE_NAME, StorageErrorKind::Signing, err)
                    .bucket(&self.bucket)
                    .path(key.as_str())
                    .context(context)
                    .build()
            })?;

        Ok(request.uri().to_owned())
    }

    async fn head(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, key, "head object"))?;
        Ok(())
    }
}

/// Classify an SDK error by transport failure or HTTP status.
fn sdk_error<E>(error: SdkError<E>, bucket: &str, key: &str, context: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let kind = match &error {
        SdkError::TimeoutError(_) => StorageErrorKind::ServiceUnavailable,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => StorageErrorKind::Io,
        _ => match error.raw_response().map(|response| response.status().as_u16()) {
            Some(404) => StorageErrorKind::NotFound,
            Some(403) => StorageErrorKind::PermissionDenied,
            Some(400) => StorageErrorKind::InvalidRequest,
            Some(status) if status >= 500 => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Other,
        },
    };

    let context = format!("{context}: {}", DisplayErrorContext(&error));
    StorageError::builder(S3_STORAGE_NAME, kind, error)
        .bucket(bucket)
        .path(key)
        .context(context)
        .build()
}

/// The copy source header value for an object: `bucket/key`, percent-encoded.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE))
}

/// How an object is written, decided from the first two chunks of its stream.
#[derive(Debug)]
enum UploadPlan {
    /// The whole object fits in one part: a single `PutObject`.
    Single(Bytes),

    /// More than one part: a multipart upload starting with these two.
    Multipart(Bytes, Bytes),
}

/// Read just enough of `stream` to choose between a single put and a
/// multipart upload. An object of exactly `part_size` bytes is a single put.
async fn plan_upload(stream: &mut UploadStream, part_size: usize) -> io::Result<UploadPlan> {
    let first = stream.next_chunk(part_size).await?.unwrap_or_default();
    if first.len() < part_size {
        return Ok(UploadPlan::Single(first));
    }

    Ok(match stream.next_chunk(part_size).await? {
        None => UploadPlan::Single(first),
        Some(second) => UploadPlan::Multipart(first, second),
    })
}

/// A single object upload, owned by the upload task of one persist call.
#[derive(Debug)]
struct Upload {
    client: Client,
    bucket: String,
    key: String,
    content_type: String,
}

impl Upload {
    async fn run(self, mut stream: UploadStream) -> Result<(), StorageError> {
        let plan = plan_upload(&mut stream, PART_SIZE)
            .await
            .map_err(|err| self.read_error(err))?;

        match plan {
            UploadPlan::Single(data) => self.put(data).await,
            UploadPlan::Multipart(first, second) => self.multipart(first, second, stream).await,
        }
    }

    async fn chunk(&self, stream: &mut UploadStream) -> Result<Option<Bytes>, StorageError> {
        stream
            .next_chunk(PART_SIZE)
            .await
            .map_err(|err| self.read_error(err))
    }

    fn read_error(&self, err: io::Error) -> StorageError {
        StorageError::io(S3_STORAGE_NAME, err)
            .bucket(&self.bucket)
            .path(&self.key)
            .context("read upload pipe")
            .build()
    }

    async fn put(&self, data: Bytes) -> Result<(), StorageError> {
        tracing::trace!(key = %self.key, size = data.len(), "put object");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(&self.content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, &self.key, "put object"))?;
        Ok(())
    }

    async fn multipart(
        &self,
        first: Bytes,
        second: Bytes,
        mut stream: UploadStream,
    ) -> Result<(), StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(&self.content_type)
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, &self.key, "create multipart upload"))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                StorageError::builder(
                    S3_STORAGE_NAME,
                    StorageErrorKind::Other,
                    eyre!("response is missing an upload id"),
                )
                .bucket(&self.bucket)
                .path(&self.key)
                .build()
            })?
            .to_owned();

        tracing::debug!(key = %self.key, %upload_id, "started multipart upload");

        let result = async {
            let mut parts = vec![
                self.part(&upload_id, 1, first).await?,
                self.part(&upload_id, 2, second).await?,
            ];
            while let Some(chunk) = self.chunk(&mut stream).await? {
                let number = parts.len() as i32 + 1;
                parts.push(self.part(&upload_id, number, chunk).await?);
            }
            self.complete(&upload_id, parts).await
        }
        .await;

        if let Err(error) = &result {
            tracing::error!(%error, key = %self.key, %upload_id, "aborting multipart upload");
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    key = %self.key,
                    %upload_id,
                    "failed to abort multipart upload: {}",
                    DisplayErrorContext(&err)
                );
            }
        }

        result
    }

    async fn part(
        &self,
        upload_id: &str,
        number: i32,
        data: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        tracing::trace!(key = %self.key, part = number, size = data.len(), "upload part");
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, &self.key, "upload part"))?;

        Ok(CompletedPart::builder()
            .part_number(number)
            .set_e_tag(output.e_tag().map(str::to_owned))
            .build())
    }

    async fn complete(&self, upload_id: &str, parts: Vec<CompletedPart>) -> Result<(), StorageError> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, &self.key, "complete multipart upload"))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn persist(
        &self,
        path: &Utf8Path,
        content_type: &Mime,
        persister: &mut (dyn Persister + '_),
    ) -> Result<Persisted, PersistError> {
        let upload = Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: path.to_string(),
            content_type: content_type.to_string(),
        };

        pipe_upload(S3_STORAGE_NAME, persister, move |stream| upload.run(stream)).await
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Box<FetchReader>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, path.as_str(), "get object"))?;

        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn move_object(&self, old: &Utf8Path, new: &Utf8Path) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(new.as_str())
            .copy_source(copy_source(&self.bucket, old.as_str()))
            .send()
            .await
            .map_err(|err| sdk_error(err, &self.bucket, old.as_str(), "copy object"))?;

        self.client
            .wait_until_object_exists()
            .bucket(&self.bucket)
            .key(new.as_str())
            .wait(COPY_WAIT)
            .await
            .map_err(|err| {
                StorageError::builder(S3_STORAGE_NAME, StorageErrorKind::ServiceUnavailable, err)
                    .bucket(&self.bucket)
                    .path(new.as_str())
                    .context("wait for copied object")
                    .build()
            })?;

        if let Err(err) = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(old.as_str())
            .send()
            .await
        {
            tracing::warn!(
                bucket = %self.bucket,
                %old,
                %new,
                "failed to delete renamed object: {}",
                DisplayErrorContext(&err)
            );
        }

        Ok(())
    }

    async fn serve(
        &self,
        digest: &str,
        _request: &http::request::Parts,
    ) -> Result<http::Response<ServeBody>, StorageError> {
        let key = layer_path(digest);
        self.head(key.as_str()).await?;

        let url = self.presign_get(&key).await?;
        tracing::info!(%digest, bucket = %self.bucket, "redirecting layer request to S3");
        redirect_response(S3_STORAGE_NAME, &url)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use aws_sdk_s3::config::{BehaviorVersion, Credentials};
    use storage_driver::BytesPersister;

    use super::*;

    /// Persist `len` bytes through the upload pipe, returning the part sizes
    /// the upload would start with.
    async fn planned_parts(len: usize, part_size: usize) -> Vec<usize> {
        let planned = Arc::new(Mutex::new(Vec::new()));
        let parts = planned.clone();
        let mut persister = BytesPersister::new(vec![3u8; len]);

        pipe_upload("test", &mut persister, move |mut stream: UploadStream| async move {
            let plan = plan_upload(&mut stream, part_size)
                .await
                .map_err(|err| StorageError::io("test", err).build())?;
            stream
                .read_all()
                .await
                .map_err(|err| StorageError::io("test", err).build())?;
            *parts.lock().unwrap() = match plan {
                UploadPlan::Single(data) => vec![data.len()],
                UploadPlan::Multipart(first, second) => vec![first.len(), second.len()],
            };
            Ok(())
        })
        .await
        .unwrap();

        let parts = planned.lock().unwrap().clone();
        parts
    }

    fn offline() -> S3Backend {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .endpoint_url("http://localhost:9000")
            .force_path_style(true)
            .build();
        S3Backend::from_client(Client::from_conf(config), "test-bucket")
    }

    #[test]
    fn copy_source_is_encoded() {
        assert_eq!(
            copy_source("bucket", "layers/sha256:ab cd"),
            "bucket/layers/sha256%3Aab%20cd"
        );
        assert_eq!(copy_source("bucket", "tmp/a-b_c.d~"), "bucket/tmp/a-b_c.d~");
    }

    #[test]
    fn name_includes_bucket() {
        let backend = offline();
        assert_eq!(backend.name(), "S3 (test-bucket)");
        assert_eq!(backend.bucket(), "test-bucket");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: S3Config = serde_json::from_str(r#"{"bucket": "layers"}"#).unwrap();
        assert_eq!(config.bucket, "layers");
        assert!(!config.path_style);
        assert!(config.endpoint.is_none());
        assert!(config.region.is_none());
    }

    #[tokio::test]
    async fn empty_object_is_a_single_put() {
        assert_eq!(planned_parts(0, PART_SIZE).await, vec![0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exactly_one_part_is_a_single_put() {
        assert_eq!(planned_parts(PART_SIZE, PART_SIZE).await, vec![PART_SIZE]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_byte_over_a_part_is_multipart() {
        assert_eq!(planned_parts(PART_SIZE + 1, PART_SIZE).await, vec![PART_SIZE, 1]);
    }

    #[tokio::test]
    async fn small_parts_split_at_the_boundary() {
        assert_eq!(planned_parts(15, 16).await, vec![15]);
        assert_eq!(planned_parts(16, 16).await, vec![16]);
        assert_eq!(planned_parts(40, 16).await, vec![16, 16]);
    }

    #[tokio::test]
    async fn presigns_offline() {
        let backend = offline();
        let url = backend
            .presign_get(&layer_path("sha256:abcd"))
            .await
            .unwrap();

        assert!(
            url.starts_with("http://localhost:9000/test-bucket/layers/sha256"),
            "{url}"
        );
        assert!(url.contains("X-Amz-Signature="), "{url}");
        assert!(url.contains("X-Amz-Expires=900"), "{url}");
    }
}
