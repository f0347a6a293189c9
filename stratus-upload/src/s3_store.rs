use std::env;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{primitives::ByteStream as AwsByteStream, Client};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::store::{Provider, PublicPath, RemoteReceipt, StorageBackend, UploadSink};
use crate::{UploadError, UploadResult};

/// Smallest part S3 accepts for every part but the last
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Amazon S3 (or S3-compatible) connection settings
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    /// Bytes buffered per multipart part
    pub part_size: usize,
}

impl S3Config {
    pub fn new<B: Into<String>, R: Into<String>>(bucket: B, region: R) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Part size for streamed uploads, never below 5 MiB
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self.force_path_style = true;
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret.into());
        self
    }

    /// Read `S3_BUCKET` and `S3_REGION` (required) plus the optional
    /// `S3_ENDPOINT_URL`, `S3_ACCESS_KEY_ID` and `S3_SECRET_ACCESS_KEY`.
    pub fn from_env() -> UploadResult<Self> {
        fn required(key: &str) -> UploadResult<String> {
            env::var(key).map_err(|_| UploadError::config(format!("{} environment variable required", key)))
        }

        let mut config = Self::new(required("S3_BUCKET")?, required("S3_REGION")?);
        if let Ok(endpoint) = env::var("S3_ENDPOINT_URL") {
            config = config.with_endpoint(endpoint);
        }
        if let (Ok(key), Ok(secret)) = (env::var("S3_ACCESS_KEY_ID"), env::var("S3_SECRET_ACCESS_KEY")) {
            config = config.with_credentials(key, secret);
        }
        Ok(config)
    }

    fn host(&self) -> String {
        match &self.endpoint_url {
            Some(url) => url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("s3.{}.amazonaws.com", self.region),
        }
    }
}

/// Amazon storage backend.
///
/// Sinks stream the object as a multipart upload, holding at most one part
/// in memory. Objects smaller than one part are sent with a single
/// `PutObject` instead.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Self {
        let client = Self::create_client(&config).await;
        Self { client, config }
    }

    pub async fn from_env() -> UploadResult<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    /// Wrap an already configured client
    pub fn with_client(client: Client, config: S3Config) -> Self {
        Self { client, config }
    }

    async fn create_client(config: &S3Config) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(key, secret, None, None, "stratus"));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let aws_config = loader.load().await;
        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        )
    }
}

/// Accumulates chunks and cuts them into fixed-size parts
struct PartBuffer {
    part_size: usize,
    pending: BytesMut,
}

impl PartBuffer {
    fn new(part_size: usize) -> Self {
        Self {
            part_size,
            pending: BytesMut::new(),
        }
    }

    /// Append a chunk and return every part that is now complete
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut ready = Vec::new();
        while self.pending.len() >= self.part_size {
            ready.push(self.pending.split_to(self.part_size).freeze());
        }
        ready
    }

    fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn take_rest(&mut self) -> Bytes {
        self.pending.split().freeze()
    }
}

struct MultipartState {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

struct S3Sink {
    client: Client,
    bucket: String,
    key: String,
    content_type: Option<String>,
    buffer: PartBuffer,
    multipart: Option<MultipartState>,
    size_bytes: u64,
}

impl S3Sink {
    async fn upload_part(&mut self, data: Bytes) -> UploadResult<()> {
        if self.multipart.is_none() {
            let created = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .set_content_type(self.content_type.clone())
                .send()
                .await
                .map_err(UploadError::backend)?;
            let upload_id = created
                .upload_id()
                .ok_or_else(|| UploadError::remote(&self.key, "s3 did not return an upload id"))?
                .to_string();
            debug!(bucket = %self.bucket, key = %self.key, upload_id = %upload_id, "multipart upload started");
            self.multipart = Some(MultipartState {
                upload_id,
                parts: Vec::new(),
            });
        }

        let Some(state) = self.multipart.as_mut() else {
            return Err(UploadError::invalid_state("multipart upload missing after creation"));
        };
        let part_number = state.parts.len() as i32 + 1;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&state.upload_id)
            .part_number(part_number)
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(UploadError::backend)?;

        state.parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key = %self.key, upload_id = %upload_id, error = %e, "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl UploadSink for S3Sink {
    async fn write(&mut self, chunk: Bytes) -> UploadResult<()> {
        self.size_bytes += chunk.len() as u64;
        for part in self.buffer.push(&chunk) {
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> UploadResult<RemoteReceipt> {
        let rest = self.buffer.take_rest();

        if self.multipart.is_none() {
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .set_content_type(self.content_type.clone())
                .body(AwsByteStream::from(rest))
                .send()
                .await
                .map_err(UploadError::backend)?;
            return Ok(RemoteReceipt {
                etag: result.e_tag().map(str::to_string),
                size_bytes: self.size_bytes,
            });
        }

        if !rest.is_empty() {
            if let Err(e) = self.upload_part(rest).await {
                self.abort().await;
                return Err(e);
            }
        }

        let Some(state) = self.multipart.take() else {
            return Err(UploadError::invalid_state("multipart upload vanished before completion"));
        };
        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&state.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(state.parts)).build())
            .send()
            .await;

        match completed {
            Ok(output) => Ok(RemoteReceipt {
                etag: output.e_tag().map(str::to_string),
                size_bytes: self.size_bytes,
            }),
            Err(e) => {
                self.abort_multipart(&state.upload_id).await;
                Err(UploadError::backend(e))
            }
        }
    }

    async fn abort(self: Box<Self>) {
        match &self.multipart {
            Some(state) => self.abort_multipart(&state.upload_id).await,
            None => debug!(bucket = %self.bucket, key = %self.key, "discarding buffered s3 upload"),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Store {
    fn provider(&self) -> Provider {
        Provider::Amazon
    }

    fn container(&self) -> &str {
        &self.config.bucket
    }

    fn public_path(&self) -> PublicPath {
        let host = self.config.host();
        PublicPath {
            cdn_uri: format!("http://{}/{}", host, self.config.bucket),
            cdn_ssl_uri: format!("https://{}/{}", host, self.config.bucket),
            endpoint: format!("https://{}", host),
        }
    }

    async fn open_sink(&self, key: &str, content_type: Option<&str>) -> UploadResult<Box<dyn UploadSink>> {
        Ok(Box::new(S3Sink {
            client: self.client.clone(),
            bucket: self.config.bucket.clone(),
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
            buffer: PartBuffer::new(self.config.part_size),
            multipart: None,
            size_bytes: 0,
        }))
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(UploadError::backend)?;
        Ok(())
    }
}
