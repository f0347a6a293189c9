//! Google Cloud Storage and Azure Blob Storage through `object_store`.
//!
//! Unlike the S3 backend, sinks here stream: bytes go into an
//! `object_store` [`BufWriter`], which switches to a multipart upload once
//! its buffer fills.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, ObjectStoreExt};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::store::{Provider, PublicPath, RemoteReceipt, StorageBackend, UploadSink};
use crate::{UploadError, UploadResult};

/// Storage backend over any `object_store` implementation
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    provider: Provider,
    container: String,
    public_path: PublicPath,
}

impl ObjectStoreBackend {
    /// Wrap an already configured store
    pub fn new(store: Arc<dyn ObjectStore>, provider: Provider, container: String, public_path: PublicPath) -> Self {
        Self {
            store,
            provider,
            container,
            public_path,
        }
    }

    /// Google Cloud Storage bucket, credentials from `GOOGLE_*` variables
    #[cfg(feature = "gcs")]
    pub fn google<S: Into<String>>(bucket: S) -> UploadResult<Self> {
        use object_store::gcp::GoogleCloudStorageBuilder;

        let bucket = bucket.into();
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&bucket)
            .build()
            .map_err(UploadError::backend)?;
        let public_path = google_public_path(&bucket);
        Ok(Self::new(Arc::new(store), Provider::Google, bucket, public_path))
    }

    /// Azure Blob Storage container, credentials from `AZURE_*` variables
    #[cfg(feature = "azure")]
    pub fn azure<A: Into<String>, C: Into<String>>(account: A, container: C) -> UploadResult<Self> {
        use object_store::azure::MicrosoftAzureBuilder;

        let (account, container) = (account.into(), container.into());
        let store = MicrosoftAzureBuilder::from_env()
            .with_account(&account)
            .with_container_name(&container)
            .build()
            .map_err(UploadError::backend)?;
        let public_path = azure_public_path(&account, &container);
        Ok(Self::new(Arc::new(store), Provider::Azure, container, public_path))
    }
}

pub fn google_public_path(bucket: &str) -> PublicPath {
    PublicPath {
        cdn_uri: format!("http://storage.googleapis.com/{}", bucket),
        cdn_ssl_uri: format!("https://storage.googleapis.com/{}", bucket),
        endpoint: "https://storage.googleapis.com".to_string(),
    }
}

pub fn azure_public_path(account: &str, container: &str) -> PublicPath {
    PublicPath {
        cdn_uri: format!("http://{}.blob.core.windows.net/{}", account, container),
        cdn_ssl_uri: format!("https://{}.blob.core.windows.net/{}", account, container),
        endpoint: format!("https://{}.blob.core.windows.net", account),
    }
}

struct ObjectStoreSink {
    location: Path,
    writer: BufWriter,
    written: u64,
}

#[async_trait]
impl UploadSink for ObjectStoreSink {
    async fn write(&mut self, chunk: Bytes) -> UploadResult<()> {
        self.written += chunk.len() as u64;
        self.writer.write_all(&chunk).await.map_err(UploadError::backend)?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> UploadResult<RemoteReceipt> {
        self.writer.shutdown().await.map_err(UploadError::backend)?;
        Ok(RemoteReceipt {
            etag: None,
            size_bytes: self.written,
        })
    }

    async fn abort(mut self: Box<Self>) {
        if let Err(e) = self.writer.abort().await {
            warn!(location = %self.location, error = %e, "failed to abort object upload");
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn container(&self) -> &str {
        &self.container
    }

    fn public_path(&self) -> PublicPath {
        self.public_path.clone()
    }

    async fn open_sink(&self, key: &str, content_type: Option<&str>) -> UploadResult<Box<dyn UploadSink>> {
        let location = Path::from(key);
        let mut writer = BufWriter::new(self.store.clone(), location.clone());
        if let Some(ct) = content_type {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, ct.to_string().into());
            writer = writer.with_attributes(attributes);
        }

        Ok(Box::new(ObjectStoreSink {
            location,
            writer,
            written: 0,
        }))
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        self.store.delete(&Path::from(key)).await.map_err(UploadError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn backend() -> (Arc<InMemory>, ObjectStoreBackend) {
        let store = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(
            store.clone(),
            Provider::Google,
            "bucket".to_string(),
            google_public_path("bucket"),
        );
        (store, backend)
    }

    #[test]
    fn public_paths_match_provider_hosts() {
        let google = google_public_path("media");
        assert_eq!(google.cdn_ssl_uri, "https://storage.googleapis.com/media");

        let azure = azure_public_path("acct", "media");
        assert_eq!(azure.cdn_uri, "http://acct.blob.core.windows.net/media");
        assert_eq!(azure.endpoint, "https://acct.blob.core.windows.net");
    }

    #[tokio::test]
    async fn streamed_sinks_commit_on_finish() {
        let (store, backend) = backend();
        let mut sink = backend.open_sink("dir/a.bin", Some("application/octet-stream")).await.unwrap();
        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.write(Bytes::from_static(b"def")).await.unwrap();
        let receipt = sink.finish().await.unwrap();
        assert_eq!(receipt.size_bytes, 6);

        let data = store.get(&Path::from("dir/a.bin")).await.unwrap().bytes().await.unwrap();
        assert_eq!(&data[..], b"abcdef");

        backend.delete("dir/a.bin").await.unwrap();
        assert!(store.get(&Path::from("dir/a.bin")).await.is_err());
    }

    #[tokio::test]
    async fn aborted_sinks_leave_no_object() {
        let (store, backend) = backend();
        let mut sink = backend.open_sink("dir/b.bin", None).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await;
        assert!(store.get(&Path::from("dir/b.bin")).await.is_err());
    }
}
