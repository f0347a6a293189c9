use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::UploadResult;

/// Object store family behind a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Amazon,
    Google,
    Azure,
    Memory,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Amazon => "amazon",
            Provider::Google => "google",
            Provider::Azure => "azure",
            Provider::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public base locations of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPath {
    pub cdn_uri: String,
    pub cdn_ssl_uri: String,
    pub endpoint: String,
}

impl PublicPath {
    /// Public URL of `key` under this container
    pub fn url_for(&self, key: &str, prefer_http: bool) -> String {
        let base = if prefer_http { &self.cdn_uri } else { &self.cdn_ssl_uri };
        format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
    }
}

/// Terminal success of an upload sink
#[derive(Debug, Clone)]
pub struct RemoteReceipt {
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Write side of one object upload.
///
/// A sink ends in exactly one terminal event: `finish` returning `Ok`
/// (success), an `Err` from `write` or `finish` (error), or `abort`.
#[async_trait]
pub trait UploadSink: Send {
    async fn write(&mut self, chunk: Bytes) -> UploadResult<()>;

    /// Commit the object once the upstream stream has ended
    async fn finish(self: Box<Self>) -> UploadResult<RemoteReceipt>;

    /// Close the sink without committing anything
    async fn abort(self: Box<Self>);
}

/// Object storage capability - must be implemented by all providers
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Container (bucket) objects are written to
    fn container(&self) -> &str;

    fn public_path(&self) -> PublicPath;

    /// Begin an upload to `key`
    async fn open_sink(&self, key: &str, content_type: Option<&str>) -> UploadResult<Box<dyn UploadSink>>;

    /// Remove a stored object
    async fn delete(&self, key: &str) -> UploadResult<()>;
}
