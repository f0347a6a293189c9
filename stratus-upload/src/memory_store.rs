use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::store::{Provider, PublicPath, RemoteReceipt, StorageBackend, UploadSink};
use crate::{UploadError, UploadResult};

/// A committed in-memory object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub etag: String,
}

#[derive(Debug, Default)]
struct SinkCounters {
    opened: AtomicUsize,
    open: AtomicUsize,
    aborted: AtomicUsize,
}

/// In-memory storage backend for tests and local development
#[derive(Debug, Clone)]
pub struct MemoryStore {
    container: String,
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    counters: Arc<SinkCounters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_container("memory")
    }

    pub fn with_container<S: Into<String>>(container: S) -> Self {
        Self {
            container: container.into(),
            objects: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(SinkCounters::default()),
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sinks opened over the store's lifetime
    pub fn sinks_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Sinks neither finished, aborted nor dropped yet
    pub fn sinks_open(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn sinks_aborted(&self) -> usize {
        self.counters.aborted.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySink {
    key: String,
    content_type: Option<String>,
    buffer: BytesMut,
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    counters: Arc<SinkCounters>,
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> UploadResult<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> UploadResult<RemoteReceipt> {
        let data = std::mem::take(&mut self.buffer).freeze();
        let size_bytes = data.len() as u64;
        let etag = format!("\"{:x}-{}\"", fnv1a(&data), size_bytes);

        self.objects.write().insert(
            self.key.clone(),
            StoredObject {
                data,
                content_type: self.content_type.clone(),
                etag: etag.clone(),
            },
        );

        Ok(RemoteReceipt {
            etag: Some(etag),
            size_bytes,
        })
    }

    async fn abort(self: Box<Self>) {
        self.counters.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    fn provider(&self) -> Provider {
        Provider::Memory
    }

    fn container(&self) -> &str {
        &self.container
    }

    fn public_path(&self) -> PublicPath {
        PublicPath {
            cdn_uri: format!("memory://{}", self.container),
            cdn_ssl_uri: format!("memory://{}", self.container),
            endpoint: "memory://".to_string(),
        }
    }

    async fn open_sink(&self, key: &str, content_type: Option<&str>) -> UploadResult<Box<dyn UploadSink>> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySink {
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
            buffer: BytesMut::new(),
            objects: self.objects.clone(),
            counters: self.counters.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        match self.objects.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(UploadError::backend(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("object not found: {}", key),
            ))),
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf29ce484222325u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}
