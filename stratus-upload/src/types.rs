use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use uuid::Uuid;

use crate::cipher::CipherAlgorithm;
use crate::store::Provider;
use crate::UploadResult;

/// Stream of bytes for one file part
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Lazy sequence of classified multipart events.
///
/// The stream ending is the end-of-stream marker; an `Err` item is a
/// framing failure for the whole body.
pub type FormEventStream = Pin<Box<dyn Stream<Item = UploadResult<FormEvent>> + Send>>;

/// One classified multipart event
pub enum FormEvent {
    /// Ordinary form field
    Field { name: String, value: String },
    /// One file section with its own byte stream
    File(FilePart),
}

impl std::fmt::Debug for FormEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormEvent::Field { name, value } => f
                .debug_struct("Field")
                .field("name", name)
                .field("value", value)
                .finish(),
            FormEvent::File(part) => f.debug_tuple("File").field(part).finish(),
        }
    }
}

/// A multipart file section
pub struct FilePart {
    pub field_name: String,
    pub filename: String,
    pub encoding: String,
    pub mime_type: String,
    pub stream: ByteStream,
}

impl FilePart {
    pub fn new<N: Into<String>, F: Into<String>>(field_name: N, filename: F, stream: ByteStream) -> Self {
        Self {
            field_name: field_name.into(),
            filename: filename.into(),
            encoding: "7bit".to_string(),
            mime_type: "application/octet-stream".to_string(),
            stream,
        }
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_encoding<S: Into<String>>(mut self, encoding: S) -> Self {
        self.encoding = encoding.into();
        self
    }
}

impl std::fmt::Debug for FilePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePart")
            .field("field_name", &self.field_name)
            .field("filename", &self.filename)
            .field("encoding", &self.encoding)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// Per-request context (request info, caller overrides)
#[derive(Debug, Clone)]
pub struct UploadCtx {
    pub request_id: String,
    /// Replaces the computed upload directory for this request
    pub upload_path_override: Option<String>,
    /// Replaces the configured completion policy for this request
    pub wait_for_remote: Option<bool>,
}

impl UploadCtx {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            upload_path_override: None,
            wait_for_remote: None,
        }
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_upload_path<S: Into<String>>(mut self, path: S) -> Self {
        self.upload_path_override = Some(path.into());
        self
    }

    pub fn with_wait_for_remote(mut self, wait: bool) -> Self {
        self.wait_for_remote = Some(wait);
        self
    }
}

impl Default for UploadCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Encryption applied to a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EncryptionMeta {
    pub encrypted: bool,
    pub algorithm: Option<CipherAlgorithm>,
}

/// Where a file's remote leg stands in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteStatus {
    /// No remote signal yet (fire-and-forget completions)
    Pending,
    Stored {
        etag: Option<String>,
    },
    Failed {
        reason: String,
    },
    /// `save_to_disk` was off
    Skipped,
}

/// Metadata for one file whose local stream reached its end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Position of the file part within the request
    pub index: usize,
    pub field_name: String,
    pub original_filename: String,
    /// Name after the naming policy ran
    pub filename: String,
    pub encoding: String,
    pub mime_type: String,
    /// Bytes observed on the plaintext stream
    pub size: u64,
    pub key: String,
    pub url: String,
    pub provider: Provider,
    pub upload_directory: String,
    pub encryption: EncryptionMeta,
    pub attributes: BTreeMap<String, String>,
    /// Local stream failure, if any
    pub error: Option<String>,
    /// Filled in when a snapshot is taken
    pub remote: RemoteStatus,
}

impl FileRecord {
    /// True when either leg of this file failed
    pub fn is_errored(&self) -> bool {
        self.error.is_some() || matches!(self.remote, RemoteStatus::Failed { .. })
    }
}

/// Terminal signal of one file's storage sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUpload {
    pub index: usize,
    pub key: String,
    pub outcome: RemoteStatus,
    /// Bytes the backend received (ciphertext when encrypting)
    pub stored_bytes: u64,
}

impl RemoteUpload {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RemoteStatus::Stored { .. } | RemoteStatus::Skipped)
    }
}

/// Final view of a session handed to the completion callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSnapshot {
    pub request_id: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub files: Vec<FileRecord>,
    pub remote_uploads: Vec<RemoteUpload>,
}

impl UploadSnapshot {
    pub fn failed_files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|f| f.is_errored())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_files().next().is_some()
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}
