use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FileRecord, UploadError, UploadResult};

/// Persisted description of an uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: Uuid,
    pub name: String,
    pub title: String,
    pub fileurl: String,
    /// Provider name, or `local` for files that never left the server
    pub locationtype: String,
    pub size: u64,
    pub filename: String,
    pub original_filename: String,
    pub mime_type: String,
    pub encrypted_client_side: bool,
    pub attributes: BTreeMap<String, String>,
    /// Request body fields, when the caller asked to keep them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    pub created_at: i64,
}

impl AssetRecord {
    pub fn from_file(file: &FileRecord, body: Option<serde_json::Value>) -> Self {
        let name = file
            .filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&file.filename)
            .to_string();

        Self {
            id: Uuid::new_v4(),
            title: name.clone(),
            name,
            fileurl: file.url.clone(),
            locationtype: file.provider.as_str().to_string(),
            size: file.size,
            filename: file.filename.clone(),
            original_filename: file.original_filename.clone(),
            mime_type: file.mime_type.clone(),
            encrypted_client_side: file.encryption.encrypted,
            attributes: file.attributes.clone(),
            body,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.locationtype == "local"
    }

    /// Object key inside the container
    pub fn cloud_file_path(&self) -> Option<&str> {
        self.attributes.get("cloudfilepath").map(String::as_str)
    }
}

/// Persists asset records for uploaded files
#[async_trait]
pub trait AssetMaterializer: Send + Sync {
    /// Create records in bulk. Failures are `UploadError::AssetPersistence`.
    async fn create(&self, records: Vec<AssetRecord>) -> UploadResult<Vec<AssetRecord>>;
}

/// In-memory asset storage
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetStore {
    records: Arc<RwLock<Vec<AssetRecord>>>,
    fail_with: Option<String>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every `create` fails with `message`
    pub fn failing<S: Into<String>>(message: S) -> Self {
        Self {
            records: Arc::default(),
            fail_with: Some(message.into()),
        }
    }

    pub fn records(&self) -> Vec<AssetRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl AssetMaterializer for MemoryAssetStore {
    async fn create(&self, records: Vec<AssetRecord>) -> UploadResult<Vec<AssetRecord>> {
        if let Some(message) = &self.fail_with {
            return Err(UploadError::asset(message.clone()));
        }
        self.records.write().extend(records.iter().cloned());
        Ok(records)
    }
}
