//! Upload configuration.
//!
//! [`UploadConfig`] is built once per session and never mutated afterward.
//! Defaults are applied at construction; callers layer overrides with the
//! `with_*` builders, or load them from a [`ConfigMap`]:
//!
//! ```rust
//! use stratus_upload::{ConfigMap, UploadConfig};
//!
//! let mut map = ConfigMap::new();
//! map.set("wait_for_remote", "false");
//! map.set("upload_directory", "media");
//!
//! let config = UploadConfig::from_map(&map).unwrap();
//! assert!(!config.wait_for_remote);
//! assert_eq!(config.upload_directory, "media");
//! ```
//!
//! ## Environment overrides
//! [`ConfigMap::from_env`] strips a prefix and normalizes the rest, so
//! `STRATUS__WAIT_FOR_REMOTE=false` becomes `wait_for_remote`.

use std::collections::HashMap;

use crate::cipher::CipherAlgorithm;
use crate::{UploadError, UploadResult};

/// How the byte counter measures each observed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeAccounting {
    /// Exact byte length of every chunk
    #[default]
    Bytes,
    /// Logical length: UTF-8 scalar values, equal to bytes for ASCII content
    Logical,
}

impl SizeAccounting {
    /// Measure one chunk.
    ///
    /// Logical counting skips UTF-8 continuation bytes, which keeps the total
    /// correct even when a multi-byte character straddles two chunks.
    pub fn measure(&self, chunk: &[u8]) -> u64 {
        match self {
            SizeAccounting::Bytes => chunk.len() as u64,
            SizeAccounting::Logical => chunk.iter().filter(|b| (**b & 0xC0) != 0x80).count() as u64,
        }
    }
}

/// What a failure of one file does to the rest of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileErrorPolicy {
    /// Record the failure on the file and keep going
    #[default]
    BestEffort,
    /// Abort the whole request on the first per-file failure
    AbortRequest,
}

/// Client-side encryption settings
#[derive(Clone)]
pub struct EncryptionConfig {
    pub algorithm: CipherAlgorithm,
    pub key: String,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Configuration for one upload session
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Perform the remote upload at all, or only collect metadata
    pub save_to_disk: bool,

    /// Hold completion until every remote upload has concluded
    pub wait_for_remote: bool,

    pub size_accounting: SizeAccounting,

    /// Encrypt file bytes before they reach the storage backend
    pub encryption: Option<EncryptionConfig>,

    /// Persist an asset record for each completed file
    pub save_file_to_asset: bool,

    /// Respond directly instead of handing off to the next handler
    pub send_response: bool,

    pub file_error_policy: FileErrorPolicy,

    /// Root directory (key prefix) for uploaded objects
    pub upload_directory: String,

    /// Append a `YYYY/MM/DD` component to the upload directory
    pub include_timestamp_in_dir: bool,

    /// Build public URLs from the plain-http CDN base
    pub prefer_http: bool,

    /// Per-file size guard, measured on the plaintext stream
    pub max_file_bytes: Option<u64>,

    /// Chunks buffered between the classifier and a file pipeline
    pub chunk_channel_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            save_to_disk: true,
            wait_for_remote: true,
            size_accounting: SizeAccounting::Bytes,
            encryption: None,
            save_file_to_asset: false,
            send_response: true,
            file_error_policy: FileErrorPolicy::BestEffort,
            upload_directory: "clouduploads".to_string(),
            include_timestamp_in_dir: true,
            prefer_http: false,
            max_file_bytes: None,
            chunk_channel_capacity: 16,
        }
    }
}

impl UploadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from string settings, applying defaults for missing keys
    pub fn from_map(map: &ConfigMap) -> UploadResult<Self> {
        let mut config = Self::default();

        if let Some(v) = map.get_bool("save_to_disk")? {
            config.save_to_disk = v;
        }
        if let Some(v) = map.get_bool("wait_for_remote")? {
            config.wait_for_remote = v;
        }
        if let Some(v) = map.get_bool("use_buffers")? {
            config.size_accounting = if v {
                SizeAccounting::Bytes
            } else {
                SizeAccounting::Logical
            };
        }
        if let Some(v) = map.get_bool("save_file_to_asset")? {
            config.save_file_to_asset = v;
        }
        if let Some(v) = map.get_bool("send_response")? {
            config.send_response = v;
        }
        if let Some(v) = map.get_bool("abort_on_file_error")? {
            config.file_error_policy = if v {
                FileErrorPolicy::AbortRequest
            } else {
                FileErrorPolicy::BestEffort
            };
        }
        if let Some(v) = map.get("upload_directory") {
            config.upload_directory = v.to_string();
        }
        if let Some(v) = map.get_bool("include_timestamp_in_dir")? {
            config.include_timestamp_in_dir = v;
        }
        if let Some(v) = map.get_bool("prefer_http")? {
            config.prefer_http = v;
        }
        if let Some(v) = map.get_u64("max_file_bytes")? {
            config.max_file_bytes = Some(v);
        }
        if let Some(v) = map.get_usize("chunk_channel_capacity")? {
            config.chunk_channel_capacity = v;
        }

        if map.get_bool("encrypted_client_side")?.unwrap_or(false) {
            let algorithm = map
                .get("client_encryption_algorithm")
                .unwrap_or("chacha20-poly1305")
                .parse::<CipherAlgorithm>()?;
            let key = map
                .get("encryption_key")
                .ok_or_else(|| UploadError::config("encryption_key is required when encrypted_client_side is set"))?;
            config.encryption = Some(EncryptionConfig {
                algorithm,
                key: key.to_string(),
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> UploadResult<()> {
        if self.chunk_channel_capacity == 0 {
            return Err(UploadError::config("chunk_channel_capacity must be at least 1"));
        }
        if let Some(enc) = &self.encryption {
            if enc.key.is_empty() {
                return Err(UploadError::config("encryption key must not be empty"));
            }
        }
        Ok(())
    }

    /// Wait-for-remote after a per-request override. It only applies when a
    /// remote upload actually happens.
    pub fn effective_wait_for_remote(&self, requested: Option<bool>) -> bool {
        requested.unwrap_or(self.wait_for_remote) && self.save_to_disk
    }

    pub fn with_save_to_disk(mut self, save: bool) -> Self {
        self.save_to_disk = save;
        self
    }

    pub fn with_wait_for_remote(mut self, wait: bool) -> Self {
        self.wait_for_remote = wait;
        self
    }

    /// Exact byte accounting when true, logical chunk length when false
    pub fn with_use_buffers(mut self, use_buffers: bool) -> Self {
        self.size_accounting = if use_buffers {
            SizeAccounting::Bytes
        } else {
            SizeAccounting::Logical
        };
        self
    }

    pub fn with_encryption<S: Into<String>>(mut self, algorithm: CipherAlgorithm, key: S) -> Self {
        self.encryption = Some(EncryptionConfig {
            algorithm,
            key: key.into(),
        });
        self
    }

    pub fn with_save_file_to_asset(mut self, save: bool) -> Self {
        self.save_file_to_asset = save;
        self
    }

    pub fn with_send_response(mut self, send: bool) -> Self {
        self.send_response = send;
        self
    }

    pub fn with_file_error_policy(mut self, policy: FileErrorPolicy) -> Self {
        self.file_error_policy = policy;
        self
    }

    pub fn with_upload_directory<S: Into<String>>(mut self, dir: S) -> Self {
        self.upload_directory = dir.into();
        self
    }

    pub fn with_timestamp_in_dir(mut self, include: bool) -> Self {
        self.include_timestamp_in_dir = include;
        self
    }

    pub fn with_prefer_http(mut self, prefer: bool) -> Self {
        self.prefer_http = prefer;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = Some(bytes);
        self
    }

    pub fn with_chunk_channel_capacity(mut self, capacity: usize) -> Self {
        self.chunk_channel_capacity = capacity;
        self
    }
}

/// String key/value settings store
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    values: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Collect every environment variable starting with `prefix`.
    ///
    /// `STRATUS__WAIT_FOR_REMOTE` with prefix `STRATUS__` becomes
    /// `wait_for_remote`; a double underscore inside the rest becomes a dot.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(std::env::vars(), prefix)
    }

    pub fn from_vars<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = Self::new();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                map.set(normalized, value);
            }
        }
        map
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_bool(&self, key: &str) -> UploadResult<Option<bool>> {
        self.parse_with(key, |v| match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
    }

    pub fn get_usize(&self, key: &str) -> UploadResult<Option<usize>> {
        self.parse_with(key, |v| v.parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> UploadResult<Option<u64>> {
        self.parse_with(key, |v| v.parse::<u64>().ok())
    }

    fn parse_with<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> UploadResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => parse(raw.trim())
                .map(Some)
                .ok_or_else(|| UploadError::config(format!("invalid value '{}' for {}", raw, key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_wait_for_remote_and_count_bytes() {
        let config = UploadConfig::default();
        assert!(config.save_to_disk);
        assert!(config.wait_for_remote);
        assert_eq!(config.size_accounting, SizeAccounting::Bytes);
        assert_eq!(config.file_error_policy, FileErrorPolicy::BestEffort);
        assert_eq!(config.upload_directory, "clouduploads");
        assert!(config.encryption.is_none());
    }

    #[test]
    fn env_vars_are_normalized() {
        let vars = vec![
            ("STRATUS__WAIT_FOR_REMOTE".to_string(), "false".to_string()),
            ("STRATUS__USE_BUFFERS".to_string(), "0".to_string()),
            ("OTHER__SAVE_TO_DISK".to_string(), "false".to_string()),
        ];
        let map = ConfigMap::from_vars(vars, "STRATUS__");
        let config = UploadConfig::from_map(&map).unwrap();

        assert!(!config.wait_for_remote);
        assert_eq!(config.size_accounting, SizeAccounting::Logical);
        assert!(config.save_to_disk);
    }

    #[test]
    fn encryption_requires_a_key() {
        let mut map = ConfigMap::new();
        map.set("encrypted_client_side", "true");
        assert!(matches!(UploadConfig::from_map(&map), Err(UploadError::Config { .. })));

        map.set("encryption_key", "hunter2");
        let config = UploadConfig::from_map(&map).unwrap();
        let enc = config.encryption.unwrap();
        assert_eq!(enc.algorithm, CipherAlgorithm::ChaCha20Poly1305);
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut map = ConfigMap::new();
        map.set("wait_for_remote", "sometimes");
        assert!(UploadConfig::from_map(&map).is_err());
    }

    #[test]
    fn no_remote_upload_means_no_waiting() {
        let config = UploadConfig::default().with_save_to_disk(false);
        assert!(config.wait_for_remote);
        assert!(!config.effective_wait_for_remote(None));
        assert!(!config.effective_wait_for_remote(Some(true)));

        let config = UploadConfig::default();
        assert!(config.effective_wait_for_remote(None));
        assert!(!config.effective_wait_for_remote(Some(false)));
    }

    #[test]
    fn logical_accounting_counts_characters_across_chunks() {
        let text = "héllo wörld".as_bytes();
        let (a, b) = text.split_at(2); // splits the two-byte 'é'
        let logical = SizeAccounting::Logical.measure(a) + SizeAccounting::Logical.measure(b);
        assert_eq!(logical, 11);
        assert_eq!(SizeAccounting::Bytes.measure(text), 13);
    }
}
