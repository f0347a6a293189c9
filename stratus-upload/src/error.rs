use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while processing an upload request
#[derive(Error, Debug)]
pub enum UploadError {
    /// Malformed multipart body. Fatal to the whole request.
    #[error("Malformed multipart body: {message}")]
    ClassifierFraming { message: String },

    /// One file's byte stream failed. Fatal to that file only.
    #[error("File stream error on field '{field}': {message}")]
    FileStream { field: String, message: String },

    /// One file's remote leg failed.
    #[error("Remote upload of '{key}' failed: {message}")]
    RemoteUpload { key: String, message: String },

    #[error("Asset persistence failed: {source}")]
    AssetPersistence {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Upload request was cancelled")]
    Cancelled,

    #[error("Invalid session state: {message}")]
    InvalidState { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Cipher error: {message}")]
    Cipher { message: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl UploadError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an asset persistence error from any error type
    pub fn asset<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::AssetPersistence {
            source: error.into(),
        }
    }

    pub fn framing<S: Into<String>>(message: S) -> Self {
        Self::ClassifierFraming {
            message: message.into(),
        }
    }

    pub fn file_stream<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::FileStream {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn remote<K: Into<String>, S: Into<String>>(key: K, message: S) -> Self {
        Self::RemoteUpload {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn cipher<S: Into<String>>(message: S) -> Self {
        Self::Cipher {
            message: message.into(),
        }
    }

    /// True for errors that end the whole request rather than one file
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::ClassifierFraming { .. } | Self::Cancelled | Self::InvalidState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_request_level_errors_are_session_fatal() {
        assert!(UploadError::framing("bad boundary").is_session_fatal());
        assert!(UploadError::Cancelled.is_session_fatal());
        assert!(UploadError::invalid_state("late signal").is_session_fatal());

        assert!(!UploadError::file_stream("doc", "reset").is_session_fatal());
        assert!(!UploadError::remote("up/a.txt", "503").is_session_fatal());
        assert!(!UploadError::asset("db down").is_session_fatal());
    }
}
