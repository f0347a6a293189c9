//! # stratus-upload: streaming multipart uploads to cloud object stores
//!
//! `stratus-upload` takes the classified events of a multipart request (form
//! fields and file sections) and streams every file to an object store while
//! counting its bytes, optionally encrypting it on the way. It tracks each
//! request in an [`UploadSession`] and decides when the request is done.
//!
//! ## Key Features
//!
//! - **Streaming-first**: file bytes flow chunk by chunk from the request to the store
//! - **Concurrent files**: every file section gets its own pipeline
//! - **Two completion modes**: wait for every remote upload, or answer as soon as the body is read
//! - **Client-side encryption**: ChaCha20-Poly1305 framed stream cipher
//! - **Storage agnostic**: Amazon S3, Google Cloud Storage, Azure Blob Storage, memory
//! - **Server agnostic**: no HTTP coupling, see `stratus-axum` for the axum layer
//!
//! ## Quick Start
//!
//! ```rust
//! use stratus_upload::prelude::*;
//! use bytes::Bytes;
//! use futures_util::stream;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let store = MemoryStore::new();
//! let orchestrator = UploadOrchestrator::new(store.clone(), UploadConfig::default());
//!
//! let body: ByteStream = Box::pin(stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"hello"))]));
//! let events: FormEventStream = Box::pin(stream::iter(vec![
//!     Ok::<_, UploadError>(FormEvent::Field { name: "title".into(), value: "greeting".into() }),
//!     Ok(FormEvent::File(FilePart::new("doc", "hello.txt", body).with_mime_type("text/plain"))),
//! ]));
//!
//! let snapshot = orchestrator.process(UploadCtx::new(), events, CancellationToken::new()).await?;
//! assert_eq!(snapshot.files[0].size, 5);
//! assert_eq!(store.keys().len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │  FormEventStream   │  ← fields and file parts, from any classifier
//! ├────────────────────┤
//! │ UploadOrchestrator │  ← one pipeline per file, cancellation
//! ├────────────────────┤
//! │   UploadSession    │  ← state machine + completion policy
//! ├────────────────────┤
//! │   StorageBackend   │  ← sinks: write / finish / abort
//! └────────────────────┘
//! ```

mod asset;
pub mod cipher;
#[cfg(any(feature = "gcs", feature = "azure"))]
mod cloud_store;
mod config;
mod error;
mod keys;
mod memory_store;
mod orchestrator;
mod pipeline;
pub mod policy;
#[cfg(feature = "s3")]
mod s3_store;
mod session;
pub mod store;
mod types;

// Re-export main types for clean API
pub use asset::{AssetMaterializer, AssetRecord, MemoryAssetStore};
pub use cipher::{CipherAlgorithm, CipherFactory, CipherSink, ChunkCipher, DefaultCipherFactory, FramedChaCha20Poly1305};
#[cfg(any(feature = "gcs", feature = "azure"))]
pub use cloud_store::{azure_public_path, google_public_path, ObjectStoreBackend};
pub use config::{ConfigMap, EncryptionConfig, FileErrorPolicy, SizeAccounting, UploadConfig};
pub use error::{UploadError, UploadResult};
pub use keys::{DefaultNaming, KeepOriginalName, NamingPolicy, UploadDirectory};
pub use memory_store::{MemoryStore, StoredObject};
pub use orchestrator::{StoredFile, UploadOrchestrator};
pub use policy::{CompletionDecision, Phase, PolicyInput};
#[cfg(feature = "s3")]
pub use s3_store::{S3Config, S3Store};
pub use session::{AbortCallback, CompletionCallback, SessionCallbacks, SessionOptions, SessionState, UploadSession};
pub use store::{Provider, PublicPath, RemoteReceipt, StorageBackend, UploadSink};
pub use types::{
    ByteStream, EncryptionMeta, FileRecord, FilePart, FormEvent, FormEventStream, RemoteStatus, RemoteUpload,
    UploadCtx, UploadSnapshot,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ByteStream, FilePart, FormEvent, FormEventStream, MemoryStore, StorageBackend, UploadConfig, UploadCtx,
        UploadError, UploadOrchestrator, UploadResult, UploadSnapshot,
    };
    pub use tokio_util::sync::CancellationToken;
}
