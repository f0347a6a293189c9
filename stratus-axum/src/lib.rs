//! stratus-axum: Axum adapter for stratus-upload.
//!
//! Wraps an [`UploadOrchestrator`](stratus_upload::UploadOrchestrator) in a
//! tower layer that classifies `multipart/form-data` bodies with `multer`
//! and streams every file to the configured storage backend.
//!
//! ```rust,no_run
//! use axum::{routing::post, Router};
//! use stratus_axum::CloudUploadLayer;
//! use stratus_upload::{MemoryStore, UploadConfig, UploadOrchestrator};
//!
//! let orchestrator = UploadOrchestrator::new(MemoryStore::new(), UploadConfig::default());
//! let app: Router = Router::new()
//!     .route("/upload", post(|| async { "unreachable with send_response" }))
//!     .layer(CloudUploadLayer::new(orchestrator));
//! ```

pub mod classifier;
mod error;
pub mod middlewares;

pub use error::StratusAxumError;
pub use middlewares::{CloudUploadLayer, CloudUploadService, UploadOutcome, UploadPathOverride, WaitForRemote};
pub use stratus_upload;
