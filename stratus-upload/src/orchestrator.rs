use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::asset::{AssetMaterializer, AssetRecord};
use crate::cipher::{CipherFactory, DefaultCipherFactory};
use crate::keys::{DefaultNaming, NamingPolicy, UploadDirectory};
use crate::pipeline::{self, FilePlan, PipelineContext};
use crate::session::{SessionCallbacks, SessionOptions, UploadSession};
use crate::{
    FileRecord, FilePart, FormEvent, FormEventStream, RemoteStatus, StorageBackend, UploadConfig, UploadCtx,
    UploadError, UploadResult, UploadSnapshot,
};

type Outcome = oneshot::Sender<UploadResult<UploadSnapshot>>;

/// A single file stored outside a multipart request
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file: FileRecord,
    pub asset: Option<AssetRecord>,
}

/// Drives upload sessions against one storage backend.
///
/// Cheap to clone; every request gets its own [`UploadSession`].
#[derive(Clone)]
pub struct UploadOrchestrator {
    backend: Arc<dyn StorageBackend>,
    config: Arc<UploadConfig>,
    naming: Arc<dyn NamingPolicy>,
    ciphers: Arc<dyn CipherFactory>,
    materializer: Option<Arc<dyn AssetMaterializer>>,
}

impl UploadOrchestrator {
    pub fn new<B>(backend: B, config: UploadConfig) -> Self
    where
        B: StorageBackend + 'static,
    {
        Self::from_shared(Arc::new(backend), config)
    }

    pub fn from_shared(backend: Arc<dyn StorageBackend>, config: UploadConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            naming: Arc::new(DefaultNaming),
            ciphers: Arc::new(DefaultCipherFactory),
            materializer: None,
        }
    }

    pub fn with_naming<N: NamingPolicy + 'static>(mut self, naming: N) -> Self {
        self.naming = Arc::new(naming);
        self
    }

    pub fn with_cipher_factory<C: CipherFactory + 'static>(mut self, ciphers: C) -> Self {
        self.ciphers = Arc::new(ciphers);
        self
    }

    pub fn with_materializer<M: AssetMaterializer + 'static>(mut self, materializer: M) -> Self {
        self.materializer = Some(Arc::new(materializer));
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn has_materializer(&self) -> bool {
        self.materializer.is_some()
    }

    /// Run one multipart request to its terminal state.
    ///
    /// Consumes classified events, spawns one pipeline per file and resolves
    /// with the snapshot passed to the completion callback, or with the
    /// abort reason. Cancelling `cancel` aborts every pipeline (their sinks
    /// are aborted before this returns) and the session.
    ///
    /// In fire-and-forget mode the snapshot can resolve before remote legs
    /// conclude; those keep running in the background.
    #[instrument(skip_all, fields(request_id = %ctx.request_id))]
    pub async fn process(
        &self,
        ctx: UploadCtx,
        mut events: FormEventStream,
        cancel: CancellationToken,
    ) -> UploadResult<UploadSnapshot> {
        let (tx, mut rx) = oneshot::channel();
        let session = Arc::new(UploadSession::new(
            ctx.request_id.clone(),
            SessionOptions::resolve(&self.config, &ctx),
            outcome_callbacks(tx),
        ));

        let pipelines = cancel.child_token();
        let pctx = Arc::new(PipelineContext {
            session: session.clone(),
            backend: self.backend.clone(),
            ciphers: self.ciphers.clone(),
            config: self.config.clone(),
            directory: UploadDirectory::resolve(&self.config, ctx.upload_path_override.as_deref(), Utc::now()),
            cancel: pipelines.clone(),
        });

        let mut tasks = JoinSet::new();
        let mut file_count = 0usize;

        let fatal = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(UploadError::Cancelled),
                next = events.next() => next,
            };

            match next {
                None => break None,
                Some(Err(e)) => {
                    break Some(match e {
                        UploadError::ClassifierFraming { .. } => e,
                        other => UploadError::framing(other.to_string()),
                    })
                }
                Some(Ok(FormEvent::Field { name, value })) => {
                    if let Err(e) = session.on_field(&name, &value) {
                        break Some(e);
                    }
                }
                Some(Ok(FormEvent::File(part))) => {
                    let index = match session.on_file_part(&part.field_name, &part.filename) {
                        Ok(index) => index,
                        Err(e) => break Some(e),
                    };
                    let plan = FilePlan {
                        index,
                        assigned_name: self.naming.assign_name(&part.filename),
                    };
                    debug!(index, field = %part.field_name, name = %plan.assigned_name, "spawning file pipeline");
                    tasks.spawn(pipeline::run(pctx.clone(), plan, part));
                    file_count += 1;
                }
            }
        };
        drop(events);

        let observed = match fatal {
            Some(error) => Err(error),
            None => session.on_all_parts_observed(file_count),
        };
        if let Err(error) = observed {
            warn!(error = %error, "request aborted before all parts were observed");
            pipelines.cancel();
            join_all(&mut tasks).await;
            session.abort(error);
        }

        let result = loop {
            tokio::select! {
                biased;
                result = &mut rx => break result,
                _ = cancel.cancelled() => {
                    pipelines.cancel();
                    join_all(&mut tasks).await;
                    session.abort(UploadError::Cancelled);
                },
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(failure) = joined.and_then(task_failure) {
                        session.abort(failure);
                    }
                }
            }
        };

        let result = result.unwrap_or_else(|_| Err(UploadError::invalid_state("session ended without a terminal callback")));
        match &result {
            Ok(snapshot) => {
                if !tasks.is_empty() {
                    debug!(pending = tasks.len(), "detaching remote legs still in flight");
                }
                tasks.detach_all();
                info!(files = snapshot.files.len(), failed = snapshot.failed_files().count(), "upload processed");
            }
            Err(error) => {
                pipelines.cancel();
                join_all(&mut tasks).await;
                info!(error = %error, "upload aborted");
            }
        }
        result
    }

    /// Store one file outside a multipart request, always waiting for the
    /// remote leg. Local or remote failures are returned as errors.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, filename = %part.filename))]
    pub async fn upload_file(&self, ctx: UploadCtx, part: FilePart) -> UploadResult<StoredFile> {
        let ctx = ctx.with_wait_for_remote(true);
        let events: FormEventStream = Box::pin(futures_util::stream::once(async move { Ok(FormEvent::File(part)) }));
        let snapshot = self.process(ctx, events, CancellationToken::new()).await?;

        let file = snapshot
            .files
            .into_iter()
            .next()
            .ok_or_else(|| UploadError::invalid_state("upload finished without a file record"))?;

        if let Some(message) = &file.error {
            return Err(UploadError::file_stream(&file.field_name, message.clone()));
        }
        if let RemoteStatus::Failed { reason } = &file.remote {
            return Err(UploadError::remote(&file.key, reason.clone()));
        }

        let asset = if self.config.save_file_to_asset {
            self.create_assets(std::slice::from_ref(&file), None).await?.into_iter().next()
        } else {
            None
        };
        Ok(StoredFile { file, asset })
    }

    /// Persist assets for every successfully stored file of a snapshot.
    ///
    /// Returns nothing when no materializer is attached.
    pub async fn materialize(
        &self,
        snapshot: &UploadSnapshot,
        body: Option<serde_json::Value>,
    ) -> UploadResult<Vec<AssetRecord>> {
        let stored: Vec<FileRecord> = snapshot
            .files
            .iter()
            .filter(|f| !f.is_errored())
            .cloned()
            .collect();
        self.create_assets(&stored, body).await
    }

    async fn create_assets(&self, files: &[FileRecord], body: Option<serde_json::Value>) -> UploadResult<Vec<AssetRecord>> {
        let Some(materializer) = &self.materializer else {
            return Ok(Vec::new());
        };
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let records = files
            .iter()
            .map(|file| AssetRecord::from_file(file, body.clone()))
            .collect();
        materializer.create(records).await.map_err(|e| match e {
            UploadError::AssetPersistence { .. } => e,
            other => UploadError::asset(other),
        })
    }

    /// Delete the stored object behind an asset.
    ///
    /// Returns `false` for local assets, which have nothing stored remotely.
    #[instrument(skip_all, fields(asset = %asset.id))]
    pub async fn remove(&self, asset: &AssetRecord) -> UploadResult<bool> {
        if asset.is_local() {
            debug!("local asset, nothing to remove remotely");
            return Ok(false);
        }

        let key = asset
            .cloud_file_path()
            .ok_or_else(|| UploadError::config("asset has no cloudfilepath attribute"))?;
        if let Some(container) = asset.attributes.get("cloudcontainername") {
            if container != self.backend.container() {
                warn!(asset_container = %container, backend_container = %self.backend.container(), "container mismatch");
            }
        }

        self.backend.delete(key).await?;
        info!(key = %key, "removed stored object");
        Ok(true)
    }
}

fn outcome_callbacks(tx: Outcome) -> SessionCallbacks {
    let complete = Arc::new(Mutex::new(Some(tx)));
    let abort = complete.clone();
    SessionCallbacks::new(
        move |snapshot| {
            if let Some(tx) = complete.lock().take() {
                let _ = tx.send(Ok(snapshot));
            }
        },
        move |error| {
            if let Some(tx) = abort.lock().take() {
                let _ = tx.send(Err(error));
            }
        },
    )
}

async fn join_all(tasks: &mut JoinSet<UploadResult<()>>) {
    while let Some(joined) = tasks.join_next().await {
        if let Some(failure) = task_failure(joined) {
            debug!(error = %failure, "pipeline failed during shutdown");
        }
    }
}

/// Session-fatal failure of a finished pipeline task, if any
fn task_failure(joined: Result<UploadResult<()>, tokio::task::JoinError>) -> Option<UploadError> {
    match joined {
        Ok(Ok(())) | Ok(Err(UploadError::Cancelled)) => None,
        Ok(Err(e)) if e.is_session_fatal() => Some(e),
        Ok(Err(e)) => {
            warn!(error = %e, "file pipeline failed");
            None
        }
        Err(join_error) if join_error.is_cancelled() => None,
        Err(join_error) => {
            error!(error = %join_error, "file pipeline panicked");
            Some(UploadError::invalid_state(format!("file pipeline panicked: {}", join_error)))
        }
    }
}
