use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use stratus_upload::{AssetRecord, UploadCtx, UploadError, UploadOrchestrator, UploadSnapshot};
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::classifier;
use crate::StratusAxumError;

/// Per-request override of the configured completion policy.
///
/// Insert it into request extensions ahead of [`CloudUploadLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForRemote(pub bool);

/// Per-request replacement for the computed upload directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPathOverride(pub String);

/// What the layer hands to the next handler when it does not respond itself
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub snapshot: UploadSnapshot,
    pub assets: Vec<AssetRecord>,
}

/// Middleware that streams `multipart/form-data` uploads to cloud storage.
///
/// Non-multipart requests pass through untouched. For multipart requests
/// the layer either answers with the upload summary (`send_response`) or
/// forwards the request with the form fields as a JSON body and an
/// [`UploadOutcome`] extension.
#[derive(Clone)]
pub struct CloudUploadLayer {
    orchestrator: UploadOrchestrator,
}

impl CloudUploadLayer {
    pub fn new(orchestrator: UploadOrchestrator) -> Self {
        Self { orchestrator }
    }
}

impl<S> Layer<S> for CloudUploadLayer {
    type Service = CloudUploadService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CloudUploadService {
            inner,
            orchestrator: self.orchestrator.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CloudUploadService<S> {
    inner: S,
    orchestrator: UploadOrchestrator,
}

impl<S> Service<Request<Body>> for CloudUploadService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let orchestrator = self.orchestrator.clone();

        Box::pin(async move {
            if !classifier::is_multipart(req.headers()) {
                return inner.call(req).await;
            }

            let Some(boundary) = classifier::boundary(req.headers()) else {
                let error = UploadError::framing("multipart content-type without a boundary");
                return Ok(StratusAxumError::from(error).into_response());
            };

            let (mut parts, body) = req.into_parts();
            let ctx = upload_ctx(&parts);
            let request_id = ctx.request_id.clone();
            debug!(request_id = %request_id, "multipart upload started");

            let events = classifier::classify(body, boundary, orchestrator.config().chunk_channel_capacity);
            let snapshot = match run(&orchestrator, ctx, events).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e.0, "multipart upload failed");
                    return Ok(e.into_response());
                }
            };

            let config = orchestrator.config();
            let assets = if config.save_file_to_asset && orchestrator.has_materializer() {
                let body = serde_json::to_value(&snapshot.fields).ok();
                match orchestrator.materialize(&snapshot, body).await {
                    Ok(assets) => assets,
                    Err(e) => return Ok(StratusAxumError::from(e).into_response()),
                }
            } else {
                Vec::new()
            };

            info!(
                request_id = %request_id,
                files = snapshot.files.len(),
                assets = assets.len(),
                "multipart upload finished"
            );

            if config.send_response {
                let body = json!({
                    "fields": snapshot.fields,
                    "files": snapshot.files,
                    "remote_uploads": snapshot.remote_uploads,
                    "assets": assets,
                });
                return Ok((StatusCode::OK, Json(body)).into_response());
            }

            let json_bytes = serde_json::to_vec(&snapshot.fields).unwrap_or_else(|_| b"{}".to_vec());
            parts.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(json_bytes.len()));
            parts.extensions.insert(UploadOutcome { snapshot, assets });

            inner.call(Request::from_parts(parts, Body::from(json_bytes))).await
        })
    }
}

fn upload_ctx(parts: &axum::http::request::Parts) -> UploadCtx {
    let mut ctx = UploadCtx::new();
    if let Some(id) = parts.headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_request_id(id);
    }
    if let Some(WaitForRemote(wait)) = parts.extensions.get::<WaitForRemote>() {
        ctx = ctx.with_wait_for_remote(*wait);
    }
    if let Some(UploadPathOverride(path)) = parts.extensions.get::<UploadPathOverride>() {
        ctx = ctx.with_upload_path(path.clone());
    }
    ctx
}

/// Process on a separate task so a dropped request cancels cleanly: the
/// guard fires the token, the orchestrator aborts every open sink.
async fn run(
    orchestrator: &UploadOrchestrator,
    ctx: UploadCtx,
    events: stratus_upload::FormEventStream,
) -> Result<UploadSnapshot, StratusAxumError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.process(ctx, events, cancel).await })
    };
    let joined = task.await;
    // Fire-and-forget remote legs outlive the request
    guard.disarm();

    match joined {
        Ok(result) => result.map_err(StratusAxumError::from),
        Err(join_error) => Err(StratusAxumError(anyhow::anyhow!("upload task failed: {}", join_error))),
    }
}
