use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cipher::{self, CipherFactory};
use crate::keys::UploadDirectory;
use crate::store::UploadSink;
use crate::{
    ByteStream, EncryptionMeta, FileErrorPolicy, FilePart, FileRecord, RemoteStatus, RemoteUpload, StorageBackend, UploadConfig,
    UploadError, UploadResult, UploadSession,
};

/// Shared by every file pipeline of one request
pub(crate) struct PipelineContext {
    pub session: Arc<UploadSession>,
    pub backend: Arc<dyn StorageBackend>,
    pub ciphers: Arc<dyn CipherFactory>,
    pub config: Arc<UploadConfig>,
    pub directory: UploadDirectory,
    pub cancel: CancellationToken,
}

/// Where one file goes and what its record looks like before any byte is read
pub(crate) struct FilePlan {
    pub index: usize,
    pub assigned_name: String,
}

/// Metadata record for a file before its bytes are counted
pub(crate) fn record_template(ctx: &PipelineContext, plan: &FilePlan, part: &FilePart) -> FileRecord {
    let key = ctx.directory.object_key(&plan.assigned_name);
    let public = ctx.backend.public_path();
    let url = public.url_for(&key, ctx.config.prefer_http);

    let mut attributes = BTreeMap::new();
    attributes.insert("cdn_uri".to_string(), public.cdn_uri.clone());
    attributes.insert("cdn_ssl_uri".to_string(), public.cdn_ssl_uri.clone());
    attributes.insert("endpoint".to_string(), public.endpoint.clone());
    attributes.insert("cloudfilepath".to_string(), key.clone());
    attributes.insert("cloudcontainername".to_string(), ctx.backend.container().to_string());
    attributes.insert("location".to_string(), url.clone());

    FileRecord {
        index: plan.index,
        field_name: part.field_name.clone(),
        original_filename: part.filename.clone(),
        filename: plan.assigned_name.clone(),
        encoding: part.encoding.clone(),
        mime_type: part.mime_type.clone(),
        size: 0,
        key,
        url,
        provider: ctx.backend.provider(),
        upload_directory: ctx.directory.periodic_dir.clone(),
        encryption: EncryptionMeta {
            encrypted: ctx.config.encryption.is_some(),
            algorithm: ctx.config.encryption.as_ref().map(|e| e.algorithm),
        },
        attributes,
        error: None,
        remote: RemoteStatus::Pending,
    }
}

/// What the byte counter hands to the writer
enum Feed {
    Chunk(Bytes),
    End,
    Failed(String),
}

/// Stream one file part to its sink while counting plaintext bytes.
///
/// The counter and the writer run side by side, joined by a channel of
/// `chunk_channel_capacity` chunks. The counter reports the local leg as
/// soon as the stream ends, whatever the writer is doing; the writer
/// reports the remote leg once the sink concludes. A writer stuck on a slow
/// provider holds at most that many chunks before the counter waits for it.
///
/// Returns `Err(Cancelled)` when the request is cancelled; the sink is
/// aborted first.
pub(crate) async fn run(ctx: Arc<PipelineContext>, plan: FilePlan, part: FilePart) -> UploadResult<()> {
    let record = record_template(&ctx, &plan, &part);

    if !ctx.session.options().remote_enabled {
        return count(&ctx, record, part.stream, None).await;
    }

    let (tx, rx) = mpsc::channel(ctx.config.chunk_channel_capacity.max(1));
    let key = record.key.clone();
    let (local, remote) = tokio::join!(
        count(&ctx, record, part.stream, Some(tx)),
        write(&ctx, plan.index, &key, &part.mime_type, rx),
    );
    local.and(remote)
}

/// Local leg: measure every chunk, forward it, report end-of-stream.
///
/// A file rejected by `max_file_bytes` keeps the size accepted before the
/// chunk that crossed the limit.
async fn count(
    ctx: &PipelineContext,
    mut record: FileRecord,
    mut stream: ByteStream,
    mut feed: Option<mpsc::Sender<Feed>>,
) -> UploadResult<()> {
    let accounting = ctx.config.size_accounting;
    let mut local_error: Option<UploadError> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(key = %record.key, "byte counter cancelled");
                return Err(UploadError::Cancelled);
            }
            next = stream.next() => next,
        };

        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                local_error = Some(UploadError::file_stream(&record.field_name, e.to_string()));
                break;
            }
        };

        let measured = accounting.measure(&chunk);
        if let Some(max) = ctx.config.max_file_bytes {
            if record.size + measured > max {
                local_error = Some(UploadError::file_stream(
                    &record.field_name,
                    format!("file exceeds maximum size of {} bytes", max),
                ));
                break;
            }
        }
        record.size += measured;
        forward(ctx, &mut feed, Feed::Chunk(chunk)).await?;
    }

    record.error = local_error.as_ref().map(|e| e.to_string());
    ctx.session.on_file_local_complete(record)?;

    let terminal = match &local_error {
        Some(error) => Feed::Failed(error.to_string()),
        None => Feed::End,
    };
    forward(ctx, &mut feed, terminal).await?;

    if let Some(error) = local_error {
        if ctx.config.file_error_policy == FileErrorPolicy::AbortRequest {
            ctx.session.abort(error);
        }
    }
    Ok(())
}

/// Hand an item to the writer. A writer that already concluded closes the
/// channel; counting carries on without it.
async fn forward(ctx: &PipelineContext, feed: &mut Option<mpsc::Sender<Feed>>, item: Feed) -> UploadResult<()> {
    let Some(tx) = feed.as_ref() else {
        return Ok(());
    };
    let sent = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(UploadError::Cancelled),
        sent = tx.send(item) => sent,
    };
    if sent.is_err() {
        *feed = None;
    }
    Ok(())
}

/// Remote leg: open the sink, write what the counter forwards, commit.
async fn write(
    ctx: &PipelineContext,
    index: usize,
    key: &str,
    mime_type: &str,
    mut rx: mpsc::Receiver<Feed>,
) -> UploadResult<()> {
    let opened = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return cancelled(None, key).await,
        opened = open_sink(ctx, key, mime_type) => opened,
    };

    // Upstream failures are the counter's to report to the session
    let (upload, upstream_failed) = match opened {
        Err(e) => (failed_upload(index, key, e.to_string()), false),
        Ok(mut sink) => loop {
            let feed = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return cancelled(Some(sink), key).await,
                feed = rx.recv() => feed,
            };

            match feed {
                Some(Feed::Chunk(chunk)) => {
                    let written = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => None,
                        written = sink.write(chunk) => Some(written),
                    };
                    match written {
                        None => return cancelled(Some(sink), key).await,
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            sink.abort().await;
                            break (failed_upload(index, key, e.to_string()), false);
                        }
                    }
                }
                Some(Feed::End) => {
                    let finished = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => None,
                        finished = sink.finish() => Some(finished),
                    };
                    let upload = match finished {
                        None => {
                            debug!(key = %key, "cancelled while committing upload");
                            return Err(UploadError::Cancelled);
                        }
                        Some(Ok(receipt)) => RemoteUpload {
                            index,
                            key: key.to_string(),
                            outcome: RemoteStatus::Stored { etag: receipt.etag },
                            stored_bytes: receipt.size_bytes,
                        },
                        Some(Err(e)) => failed_upload(index, key, e.to_string()),
                    };
                    break (upload, false);
                }
                Some(Feed::Failed(reason)) => {
                    sink.abort().await;
                    break (failed_upload(index, key, format!("upstream stream failed: {}", reason)), true);
                }
                // The counter only drops its sender without a terminal item when cancelled
                None => return cancelled(Some(sink), key).await,
            }
        },
    };
    // Stop the counter from queueing for a writer that is done
    drop(rx);

    let failure = match &upload.outcome {
        RemoteStatus::Failed { reason } => Some(UploadError::remote(key, reason.clone())),
        _ => None,
    };
    ctx.session.on_remote_upload_complete(upload)?;

    if let Some(error) = failure {
        warn!(key = %key, error = %error, "remote leg failed");
        if !upstream_failed && ctx.config.file_error_policy == FileErrorPolicy::AbortRequest {
            ctx.session.abort(error);
        }
    }
    Ok(())
}

async fn open_sink(ctx: &PipelineContext, key: &str, mime_type: &str) -> UploadResult<Box<dyn UploadSink>> {
    let sink = ctx.backend.open_sink(key, Some(mime_type)).await?;
    match &ctx.config.encryption {
        Some(encryption) => cipher::wrap(sink, encryption, ctx.ciphers.as_ref()).await,
        None => Ok(sink),
    }
}

async fn cancelled(sink: Option<Box<dyn UploadSink>>, key: &str) -> UploadResult<()> {
    if let Some(active) = sink {
        active.abort().await;
    }
    debug!(key = %key, "file pipeline cancelled");
    Err(UploadError::Cancelled)
}

fn failed_upload(index: usize, key: &str, reason: String) -> RemoteUpload {
    RemoteUpload {
        index,
        key: key.to_string(),
        outcome: RemoteStatus::Failed { reason },
        stored_bytes: 0,
    }
}
