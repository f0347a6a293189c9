//! Per-request upload state.
//!
//! An [`UploadSession`] collects field values, local file completions and
//! remote upload completions, which may arrive in any interleaving. After
//! every mutation it asks the completion policy whether the request is done
//! and fires the completion callback at most once.
//!
//! ```text
//! Open ──on_all_parts_observed──▶ AllPartsObserved ──policy──▶ Finished
//!   │                                   │
//!   └────────────── abort ──────────────┴──────────────────────▶ Aborted
//! ```

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::policy::{self, Phase, PolicyInput};
use crate::{FileRecord, RemoteStatus, RemoteUpload, UploadConfig, UploadCtx, UploadError, UploadResult, UploadSnapshot};

pub type CompletionCallback = Box<dyn FnOnce(UploadSnapshot) + Send>;
pub type AbortCallback = Box<dyn FnOnce(UploadError) + Send>;

/// The two terminal callbacks of a session; exactly one of them ever runs
pub struct SessionCallbacks {
    on_complete: CompletionCallback,
    on_abort: AbortCallback,
}

impl SessionCallbacks {
    pub fn new<C, A>(on_complete: C, on_abort: A) -> Self
    where
        C: FnOnce(UploadSnapshot) + Send + 'static,
        A: FnOnce(UploadError) + Send + 'static,
    {
        Self {
            on_complete: Box::new(on_complete),
            on_abort: Box::new(on_abort),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    AllPartsObserved,
    Finished,
    Aborted,
}

/// Behavior switches a session is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub wait_for_remote: bool,
    /// Whether file parts get a remote leg at all
    pub remote_enabled: bool,
}

impl SessionOptions {
    /// Resolve the options for one request, honoring its overrides
    pub fn resolve(config: &UploadConfig, ctx: &UploadCtx) -> Self {
        Self {
            wait_for_remote: config.effective_wait_for_remote(ctx.wait_for_remote),
            remote_enabled: config.save_to_disk,
        }
    }
}

#[derive(Debug)]
struct PartSlot {
    field_name: String,
    local_done: bool,
    remote_done: bool,
}

struct Inner {
    state: SessionState,
    finished: bool,
    expected_files: Option<usize>,
    fields: BTreeMap<String, serde_json::Value>,
    parts: Vec<PartSlot>,
    files: Vec<FileRecord>,
    remote: Vec<RemoteUpload>,
    callbacks: Option<SessionCallbacks>,
}

pub struct UploadSession {
    request_id: String,
    options: SessionOptions,
    inner: Mutex<Inner>,
}

impl UploadSession {
    pub fn new<S: Into<String>>(request_id: S, options: SessionOptions, callbacks: SessionCallbacks) -> Self {
        Self {
            request_id: request_id.into(),
            options,
            inner: Mutex::new(Inner {
                state: SessionState::Open,
                finished: false,
                expected_files: None,
                fields: BTreeMap::new(),
                parts: Vec::new(),
                files: Vec::new(),
                remote: Vec::new(),
                callbacks: Some(callbacks),
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Store an ordinary form field. Repeated names collect into an array.
    pub fn on_field(&self, name: &str, value: &str) -> UploadResult<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner, "field")?;
        insert_field(&mut inner.fields, name, value);
        Ok(())
    }

    /// Register a new pending file and return its index.
    ///
    /// The field name is recorded with the client filename as its value.
    pub fn on_file_part(&self, field_name: &str, filename: &str) -> UploadResult<usize> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner, "file part")?;
        insert_field(&mut inner.fields, field_name, filename);

        let index = inner.parts.len();
        inner.parts.push(PartSlot {
            field_name: field_name.to_string(),
            local_done: false,
            remote_done: false,
        });
        debug!(request_id = %self.request_id, index, field = field_name, "file part registered");
        Ok(index)
    }

    /// A file's local stream reached its end (or failed)
    pub fn on_file_local_complete(&self, record: FileRecord) -> UploadResult<()> {
        let fire = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Open | SessionState::AllPartsObserved => {}
                SessionState::Aborted => {
                    debug!(request_id = %self.request_id, index = record.index, "local completion after abort dropped");
                    return Ok(());
                }
                SessionState::Finished => {
                    return Err(UploadError::invalid_state("local completion after session finished"));
                }
            }

            let slot = inner
                .parts
                .get_mut(record.index)
                .ok_or_else(|| UploadError::invalid_state(format!("unknown file index {}", record.index)))?;
            if slot.local_done {
                return Err(UploadError::invalid_state(format!(
                    "file {} ('{}') already completed locally",
                    record.index, slot.field_name
                )));
            }
            slot.local_done = true;

            if let Some(error) = &record.error {
                warn!(request_id = %self.request_id, index = record.index, error = %error, "file stream failed");
            }
            debug!(request_id = %self.request_id, index = record.index, size = record.size, "file local complete");
            inner.files.push(record);
            self.take_completion(&mut inner)
        };
        self.fire(fire);
        Ok(())
    }

    /// A file's storage sink emitted its terminal signal
    pub fn on_remote_upload_complete(&self, upload: RemoteUpload) -> UploadResult<()> {
        let fire = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Open | SessionState::AllPartsObserved => {}
                SessionState::Finished | SessionState::Aborted => {
                    debug!(
                        request_id = %self.request_id,
                        index = upload.index,
                        key = %upload.key,
                        "remote completion after session end dropped"
                    );
                    return Ok(());
                }
            }

            let slot = inner
                .parts
                .get_mut(upload.index)
                .ok_or_else(|| UploadError::invalid_state(format!("unknown file index {}", upload.index)))?;
            if slot.remote_done {
                return Err(UploadError::invalid_state(format!(
                    "file {} already completed remotely",
                    upload.index
                )));
            }
            slot.remote_done = true;

            if let RemoteStatus::Failed { reason } = &upload.outcome {
                warn!(request_id = %self.request_id, key = %upload.key, reason = %reason, "remote upload failed");
            }
            inner.remote.push(upload);
            self.take_completion(&mut inner)
        };
        self.fire(fire);
        Ok(())
    }

    /// The classifier signaled end-of-stream after `expected_files` file parts
    pub fn on_all_parts_observed(&self, expected_files: usize) -> UploadResult<()> {
        let fire = {
            let mut inner = self.inner.lock();
            Self::require_open(&inner, "end of stream")?;
            if expected_files != inner.parts.len() {
                return Err(UploadError::framing(format!(
                    "classifier reported {} files but {} were observed",
                    expected_files,
                    inner.parts.len()
                )));
            }
            inner.state = SessionState::AllPartsObserved;
            inner.expected_files = Some(expected_files);
            debug!(request_id = %self.request_id, expected_files, "all parts observed");
            self.take_completion(&mut inner)
        };
        self.fire(fire);
        Ok(())
    }

    /// Move to the terminal aborted state and run the abort callback.
    ///
    /// Returns false when the session had already finished or aborted.
    pub fn abort(&self, reason: UploadError) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Finished | SessionState::Aborted) {
                return false;
            }
            inner.state = SessionState::Aborted;
            inner.callbacks.take()
        };

        info!(request_id = %self.request_id, reason = %reason, "upload session aborted");
        if let Some(callbacks) = callbacks {
            (callbacks.on_abort)(reason);
        }
        true
    }

    /// Current view of the session
    pub fn snapshot(&self) -> UploadSnapshot {
        let inner = self.inner.lock();
        self.build_snapshot(&inner)
    }

    fn require_open(inner: &Inner, what: &str) -> UploadResult<()> {
        if inner.state != SessionState::Open {
            return Err(UploadError::invalid_state(format!(
                "{} received while session is {:?}",
                what, inner.state
            )));
        }
        Ok(())
    }

    fn phase(inner: &Inner) -> Phase {
        match (inner.state, inner.expected_files) {
            (SessionState::AllPartsObserved, Some(expected_files)) => Phase::AllPartsObserved { expected_files },
            (SessionState::Open, _) | (SessionState::AllPartsObserved, None) => Phase::Open,
            (SessionState::Finished | SessionState::Aborted, _) => Phase::Terminal,
        }
    }

    /// Completion check; must run under the lock after every mutation
    fn take_completion(&self, inner: &mut Inner) -> Option<(CompletionCallback, UploadSnapshot)> {
        let decision = policy::decide(PolicyInput {
            phase: Self::phase(inner),
            wait_for_remote: self.options.wait_for_remote,
            completed_files: inner.files.len(),
            completed_remote: inner.remote.len(),
        });

        if !decision.is_complete || inner.finished {
            return None;
        }

        inner.finished = true;
        inner.state = SessionState::Finished;
        let snapshot = self.build_snapshot(inner);
        inner.callbacks.take().map(|cb| (cb.on_complete, snapshot))
    }

    fn fire(&self, fire: Option<(CompletionCallback, UploadSnapshot)>) {
        if let Some((on_complete, snapshot)) = fire {
            info!(
                request_id = %self.request_id,
                files = snapshot.files.len(),
                remote_uploads = snapshot.remote_uploads.len(),
                "upload session complete"
            );
            on_complete(snapshot);
        }
    }

    fn build_snapshot(&self, inner: &Inner) -> UploadSnapshot {
        let files = inner
            .files
            .iter()
            .map(|file| {
                let mut file = file.clone();
                file.remote = if !self.options.remote_enabled {
                    RemoteStatus::Skipped
                } else {
                    inner
                        .remote
                        .iter()
                        .find(|r| r.index == file.index)
                        .map(|r| r.outcome.clone())
                        .unwrap_or(RemoteStatus::Pending)
                };
                file
            })
            .collect();

        UploadSnapshot {
            request_id: self.request_id.clone(),
            fields: inner.fields.clone(),
            files,
            remote_uploads: inner.remote.clone(),
        }
    }
}

fn insert_field(fields: &mut BTreeMap<String, serde_json::Value>, name: &str, value: &str) {
    use serde_json::Value;

    let value = Value::String(value.to_string());
    match fields.get_mut(name) {
        None => {
            fields.insert(name.to_string(), value);
        }
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncryptionMeta, Provider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn record(index: usize) -> FileRecord {
        FileRecord {
            index,
            field_name: format!("file{}", index),
            original_filename: format!("f{}.txt", index),
            filename: format!("f{}.txt", index),
            encoding: "7bit".to_string(),
            mime_type: "text/plain".to_string(),
            size: 10,
            key: format!("up/f{}.txt", index),
            url: format!("https://cdn/up/f{}.txt", index),
            provider: Provider::Memory,
            upload_directory: "up".to_string(),
            encryption: EncryptionMeta::default(),
            attributes: BTreeMap::new(),
            error: None,
            remote: RemoteStatus::Pending,
        }
    }

    fn stored(index: usize) -> RemoteUpload {
        RemoteUpload {
            index,
            key: format!("up/f{}.txt", index),
            outcome: RemoteStatus::Stored { etag: None },
            stored_bytes: 10,
        }
    }

    fn counting_session(wait: bool) -> (UploadSession, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let completed = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicUsize::new(0));
        let (c, a) = (completed.clone(), aborted.clone());
        let session = UploadSession::new(
            "req-1",
            SessionOptions {
                wait_for_remote: wait,
                remote_enabled: true,
            },
            SessionCallbacks::new(
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                },
            ),
        );
        (session, completed, aborted)
    }

    #[test]
    fn fields_only_form_completes_on_end_of_stream() {
        let (session, completed, _) = counting_session(true);
        session.on_field("title", "hello").unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        session.on_all_parts_observed(0).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Finished);
    }

    #[test]
    fn repeated_fields_collect_into_arrays() {
        let (session, _, _) = counting_session(true);
        session.on_field("tag", "a").unwrap();
        session.on_field("tag", "b").unwrap();
        session.on_field("tag", "c").unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.fields["tag"], serde_json::json!(["a", "b", "c"]));
    }

    #[test]
    fn fields_are_rejected_after_end_of_stream() {
        let (session, _, _) = counting_session(true);
        session.on_file_part("doc", "a.txt").unwrap();
        session.on_all_parts_observed(1).unwrap();
        assert!(matches!(session.on_field("late", "x"), Err(UploadError::InvalidState { .. })));
    }

    #[test]
    fn remote_before_local_still_completes_once() {
        let (session, completed, _) = counting_session(true);
        session.on_file_part("doc", "a.txt").unwrap();
        session.on_remote_upload_complete(stored(0)).unwrap();
        session.on_all_parts_observed(1).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        session.on_file_local_complete(record(0)).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fire_and_forget_drops_late_remote_completions() {
        let (session, completed, _) = counting_session(false);
        session.on_file_part("a", "a.txt").unwrap();
        session.on_file_part("b", "b.txt").unwrap();
        session.on_file_local_complete(record(0)).unwrap();
        session.on_file_local_complete(record(1)).unwrap();
        session.on_all_parts_observed(2).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        session.on_remote_upload_complete(stored(0)).unwrap();
        session.on_remote_upload_complete(stored(1)).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(session.snapshot().remote_uploads.is_empty());
    }

    #[test]
    fn duplicate_and_unknown_completions_are_rejected() {
        let (session, _, _) = counting_session(true);
        session.on_file_part("a", "a.txt").unwrap();
        session.on_file_local_complete(record(0)).unwrap();
        assert!(session.on_file_local_complete(record(0)).is_err());
        assert!(session.on_file_local_complete(record(5)).is_err());
        assert!(session.on_remote_upload_complete(stored(3)).is_err());
        assert_eq!(session.snapshot().files.len(), 1);
    }

    #[test]
    fn mismatched_file_count_is_a_framing_error() {
        let (session, completed, _) = counting_session(true);
        session.on_file_part("a", "a.txt").unwrap();
        assert!(matches!(
            session.on_all_parts_observed(2),
            Err(UploadError::ClassifierFraming { .. })
        ));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_fires_abort_callback_only() {
        let (session, completed, aborted) = counting_session(true);
        session.on_file_part("a", "a.txt").unwrap();
        assert!(session.abort(UploadError::Cancelled));
        assert!(!session.abort(UploadError::Cancelled));

        session.on_file_local_complete(record(0)).unwrap();
        session.on_remote_upload_complete(stored(0)).unwrap();
        assert!(session.on_all_parts_observed(1).is_err());

        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn abort_after_finish_is_ignored() {
        let (session, completed, aborted) = counting_session(true);
        session.on_all_parts_observed(0).unwrap();
        assert!(!session.abort(UploadError::Cancelled));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(aborted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn snapshot_flags_remote_failures_per_file() {
        let (session, _, _) = counting_session(true);
        session.on_file_part("a", "a.txt").unwrap();
        session.on_file_part("b", "b.txt").unwrap();
        session.on_file_local_complete(record(0)).unwrap();
        session.on_file_local_complete(record(1)).unwrap();
        session.on_remote_upload_complete(stored(0)).unwrap();
        session
            .on_remote_upload_complete(RemoteUpload {
                outcome: RemoteStatus::Failed {
                    reason: "503".to_string(),
                },
                ..stored(1)
            })
            .unwrap();

        let snapshot = session.snapshot();
        let failed: Vec<_> = snapshot.failed_files().map(|f| f.index).collect();
        assert_eq!(failed, vec![1]);
    }
}
