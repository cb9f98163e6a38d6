//! Chunked upload sessions.
//!
//! A game arrives as one declared session covering one or more files.
//! Chunks are written into a staging directory under the install root
//! (`<root>/.partial/<session-id>`); nothing is visible at the final
//! destination until verification passes and the staging directory is
//! renamed into place. At most one session receives at a time.

mod session;

pub use session::{ChunkOutcome, SessionState, UploadSession};

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::events::{EventQueue, OperationEvent, OperationKind, OperationStatus, Topic};

/// Upload manager settings.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root directory completed games land under.
    pub install_root: PathBuf,
    /// Idle time before a silent session is reaped.
    pub idle_timeout: Duration,
}

/// Name of the staging directory under the install root.
const PARTIAL_DIR: &str = ".partial";

/// Ack counters returned for every accepted (or re-sent) chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAckInfo {
    /// Bytes this chunk added; zero for a retransmission.
    pub bytes_written: u64,
    /// Total unique bytes received so far.
    pub total_received: u64,
}

/// Snapshot of the active session for status queries.
#[derive(Debug, Clone)]
pub struct UploadStatus {
    /// Session id.
    pub session_id: String,
    /// Declared game name.
    pub name: String,
    /// Whole-percent progress.
    pub progress: u8,
    /// Unique bytes received.
    pub bytes_received: u64,
    /// Declared total size.
    pub total_size: u64,
}

struct ActiveUpload {
    session: UploadSession,
    // One file receives contiguous chunks at a time; cache its handle so
    // every chunk does not reopen it.
    open_file: Option<(PathBuf, tokio::fs::File)>,
}

/// Owns the single upload slot and all staging I/O.
pub struct UploadManager {
    config: UploadConfig,
    active: Mutex<Option<ActiveUpload>>,
    events: Arc<EventQueue>,
}

impl UploadManager {
    /// Create a manager over the configured install root.
    pub fn new(config: UploadConfig, events: Arc<EventQueue>) -> Self {
        Self {
            config,
            active: Mutex::new(None),
            events,
        }
    }

    /// The configured install root.
    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.config.install_root
    }

    /// Declare a new upload.
    ///
    /// Validates the destination against the install root, checks free
    /// space against the declared size, creates the staging directory, and
    /// emits an install-started event.
    ///
    /// # Errors
    ///
    /// [`AgentError::SessionConflict`] if a session is already active,
    /// [`AgentError::PathTraversal`] if the destination escapes the root,
    /// [`AgentError::InsufficientSpace`] if the declared size does not fit,
    /// [`AgentError::Validation`] on an empty name or zero size.
    pub async fn begin(
        &self,
        name: &str,
        total_size: u64,
        destination: Option<&str>,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(AgentError::validation("upload name must not be empty"));
        }
        if total_size == 0 {
            return Err(AgentError::validation("upload size must be non-zero"));
        }

        let mut slot = self.active.lock().await;
        if slot.is_some() {
            return Err(AgentError::SessionConflict);
        }

        tokio::fs::create_dir_all(&self.config.install_root).await?;
        let final_dest = self.resolve_destination(name, destination)?;

        let available = fs2::available_space(&self.config.install_root)?;
        if total_size > available {
            return Err(AgentError::InsufficientSpace {
                declared: total_size,
                available,
            });
        }

        let session_id = generate_session_id()?;
        let staging_dir = self
            .config
            .install_root
            .join(PARTIAL_DIR)
            .join(&session_id);
        tokio::fs::create_dir_all(&staging_dir).await?;

        let mut session = UploadSession::new(
            session_id.clone(),
            name.to_string(),
            total_size,
            final_dest,
            staging_dir,
        );
        session.start();

        tracing::info!(
            session_id = %session_id,
            name,
            total_size,
            "upload session started"
        );
        self.events.publish_operation(&OperationEvent {
            kind: OperationKind::Install,
            status: OperationStatus::Started,
            name: name.to_string(),
            progress: 0,
            message: None,
            path: None,
        });

        *slot = Some(ActiveUpload {
            session,
            open_file: None,
        });
        Ok(session_id)
    }

    /// Apply one chunk at its declared offset.
    ///
    /// Retransmitted ranges are skipped and re-acked with the current
    /// totals so the hub can resynchronize after a retry.
    ///
    /// # Errors
    ///
    /// [`AgentError::NoActiveSession`] / [`AgentError::SessionNotFound`]
    /// on a session mismatch, [`AgentError::PathTraversal`] on an unsafe
    /// file path, [`AgentError::SessionIntegrity`] if new bytes would
    /// exceed the declared total (the session is aborted), or
    /// [`AgentError::Storage`] on a write failure.
    pub async fn put_chunk(
        &self,
        session_id: &str,
        file_path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<ChunkAckInfo> {
        let mut slot = self.active.lock().await;
        let active = self.active_mut(&mut slot, session_id)?;

        if active.session.state() != SessionState::Receiving {
            return Err(AgentError::SessionIntegrity(
                "session is not accepting chunks".into(),
            ));
        }

        let relative = validate_relative_path(file_path)?;
        let len = data.len() as u64;

        match active.session.record_chunk(&relative, offset, len) {
            ChunkOutcome::Duplicate => {
                tracing::debug!(session_id, file_path, offset, len, "duplicate chunk skipped");
                Ok(ChunkAckInfo {
                    bytes_written: 0,
                    total_received: active.session.bytes_received(),
                })
            }
            ChunkOutcome::Applied => {
                if active.session.bytes_received() > active.session.total_size {
                    // New bytes past the declared total: the transfer is
                    // corrupt, drop everything staged.
                    let staging = active.session.staging_dir.clone();
                    let name = active.session.name.clone();
                    active.session.abort();
                    *slot = None;
                    drop(slot);
                    self.discard_staging(&staging).await;
                    self.publish_install_error(&name, "received more bytes than declared");
                    return Err(AgentError::SessionIntegrity(
                        "received more bytes than declared".into(),
                    ));
                }

                let target = active.session.staging_dir.join(&relative);
                write_at(&mut active.open_file, &target, offset, data).await?;

                let total_received = active.session.bytes_received();
                if let Some(pct) = active.session.throttled_progress() {
                    self.events.publish(
                        Topic::UploadProgress,
                        json!({
                            "sessionId": session_id,
                            "name": active.session.name,
                            "progress": pct,
                            "bytesReceived": total_received,
                            "totalSize": active.session.total_size,
                        }),
                    );
                }

                Ok(ChunkAckInfo {
                    bytes_written: len,
                    total_received,
                })
            }
        }
    }

    /// Verify and finalize the session.
    ///
    /// The received byte count must equal the declaration, and when the
    /// hub supplied a checksum the BLAKE3 hash of the staged payload must
    /// match it. On success the staging directory is renamed to the final
    /// destination in one step.
    ///
    /// # Errors
    ///
    /// [`AgentError::SessionIntegrity`] on a size or checksum mismatch, or
    /// [`AgentError::Storage`] on a placement failure. Either way the
    /// session is aborted and partials deleted.
    pub async fn finish(&self, session_id: &str, checksum: Option<&str>) -> Result<PathBuf> {
        let mut slot = self.active.lock().await;
        let active = self.active_mut(&mut slot, session_id)?;

        active.session.begin_finalize();
        active.open_file = None;

        let name = active.session.name.clone();
        let staging = active.session.staging_dir.clone();
        let final_dest = active.session.final_dest.clone();

        if !active.session.is_complete() {
            let received = active.session.bytes_received();
            let declared = active.session.total_size;
            active.session.abort();
            *slot = None;
            drop(slot);
            self.discard_staging(&staging).await;
            self.publish_install_error(&name, "transfer incomplete");
            return Err(AgentError::SessionIntegrity(
                format!("received {received} of {declared} declared bytes").into(),
            ));
        }

        if let Some(expected) = checksum {
            let actual = hash_staged_payload(staging.clone()).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                active.session.abort();
                *slot = None;
                drop(slot);
                self.discard_staging(&staging).await;
                self.publish_install_error(&name, "checksum mismatch");
                return Err(AgentError::SessionIntegrity("checksum mismatch".into()));
            }
        }

        if let Err(e) = place_artifact(&staging, &final_dest).await {
            active.session.abort();
            *slot = None;
            drop(slot);
            self.discard_staging(&staging).await;
            self.publish_install_error(&name, "storage failure");
            return Err(e);
        }

        active.session.complete();
        *slot = None;

        tracing::info!(session_id, name = %name, path = %final_dest.display(), "upload complete");
        self.events.publish_operation(&OperationEvent {
            kind: OperationKind::Install,
            status: OperationStatus::Completed,
            name,
            progress: 100,
            message: None,
            path: Some(final_dest.display().to_string()),
        });

        Ok(final_dest)
    }

    /// Cancel the active session and delete its partials.
    ///
    /// # Errors
    ///
    /// [`AgentError::NoActiveSession`] / [`AgentError::SessionNotFound`]
    /// on a session mismatch.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let mut slot = self.active.lock().await;
        let active = self.active_mut(&mut slot, session_id)?;

        let staging = active.session.staging_dir.clone();
        let name = active.session.name.clone();
        active.session.abort();
        *slot = None;
        drop(slot);

        tracing::info!(session_id, name = %name, "upload cancelled");
        self.discard_staging(&staging).await;
        self.publish_install_error(&name, "cancelled");
        Ok(())
    }

    /// Abort whatever session is active, if any. Called on hub disconnect:
    /// transport close is the cancellation signal.
    pub async fn abort_active(&self, reason: &str) {
        let mut slot = self.active.lock().await;
        let Some(active) = slot.take() else { return };

        let staging = active.session.staging_dir.clone();
        let name = active.session.name.clone();
        drop(slot);

        tracing::info!(name = %name, reason, "upload aborted");
        self.discard_staging(&staging).await;
        self.publish_install_error(&name, reason);
    }

    /// Reap the active session if it has been idle past the configured
    /// timeout. Called by the maintenance sweep.
    pub async fn reap_idle(&self) {
        let should_reap = {
            let slot = self.active.lock().await;
            slot.as_ref()
                .is_some_and(|a| a.session.idle_for() >= self.config.idle_timeout)
        };
        if should_reap {
            self.abort_active("idle timeout").await;
        }
    }

    /// Snapshot of the active session, if any.
    pub async fn status(&self) -> Option<UploadStatus> {
        let slot = self.active.lock().await;
        slot.as_ref().map(|a| UploadStatus {
            session_id: a.session.id.clone(),
            name: a.session.name.clone(),
            progress: a.session.progress_pct(),
            bytes_received: a.session.bytes_received(),
            total_size: a.session.total_size,
        })
    }

    fn active_mut<'a>(
        &self,
        slot: &'a mut Option<ActiveUpload>,
        session_id: &str,
    ) -> Result<&'a mut ActiveUpload> {
        match slot {
            None => Err(AgentError::NoActiveSession),
            Some(active) if active.session.id != session_id => {
                Err(AgentError::SessionNotFound(session_id.to_string()))
            }
            Some(active) => Ok(active),
        }
    }

    /// Resolve the final destination directory, rejecting anything that
    /// resolves outside the install root.
    ///
    /// The structural check on components is not enough on its own: a
    /// symlink sitting under the root would let the final rename land
    /// elsewhere. The root is canonicalized and every already-existing
    /// component of the destination is checked for symlink indirection.
    fn resolve_destination(&self, name: &str, destination: Option<&str>) -> Result<PathBuf> {
        let hint = destination.unwrap_or(name);
        let relative = validate_relative_path(hint)
            .map_err(|_| AgentError::PathTraversal(hint.to_string()))?;

        let root = std::fs::canonicalize(&self.config.install_root)
            .map_err(|e| AgentError::Storage(format!("cannot resolve install root: {e}")))?;

        let mut resolved = root.clone();
        for component in relative.components() {
            resolved.push(component);
            match std::fs::symlink_metadata(&resolved) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(AgentError::PathTraversal(hint.to_string()));
                }
                Ok(_) => {}
                // The remaining components do not exist yet, so there is
                // nothing left to follow.
                Err(_) => break,
            }
        }

        Ok(root.join(relative))
    }

    async fn discard_staging(&self, staging: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), "failed to remove partials: {e}");
                self.events.publish(
                    Topic::ServerError,
                    json!({ "message": format!("failed to remove partials: {e}") }),
                );
            }
        }
    }

    fn publish_install_error(&self, name: &str, message: &str) {
        self.events.publish_operation(&OperationEvent {
            kind: OperationKind::Install,
            status: OperationStatus::Error,
            name: name.to_string(),
            progress: 0,
            message: Some(message.to_string()),
            path: None,
        });
    }
}

/// Reject absolute paths and any component that is not a plain name.
fn validate_relative_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if raw.is_empty()
        || path.is_absolute()
        || !path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(AgentError::PathTraversal(raw.to_string()));
    }
    Ok(path.to_path_buf())
}

/// Random 8-byte hex session id.
fn generate_session_id() -> Result<String> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf)
        .map_err(|_| AgentError::Fatal("OS CSPRNG unavailable".into()))?;
    Ok(hex::encode(buf))
}

/// Move the verified staging directory into place.
async fn place_artifact(staging: &Path, final_dest: &Path) -> Result<()> {
    if let Some(parent) = final_dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Reinstall over an existing artifact replaces it.
    if tokio::fs::try_exists(final_dest).await? {
        tokio::fs::remove_dir_all(final_dest).await?;
    }
    tokio::fs::rename(staging, final_dest).await?;
    Ok(())
}

/// Write a chunk at its offset, reusing the cached handle when the chunk
/// continues the same file.
async fn write_at(
    open_file: &mut Option<(PathBuf, tokio::fs::File)>,
    target: &Path,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let reuse = matches!(open_file, Some((path, _)) if path == target);
    if !reuse {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(target)
            .await?;
        *open_file = Some((target.to_path_buf(), file));
    }

    // Checked above, the slot is always occupied here.
    if let Some((_, file)) = open_file {
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
    }
    Ok(())
}

/// BLAKE3 over the staged files' contents, in sorted relative-path order.
async fn hash_staged_payload(staging: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut files = Vec::new();
        collect_files(&staging, &mut files)?;
        files.sort();

        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        for path in files {
            let mut file = std::fs::File::open(&path)?;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        Ok(hasher.finalize().to_hex().to_string())
    })
    .await
    .map_err(|e| AgentError::Storage(format!("hash task failed: {e}")))?
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
