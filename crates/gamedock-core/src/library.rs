//! Installed-game library.
//!
//! A game is a directory (or single file) directly under the install
//! root. The `.partial` staging area is never listed: only artifacts
//! that survived finalization exist as far as hubs are concerned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::events::{EventQueue, OperationEvent, OperationKind, OperationStatus};

/// One completed artifact under the install root.
#[derive(Debug, Clone)]
pub struct InstalledGame {
    /// Directory or file name under the root.
    pub name: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Total size in bytes.
    pub size: u64,
}

/// Read and delete completed artifacts.
pub struct Library {
    install_root: PathBuf,
    events: Arc<EventQueue>,
}

impl Library {
    /// Create a library over the install root.
    pub fn new(install_root: PathBuf, events: Arc<EventQueue>) -> Self {
        Self {
            install_root,
            events,
        }
    }

    /// Enumerate completed artifacts, staging excluded.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Storage`] if the root cannot be read.
    pub async fn list_installed(&self) -> Result<Vec<InstalledGame>> {
        if !tokio::fs::try_exists(&self.install_root).await? {
            return Ok(Vec::new());
        }

        let mut games = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.install_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let size = dir_size(path.clone()).await?;
            games.push(InstalledGame { name, path, size });
        }
        games.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(games)
    }

    /// Delete a completed artifact by name, emitting remove lifecycle
    /// events.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::GameNotFound`] if no such artifact exists,
    /// [`AgentError::PathTraversal`] if the name is not a plain name, or
    /// [`AgentError::Storage`] if deletion fails.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.starts_with('.') || !is_plain_name(name) {
            return Err(AgentError::PathTraversal(name.to_string()));
        }

        let path = self.install_root.join(name);
        if !tokio::fs::try_exists(&path).await? {
            return Err(AgentError::GameNotFound(name.to_string()));
        }

        self.publish_remove(name, OperationStatus::Started, None);

        let result = if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => {
                tracing::info!(name, path = %path.display(), "game removed");
                self.publish_remove(name, OperationStatus::Completed, None);
                Ok(())
            }
            Err(e) => {
                self.publish_remove(name, OperationStatus::Error, Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn publish_remove(&self, name: &str, status: OperationStatus, message: Option<String>) {
        self.events.publish_operation(&OperationEvent {
            kind: OperationKind::Remove,
            status,
            name: name.to_string(),
            progress: if status == OperationStatus::Completed {
                100
            } else {
                0
            },
            message,
            path: None,
        });
    }
}

/// A single path component, no separators or parent refs.
fn is_plain_name(name: &str) -> bool {
    let path = Path::new(name);
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

/// Recursive size of a file or directory.
async fn dir_size(path: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || -> Result<u64> { size_of(&path) })
        .await
        .map_err(|e| AgentError::Storage(format!("size task failed: {e}")))?
}

fn size_of(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        total += size_of(&entry.path())?;
    }
    Ok(total)
}
