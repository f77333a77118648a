//! On-disk layout of one workspace root.
//!
//! # Invariants
//! - Live and staging artifacts are siblings in the root directory so the
//!   final swap is a same-filesystem rename.
//! - The backend marker is itself written through the atomic committer.

use crate::storage::commit::AtomicCommitter;
use crate::storage::{BackendKind, StoreError, StoreResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MARKER_FILE_NAME: &str = "backend.json";
const STAGING_SUFFIX: &str = "staging";

#[derive(Debug, Serialize, Deserialize)]
struct BackendMarker {
    backend: BackendKind,
}

/// State of the backend marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Present(BackendKind),
    Missing,
    Unreadable(String),
}

/// Paths of every artifact under a workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn live_path(&self, kind: BackendKind) -> PathBuf {
        self.root.join(kind.file_name())
    }

    pub fn staging_path(&self, kind: BackendKind) -> PathBuf {
        self.root
            .join(format!("{}.{STAGING_SUFFIX}", kind.file_name()))
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE_NAME)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn retired_dir(&self) -> PathBuf {
        self.root.join("retired")
    }

    /// Scratch directory for in-flight migration targets.
    pub fn migration_dir(&self) -> PathBuf {
        self.root.join(".migration")
    }

    /// Creates the root and its auxiliary directories.
    pub fn ensure_dirs(&self) -> StoreResult<()> {
        for dir in [
            self.root.clone(),
            self.backups_dir(),
            self.quarantine_dir(),
            self.retired_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        }
        Ok(())
    }

    /// Reads the backend marker without failing on bad content.
    pub fn read_marker(&self) -> MarkerState {
        let path = self.marker_path();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return MarkerState::Missing,
            Err(err) => return MarkerState::Unreadable(err.to_string()),
        };
        match serde_json::from_slice::<BackendMarker>(&raw) {
            Ok(marker) => MarkerState::Present(marker.backend),
            Err(err) => {
                warn!(
                    "event=marker_read module=storage status=error path={} error={}",
                    path.display(),
                    err
                );
                MarkerState::Unreadable(err.to_string())
            }
        }
    }

    /// Atomically records `kind` as the active backend.
    pub fn write_marker(&self, kind: BackendKind, committer: &AtomicCommitter) -> StoreResult<()> {
        let bytes = serde_json::to_vec(&BackendMarker { backend: kind })?;
        let live = self.marker_path();
        let staging = self.root.join(format!("{MARKER_FILE_NAME}.{STAGING_SUFFIX}"));
        committer.commit_bytes(&live, &staging, &bytes)?;
        Ok(())
    }
}
