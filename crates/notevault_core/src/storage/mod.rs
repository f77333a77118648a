//! Storage capability interface and backend dispatch.
//!
//! # Responsibility
//! - Define the operations every backend must satisfy (`WorkspaceStore`).
//! - Dispatch between the document and relational variants through the
//!   tagged `Storage` enum.
//! - Classify storage failures into the recoverable taxonomy consumed by
//!   recovery, autosave and the service facade.
//!
//! # Invariants
//! - `save` is atomic: callers never observe a half-written workspace.
//! - `load` returns a fully validated workspace or fails explicitly.
//! - Locked-folder plaintext never reaches a backend: sealed notes are
//!   persisted as ciphertext blobs regardless of backend.

use crate::config::CoreConfig;
use crate::db::DbError;
use crate::migration::{self, MigrationReport};
use crate::model::{ModelError, Workspace};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod commit;
pub mod document;
pub mod layout;
pub mod relational;
pub mod snapshot;
pub mod summary;

pub use commit::{AtomicCommitter, CommitFs, CommitOutcome, OsFs, SwapPath};
pub use document::DocumentBackend;
pub use layout::{MarkerState, WorkspaceLayout};
pub use relational::RelationalBackend;
pub use summary::{EntitySummary, ListScope, SummaryCursor, SummarySource};

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-layer failure taxonomy.
#[derive(Debug)]
pub enum StoreError {
    /// No artifact exists; callers treat this as a fresh workspace.
    Missing(PathBuf),
    /// Artifact exists but fails checksum, schema or model validation.
    Corrupt { artifact: PathBuf, reason: String },
    /// Artifact is locked by another process; its content is unknown.
    Busy { artifact: PathBuf, reason: String },
    /// Transient OS contention outlasted retries and the copy fallback.
    WriteFailed {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },
    /// Entity id does not exist in the live store.
    NotFound(Uuid),
    /// Request is structurally invalid (e.g. deleting the root folder).
    InvalidRequest(String),
    /// Migration verification failed; the source stays live.
    MigrationAborted(String),
    /// No valid workspace and no usable snapshot.
    Fatal(String),
    /// Non-transient I/O failure outside the commit protocol.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Db(DbError),
    Serialization(serde_json::Error),
    Model(ModelError),
}

impl StoreError {
    /// Whether a later attempt may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteFailed { .. } | Self::Busy { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(artifact: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "storage artifact missing: {}", path.display()),
            Self::Corrupt { artifact, reason } => {
                write!(f, "storage artifact corrupt ({}): {reason}", artifact.display())
            }
            Self::Busy { artifact, reason } => {
                write!(f, "storage artifact busy ({}): {reason}", artifact.display())
            }
            Self::WriteFailed {
                path,
                attempts,
                source,
            } => write!(
                f,
                "write to {} failed after {attempts} attempts: {source}",
                path.display()
            ),
            Self::NotFound(id) => write!(f, "entity not found: {id}"),
            Self::InvalidRequest(message) => write!(f, "invalid storage request: {message}"),
            Self::MigrationAborted(reason) => write!(f, "migration aborted: {reason}"),
            Self::Fatal(reason) => write!(f, "no usable workspace: {reason}"),
            Self::Io { path, source } => write!(f, "i/o error at {}: {source}", path.display()),
            Self::Db(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::Model(err) => write!(f, "invalid workspace: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::WriteFailed { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::Model(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ModelError> for StoreError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Physical backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One serialized tree per workspace.
    Document,
    /// Indexed SQLite rows.
    Relational,
}

impl BackendKind {
    /// Live artifact file name under the workspace root.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Document => "workspace.json",
            Self::Relational => "workspace.sqlite3",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Relational => "relational",
        }
    }

    /// The other variant.
    pub fn other(self) -> Self {
        match self {
            Self::Document => Self::Relational,
            Self::Relational => Self::Document,
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version/checksum stamp embedded in every committed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStamp {
    /// Monotonic per committed save.
    pub version: u64,
    /// Document: blake3 of the payload bytes. Relational: workspace digest.
    pub checksum: String,
    pub committed_at: i64,
}

/// Acknowledgement of a durable commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    pub stamp: CommitStamp,
    pub swap: SwapPath,
    /// Swap attempts used (1 when the first rename succeeded).
    pub attempts: u32,
    /// Backup snapshot written after this commit, if any.
    pub snapshot: Option<PathBuf>,
}

/// Result of verifying one artifact against its embedded stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactCheck {
    Valid(CommitStamp),
    Missing,
    Corrupt(String),
    /// Could not be read because another process holds a lock on it.
    Busy(String),
}

impl ArtifactCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Verifies an artifact of `kind` at `path` without modifying it.
pub fn verify_artifact(kind: BackendKind, path: &Path) -> ArtifactCheck {
    match kind {
        BackendKind::Document => document::verify_document(path),
        BackendKind::Relational => relational::verify_relational(path),
    }
}

/// Reads an artifact of `kind` at `path` without opening it for writing.
pub fn read_artifact(kind: BackendKind, path: &Path) -> StoreResult<(Workspace, CommitStamp)> {
    match kind {
        BackendKind::Document => document::read_document(path),
        BackendKind::Relational => relational::read_relational(path),
    }
}

/// Contract every backend satisfies, independent of on-disk representation.
pub trait WorkspaceStore {
    /// Backend variant.
    fn kind(&self) -> BackendKind;

    /// Loads and validates the live workspace.
    fn load(&self) -> StoreResult<Workspace>;

    /// Atomically commits the workspace with the next version stamp.
    fn save(&mut self, workspace: &Workspace) -> StoreResult<CommitAck>;

    /// Removes a note, or a folder with its subtree, and every mention
    /// referencing removed notes.
    fn delete(&mut self, id: Uuid) -> StoreResult<CommitAck>;

    /// Lazy, restartable summaries for `scope`.
    fn list(&self, scope: ListScope) -> StoreResult<SummaryCursor<'_>>;

    /// Last committed stamp, if any.
    fn stamp(&self) -> Option<&CommitStamp>;
}

/// Tagged backend variant behind the storage interface.
#[derive(Debug)]
pub enum Storage {
    Document(DocumentBackend),
    Relational(RelationalBackend),
}

impl Storage {
    /// Opens the backend of `kind` rooted at `layout`.
    ///
    /// Does not run recovery; callers go through `open_workspace` for that.
    pub fn open(layout: WorkspaceLayout, kind: BackendKind, config: &CoreConfig) -> Self {
        let committer = AtomicCommitter::new(config.retry);
        Self::open_with_committer(layout, kind, config, committer)
    }

    /// Opens with a caller-provided committer (used to inject filesystem faults).
    pub fn open_with_committer(
        layout: WorkspaceLayout,
        kind: BackendKind,
        config: &CoreConfig,
        committer: AtomicCommitter,
    ) -> Self {
        match kind {
            BackendKind::Document => {
                Self::Document(DocumentBackend::open(layout, committer, config.clone()))
            }
            BackendKind::Relational => {
                Self::Relational(RelationalBackend::open(layout, committer, config.clone()))
            }
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        match self {
            Self::Document(backend) => backend.layout(),
            Self::Relational(backend) => backend.layout(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        match self {
            Self::Document(backend) => backend.config(),
            Self::Relational(backend) => backend.config(),
        }
    }

    pub(crate) fn committer(&self) -> &AtomicCommitter {
        match self {
            Self::Document(backend) => backend.committer(),
            Self::Relational(backend) => backend.committer(),
        }
    }

    /// Path of the live artifact.
    pub fn live_path(&self) -> PathBuf {
        self.layout().live_path(self.kind())
    }

    /// Commits with an explicit version stamp (migration and restore paths).
    pub(crate) fn save_with_version(
        &mut self,
        workspace: &Workspace,
        version: u64,
    ) -> StoreResult<CommitAck> {
        match self {
            Self::Document(backend) => backend.save_with_version(workspace, version),
            Self::Relational(backend) => backend.save_with_version(workspace, version),
        }
    }

    /// Deletes every historical copy of workspace content and snapshots the
    /// live artifact again. Returns the number of paths removed.
    ///
    /// Called after a commit that sealed content, so no older copy can leak
    /// or resurrect the plaintext.
    pub fn scrub_history(&self) -> StoreResult<usize> {
        let Some(version) = self.stamp().map(|stamp| stamp.version) else {
            return Ok(0);
        };
        snapshot::scrub_history(self.layout(), self.kind(), version)
    }

    /// Moves the live workspace to `target`, verifying every entity first.
    ///
    /// On success `self` becomes the target backend and the marker is
    /// switched; on failure `self` is unchanged and the source stays live.
    pub fn migrate_to(&mut self, target: BackendKind) -> StoreResult<MigrationReport> {
        let (next, report) = migration::migrate(self, target)?;
        *self = next;
        Ok(report)
    }
}

impl WorkspaceStore for Storage {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Document(_) => BackendKind::Document,
            Self::Relational(_) => BackendKind::Relational,
        }
    }

    fn load(&self) -> StoreResult<Workspace> {
        match self {
            Self::Document(backend) => backend.load(),
            Self::Relational(backend) => backend.load(),
        }
    }

    fn save(&mut self, workspace: &Workspace) -> StoreResult<CommitAck> {
        match self {
            Self::Document(backend) => backend.save(workspace),
            Self::Relational(backend) => backend.save(workspace),
        }
    }

    fn delete(&mut self, id: Uuid) -> StoreResult<CommitAck> {
        match self {
            Self::Document(backend) => backend.delete(id),
            Self::Relational(backend) => backend.delete(id),
        }
    }

    fn list(&self, scope: ListScope) -> StoreResult<SummaryCursor<'_>> {
        match self {
            Self::Document(backend) => backend.list(scope),
            Self::Relational(backend) => backend.list(scope),
        }
    }

    fn stamp(&self) -> Option<&CommitStamp> {
        match self {
            Self::Document(backend) => backend.stamp(),
            Self::Relational(backend) => backend.stamp(),
        }
    }
}

/// Removes an entity from a loaded workspace with storage-level semantics.
pub(crate) fn remove_entity(workspace: &mut Workspace, id: Uuid) -> StoreResult<()> {
    if id == workspace.root_id {
        return Err(StoreError::InvalidRequest(
            "the workspace root cannot be deleted".to_string(),
        ));
    }
    if workspace.notes.contains_key(&id) {
        workspace.remove_note(id);
        return Ok(());
    }
    if workspace.folders.contains_key(&id) {
        workspace.remove_folder_subtree(id);
        return Ok(());
    }
    Err(StoreError::NotFound(id))
}

#[cfg(test)]
mod tests {
    use super::{remove_entity, BackendKind, StoreError};
    use crate::model::{Folder, Note, Workspace};
    use uuid::Uuid;

    #[test]
    fn kinds_have_distinct_artifacts() {
        assert_ne!(
            BackendKind::Document.file_name(),
            BackendKind::Relational.file_name()
        );
        assert_eq!(BackendKind::Document.other(), BackendKind::Relational);
    }

    #[test]
    fn write_failures_and_busy_artifacts_are_retryable() {
        let err = StoreError::WriteFailed {
            path: "x".into(),
            attempts: 5,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.is_retryable());
        assert!(StoreError::Busy {
            artifact: "x".into(),
            reason: "database is locked".to_string(),
        }
        .is_retryable());
        assert!(!StoreError::corrupt("x", "bad header").is_retryable());
        assert!(!StoreError::NotFound(Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn remove_entity_rejects_root_and_unknown_ids() {
        let mut ws = Workspace::new();
        let root = ws.root_id;
        assert!(matches!(
            remove_entity(&mut ws, root),
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            remove_entity(&mut ws, Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));

        let folder = Folder::new(Some(root), "Work");
        let note = Note::new(folder.id, "Plan", Vec::new());
        let folder_id = folder.id;
        ws.insert_folder(folder);
        ws.insert_note(note);
        remove_entity(&mut ws, folder_id).unwrap();
        assert!(ws.notes.is_empty());
    }
}
