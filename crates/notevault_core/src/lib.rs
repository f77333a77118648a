//! Core of the notevault local-first note organizer.
//! This crate is the single source of truth for workspace invariants,
//! vault sealing and crash-safe persistence.

pub mod config;
pub mod db;
pub mod logging;
pub mod migration;
pub mod model;
pub mod recovery;
pub mod service;
pub mod storage;
pub mod vault;
pub mod worker;

pub use config::{ConfigError, CoreConfig, RetryPolicy};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use migration::MigrationReport;
pub use model::{
    extract_mentions, mention_link, EntityKind, Folder, FolderId, KdfParams, Mention, ModelError,
    Note, NoteContent, NoteId, VaultParams, Workspace,
};
pub use recovery::{
    open_workspace, open_workspace_with, OpenedWorkspace, RecoveryManager, RecoveryNotice,
    RecoveryReport, RecoveryState,
};
pub use service::{
    MentionCandidate, MentionResolution, NoteService, NoteView, SearchMatch, ServiceError,
    ServiceResult,
};
pub use storage::{
    ArtifactCheck, AtomicCommitter, BackendKind, CommitAck, CommitFs, CommitStamp, EntitySummary,
    ListScope, MarkerState, OsFs, Storage, StoreError, StoreResult, SummaryCursor, SwapPath,
    WorkspaceLayout, WorkspaceStore,
};
pub use vault::{VaultError, VaultSession};
pub use worker::{AutosaveStats, Autosaver, StorageHandle, StorageWorker};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
