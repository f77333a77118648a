//! Startup integrity check and last-good restore.
//!
//! # Responsibility
//! - Verify the live artifact of the active backend before anything loads
//!   or saves.
//! - Quarantine damaged or interrupted artifacts and restore the newest
//!   verifiable state (staging first, then backups).
//! - Report every transition and notice to the caller.
//!
//! # Invariants
//! - Nothing is deleted: bad artifacts are moved to `quarantine/`.
//! - A live artifact locked by another process is never judged corrupt;
//!   after the retry policy runs out the pass fails with `StoreError::Busy`
//!   and leaves every artifact in place.
//! - A second run with no intervening writes yields `Clean` and touches no
//!   artifact.
//! - `Failed` is the only outcome where the caller substitutes an empty
//!   workspace.

use crate::config::CoreConfig;
use crate::model::Workspace;
use crate::storage::commit::AtomicCommitter;
use crate::storage::layout::{MarkerState, WorkspaceLayout};
use crate::storage::{
    snapshot, verify_artifact, ArtifactCheck, BackendKind, Storage, StoreError, StoreResult,
    WorkspaceStore,
};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Recovery state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Unchecked,
    Verifying,
    Clean,
    Recovering,
    Failed,
}

/// Non-fatal facts surfaced to the user after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryNotice {
    /// No artifact existed; a new workspace starts.
    FreshWorkspace,
    /// Live was intact; a leftover staging artifact was quarantined.
    InterruptedSaveDiscarded,
    /// Live was damaged; the staging artifact of an interrupted save was promoted.
    RecoveredFromStaging,
    /// Live was damaged; the backup snapshot with this version was restored.
    RecoveredFromBackup { version: u64 },
    /// Nothing usable remained; the caller starts an empty workspace.
    NoUsableSnapshot,
    /// The backend marker was unreadable and has been rebuilt.
    MarkerRepaired,
    /// Scratch output of an interrupted migration was removed.
    MigrationScratchDiscarded,
}

/// Outcome of one recovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Backend the workspace runs on.
    pub kind: BackendKind,
    /// Every state entered, in order, starting with `Unchecked`.
    pub states: Vec<RecoveryState>,
    pub notices: Vec<RecoveryNotice>,
    /// Artifacts moved into quarantine during this pass.
    pub quarantined: Vec<PathBuf>,
}

impl RecoveryReport {
    /// Terminal state.
    pub fn outcome(&self) -> RecoveryState {
        self.states
            .last()
            .copied()
            .unwrap_or(RecoveryState::Unchecked)
    }

    pub fn passed_through(&self, state: RecoveryState) -> bool {
        self.states.contains(&state)
    }

    pub fn has_notice(&self, notice: &RecoveryNotice) -> bool {
        self.notices.contains(notice)
    }
}

/// Deterministic startup verifier for one workspace root.
pub struct RecoveryManager<'a> {
    layout: &'a WorkspaceLayout,
    config: &'a CoreConfig,
    committer: AtomicCommitter,
    report: RecoveryReport,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(layout: &'a WorkspaceLayout, config: &'a CoreConfig) -> Self {
        Self::with_committer(layout, config, AtomicCommitter::new(config.retry))
    }

    pub fn with_committer(
        layout: &'a WorkspaceLayout,
        config: &'a CoreConfig,
        committer: AtomicCommitter,
    ) -> Self {
        Self {
            layout,
            config,
            committer,
            report: RecoveryReport {
                kind: config.default_backend,
                states: vec![RecoveryState::Unchecked],
                notices: Vec::new(),
                quarantined: Vec::new(),
            },
        }
    }

    fn enter(&mut self, state: RecoveryState) {
        info!(
            "event=recovery_state module=recovery backend={} state={:?}",
            self.report.kind, state
        );
        self.report.states.push(state);
    }

    fn quarantine(&mut self, path: &Path, reason: &str) -> StoreResult<()> {
        let target = snapshot::quarantine(self.layout, path, reason)?;
        self.report.quarantined.push(target);
        Ok(())
    }

    /// Runs the state machine to a terminal state.
    pub fn run(mut self) -> StoreResult<RecoveryReport> {
        let started_at = Instant::now();
        self.enter(RecoveryState::Verifying);
        self.discard_migration_scratch()?;

        let kind = match self.layout.read_marker() {
            MarkerState::Present(kind) => kind,
            MarkerState::Missing => self.infer_kind(),
            MarkerState::Unreadable(reason) => {
                warn!(
                    "event=recovery module=recovery status=warn stage=marker reason={}",
                    reason
                );
                let marker = self.layout.marker_path();
                self.quarantine(&marker, "unreadable")?;
                self.report.notices.push(RecoveryNotice::MarkerRepaired);
                self.infer_kind()
            }
        };
        self.report.kind = kind;

        let live = self.layout.live_path(kind);
        let staging = self.layout.staging_path(kind);
        let staging_exists = staging.exists();

        match self.verify_with_retry(kind, &live) {
            ArtifactCheck::Busy(reason) => {
                error!(
                    "event=recovery_verify module=recovery status=error backend={} error_code=artifact_busy reason={}",
                    kind, reason
                );
                return Err(StoreError::Busy {
                    artifact: live,
                    reason,
                });
            }
            ArtifactCheck::Valid(stamp) => {
                if staging_exists {
                    self.enter(RecoveryState::Recovering);
                    self.quarantine(&staging, "interrupted")?;
                    self.report
                        .notices
                        .push(RecoveryNotice::InterruptedSaveDiscarded);
                }
                info!(
                    "event=recovery_verify module=recovery status=ok backend={} version={}",
                    kind, stamp.version
                );
                self.enter(RecoveryState::Clean);
            }
            ArtifactCheck::Missing => {
                let backups = snapshot::list_snapshots(self.layout, kind)?;
                if !staging_exists && backups.is_empty() {
                    self.report.notices.push(RecoveryNotice::FreshWorkspace);
                    self.enter(RecoveryState::Clean);
                } else {
                    self.enter(RecoveryState::Recovering);
                    self.restore(kind, &live, &staging)?;
                }
            }
            ArtifactCheck::Corrupt(reason) => {
                warn!(
                    "event=recovery_verify module=recovery status=error backend={} reason={}",
                    kind, reason
                );
                self.enter(RecoveryState::Recovering);
                self.quarantine(&live, "corrupt")?;
                self.restore(kind, &live, &staging)?;
            }
        }

        info!(
            "event=recovery module=recovery status=done backend={} outcome={:?} notices={} quarantined={} duration_ms={}",
            kind,
            self.report.outcome(),
            self.report.notices.len(),
            self.report.quarantined.len(),
            started_at.elapsed().as_millis()
        );
        Ok(self.report)
    }

    /// Verifies `path`, waiting out lock contention per the retry policy.
    fn verify_with_retry(&self, kind: BackendKind, path: &Path) -> ArtifactCheck {
        let attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match verify_artifact(kind, path) {
                ArtifactCheck::Busy(reason) if attempt < attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        "event=recovery_verify module=recovery status=retry attempt={} delay_ms={} reason={}",
                        attempt,
                        delay.as_millis(),
                        reason
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                check => return check,
            }
        }
    }

    /// Promotes a verifying staging artifact, else the newest verifying backup.
    fn restore(&mut self, kind: BackendKind, live: &Path, staging: &Path) -> StoreResult<()> {
        if staging.exists() {
            match verify_artifact(kind, staging) {
                ArtifactCheck::Valid(stamp) => {
                    // Staging is already complete; the commit only syncs and swaps it.
                    self.committer.commit(live, staging, |_| Ok(()))?;
                    info!(
                        "event=recovery_restore module=recovery status=ok source=staging version={}",
                        stamp.version
                    );
                    self.report.notices.push(RecoveryNotice::RecoveredFromStaging);
                    self.enter(RecoveryState::Clean);
                    return Ok(());
                }
                ArtifactCheck::Busy(reason) => warn!(
                    "event=recovery_restore module=recovery status=skip source=staging reason={}",
                    reason
                ),
                _ => self.quarantine(staging, "corrupt")?,
            }
        }

        for candidate in snapshot::list_snapshots(self.layout, kind)? {
            match verify_artifact(kind, &candidate.path) {
                ArtifactCheck::Valid(stamp) => {
                    let source = candidate.path.clone();
                    self.committer.commit(live, staging, |path| {
                        std::fs::copy(&source, path)
                            .map(|_| ())
                            .map_err(|err| StoreError::io(&source, err))
                    })?;
                    info!(
                        "event=recovery_restore module=recovery status=ok source=backup version={}",
                        stamp.version
                    );
                    self.report
                        .notices
                        .push(RecoveryNotice::RecoveredFromBackup {
                            version: stamp.version,
                        });
                    self.enter(RecoveryState::Clean);
                    return Ok(());
                }
                other => warn!(
                    "event=recovery_restore module=recovery status=skip path={} check={:?}",
                    candidate.path.display(),
                    other
                ),
            }
        }

        error!(
            "event=recovery_restore module=recovery status=error backend={} error_code=no_usable_snapshot",
            kind
        );
        self.report.notices.push(RecoveryNotice::NoUsableSnapshot);
        self.enter(RecoveryState::Failed);
        Ok(())
    }

    /// Picks a backend when the marker is absent or unreadable.
    fn infer_kind(&self) -> BackendKind {
        let mut best: Option<(BackendKind, u64)> = None;
        let mut present = Vec::new();
        for kind in [BackendKind::Document, BackendKind::Relational] {
            let live = self.layout.live_path(kind);
            if live.exists() || self.layout.staging_path(kind).exists() {
                present.push(kind);
            }
            if let ArtifactCheck::Valid(stamp) = verify_artifact(kind, &live) {
                if best.map_or(true, |(_, version)| stamp.version > version) {
                    best = Some((kind, stamp.version));
                }
            }
        }
        let kind = match (best, present.as_slice()) {
            (Some((kind, _)), _) => kind,
            (None, [only]) => *only,
            _ => self.config.default_backend,
        };
        info!(
            "event=recovery_infer module=recovery backend={} candidates={}",
            kind,
            present.len()
        );
        kind
    }

    fn discard_migration_scratch(&mut self) -> StoreResult<()> {
        let scratch = self.layout.migration_dir();
        if !scratch.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&scratch).map_err(|err| StoreError::io(&scratch, err))?;
        warn!(
            "event=recovery module=recovery status=warn stage=migration_scratch action=discarded"
        );
        self.report
            .notices
            .push(RecoveryNotice::MigrationScratchDiscarded);
        Ok(())
    }
}

/// Storage, loaded workspace and recovery report after startup.
#[derive(Debug)]
pub struct OpenedWorkspace {
    pub storage: Storage,
    pub workspace: Workspace,
    pub recovery: RecoveryReport,
}

/// Opens the workspace at `root`: layout, recovery, marker, load.
pub fn open_workspace(root: impl AsRef<Path>, config: &CoreConfig) -> StoreResult<OpenedWorkspace> {
    open_workspace_with(root, config, AtomicCommitter::new(config.retry))
}

/// [`open_workspace`] with a caller-provided committer.
pub fn open_workspace_with(
    root: impl AsRef<Path>,
    config: &CoreConfig,
    committer: AtomicCommitter,
) -> StoreResult<OpenedWorkspace> {
    let layout = WorkspaceLayout::new(root.as_ref());
    layout.ensure_dirs()?;

    let recovery = RecoveryManager::with_committer(&layout, config, committer.clone()).run()?;
    let kind = recovery.kind;
    if layout.read_marker() != MarkerState::Present(kind) {
        layout.write_marker(kind, &committer)?;
    }

    let storage = Storage::open_with_committer(layout, kind, config, committer);
    let workspace = if recovery.outcome() == RecoveryState::Failed {
        warn!(
            "event=workspace_open module=recovery status=warn backend={} action=empty_workspace",
            kind
        );
        Workspace::new()
    } else {
        match storage.load() {
            Ok(workspace) => workspace,
            Err(StoreError::Missing(_)) => Workspace::new(),
            Err(err) => return Err(err),
        }
    };

    info!(
        "event=workspace_open module=recovery status=ok backend={} folders={} notes={}",
        kind,
        workspace.folders.len(),
        workspace.notes.len()
    );
    Ok(OpenedWorkspace {
        storage,
        workspace,
        recovery,
    })
}
