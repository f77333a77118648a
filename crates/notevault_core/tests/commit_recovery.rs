use notevault_core::storage::document::encode_document;
use notevault_core::storage::snapshot::list_snapshots;
use notevault_core::{
    open_workspace, open_workspace_with, AtomicCommitter, BackendKind, CommitFs, CoreConfig,
    NoteService, RecoveryNotice, RecoveryState, RetryPolicy, StoreError, SwapPath, VaultSession,
    WorkspaceLayout, WorkspaceStore,
};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn config(backend: BackendKind) -> CoreConfig {
    CoreConfig {
        default_backend: backend,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
        },
        ..CoreConfig::default()
    }
}

/// Folder "Work" with note "Plan" (body "draft"), committed once.
fn seed(root: &Path, config: &CoreConfig) -> NoteService {
    let mut service = NoteService::open(root, config).unwrap();
    let session = VaultSession::new();
    let work = service.create_folder(service.root_id(), "Work").unwrap();
    service
        .create_note(&session, work, "Plan", b"draft".to_vec())
        .unwrap();
    service.flush().unwrap();
    service
}

#[test]
fn truncated_staging_is_discarded_and_committed_state_survives() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    let service = seed(dir.path(), &config);
    let committed = service.workspace().clone();
    drop(service);

    let mut next = committed.clone();
    next.insert_note(notevault_core::Note::new(
        next.root_id,
        "Unsaved",
        b"half written".to_vec(),
    ));
    let full = encode_document(&next, 2).unwrap();
    let layout = WorkspaceLayout::new(dir.path());

    for cut in [0, 1, full.len() / 3, full.len() / 2, full.len() - 1] {
        std::fs::write(layout.staging_path(BackendKind::Document), &full[..cut]).unwrap();

        let opened = open_workspace(dir.path(), &config).unwrap();
        assert!(opened.recovery.passed_through(RecoveryState::Recovering));
        assert_eq!(opened.recovery.outcome(), RecoveryState::Clean);
        assert!(opened
            .recovery
            .has_notice(&RecoveryNotice::InterruptedSaveDiscarded));
        assert_eq!(opened.workspace, committed, "cut at {cut}");
        assert!(!layout.staging_path(BackendKind::Document).exists());
    }
}

#[test]
fn second_recovery_pass_is_clean_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    drop(seed(dir.path(), &config));
    let layout = WorkspaceLayout::new(dir.path());
    std::fs::write(layout.staging_path(BackendKind::Document), b"{\"magic\"").unwrap();

    let first = open_workspace(dir.path(), &config).unwrap();
    assert_eq!(first.recovery.quarantined.len(), 1);
    let live_bytes = std::fs::read(layout.live_path(BackendKind::Document)).unwrap();
    drop(first);

    let second = open_workspace(dir.path(), &config).unwrap();
    assert_eq!(
        second.recovery.states,
        vec![
            RecoveryState::Unchecked,
            RecoveryState::Verifying,
            RecoveryState::Clean
        ]
    );
    assert!(second.recovery.notices.is_empty());
    assert!(second.recovery.quarantined.is_empty());
    assert_eq!(
        std::fs::read(layout.live_path(BackendKind::Document)).unwrap(),
        live_bytes
    );
}

#[test]
fn corrupt_live_is_restored_from_a_complete_staging_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    let service = seed(dir.path(), &config);
    let expected = service.workspace().clone();
    drop(service);

    let layout = WorkspaceLayout::new(dir.path());
    let live = layout.live_path(BackendKind::Document);
    std::fs::write(
        layout.staging_path(BackendKind::Document),
        encode_document(&expected, 2).unwrap(),
    )
    .unwrap();
    std::fs::write(&live, b"garbage").unwrap();

    let opened = open_workspace(dir.path(), &config).unwrap();
    assert_eq!(opened.recovery.outcome(), RecoveryState::Clean);
    assert!(opened
        .recovery
        .has_notice(&RecoveryNotice::RecoveredFromStaging));
    assert_eq!(opened.workspace, expected);
    assert_eq!(opened.storage.stamp().map(|s| s.version), Some(2));
    assert_eq!(std::fs::read_dir(layout.quarantine_dir()).unwrap().count(), 1);
}

#[test]
fn corrupt_relational_live_is_restored_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Relational);
    let service = seed(dir.path(), &config);
    let expected = service.workspace().clone();
    drop(service);

    let layout = WorkspaceLayout::new(dir.path());
    assert_eq!(list_snapshots(&layout, BackendKind::Relational).unwrap().len(), 1);
    std::fs::write(layout.live_path(BackendKind::Relational), b"not a database").unwrap();

    let opened = open_workspace(dir.path(), &config).unwrap();
    assert_eq!(opened.recovery.kind, BackendKind::Relational);
    assert!(opened
        .recovery
        .has_notice(&RecoveryNotice::RecoveredFromBackup { version: 1 }));
    assert_eq!(opened.workspace, expected);
}

#[test]
fn nothing_usable_fails_into_an_empty_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    drop(seed(dir.path(), &config));

    let layout = WorkspaceLayout::new(dir.path());
    std::fs::remove_dir_all(layout.backups_dir()).unwrap();
    std::fs::write(layout.live_path(BackendKind::Document), b"\x00\x00").unwrap();

    let opened = open_workspace(dir.path(), &config).unwrap();
    assert_eq!(opened.recovery.outcome(), RecoveryState::Failed);
    assert!(opened
        .recovery
        .has_notice(&RecoveryNotice::NoUsableSnapshot));
    assert!(opened.workspace.notes.is_empty());
    assert!(opened.workspace.validate().is_ok());
    assert!(!layout.live_path(BackendKind::Document).exists());
}

/// Rename fails with a sharing-violation style error a fixed number of times.
struct ContendedFs {
    rename_failures: AtomicU32,
    renames: AtomicU32,
}

impl ContendedFs {
    fn new(failures: u32) -> Self {
        Self {
            rename_failures: AtomicU32::new(failures),
            renames: AtomicU32::new(0),
        }
    }
}

impl CommitFs for ContendedFs {
    fn sync_file(&self, path: &Path) -> io::Result<()> {
        notevault_core::OsFs.sync_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        let left = self.rename_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.rename_failures.store(left - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file in use"));
        }
        std::fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        std::fs::copy(from, to)
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        notevault_core::OsFs.sync_dir(dir)
    }
}

#[test]
fn contended_rename_is_retried_then_falls_back_to_copy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    let fs = Arc::new(ContendedFs::new(0));
    let committer = AtomicCommitter::with_fs(fs.clone(), config.retry);
    let mut opened = open_workspace_with(dir.path(), &config, committer).unwrap();

    fs.rename_failures.store(2, Ordering::SeqCst);
    let ack = opened.storage.save(&opened.workspace).unwrap();
    assert_eq!(ack.swap, SwapPath::Rename);
    assert_eq!(ack.attempts, 3);

    fs.rename_failures.store(u32::MAX, Ordering::SeqCst);
    opened
        .workspace
        .settings
        .insert("theme".to_string(), "dark".to_string());
    let ack = opened.storage.save(&opened.workspace).unwrap();
    assert_eq!(ack.swap, SwapPath::CopyFallback);
    assert_eq!(opened.storage.load().unwrap(), opened.workspace);
    assert!(!WorkspaceLayout::new(dir.path())
        .staging_path(BackendKind::Document)
        .exists());
}

#[test]
fn write_failures_surface_as_retryable_errors() {
    struct BrokenFs;
    impl CommitFs for BrokenFs {
        fn sync_file(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "device busy"))
        }
        fn rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "device busy"))
        }
        fn copy(&self, _from: &Path, _to: &Path) -> io::Result<u64> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "device busy"))
        }
        fn sync_dir(&self, _dir: &Path) -> io::Result<()> {
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    let committer = AtomicCommitter::with_fs(Arc::new(BrokenFs), config.retry);
    let layout = WorkspaceLayout::new(dir.path());
    layout.ensure_dirs().unwrap();
    let mut storage =
        notevault_core::Storage::open_with_committer(layout, BackendKind::Document, &config, committer);

    let err = storage
        .save(&notevault_core::Workspace::new())
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, StoreError::WriteFailed { attempts: 3, .. }));
    assert!(matches!(storage.load(), Err(StoreError::Missing(_))));
}

#[test]
fn truncated_relational_staging_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Relational);
    let service = seed(dir.path(), &config);
    let committed = service.workspace().clone();
    drop(service);

    let layout = WorkspaceLayout::new(dir.path());
    let full = std::fs::read(layout.live_path(BackendKind::Relational)).unwrap();
    for cut in [0, 1, 50, full.len() / 2, full.len() - 1] {
        std::fs::write(layout.staging_path(BackendKind::Relational), &full[..cut]).unwrap();

        let opened = open_workspace(dir.path(), &config).unwrap();
        assert_eq!(opened.recovery.kind, BackendKind::Relational);
        assert_eq!(opened.recovery.outcome(), RecoveryState::Clean);
        assert!(opened
            .recovery
            .has_notice(&RecoveryNotice::InterruptedSaveDiscarded));
        assert_eq!(opened.workspace, committed, "cut at {cut}");
        assert!(!layout.staging_path(BackendKind::Relational).exists());
    }
}

#[test]
fn garbage_relational_live_with_half_written_staging_uses_the_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Relational);
    let service = seed(dir.path(), &config);
    let committed = service.workspace().clone();
    drop(service);

    let layout = WorkspaceLayout::new(dir.path());
    let live = layout.live_path(BackendKind::Relational);
    let full = std::fs::read(&live).unwrap();
    for cut in [1, 50, full.len() / 2] {
        std::fs::write(layout.staging_path(BackendKind::Relational), &full[..cut]).unwrap();
        std::fs::write(&live, b"not a database at all").unwrap();

        let opened = open_workspace(dir.path(), &config).unwrap();
        assert_eq!(opened.recovery.outcome(), RecoveryState::Clean);
        assert!(
            opened
                .recovery
                .has_notice(&RecoveryNotice::RecoveredFromBackup { version: 1 }),
            "cut at {cut}: {:?}",
            opened.recovery.notices
        );
        assert_eq!(opened.recovery.quarantined.len(), 2);
        assert_eq!(opened.workspace, committed);
    }
}

#[test]
fn locked_relational_live_fails_without_quarantine() {
    let dir = tempfile::tempdir().unwrap();
    let config = CoreConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 0,
        },
        ..config(BackendKind::Relational)
    };
    let service = seed(dir.path(), &config);
    let committed = service.workspace().clone();
    drop(service);

    let layout = WorkspaceLayout::new(dir.path());
    let live = layout.live_path(BackendKind::Relational);
    let live_bytes = std::fs::read(&live).unwrap();
    let holder = rusqlite::Connection::open(&live).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let err = open_workspace(dir.path(), &config).unwrap_err();
    assert!(matches!(err, StoreError::Busy { .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(std::fs::read_dir(layout.quarantine_dir()).unwrap().count(), 0);
    assert_eq!(std::fs::read(&live).unwrap(), live_bytes);

    holder.execute_batch("ROLLBACK;").unwrap();
    drop(holder);
    let opened = open_workspace(dir.path(), &config).unwrap();
    assert_eq!(opened.recovery.outcome(), RecoveryState::Clean);
    assert_eq!(opened.workspace, committed);
}
