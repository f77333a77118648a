use notevault_core::{
    mention_link, open_workspace_with, AtomicCommitter, BackendKind, CommitFs, CoreConfig,
    KdfParams, MentionResolution, NoteContent, NoteService, OsFs, RecoveryNotice, RetryPolicy,
    ServiceError, StoreError, VaultError, VaultSession, WorkspaceLayout,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn config(backend: BackendKind) -> CoreConfig {
    CoreConfig {
        default_backend: backend,
        kdf: KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
        ..CoreConfig::default()
    }
}

#[test]
fn locked_vault_hides_notes_until_the_right_password() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = NoteService::open(dir.path(), &config(BackendKind::Document)).unwrap();
    let mut session = VaultSession::new();
    let work = service.create_folder(service.root_id(), "Work").unwrap();
    let plan = service
        .create_note(&session, work, "Plan", b"draft".to_vec())
        .unwrap();

    service.lock_folder(work, "hunter2").unwrap();
    assert!(service.autocomplete(&session, "Pla", 10).is_empty());
    assert_eq!(service.search(&session, "draft").count(), 0);

    let err = service
        .unlock_folder(&mut session, work, "wrong")
        .unwrap_err();
    assert!(matches!(err, ServiceError::Vault(VaultError::AuthFailed)));
    assert!(service.autocomplete(&session, "Pla", 10).is_empty());

    service.unlock_folder(&mut session, work, "hunter2").unwrap();
    let candidates = service.autocomplete(&session, "Pla", 10);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].title, "Plan");
    assert_eq!(candidates[0].id, plan);
    assert_eq!(service.read_note(&session, plan).unwrap().body, b"draft");
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }
    files
}

fn assert_no_plaintext(root: &Path, needles: &[&[u8]]) {
    for path in files_under(root) {
        let bytes = std::fs::read(&path).unwrap();
        for needle in needles {
            assert!(
                !bytes.windows(needle.len()).any(|window| window == *needle),
                "{} leaks {:?}",
                path.display(),
                String::from_utf8_lossy(needle)
            );
        }
    }
}

#[test]
fn sealed_content_never_reaches_disk_in_plaintext() {
    let title: &[u8] = b"Diary of Zanzibar";
    let body: &[u8] = b"a very secret entry";
    for backend in [BackendKind::Document, BackendKind::Relational] {
        let dir = tempfile::tempdir().unwrap();
        let config = config(backend);
        let layout = WorkspaceLayout::new(dir.path());
        let mut service = NoteService::open(dir.path(), &config).unwrap();
        let session = VaultSession::new();
        let vault = service.create_folder(service.root_id(), "Private").unwrap();
        service
            .create_note(&session, vault, "Diary of Zanzibar", body.to_vec())
            .unwrap();
        service.flush().unwrap();
        // Leaves a retired copy and an inactive artifact of the other backend.
        service.migrate_to(backend.other()).unwrap();
        service.migrate_to(backend).unwrap();
        drop(service);

        // A leftover staging copy is quarantined on the next open.
        std::fs::copy(layout.live_path(backend), layout.staging_path(backend)).unwrap();
        let mut service = NoteService::open(dir.path(), &config).unwrap();
        assert_eq!(service.recovery().quarantined.len(), 1);
        assert!(!files_under(&layout.retired_dir()).is_empty());

        service.lock_folder(vault, "pw").unwrap();
        assert_no_plaintext(dir.path(), &[title, body]);
        assert_eq!(files_under(&layout.backups_dir()).len(), 1);
    }
}

#[test]
fn locked_folder_is_restored_locked_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    let mut service = NoteService::open(dir.path(), &config).unwrap();
    let session = VaultSession::new();
    let vault = service.create_folder(service.root_id(), "Private").unwrap();
    let note = service
        .create_note(&session, vault, "Diary", b"a very secret entry".to_vec())
        .unwrap();
    service.flush().unwrap();
    service.lock_folder(vault, "pw").unwrap();
    drop(service);

    let layout = WorkspaceLayout::new(dir.path());
    std::fs::write(layout.live_path(BackendKind::Document), b"garbage").unwrap();
    let service = NoteService::open(dir.path(), &config).unwrap();
    assert!(service
        .recovery()
        .notices
        .iter()
        .any(|notice| matches!(notice, RecoveryNotice::RecoveredFromBackup { .. })));
    assert!(service.workspace().folder(vault).unwrap().is_locked());
    assert!(service.workspace().note(note).unwrap().content.is_sealed());
    assert_no_plaintext(dir.path(), &[b"a very secret entry"]);
}

/// Rename and copy fail while `jammed` is set.
#[derive(Default)]
struct JammedFs {
    jammed: AtomicBool,
}

impl CommitFs for JammedFs {
    fn sync_file(&self, path: &Path) -> io::Result<()> {
        OsFs.sync_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.jammed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "jammed"));
        }
        OsFs.rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        if self.jammed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "jammed"));
        }
        OsFs.copy(from, to)
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        OsFs.sync_dir(dir)
    }
}

#[test]
fn failed_lock_commit_leaves_the_folder_plain() {
    let dir = tempfile::tempdir().unwrap();
    let config = CoreConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 0,
        },
        ..config(BackendKind::Document)
    };
    let fs = Arc::new(JammedFs::default());
    let committer = AtomicCommitter::with_fs(fs.clone(), config.retry);
    let mut service = NoteService::from_opened(open_workspace_with(dir.path(), &config, committer).unwrap());
    let session = VaultSession::new();
    let vault = service.create_folder(service.root_id(), "Private").unwrap();
    let note = service
        .create_note(&session, vault, "Diary", b"jammed entry 93".to_vec())
        .unwrap();
    service.flush().unwrap();

    fs.jammed.store(true, Ordering::SeqCst);
    let err = service.lock_folder(vault, "pw").unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Store(StoreError::WriteFailed { .. })
    ));
    assert!(!service.workspace().folder(vault).unwrap().is_locked());
    assert!(matches!(
        service.workspace().note(note).unwrap().content,
        NoteContent::Plain { .. }
    ));
    assert!(!service.is_dirty());
    assert_eq!(service.read_note(&session, note).unwrap().body, b"jammed entry 93");
    service.workspace().validate().unwrap();

    fs.jammed.store(false, Ordering::SeqCst);
    service.lock_folder(vault, "pw").unwrap();
    assert!(service.workspace().folder(vault).unwrap().is_locked());
    assert_no_plaintext(dir.path(), &[b"jammed entry 93"]);
}

#[test]
fn locked_note_survives_reopen_and_backend_switch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Document);
    let mut service = NoteService::open(dir.path(), &config).unwrap();
    let mut session = VaultSession::new();
    let note = service
        .create_note(&session, service.root_id(), "Bank pin", b"pin 4711".to_vec())
        .unwrap();
    service.flush().unwrap();
    service.lock_note(note, "pw").unwrap();
    service.migrate_to(BackendKind::Relational).unwrap();
    assert_no_plaintext(dir.path(), &[b"Bank pin", b"pin 4711"]);
    drop(service);

    let service = NoteService::open(dir.path(), &config).unwrap();
    assert_eq!(service.backend(), BackendKind::Relational);
    assert!(service.workspace().note(note).unwrap().is_locked());
    assert_eq!(
        service.resolve_mention(&session, &note.to_string()).unwrap(),
        MentionResolution::NoteUnlockRequired { note_id: note }
    );
    assert!(service.autocomplete(&session, "Bank", 10).is_empty());
    service.unlock_note(&mut session, note, "pw").unwrap();
    assert_eq!(service.read_note(&session, note).unwrap().body, b"pin 4711");
    assert_eq!(service.autocomplete(&session, "Bank", 10).len(), 1);
}

#[test]
fn relock_requires_the_password_again_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(BackendKind::Relational);
    let mut service = NoteService::open(dir.path(), &config).unwrap();
    let mut session = VaultSession::new();
    let vault = service.create_folder(service.root_id(), "Vault").unwrap();
    service.lock_folder(vault, "pw").unwrap();
    service.unlock_folder(&mut session, vault, "pw").unwrap();
    let secret = service
        .create_note(&session, vault, "Keys", b"0000".to_vec())
        .unwrap();
    let outside = service
        .create_note(
            &session,
            service.root_id(),
            "Index",
            format!("see {}", mention_link(secret)).into_bytes(),
        )
        .unwrap();
    assert!(service.workspace().note(secret).unwrap().content.is_sealed());
    service.flush().unwrap();
    drop(service);

    let service = NoteService::open(dir.path(), &config).unwrap();
    let mut session = VaultSession::new();
    assert!(matches!(
        service.read_note(&session, secret),
        Err(ServiceError::Vault(VaultError::Locked(_)))
    ));
    assert_eq!(
        service
            .resolve_mention(&session, &mention_link(secret))
            .unwrap(),
        MentionResolution::UnlockRequired { folder_id: vault }
    );
    assert_eq!(service.backlinks(secret).unwrap()[0].id, outside);

    service.unlock_folder(&mut session, vault, "pw").unwrap();
    assert!(matches!(
        service.resolve_mention(&session, &secret.to_string()).unwrap(),
        MentionResolution::Resolved(view) if view.body == b"0000"
    ));
    assert!(service.relock_folder(&mut session, vault));
    assert!(matches!(
        service.read_note(&session, secret),
        Err(ServiceError::Vault(VaultError::Locked(_)))
    ));
}

#[test]
fn unlocking_a_plain_folder_looks_like_a_wrong_password() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = NoteService::open(dir.path(), &config(BackendKind::Document)).unwrap();
    let mut session = VaultSession::new();
    let plain = service.create_folder(service.root_id(), "Plain").unwrap();

    for target in [plain, uuid::Uuid::new_v4()] {
        assert!(matches!(
            service.unlock_folder(&mut session, target, "pw"),
            Err(ServiceError::Vault(VaultError::AuthFailed))
        ));
    }
    assert_eq!(session.unlocked_count(), 0);
}

#[test]
fn removing_a_vault_restores_plain_notes_and_mentions() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = NoteService::open(dir.path(), &config(BackendKind::Document)).unwrap();
    let mut session = VaultSession::new();
    let root = service.root_id();
    let target = service.create_note(&session, root, "Target", Vec::new()).unwrap();
    let vault = service.create_folder(root, "Vault").unwrap();
    let inner = service
        .create_note(
            &session,
            vault,
            "Inner",
            format!("links {}", mention_link(target)).into_bytes(),
        )
        .unwrap();
    assert_eq!(service.backlinks(target).unwrap().len(), 1);

    service.lock_folder(vault, "pw").unwrap();
    assert!(service.backlinks(target).unwrap().is_empty());

    assert!(matches!(
        service.remove_vault(&mut session, vault, "nope"),
        Err(ServiceError::Vault(VaultError::AuthFailed))
    ));
    service.remove_vault(&mut session, vault, "pw").unwrap();
    assert!(matches!(
        service.workspace().note(inner).unwrap().content,
        NoteContent::Plain { .. }
    ));
    assert_eq!(service.backlinks(target).unwrap()[0].id, inner);
    assert!(!service.workspace().folder(vault).unwrap().is_locked());
    assert!(!service.is_dirty());
}

#[test]
fn nested_vaults_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = NoteService::open(dir.path(), &config(BackendKind::Document)).unwrap();
    let outer = service.create_folder(service.root_id(), "Outer").unwrap();
    let inner = service.create_folder(outer, "Inner").unwrap();

    service.lock_folder(inner, "pw").unwrap();
    assert!(matches!(
        service.lock_folder(outer, "pw"),
        Err(ServiceError::Vault(VaultError::NestedVault(id))) if id == inner
    ));
    assert!(matches!(
        service.lock_folder(inner, "pw"),
        Err(ServiceError::Vault(VaultError::AlreadyVault(_)))
    ));
    assert!(matches!(
        service.lock_folder(outer, ""),
        Err(ServiceError::InvalidPassword)
    ));
}
