//! Verified migration between backend kinds.
//!
//! # Responsibility
//! - Copy the committed workspace from the live backend into a scratch
//!   target of the other kind.
//! - Re-read the target and compare every record checksum with the source.
//! - Switch the marker only after verification passed.
//!
//! # Invariants
//! - The source artifact is never opened for writing; its bytes hash the
//!   same before and after.
//! - On any failure the scratch target is discarded and the source stays live.
//!   A target promoted before the marker switch failed is moved to
//!   `retired/`, so no live-looking artifact disagrees with the marker.
//! - The version stamp carries over unchanged.

use crate::model::Workspace;
use crate::storage::layout::WorkspaceLayout;
use crate::storage::{
    read_artifact, BackendKind, Storage, StoreError, StoreResult, WorkspaceStore,
};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Summary of a completed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub source: BackendKind,
    pub target: BackendKind,
    pub folders: usize,
    pub notes: usize,
    pub mentions: usize,
    /// Folder and note record checksums compared equal.
    pub verified_checksums: usize,
    /// Version stamp shared by source and target.
    pub version: u64,
    /// Source artifact, left in place as the retired backup.
    pub retired_source: PathBuf,
    /// Older target-kind artifact moved aside, if one existed.
    pub retired_stale_target: Option<PathBuf>,
    pub duration_ms: u128,
}

fn abort(stage: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::MigrationAborted(format!("{stage}: {err}"))
}

fn hash_file(path: &Path) -> StoreResult<blake3::Hash> {
    let bytes = std::fs::read(path).map_err(|err| StoreError::io(path, err))?;
    Ok(blake3::hash(&bytes))
}

/// Compares every entity record; returns the number of checksums verified.
fn compare(source: &Workspace, target: &Workspace) -> Result<usize, String> {
    if source.root_id != target.root_id {
        return Err("root folder differs".to_string());
    }
    if source.folders.len() != target.folders.len() || source.notes.len() != target.notes.len() {
        return Err(format!(
            "entity counts differ: {}/{} folders, {}/{} notes",
            source.folders.len(),
            target.folders.len(),
            source.notes.len(),
            target.notes.len()
        ));
    }
    let mut verified = 0;
    for (id, folder) in &source.folders {
        match target.folders.get(id) {
            Some(copy) if copy.record_checksum() == folder.record_checksum() => verified += 1,
            _ => return Err(format!("folder {id} checksum mismatch")),
        }
    }
    for (id, note) in &source.notes {
        match target.notes.get(id) {
            Some(copy)
                if copy.record_checksum() == note.record_checksum()
                    && copy.checksum == note.checksum =>
            {
                verified += 1
            }
            _ => return Err(format!("note {id} checksum mismatch")),
        }
    }
    if source.mentions != target.mentions {
        return Err("mention index differs".to_string());
    }
    if source.settings != target.settings {
        return Err("settings differ".to_string());
    }
    Ok(verified)
}

fn retire(layout: &WorkspaceLayout, path: &Path) -> StoreResult<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let dir = layout.retired_dir();
    std::fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let target = dir.join(format!(
        "{name}.{}.retired",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ")
    ));
    std::fs::rename(path, &target).map_err(|err| StoreError::io(path, err))?;
    Ok(Some(target))
}

/// Migrates the live workspace of `storage` to `target`.
///
/// Returns the storage bound to the target backend.
pub(crate) fn migrate(storage: &Storage, target: BackendKind) -> StoreResult<(Storage, MigrationReport)> {
    migrate_with_hook(storage, target, &|_| Ok(()))
}

/// [`migrate`] with a hook that runs after the scratch target is written and
/// before it is verified.
pub(crate) fn migrate_with_hook(
    storage: &Storage,
    target: BackendKind,
    before_verify: &dyn Fn(&Path) -> StoreResult<()>,
) -> StoreResult<(Storage, MigrationReport)> {
    let source = storage.kind();
    if source == target {
        return Err(StoreError::InvalidRequest(format!(
            "workspace already uses the {target} backend"
        )));
    }
    let started_at = Instant::now();
    let layout = storage.layout().clone();
    let scratch = layout.migration_dir();
    info!(
        "event=migration module=migration status=start source={} target={}",
        source, target
    );

    let result = stage_and_verify(storage, target, &layout, &scratch, before_verify);
    let outcome = result.and_then(|staged| promote(storage, target, &layout, &scratch, staged));

    if scratch.exists() {
        if let Err(err) = std::fs::remove_dir_all(&scratch) {
            error!(
                "event=migration module=migration status=warn stage=cleanup error={}",
                err
            );
        }
    }

    match outcome {
        Ok((next, mut report)) => {
            report.duration_ms = started_at.elapsed().as_millis();
            info!(
                "event=migration module=migration status=ok source={} target={} notes={} folders={} verified={} duration_ms={}",
                source, target, report.notes, report.folders, report.verified_checksums, report.duration_ms
            );
            Ok((next, report))
        }
        Err(err) => {
            error!(
                "event=migration module=migration status=error source={} target={} duration_ms={} error={}",
                source,
                target,
                started_at.elapsed().as_millis(),
                err
            );
            Err(match err {
                StoreError::MigrationAborted(_) => err,
                other => abort("migration", other),
            })
        }
    }
}

struct Staged {
    scratch_live: PathBuf,
    report: MigrationReport,
}

fn stage_and_verify(
    storage: &Storage,
    target: BackendKind,
    layout: &WorkspaceLayout,
    scratch: &Path,
    before_verify: &dyn Fn(&Path) -> StoreResult<()>,
) -> StoreResult<Staged> {
    let source = storage.kind();
    let source_live = layout.live_path(source);
    let hash_before = hash_file(&source_live).map_err(|err| abort("read source", err))?;
    let (workspace, stamp) =
        read_artifact(source, &source_live).map_err(|err| abort("load source", err))?;

    if scratch.exists() {
        std::fs::remove_dir_all(scratch).map_err(|err| abort("reset scratch", err))?;
    }
    let scratch_layout = WorkspaceLayout::new(scratch);
    scratch_layout
        .ensure_dirs()
        .map_err(|err| abort("create scratch", err))?;

    let mut staged_store = Storage::open_with_committer(
        scratch_layout.clone(),
        target,
        storage.config(),
        storage.committer().clone(),
    );
    staged_store
        .save_with_version(&workspace, stamp.version)
        .map_err(|err| abort("write target", err))?;

    let scratch_live = scratch_layout.live_path(target);
    before_verify(&scratch_live).map_err(|err| abort("write target", err))?;

    let (copy, copy_stamp) =
        read_artifact(target, &scratch_live).map_err(|err| abort("re-read target", err))?;
    if copy_stamp.version != stamp.version {
        return Err(abort(
            "verify",
            format!("version {} != {}", copy_stamp.version, stamp.version),
        ));
    }
    let verified = compare(&workspace, &copy).map_err(|reason| abort("verify", reason))?;

    let hash_after = hash_file(&source_live).map_err(|err| abort("read source", err))?;
    if hash_before != hash_after {
        return Err(abort("verify", "source artifact changed during migration"));
    }

    Ok(Staged {
        scratch_live,
        report: MigrationReport {
            source,
            target,
            folders: workspace.folders.len(),
            notes: workspace.notes.len(),
            mentions: workspace.mentions.len(),
            verified_checksums: verified,
            version: stamp.version,
            retired_source: source_live,
            retired_stale_target: None,
            duration_ms: 0,
        },
    })
}

fn promote(
    storage: &Storage,
    target: BackendKind,
    layout: &WorkspaceLayout,
    scratch: &Path,
    staged: Staged,
) -> StoreResult<(Storage, MigrationReport)> {
    let Staged {
        scratch_live,
        mut report,
    } = staged;
    let committer = storage.committer().clone();
    let target_live = layout.live_path(target);
    let target_staging = layout.staging_path(target);

    report.retired_stale_target = retire(layout, &target_live).map_err(|err| abort("retire", err))?;
    retire(layout, &target_staging).map_err(|err| abort("retire", err))?;

    committer
        .commit(&target_live, &target_staging, |staging| {
            std::fs::rename(&scratch_live, staging).map_err(|err| StoreError::io(&scratch_live, err))
        })
        .map_err(|err| abort("promote", err))?;
    if let Err(err) = layout.write_marker(target, &committer) {
        match retire(layout, &target_live) {
            Ok(retired) => error!(
                "event=migration module=migration status=error stage=switch_marker action=target_retired retired={:?}",
                retired
            ),
            Err(retire_err) => error!(
                "event=migration module=migration status=error stage=switch_marker action=target_kept error={}",
                retire_err
            ),
        }
        return Err(abort("switch marker", err));
    }
    info!(
        "event=migration module=migration status=switched target={} scratch={}",
        target,
        scratch.display()
    );

    let next = Storage::open_with_committer(layout.clone(), target, storage.config(), committer);
    Ok((next, report))
}

#[cfg(test)]
mod tests {
    use super::migrate_with_hook;
    use crate::config::CoreConfig;
    use crate::config::RetryPolicy;
    use crate::model::{Folder, Note, Workspace};
    use crate::storage::layout::{MarkerState, WorkspaceLayout};
    use crate::storage::{BackendKind, Storage, StoreError, WorkspaceStore};
    use rusqlite::Connection;

    fn seeded(dir: &std::path::Path) -> (Storage, Workspace) {
        let layout = WorkspaceLayout::new(dir);
        layout.ensure_dirs().unwrap();
        let config = CoreConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 0,
            },
            ..CoreConfig::default()
        };
        let mut storage = Storage::open(layout, BackendKind::Document, &config);
        let mut ws = Workspace::new();
        let folder = Folder::new(Some(ws.root_id), "Work");
        let folder_id = folder.id;
        ws.insert_folder(folder);
        ws.insert_note(Note::new(folder_id, "Plan", b"draft".to_vec()));
        storage.save(&ws).unwrap();
        (storage, ws)
    }

    #[test]
    fn tampered_target_aborts_and_keeps_source_live() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, ws) = seeded(dir.path());
        let source_bytes = std::fs::read(storage.live_path()).unwrap();

        let err = migrate_with_hook(&storage, BackendKind::Relational, &|target| {
            let conn = Connection::open(target)?;
            conn.execute("UPDATE notes SET pinned = 1;", [])?;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, StoreError::MigrationAborted(_)));
        assert_eq!(std::fs::read(storage.live_path()).unwrap(), source_bytes);
        assert!(!storage.layout().migration_dir().exists());
        assert!(!storage
            .layout()
            .live_path(BackendKind::Relational)
            .exists());
        assert_ne!(
            storage.layout().read_marker(),
            MarkerState::Present(BackendKind::Relational)
        );
        assert_eq!(storage.load().unwrap(), ws);
    }

    #[test]
    fn same_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = seeded(dir.path());
        assert!(matches!(
            migrate_with_hook(&storage, BackendKind::Document, &|_| Ok(())),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn failed_marker_switch_retires_the_promoted_target() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, ws) = seeded(dir.path());
        // A directory where the marker file belongs makes the switch fail.
        std::fs::create_dir_all(storage.layout().marker_path()).unwrap();

        let err = migrate_with_hook(&storage, BackendKind::Relational, &|_| Ok(())).unwrap_err();

        assert!(matches!(err, StoreError::MigrationAborted(_)));
        let layout = storage.layout();
        assert!(!layout.live_path(BackendKind::Relational).exists());
        let retired: Vec<_> = std::fs::read_dir(layout.retired_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(retired.len(), 1);
        assert!(retired[0].starts_with("workspace.sqlite3."));
        assert_eq!(storage.load().unwrap(), ws);
    }
}
