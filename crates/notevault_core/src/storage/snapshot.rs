//! Backup snapshots and quarantine.
//!
//! # Responsibility
//! - Copy committed artifacts into `backups/` on a commit cadence and prune
//!   old copies.
//! - Move damaged or orphaned artifacts into `quarantine/` instead of
//!   deleting them.
//! - Scrub every historical copy once content has been sealed, leaving a
//!   single snapshot of the sealed state.
//!
//! # Invariants
//! - Snapshot names embed the commit version: `<artifact>.v<version>.<ts>.bak`.
//! - Snapshot failures never fail the commit that triggered them.
//! - Quarantine names are unique even within one clock tick.

use crate::config::CoreConfig;
use crate::storage::layout::WorkspaceLayout;
use crate::storage::{BackendKind, StoreError, StoreResult};
use log::{info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SNAPSHOT_SUFFIX: &str = ".bak";

/// One snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub version: u64,
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Copies the live artifact of `kind` into the backups directory.
pub fn take_snapshot(layout: &WorkspaceLayout, kind: BackendKind, version: u64) -> StoreResult<PathBuf> {
    let dir = layout.backups_dir();
    std::fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
    let target = dir.join(format!(
        "{}.v{version:010}.{}{SNAPSHOT_SUFFIX}",
        kind.file_name(),
        timestamp()
    ));
    let live = layout.live_path(kind);
    std::fs::copy(&live, &target).map_err(|err| StoreError::io(&live, err))?;
    File::open(&target)
        .and_then(|file| file.sync_all())
        .map_err(|err| StoreError::io(&target, err))?;
    Ok(target)
}

/// Snapshots of `kind`, newest version first.
pub fn list_snapshots(layout: &WorkspaceLayout, kind: BackendKind) -> StoreResult<Vec<SnapshotEntry>> {
    let dir = layout.backups_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(&dir, err)),
    };
    let prefix = format!("{}.v", kind.file_name());
    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(&dir, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(SNAPSHOT_SUFFIX) {
            continue;
        }
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(version) = rest.split('.').next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        snapshots.push(SnapshotEntry {
            path: entry.path(),
            version,
        });
    }
    snapshots.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| b.path.cmp(&a.path)));
    Ok(snapshots)
}

/// Deletes all but the newest `keep` snapshots of `kind`.
pub fn prune_snapshots(layout: &WorkspaceLayout, kind: BackendKind, keep: usize) -> StoreResult<usize> {
    let mut removed = 0;
    for stale in list_snapshots(layout, kind)?.into_iter().skip(keep) {
        std::fs::remove_file(&stale.path).map_err(|err| StoreError::io(&stale.path, err))?;
        removed += 1;
    }
    Ok(removed)
}

/// Takes a snapshot when the cadence calls for one.
///
/// The first commit of a session is always snapshotted so a restore point
/// exists before the session's edits pile up.
pub fn after_commit(
    layout: &WorkspaceLayout,
    kind: BackendKind,
    version: u64,
    commits_this_session: u64,
    config: &CoreConfig,
) -> Option<PathBuf> {
    let periodic = config.backup_every_commits > 0 && version % config.backup_every_commits == 0;
    if commits_this_session != 1 && !periodic {
        return None;
    }
    match take_snapshot(layout, kind, version) {
        Ok(path) => {
            if let Err(err) = prune_snapshots(layout, kind, config.max_backups) {
                warn!(
                    "event=snapshot_prune module=storage status=error backend={} error={}",
                    kind, err
                );
            }
            info!(
                "event=snapshot module=storage status=ok backend={} version={}",
                kind, version
            );
            Some(path)
        }
        Err(err) => {
            warn!(
                "event=snapshot module=storage status=error backend={} version={} error={}",
                kind, version, err
            );
            None
        }
    }
}

/// Moves `path` into the quarantine directory, tagging it with `reason`.
pub fn quarantine(layout: &WorkspaceLayout, path: &Path, reason: &str) -> StoreResult<PathBuf> {
    let dir = layout.quarantine_dir();
    std::fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let tag = Uuid::new_v4().simple().to_string();
    let target = dir.join(format!("{name}.{}.{}.{reason}", timestamp(), &tag[..8]));
    if std::fs::rename(path, &target).is_err() {
        std::fs::copy(path, &target).map_err(|err| StoreError::io(path, err))?;
        std::fs::remove_file(path).map_err(|err| StoreError::io(path, err))?;
    }
    warn!(
        "event=quarantine module=storage path={} target={} reason={}",
        path.display(),
        target.display(),
        reason
    );
    Ok(target)
}

fn remove_path(path: &Path) -> StoreResult<bool> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn clear_dir(dir: &Path) -> StoreResult<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir, err))?;
        if remove_path(&entry.path())? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Deletes every copy of workspace content other than the live artifact of
/// `active`, then snapshots that live artifact as version `version`.
///
/// Runs after a commit that sealed content: older snapshots, quarantined
/// and retired artifacts, leftover staging files, migration scratch and the
/// inactive backend's artifact may all hold the plaintext that was sealed.
/// Returns the number of paths removed.
pub fn scrub_history(layout: &WorkspaceLayout, active: BackendKind, version: u64) -> StoreResult<usize> {
    let mut removed = 0;
    for dir in [layout.backups_dir(), layout.quarantine_dir(), layout.retired_dir()] {
        removed += clear_dir(&dir)?;
    }
    let mut stray = vec![layout.migration_dir(), layout.live_path(active.other())];
    for kind in [BackendKind::Document, BackendKind::Relational] {
        let staging = layout.staging_path(kind);
        let mut journal = staging.clone().into_os_string();
        journal.push("-journal");
        stray.push(staging);
        stray.push(PathBuf::from(journal));
    }
    for path in &stray {
        if remove_path(path)? {
            removed += 1;
        }
    }
    take_snapshot(layout, active, version)?;
    info!(
        "event=history_scrub module=storage status=ok backend={} version={} removed={}",
        active, version, removed
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::{after_commit, list_snapshots, quarantine, scrub_history};
    use crate::config::CoreConfig;
    use crate::storage::layout::WorkspaceLayout;
    use crate::storage::BackendKind;

    #[test]
    fn cadence_snapshots_first_and_periodic_commits_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        std::fs::write(layout.live_path(BackendKind::Document), b"x").unwrap();
        let config = CoreConfig {
            backup_every_commits: 2,
            max_backups: 2,
            ..CoreConfig::default()
        };

        let mut taken = 0;
        for (session_commit, version) in (1..=7).enumerate() {
            if after_commit(
                &layout,
                BackendKind::Document,
                version,
                session_commit as u64 + 1,
                &config,
            )
            .is_some()
            {
                taken += 1;
            }
        }
        // first commit (v1) plus v2, v4, v6
        assert_eq!(taken, 4);
        let versions: Vec<_> = list_snapshots(&layout, BackendKind::Document)
            .unwrap()
            .into_iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![6, 4]);
    }

    #[test]
    fn quarantine_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        let victim = dir.path().join("workspace.json");
        std::fs::write(&victim, b"garbage").unwrap();

        let target = quarantine(&layout, &victim, "corrupt").unwrap();
        assert!(!victim.exists());
        assert_eq!(std::fs::read(target).unwrap(), b"garbage");
    }

    #[test]
    fn quarantining_twice_in_a_row_keeps_both_copies() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        let victim = dir.path().join("workspace.json.staging");

        std::fs::write(&victim, b"first").unwrap();
        let first = quarantine(&layout, &victim, "interrupted").unwrap();
        std::fs::write(&victim, b"second").unwrap();
        let second = quarantine(&layout, &victim, "interrupted").unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(first).unwrap(), b"first");
        assert_eq!(std::fs::read(second).unwrap(), b"second");
    }

    #[test]
    fn scrub_leaves_only_live_and_one_fresh_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let config = CoreConfig::default();
        std::fs::write(layout.live_path(BackendKind::Document), b"old").unwrap();
        after_commit(&layout, BackendKind::Document, 1, 1, &config).unwrap();
        std::fs::write(layout.live_path(BackendKind::Relational), b"inactive").unwrap();
        std::fs::write(layout.staging_path(BackendKind::Relational), b"leftover").unwrap();
        std::fs::write(layout.retired_dir().join("workspace.json.retired"), b"old").unwrap();
        let stray = dir.path().join("workspace.json.staging");
        std::fs::write(&stray, b"old").unwrap();
        quarantine(&layout, &stray, "interrupted").unwrap();
        std::fs::create_dir_all(layout.migration_dir()).unwrap();

        std::fs::write(layout.live_path(BackendKind::Document), b"sealed").unwrap();
        let removed = scrub_history(&layout, BackendKind::Document, 2).unwrap();

        assert_eq!(removed, 6);
        let snapshots = list_snapshots(&layout, BackendKind::Document).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].version, 2);
        assert_eq!(std::fs::read(&snapshots[0].path).unwrap(), b"sealed");
        assert_eq!(std::fs::read_dir(layout.quarantine_dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.retired_dir()).unwrap().count(), 0);
        assert!(!layout.live_path(BackendKind::Relational).exists());
        assert!(!layout.staging_path(BackendKind::Relational).exists());
        assert!(!layout.migration_dir().exists());
    }
}
