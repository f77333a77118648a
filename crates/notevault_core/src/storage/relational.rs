//! Relational backend: indexed SQLite rows.
//!
//! # Responsibility
//! - Persist folders, notes, child order, mentions and settings as rows.
//! - Commit incrementally: only rows whose record checksum changed are
//!   rewritten, inside one transaction on a staged copy of the database.
//! - Serve summary pages straight from SQL.
//!
//! # Invariants
//! - No connection outlives a single operation; the live file is only ever
//!   replaced through the atomic committer.
//! - `commit_meta.digest` equals `Workspace::digest()` of the committed
//!   state; a mismatch on load marks the artifact corrupt.
//! - Schema v1 artifacts (no settings table) remain readable.

use crate::config::CoreConfig;
use crate::db::migrations::{
    current_user_version, latest_version, NOTE_LOCK_SCHEMA_VERSION, SETTINGS_SCHEMA_VERSION,
};
use crate::db::{open_db, open_db_read_only, DbError};
use crate::model::{
    now_epoch_ms, EntityKind, Folder, KdfParams, Mention, Note, NoteContent, VaultParams,
    Workspace,
};
use crate::storage::commit::AtomicCommitter;
use crate::storage::layout::WorkspaceLayout;
use crate::storage::summary::{EntitySummary, ListScope, SummaryCursor, SummarySource};
use crate::storage::{
    remove_entity, snapshot, ArtifactCheck, BackendKind, CommitAck, CommitStamp, StoreError,
    StoreResult, WorkspaceStore,
};
use log::{error, info, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// Maps a read-side SQLite error: lock contention is transient, anything
/// else means the artifact cannot be trusted.
fn read_error(artifact: &Path, err: impl Into<DbError>) -> StoreError {
    match err.into() {
        DbError::Sqlite(err)
            if matches!(
                err.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ) =>
        {
            StoreError::Busy {
                artifact: artifact.to_path_buf(),
                reason: err.to_string(),
            }
        }
        other => StoreError::corrupt(artifact, other.to_string()),
    }
}

/// Rebuilds vault parameters from their nullable columns.
fn vault_columns(
    artifact: &Path,
    owner: &str,
    salt: Option<String>,
    verify_tag: Option<String>,
    costs: (Option<u32>, Option<u32>, Option<u32>),
) -> StoreResult<Option<VaultParams>> {
    match (salt, verify_tag, costs) {
        (None, None, _) => Ok(None),
        (Some(salt), Some(verify_tag), (Some(memory_kib), Some(iterations), Some(parallelism))) => {
            Ok(Some(VaultParams {
                salt,
                verify_tag,
                kdf: KdfParams {
                    memory_kib,
                    iterations,
                    parallelism,
                },
            }))
        }
        (Some(_), Some(_), _) => Err(StoreError::corrupt(
            artifact,
            format!("{owner}: vault without kdf parameters"),
        )),
        _ => Err(StoreError::corrupt(
            artifact,
            format!("{owner}: half-written vault parameters"),
        )),
    }
}

fn parse_id(artifact: &Path, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| StoreError::corrupt(artifact, format!("bad id {raw}: {err}")))
}

struct FolderRow {
    id: String,
    parent_id: Option<String>,
    title: String,
    vault_salt: Option<String>,
    vault_tag: Option<String>,
    vault_memory_kib: Option<u32>,
    vault_iterations: Option<u32>,
    vault_parallelism: Option<u32>,
    modified_at: i64,
}

struct NoteRow {
    id: String,
    folder_id: String,
    title: Option<String>,
    body: Option<Vec<u8>>,
    sealed: Option<Vec<u8>>,
    pinned: bool,
    modified_at: i64,
    checksum: String,
    lock_salt: Option<String>,
    lock_tag: Option<String>,
    lock_costs: (Option<u32>, Option<u32>, Option<u32>),
}

fn read_workspace(artifact: &Path, conn: &Connection) -> StoreResult<(Workspace, CommitStamp)> {
    let err = |e: rusqlite::Error| read_error(artifact, e);

    let check: String = conn
        .query_row("PRAGMA quick_check;", [], |row| row.get(0))
        .map_err(err)?;
    if check != "ok" {
        return Err(StoreError::corrupt(artifact, format!("quick_check: {check}")));
    }

    let schema = current_user_version(conn).map_err(|e| read_error(artifact, e))?;
    if schema == 0 || schema > latest_version() {
        return Err(StoreError::corrupt(
            artifact,
            format!("unsupported schema version {schema}"),
        ));
    }

    let meta = conn
        .query_row(
            "SELECT root_id, version, digest, committed_at FROM commit_meta WHERE id = 1;",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(err)?
        .ok_or_else(|| StoreError::corrupt(artifact, "commit metadata missing"))?;
    let (root_raw, version, digest, committed_at) = meta;

    let mut workspace = Workspace {
        root_id: parse_id(artifact, &root_raw)?,
        folders: Default::default(),
        notes: Default::default(),
        mentions: Default::default(),
        settings: Default::default(),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, parent_id, title, vault_salt, vault_tag, vault_memory_kib,
                    vault_iterations, vault_parallelism, modified_at
             FROM folders;",
        )
        .map_err(err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(FolderRow {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                title: row.get(2)?,
                vault_salt: row.get(3)?,
                vault_tag: row.get(4)?,
                vault_memory_kib: row.get(5)?,
                vault_iterations: row.get(6)?,
                vault_parallelism: row.get(7)?,
                modified_at: row.get(8)?,
            })
        })
        .map_err(err)?;
    for row in rows {
        let row = row.map_err(err)?;
        let vault = vault_columns(
            artifact,
            &row.id,
            row.vault_salt,
            row.vault_tag,
            (row.vault_memory_kib, row.vault_iterations, row.vault_parallelism),
        )?;
        let folder = Folder {
            id: parse_id(artifact, &row.id)?,
            title: row.title,
            parent_id: row
                .parent_id
                .as_deref()
                .map(|raw| parse_id(artifact, raw))
                .transpose()?,
            children: Vec::new(),
            vault,
            modified_at: row.modified_at,
        };
        workspace.folders.insert(folder.id, folder);
    }

    let mut stmt = conn
        .prepare("SELECT parent_id, child_id FROM tree_children ORDER BY parent_id, position;")
        .map_err(err)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(err)?;
    for row in rows {
        let (parent_raw, child_raw) = row.map_err(err)?;
        let parent = parse_id(artifact, &parent_raw)?;
        let child = parse_id(artifact, &child_raw)?;
        let folder = workspace
            .folders
            .get_mut(&parent)
            .ok_or_else(|| StoreError::corrupt(artifact, format!("orphan child row under {parent}")))?;
        folder.children.push(child);
    }

    // Artifacts older than the note-lock schema read as unlocked notes.
    let lock_columns = if schema >= NOTE_LOCK_SCHEMA_VERSION {
        "lock_salt, lock_tag, lock_memory_kib, lock_iterations, lock_parallelism"
    } else {
        "NULL, NULL, NULL, NULL, NULL"
    };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, folder_id, title, body, sealed, pinned, modified_at, checksum, {lock_columns}
             FROM notes;"
        ))
        .map_err(err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(NoteRow {
                id: row.get(0)?,
                folder_id: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
                sealed: row.get(4)?,
                pinned: row.get(5)?,
                modified_at: row.get(6)?,
                checksum: row.get(7)?,
                lock_salt: row.get(8)?,
                lock_tag: row.get(9)?,
                lock_costs: (row.get(10)?, row.get(11)?, row.get(12)?),
            })
        })
        .map_err(err)?;
    for row in rows {
        let row = row.map_err(err)?;
        let content = match (row.title, row.body, row.sealed) {
            (Some(title), Some(body), None) => NoteContent::Plain { title, body },
            (None, None, Some(blob)) => NoteContent::Sealed { blob },
            _ => return Err(StoreError::corrupt(artifact, format!("note {} has mixed content", row.id))),
        };
        let lock = vault_columns(artifact, &row.id, row.lock_salt, row.lock_tag, row.lock_costs)?;
        let note = Note {
            id: parse_id(artifact, &row.id)?,
            folder_id: parse_id(artifact, &row.folder_id)?,
            content,
            pinned: row.pinned,
            modified_at: row.modified_at,
            checksum: row.checksum,
            lock,
        };
        workspace.notes.insert(note.id, note);
    }

    let mut stmt = conn
        .prepare("SELECT source_id, target_id FROM mentions;")
        .map_err(err)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(err)?;
    for row in rows {
        let (source, target) = row.map_err(err)?;
        workspace.mentions.insert(Mention {
            source: parse_id(artifact, &source)?,
            target: parse_id(artifact, &target)?,
        });
    }

    if schema >= SETTINGS_SCHEMA_VERSION {
        let mut stmt = conn
            .prepare("SELECT key, value FROM app_settings;")
            .map_err(err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(err)?;
        for row in rows {
            let (key, value) = row.map_err(err)?;
            workspace.settings.insert(key, value);
        }
    }

    workspace
        .validate()
        .map_err(|e| StoreError::corrupt(artifact, e.to_string()))?;
    if workspace.digest() != digest {
        return Err(StoreError::corrupt(artifact, "workspace digest mismatch"));
    }

    Ok((
        workspace,
        CommitStamp {
            version: u64::try_from(version)
                .map_err(|_| StoreError::corrupt(artifact, "negative commit version"))?,
            checksum: digest,
            committed_at,
        },
    ))
}

/// Reads, verifies and validates a relational artifact.
pub fn read_relational(artifact: &Path) -> StoreResult<(Workspace, CommitStamp)> {
    if !artifact.exists() {
        return Err(StoreError::Missing(artifact.to_path_buf()));
    }
    let conn = open_db_read_only(artifact).map_err(|e| read_error(artifact, e))?;
    read_workspace(artifact, &conn)
}

/// Full verification of a relational artifact.
pub fn verify_relational(artifact: &Path) -> ArtifactCheck {
    match read_relational(artifact) {
        Ok((_, stamp)) => ArtifactCheck::Valid(stamp),
        Err(StoreError::Missing(_)) => ArtifactCheck::Missing,
        Err(StoreError::Busy { reason, .. }) => ArtifactCheck::Busy(reason),
        Err(err) => ArtifactCheck::Corrupt(err.to_string()),
    }
}

fn existing_checksums(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = tx.prepare(&format!("SELECT id, record_checksum FROM {table};"))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let checksums = rows.collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(checksums)
}

/// Writes `workspace` into `tx`; returns the number of entity rows written
/// or deleted.
fn write_workspace(
    tx: &Transaction<'_>,
    workspace: &Workspace,
    stamp: &CommitStamp,
) -> rusqlite::Result<usize> {
    let mut touched = 0;

    let existing = existing_checksums(tx, "folders")?;
    let mut live_ids = HashSet::with_capacity(workspace.folders.len());
    {
        let mut upsert = tx.prepare(
            "INSERT OR REPLACE INTO folders (id, parent_id, title, vault_salt, vault_tag,
                 vault_memory_kib, vault_iterations, vault_parallelism, modified_at, record_checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
        )?;
        for folder in workspace.folders.values() {
            let id = folder.id.to_string();
            let checksum = folder.record_checksum();
            if existing.get(&id) != Some(&checksum) {
                let vault = folder.vault.as_ref();
                upsert.execute(params![
                    id,
                    folder.parent_id.map(|p| p.to_string()),
                    folder.title,
                    vault.map(|v| v.salt.as_str()),
                    vault.map(|v| v.verify_tag.as_str()),
                    vault.map(|v| v.kdf.memory_kib),
                    vault.map(|v| v.kdf.iterations),
                    vault.map(|v| v.kdf.parallelism),
                    folder.modified_at,
                    checksum,
                ])?;
                touched += 1;
            }
            live_ids.insert(id);
        }
    }
    for stale in existing.keys().filter(|id| !live_ids.contains(*id)) {
        tx.execute("DELETE FROM folders WHERE id = ?1;", params![stale])?;
        touched += 1;
    }

    let existing = existing_checksums(tx, "notes")?;
    let mut live_ids = HashSet::with_capacity(workspace.notes.len());
    {
        let mut upsert = tx.prepare(
            "INSERT OR REPLACE INTO notes (id, folder_id, title, body, sealed, pinned,
                 modified_at, checksum, record_checksum, lock_salt, lock_tag,
                 lock_memory_kib, lock_iterations, lock_parallelism)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14);",
        )?;
        for note in workspace.notes.values() {
            let id = note.id.to_string();
            let checksum = note.record_checksum();
            if existing.get(&id) != Some(&checksum) {
                let (title, body, sealed) = match &note.content {
                    NoteContent::Plain { title, body } => {
                        (Some(title.as_str()), Some(body.as_slice()), None)
                    }
                    NoteContent::Sealed { blob } => (None, None, Some(blob.as_slice())),
                };
                let lock = note.lock.as_ref();
                upsert.execute(params![
                    id,
                    note.folder_id.to_string(),
                    title,
                    body,
                    sealed,
                    note.pinned,
                    note.modified_at,
                    note.checksum,
                    checksum,
                    lock.map(|l| l.salt.as_str()),
                    lock.map(|l| l.verify_tag.as_str()),
                    lock.map(|l| l.kdf.memory_kib),
                    lock.map(|l| l.kdf.iterations),
                    lock.map(|l| l.kdf.parallelism),
                ])?;
                touched += 1;
            }
            live_ids.insert(id);
        }
    }
    for stale in existing.keys().filter(|id| !live_ids.contains(*id)) {
        tx.execute("DELETE FROM notes WHERE id = ?1;", params![stale])?;
        touched += 1;
    }

    tx.execute("DELETE FROM tree_children;", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO tree_children (parent_id, child_id, position) VALUES (?1, ?2, ?3);",
        )?;
        for folder in workspace.folders.values() {
            let parent = folder.id.to_string();
            for (position, child) in folder.children.iter().enumerate() {
                insert.execute(params![parent, child.to_string(), position as i64])?;
            }
        }
    }

    tx.execute("DELETE FROM mentions;", [])?;
    {
        let mut insert =
            tx.prepare("INSERT INTO mentions (source_id, target_id) VALUES (?1, ?2);")?;
        for mention in &workspace.mentions {
            insert.execute(params![mention.source.to_string(), mention.target.to_string()])?;
        }
    }

    tx.execute("DELETE FROM app_settings;", [])?;
    {
        let mut insert = tx.prepare("INSERT INTO app_settings (key, value) VALUES (?1, ?2);")?;
        for (key, value) in &workspace.settings {
            insert.execute(params![key, value])?;
        }
    }

    tx.execute(
        "INSERT OR REPLACE INTO commit_meta (id, root_id, version, digest, committed_at)
         VALUES (1, ?1, ?2, ?3, ?4);",
        params![
            workspace.root_id.to_string(),
            stamp.version as i64,
            stamp.checksum,
            stamp.committed_at,
        ],
    )?;

    Ok(touched)
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-journal");
    PathBuf::from(name)
}

/// Seeds the staging file from live and opens it for writing.
///
/// A live file that cannot be opened is not reused; the staging database is
/// then rebuilt from scratch, which the full-diff write makes equivalent.
fn open_staging(live: &Path, staging: &Path) -> StoreResult<Connection> {
    remove_if_exists(staging)?;
    remove_if_exists(&journal_path(staging))?;
    if live.exists() {
        std::fs::copy(live, staging).map_err(|err| StoreError::io(live, err))?;
        match open_db(staging) {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                warn!(
                    "event=store_save module=storage backend=relational status=warn stage=seed_staging error={}",
                    err
                );
                remove_if_exists(staging)?;
            }
        }
    }
    Ok(open_db(staging)?)
}

/// Indexed SQLite backend.
#[derive(Debug)]
pub struct RelationalBackend {
    layout: WorkspaceLayout,
    committer: AtomicCommitter,
    config: CoreConfig,
    stamp: Option<CommitStamp>,
    commits_this_session: u64,
}

impl RelationalBackend {
    /// Binds to the layout and picks up the stamp of a valid live artifact.
    pub fn open(layout: WorkspaceLayout, committer: AtomicCommitter, config: CoreConfig) -> Self {
        let stamp = match verify_relational(&layout.live_path(BackendKind::Relational)) {
            ArtifactCheck::Valid(stamp) => Some(stamp),
            _ => None,
        };
        Self {
            layout,
            committer,
            config,
            stamp,
            commits_this_session: 0,
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn committer(&self) -> &AtomicCommitter {
        &self.committer
    }

    fn live_path(&self) -> PathBuf {
        self.layout.live_path(BackendKind::Relational)
    }

    pub(crate) fn save_with_version(
        &mut self,
        workspace: &Workspace,
        version: u64,
    ) -> StoreResult<CommitAck> {
        workspace.validate()?;
        let started_at = Instant::now();
        let live = self.live_path();
        let staging = self.layout.staging_path(BackendKind::Relational);
        let stamp = CommitStamp {
            version,
            checksum: workspace.digest(),
            committed_at: now_epoch_ms(),
        };

        let mut touched = 0;
        let outcome = self.committer.commit(&live, &staging, |path| {
            let mut conn = open_staging(&live, path)?;
            let tx = conn.transaction()?;
            touched = write_workspace(&tx, workspace, &stamp)?;
            tx.commit()?;
            conn.close().map_err(|(_, err)| StoreError::from(err))?;
            Ok(())
        });
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    "event=store_save module=storage backend=relational status=error version={} error={}",
                    version, err
                );
                return Err(err);
            }
        };

        self.stamp = Some(stamp.clone());
        self.commits_this_session += 1;
        let snapshot = snapshot::after_commit(
            &self.layout,
            BackendKind::Relational,
            version,
            self.commits_this_session,
            &self.config,
        );
        info!(
            "event=store_save module=storage backend=relational status=ok version={} rows_touched={} duration_ms={}",
            version,
            touched,
            started_at.elapsed().as_millis()
        );
        Ok(CommitAck {
            stamp,
            swap: outcome.swap,
            attempts: outcome.attempts,
            snapshot,
        })
    }
}

impl WorkspaceStore for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn load(&self) -> StoreResult<Workspace> {
        let (workspace, _) = read_relational(&self.live_path())?;
        Ok(workspace)
    }

    fn save(&mut self, workspace: &Workspace) -> StoreResult<CommitAck> {
        let version = self.stamp.as_ref().map_or(1, |stamp| stamp.version + 1);
        self.save_with_version(workspace, version)
    }

    fn delete(&mut self, id: Uuid) -> StoreResult<CommitAck> {
        let mut workspace = self.load()?;
        remove_entity(&mut workspace, id)?;
        self.save(&workspace)
    }

    fn list(&self, scope: ListScope) -> StoreResult<SummaryCursor<'_>> {
        let live = self.live_path();
        if !live.exists() {
            return Err(StoreError::Missing(live));
        }
        Ok(SummaryCursor::new(
            Box::new(SqlSummaries { artifact: live }),
            scope,
            self.config.list_page_size,
        ))
    }

    fn stamp(&self) -> Option<&CommitStamp> {
        self.stamp.as_ref()
    }
}

/// Summary pages queried straight from the live database.
struct SqlSummaries {
    artifact: PathBuf,
}

const SUMMARY_ALL_SQL: &str = "
    SELECT 0, id, parent_id, title, vault_salt IS NOT NULL, 0, modified_at FROM folders
    UNION ALL
    SELECT 1, id, folder_id, title, sealed IS NOT NULL, pinned, modified_at FROM notes
    ORDER BY 1, 2
    LIMIT ?1 OFFSET ?2;";

const SUMMARY_CHILDREN_SQL: &str = "
    SELECT CASE WHEN f.id IS NOT NULL THEN 0 ELSE 1 END,
           tc.child_id,
           COALESCE(f.parent_id, n.folder_id),
           COALESCE(f.title, n.title),
           CASE WHEN f.id IS NOT NULL THEN f.vault_salt IS NOT NULL ELSE n.sealed IS NOT NULL END,
           COALESCE(n.pinned, 0),
           COALESCE(f.modified_at, n.modified_at)
    FROM tree_children tc
    LEFT JOIN folders f ON f.id = tc.child_id
    LEFT JOIN notes n ON n.id = tc.child_id
    WHERE tc.parent_id = ?3
    ORDER BY tc.position
    LIMIT ?1 OFFSET ?2;";

impl SummarySource for SqlSummaries {
    fn fetch_page(
        &self,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<EntitySummary>> {
        let artifact = self.artifact.as_path();
        let conn = open_db_read_only(artifact).map_err(|e| read_error(artifact, e))?;
        let err = |e: rusqlite::Error| read_error(artifact, e);

        let raw: Vec<(i64, String, Option<String>, Option<String>, bool, bool, i64)> = match scope {
            ListScope::All => {
                let mut stmt = conn.prepare(SUMMARY_ALL_SQL).map_err(err)?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], summary_row)
                    .map_err(err)?;
                let page = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(err)?;
                page
            }
            ListScope::Folder(folder_id) => {
                let id = folder_id.to_string();
                let exists: bool = conn
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM folders WHERE id = ?1);",
                        params![id],
                        |row| row.get(0),
                    )
                    .map_err(err)?;
                if !exists {
                    return Err(StoreError::NotFound(folder_id));
                }
                let mut stmt = conn.prepare(SUMMARY_CHILDREN_SQL).map_err(err)?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64, id], summary_row)
                    .map_err(err)?;
                let page = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(err)?;
                page
            }
        };

        raw.into_iter()
            .map(|(kind, id, parent, title, locked, pinned, modified_at)| {
                Ok(EntitySummary {
                    id: parse_id(artifact, &id)?,
                    kind: if kind == 0 {
                        EntityKind::Folder
                    } else {
                        EntityKind::Note
                    },
                    parent_id: parent.as_deref().map(|p| parse_id(artifact, p)).transpose()?,
                    title,
                    locked,
                    pinned,
                    modified_at,
                })
            })
            .collect()
    }
}

#[allow(clippy::type_complexity)]
fn summary_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(i64, String, Option<String>, Option<String>, bool, bool, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::{read_relational, verify_relational, RelationalBackend};
    use crate::config::CoreConfig;
    use crate::model::{EntityKind, Folder, Note, NoteContent, Workspace};
    use crate::storage::commit::AtomicCommitter;
    use crate::storage::layout::WorkspaceLayout;
    use crate::storage::{ArtifactCheck, BackendKind, ListScope, StoreError, WorkspaceStore};
    use uuid::Uuid;

    fn backend(dir: &std::path::Path) -> RelationalBackend {
        let layout = WorkspaceLayout::new(dir);
        layout.ensure_dirs().unwrap();
        let config = CoreConfig {
            list_page_size: 2,
            ..CoreConfig::default()
        };
        RelationalBackend::open(layout, AtomicCommitter::new(config.retry), config)
    }

    fn sample() -> (Workspace, Uuid) {
        let mut ws = Workspace::new();
        let folder = Folder::new(Some(ws.root_id), "Work");
        let folder_id = folder.id;
        ws.insert_folder(folder);
        let a = Note::new(folder_id, "Alpha", b"one".to_vec());
        let b = Note::new(folder_id, "Beta", b"two".to_vec());
        let (a_id, b_id) = (a.id, b.id);
        ws.insert_note(a);
        ws.insert_note(b);
        ws.set_mentions(a_id, [b_id]);
        ws.settings.insert("theme".to_string(), "dark".to_string());
        (ws, folder_id)
    }

    #[test]
    fn save_then_load_round_trips_rows_order_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = backend(dir.path());
        let (ws, _) = sample();

        let ack = store.save(&ws).unwrap();
        assert_eq!(ack.stamp.version, 1);
        assert_eq!(ack.stamp.checksum, ws.digest());
        assert_eq!(store.load().unwrap(), ws);
    }

    #[test]
    fn incremental_save_keeps_unchanged_rows_and_drops_removed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = backend(dir.path());
        let (mut ws, folder_id) = sample();
        store.save(&ws).unwrap();

        let first = ws.folder(folder_id).unwrap().children[0];
        ws.remove_note(first);
        let extra = Note::with_content(
            Uuid::new_v4(),
            folder_id,
            NoteContent::Plain {
                title: "Gamma".to_string(),
                body: Vec::new(),
            },
        );
        ws.insert_note(extra);
        let ack = store.save(&ws).unwrap();
        assert_eq!(ack.stamp.version, 2);
        assert_eq!(store.load().unwrap(), ws);
    }

    #[test]
    fn list_pages_children_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = backend(dir.path());
        let (ws, folder_id) = sample();
        store.save(&ws).unwrap();

        let ids: Vec<_> = store
            .list(ListScope::Folder(folder_id))
            .unwrap()
            .map(|s| s.unwrap().id)
            .collect();
        assert_eq!(ids, ws.folder(folder_id).unwrap().children);

        let mut all = store.list(ListScope::All).unwrap();
        let kinds: Vec<_> = all.by_ref().map(|s| s.unwrap().kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == EntityKind::Folder).count(), 2);
        assert_eq!(kinds.len(), 4);
        assert!(all.pages_fetched() >= 2);

        let missing = store.list(ListScope::Folder(Uuid::new_v4())).unwrap().next();
        assert!(matches!(missing, Some(Err(StoreError::NotFound(_)))));
    }

    #[test]
    fn tampered_row_fails_digest_verification() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = backend(dir.path());
        let (ws, _) = sample();
        store.save(&ws).unwrap();
        let live = dir.path().join(BackendKind::Relational.file_name());

        let conn = rusqlite::Connection::open(&live).unwrap();
        conn.execute("UPDATE app_settings SET value = 'light';", [])
            .unwrap();
        drop(conn);

        assert!(matches!(verify_relational(&live), ArtifactCheck::Corrupt(_)));
    }

    #[test]
    fn garbage_file_is_corrupt_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join(BackendKind::Relational.file_name());
        assert!(matches!(read_relational(&live), Err(StoreError::Missing(_))));
        std::fs::write(&live, b"definitely not sqlite").unwrap();
        assert!(matches!(verify_relational(&live), ArtifactCheck::Corrupt(_)));
    }
}
