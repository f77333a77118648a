//! Note/folder use-case facade.
//!
//! # Responsibility
//! - Own the in-memory workspace, the storage backend and the pending
//!   change log for one open workspace.
//! - Apply tree, note and vault use-cases while keeping every model
//!   invariant intact.
//! - Enforce vault gating on reads, search, autocomplete and mention
//!   resolution through the caller's `VaultSession`.
//!
//! # Invariants
//! - Only this facade calls the storage interface on the synchronous path.
//! - Notes under a vault are sealed before the next commit can observe them.
//! - A commit that seals plaintext is followed by a history scrub, so no
//!   backup, quarantine or retired copy keeps the plain form.
//! - A sealing use-case whose commit fails leaves memory as it was.
//! - Mentions are materialized only from plain source notes.
//! - Deleting an entity drops it from the change log and the mention index.

use crate::config::CoreConfig;
use crate::migration::MigrationReport;
use crate::model::{
    extract_mentions, now_epoch_ms, EntityKind, Folder, FolderId, KdfParams, ModelError, Note,
    NoteContent, NoteId, VaultParams, Workspace,
};
use crate::recovery::{open_workspace, OpenedWorkspace, RecoveryReport};
use crate::service::change_log::ChangeLog;
use crate::service::search::{self, read_content, MentionCandidate, SearchMatches};
use crate::storage::{
    BackendKind, CommitAck, EntitySummary, ListScope, Storage, StoreError, SummaryCursor,
    WorkspaceStore,
};
use crate::vault::crypto::decoy_derivation;
use crate::vault::{create_vault, open_vault, seal, unseal, VaultError, VaultKey, VaultSession};
use log::{info, warn};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use uuid::Uuid;

const UNTITLED: &str = "Untitled";

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Service error for workspace use-cases.
#[derive(Debug)]
pub enum ServiceError {
    /// Title is blank after trim.
    InvalidTitle,
    /// Vault password is empty.
    InvalidPassword,
    /// Mention reference is neither a note link nor a note id.
    InvalidReference(String),
    FolderNotFound(FolderId),
    NoteNotFound(NoteId),
    /// The workspace root cannot be moved or deleted.
    RootProtected,
    /// Move would make a folder its own ancestor.
    CycleDetected {
        folder_id: FolderId,
        parent_id: FolderId,
    },
    /// Folder move would carry content in or out of a vault.
    CrossesVaultBoundary { id: Uuid, target: FolderId },
    Vault(VaultError),
    Store(StoreError),
    Model(ModelError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTitle => write!(f, "title must not be blank"),
            Self::InvalidPassword => write!(f, "vault password must not be empty"),
            Self::InvalidReference(value) => write!(f, "not a note reference: `{value}`"),
            Self::FolderNotFound(id) => write!(f, "folder not found: {id}"),
            Self::NoteNotFound(id) => write!(f, "note not found: {id}"),
            Self::RootProtected => write!(f, "the workspace root cannot be moved or deleted"),
            Self::CycleDetected {
                folder_id,
                parent_id,
            } => write!(f, "moving {folder_id} under {parent_id} would create a cycle"),
            Self::CrossesVaultBoundary { id, target } => {
                write!(f, "moving {id} under {target} crosses a vault boundary")
            }
            Self::Vault(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Model(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Vault(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Model(err) => Some(err),
            _ => None,
        }
    }
}

impl From<VaultError> for ServiceError {
    fn from(value: VaultError) -> Self {
        Self::Vault(value)
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Model(err) => Self::Model(err),
            other => Self::Store(other),
        }
    }
}

impl From<ModelError> for ServiceError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

/// Decrypted, caller-facing view of one note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteView {
    pub id: NoteId,
    pub folder_id: FolderId,
    pub title: String,
    pub body: Vec<u8>,
    pub pinned: bool,
    pub modified_at: i64,
    /// Note lives in a vault (and was opened with a session key).
    pub in_vault: bool,
}

/// Outcome of following a mention link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionResolution {
    Resolved(NoteView),
    /// Target lies in a vault this session has not unlocked; the UI must
    /// prompt for the password of `folder_id`.
    UnlockRequired { folder_id: FolderId },
    /// Target carries its own lock this session has not opened.
    NoteUnlockRequired { note_id: NoteId },
}

/// Workspace facade over one storage backend.
pub struct NoteService {
    storage: Storage,
    workspace: Workspace,
    changes: ChangeLog,
    committed_generation: u64,
    /// Set when plaintext got sealed; cleared once history is scrubbed.
    scrub_pending: bool,
    recovery: RecoveryReport,
}

impl NoteService {
    /// Opens the workspace at `root`, running recovery first.
    pub fn open(root: impl AsRef<Path>, config: &CoreConfig) -> ServiceResult<Self> {
        Ok(Self::from_opened(open_workspace(root, config)?))
    }

    pub fn from_opened(opened: OpenedWorkspace) -> Self {
        Self {
            storage: opened.storage,
            workspace: opened.workspace,
            changes: ChangeLog::default(),
            committed_generation: 0,
            scrub_pending: false,
            recovery: opened.recovery,
        }
    }

    /// Splits the service into its backend and current workspace, e.g. to
    /// hand the backend to a background worker.
    pub fn into_parts(self) -> (Storage, Workspace) {
        (self.storage, self.workspace)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn backend(&self) -> BackendKind {
        self.storage.kind()
    }

    pub fn root_id(&self) -> FolderId {
        self.workspace.root_id
    }

    pub fn pending_changes(&self) -> &ChangeLog {
        &self.changes
    }

    /// Whether in-memory state differs from the last commit.
    pub fn is_dirty(&self) -> bool {
        self.changes.generation() != self.committed_generation
    }

    fn config(&self) -> &CoreConfig {
        self.storage.config()
    }

    fn folder(&self, id: FolderId) -> ServiceResult<&Folder> {
        self.workspace
            .folder(id)
            .ok_or(ServiceError::FolderNotFound(id))
    }

    fn note(&self, id: NoteId) -> ServiceResult<&Note> {
        self.workspace.note(id).ok_or(ServiceError::NoteNotFound(id))
    }

    /// Key that seals content placed in `folder_id`, if it lies in a vault.
    fn key_for<'s>(
        &self,
        session: &'s VaultSession,
        folder_id: FolderId,
    ) -> ServiceResult<Option<&'s VaultKey>> {
        match self.workspace.vault_of_folder(folder_id) {
            None => Ok(None),
            Some(vault_id) => session
                .key(vault_id)
                .map(Some)
                .ok_or(ServiceError::Vault(VaultError::Locked(vault_id))),
        }
    }

    /// Key that seals an existing note: its own lock or its folder's vault.
    fn key_for_note<'s>(
        &self,
        session: &'s VaultSession,
        note_id: NoteId,
    ) -> ServiceResult<Option<&'s VaultKey>> {
        match self.workspace.vault_of_note(note_id) {
            None => Ok(None),
            Some(vault_id) => session
                .key(vault_id)
                .map(Some)
                .ok_or(ServiceError::Vault(VaultError::Locked(vault_id))),
        }
    }

    fn require_unlocked(&self, session: &VaultSession, folder_id: FolderId) -> ServiceResult<()> {
        self.key_for(session, folder_id).map(|_| ())
    }

    /// First locked note in `notes`, if any.
    fn first_locked_note(&self, notes: &[NoteId]) -> Option<NoteId> {
        notes
            .iter()
            .copied()
            .find(|note_id| self.workspace.note(*note_id).is_some_and(Note::is_locked))
    }

    /// Argon2 costs for decoy derivations: those of a stored vault when one
    /// exists, so a failed unlock costs the same whatever the target.
    fn decoy_kdf(&self) -> KdfParams {
        self.workspace
            .folders
            .values()
            .filter_map(|folder| folder.vault.as_ref())
            .chain(self.workspace.notes.values().filter_map(|note| note.lock.as_ref()))
            .map(|params| params.kdf)
            .next()
            .unwrap_or(self.config().kdf)
    }

    fn refresh_mentions(&mut self, note_id: NoteId) {
        let targets = match self.workspace.note(note_id).map(|note| &note.content) {
            Some(NoteContent::Plain { body, .. }) => extract_mentions(body),
            _ => Default::default(),
        };
        self.workspace.set_mentions(note_id, targets);
    }

    fn unique_title(
        &self,
        session: &VaultSession,
        folder_id: FolderId,
        title: String,
        exclude: Option<NoteId>,
    ) -> String {
        let Some(folder) = self.workspace.folder(folder_id) else {
            return title;
        };
        let taken: HashSet<String> = folder
            .children
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| self.workspace.note(*id))
            .filter_map(|note| read_content(&self.workspace, session, note).ok())
            .map(|readable| readable.title.to_lowercase())
            .collect();
        if !taken.contains(&title.to_lowercase()) {
            return title;
        }
        (2..)
            .map(|n| format!("{title} ({n})"))
            .find(|candidate| !taken.contains(&candidate.to_lowercase()))
            .unwrap_or(title)
    }

    // ---- folders -------------------------------------------------------

    /// Creates a folder under `parent_id`.
    pub fn create_folder(&mut self, parent_id: FolderId, title: &str) -> ServiceResult<FolderId> {
        let title = normalize_title(title)?;
        self.folder(parent_id)?;
        let folder = Folder::new(Some(parent_id), title);
        let id = folder.id;
        self.workspace.insert_folder(folder);
        self.changes.record_upsert(id, EntityKind::Folder);
        self.changes.record_upsert(parent_id, EntityKind::Folder);
        info!("event=folder_create module=service status=ok folder_id={}", id);
        Ok(id)
    }

    pub fn rename_folder(&mut self, id: FolderId, title: &str) -> ServiceResult<()> {
        let title = normalize_title(title)?;
        let folder = self
            .workspace
            .folders
            .get_mut(&id)
            .ok_or(ServiceError::FolderNotFound(id))?;
        folder.title = title;
        folder.modified_at = now_epoch_ms();
        self.changes.record_upsert(id, EntityKind::Folder);
        Ok(())
    }

    /// Re-parents a folder; rejects cycles and vault-boundary crossings.
    pub fn move_folder(&mut self, id: FolderId, new_parent: FolderId) -> ServiceResult<()> {
        if id == self.workspace.root_id {
            return Err(ServiceError::RootProtected);
        }
        let folder = self.folder(id)?;
        let is_vault = folder.is_locked();
        let old_parent = folder.parent_id.ok_or(ServiceError::RootProtected)?;
        self.folder(new_parent)?;
        if self.workspace.is_ancestor(id, new_parent) {
            return Err(ServiceError::CycleDetected {
                folder_id: id,
                parent_id: new_parent,
            });
        }
        if old_parent == new_parent {
            return Ok(());
        }

        let target_vault = self.workspace.vault_of_folder(new_parent);
        let (subtree, subtree_notes) = self.workspace.subtree(id);
        let inner_vault = subtree
            .iter()
            .copied()
            .find(|folder_id| self.workspace.folder(*folder_id).is_some_and(Folder::is_locked))
            .or_else(|| self.first_locked_note(&subtree_notes));
        if let (Some(vault_id), Some(_)) = (inner_vault, target_vault) {
            return Err(VaultError::NestedVault(vault_id).into());
        }
        if !is_vault && self.workspace.vault_of_folder(old_parent) != target_vault {
            return Err(ServiceError::CrossesVaultBoundary {
                id,
                target: new_parent,
            });
        }

        self.workspace.detach_child(old_parent, id);
        if let Some(folder) = self.workspace.folders.get_mut(&id) {
            folder.parent_id = Some(new_parent);
            folder.modified_at = now_epoch_ms();
        }
        self.workspace.attach_child(new_parent, id);
        for changed in [id, old_parent, new_parent] {
            self.changes.record_upsert(changed, EntityKind::Folder);
        }
        Ok(())
    }

    /// Deletes a folder with its subtree. Vaults involved must be unlocked.
    pub fn delete_folder(&mut self, session: &VaultSession, id: FolderId) -> ServiceResult<()> {
        if id == self.workspace.root_id {
            return Err(ServiceError::RootProtected);
        }
        let parent = self.folder(id)?.parent_id;
        self.require_unlocked(session, id)?;
        let (folders, notes) = self.workspace.subtree(id);
        for folder_id in &folders {
            if self.workspace.folder(*folder_id).is_some_and(Folder::is_locked)
                && !session.is_unlocked(*folder_id)
            {
                return Err(VaultError::Locked(*folder_id).into());
            }
        }
        for note_id in &notes {
            if self.workspace.note(*note_id).is_some_and(Note::is_locked)
                && !session.is_unlocked(*note_id)
            {
                return Err(VaultError::Locked(*note_id).into());
            }
        }

        let (folders, notes) = self.workspace.remove_folder_subtree(id);
        for note_id in &notes {
            self.changes.record_delete(*note_id, EntityKind::Note);
        }
        for folder_id in &folders {
            self.changes.record_delete(*folder_id, EntityKind::Folder);
        }
        if let Some(parent) = parent {
            self.changes.record_upsert(parent, EntityKind::Folder);
        }
        info!(
            "event=folder_delete module=service status=ok folder_id={} folders={} notes={}",
            id,
            folders.len(),
            notes.len()
        );
        Ok(())
    }

    /// Direct children of a folder; sealed titles appear only when unlocked.
    pub fn children(
        &self,
        session: &VaultSession,
        folder_id: FolderId,
    ) -> ServiceResult<Vec<EntitySummary>> {
        let folder = self.folder(folder_id)?;
        Ok(folder
            .children
            .iter()
            .filter_map(|id| {
                if let Some(child) = self.workspace.folder(*id) {
                    return Some(EntitySummary::of_folder(child));
                }
                let note = self.workspace.note(*id)?;
                let mut summary = EntitySummary::of_note(note);
                if summary.title.is_none() {
                    summary.title = read_content(&self.workspace, session, note)
                        .ok()
                        .map(|readable| readable.title.into_owned());
                }
                Some(summary)
            })
            .collect())
    }

    /// Lazy listing of the last committed state.
    pub fn list(&self, scope: ListScope) -> ServiceResult<SummaryCursor<'_>> {
        Ok(self.storage.list(scope)?)
    }

    // ---- notes ---------------------------------------------------------

    /// Creates a note; inside a vault it is sealed immediately.
    pub fn create_note(
        &mut self,
        session: &VaultSession,
        folder_id: FolderId,
        title: &str,
        body: Vec<u8>,
    ) -> ServiceResult<NoteId> {
        let title = match title.trim() {
            "" => UNTITLED.to_string(),
            trimmed => trimmed.to_string(),
        };
        self.folder(folder_id)?;
        let key = self.key_for(session, folder_id)?;
        let title = self.unique_title(session, folder_id, title, None);
        let id = Uuid::new_v4();
        let content = make_content(key, id, title, body)?;
        let sealed = content.is_sealed();
        self.workspace
            .insert_note(Note::with_content(id, folder_id, content));
        self.refresh_mentions(id);
        self.changes.record_upsert(id, EntityKind::Note);
        self.changes.record_upsert(folder_id, EntityKind::Folder);
        info!(
            "event=note_create module=service status=ok note_id={} sealed={}",
            id, sealed
        );
        Ok(id)
    }

    /// Replaces the editor payload of a note.
    pub fn update_note_body(
        &mut self,
        session: &VaultSession,
        id: NoteId,
        body: Vec<u8>,
    ) -> ServiceResult<()> {
        let note = self.note(id)?;
        let key = self.key_for_note(session, id)?;
        let title = read_content(&self.workspace, session, note)?
            .title
            .into_owned();
        let content = make_content(key, id, title, body)?;
        self.replace_content(id, content);
        Ok(())
    }

    /// Renames a note; duplicate titles in the folder get a ` (n)` suffix.
    pub fn rename_note(
        &mut self,
        session: &VaultSession,
        id: NoteId,
        title: &str,
    ) -> ServiceResult<String> {
        let title = normalize_title(title)?;
        let note = self.note(id)?;
        let folder_id = note.folder_id;
        let key = self.key_for_note(session, id)?;
        let body = read_content(&self.workspace, session, note)?
            .body
            .into_owned();
        let title = self.unique_title(session, folder_id, title, Some(id));
        let content = make_content(key, id, title.clone(), body)?;
        self.replace_content(id, content);
        Ok(title)
    }

    fn replace_content(&mut self, id: NoteId, content: NoteContent) {
        if let Some(note) = self.workspace.notes.get_mut(&id) {
            note.set_content(content);
        }
        self.refresh_mentions(id);
        self.changes.record_upsert(id, EntityKind::Note);
    }

    /// Moves a note; crossing a vault boundary re-seals or unseals it and
    /// needs every involved vault unlocked. A locked note keeps its own seal
    /// and cannot enter a vault folder.
    pub fn move_note(
        &mut self,
        session: &VaultSession,
        id: NoteId,
        target: FolderId,
    ) -> ServiceResult<()> {
        let note = self.note(id)?;
        let source = note.folder_id;
        self.folder(target)?;
        if source == target {
            return Ok(());
        }

        let source_vault = self.workspace.vault_of_folder(source);
        let target_vault = self.workspace.vault_of_folder(target);
        if note.is_locked() && target_vault.is_some() {
            return Err(VaultError::NestedVault(id).into());
        }
        let new_content = if !note.is_locked() && source_vault != target_vault {
            let readable = read_content(&self.workspace, session, note)?;
            let (title, body) = (readable.title.into_owned(), readable.body.into_owned());
            let key = self.key_for(session, target)?;
            Some(make_content(key, id, title, body)?)
        } else {
            None
        };

        if source_vault.is_none() && target_vault.is_some() {
            self.scrub_pending = true;
        }
        self.workspace.detach_child(source, id);
        if let Some(note) = self.workspace.notes.get_mut(&id) {
            note.folder_id = target;
            match new_content {
                Some(content) => note.set_content(content),
                None => note.modified_at = now_epoch_ms(),
            }
        }
        self.workspace.attach_child(target, id);
        self.refresh_mentions(id);
        self.changes.record_upsert(id, EntityKind::Note);
        self.changes.record_upsert(source, EntityKind::Folder);
        self.changes.record_upsert(target, EntityKind::Folder);
        Ok(())
    }

    /// Deletes a note and every mention pointing to or from it.
    pub fn delete_note(&mut self, session: &VaultSession, id: NoteId) -> ServiceResult<()> {
        let folder_id = self.note(id)?.folder_id;
        self.key_for_note(session, id)?;
        self.workspace.remove_note(id);
        self.changes.record_delete(id, EntityKind::Note);
        self.changes.record_upsert(folder_id, EntityKind::Folder);
        info!("event=note_delete module=service status=ok note_id={}", id);
        Ok(())
    }

    /// Flips the pin flag; returns the new value.
    pub fn toggle_pin(&mut self, id: NoteId) -> ServiceResult<bool> {
        let note = self
            .workspace
            .notes
            .get_mut(&id)
            .ok_or(ServiceError::NoteNotFound(id))?;
        note.pinned = !note.pinned;
        note.modified_at = now_epoch_ms();
        let pinned = note.pinned;
        self.changes.record_upsert(id, EntityKind::Note);
        Ok(pinned)
    }

    /// Opens a note; fails with `VaultError::Locked` for locked vault notes.
    pub fn read_note(&self, session: &VaultSession, id: NoteId) -> ServiceResult<NoteView> {
        let note = self.note(id)?;
        let readable = read_content(&self.workspace, session, note)?;
        Ok(NoteView {
            id,
            folder_id: note.folder_id,
            title: readable.title.into_owned(),
            body: readable.body.into_owned(),
            pinned: note.pinned,
            modified_at: note.modified_at,
            in_vault: note.content.is_sealed(),
        })
    }

    // ---- queries -------------------------------------------------------

    /// Lazy word-AND search over readable notes.
    pub fn search<'a>(&'a self, session: &'a VaultSession, query: &str) -> SearchMatches<'a> {
        SearchMatches::new(&self.workspace, session, query)
    }

    /// Mention suggestions whose title contains `fragment`.
    pub fn autocomplete(
        &self,
        session: &VaultSession,
        fragment: &str,
        limit: usize,
    ) -> Vec<MentionCandidate> {
        search::autocomplete(&self.workspace, session, fragment, limit)
    }

    /// Follows a mention link (or bare note id).
    pub fn resolve_mention(
        &self,
        session: &VaultSession,
        reference: &str,
    ) -> ServiceResult<MentionResolution> {
        let id = parse_reference(reference)?;
        self.note(id)?;
        if let Some(vault_id) = self.workspace.vault_of_note(id) {
            if !session.is_unlocked(vault_id) {
                info!(
                    "event=mention_resolve module=service status=unlock_required vault_id={}",
                    vault_id
                );
                return Ok(if vault_id == id {
                    MentionResolution::NoteUnlockRequired { note_id: id }
                } else {
                    MentionResolution::UnlockRequired {
                        folder_id: vault_id,
                    }
                });
            }
        }
        Ok(MentionResolution::Resolved(self.read_note(session, id)?))
    }

    /// Notes whose bodies link to `id`.
    pub fn backlinks(&self, id: NoteId) -> ServiceResult<Vec<MentionCandidate>> {
        self.note(id)?;
        Ok(self
            .workspace
            .mentions
            .iter()
            .filter(|mention| mention.target == id)
            .filter_map(|mention| {
                let source = self.workspace.note(mention.source)?;
                Some(MentionCandidate {
                    id: source.id,
                    title: source.title()?.to_string(),
                    link: crate::model::mention_link(source.id),
                })
            })
            .collect())
    }

    // ---- vaults --------------------------------------------------------

    /// Turns a folder into a vault, seals its subtree and commits at once.
    ///
    /// The vault is left locked; callers unlock it explicitly.
    pub fn lock_folder(&mut self, id: FolderId, password: &str) -> ServiceResult<()> {
        if password.is_empty() {
            return Err(ServiceError::InvalidPassword);
        }
        let folder = self.folder(id)?;
        if folder.is_locked() {
            return Err(VaultError::AlreadyVault(id).into());
        }
        if let Some(parent) = folder.parent_id {
            if self.workspace.vault_of_folder(parent).is_some() {
                return Err(VaultError::NestedVault(id).into());
            }
        }
        let (folders, notes) = self.workspace.subtree(id);
        if let Some(inner) = folders
            .iter()
            .find(|folder_id| self.workspace.folder(**folder_id).is_some_and(Folder::is_locked))
        {
            return Err(VaultError::NestedVault(*inner).into());
        }
        if let Some(locked) = self.first_locked_note(&notes) {
            return Err(VaultError::NestedVault(locked).into());
        }

        let (params, key) = create_vault(password, self.config().kdf)?;
        let mut sealed = Vec::with_capacity(notes.len());
        for note_id in &notes {
            let Some(note) = self.workspace.note(*note_id) else {
                continue;
            };
            if let NoteContent::Plain { title, body } = &note.content {
                let blob = seal(&key, *note_id, title, body)?;
                sealed.push((*note_id, NoteContent::Sealed { blob }));
            }
        }
        drop(key);

        let before = (self.workspace.clone(), self.changes.clone());
        for (note_id, content) in sealed {
            if let Some(note) = self.workspace.notes.get_mut(&note_id) {
                note.set_content(content);
            }
            self.workspace.mentions.retain(|m| m.source != note_id);
            self.changes.record_upsert(note_id, EntityKind::Note);
        }
        if let Some(folder) = self.workspace.folders.get_mut(&id) {
            folder.vault = Some(params);
            folder.modified_at = now_epoch_ms();
        }
        self.changes.record_upsert(id, EntityKind::Folder);
        info!(
            "event=vault_lock module=vault status=ok folder_id={} notes={}",
            id,
            notes.len()
        );
        self.commit_sealing(before)
    }

    /// Verifies `password` and holds the vault key in `session`.
    ///
    /// Unknown folders, non-vault folders and wrong passwords fail alike.
    pub fn unlock_folder(
        &self,
        session: &mut VaultSession,
        id: FolderId,
        password: &str,
    ) -> ServiceResult<()> {
        let params = self.workspace.folder(id).and_then(|f| f.vault.as_ref());
        self.unlock_vault(session, id, params, password)
    }

    fn unlock_vault(
        &self,
        session: &mut VaultSession,
        vault_id: Uuid,
        params: Option<&VaultParams>,
        password: &str,
    ) -> ServiceResult<()> {
        let Some(params) = params else {
            decoy_derivation(password, &self.decoy_kdf());
            warn!("event=vault_unlock module=vault status=error error_code=auth_failed");
            return Err(VaultError::AuthFailed.into());
        };
        match open_vault(password, params) {
            Ok(key) => {
                session.insert(vault_id, key);
                info!("event=vault_unlock module=vault status=ok vault_id={}", vault_id);
                Ok(())
            }
            Err(err) => {
                warn!("event=vault_unlock module=vault status=error error_code=auth_failed");
                Err(err.into())
            }
        }
    }

    /// Drops the session key of a vault. Returns whether it was unlocked.
    pub fn relock_folder(&self, session: &mut VaultSession, id: FolderId) -> bool {
        session.relock(id)
    }

    /// Permanently unseals a vault back into a plain folder and commits.
    pub fn remove_vault(
        &mut self,
        session: &mut VaultSession,
        id: FolderId,
        password: &str,
    ) -> ServiceResult<()> {
        let folder = self.folder(id)?;
        let params = folder.vault.as_ref().ok_or(VaultError::NotVault(id))?;
        let key = open_vault(password, params)?;

        let (_, notes) = self.workspace.subtree(id);
        let mut opened = Vec::with_capacity(notes.len());
        for note_id in &notes {
            let Some(note) = self.workspace.note(*note_id) else {
                continue;
            };
            if let NoteContent::Sealed { blob } = &note.content {
                let (title, body) = unseal(&key, *note_id, blob)?;
                opened.push((*note_id, NoteContent::Plain { title, body }));
            }
        }
        drop(key);

        for (note_id, content) in opened {
            if let Some(note) = self.workspace.notes.get_mut(&note_id) {
                note.set_content(content);
            }
            self.refresh_mentions(note_id);
            self.changes.record_upsert(note_id, EntityKind::Note);
        }
        if let Some(folder) = self.workspace.folders.get_mut(&id) {
            folder.vault = None;
            folder.modified_at = now_epoch_ms();
        }
        session.relock(id);
        self.changes.record_upsert(id, EntityKind::Folder);
        info!(
            "event=vault_remove module=vault status=ok folder_id={} notes={}",
            id,
            notes.len()
        );
        self.flush()?;
        Ok(())
    }

    /// Seals one note under its own password and commits at once.
    ///
    /// Notes inside a vault folder are already gated and are rejected.
    pub fn lock_note(&mut self, id: NoteId, password: &str) -> ServiceResult<()> {
        if password.is_empty() {
            return Err(ServiceError::InvalidPassword);
        }
        let note = self.note(id)?;
        if note.is_locked() {
            return Err(VaultError::AlreadyVault(id).into());
        }
        if self.workspace.vault_of_folder(note.folder_id).is_some() {
            return Err(VaultError::NestedVault(id).into());
        }
        let NoteContent::Plain { title, body } = &note.content else {
            return Err(VaultError::InvalidParams("sealed note outside a vault".to_string()).into());
        };
        let (params, key) = create_vault(password, self.config().kdf)?;
        let blob = seal(&key, id, title, body)?;
        drop(key);

        let before = (self.workspace.clone(), self.changes.clone());
        if let Some(note) = self.workspace.notes.get_mut(&id) {
            note.set_content(NoteContent::Sealed { blob });
            note.lock = Some(params);
        }
        self.workspace.mentions.retain(|m| m.source != id);
        self.changes.record_upsert(id, EntityKind::Note);
        info!("event=note_lock module=vault status=ok note_id={}", id);
        self.commit_sealing(before)
    }

    /// Verifies the note's own password and holds its key in `session`.
    ///
    /// Unknown notes, unlocked notes and wrong passwords fail alike.
    pub fn unlock_note(
        &self,
        session: &mut VaultSession,
        id: NoteId,
        password: &str,
    ) -> ServiceResult<()> {
        let params = self.workspace.note(id).and_then(|note| note.lock.as_ref());
        self.unlock_vault(session, id, params, password)
    }

    /// Drops the session key of a locked note. Returns whether it was open.
    pub fn relock_note(&self, session: &mut VaultSession, id: NoteId) -> bool {
        session.relock(id)
    }

    /// Permanently removes a note's own lock and commits the plain note.
    pub fn remove_note_lock(
        &mut self,
        session: &mut VaultSession,
        id: NoteId,
        password: &str,
    ) -> ServiceResult<()> {
        let note = self.note(id)?;
        let params = note.lock.as_ref().ok_or(VaultError::NotVault(id))?;
        let key = open_vault(password, params)?;
        let NoteContent::Sealed { blob } = &note.content else {
            return Err(VaultError::InvalidParams("locked note is not sealed".to_string()).into());
        };
        let (title, body) = unseal(&key, id, blob)?;
        drop(key);

        if let Some(note) = self.workspace.notes.get_mut(&id) {
            note.set_content(NoteContent::Plain { title, body });
            note.lock = None;
        }
        session.relock(id);
        self.refresh_mentions(id);
        self.changes.record_upsert(id, EntityKind::Note);
        info!("event=note_lock_remove module=vault status=ok note_id={}", id);
        self.flush()?;
        Ok(())
    }

    // ---- settings & persistence ------------------------------------------

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.workspace.settings.get(key).map(String::as_str)
    }

    pub fn set_setting(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.workspace.settings.insert(key.into(), value.into());
        self.changes.touch();
    }

    /// Commits pending changes, then scrubs history if plaintext got
    /// sealed. Returns `None` when there was nothing to commit.
    pub fn flush(&mut self) -> ServiceResult<Option<CommitAck>> {
        let ack = self.commit_pending()?;
        if self.scrub_pending {
            self.storage.scrub_history()?;
            self.scrub_pending = false;
        }
        Ok(ack)
    }

    fn commit_pending(&mut self) -> ServiceResult<Option<CommitAck>> {
        if !self.is_dirty() && self.storage.stamp().is_some() {
            return Ok(None);
        }
        let generation = self.changes.generation();
        let ack = self.storage.save(&self.workspace)?;
        self.changes.clear();
        self.committed_generation = generation;
        Ok(Some(ack))
    }

    /// Commits a change that sealed plaintext. On a failed commit memory
    /// returns to `before`; on success older copies are scrubbed.
    fn commit_sealing(&mut self, before: (Workspace, ChangeLog)) -> ServiceResult<()> {
        let scrub_was_pending = self.scrub_pending;
        self.scrub_pending = true;
        if let Err(err) = self.commit_pending() {
            let (workspace, changes) = before;
            self.workspace = workspace;
            self.changes = changes;
            self.scrub_pending = scrub_was_pending;
            warn!(
                "event=seal_rollback module=service status=error error={}",
                err
            );
            return Err(err);
        }
        self.flush()?;
        Ok(())
    }

    /// Commits pending changes, then migrates to `target`.
    pub fn migrate_to(&mut self, target: BackendKind) -> ServiceResult<MigrationReport> {
        self.flush()?;
        Ok(self.storage.migrate_to(target)?)
    }
}

fn normalize_title(value: &str) -> ServiceResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidTitle);
    }
    Ok(trimmed.to_string())
}

fn make_content(
    key: Option<&VaultKey>,
    id: NoteId,
    title: String,
    body: Vec<u8>,
) -> ServiceResult<NoteContent> {
    Ok(match key {
        Some(key) => NoteContent::Sealed {
            blob: seal(key, id, &title, &body)?,
        },
        None => NoteContent::Plain { title, body },
    })
}

fn parse_reference(reference: &str) -> ServiceResult<NoteId> {
    if let Some(id) = extract_mentions(reference.as_bytes()).into_iter().next() {
        return Ok(id);
    }
    Uuid::parse_str(reference.trim())
        .map_err(|_| ServiceError::InvalidReference(reference.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{MentionResolution, NoteService, ServiceError};
    use crate::config::CoreConfig;
    use crate::model::{mention_link, KdfParams};
    use crate::vault::{VaultError, VaultSession};

    fn config() -> CoreConfig {
        CoreConfig {
            kdf: KdfParams {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            ..CoreConfig::default()
        }
    }

    #[test]
    fn move_folder_rejects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let root = service.root_id();
        let a = service.create_folder(root, "A").unwrap();
        let b = service.create_folder(a, "B").unwrap();

        assert!(matches!(
            service.move_folder(a, b),
            Err(ServiceError::CycleDetected { .. })
        ));
        assert!(matches!(
            service.move_folder(a, a),
            Err(ServiceError::CycleDetected { .. })
        ));
        service.move_folder(b, root).unwrap();
        service.workspace().validate().unwrap();
    }

    #[test]
    fn duplicate_titles_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let session = VaultSession::new();
        let root = service.root_id();
        let first = service.create_note(&session, root, "Plan", Vec::new()).unwrap();
        let second = service.create_note(&session, root, "plan", Vec::new()).unwrap();
        assert_eq!(service.read_note(&session, first).unwrap().title, "Plan");
        assert_eq!(service.read_note(&session, second).unwrap().title, "plan (2)");
        assert_eq!(
            service.rename_note(&session, second, "Plan").unwrap(),
            "Plan (2)"
        );
    }

    #[test]
    fn mentions_follow_body_edits_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let session = VaultSession::new();
        let root = service.root_id();
        let target = service.create_note(&session, root, "Target", Vec::new()).unwrap();
        let body = format!("see {}", mention_link(target)).into_bytes();
        let source = service.create_note(&session, root, "Source", body).unwrap();

        let links = service.backlinks(target).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].id, source);

        service.delete_note(&session, target).unwrap();
        assert!(service.workspace().mentions.is_empty());
        service.workspace().validate().unwrap();
    }

    #[test]
    fn folder_cannot_move_into_a_vault() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let root = service.root_id();
        let vault = service.create_folder(root, "Vault").unwrap();
        let loose = service.create_folder(root, "Loose").unwrap();
        service.lock_folder(vault, "pw").unwrap();

        assert!(matches!(
            service.move_folder(loose, vault),
            Err(ServiceError::CrossesVaultBoundary { .. })
        ));
        let inner = service.create_folder(root, "Inner").unwrap();
        service.lock_folder(inner, "pw2").unwrap();
        assert!(matches!(
            service.move_folder(inner, vault),
            Err(ServiceError::Vault(VaultError::NestedVault(_)))
        ));
    }

    #[test]
    fn moving_a_note_into_a_vault_seals_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let mut session = VaultSession::new();
        let root = service.root_id();
        let vault = service.create_folder(root, "Vault").unwrap();
        service.lock_folder(vault, "pw").unwrap();
        let note = service
            .create_note(&session, root, "Diary", b"secret".to_vec())
            .unwrap();

        assert!(matches!(
            service.move_note(&session, note, vault),
            Err(ServiceError::Vault(VaultError::Locked(_)))
        ));
        service.unlock_folder(&mut session, vault, "pw").unwrap();
        service.move_note(&session, note, vault).unwrap();
        assert!(service.workspace().note(note).unwrap().content.is_sealed());

        service.relock_folder(&mut session, vault);
        assert_eq!(
            service
                .resolve_mention(&session, &mention_link(note))
                .unwrap(),
            MentionResolution::UnlockRequired { folder_id: vault }
        );
    }

    #[test]
    fn decoy_derivation_uses_stored_vault_costs() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        assert_eq!(service.decoy_kdf(), config().kdf);
        let vault = service.create_folder(service.root_id(), "Vault").unwrap();
        service.lock_folder(vault, "pw").unwrap();
        drop(service);

        let heavier = CoreConfig {
            kdf: KdfParams {
                memory_kib: 128,
                iterations: 1,
                parallelism: 1,
            },
            ..CoreConfig::default()
        };
        let service = NoteService::open(dir.path(), &heavier).unwrap();
        assert_eq!(service.decoy_kdf(), config().kdf);
    }

    #[test]
    fn locked_note_is_gated_by_its_own_password() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let mut session = VaultSession::new();
        let root = service.root_id();
        let target = service.create_note(&session, root, "Target", Vec::new()).unwrap();
        let body = format!("pin is 4711, see {}", mention_link(target)).into_bytes();
        let note = service.create_note(&session, root, "Pin", body).unwrap();
        assert_eq!(service.backlinks(target).unwrap().len(), 1);

        service.lock_note(note, "pw").unwrap();
        assert!(matches!(
            service.lock_note(note, "pw"),
            Err(ServiceError::Vault(VaultError::AlreadyVault(_)))
        ));
        assert!(service.workspace().note(note).unwrap().content.is_sealed());
        assert!(service.backlinks(target).unwrap().is_empty());
        assert!(!service.is_dirty());
        assert!(matches!(
            service.read_note(&session, note),
            Err(ServiceError::Vault(VaultError::Locked(id))) if id == note
        ));
        assert_eq!(
            service.resolve_mention(&session, &mention_link(note)).unwrap(),
            MentionResolution::NoteUnlockRequired { note_id: note }
        );
        assert_eq!(service.search(&session, "4711").count(), 0);

        assert!(matches!(
            service.unlock_note(&mut session, note, "wrong"),
            Err(ServiceError::Vault(VaultError::AuthFailed))
        ));
        assert!(matches!(
            service.unlock_note(&mut session, target, "pw"),
            Err(ServiceError::Vault(VaultError::AuthFailed))
        ));
        service.unlock_note(&mut session, note, "pw").unwrap();
        service
            .update_note_body(&session, note, b"pin is 1234".to_vec())
            .unwrap();
        assert_eq!(service.read_note(&session, note).unwrap().body, b"pin is 1234");
        assert!(service.workspace().note(note).unwrap().content.is_sealed());
        assert!(service.relock_note(&mut session, note));
        assert!(service.read_note(&session, note).is_err());

        service.remove_note_lock(&mut session, note, "pw").unwrap();
        assert!(!service.workspace().note(note).unwrap().is_locked());
        assert_eq!(service.read_note(&session, note).unwrap().body, b"pin is 1234");
        service.workspace().validate().unwrap();
    }

    #[test]
    fn locked_notes_and_vault_folders_do_not_nest() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = NoteService::open(dir.path(), &config()).unwrap();
        let mut session = VaultSession::new();
        let root = service.root_id();
        let vault = service.create_folder(root, "Vault").unwrap();
        let loose = service.create_folder(root, "Loose").unwrap();
        let note = service
            .create_note(&session, loose, "Pin", b"4711".to_vec())
            .unwrap();
        service.lock_note(note, "pw").unwrap();

        assert!(matches!(
            service.lock_folder(loose, "pw"),
            Err(ServiceError::Vault(VaultError::NestedVault(id))) if id == note
        ));
        service.lock_folder(vault, "pw").unwrap();
        service.unlock_folder(&mut session, vault, "pw").unwrap();
        assert!(matches!(
            service.move_note(&session, note, vault),
            Err(ServiceError::Vault(VaultError::NestedVault(id))) if id == note
        ));
        assert!(matches!(
            service.move_folder(loose, vault),
            Err(ServiceError::Vault(VaultError::NestedVault(id))) if id == note
        ));
        let inside = service
            .create_note(&session, vault, "Inside", Vec::new())
            .unwrap();
        assert!(matches!(
            service.lock_note(inside, "pw"),
            Err(ServiceError::Vault(VaultError::NestedVault(_)))
        ));

        service.move_note(&session, note, root).unwrap();
        assert!(service.workspace().note(note).unwrap().is_locked());
        service.workspace().validate().unwrap();
    }
}
