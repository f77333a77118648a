//! Workspace aggregate: the unit every backend loads and commits.
//!
//! # Responsibility
//! - Hold folders, notes, materialized mentions and settings.
//! - Validate tree/vault invariants before any commit and after any load.
//! - Provide structural edits that keep child lists consistent.
//!
//! # Invariants
//! - Exactly one root folder; every other folder and every note is listed in
//!   exactly one parent's `children`.
//! - No folder is its own ancestor.
//! - Notes under a vault are sealed; notes outside every vault are plain.
//! - Vaults never nest.

use crate::model::folder::{Folder, FolderId};
use crate::model::mention::Mention;
use crate::model::note::{Note, NoteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const ROOT_TITLE: &str = "Workspace";

/// Kind of a tree entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Folder,
    Note,
}

/// Structural invariant violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Root id does not resolve to a parentless folder.
    RootMissing(FolderId),
    /// More than one parentless folder.
    MultipleRoots(FolderId),
    /// Folder or note references a parent that does not exist.
    MissingParent { child: Uuid, parent: FolderId },
    /// Entity is not listed (or listed twice) in its parent's children.
    ChildListMismatch { parent: FolderId, child: Uuid },
    /// Folder is its own ancestor.
    Cycle(FolderId),
    /// Same id used by a folder and a note.
    DuplicateId(Uuid),
    /// Note content checksum does not match its bytes.
    ChecksumMismatch(NoteId),
    /// Note sealing state disagrees with its vault membership.
    SealingMismatch(NoteId),
    /// Vault (folder or locked note) declared inside another vault.
    NestedVault(Uuid),
    /// Mention references a missing or sealed note.
    DanglingMention(Mention),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RootMissing(id) => write!(f, "root folder missing: {id}"),
            Self::MultipleRoots(id) => write!(f, "second parentless folder: {id}"),
            Self::MissingParent { child, parent } => {
                write!(f, "entity {child} references missing folder {parent}")
            }
            Self::ChildListMismatch { parent, child } => {
                write!(f, "folder {parent} child list disagrees for {child}")
            }
            Self::Cycle(id) => write!(f, "folder {id} is its own ancestor"),
            Self::DuplicateId(id) => write!(f, "id used by folder and note: {id}"),
            Self::ChecksumMismatch(id) => write!(f, "note checksum mismatch: {id}"),
            Self::SealingMismatch(id) => write!(f, "note sealing disagrees with vault: {id}"),
            Self::NestedVault(id) => write!(f, "vault nested inside another vault: {id}"),
            Self::DanglingMention(m) => {
                write!(f, "mention {} -> {} is dangling", m.source, m.target)
            }
        }
    }
}

impl Error for ModelError {}

/// Full set of notes and folders managed as one persistence unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub root_id: FolderId,
    pub folders: BTreeMap<FolderId, Folder>,
    pub notes: BTreeMap<NoteId, Note>,
    #[serde(default)]
    pub mentions: BTreeSet<Mention>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    /// Creates an empty workspace with a fresh root folder.
    pub fn new() -> Self {
        let root = Folder::new(None, ROOT_TITLE);
        let root_id = root.id;
        let mut folders = BTreeMap::new();
        folders.insert(root_id, root);
        Self {
            root_id,
            folders,
            notes: BTreeMap::new(),
            mentions: BTreeSet::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn folder(&self, id: FolderId) -> Option<&Folder> {
        self.folders.get(&id)
    }

    pub fn note(&self, id: NoteId) -> Option<&Note> {
        self.notes.get(&id)
    }

    /// Kind of the entity with `id`, if present.
    pub fn kind_of(&self, id: Uuid) -> Option<EntityKind> {
        if self.folders.contains_key(&id) {
            Some(EntityKind::Folder)
        } else if self.notes.contains_key(&id) {
            Some(EntityKind::Note)
        } else {
            None
        }
    }

    /// Nearest folder (inclusive) on the path to root that is a vault.
    pub fn vault_of_folder(&self, folder_id: FolderId) -> Option<FolderId> {
        let mut current = Some(folder_id);
        let mut steps = 0usize;
        while let Some(id) = current {
            let folder = self.folders.get(&id)?;
            if folder.is_locked() {
                return Some(id);
            }
            current = folder.parent_id;
            steps += 1;
            if steps > self.folders.len() {
                return None;
            }
        }
        None
    }

    /// Vault that gates the note, if any: the note itself when it carries
    /// its own lock, else the nearest vault folder above it.
    pub fn vault_of_note(&self, note_id: NoteId) -> Option<Uuid> {
        let note = self.notes.get(&note_id)?;
        if note.is_locked() {
            return Some(note_id);
        }
        self.vault_of_folder(note.folder_id)
    }

    /// Whether `ancestor` is `folder_id` or lies on its path to root.
    pub fn is_ancestor(&self, ancestor: FolderId, folder_id: FolderId) -> bool {
        let mut current = Some(folder_id);
        let mut steps = 0usize;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.folders.get(&id).and_then(|f| f.parent_id);
            steps += 1;
            if steps > self.folders.len() {
                return false;
            }
        }
        false
    }

    /// Folder ids (inclusive) and note ids of the subtree rooted at `folder_id`.
    pub fn subtree(&self, folder_id: FolderId) -> (Vec<FolderId>, Vec<NoteId>) {
        let mut folders = Vec::new();
        let mut notes = Vec::new();
        let mut stack = vec![folder_id];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(folder) = self.folders.get(&id) else {
                continue;
            };
            folders.push(id);
            for child in &folder.children {
                match self.kind_of(*child) {
                    Some(EntityKind::Folder) => stack.push(*child),
                    Some(EntityKind::Note) => notes.push(*child),
                    None => {}
                }
            }
        }
        (folders, notes)
    }

    /// Appends `child` to the children of `parent`.
    pub fn attach_child(&mut self, parent: FolderId, child: Uuid) {
        if let Some(folder) = self.folders.get_mut(&parent) {
            if !folder.children.contains(&child) {
                folder.children.push(child);
            }
        }
    }

    /// Removes `child` from the children of `parent`.
    pub fn detach_child(&mut self, parent: FolderId, child: Uuid) {
        if let Some(folder) = self.folders.get_mut(&parent) {
            folder.children.retain(|existing| *existing != child);
        }
    }

    /// Inserts a note and lists it under its folder.
    pub fn insert_note(&mut self, note: Note) {
        let folder_id = note.folder_id;
        let id = note.id;
        self.notes.insert(id, note);
        self.attach_child(folder_id, id);
    }

    /// Inserts a folder and lists it under its parent.
    pub fn insert_folder(&mut self, folder: Folder) {
        let parent = folder.parent_id;
        let id = folder.id;
        self.folders.insert(id, folder);
        if let Some(parent) = parent {
            self.attach_child(parent, id);
        }
    }

    /// Removes a note together with every mention that references it.
    pub fn remove_note(&mut self, note_id: NoteId) -> Option<Note> {
        let note = self.notes.remove(&note_id)?;
        self.detach_child(note.folder_id, note_id);
        self.mentions
            .retain(|m| m.source != note_id && m.target != note_id);
        Some(note)
    }

    /// Removes a non-root folder and its whole subtree.
    ///
    /// Returns the removed folder and note ids.
    pub fn remove_folder_subtree(&mut self, folder_id: FolderId) -> (Vec<FolderId>, Vec<NoteId>) {
        if folder_id == self.root_id {
            return (Vec::new(), Vec::new());
        }
        let (folders, notes) = self.subtree(folder_id);
        for note_id in &notes {
            self.remove_note(*note_id);
        }
        if let Some(parent) = self.folders.get(&folder_id).and_then(|f| f.parent_id) {
            self.detach_child(parent, folder_id);
        }
        for id in &folders {
            self.folders.remove(id);
        }
        (folders, notes)
    }

    /// Replaces the outgoing mentions of `source`.
    pub fn set_mentions(&mut self, source: NoteId, targets: impl IntoIterator<Item = NoteId>) {
        self.mentions.retain(|m| m.source != source);
        for target in targets {
            if target != source && self.notes.contains_key(&target) {
                self.mentions.insert(Mention { source, target });
            }
        }
    }

    /// Checks every structural invariant.
    pub fn validate(&self) -> Result<(), ModelError> {
        let root = self
            .folders
            .get(&self.root_id)
            .filter(|root| root.parent_id.is_none())
            .ok_or(ModelError::RootMissing(self.root_id))?;

        let mut listed: HashSet<Uuid> = HashSet::new();
        listed.insert(root.id);

        for folder in self.folders.values() {
            if self.notes.contains_key(&folder.id) {
                return Err(ModelError::DuplicateId(folder.id));
            }
            match folder.parent_id {
                None if folder.id != self.root_id => {
                    return Err(ModelError::MultipleRoots(folder.id));
                }
                None => {}
                Some(parent) => {
                    let parent_folder =
                        self.folders
                            .get(&parent)
                            .ok_or(ModelError::MissingParent {
                                child: folder.id,
                                parent,
                            })?;
                    if !parent_folder.children.contains(&folder.id) {
                        return Err(ModelError::ChildListMismatch {
                            parent,
                            child: folder.id,
                        });
                    }
                }
            }

            for child in &folder.children {
                let points_back = match self.kind_of(*child) {
                    Some(EntityKind::Folder) => self
                        .folders
                        .get(child)
                        .is_some_and(|f| f.parent_id == Some(folder.id)),
                    Some(EntityKind::Note) => self
                        .notes
                        .get(child)
                        .is_some_and(|n| n.folder_id == folder.id),
                    None => false,
                };
                if !points_back || !listed.insert(*child) {
                    return Err(ModelError::ChildListMismatch {
                        parent: folder.id,
                        child: *child,
                    });
                }
            }
        }

        for folder in self.folders.values() {
            let mut current = folder.parent_id;
            let mut steps = 0usize;
            while let Some(id) = current {
                if id == folder.id || steps > self.folders.len() {
                    return Err(ModelError::Cycle(folder.id));
                }
                current = self.folders.get(&id).and_then(|f| f.parent_id);
                steps += 1;
            }
            if folder.is_locked() {
                if let Some(parent) = folder.parent_id {
                    if self.vault_of_folder(parent).is_some() {
                        return Err(ModelError::NestedVault(folder.id));
                    }
                }
            }
        }

        for note in self.notes.values() {
            let parent = self
                .folders
                .get(&note.folder_id)
                .ok_or(ModelError::MissingParent {
                    child: note.id,
                    parent: note.folder_id,
                })?;
            if !parent.children.contains(&note.id) {
                return Err(ModelError::ChildListMismatch {
                    parent: parent.id,
                    child: note.id,
                });
            }
            if !note.checksum_is_consistent() {
                return Err(ModelError::ChecksumMismatch(note.id));
            }
            let folder_vault = self.vault_of_folder(note.folder_id).is_some();
            if note.is_locked() && folder_vault {
                return Err(ModelError::NestedVault(note.id));
            }
            if (folder_vault || note.is_locked()) != note.content.is_sealed() {
                return Err(ModelError::SealingMismatch(note.id));
            }
        }

        for mention in &self.mentions {
            let source_ok = self
                .notes
                .get(&mention.source)
                .is_some_and(|n| !n.content.is_sealed());
            if !source_ok || !self.notes.contains_key(&mention.target) {
                return Err(ModelError::DanglingMention(*mention));
            }
        }

        Ok(())
    }

    /// Deterministic digest over every entity record, mention and setting.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.root_id.as_bytes());
        for folder in self.folders.values() {
            hasher.update(b"f");
            hasher.update(folder.record_checksum().as_bytes());
        }
        for note in self.notes.values() {
            hasher.update(b"n");
            hasher.update(note.record_checksum().as_bytes());
        }
        for mention in &self.mentions {
            hasher.update(b"m");
            hasher.update(mention.source.as_bytes());
            hasher.update(mention.target.as_bytes());
        }
        for (key, value) in &self.settings {
            hasher.update(b"s");
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
