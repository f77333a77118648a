//! Note domain model.
//!
//! # Responsibility
//! - Define the note record shared by every backend.
//! - Keep the content checksum in lockstep with the content bytes.
//!
//! # Invariants
//! - `id` is stable and never reused for another note.
//! - `checksum` is the blake3 hex digest of `content.checksum_bytes()`.
//! - Notes inside a vault, or carrying their own lock, hold
//!   `NoteContent::Sealed` only.

use crate::model::folder::{FolderId, VaultParams};
use crate::model::now_epoch_ms;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable note identifier.
pub type NoteId = Uuid;

/// Note payload as it exists at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteContent {
    /// Readable note outside any vault.
    Plain {
        title: String,
        /// Opaque editor payload.
        #[serde(with = "crate::model::base64_bytes")]
        body: Vec<u8>,
    },
    /// Vault ciphertext (`nonce || ciphertext`) over title and body.
    Sealed {
        #[serde(with = "crate::model::base64_bytes")]
        blob: Vec<u8>,
    },
}

impl NoteContent {
    /// Bytes covered by the note content checksum.
    ///
    /// Plain content is framed as `len(title) (u64 le) || title || body`, so
    /// no title/body split can collide with another.
    pub fn checksum_bytes(&self) -> Vec<u8> {
        match self {
            Self::Plain { title, body } => {
                let mut bytes = Vec::with_capacity(8 + title.len() + body.len());
                bytes.extend_from_slice(&(title.len() as u64).to_le_bytes());
                bytes.extend_from_slice(title.as_bytes());
                bytes.extend_from_slice(body);
                bytes
            }
            Self::Sealed { blob } => blob.clone(),
        }
    }

    /// Whether the payload is vault ciphertext.
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed { .. })
    }
}

/// Canonical note record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Stable global id used by mentions and backends.
    pub id: NoteId,
    /// Owning folder.
    pub folder_id: FolderId,
    /// Plain or sealed payload.
    pub content: NoteContent,
    /// Display pin flag.
    #[serde(default)]
    pub pinned: bool,
    /// Epoch ms of the last content/metadata change.
    pub modified_at: i64,
    /// blake3 hex of the content bytes.
    pub checksum: String,
    /// Per-note lock; the note is then sealed under its own key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<VaultParams>,
}

impl Note {
    /// Creates a plain note with a generated id.
    pub fn new(folder_id: FolderId, title: impl Into<String>, body: Vec<u8>) -> Self {
        Self::with_content(
            Uuid::new_v4(),
            folder_id,
            NoteContent::Plain {
                title: title.into(),
                body,
            },
        )
    }

    /// Creates a note with a caller-provided id and content.
    pub fn with_content(id: NoteId, folder_id: FolderId, content: NoteContent) -> Self {
        let checksum = content_checksum(&content);
        Self {
            id,
            folder_id,
            content,
            pinned: false,
            modified_at: now_epoch_ms(),
            checksum,
            lock: None,
        }
    }

    /// Replaces content and refreshes checksum and timestamp.
    pub fn set_content(&mut self, content: NoteContent) {
        self.checksum = content_checksum(&content);
        self.content = content;
        self.modified_at = now_epoch_ms();
    }

    /// Plain title, or `None` for sealed notes.
    pub fn title(&self) -> Option<&str> {
        match &self.content {
            NoteContent::Plain { title, .. } => Some(title.as_str()),
            NoteContent::Sealed { .. } => None,
        }
    }

    /// Whether the note carries its own lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Whether `checksum` still matches the content bytes.
    pub fn checksum_is_consistent(&self) -> bool {
        self.checksum == content_checksum(&self.content)
    }

    /// Checksum over the whole record, used to verify migrated rows.
    pub fn record_checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.folder_id.as_bytes());
        hasher.update(&[u8::from(self.pinned), u8::from(self.content.is_sealed())]);
        hasher.update(&self.modified_at.to_le_bytes());
        hasher.update(self.checksum.as_bytes());
        if let Some(lock) = &self.lock {
            lock.hash_into(&mut hasher);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// blake3 hex digest over the content bytes.
pub fn content_checksum(content: &NoteContent) -> String {
    blake3::hash(&content.checksum_bytes()).to_hex().to_string()
}
