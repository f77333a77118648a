//! Folder and vault-parameter model.
//!
//! # Invariants
//! - `parent_id` is `None` only for the workspace root.
//! - `children` is display order; every entry points back to this folder.
//! - `vault` never stores a password or raw key, only salt + verification tag.

use crate::model::now_epoch_ms;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable folder identifier.
pub type FolderId = Uuid;

/// Argon2id cost parameters persisted alongside every vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Encryption parameters that turn a folder, or a single note, into a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultParams {
    /// Base64 key-derivation salt.
    pub salt: String,
    /// Hex keyed-hash of a fixed constant under the derived key.
    pub verify_tag: String,
    /// Costs used when the vault was created.
    pub kdf: KdfParams,
}

impl VaultParams {
    /// Feeds every persisted field into a record checksum.
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(self.salt.as_bytes());
        hasher.update(self.verify_tag.as_bytes());
        hasher.update(&self.kdf.memory_kib.to_le_bytes());
        hasher.update(&self.kdf.iterations.to_le_bytes());
        hasher.update(&self.kdf.parallelism.to_le_bytes());
    }
}

/// Folder record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub title: String,
    pub parent_id: Option<FolderId>,
    /// Ordered child folder and note ids.
    #[serde(default)]
    pub children: Vec<Uuid>,
    #[serde(default)]
    pub vault: Option<VaultParams>,
    pub modified_at: i64,
}

impl Folder {
    /// Creates an unlocked folder with a generated id.
    pub fn new(parent_id: Option<FolderId>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            parent_id,
            children: Vec::new(),
            vault: None,
            modified_at: now_epoch_ms(),
        }
    }

    /// Whether this folder is a vault.
    pub fn is_locked(&self) -> bool {
        self.vault.is_some()
    }

    /// Checksum over the whole record, used to verify migrated rows.
    pub fn record_checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.title.as_bytes());
        hasher.update(&[0]);
        match self.parent_id {
            Some(parent) => hasher.update(parent.as_bytes()),
            None => hasher.update(b"root"),
        };
        for child in &self.children {
            hasher.update(child.as_bytes());
        }
        if let Some(vault) = &self.vault {
            vault.hash_into(&mut hasher);
        }
        hasher.update(&self.modified_at.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}
