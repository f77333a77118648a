//! Explicit session context holding unlocked vault keys.
//!
//! Keys are indexed by vault id: the id of a vault folder, or of a note
//! carrying its own lock.

use crate::vault::crypto::VaultKey;
use log::info;
use std::collections::HashMap;
use uuid::Uuid;

/// Keys unlocked during one UI session.
///
/// Dropping the session drops (and zeroizes) every key.
#[derive(Debug, Default)]
pub struct VaultSession {
    keys: HashMap<Uuid, VaultKey>,
}

impl VaultSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unlocked(&self, vault_id: Uuid) -> bool {
        self.keys.contains_key(&vault_id)
    }

    /// Borrowed key for an unlocked vault.
    pub fn key(&self, vault_id: Uuid) -> Option<&VaultKey> {
        self.keys.get(&vault_id)
    }

    /// Number of vaults currently unlocked.
    pub fn unlocked_count(&self) -> usize {
        self.keys.len()
    }

    /// Discards the key of one vault. Returns whether it was unlocked.
    pub fn relock(&mut self, vault_id: Uuid) -> bool {
        let was_unlocked = self.keys.remove(&vault_id).is_some();
        if was_unlocked {
            info!("event=vault_relock module=vault vault_id={}", vault_id);
        }
        was_unlocked
    }

    /// Discards every key.
    pub fn relock_all(&mut self) {
        let count = self.keys.len();
        self.keys.clear();
        info!("event=vault_relock_all module=vault count={}", count);
    }

    pub(crate) fn insert(&mut self, vault_id: Uuid, key: VaultKey) {
        self.keys.insert(vault_id, key);
    }
}
