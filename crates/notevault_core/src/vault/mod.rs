//! Vault lock manager: password-derived keys and at-rest sealing.
//!
//! # Responsibility
//! - Derive vault keys with Argon2id and verify them against the stored tag.
//! - Seal and unseal note payloads with ChaCha20-Poly1305.
//! - Hold unlocked keys in an explicit, droppable session context.
//!
//! # Invariants
//! - Only the salt, verification tag and KDF costs are persisted.
//! - Keys live in zeroizing memory and are only lent by reference.
//! - Every authentication failure looks the same to the caller.
//!
//! # See also
//! - `service::note_service` for the enforcement points.

use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod crypto;
pub mod session;

pub use crypto::{create_vault, open_vault, seal, unseal, VaultKey};
pub use session::VaultSession;

pub type VaultResult<T> = Result<T, VaultError>;

/// Vault failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Wrong password, unknown target or a target that is not a vault;
    /// deliberately indistinguishable.
    AuthFailed,
    /// Operation needs a vault that is not unlocked in this session.
    Locked(Uuid),
    /// Folder is already a vault, or note already carries a lock.
    AlreadyVault(Uuid),
    /// Vault would sit inside, or contain, another vault.
    NestedVault(Uuid),
    /// Folder or note is not a vault.
    NotVault(Uuid),
    /// Argon2 rejected the parameters or failed to run.
    KeyDerivation(String),
    /// Authenticated decryption failed or ciphertext is malformed.
    Cipher,
    /// Stored vault parameters cannot be decoded.
    InvalidParams(String),
}

impl Display for VaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthFailed => write!(f, "vault authentication failed"),
            Self::Locked(id) => write!(f, "vault is locked: {id}"),
            Self::AlreadyVault(id) => write!(f, "already a vault: {id}"),
            Self::NestedVault(id) => write!(f, "vaults cannot be nested: {id}"),
            Self::NotVault(id) => write!(f, "not a vault: {id}"),
            Self::KeyDerivation(message) => write!(f, "key derivation failed: {message}"),
            Self::Cipher => write!(f, "vault ciphertext rejected"),
            Self::InvalidParams(message) => write!(f, "invalid vault parameters: {message}"),
        }
    }
}

impl Error for VaultError {}
