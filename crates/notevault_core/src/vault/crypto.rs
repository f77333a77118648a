//! Key derivation, verification tags and note sealing.
//!
//! # Invariants
//! - Sealed blob layout is `nonce(12) || ciphertext || tag(16)`.
//! - The note id is bound as associated data, so a blob only opens under
//!   the note it was sealed for.
//! - Failed unlocks perform the same Argon2 work as successful ones.

use crate::model::{KdfParams, NoteId, VaultParams};
use crate::vault::{VaultError, VaultResult};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const VERIFY_CONTEXT: &[u8] = b"notevault vault verification v1";
const DECOY_SALT: [u8; SALT_LEN] = *b"notevault-decoy!";

/// Derived vault key. Zeroized on drop, never cloned.
pub struct VaultKey(Zeroizing<[u8; KEY_LEN]>);

impl VaultKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn verify_tag(&self) -> blake3::Hash {
        blake3::keyed_hash(self.as_bytes(), VERIFY_CONTEXT)
    }
}

impl Debug for VaultKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

#[derive(Serialize, Deserialize)]
struct SealedPayload {
    title: String,
    #[serde(with = "crate::model::base64_bytes")]
    body: Vec<u8>,
}

/// Runs Argon2id over `password` and `salt`.
pub fn derive_key(password: &str, salt: &[u8], kdf: &KdfParams) -> VaultResult<VaultKey> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|err| VaultError::KeyDerivation(err.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|err| VaultError::KeyDerivation(err.to_string()))?;
    Ok(VaultKey(key))
}

/// Burns the same KDF work as a real unlock attempt.
pub(crate) fn decoy_derivation(password: &str, kdf: &KdfParams) {
    let _ = derive_key(password, &DECOY_SALT, kdf);
}

/// Creates fresh vault parameters and the matching key.
pub fn create_vault(password: &str, kdf: KdfParams) -> VaultResult<(VaultParams, VaultKey)> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt, &kdf)?;
    let params = VaultParams {
        salt: STANDARD.encode(salt),
        verify_tag: key.verify_tag().to_hex().to_string(),
        kdf,
    };
    Ok((params, key))
}

/// Derives the candidate key and checks it against the stored tag.
pub fn open_vault(password: &str, params: &VaultParams) -> VaultResult<VaultKey> {
    let salt = match STANDARD.decode(params.salt.as_bytes()) {
        Ok(salt) if salt.len() >= SALT_LEN => salt,
        _ => {
            decoy_derivation(password, &params.kdf);
            return Err(VaultError::AuthFailed);
        }
    };
    let key = derive_key(password, &salt, &params.kdf)?;
    let expected = blake3::Hash::from_hex(&params.verify_tag).map_err(|_| VaultError::AuthFailed)?;
    // blake3::Hash equality is constant-time.
    if key.verify_tag() == expected {
        Ok(key)
    } else {
        Err(VaultError::AuthFailed)
    }
}

/// Encrypts title and body for `note_id`.
pub fn seal(key: &VaultKey, note_id: NoteId, title: &str, body: &[u8]) -> VaultResult<Vec<u8>> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(&SealedPayload {
            title: title.to_string(),
            body: body.to_vec(),
        })
        .map_err(|_| VaultError::Cipher)?,
    );
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: note_id.as_bytes(),
            },
        )
        .map_err(|_| VaultError::Cipher)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypts a blob sealed for `note_id`, returning title and body.
pub fn unseal(key: &VaultKey, note_id: NoteId, blob: &[u8]) -> VaultResult<(String, Vec<u8>)> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::Cipher);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: note_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Cipher)?,
    );
    let payload: SealedPayload =
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::Cipher)?;
    Ok((payload.title, payload.body))
}
