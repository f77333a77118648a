//! Workspace domain model: notes, folders, vault parameters and mentions.
//!
//! # Responsibility
//! - Define the logical `Workspace` value every backend must round-trip.
//! - Enforce tree and identity invariants without touching I/O.
//!
//! # Invariants
//! - Every note/folder is identified by a stable UUID that is never reused.
//! - The folder graph is acyclic and single-rooted.
//! - Serialized form is deterministic (ordered maps and sets only).

pub mod folder;
pub mod mention;
pub mod note;
pub mod workspace;

pub use folder::{Folder, FolderId, KdfParams, VaultParams};
pub use mention::{extract_mentions, mention_link, Mention};
pub use note::{Note, NoteContent, NoteId};
pub use workspace::{EntityKind, ModelError, Workspace};

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serde adapter storing byte payloads as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
