//! Relational artifact schema history.
//!
//! # Responsibility
//! - Bring a writable workspace database up to the newest schema.
//! - Tell readers which optional tables and columns an artifact carries.
//!
//! # Schema history
//! - v1: folders (with vault parameters), notes, child order, mentions and
//!   the single-row commit stamp.
//! - v2: `app_settings` key/value table.
//! - v3: per-note lock parameters on `notes`.
//!
//! # Invariants
//! - Steps are additive only; an artifact of any older version stays
//!   readable without being rewritten.
//! - The applied version is mirrored to `PRAGMA user_version` inside the
//!   same transaction as the DDL.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

/// First schema version with the `app_settings` table.
pub const SETTINGS_SCHEMA_VERSION: u32 = 2;
/// First schema version with per-note lock columns.
pub const NOTE_LOCK_SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "workspace_tree",
        sql: include_str!("0001_init.sql"),
    },
    SchemaStep {
        version: SETTINGS_SCHEMA_VERSION,
        name: "app_settings",
        sql: include_str!("0002_app_settings.sql"),
    },
    SchemaStep {
        version: NOTE_LOCK_SCHEMA_VERSION,
        name: "note_locks",
        sql: include_str!("0003_note_locks.sql"),
    },
];

/// Newest schema version this build writes.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

/// Applies every step newer than the database's `user_version` in one
/// transaction. Databases from a newer build are rejected untouched.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = current_user_version(conn)?;
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }
    if from == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in STEPS.iter().filter(|step| step.version > from) {
        tx.execute_batch(step.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", step.version))?;
    }
    tx.commit()?;
    info!(
        "event=db_schema_upgrade module=db status=ok from={} to={}",
        from, latest
    );
    Ok(())
}

/// Reads `PRAGMA user_version`.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}
