//! Document backend: one serialized tree per workspace.
//!
//! # Responsibility
//! - Encode the whole workspace as a self-verifying artifact.
//! - Commit it through the atomic protocol and snapshot on cadence.
//!
//! # Invariants
//! - Artifact = one JSON header line, `\n`, then the JSON payload.
//! - Header `checksum` is blake3 of the payload bytes and `length` is the
//!   payload length; any mismatch marks the artifact corrupt.
//! - A loaded workspace has passed model validation.

use crate::config::CoreConfig;
use crate::model::{now_epoch_ms, Workspace};
use crate::storage::commit::AtomicCommitter;
use crate::storage::layout::WorkspaceLayout;
use crate::storage::summary::{ListScope, SummaryCursor, WorkspaceSummaries};
use crate::storage::{
    remove_entity, snapshot, ArtifactCheck, BackendKind, CommitAck, CommitStamp, StoreError,
    StoreResult, WorkspaceStore,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use uuid::Uuid;

const DOCUMENT_MAGIC: &str = "notevault/document";
const DOCUMENT_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DocumentHeader {
    magic: String,
    format: u32,
    version: u64,
    checksum: String,
    length: u64,
    committed_at: i64,
}

/// Serializes `workspace` into a complete document artifact.
pub fn encode_document(workspace: &Workspace, version: u64) -> StoreResult<Vec<u8>> {
    let payload = serde_json::to_vec(workspace)?;
    let header = DocumentHeader {
        magic: DOCUMENT_MAGIC.to_string(),
        format: DOCUMENT_FORMAT,
        version,
        checksum: blake3::hash(&payload).to_hex().to_string(),
        length: payload.len() as u64,
        committed_at: now_epoch_ms(),
    };
    let mut bytes = serde_json::to_vec(&header)?;
    bytes.push(b'\n');
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode_header<'a>(artifact: &Path, bytes: &'a [u8]) -> StoreResult<(DocumentHeader, &'a [u8])> {
    let split = bytes
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or_else(|| StoreError::corrupt(artifact, "missing header line"))?;
    let header: DocumentHeader = serde_json::from_slice(&bytes[..split])
        .map_err(|err| StoreError::corrupt(artifact, format!("unreadable header: {err}")))?;
    if header.magic != DOCUMENT_MAGIC {
        return Err(StoreError::corrupt(artifact, "not a workspace document"));
    }
    if header.format != DOCUMENT_FORMAT {
        return Err(StoreError::corrupt(
            artifact,
            format!("unsupported document format {}", header.format),
        ));
    }
    let payload = &bytes[split + 1..];
    if payload.len() as u64 != header.length {
        return Err(StoreError::corrupt(
            artifact,
            format!("truncated payload: {} of {} bytes", payload.len(), header.length),
        ));
    }
    if blake3::hash(payload).to_hex().as_str() != header.checksum {
        return Err(StoreError::corrupt(artifact, "payload checksum mismatch"));
    }
    Ok((header, payload))
}

fn stamp_of(header: &DocumentHeader) -> CommitStamp {
    CommitStamp {
        version: header.version,
        checksum: header.checksum.clone(),
        committed_at: header.committed_at,
    }
}

/// Reads, verifies and validates a document artifact.
pub fn read_document(artifact: &Path) -> StoreResult<(Workspace, CommitStamp)> {
    let bytes = match std::fs::read(artifact) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Missing(artifact.to_path_buf()));
        }
        Err(err) => return Err(StoreError::io(artifact, err)),
    };
    let (header, payload) = decode_header(artifact, &bytes)?;
    let workspace: Workspace = serde_json::from_slice(payload)
        .map_err(|err| StoreError::corrupt(artifact, format!("unreadable payload: {err}")))?;
    workspace
        .validate()
        .map_err(|err| StoreError::corrupt(artifact, err.to_string()))?;
    Ok((workspace, stamp_of(&header)))
}

/// Full verification of a document artifact, including model validation.
pub fn verify_document(artifact: &Path) -> ArtifactCheck {
    match read_document(artifact) {
        Ok((_, stamp)) => ArtifactCheck::Valid(stamp),
        Err(StoreError::Missing(_)) => ArtifactCheck::Missing,
        Err(err) => ArtifactCheck::Corrupt(err.to_string()),
    }
}

/// Single-artifact backend.
#[derive(Debug)]
pub struct DocumentBackend {
    layout: WorkspaceLayout,
    committer: AtomicCommitter,
    config: CoreConfig,
    stamp: Option<CommitStamp>,
    commits_this_session: u64,
}

impl DocumentBackend {
    /// Binds to the layout and picks up the stamp of a valid live artifact.
    pub fn open(layout: WorkspaceLayout, committer: AtomicCommitter, config: CoreConfig) -> Self {
        let stamp = match verify_document(&layout.live_path(BackendKind::Document)) {
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

    pub(crate) fn save_with_version(
        &mut self,
        workspace: &Workspace,
        version: u64,
    ) -> StoreResult<CommitAck> {
        workspace.validate()?;
        let started_at = Instant::now();
        let bytes = encode_document(workspace, version)?;
        let live = self.layout.live_path(BackendKind::Document);
        let staging = self.layout.staging_path(BackendKind::Document);
        let outcome = match self.committer.commit_bytes(&live, &staging, &bytes) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    "event=store_save module=storage backend=document status=error version={} error={}",
                    version, err
                );
                return Err(err);
            }
        };

        // The header we just wrote is the authoritative stamp.
        let (header, _) = decode_header(&live, &bytes)?;
        let stamp = stamp_of(&header);
        self.stamp = Some(stamp.clone());
        self.commits_this_session += 1;
        let snapshot = snapshot::after_commit(
            &self.layout,
            BackendKind::Document,
            version,
            self.commits_this_session,
            &self.config,
        );
        info!(
            "event=store_save module=storage backend=document status=ok version={} notes={} bytes={} duration_ms={}",
            version,
            workspace.notes.len(),
            bytes.len(),
            started_at.elapsed().as_millis()
        );
        Ok(CommitAck {
            stamp,
            swap: outcome.swap,
            attempts: outcome.attempts,
            snapshot,
        })
    }

    fn next_version(&self) -> u64 {
        self.stamp.as_ref().map_or(1, |stamp| stamp.version + 1)
    }
}

impl WorkspaceStore for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn load(&self) -> StoreResult<Workspace> {
        let (workspace, _) = read_document(&self.layout.live_path(BackendKind::Document))?;
        Ok(workspace)
    }

    fn save(&mut self, workspace: &Workspace) -> StoreResult<CommitAck> {
        let version = self.next_version();
        self.save_with_version(workspace, version)
    }

    fn delete(&mut self, id: Uuid) -> StoreResult<CommitAck> {
        let mut workspace = self.load()?;
        remove_entity(&mut workspace, id)?;
        self.save(&workspace)
    }

    fn list(&self, scope: ListScope) -> StoreResult<SummaryCursor<'_>> {
        let workspace = self.load()?;
        Ok(SummaryCursor::new(
            Box::new(WorkspaceSummaries::new(workspace)),
            scope,
            self.config.list_page_size,
        ))
    }

    fn stamp(&self) -> Option<&CommitStamp> {
        self.stamp.as_ref()
    }
}
