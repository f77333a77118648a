//! Atomic commit protocol shared by every backend.
//!
//! # Responsibility
//! - Write a complete artifact to a staging sibling, flush it durably and
//!   swap it over the live artifact in one step.
//! - Absorb transient OS contention (locks held by sync clients, indexers,
//!   antivirus) with bounded linear backoff.
//! - Fall back to copy-over-live when the rename keeps failing.
//!
//! # Invariants
//! - Until the swap succeeds the live artifact is untouched.
//! - A staging file that could not be committed is left in place for
//!   recovery when the copy fallback may have touched live; otherwise it is
//!   removed.
//! - A later commit overwrites any stale staging file.

use crate::config::RetryPolicy;
use crate::storage::{StoreError, StoreResult};
use log::{error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Filesystem primitives used by the commit protocol.
///
/// Production code uses [`OsFs`]; tests inject contention.
pub trait CommitFs: Send + Sync {
    /// Flushes file content and metadata to stable storage.
    fn sync_file(&self, path: &Path) -> io::Result<()>;
    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Copies `from` over `to`.
    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
    /// Flushes directory entries so a completed rename survives power loss.
    fn sync_dir(&self, dir: &Path) -> io::Result<()>;
}

/// Real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl CommitFs for OsFs {
    fn sync_file(&self, path: &Path) -> io::Result<()> {
        OpenOptions::new().write(true).open(path)?.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        std::fs::copy(from, to)
    }

    #[cfg(unix)]
    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// How the staging artifact reached the live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPath {
    Rename,
    CopyFallback,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub swap: SwapPath,
    /// Rename attempts made before success or fallback.
    pub attempts: u32,
}

/// Write-staging/flush/swap executor with retry policy.
#[derive(Clone)]
pub struct AtomicCommitter {
    fs: Arc<dyn CommitFs>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for AtomicCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicCommitter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AtomicCommitter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_fs(Arc::new(OsFs), policy)
    }

    pub fn with_fs(fs: Arc<dyn CommitFs>, policy: RetryPolicy) -> Self {
        Self { fs, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Commits `bytes` as the new content of `live`.
    pub fn commit_bytes(&self, live: &Path, staging: &Path, bytes: &[u8]) -> StoreResult<CommitOutcome> {
        self.commit(live, staging, |path| {
            let mut file = File::create(path).map_err(|err| StoreError::io(path, err))?;
            file.write_all(bytes)
                .map_err(|err| StoreError::io(path, err))?;
            Ok(())
        })
    }

    /// Runs the full protocol: `write_staging` fills the staging path, then
    /// the staging file is flushed and swapped over `live`.
    pub fn commit<F>(&self, live: &Path, staging: &Path, write_staging: F) -> StoreResult<CommitOutcome>
    where
        F: FnOnce(&Path) -> StoreResult<()>,
    {
        let started_at = Instant::now();
        let artifact = display_name(live);

        if let Err(err) = write_staging(staging) {
            error!(
                "event=commit module=storage status=error stage=write_staging artifact={} error={}",
                artifact, err
            );
            discard(staging);
            return Err(err);
        }

        if let Err((attempts, source)) = self.retry_transient("sync_staging", || self.fs.sync_file(staging)) {
            error!(
                "event=commit module=storage status=error stage=sync_staging artifact={} attempts={} error={}",
                artifact, attempts, source
            );
            discard(staging);
            return Err(StoreError::WriteFailed {
                path: staging.to_path_buf(),
                attempts,
                source,
            });
        }

        match self.retry_transient("rename", || self.fs.rename(staging, live)) {
            Ok(attempts) => {
                self.sync_parent(live);
                info!(
                    "event=commit module=storage status=ok swap=rename artifact={} attempts={} duration_ms={}",
                    artifact,
                    attempts,
                    started_at.elapsed().as_millis()
                );
                Ok(CommitOutcome {
                    swap: SwapPath::Rename,
                    attempts,
                })
            }
            Err((attempts, rename_err)) => {
                warn!(
                    "event=commit module=storage status=fallback artifact={} attempts={} error={}",
                    artifact, attempts, rename_err
                );
                match self.copy_over_live(staging, live) {
                    Ok(()) => {
                        discard(staging);
                        self.sync_parent(live);
                        info!(
                            "event=commit module=storage status=ok swap=copy_fallback artifact={} attempts={} duration_ms={}",
                            artifact,
                            attempts,
                            started_at.elapsed().as_millis()
                        );
                        Ok(CommitOutcome {
                            swap: SwapPath::CopyFallback,
                            attempts,
                        })
                    }
                    Err((copy_attempts, source)) => {
                        // Staging stays: the copy may have partially overwritten live.
                        error!(
                            "event=commit module=storage status=error stage=copy_fallback artifact={} attempts={} error={}",
                            artifact,
                            attempts + copy_attempts,
                            source
                        );
                        Err(StoreError::WriteFailed {
                            path: live.to_path_buf(),
                            attempts: attempts + copy_attempts,
                            source,
                        })
                    }
                }
            }
        }
    }

    fn copy_over_live(&self, staging: &Path, live: &Path) -> Result<(), (u32, io::Error)> {
        let copied = self.retry_transient("copy", || self.fs.copy(staging, live))?;
        let synced = self.retry_transient("sync_live", || self.fs.sync_file(live));
        synced.map(|_| ()).map_err(|(attempts, err)| (copied + attempts, err))
    }

    fn sync_parent(&self, live: &Path) {
        let Some(parent) = live.parent() else {
            return;
        };
        if let Err(err) = self.fs.sync_dir(parent) {
            warn!(
                "event=commit module=storage status=warn stage=sync_dir path={} error={}",
                parent.display(),
                err
            );
        }
    }

    /// Runs `op` until it succeeds, fails non-transiently or exhausts the
    /// policy. Returns attempts used.
    fn retry_transient<T>(
        &self,
        stage: &str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<u32, (u32, io::Error)> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(_) => return Ok(attempt),
                Err(err) if is_transient(&err) && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "event=commit_retry module=storage stage={} attempt={} delay_ms={} error={}",
                        stage,
                        attempt,
                        delay.as_millis(),
                        err
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }
}

/// Whether an I/O error is OS contention worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut
    ) {
        return true;
    }
    match err.raw_os_error() {
        // EBUSY, ETXTBSY
        #[cfg(unix)]
        Some(16) | Some(26) => true,
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(32) | Some(33) => true,
        _ => false,
    }
}

fn discard(staging: &Path) {
    match std::fs::remove_file(staging) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "event=commit module=storage status=warn stage=discard_staging path={} error={}",
            staging.display(),
            err
        ),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
