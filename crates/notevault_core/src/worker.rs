//! Background storage worker and coalescing autosave.
//!
//! # Responsibility
//! - Run blocking storage calls on a dedicated thread behind an async handle.
//! - Commit the most recent workspace snapshot on a fixed cadence.
//!
//! # Invariants
//! - The worker thread is the only owner of its `Storage`; requests are
//!   served one at a time in arrival order.
//! - At most one autosave commit is in flight.
//! - A newer submission always supersedes an older pending one.

use crate::migration::MigrationReport;
use crate::model::Workspace;
use crate::storage::{BackendKind, CommitAck, Storage, StoreError, StoreResult, WorkspaceStore};
use log::{error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const REQUEST_QUEUE_DEPTH: usize = 32;

enum StorageRequest {
    Load {
        reply: oneshot::Sender<StoreResult<Workspace>>,
    },
    Save {
        workspace: Arc<Workspace>,
        reply: oneshot::Sender<StoreResult<CommitAck>>,
    },
    MigrateTo {
        target: BackendKind,
        reply: oneshot::Sender<StoreResult<MigrationReport>>,
    },
}

fn worker_gone() -> StoreError {
    StoreError::Fatal("storage worker stopped".to_string())
}

/// Owner of the storage thread.
pub struct StorageWorker {
    thread: Option<ThreadHandle<Storage>>,
}

impl StorageWorker {
    /// Moves `storage` onto a new thread and returns its async handle.
    pub fn spawn(storage: Storage) -> StoreResult<(StorageHandle, StorageWorker)> {
        let (tx, mut rx) = mpsc::channel::<StorageRequest>(REQUEST_QUEUE_DEPTH);
        let thread = std::thread::Builder::new()
            .name("notevault-storage".to_string())
            .spawn(move || {
                let mut storage = storage;
                info!(
                    "event=worker_start module=worker status=ok backend={}",
                    storage.kind()
                );
                while let Some(request) = rx.blocking_recv() {
                    serve(&mut storage, request);
                }
                info!("event=worker_stop module=worker status=ok");
                storage
            })
            .map_err(|err| StoreError::Fatal(format!("failed to spawn storage worker: {err}")))?;
        Ok((
            StorageHandle { tx },
            StorageWorker {
                thread: Some(thread),
            },
        ))
    }

    /// Waits for the thread to exit and hands the storage back.
    ///
    /// The thread exits once every `StorageHandle` clone is dropped.
    pub fn join(mut self) -> StoreResult<Storage> {
        let thread = self.thread.take().ok_or_else(worker_gone)?;
        thread
            .join()
            .map_err(|_| StoreError::Fatal("storage worker panicked".to_string()))
    }
}

fn serve(storage: &mut Storage, request: StorageRequest) {
    // A dropped receiver only means the caller stopped waiting.
    match request {
        StorageRequest::Load { reply } => {
            let _ = reply.send(storage.load());
        }
        StorageRequest::Save { workspace, reply } => {
            let _ = reply.send(storage.save(&workspace));
        }
        StorageRequest::MigrateTo { target, reply } => {
            let _ = reply.send(storage.migrate_to(target));
        }
    }
}

/// Cloneable async front of a [`StorageWorker`].
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageRequest>,
}

impl StorageHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> StorageRequest,
    ) -> StoreResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| worker_gone())?;
        response.await.map_err(|_| worker_gone())?
    }

    pub async fn load(&self) -> StoreResult<Workspace> {
        self.request(|reply| StorageRequest::Load { reply }).await
    }

    pub async fn save(&self, workspace: Arc<Workspace>) -> StoreResult<CommitAck> {
        self.request(|reply| StorageRequest::Save { workspace, reply })
            .await
    }

    pub async fn migrate_to(&self, target: BackendKind) -> StoreResult<MigrationReport> {
        self.request(|reply| StorageRequest::MigrateTo { target, reply })
            .await
    }
}

/// Counters reported when an [`Autosaver`] shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutosaveStats {
    pub submitted: u64,
    pub commits: u64,
    /// Submissions superseded before they were committed.
    pub coalesced: u64,
    pub failures: u64,
    pub last_version: Option<u64>,
}

#[derive(Clone)]
struct Pending {
    generation: u64,
    workspace: Arc<Workspace>,
}

/// Time-triggered saver that commits only the latest submitted snapshot.
pub struct Autosaver {
    slot: watch::Sender<Option<Pending>>,
    generation: AtomicU64,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<AutosaveStats>,
}

impl Autosaver {
    /// Starts the autosave loop on the current tokio runtime.
    pub fn spawn(handle: StorageHandle, interval: Duration) -> Self {
        let (slot, pending) = watch::channel(None);
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(run(handle, pending, interval, stopped));
        Self {
            slot,
            generation: AtomicU64::new(0),
            stop: Some(stop),
            task,
        }
    }

    /// Replaces the pending snapshot. Returns its generation.
    pub fn submit(&self, workspace: Arc<Workspace>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot.send_replace(Some(Pending {
            generation,
            workspace,
        }));
        generation
    }

    /// Flushes the latest snapshot and stops the loop.
    pub async fn shutdown(mut self) -> AutosaveStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(
                    "event=autosave_stop module=worker status=error error={}",
                    err
                );
                AutosaveStats::default()
            }
        }
    }
}

async fn run(
    handle: StorageHandle,
    pending: watch::Receiver<Option<Pending>>,
    interval: Duration,
    mut stopped: oneshot::Receiver<()>,
) -> AutosaveStats {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut committed = 0u64;
    let mut stats = AutosaveStats::default();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                commit_latest(&handle, &pending, &mut committed, &mut stats).await;
            }
            _ = &mut stopped => {
                commit_latest(&handle, &pending, &mut committed, &mut stats).await;
                break;
            }
        }
    }

    if let Some(latest) = pending.borrow().as_ref() {
        stats.submitted = latest.generation;
    }
    stats.coalesced = stats.submitted.saturating_sub(stats.commits);
    info!(
        "event=autosave_stop module=worker status=ok submitted={} commits={} failures={}",
        stats.submitted, stats.commits, stats.failures
    );
    stats
}

async fn commit_latest(
    handle: &StorageHandle,
    pending: &watch::Receiver<Option<Pending>>,
    committed: &mut u64,
    stats: &mut AutosaveStats,
) {
    let latest = pending.borrow().clone();
    let Some(latest) = latest else {
        return;
    };
    if latest.generation <= *committed {
        return;
    }
    match handle.save(latest.workspace).await {
        Ok(ack) => {
            *committed = latest.generation;
            stats.commits += 1;
            stats.last_version = Some(ack.stamp.version);
        }
        Err(err) => {
            stats.failures += 1;
            warn!(
                "event=autosave module=worker status=retry generation={} error={}",
                latest.generation, err
            );
        }
    }
}
