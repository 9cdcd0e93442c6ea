use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use fs_meta::InodeStore;
use fs_types::{FsConfig, FsError, FsResult, InodeId};

use crate::sync::SyncEngine;

const WORKER_COUNT: usize = 4;
const PUSH_REQUEUE_LIMIT: u32 = 5;
const PUSH_REQUEUE_DELAY_MS: u64 = 200;

#[derive(Debug)]
enum ExecTask {
    /// Upload an inode's dirty state. Attempt count tracks Busy requeues.
    Push { inode_id: InodeId, attempt: u32 },
    /// Refresh a directory listing after a remote-side change.
    PullDir(InodeId),
    /// Push-delete an orphaned inode.
    Finalize(InodeId),
}

/// Cooperative task runner: a bounded worker pool draining a queue of sync
/// tasks, plus the periodic dirty-flush ticker. Uploads for one inode stay
/// serialized through the engine's push lock; a Busy result re-queues the
/// task so writes landing during a push coalesce into one follow-up.
pub struct Executor {
    tx: mpsc::UnboundedSender<ExecTask>,
    workers: Vec<JoinHandle<()>>,
    flush_task: JoinHandle<()>,
    op_slots: Arc<Semaphore>,
}

impl Executor {
    pub fn spawn(cfg: &FsConfig, sync: Arc<SyncEngine>, meta: Arc<InodeStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<ExecTask>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for worker_id in 0..WORKER_COUNT {
            let rx = rx.clone();
            let sync = sync.clone();
            let tx = tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else {
                        break;
                    };
                    debug!("executor worker {}: {:?}", worker_id, task);
                    match task {
                        ExecTask::Push { inode_id, attempt } => {
                            match sync.push_upstream(inode_id).await {
                                Ok(()) => {}
                                Err(FsError::Busy(_)) if attempt < PUSH_REQUEUE_LIMIT => {
                                    let tx = tx.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(Duration::from_millis(
                                            PUSH_REQUEUE_DELAY_MS << attempt,
                                        ))
                                        .await;
                                        let _ = tx.send(ExecTask::Push {
                                            inode_id,
                                            attempt: attempt + 1,
                                        });
                                    });
                                }
                                Err(e) => {
                                    // Dirty state stays queued; the flush
                                    // ticker retries it.
                                    warn!("executor: push of inode {} failed: {}", inode_id, e);
                                }
                            }
                        }
                        ExecTask::PullDir(inode_id) => {
                            if let Err(e) = sync.pull_downstream(inode_id, None).await {
                                warn!("executor: dir pull of inode {} failed: {}", inode_id, e);
                            }
                        }
                        ExecTask::Finalize(inode_id) => {
                            if let Err(e) = sync.finalize_orphan(inode_id).await {
                                warn!("executor: finalize of inode {} failed: {}", inode_id, e);
                            }
                        }
                    }
                }
            }));
        }

        let flush_tx = tx.clone();
        let flush_interval = Duration::from_secs(cfg.dirty_flush_interval_secs.max(1));
        let flush_meta = meta;
        let flush_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match flush_meta.list_dirty() {
                    Ok(dirty) => {
                        for inode_id in dirty {
                            let _ = flush_tx.send(ExecTask::Push { inode_id, attempt: 0 });
                        }
                    }
                    Err(e) => warn!("executor: dirty scan failed: {}", e),
                }
            }
        });

        Arc::new(Self {
            tx,
            workers,
            flush_task,
            op_slots: Arc::new(Semaphore::new(WORKER_COUNT * 4)),
        })
    }

    pub fn schedule_push(&self, inode_id: InodeId) {
        let _ = self.tx.send(ExecTask::Push { inode_id, attempt: 0 });
    }

    pub fn schedule_pull_dir(&self, inode_id: InodeId) {
        let _ = self.tx.send(ExecTask::PullDir(inode_id));
    }

    pub fn schedule_finalize(&self, inode_id: InodeId) {
        let _ = self.tx.send(ExecTask::Finalize(inode_id));
    }

    /// Bounded admission for FSOps so slow backend I/O cannot starve the
    /// dispatch thread of the kernel bridge.
    pub async fn op_slot(&self) -> FsResult<tokio::sync::OwnedSemaphorePermit> {
        self.op_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FsError::Internal("executor shut down".to_string()))
    }

    /// Synchronously push every dirty inode; used by unmount to drain.
    pub async fn drain_dirty(&self, sync: &Arc<SyncEngine>, meta: &Arc<InodeStore>) -> FsResult<()> {
        let dirty = meta.list_dirty()?;
        for inode_id in dirty {
            let mut attempt = 0;
            loop {
                match sync.push_upstream(inode_id).await {
                    Ok(()) => break,
                    Err(FsError::Busy(_)) if attempt < PUSH_REQUEUE_LIMIT => {
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(PUSH_REQUEUE_DELAY_MS)).await;
                    }
                    Err(e) => {
                        warn!("executor: drain push of inode {} failed: {}", inode_id, e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("executor: shutting down");
        self.flush_task.abort();
        for worker in &self.workers {
            worker.abort();
        }
    }
}
