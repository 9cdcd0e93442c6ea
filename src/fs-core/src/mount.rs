use log::{info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use block_store::BlockStore;
use coord_store::CoordStore;
use fs_meta::InodeStore;
use fs_types::{FsConfig, FsResult, ROOT_INODE_ID};
use remote_client::RemoteBackend;

use crate::cache::CacheManager;
use crate::executor::Executor;
use crate::handle::{Caller, HandleTable};
use crate::ops::{self, FsReply, FsRequest, OpContext};
use crate::sweep;
use crate::sync::{LastWriterWins, MergePolicy, NoopHooks, SyncEngine, SyncHooks};
use crate::{InodeLocks, MountState};

/// A mounted filesystem: owns every subsystem, the cache-root lock, and the
/// background tasks. Constructed by the mount driver and torn down by
/// `unmount`, which drains dirty state and writes the clean-shutdown marker.
pub struct Mount {
    cfg: FsConfig,
    ctx: OpContext,
    cache: Arc<CacheManager>,
    sync: Arc<SyncEngine>,
    meta: Arc<InodeStore>,
    executor: Arc<Executor>,
    state: Arc<MountState>,
    event_task: JoinHandle<()>,
    _cache_lock: std::fs::File,
}

impl Mount {
    pub async fn mount(
        cfg: FsConfig,
        backend: Arc<dyn RemoteBackend>,
        coord: Arc<dyn CoordStore>,
    ) -> FsResult<Mount> {
        Self::mount_with(
            cfg,
            backend,
            coord,
            Arc::new(NoopHooks),
            Arc::new(LastWriterWins),
        )
        .await
    }

    pub async fn mount_with(
        cfg: FsConfig,
        backend: Arc<dyn RemoteBackend>,
        coord: Arc<dyn CoordStore>,
        hooks: Arc<dyn SyncHooks>,
        merge: Arc<dyn MergePolicy>,
    ) -> FsResult<Mount> {
        let cache_lock = sweep::acquire_cache_lock(&cfg.cache_root)?;

        let blocks = Arc::new(BlockStore::open(&cfg.cache_root, cfg.block_size).await?);
        let meta = Arc::new(InodeStore::new(&cfg.inode_db_path())?);

        // Bind the root inode to the configured capability on first mount.
        if !cfg.root_capability.is_empty() {
            let root = meta.get(ROOT_INODE_ID)?;
            if root.remote_ref.is_none() {
                let mut updated = root.clone();
                updated.remote_ref = Some(cfg.root_capability.clone());
                updated.version += 1;
                meta.update(&updated, root.version)?;
            }
        }

        let locks = Arc::new(InodeLocks::new());
        let state = Arc::new(MountState::new(cfg.read_only));
        let sync = Arc::new(SyncEngine::new(
            cfg.clone(),
            blocks.clone(),
            meta.clone(),
            coord.clone(),
            backend,
            locks.clone(),
            state.clone(),
            hooks,
            merge,
        ));
        let cache = Arc::new(CacheManager::new(
            cfg.clone(),
            blocks.clone(),
            meta.clone(),
            coord,
            locks,
            sync.clone(),
            state.clone(),
        ));

        let report = sweep::startup_sweep(&cfg.cache_root, &blocks, &meta).await?;
        cache.seed_residency().await?;

        let executor = Executor::spawn(&cfg, sync.clone(), meta.clone());
        for inode_id in &report.dirty_inodes {
            executor.schedule_push(*inode_id);
        }
        for inode_id in &report.orphan_inodes {
            executor.schedule_finalize(*inode_id);
        }

        let event_task = cache.spawn_event_task();

        let ctx = OpContext {
            cache: cache.clone(),
            sync: sync.clone(),
            handles: Arc::new(HandleTable::new()),
            executor: executor.clone(),
        };

        info!(
            "mounted cache_root={} remote={}",
            cfg.cache_root.to_string_lossy(),
            cfg.remote_endpoint
        );
        Ok(Mount {
            cfg,
            ctx,
            cache,
            sync,
            meta,
            executor,
            state,
            event_task,
            _cache_lock: cache_lock,
        })
    }

    pub fn context(&self) -> &OpContext {
        &self.ctx
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn state(&self) -> &Arc<MountState> {
        &self.state
    }

    /// Run one POSIX operation through the bounded op pool.
    pub async fn apply(&self, caller: &Caller, req: FsRequest) -> FsResult<FsReply> {
        let _slot = self.executor.op_slot().await?;
        ops::apply(&self.ctx, caller, req).await
    }

    /// Drain dirty state upstream, stop the background tasks, and record a
    /// clean shutdown. Dirty inodes that cannot be pushed (degraded mode)
    /// stay queued; the marker is then withheld so the next mount sweeps.
    pub async fn unmount(self) -> FsResult<()> {
        if !self.state.is_read_only() {
            self.executor.drain_dirty(&self.sync, &self.meta).await?;
        }
        self.executor.shutdown();
        self.event_task.abort();

        let drained = self.meta.list_dirty()?.is_empty();
        if drained {
            sweep::mark_clean_shutdown(&self.cfg.cache_root)?;
        } else {
            warn!("unmount: dirty inodes remain, withholding clean-shutdown marker");
        }
        info!("unmounted {}", self.cfg.cache_root.to_string_lossy());
        Ok(())
    }
}
