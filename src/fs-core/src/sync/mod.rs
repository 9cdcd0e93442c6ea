mod hooks;
mod merge;
mod state;

pub use hooks::{NoopHooks, SyncHooks};
pub use merge::{LastWriterWins, MergePolicy};
pub use state::{SyncState, SyncStateMap};

use futures_util::{stream, StreamExt};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use block_store::BlockStore;
use coord_store::{CoordEvent, CoordStore, LockGuard, EVENT_CHANNEL};
use fs_meta::InodeStore;
use fs_types::{
    block_count, unix_timestamp, FsConfig, FsError, FsResult, InodeId, InodeKind, InodeRecord,
};
use remote_client::{ObjectRef, RemoteBackend, RemoteDirEntry};

use crate::locks::InodeLocks;
use crate::MountState;

const PUSH_BACKOFF_BASE_MS: u64 = 100;
const PUSH_BACKOFF_CAP_MS: u64 = 5_000;

fn push_lock_key(inode_id: InodeId) -> String {
    format!("push:{}", inode_id)
}

fn pull_lease_key(inode_id: InodeId) -> String {
    format!("lease:pull:{}", inode_id)
}

fn backoff_delay(attempt: u32) -> Duration {
    let ms = PUSH_BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(ms.min(PUSH_BACKOFF_CAP_MS))
}

struct PushSnapshot {
    record: InodeRecord,
    dirty_indices: Vec<u64>,
}

/// Bidirectional reconciler between the local cache and the remote object
/// store. Every operation runs the hook triad: `before` acquires the
/// coordination lease or lock, the main phase moves the bytes, `after`
/// publishes the outcome and releases.
pub struct SyncEngine {
    cfg: FsConfig,
    blocks: Arc<BlockStore>,
    meta: Arc<InodeStore>,
    coord: Arc<dyn CoordStore>,
    backend: Arc<dyn RemoteBackend>,
    locks: Arc<InodeLocks>,
    mount_state: Arc<MountState>,
    states: SyncStateMap,
    hooks: Arc<dyn SyncHooks>,
    merge: Arc<dyn MergePolicy>,
    pull_global: Arc<Semaphore>,
    pull_inode: Mutex<HashMap<InodeId, Arc<Semaphore>>>,
    push_global: Arc<Semaphore>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: FsConfig,
        blocks: Arc<BlockStore>,
        meta: Arc<InodeStore>,
        coord: Arc<dyn CoordStore>,
        backend: Arc<dyn RemoteBackend>,
        locks: Arc<InodeLocks>,
        mount_state: Arc<MountState>,
        hooks: Arc<dyn SyncHooks>,
        merge: Arc<dyn MergePolicy>,
    ) -> Self {
        let pull_global = Arc::new(Semaphore::new(cfg.pull_global_limit));
        let push_global = Arc::new(Semaphore::new(cfg.push_global_limit));
        Self {
            cfg,
            blocks,
            meta,
            coord,
            backend,
            locks,
            mount_state,
            states: SyncStateMap::new(),
            hooks,
            merge,
            pull_global,
            pull_inode: Mutex::new(HashMap::new()),
            push_global,
        }
    }

    pub fn states(&self) -> &SyncStateMap {
        &self.states
    }

    pub fn meta(&self) -> &Arc<InodeStore> {
        &self.meta
    }

    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    /// Record that local writes landed; the flush loop will pick it up.
    pub fn note_dirty(&self, inode_id: InodeId) {
        self.states.set(inode_id, SyncState::Dirty);
    }

    fn pull_inode_sem(&self, inode_id: InodeId) -> Arc<Semaphore> {
        let mut sems = self.pull_inode.lock().unwrap();
        sems.entry(inode_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.cfg.pull_inode_limit)))
            .clone()
    }

    async fn publish(&self, event: CoordEvent) {
        if let Err(e) = self.coord.publish(EVENT_CHANNEL, &event).await {
            warn!("SyncEngine: publish event failed: {}", e);
        }
    }

    /// Hydrate the cache from the remote. For files, fetches the missing
    /// blocks of `span` (all blocks when None); adjacent misses are combined
    /// into single ranged reads. For directories, pulls the remote listing
    /// and atomically replaces the local child set.
    pub async fn pull_downstream(
        &self,
        inode_id: InodeId,
        span: Option<Range<u64>>,
    ) -> FsResult<()> {
        self.hooks.before_pull(inode_id).await?;

        // A shared lease: any number of pulls may hold it concurrently; the
        // counter keeps push-side diagnostics honest.
        let lease_key = pull_lease_key(inode_id);
        self.coord.counter_incr(&lease_key, 1).await?;

        let prior_state = self.states.get(inode_id);
        self.states.set(inode_id, SyncState::Pulling);

        let result = self.pull_main(inode_id, span).await;

        self.states.set(
            inode_id,
            match prior_state {
                SyncState::Dirty => SyncState::Dirty,
                _ => SyncState::Idle,
            },
        );
        self.coord.counter_incr(&lease_key, -1).await?;

        match &result {
            Ok(pulled) => {
                if *pulled {
                    let version = self.meta.get(inode_id).map(|r| r.version).unwrap_or(0);
                    self.publish(CoordEvent::Pulled { inode_id, version }).await;
                }
            }
            Err(e) => warn!("SyncEngine: pull of inode {} failed: {}", inode_id, e),
        }
        self.hooks.after_pull(inode_id, result.is_ok()).await;
        result.map(|_| ())
    }

    /// Main pull phase. Returns whether anything was actually refreshed.
    async fn pull_main(&self, inode_id: InodeId, span: Option<Range<u64>>) -> FsResult<bool> {
        let record = self.meta.get(inode_id)?;
        match record.kind {
            InodeKind::File => self.pull_file(&record, span).await,
            InodeKind::Dir => self.pull_dir(&record).await,
            InodeKind::Symlink => Ok(false),
        }
    }

    async fn pull_file(&self, record: &InodeRecord, span: Option<Range<u64>>) -> FsResult<bool> {
        let Some(remote_ref) = record.remote_ref.clone() else {
            return Ok(false);
        };
        let block_size = self.blocks.block_size() as u64;
        let total_blocks = block_count(record.size, self.blocks.block_size());
        let span = span.unwrap_or(0..total_blocks);
        let span = span.start..span.end.min(total_blocks);

        let present: HashSet<u64> = self
            .blocks
            .iterate(record.inode_id)
            .await?
            .into_iter()
            .map(|e| e.index)
            .collect();
        let missing: Vec<u64> = span.filter(|idx| !present.contains(idx)).collect();
        if missing.is_empty() {
            return Ok(false);
        }

        let ranges = fs_types::coalesce_indices(&missing);
        let obj = ObjectRef::new(remote_ref);
        let inode_id = record.inode_id;
        let inode_sem = self.pull_inode_sem(inode_id);

        let fetches = ranges.into_iter().map(|range| {
            let obj = obj.clone();
            let inode_sem = inode_sem.clone();
            async move {
                let _inode_permit = inode_sem
                    .acquire()
                    .await
                    .map_err(|_| FsError::Internal("pull semaphore closed".to_string()))?;
                let _global_permit = self
                    .pull_global
                    .acquire()
                    .await
                    .map_err(|_| FsError::Internal("pull semaphore closed".to_string()))?;
                let byte_range = range.start * block_size..range.end * block_size;
                let bytes = self.backend.get_object(&obj, Some(byte_range)).await?;

                let mut installed = 0usize;
                for idx in range.clone() {
                    let off = ((idx - range.start) * block_size) as usize;
                    if off >= bytes.len() {
                        break;
                    }
                    let end = (off + block_size as usize).min(bytes.len());
                    self.blocks
                        .install_pulled_block(inode_id, idx, &bytes[off..end], None)
                        .await?;
                    installed += 1;
                }
                Ok::<usize, FsError>(installed)
            }
        });

        let results: Vec<FsResult<usize>> = stream::iter(fetches)
            .buffer_unordered(self.cfg.pull_inode_limit.max(1))
            .collect()
            .await;

        let mut installed = 0usize;
        for result in results {
            installed += result?;
        }
        if installed == 0 {
            return Ok(false);
        }

        self.bump_version_after_pull(inode_id)?;
        debug!("SyncEngine: pulled {} blocks for inode {}", installed, inode_id);
        Ok(true)
    }

    async fn pull_dir(&self, record: &InodeRecord) -> FsResult<bool> {
        let Some(remote_ref) = record.remote_ref.clone() else {
            return Ok(false);
        };
        let inode_id = record.inode_id;
        let remote_entries = self.backend.get_dir(&ObjectRef::new(remote_ref)).await?;

        let tombstones = self.meta.list_tombstones(inode_id)?;
        let local = self.meta.list_children(inode_id)?;

        // Resolve remote names to local inode ids, discovering new inodes on
        // first sight.
        let mut resolved: Vec<(String, InodeId)> = Vec::new();
        for entry in &remote_entries {
            if tombstones.iter().any(|t| t == &entry.name) {
                continue;
            }
            let child_id = match self.meta.get_by_path(inode_id, &entry.name)? {
                Some(child) => {
                    // Refresh the remote ref of clean children; dirty ones
                    // keep local authority until their push resolves.
                    if child.dirty_mask.is_clean()
                        && child.remote_ref.as_deref() != Some(entry.child_ref.as_str())
                    {
                        let mut updated = child.clone();
                        updated.remote_ref = Some(entry.child_ref.as_str().to_string());
                        if let Some(size) = entry.size {
                            updated.size = size;
                        }
                        updated.version += 1;
                        if let Err(e) = self.meta.update(&updated, child.version) {
                            debug!(
                                "SyncEngine: child {} ref refresh skipped: {}",
                                child.inode_id, e
                            );
                        }
                    }
                    child.inode_id
                }
                None => {
                    let mut discovered = match entry.kind {
                        InodeKind::Dir => {
                            InodeRecord::new_dir(Some(inode_id), &entry.name, 0o755, record.uid, record.gid)
                        }
                        _ => InodeRecord::new_file(inode_id, &entry.name, 0o644, record.uid, record.gid),
                    };
                    discovered.remote_ref = Some(entry.child_ref.as_str().to_string());
                    discovered.size = entry.size.unwrap_or(0);
                    self.meta.insert(&mut discovered)?
                }
            };
            resolved.push((entry.name.clone(), child_id));
        }

        // Local entries not yet known upstream survive the replacement.
        let local_authoritative: Vec<_> = local
            .iter()
            .filter(|e| {
                self.meta
                    .try_get(e.child_id)
                    .ok()
                    .flatten()
                    .map(|c| c.remote_ref.is_none() || !c.dirty_mask.is_clean())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let merged = self
            .merge
            .merge_children(&local_authoritative, &resolved, &tombstones);
        self.meta.replace_children(inode_id, &merged)?;

        self.bump_version_after_pull(inode_id)?;
        Ok(true)
    }

    /// A completed pull is a mutation: version increments, CAS-retried
    /// against concurrent writers.
    fn bump_version_after_pull(&self, inode_id: InodeId) -> FsResult<()> {
        loop {
            let record = self.meta.get(inode_id)?;
            let mut updated = record.clone();
            updated.version += 1;
            updated.last_sync_ts = unix_timestamp();
            match self.meta.update(&updated, record.version) {
                Ok(()) => return Ok(()),
                Err(FsError::Stale(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Upload an inode's dirty state. At most one push per inode is in
    /// flight, enforced through the coordination store; concurrent callers
    /// get `Busy`. A clean inode that has already been pushed is a no-op.
    pub async fn push_upstream(&self, inode_id: InodeId) -> FsResult<()> {
        self.hooks.before_push(inode_id).await?;

        let record = self.meta.get(inode_id)?;
        if record.dirty_mask.is_clean() && record.remote_ref.is_some() && record.nlink > 0 {
            self.hooks.after_push(inode_id, true).await;
            return Ok(());
        }
        if !self.states.can_push(inode_id) {
            self.hooks.after_push(inode_id, false).await;
            return Err(FsError::Busy(format!("inode {} sync in progress", inode_id)));
        }

        let lock_ttl = Duration::from_secs(self.cfg.lock_ttl_secs);
        let guard = match LockGuard::acquire(self.coord.clone(), &push_lock_key(inode_id), lock_ttl)
            .await?
        {
            Some(guard) => guard,
            None => {
                self.hooks.after_push(inode_id, false).await;
                return Err(FsError::Busy(format!("push already in flight for inode {}", inode_id)));
            }
        };

        self.states.set(inode_id, SyncState::Pushing);
        let result = self.push_main(inode_id, &guard).await;

        match &result {
            Ok(version) => {
                self.states.set(inode_id, SyncState::Idle);
                self.publish(CoordEvent::Pushed { inode_id, version: *version }).await;
            }
            Err(_) => self.states.set(inode_id, SyncState::Dirty),
        }

        if let Err(e) = guard.release().await {
            warn!("SyncEngine: push lock release failed: {}", e);
        }
        self.hooks.after_push(inode_id, result.is_ok()).await;
        result.map(|_| ())
    }

    /// Main push phase: snapshot, upload, CAS-commit; on a stale commit,
    /// rebase and retry with bounded attempts and exponential backoff.
    async fn push_main(&self, inode_id: InodeId, guard: &LockGuard) -> FsResult<u64> {
        let lock_ttl = Duration::from_secs(self.cfg.lock_ttl_secs);
        let mut attempt: u32 = 0;

        loop {
            guard.refresh(lock_ttl).await?;

            // Snapshot version and dirty set under the local per-inode mutex.
            let snapshot = {
                let _guard = self.locks.lock(inode_id).await;
                let record = self.meta.get(inode_id)?;
                let dirty_indices = self
                    .blocks
                    .iterate(inode_id)
                    .await?
                    .into_iter()
                    .filter(|e| e.meta.dirty)
                    .map(|e| e.index)
                    .collect();
                PushSnapshot { record, dirty_indices }
            };
            self.hooks.on_push_snapshot(inode_id).await;

            let record = &snapshot.record;
            if record.dirty_mask.is_clean() && record.remote_ref.is_some() {
                return Ok(record.version);
            }

            let uploaded = match record.kind {
                InodeKind::File => self.upload_file(record).await,
                InodeKind::Dir => self.upload_dir(record).await,
                InodeKind::Symlink => {
                    let target = record.symlink_target.clone().unwrap_or_default();
                    let _permit = self.upload_permit().await?;
                    self.backend.put_object(target.as_bytes()).await
                }
            };

            let new_ref = match uploaded {
                Ok(new_ref) => new_ref,
                Err(FsError::BackendUnavailable(msg)) => {
                    attempt += 1;
                    if attempt >= self.cfg.push_retry_limit {
                        let reason = format!(
                            "push of inode {} failed after {} attempts: {}",
                            inode_id, attempt, msg
                        );
                        self.mount_state.enter_degraded(reason.clone());
                        self.publish(CoordEvent::Degraded { reason: reason.clone() }).await;
                        return Err(FsError::BackendUnavailable(reason));
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut committed = record.clone();
            committed.remote_ref = Some(new_ref.as_str().to_string());
            committed.dirty_mask.clear();
            committed.last_sync_ts = unix_timestamp();

            match self.meta.update(&committed, record.version) {
                Ok(()) => {
                    // Bytes staged after the snapshot keep their dirty bit:
                    // the version gate in mark_clean rejects them and the
                    // commit CAS already proved no such writes exist.
                    for index in &snapshot.dirty_indices {
                        match self.blocks.mark_clean(inode_id, *index, record.version).await {
                            Ok(()) => {}
                            Err(FsError::Stale(_)) | Err(FsError::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    if record.kind == InodeKind::Dir {
                        self.meta.clear_tombstones(inode_id)?;
                    }
                    info!(
                        "SyncEngine: pushed inode {} at version {} -> {}",
                        inode_id, record.version, new_ref
                    );
                    return Ok(record.version);
                }
                Err(FsError::Stale(_)) => {
                    let current = self.meta.get(inode_id)?;
                    if current.remote_ref == record.remote_ref {
                        // A local write raced the commit; the fresh snapshot
                        // will carry it. The just-minted ref is discarded.
                        debug!("SyncEngine: local write raced push of inode {}, retrying", inode_id);
                        continue;
                    }
                    attempt += 1;
                    if attempt >= self.cfg.push_retry_limit {
                        return Err(FsError::Stale(format!(
                            "push of inode {} could not converge after {} attempts",
                            inode_id, attempt
                        )));
                    }
                    self.states.set(inode_id, SyncState::Rebasing);
                    self.rebase(inode_id, &current).await?;
                    self.states.set(inode_id, SyncState::Pushing);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The global upload bound applies to each backend write, not to a whole
    /// push: a directory push recurses into child pushes, and holding a
    /// permit across the recursion would let a deep tree starve the pool.
    async fn upload_permit(&self) -> FsResult<tokio::sync::SemaphorePermit<'_>> {
        self.push_global
            .acquire()
            .await
            .map_err(|_| FsError::Internal("push semaphore closed".to_string()))
    }

    /// Assemble the full logical content of a file from its blocks, pulling
    /// any block not yet resident. Blocks with no local or remote backing
    /// read as zeros (locally extended sparse regions).
    async fn upload_file(&self, record: &InodeRecord) -> FsResult<ObjectRef> {
        let block_size = self.blocks.block_size() as u64;
        let total_blocks = block_count(record.size, self.blocks.block_size());

        if record.remote_ref.is_some() {
            self.pull_file(record, Some(0..total_blocks)).await?;
        }

        let mut content = vec![0u8; record.size as usize];
        for entry in self.blocks.iterate(record.inode_id).await? {
            if entry.index >= total_blocks {
                continue;
            }
            if let Some(data) = self.blocks.read_block(record.inode_id, entry.index).await? {
                let start = (entry.index * block_size) as usize;
                let end = (start + data.len()).min(content.len());
                content[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        let _permit = self.upload_permit().await?;
        self.backend.put_object(&content).await
    }

    /// Apply the local child set to the remote. Children that have never
    /// been pushed are pushed first so every entry carries a capability.
    fn upload_dir<'a>(
        &'a self,
        record: &'a InodeRecord,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = FsResult<ObjectRef>> + Send + 'a>> {
        Box::pin(async move {
            let children = self.meta.list_children(record.inode_id)?;
            let mut entries = Vec::with_capacity(children.len());
            for child in children {
                let mut child_record = self.meta.get(child.child_id)?;
                if child_record.remote_ref.is_none() || !child_record.dirty_mask.is_clean() {
                    self.push_upstream(child.child_id).await?;
                    child_record = self.meta.get(child.child_id)?;
                }
                let child_ref = child_record.remote_ref.ok_or_else(|| {
                    FsError::Internal(format!("child {} has no ref after push", child.child_id))
                })?;
                entries.push(RemoteDirEntry {
                    name: child.name,
                    child_ref: ObjectRef::new(child_ref),
                    kind: child_record.kind,
                    size: Some(child_record.size),
                });
            }
            let prior = record.remote_ref.clone().map(ObjectRef::new);
            let _permit = self.upload_permit().await?;
            self.backend.put_dir(prior.as_ref(), &entries).await
        })
    }

    /// Pull the diverged remote state under the local dirty state and merge
    /// per the configured policy. Dirty blocks survive unconditionally; the
    /// next push attempt uploads the merged content.
    async fn rebase(&self, inode_id: InodeId, current: &InodeRecord) -> FsResult<()> {
        debug!("SyncEngine: rebasing inode {} onto {:?}", inode_id, current.remote_ref);
        match current.kind {
            InodeKind::File => {
                let total = block_count(current.size, self.blocks.block_size());
                self.pull_file(current, Some(0..total)).await?;
                // Reconcile the logical size under the merge policy.
                loop {
                    let record = self.meta.get(inode_id)?;
                    let merged_size = self.merge.merge_file_size(&record, current.size);
                    if merged_size == record.size {
                        break;
                    }
                    let mut updated = record.clone();
                    updated.size = merged_size;
                    updated.version += 1;
                    match self.meta.update(&updated, record.version) {
                        Ok(()) => break,
                        Err(FsError::Stale(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            InodeKind::Dir => self.pull_dir(current).await.map(|_| ()),
            InodeKind::Symlink => Ok(()),
        }
    }

    /// Push-delete an unlinked inode once its last handle has closed and
    /// destroy its local state.
    pub async fn finalize_orphan(&self, inode_id: InodeId) -> FsResult<()> {
        let Some(record) = self.meta.try_get(inode_id)? else {
            return Ok(());
        };
        if record.nlink > 0 {
            return Err(FsError::InvalidParam(format!(
                "inode {} still linked, refusing finalize",
                inode_id
            )));
        }

        self.states.set(inode_id, SyncState::Deleting);
        if let Some(remote_ref) = &record.remote_ref {
            match self.backend.delete(&ObjectRef::new(remote_ref.clone())).await {
                Ok(()) => {}
                Err(FsError::NotFound(_)) => {}
                Err(e) => {
                    // Leave the orphan row; the startup sweep re-queues it.
                    self.states.set(inode_id, SyncState::Idle);
                    return Err(e);
                }
            }
        }
        self.blocks.remove_inode(inode_id).await?;
        self.meta.delete(inode_id)?;
        self.states.forget(inode_id);
        self.locks.forget(inode_id);
        info!("SyncEngine: finalized orphan inode {}", inode_id);
        Ok(())
    }
}
