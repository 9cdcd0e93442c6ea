use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use block_store::BlockStore;
use coord_store::{CoordEvent, CoordStore, EVENT_CHANNEL};
use fs_meta::InodeStore;
use fs_types::{
    block_slices, unix_timestamp, unix_timestamp_ms, FsConfig, FsError, FsResult, InodeId,
    InodeKind,
};

use crate::locks::InodeLocks;
use crate::sync::SyncEngine;
use crate::MountState;

const PULL_READ_RETRIES: u32 = 2;
const CAPACITY_ROUNDS: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct Residency {
    len: u32,
    dirty: bool,
    last_access_ms: u64,
}

/// Composes BlockStore, InodeStore and CoordStore into the block cache:
/// range resolution, write staging, capacity enforcement, TTL freshness and
/// invalidation. Callers serialize per inode through `lock_inode`.
pub struct CacheManager {
    cfg: FsConfig,
    blocks: Arc<BlockStore>,
    meta: Arc<InodeStore>,
    coord: Arc<dyn CoordStore>,
    locks: Arc<InodeLocks>,
    sync: Arc<SyncEngine>,
    state: Arc<MountState>,
    usage: AtomicU64,
    residency: Mutex<HashMap<(InodeId, u64), Residency>>,
}

impl CacheManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: FsConfig,
        blocks: Arc<BlockStore>,
        meta: Arc<InodeStore>,
        coord: Arc<dyn CoordStore>,
        locks: Arc<InodeLocks>,
        sync: Arc<SyncEngine>,
        state: Arc<MountState>,
    ) -> Self {
        Self {
            cfg,
            blocks,
            meta,
            coord,
            locks,
            sync,
            state,
            usage: AtomicU64::new(0),
            residency: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.cfg
    }

    pub fn inodes(&self) -> &Arc<InodeStore> {
        &self.meta
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn mount_state(&self) -> &Arc<MountState> {
        &self.state
    }

    pub async fn lock_inode(&self, inode_id: InodeId) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.lock(inode_id).await
    }

    pub fn usage_bytes(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.residency
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.dirty)
            .map(|r| r.len as u64)
            .sum()
    }

    /// Rebuild the residency index from disk. Called once at mount, after
    /// the consistency sweep.
    pub async fn seed_residency(&self) -> FsResult<()> {
        let entries = self.blocks.scan().await?;
        let mut residency = self.residency.lock().unwrap();
        residency.clear();
        let mut total = 0u64;
        for entry in entries {
            total += entry.meta.length as u64;
            residency.insert(
                (entry.inode_id, entry.index),
                Residency {
                    len: entry.meta.length,
                    dirty: entry.meta.dirty,
                    last_access_ms: entry.meta.last_access_ts * 1000,
                },
            );
        }
        self.usage.store(total, Ordering::SeqCst);
        info!(
            "CacheManager: seeded {} resident blocks, {} bytes",
            residency.len(),
            total
        );
        Ok(())
    }

    /// Re-read one inode's sidecars into the residency index, after a pull
    /// or push changed dirty bits behind our back.
    pub async fn refresh_inode_residency(&self, inode_id: InodeId) -> FsResult<()> {
        let entries = self.blocks.iterate(inode_id).await?;
        let mut residency = self.residency.lock().unwrap();
        let stale_keys: Vec<(InodeId, u64)> = residency
            .keys()
            .filter(|(ino, _)| *ino == inode_id)
            .copied()
            .collect();
        for key in &stale_keys {
            if let Some(old) = residency.remove(key) {
                self.usage.fetch_sub(old.len as u64, Ordering::SeqCst);
            }
        }
        for entry in entries {
            self.usage.fetch_add(entry.meta.length as u64, Ordering::SeqCst);
            residency.insert(
                (inode_id, entry.index),
                Residency {
                    len: entry.meta.length,
                    dirty: entry.meta.dirty,
                    last_access_ms: entry.meta.last_access_ts * 1000,
                },
            );
        }
        Ok(())
    }

    fn note_block_write(&self, inode_id: InodeId, index: u64, end: u32) {
        let mut residency = self.residency.lock().unwrap();
        let entry = residency.entry((inode_id, index)).or_insert(Residency {
            len: 0,
            dirty: false,
            last_access_ms: 0,
        });
        if end > entry.len {
            self.usage.fetch_add((end - entry.len) as u64, Ordering::SeqCst);
            entry.len = end;
        }
        entry.dirty = true;
        entry.last_access_ms = unix_timestamp_ms();
    }

    fn note_block_evicted(&self, inode_id: InodeId, index: u64) {
        let mut residency = self.residency.lock().unwrap();
        if let Some(old) = residency.remove(&(inode_id, index)) {
            self.usage.fetch_sub(old.len as u64, Ordering::SeqCst);
        }
    }

    fn touch_block(&self, inode_id: InodeId, index: u64) {
        let mut residency = self.residency.lock().unwrap();
        if let Some(entry) = residency.get_mut(&(inode_id, index)) {
            entry.last_access_ms = unix_timestamp_ms();
        }
    }

    /// Resolve `(inode, offset, length)` against the cache: figure out the
    /// covering blocks, evict the expired, pull the missing, and assemble
    /// the bytes in order. The caller holds the inode mutex and has clamped
    /// the range to the inode size.
    pub async fn read_range(
        &self,
        inode_id: InodeId,
        offset: u64,
        length: u64,
    ) -> FsResult<Vec<u8>> {
        let record = self.meta.get(inode_id)?;
        if offset >= record.size {
            return Ok(Vec::new());
        }
        let length = length.min(record.size - offset);
        if length == 0 {
            return Ok(Vec::new());
        }

        let block_size = self.blocks.block_size();
        let slices = block_slices(offset, length, block_size);

        let now = unix_timestamp();
        let ttl = self.cfg.block_ttl_secs;
        let resident: HashMap<u64, (bool, u64)> = self
            .blocks
            .iterate(inode_id)
            .await?
            .into_iter()
            .map(|e| (e.index, (e.meta.dirty, e.meta.last_access_ts)))
            .collect();

        let mut missing: Vec<u64> = Vec::new();
        for slice in &slices {
            match resident.get(&slice.index) {
                Some((true, _)) => {}
                Some(_) if record.remote_ref.is_none() => {}
                Some((false, last_access)) if now.saturating_sub(*last_access) < ttl => {}
                Some(_) => {
                    // Present but expired: drop it and fetch fresh bytes.
                    self.blocks.evict(inode_id, slice.index).await?;
                    self.note_block_evicted(inode_id, slice.index);
                    missing.push(slice.index);
                }
                None => {
                    if record.remote_ref.is_some() {
                        missing.push(slice.index);
                    }
                }
            }
        }

        if !missing.is_empty() {
            // Best-effort reservation: reads evict cold clean blocks to make
            // room for the pull but never force a flush (the caller holds
            // this inode's mutex, and a forced push elsewhere could wait on
            // another reader doing the same).
            self.evict_clean_lru(missing.len() as u64 * block_size as u64, Some(inode_id))
                .await?;

            let span = *missing.first().unwrap()..*missing.last().unwrap() + 1;
            let mut attempt = 0;
            loop {
                match self.sync.pull_downstream(inode_id, Some(span.clone())).await {
                    Ok(()) => break,
                    Err(FsError::BackendUnavailable(msg)) if attempt < PULL_READ_RETRIES => {
                        attempt += 1;
                        warn!("CacheManager: pull retry {} for inode {}: {}", attempt, inode_id, msg);
                        tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.refresh_inode_residency(inode_id).await?;
        }

        let mut buf = Vec::with_capacity(length as usize);
        for slice in &slices {
            match self.blocks.read_block(inode_id, slice.index).await? {
                Some(data) => {
                    let start = slice.block_offset as usize;
                    let end = start + slice.len as usize;
                    if start < data.len() {
                        let avail_end = end.min(data.len());
                        buf.extend_from_slice(&data[start..avail_end]);
                        buf.resize(buf.len() + (end - avail_end), 0);
                    } else {
                        buf.resize(buf.len() + slice.len as usize, 0);
                    }
                    self.touch_block(inode_id, slice.index);
                }
                // Within the logical size but with no local or remote bytes:
                // a locally extended sparse region reads as zeros.
                None => buf.resize(buf.len() + slice.len as usize, 0),
            }
        }
        Ok(buf)
    }

    /// Stage a write: apply the bytes to blocks marked dirty under the next
    /// version, then advance the inode's size/mtime/ctime/version and dirty
    /// mask. Caller holds the inode mutex and has reserved capacity.
    pub async fn write_range(
        &self,
        inode_id: InodeId,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let block_size = self.blocks.block_size();

        loop {
            let record = self.meta.get(inode_id)?;
            if record.kind != InodeKind::File {
                return Err(FsError::IsDir(format!("inode {} is not a file", inode_id)));
            }
            let new_version = record.version + 1;

            // POSIX write-past-end: the gap becomes zero bytes.
            if offset > record.size {
                self.pad_zero_blocks(inode_id, record.size, offset, new_version).await?;
            }

            let slices = block_slices(offset, data.len() as u64, block_size);

            // A partial overwrite of a block that still lives only upstream
            // must fetch it first, or the untouched bytes would be lost.
            if record.remote_ref.is_some() {
                let resident: std::collections::HashSet<u64> = self
                    .blocks
                    .iterate(inode_id)
                    .await?
                    .into_iter()
                    .map(|e| e.index)
                    .collect();
                for slice in &slices {
                    let block_start = slice.index * block_size as u64;
                    let covered = slice.block_offset == 0
                        && (slice.len as u64 == block_size as u64
                            || block_start + slice.len as u64 >= record.size);
                    if !covered && !resident.contains(&slice.index) && block_start < record.size {
                        self.sync
                            .pull_downstream(inode_id, Some(slice.index..slice.index + 1))
                            .await?;
                    }
                }
            }

            let mut consumed = 0usize;
            for slice in &slices {
                let chunk = &data[consumed..consumed + slice.len as usize];
                self.blocks
                    .write_block(inode_id, slice.index, slice.block_offset, chunk, new_version)
                    .await?;
                self.note_block_write(inode_id, slice.index, slice.block_offset + slice.len);
                consumed += slice.len as usize;
            }

            let mut updated = record.clone();
            updated.size = record.size.max(offset + data.len() as u64);
            updated.touch_mtime();
            updated.version = new_version;
            updated.dirty_mask.mark_data();
            match self.meta.update(&updated, record.version) {
                Ok(()) => {
                    self.sync.note_dirty(inode_id);
                    return Ok(data.len());
                }
                Err(FsError::Stale(_)) => {
                    // A pull bumped the version between our read and commit;
                    // restage under the fresh version.
                    debug!("CacheManager: write staging raced a pull on inode {}", inode_id);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pad_zero_blocks(
        &self,
        inode_id: InodeId,
        from: u64,
        to: u64,
        version: u64,
    ) -> FsResult<()> {
        let block_size = self.blocks.block_size();
        let zeros = vec![0u8; block_size as usize];
        for slice in block_slices(from, to - from, block_size) {
            self.blocks
                .write_block(
                    inode_id,
                    slice.index,
                    slice.block_offset,
                    &zeros[..slice.len as usize],
                    version,
                )
                .await?;
            self.note_block_write(inode_id, slice.index, slice.block_offset + slice.len);
        }
        Ok(())
    }

    /// Truncate to `new_size`: drop blocks past the end (shortening the new
    /// final block), or zero-extend when growing. Caller holds the mutex.
    pub async fn truncate(&self, inode_id: InodeId, new_size: u64) -> FsResult<()> {
        loop {
            let record = self.meta.get(inode_id)?;
            if record.kind != InodeKind::File {
                return Err(FsError::IsDir(format!("inode {} is not a file", inode_id)));
            }
            if record.size == new_size {
                return Ok(());
            }
            let new_version = record.version + 1;

            if new_size < record.size {
                self.blocks.truncate_blocks(inode_id, new_size).await?;
            } else {
                self.pad_zero_blocks(inode_id, record.size, new_size, new_version).await?;
            }

            let mut updated = record.clone();
            updated.size = new_size;
            updated.touch_mtime();
            updated.version = new_version;
            updated.dirty_mask.mark_data();
            match self.meta.update(&updated, record.version) {
                Ok(()) => {
                    self.refresh_inode_residency(inode_id).await?;
                    self.sync.note_dirty(inode_id);
                    return Ok(());
                }
                Err(FsError::Stale(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Evict clean blocks in scored-LRU order until `additional` bytes fit,
    /// tolerating a shortfall. Dirty blocks are never touched; neither are
    /// blocks of `protect` (the inode whose read is being served, so the
    /// reservation cannot evict what the read is about to assemble).
    async fn evict_clean_lru(&self, additional: u64, protect: Option<InodeId>) -> FsResult<()> {
        if self.cfg.cache_bytes_max == 0 {
            return Ok(());
        }
        let usage = self.usage.load(Ordering::SeqCst);
        if usage + additional <= self.cfg.cache_bytes_max {
            return Ok(());
        }
        let mut need = usage + additional - self.cfg.cache_bytes_max;

        let mut victims: Vec<((InodeId, u64), u32, u64)> = {
            let residency = self.residency.lock().unwrap();
            residency
                .iter()
                .filter(|((inode_id, _), r)| !r.dirty && Some(*inode_id) != protect)
                .map(|(key, r)| (*key, r.len, r.last_access_ms))
                .collect()
        };
        victims.sort_by(|a, b| a.2.cmp(&b.2).then(b.1.cmp(&a.1)));

        for ((inode_id, index), len, _) in victims {
            if need == 0 {
                break;
            }
            match self.blocks.evict(inode_id, index).await {
                Ok(()) => {
                    self.note_block_evicted(inode_id, index);
                    need = need.saturating_sub(len as u64);
                }
                Err(FsError::Busy(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Make room for `additional` bytes. Victims are clean blocks in
    /// approximate LRU order, size-weighted so large cold blocks go first.
    /// Dirty blocks are never evicted; when nothing clean remains, the inode
    /// holding the most dirty bytes is synchronously pushed and the pass
    /// retried. `exclude` shields the inode the caller currently holds.
    pub async fn ensure_capacity(
        &self,
        additional: u64,
        exclude: Option<InodeId>,
    ) -> FsResult<()> {
        if self.cfg.cache_bytes_max == 0 {
            return Ok(());
        }

        for _ in 0..CAPACITY_ROUNDS {
            self.evict_clean_lru(additional, None).await?;
            let usage = self.usage.load(Ordering::SeqCst);
            if usage + additional <= self.cfg.cache_bytes_max {
                return Ok(());
            }

            // Nothing clean left: force a flush of the dirtiest inode.
            let victim_inode = {
                let residency = self.residency.lock().unwrap();
                let mut per_inode: HashMap<InodeId, u64> = HashMap::new();
                for ((inode_id, _), r) in residency.iter() {
                    if r.dirty && Some(*inode_id) != exclude {
                        *per_inode.entry(*inode_id).or_insert(0) += r.len as u64;
                    }
                }
                per_inode.into_iter().max_by_key(|(_, bytes)| *bytes).map(|(id, _)| id)
            };
            match victim_inode {
                Some(victim) => {
                    info!("CacheManager: cache full, forcing push of inode {}", victim);
                    match self.sync.push_upstream(victim).await {
                        Ok(()) | Err(FsError::Busy(_)) => {}
                        Err(e) => {
                            return Err(FsError::CacheFull(format!(
                                "dirty data could not be drained: {}",
                                e
                            )))
                        }
                    }
                    self.refresh_inode_residency(victim).await?;
                }
                None => {
                    return Err(FsError::CacheFull(
                        "no clean blocks and no flushable inode".to_string(),
                    ))
                }
            }
        }
        Err(FsError::CacheFull("eviction could not free enough space".to_string()))
    }

    /// React to a remote-side mutation: purge the inode's clean blocks (its
    /// dirty blocks stay, they are local truth) and adopt the successor
    /// capability when the event carried one.
    pub async fn apply_invalidation(
        &self,
        inode_id: InodeId,
        new_ref: Option<String>,
    ) -> FsResult<()> {
        for entry in self.blocks.iterate(inode_id).await? {
            if !entry.meta.dirty {
                match self.blocks.evict(inode_id, entry.index).await {
                    Ok(()) => self.note_block_evicted(inode_id, entry.index),
                    // Raced a write that just dirtied it; local truth wins.
                    Err(FsError::Busy(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(new_ref) = new_ref {
            let _guard = self.locks.lock(inode_id).await;
            loop {
                let record = self.meta.get(inode_id)?;
                if record.remote_ref.as_deref() == Some(new_ref.as_str()) {
                    break;
                }
                let mut updated = record.clone();
                updated.remote_ref = Some(new_ref.clone());
                updated.version += 1;
                match self.meta.update(&updated, record.version) {
                    Ok(()) => break,
                    Err(FsError::Stale(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Administrative invalidation of an inode or a whole subtree: stale
    /// blocks are dropped and will re-pull on next access.
    pub fn invalidate<'a>(
        &'a self,
        inode_id: InodeId,
        recursive: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = FsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.apply_invalidation(inode_id, None).await?;
            if recursive {
                if let Some(record) = self.meta.try_get(inode_id)? {
                    if record.kind == InodeKind::Dir {
                        for child in self.meta.list_children(inode_id)? {
                            self.invalidate(child.child_id, true).await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Evict every clean block. Dirty blocks are untouched, so no
    /// acknowledged write is lost. Consults the sidecars directly, so blocks
    /// a just-finished push cleaned are dropped too.
    pub async fn drop_clean_cache(&self) -> FsResult<()> {
        for entry in self.blocks.scan().await? {
            if !entry.meta.dirty {
                match self.blocks.evict(entry.inode_id, entry.index).await {
                    Ok(()) => self.note_block_evicted(entry.inode_id, entry.index),
                    Err(FsError::Busy(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Subscribe to coordination events and keep the cache honest: remote
    /// mutations invalidate blocks, directory changes schedule listing
    /// refreshes, degradation flips the mount read-only.
    pub fn spawn_event_task(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut rx = match cache.coord.subscribe(EVENT_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("CacheManager: event subscription failed: {}", e);
                    return;
                }
            };
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = cache.handle_event(event).await {
                            warn!("CacheManager: event handling failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("CacheManager: event stream lagged, {} missed", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_event(&self, event: CoordEvent) -> FsResult<()> {
        match event {
            CoordEvent::RemoteChanged { inode_id, new_ref } => {
                self.apply_invalidation(inode_id, new_ref).await
            }
            CoordEvent::DirChanged { inode_id } => {
                self.sync.pull_downstream(inode_id, None).await
            }
            CoordEvent::Degraded { reason } => {
                self.state.enter_degraded(reason);
                Ok(())
            }
            CoordEvent::Pulled { inode_id, .. } | CoordEvent::Pushed { inode_id, .. } => {
                self.refresh_inode_residency(inode_id).await
            }
        }
    }
}
