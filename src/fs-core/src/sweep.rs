use fs2::FileExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use block_store::BlockStore;
use fs_meta::InodeStore;
use fs_types::{unix_timestamp, FsError, FsResult, InodeId};

const STATE_FILE_NAME: &str = "state.json";
const LOCK_FILE_NAME: &str = "lock";
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    schema_version: u32,
    clean_shutdown: bool,
    last_mount_ts: u64,
}

/// What the startup consistency sweep found and queued.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub clean_shutdown: bool,
    pub orphan_blocks_removed: usize,
    /// Inodes with dirty local state needing an upstream push.
    pub dirty_inodes: Vec<InodeId>,
    /// Unlinked inodes whose remote delete is still owed.
    pub orphan_inodes: Vec<InodeId>,
}

/// One mount owns a cache directory at a time: take an exclusive advisory
/// lock on `<cache_root>/lock`, failing fast when another daemon holds it.
pub fn acquire_cache_lock(cache_root: &Path) -> FsResult<std::fs::File> {
    std::fs::create_dir_all(cache_root)
        .map_err(|e| FsError::IoError(format!("create cache root failed: {}", e)))?;
    let lock_path = cache_root.join(LOCK_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| FsError::IoError(format!("open cache lock failed: {}", e)))?;
    file.try_lock_exclusive().map_err(|_| {
        FsError::Busy(format!(
            "cache root {} is locked by another mount",
            cache_root.to_string_lossy()
        ))
    })?;
    Ok(file)
}

fn read_state_file(cache_root: &Path) -> Option<StateFile> {
    let path = cache_root.join(STATE_FILE_NAME);
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<StateFile>(&content) {
        Ok(state) if state.schema_version == SCHEMA_VERSION => Some(state),
        Ok(state) => {
            warn!("sweep: unknown state schema {}, forcing full sweep", state.schema_version);
            None
        }
        Err(e) => {
            warn!("sweep: unreadable state file, forcing full sweep: {}", e);
            None
        }
    }
}

fn write_state_file(cache_root: &Path, clean_shutdown: bool) -> FsResult<()> {
    let state = StateFile {
        schema_version: SCHEMA_VERSION,
        clean_shutdown,
        last_mount_ts: unix_timestamp(),
    };
    let content = serde_json::to_string(&state).map_err(|e| FsError::Internal(e.to_string()))?;
    std::fs::write(cache_root.join(STATE_FILE_NAME), content)
        .map_err(|e| FsError::IoError(format!("write state file failed: {}", e)))?;
    Ok(())
}

/// Startup consistency sweep. When the previous shutdown was not clean,
/// verify every block's inode exists (orphans are garbage collected), make
/// sure every dirty block is covered by a pending push plan, and queue
/// every unlinked inode for remote delete. Marks the mount in-progress so
/// a crash before `mark_clean_shutdown` triggers the sweep again.
pub async fn startup_sweep(
    cache_root: &Path,
    blocks: &Arc<BlockStore>,
    meta: &Arc<InodeStore>,
) -> FsResult<SweepReport> {
    let mut report = SweepReport {
        clean_shutdown: read_state_file(cache_root)
            .map(|s| s.clean_shutdown)
            .unwrap_or(false),
        ..Default::default()
    };

    if !report.clean_shutdown {
        info!("sweep: no clean-shutdown marker, running full consistency sweep");
        let entries = blocks.scan().await?;

        let mut inode_blocks: HashMap<InodeId, Vec<(u64, bool)>> = HashMap::new();
        for entry in entries {
            inode_blocks
                .entry(entry.inode_id)
                .or_default()
                .push((entry.index, entry.meta.dirty));
        }

        let mut dirty_pending: HashSet<InodeId> = HashSet::new();
        for (inode_id, blocks_of) in inode_blocks {
            match meta.try_get(inode_id)? {
                None => {
                    // I1: blocks without an inode row are garbage.
                    blocks.remove_inode(inode_id).await?;
                    report.orphan_blocks_removed += blocks_of.len();
                }
                Some(record) => {
                    let has_dirty = blocks_of.iter().any(|(_, dirty)| *dirty);
                    if has_dirty {
                        dirty_pending.insert(inode_id);
                        if record.dirty_mask.is_clean() {
                            // The row lost its dirty mark (crash between the
                            // block write and the row update); restore it so
                            // the push plan exists.
                            let mut updated = record.clone();
                            updated.dirty_mask.mark_data();
                            updated.version += 1;
                            if let Err(e) = meta.update(&updated, record.version) {
                                warn!("sweep: re-marking inode {} dirty failed: {}", inode_id, e);
                            }
                        }
                    }
                }
            }
        }
        report.dirty_inodes = dirty_pending.into_iter().collect();
    } else {
        report.dirty_inodes = meta.list_dirty()?;
    }

    report.orphan_inodes = meta.list_orphans()?;
    write_state_file(cache_root, false)?;

    info!(
        "sweep: done (clean_shutdown={}, orphan_blocks={}, dirty={}, orphans={})",
        report.clean_shutdown,
        report.orphan_blocks_removed,
        report.dirty_inodes.len(),
        report.orphan_inodes.len()
    );
    Ok(report)
}

/// Record that dirty state was drained and shutdown is orderly.
pub fn mark_clean_shutdown(cache_root: &Path) -> FsResult<()> {
    write_state_file(cache_root, true)
}
