use log::warn;

use fs_types::{FsError, FsResult, HandleId, InodeId, InodeKind, InodeRecord};

use crate::handle::{Caller, OpenFlags};
use crate::ops::node::{create_child, update_record};
use crate::ops::{FileAttr, FsReply, OpContext};

const FSYNC_BUSY_RETRIES: u32 = 20;
const FSYNC_BUSY_DELAY_MS: u64 = 100;

pub(crate) async fn mknod(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
    mode: u32,
) -> FsResult<FsReply> {
    let record = InodeRecord::new_file(parent, name, mode & 0o7777, caller.uid, caller.gid);
    let record = create_child(ctx, caller, parent, record).await?;
    Ok(FsReply::Entry(FileAttr::from(&record)))
}

pub(crate) async fn create(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
    mode: u32,
    flags: OpenFlags,
) -> FsResult<FsReply> {
    let record = InodeRecord::new_file(parent, name, mode & 0o7777, caller.uid, caller.gid);
    let record = create_child(ctx, caller, parent, record).await?;
    let handle = ctx.handles.open(&record, caller, flags)?;
    Ok(FsReply::Created {
        handle,
        attr: FileAttr::from(&record),
    })
}

pub(crate) async fn open(
    ctx: &OpContext,
    caller: &Caller,
    inode: InodeId,
    flags: OpenFlags,
) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    if record.kind == InodeKind::Dir {
        return Err(FsError::IsDir(format!("inode {} is a directory", inode)));
    }
    if (flags.write || flags.append) && ctx.state().is_read_only() {
        return Err(FsError::ReadOnly(format!("open for write of inode {}", inode)));
    }
    let handle = ctx.handles.open(&record, caller, flags)?;
    Ok(FsReply::Handle(handle))
}

/// Clamped to the file size; never returns partial data except at EOF.
pub(crate) async fn read(
    ctx: &OpContext,
    handle: HandleId,
    offset: u64,
    size: u32,
) -> FsResult<FsReply> {
    let fh = ctx.handles.get_file(handle)?;
    if !fh.flags.read {
        return Err(FsError::PermissionDenied(format!("handle {} not open for read", handle)));
    }
    let _guard = ctx.cache.lock_inode(fh.inode_id).await;
    let data = ctx.cache.read_range(fh.inode_id, offset, size as u64).await?;
    Ok(FsReply::Data(data))
}

/// Returns the full byte count or an error; O_APPEND resolves the offset to
/// the current size under the inode mutex, atomically against concurrent
/// writers of the same inode.
pub(crate) async fn write(
    ctx: &OpContext,
    handle: HandleId,
    offset: u64,
    data: &[u8],
) -> FsResult<FsReply> {
    let fh = ctx.handles.get_file(handle)?;
    if !fh.flags.write && !fh.flags.append {
        return Err(FsError::PermissionDenied(format!("handle {} not open for write", handle)));
    }

    ctx.cache
        .ensure_capacity(data.len() as u64, Some(fh.inode_id))
        .await?;

    let _guard = ctx.cache.lock_inode(fh.inode_id).await;
    let offset = if fh.flags.append {
        ctx.meta().get(fh.inode_id)?.size
    } else {
        offset
    };
    let written = ctx.cache.write_range(fh.inode_id, offset, data).await?;
    Ok(FsReply::Written(written as u32))
}

pub(crate) async fn truncate(
    ctx: &OpContext,
    caller: &Caller,
    inode: InodeId,
    size: u64,
) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    crate::handle::check_access(&record, caller, libc::W_OK as u32)?;
    let grow = size.saturating_sub(record.size);
    if grow > 0 {
        ctx.cache.ensure_capacity(grow, Some(inode)).await?;
    }
    let _guard = ctx.cache.lock_inode(inode).await;
    ctx.cache.truncate(inode, size).await?;
    Ok(FsReply::None)
}

/// Close-time flush: kick off a push for dirty state but do not wait for
/// the upstream round trip.
pub(crate) fn flush(ctx: &OpContext, handle: HandleId) -> FsResult<FsReply> {
    let fh = ctx.handles.get_file(handle)?;
    let record = ctx.meta().get(fh.inode_id)?;
    if !record.dirty_mask.is_clean() {
        ctx.executor.schedule_push(fh.inode_id);
    }
    Ok(FsReply::None)
}

/// Forces a push and returns only after it succeeded or permanently failed;
/// this is the durability barrier, not merely a cache flush.
pub(crate) async fn fsync(ctx: &OpContext, handle: HandleId) -> FsResult<FsReply> {
    let fh = ctx.handles.get_file(handle)?;
    push_and_wait(ctx, fh.inode_id).await?;
    Ok(FsReply::None)
}

/// Run the push on its own task so a cancelled caller cannot cancel an
/// in-flight upload, and absorb Busy from a concurrent in-flight push by
/// waiting for the inode to come clean.
pub(crate) async fn push_and_wait(ctx: &OpContext, inode_id: InodeId) -> FsResult<()> {
    for _ in 0..FSYNC_BUSY_RETRIES {
        let sync = ctx.sync.clone();
        let joined = tokio::spawn(async move { sync.push_upstream(inode_id).await })
            .await
            .map_err(|e| FsError::Internal(format!("push task failed: {}", e)))?;
        match joined {
            Ok(()) => return Ok(()),
            Err(FsError::Busy(_)) => {
                tokio::time::sleep(std::time::Duration::from_millis(FSYNC_BUSY_DELAY_MS)).await;
                let record = ctx.meta().get(inode_id)?;
                if record.dirty_mask.is_clean() && record.remote_ref.is_some() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(FsError::Busy(format!("push of inode {} stayed contended", inode_id)))
}

pub(crate) async fn release(ctx: &OpContext, handle: HandleId) -> FsResult<FsReply> {
    let (inode_id, remaining) = ctx.handles.release(handle)?;
    if remaining == 0 {
        if let Some(record) = ctx.meta().try_get(inode_id)? {
            if record.nlink == 0 {
                // Orphaned while open; the last close finalizes it.
                if let Err(e) = ctx.sync.finalize_orphan(inode_id).await {
                    warn!("release: deferred finalize of inode {}: {}", inode_id, e);
                }
            }
        }
    }
    Ok(FsReply::None)
}
