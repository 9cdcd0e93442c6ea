use fs_types::{FsError, FsResult, HandleId, InodeId, InodeKind, InodeRecord};

use crate::handle::Caller;
use crate::ops::file::push_and_wait;
use crate::ops::node::{create_child, require_dir, update_record};
use crate::ops::{FileAttr, FsReply, OpContext};

pub(crate) async fn mkdir(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
    mode: u32,
) -> FsResult<FsReply> {
    let record = InodeRecord::new_dir(Some(parent), name, mode & 0o7777, caller.uid, caller.gid);
    let record = create_child(ctx, caller, parent, record).await?;
    Ok(FsReply::Entry(FileAttr::from(&record)))
}

pub(crate) async fn rmdir(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
) -> FsResult<FsReply> {
    let parent_record = ctx.meta().get(parent)?;
    require_dir(&parent_record)?;
    crate::handle::check_access(&parent_record, caller, (libc::W_OK | libc::X_OK) as u32)?;

    let child = ctx
        .meta()
        .get_by_path(parent, name)?
        .ok_or_else(|| FsError::NotFound(format!("{}/{}", parent, name)))?;
    if child.kind != InodeKind::Dir {
        return Err(FsError::NotDir(format!("{}/{} is not a directory", parent, name)));
    }
    if !ctx.meta().list_children(child.inode_id)?.is_empty() {
        return Err(FsError::NotEmpty(format!("{}/{}", parent, name)));
    }

    let _guard = ctx.cache.lock_inode(parent).await;
    ctx.meta().remove_entry(parent, name)?;
    ctx.meta().add_tombstone(parent, name)?;
    update_record(ctx, parent, |r| {
        r.nlink = r.nlink.saturating_sub(1);
        r.dirty_mask.mark_data();
        r.touch_mtime();
    })?;
    ctx.sync.note_dirty(parent);

    update_record(ctx, child.inode_id, |r| {
        r.nlink = 0;
    })?;
    drop(_guard);

    // Same deferral as unlink: an outstanding handle keeps the inode around
    // until its last closedir.
    if ctx.handles.dir_open_count(child.inode_id) == 0 {
        if let Err(e) = ctx.sync.finalize_orphan(child.inode_id).await {
            log::warn!("rmdir: deferred finalize of inode {}: {}", child.inode_id, e);
        }
    }
    Ok(FsReply::None)
}

/// Opens a directory handle over a snapshot of the current child set. The
/// enumeration cursor walks that snapshot; concurrent mutations are free to
/// appear or not, per POSIX.
pub(crate) async fn opendir(ctx: &OpContext, caller: &Caller, inode: InodeId) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    require_dir(&record)?;

    // Cold directories hydrate their listing first.
    if record.remote_ref.is_some()
        && fs_types::unix_timestamp().saturating_sub(record.last_sync_ts)
            >= ctx.cfg().block_ttl_secs
    {
        if let Err(e) = ctx.sync.pull_downstream(inode, None).await {
            log::warn!("opendir: refresh of dir {} failed: {}", inode, e);
        }
    }

    let snapshot = ctx.meta().list_children(inode)?;
    let handle = ctx.handles.opendir(&record, caller, snapshot)?;
    Ok(FsReply::Handle(handle))
}

pub(crate) fn readdir(
    ctx: &OpContext,
    handle: HandleId,
    cursor: Option<&str>,
    max_entries: usize,
) -> FsResult<FsReply> {
    let entries = ctx.handles.readdir_batch(handle, cursor, max_entries)?;
    Ok(FsReply::Entries(entries))
}

pub(crate) fn rewinddir(ctx: &OpContext, handle: HandleId) -> FsResult<FsReply> {
    let inode = ctx.handles.dir_inode(handle)?;
    let snapshot = ctx.meta().list_children(inode)?;
    ctx.handles.rewinddir(handle, snapshot)?;
    Ok(FsReply::None)
}

pub(crate) async fn releasedir(ctx: &OpContext, handle: HandleId) -> FsResult<FsReply> {
    let inode = ctx.handles.releasedir(handle)?;
    if ctx.handles.dir_open_count(inode) == 0 {
        if let Some(record) = ctx.meta().try_get(inode)? {
            if record.nlink == 0 {
                // Removed while open; the last closedir finalizes it.
                if let Err(e) = ctx.sync.finalize_orphan(inode).await {
                    log::warn!("releasedir: deferred finalize of inode {}: {}", inode, e);
                }
            }
        }
    }
    Ok(FsReply::None)
}

pub(crate) async fn fsyncdir(ctx: &OpContext, handle: HandleId) -> FsResult<FsReply> {
    let inode = ctx.handles.dir_inode(handle)?;
    push_and_wait(ctx, inode).await?;
    Ok(FsReply::None)
}
