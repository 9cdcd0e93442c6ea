use log::warn;

use fs_types::{unix_timestamp, FsError, FsResult, InodeId, InodeKind, InodeRecord};

use crate::handle::{check_access, Caller};
use crate::ops::{FileAttr, FsReply, OpContext, StatfsInfo};

pub(crate) fn require_dir(record: &InodeRecord) -> FsResult<()> {
    if record.kind != InodeKind::Dir {
        return Err(FsError::NotDir(format!("inode {} is not a directory", record.inode_id)));
    }
    Ok(())
}

/// CAS-retried metadata update. The closure edits the freshly read record;
/// the version bump happens here.
pub(crate) fn update_record<F>(ctx: &OpContext, inode_id: InodeId, mut edit: F) -> FsResult<InodeRecord>
where
    F: FnMut(&mut InodeRecord),
{
    loop {
        let record = ctx.meta().get(inode_id)?;
        let mut updated = record.clone();
        edit(&mut updated);
        updated.version = record.version + 1;
        match ctx.meta().update(&updated, record.version) {
            Ok(()) => return Ok(updated),
            Err(FsError::Stale(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Mark a directory's child set as changed so the next push applies it.
pub(crate) fn mark_dir_dirty(ctx: &OpContext, dir_id: InodeId) -> FsResult<()> {
    update_record(ctx, dir_id, |r| {
        r.dirty_mask.mark_data();
        r.touch_mtime();
    })?;
    ctx.sync.note_dirty(dir_id);
    Ok(())
}

/// Insert a new child under `parent`, marking the parent dirty. Shared by
/// mknod, create, mkdir and symlink.
pub(crate) async fn create_child(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    mut record: InodeRecord,
) -> FsResult<InodeRecord> {
    let parent_record = ctx.meta().get(parent)?;
    require_dir(&parent_record)?;
    check_access(&parent_record, caller, (libc::W_OK | libc::X_OK) as u32)?;

    let _guard = ctx.cache.lock_inode(parent).await;
    ctx.meta().insert(&mut record)?;
    update_record(ctx, parent, |r| {
        if record.kind == InodeKind::Dir {
            r.nlink += 1;
        }
        r.dirty_mask.mark_data();
        r.touch_mtime();
    })?;
    ctx.sync.note_dirty(parent);
    Ok(record)
}

pub(crate) async fn lookup(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
) -> FsResult<FsReply> {
    let parent_record = ctx.meta().get(parent)?;
    require_dir(&parent_record)?;
    check_access(&parent_record, caller, libc::X_OK as u32)?;

    if let Some(record) = ctx.meta().get_by_path(parent, name)? {
        return Ok(FsReply::Entry(FileAttr::from(&record)));
    }

    // A cold or expired directory may know this name only upstream.
    let listing_stale =
        unix_timestamp().saturating_sub(parent_record.last_sync_ts) >= ctx.cfg().block_ttl_secs;
    if parent_record.remote_ref.is_some() && listing_stale {
        if let Err(e) = ctx.sync.pull_downstream(parent, None).await {
            warn!("lookup: refresh of dir {} failed: {}", parent, e);
        }
        if let Some(record) = ctx.meta().get_by_path(parent, name)? {
            return Ok(FsReply::Entry(FileAttr::from(&record)));
        }
    }
    Err(FsError::NotFound(format!("{}/{}", parent, name)))
}

pub(crate) fn getattr(ctx: &OpContext, inode: InodeId) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    Ok(FsReply::Attr(FileAttr::from(&record)))
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn setattr(
    ctx: &OpContext,
    caller: &Caller,
    inode: InodeId,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<u64>,
    mtime: Option<u64>,
) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;

    if mode.is_some() && caller.uid != 0 && caller.uid != record.uid {
        return Err(FsError::PermissionDenied(format!("chmod on inode {}", inode)));
    }
    if (uid.is_some() || gid.is_some()) && caller.uid != 0 {
        return Err(FsError::PermissionDenied(format!("chown on inode {}", inode)));
    }

    if let Some(new_size) = size {
        if record.kind != InodeKind::File {
            return Err(FsError::IsDir(format!("truncate on inode {}", inode)));
        }
        check_access(&record, caller, libc::W_OK as u32)?;
        let grow = new_size.saturating_sub(record.size);
        if grow > 0 {
            ctx.cache.ensure_capacity(grow, Some(inode)).await?;
        }
        let _guard = ctx.cache.lock_inode(inode).await;
        ctx.cache.truncate(inode, new_size).await?;
    }

    if mode.is_some() || uid.is_some() || gid.is_some() || atime.is_some() || mtime.is_some() {
        let _guard = ctx.cache.lock_inode(inode).await;
        update_record(ctx, inode, |r| {
            if let Some(mode) = mode {
                r.mode = mode & 0o7777;
            }
            if let Some(uid) = uid {
                r.uid = uid;
            }
            if let Some(gid) = gid {
                r.gid = gid;
            }
            if let Some(atime) = atime {
                r.atime = atime;
            }
            if let Some(mtime) = mtime {
                r.mtime = mtime;
            }
            r.ctime = unix_timestamp();
            r.dirty_mask.mark_meta();
        })?;
        ctx.sync.note_dirty(inode);
    }

    let record = ctx.meta().get(inode)?;
    Ok(FsReply::Attr(FileAttr::from(&record)))
}

pub(crate) fn readlink(ctx: &OpContext, inode: InodeId) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    match record.symlink_target {
        Some(target) => Ok(FsReply::Target(target)),
        None => Err(FsError::InvalidParam(format!("inode {} is not a symlink", inode))),
    }
}

pub(crate) async fn symlink(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
    target: &str,
) -> FsResult<FsReply> {
    let record = InodeRecord::new_symlink(parent, name, target, caller.uid, caller.gid);
    let record = create_child(ctx, caller, parent, record).await?;
    Ok(FsReply::Entry(FileAttr::from(&record)))
}

pub(crate) async fn unlink(
    ctx: &OpContext,
    caller: &Caller,
    parent: InodeId,
    name: &str,
) -> FsResult<FsReply> {
    let parent_record = ctx.meta().get(parent)?;
    require_dir(&parent_record)?;
    check_access(&parent_record, caller, (libc::W_OK | libc::X_OK) as u32)?;

    let child = ctx
        .meta()
        .get_by_path(parent, name)?
        .ok_or_else(|| FsError::NotFound(format!("{}/{}", parent, name)))?;
    if child.kind == InodeKind::Dir {
        return Err(FsError::IsDir(format!("{}/{} is a directory", parent, name)));
    }

    let _guard = ctx.cache.lock_inode(parent).await;
    ctx.meta().remove_entry(parent, name)?;
    ctx.meta().add_tombstone(parent, name)?;
    mark_dir_dirty(ctx, parent)?;

    let child_after = update_record(ctx, child.inode_id, |r| {
        r.nlink = r.nlink.saturating_sub(1);
        r.ctime = unix_timestamp();
    })?;
    drop(_guard);

    if child_after.nlink == 0 && ctx.handles.open_count(child.inode_id) == 0 {
        // No handles hold it open: push-delete now.
        if let Err(e) = ctx.sync.finalize_orphan(child.inode_id).await {
            warn!("unlink: deferred finalize of inode {}: {}", child.inode_id, e);
        }
    }
    Ok(FsReply::None)
}

/// True when `node`'s ancestor chain (including `node` itself) passes
/// through `candidate`. The chain is acyclic by construction, because this
/// very check gates every directory move.
fn ancestry_contains(ctx: &OpContext, candidate: InodeId, node: InodeId) -> FsResult<bool> {
    let mut current = Some(node);
    while let Some(id) = current {
        if id == candidate {
            return Ok(true);
        }
        current = ctx.meta().get(id)?.parent_id;
    }
    Ok(false)
}

pub(crate) async fn rename(
    ctx: &OpContext,
    caller: &Caller,
    old_parent: InodeId,
    old_name: &str,
    new_parent: InodeId,
    new_name: &str,
) -> FsResult<FsReply> {
    let old_record = ctx.meta().get(old_parent)?;
    require_dir(&old_record)?;
    check_access(&old_record, caller, (libc::W_OK | libc::X_OK) as u32)?;
    let new_record = ctx.meta().get(new_parent)?;
    require_dir(&new_record)?;
    check_access(&new_record, caller, (libc::W_OK | libc::X_OK) as u32)?;

    // Lock both parents in id order so concurrent renames cannot deadlock.
    let (first, second) = if old_parent <= new_parent {
        (old_parent, new_parent)
    } else {
        (new_parent, old_parent)
    };
    let _first = ctx.cache.lock_inode(first).await;
    let _second = if first != second {
        Some(ctx.cache.lock_inode(second).await)
    } else {
        None
    };

    let source = ctx
        .meta()
        .get_by_path(old_parent, old_name)?
        .ok_or_else(|| FsError::NotFound(format!("{}/{}", old_parent, old_name)))?;

    // POSIX replacement rules when the destination name is occupied: the
    // kinds must agree, and a replaced directory must be empty.
    if let Some(target) = ctx.meta().get_by_path(new_parent, new_name)? {
        match (source.kind == InodeKind::Dir, target.kind == InodeKind::Dir) {
            (false, true) => {
                return Err(FsError::IsDir(format!(
                    "{}/{} is a directory",
                    new_parent, new_name
                )))
            }
            (true, false) => {
                return Err(FsError::NotDir(format!(
                    "{}/{} is not a directory",
                    new_parent, new_name
                )))
            }
            (true, true) => {
                if !ctx.meta().list_children(target.inode_id)?.is_empty() {
                    return Err(FsError::NotEmpty(format!("{}/{}", new_parent, new_name)));
                }
            }
            (false, false) => {}
        }
    }

    // A directory cannot move into its own subtree.
    if source.kind == InodeKind::Dir && ancestry_contains(ctx, source.inode_id, new_parent)? {
        return Err(FsError::InvalidParam(format!(
            "cannot move {}/{} under itself",
            old_parent, old_name
        )));
    }

    let displaced = ctx
        .meta()
        .rename_entry(old_parent, old_name, new_parent, new_name)?;
    ctx.meta().add_tombstone(old_parent, old_name)?;
    mark_dir_dirty(ctx, old_parent)?;
    if new_parent != old_parent {
        mark_dir_dirty(ctx, new_parent)?;
    }

    if let Some(displaced) = displaced {
        if let Some(record) = ctx.meta().try_get(displaced)? {
            if record.nlink == 0
                && ctx.handles.open_count(displaced) == 0
                && ctx.handles.dir_open_count(displaced) == 0
            {
                if let Err(e) = ctx.sync.finalize_orphan(displaced).await {
                    warn!("rename: deferred finalize of inode {}: {}", displaced, e);
                }
            }
        }
    }
    Ok(FsReply::None)
}

pub(crate) async fn link(
    ctx: &OpContext,
    caller: &Caller,
    inode: InodeId,
    new_parent: InodeId,
    new_name: &str,
) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    if record.kind == InodeKind::Dir {
        return Err(FsError::PermissionDenied("hard links to directories".to_string()));
    }
    let parent_record = ctx.meta().get(new_parent)?;
    require_dir(&parent_record)?;
    check_access(&parent_record, caller, (libc::W_OK | libc::X_OK) as u32)?;

    let _guard = ctx.cache.lock_inode(new_parent).await;
    ctx.meta().add_entry(new_parent, new_name, inode)?;
    mark_dir_dirty(ctx, new_parent)?;
    let updated = update_record(ctx, inode, |r| {
        r.nlink += 1;
        r.ctime = unix_timestamp();
    })?;
    Ok(FsReply::Entry(FileAttr::from(&updated)))
}

pub(crate) fn statfs(ctx: &OpContext) -> FsResult<FsReply> {
    let cfg = ctx.cfg();
    let used = ctx.cache.usage_bytes();
    let total = if cfg.cache_bytes_max == 0 {
        u64::MAX
    } else {
        cfg.cache_bytes_max
    };
    Ok(FsReply::Statfs(StatfsInfo {
        block_size: cfg.block_size,
        total_bytes: total,
        used_bytes: used,
        dirty_bytes: ctx.cache.dirty_bytes(),
        inode_count: ctx.meta().all_inode_ids()?.len() as u64,
    }))
}

pub(crate) fn access(
    ctx: &OpContext,
    caller: &Caller,
    inode: InodeId,
    mask: u32,
) -> FsResult<FsReply> {
    let record = ctx.meta().get(inode)?;
    if mask != libc::F_OK as u32 {
        check_access(&record, caller, mask)?;
    }
    Ok(FsReply::None)
}
