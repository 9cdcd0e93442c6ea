mod dir;
mod file;
mod node;

use std::sync::Arc;

use fs_meta::InodeStore;
use fs_types::{DirEntry, FsConfig, FsError, FsResult, HandleId, InodeId, InodeRecord};

use crate::cache::CacheManager;
use crate::executor::Executor;
use crate::handle::{Caller, HandleTable, OpenFlags};
use crate::sync::SyncEngine;
use crate::MountState;

/// Everything an operation needs: the cache, the sync engine and the handle
/// table. Operations themselves are stateless.
#[derive(Clone)]
pub struct OpContext {
    pub cache: Arc<CacheManager>,
    pub sync: Arc<SyncEngine>,
    pub handles: Arc<HandleTable>,
    pub executor: Arc<Executor>,
}

impl OpContext {
    pub(crate) fn meta(&self) -> &Arc<InodeStore> {
        self.cache.inodes()
    }

    pub(crate) fn state(&self) -> &Arc<MountState> {
        self.cache.mount_state()
    }

    pub(crate) fn cfg(&self) -> &FsConfig {
        self.cache.config()
    }
}

/// POSIX-visible attributes of an inode.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub inode_id: InodeId,
    pub kind: fs_types::InodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
}

impl From<&InodeRecord> for FileAttr {
    fn from(record: &InodeRecord) -> Self {
        Self {
            inode_id: record.inode_id,
            kind: record.kind,
            mode: record.mode,
            uid: record.uid,
            gid: record.gid,
            size: record.size,
            atime: record.atime,
            mtime: record.mtime,
            ctime: record.ctime,
            nlink: record.nlink,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatfsInfo {
    pub block_size: u32,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub dirty_bytes: u64,
    pub inode_count: u64,
}

/// The closed set of POSIX operations, one variant per verb.
#[derive(Debug, Clone)]
pub enum FsRequest {
    Lookup { parent: InodeId, name: String },
    Forget { inode: InodeId, nlookup: u64 },
    Getattr { inode: InodeId },
    Setattr {
        inode: InodeId,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<u64>,
        mtime: Option<u64>,
    },
    Readlink { inode: InodeId },
    Mknod { parent: InodeId, name: String, mode: u32 },
    Mkdir { parent: InodeId, name: String, mode: u32 },
    Unlink { parent: InodeId, name: String },
    Rmdir { parent: InodeId, name: String },
    Symlink { parent: InodeId, name: String, target: String },
    Rename {
        old_parent: InodeId,
        old_name: String,
        new_parent: InodeId,
        new_name: String,
    },
    Link { inode: InodeId, new_parent: InodeId, new_name: String },
    Open { inode: InodeId, flags: OpenFlags },
    Create { parent: InodeId, name: String, mode: u32, flags: OpenFlags },
    Read { handle: HandleId, offset: u64, size: u32 },
    Write { handle: HandleId, offset: u64, data: Vec<u8> },
    Flush { handle: HandleId },
    Release { handle: HandleId },
    Fsync { handle: HandleId },
    Truncate { inode: InodeId, size: u64 },
    Opendir { inode: InodeId },
    Readdir { handle: HandleId, cursor: Option<String>, max_entries: usize },
    Rewinddir { handle: HandleId },
    Releasedir { handle: HandleId },
    Fsyncdir { handle: HandleId },
    Statfs,
    Access { inode: InodeId, mask: u32 },
}

#[derive(Debug, Clone)]
pub enum FsReply {
    Entry(FileAttr),
    Attr(FileAttr),
    Data(Vec<u8>),
    Written(u32),
    Handle(HandleId),
    Created { handle: HandleId, attr: FileAttr },
    Entries(Vec<DirEntry>),
    Target(String),
    Statfs(StatfsInfo),
    None,
}

fn is_mutating(req: &FsRequest) -> bool {
    matches!(
        req,
        FsRequest::Setattr { .. }
            | FsRequest::Mknod { .. }
            | FsRequest::Mkdir { .. }
            | FsRequest::Unlink { .. }
            | FsRequest::Rmdir { .. }
            | FsRequest::Symlink { .. }
            | FsRequest::Rename { .. }
            | FsRequest::Link { .. }
            | FsRequest::Create { .. }
            | FsRequest::Write { .. }
            | FsRequest::Truncate { .. }
    )
}

/// Uniform entry point: every verb goes through here. Operations are
/// re-entrant across inodes and serialized per inode by the cache's
/// per-inode mutex.
pub async fn apply(ctx: &OpContext, caller: &Caller, req: FsRequest) -> FsResult<FsReply> {
    if is_mutating(&req) && ctx.state().is_read_only() {
        return Err(FsError::ReadOnly(
            ctx.state()
                .degraded_reason()
                .unwrap_or_else(|| "mounted read-only".to_string()),
        ));
    }

    match req {
        FsRequest::Lookup { parent, name } => node::lookup(ctx, caller, parent, &name).await,
        FsRequest::Forget { .. } => Ok(FsReply::None),
        FsRequest::Getattr { inode } => node::getattr(ctx, inode),
        FsRequest::Setattr { inode, mode, uid, gid, size, atime, mtime } => {
            node::setattr(ctx, caller, inode, mode, uid, gid, size, atime, mtime).await
        }
        FsRequest::Readlink { inode } => node::readlink(ctx, inode),
        FsRequest::Mknod { parent, name, mode } => {
            file::mknod(ctx, caller, parent, &name, mode).await
        }
        FsRequest::Mkdir { parent, name, mode } => {
            dir::mkdir(ctx, caller, parent, &name, mode).await
        }
        FsRequest::Unlink { parent, name } => node::unlink(ctx, caller, parent, &name).await,
        FsRequest::Rmdir { parent, name } => dir::rmdir(ctx, caller, parent, &name).await,
        FsRequest::Symlink { parent, name, target } => {
            node::symlink(ctx, caller, parent, &name, &target).await
        }
        FsRequest::Rename { old_parent, old_name, new_parent, new_name } => {
            node::rename(ctx, caller, old_parent, &old_name, new_parent, &new_name).await
        }
        FsRequest::Link { inode, new_parent, new_name } => {
            node::link(ctx, caller, inode, new_parent, &new_name).await
        }
        FsRequest::Open { inode, flags } => file::open(ctx, caller, inode, flags).await,
        FsRequest::Create { parent, name, mode, flags } => {
            file::create(ctx, caller, parent, &name, mode, flags).await
        }
        FsRequest::Read { handle, offset, size } => file::read(ctx, handle, offset, size).await,
        FsRequest::Write { handle, offset, data } => {
            file::write(ctx, handle, offset, &data).await
        }
        FsRequest::Flush { handle } => file::flush(ctx, handle),
        FsRequest::Release { handle } => file::release(ctx, handle).await,
        FsRequest::Fsync { handle } => file::fsync(ctx, handle).await,
        FsRequest::Truncate { inode, size } => file::truncate(ctx, caller, inode, size).await,
        FsRequest::Opendir { inode } => dir::opendir(ctx, caller, inode).await,
        FsRequest::Readdir { handle, cursor, max_entries } => {
            dir::readdir(ctx, handle, cursor.as_deref(), max_entries)
        }
        FsRequest::Rewinddir { handle } => dir::rewinddir(ctx, handle),
        FsRequest::Releasedir { handle } => dir::releasedir(ctx, handle).await,
        FsRequest::Fsyncdir { handle } => dir::fsyncdir(ctx, handle).await,
        FsRequest::Statfs => node::statfs(ctx),
        FsRequest::Access { inode, mask } => node::access(ctx, caller, inode, mask),
    }
}
