use async_trait::async_trait;

use fs_types::{FsResult, InodeId};

/// Extension points framing every sync operation. The engine calls the
/// `before_*` hook ahead of the operation's lease/lock work, the snapshot
/// hook inside the main push phase, and the `after_*` hook once the phase
/// has finished, success or not. Implementations extend behavior without
/// touching the engine.
#[async_trait]
pub trait SyncHooks: Send + Sync {
    async fn before_pull(&self, _inode_id: InodeId) -> FsResult<()> {
        Ok(())
    }

    async fn after_pull(&self, _inode_id: InodeId, _ok: bool) {}

    async fn before_push(&self, _inode_id: InodeId) -> FsResult<()> {
        Ok(())
    }

    /// Runs in the main push phase, after the version/dirty snapshot has
    /// been taken and before the upload starts.
    async fn on_push_snapshot(&self, _inode_id: InodeId) {}

    async fn after_push(&self, _inode_id: InodeId, _ok: bool) {}
}

/// Default hooks: every phase is a no-op.
pub struct NoopHooks;

#[async_trait]
impl SyncHooks for NoopHooks {}
