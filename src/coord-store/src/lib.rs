mod mem;

pub use mem::MemCoordStore;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use fs_types::{FsResult, InodeId, Version};

/// Channel carrying all mount-wide coordination events.
pub const EVENT_CHANNEL: &str = "fs.events";

/// Events exchanged through the coordination store's pub/sub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordEvent {
    /// A pull completed; local blocks for this inode were refreshed.
    Pulled { inode_id: InodeId, version: Version },
    /// A push completed; the remote now has this inode at this version.
    Pushed { inode_id: InodeId, version: Version },
    /// The remote copy of this inode changed out-of-band; cached blocks are
    /// suspect until re-pulled. Carries the successor capability when the
    /// announcer knows it.
    RemoteChanged { inode_id: InodeId, new_ref: Option<String> },
    /// A directory's remote child set changed; local entries need a refresh.
    DirChanged { inode_id: InodeId },
    /// The mount entered read-only degraded mode.
    Degraded { reason: String },
}

/// Ephemeral coordination service: TTL locks with anti-theft tokens,
/// counters, pub/sub and barriers. Locks are always TTL-bounded so a crashed
/// holder cannot deadlock the fleet.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Try to take the lock; returns the holder token, or None when the lock
    /// is held by someone else.
    async fn acquire(&self, lock_key: &str, ttl: Duration) -> FsResult<Option<String>>;

    /// Release the lock. The token must match the current holder; a stale
    /// token is rejected so a crashed-and-replaced holder cannot release a
    /// lock it no longer owns.
    async fn release(&self, lock_key: &str, token: &str) -> FsResult<()>;

    /// Extend the TTL of a held lock. Long-running operations call this
    /// before the lease runs out.
    async fn refresh(&self, lock_key: &str, token: &str, ttl: Duration) -> FsResult<()>;

    async fn counter_incr(&self, key: &str, delta: i64) -> FsResult<i64>;

    async fn publish(&self, channel: &str, event: &CoordEvent) -> FsResult<()>;

    async fn subscribe(&self, channel: &str) -> FsResult<broadcast::Receiver<CoordEvent>>;

    /// Block until `n` parties have arrived at `key`.
    async fn barrier(&self, key: &str, n: u64) -> FsResult<()>;
}

/// Holds a TTL lock and guarantees a release on every exit path: explicitly
/// via `release`, or from `Drop` as a fallback when the guard goes out of
/// scope early.
pub struct LockGuard {
    store: Arc<dyn CoordStore>,
    key: String,
    token: Option<String>,
}

impl LockGuard {
    pub async fn acquire(
        store: Arc<dyn CoordStore>,
        key: &str,
        ttl: Duration,
    ) -> FsResult<Option<LockGuard>> {
        match store.acquire(key, ttl).await? {
            Some(token) => Ok(Some(LockGuard {
                store,
                key: key.to_string(),
                token: Some(token),
            })),
            None => Ok(None),
        }
    }

    pub async fn refresh(&self, ttl: Duration) -> FsResult<()> {
        match &self.token {
            Some(token) => self.store.refresh(&self.key, token, ttl).await,
            None => Ok(()),
        }
    }

    pub async fn release(mut self) -> FsResult<()> {
        if let Some(token) = self.token.take() {
            self.store.release(&self.key, &token).await?;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let store = self.store.clone();
            let key = std::mem::take(&mut self.key);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = store.release(&key, &token).await {
                            warn!("LockGuard: deferred release of {} failed: {}", key, e);
                        }
                    });
                }
                Err(_) => {
                    // No runtime left; the TTL reclaims the lock.
                    warn!("LockGuard: dropping lock {} outside a runtime, TTL will expire it", key);
                }
            }
        }
    }
}
