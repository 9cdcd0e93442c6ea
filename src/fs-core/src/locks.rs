use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use fs_types::InodeId;

/// Registry of per-inode async mutexes. Every read-modify-write of inode
/// metadata or block content holds the inode's mutex; cross-host exclusion
/// is not needed because a mount owns its cache on a single host.
pub struct InodeLocks {
    locks: Mutex<HashMap<InodeId, Arc<AsyncMutex<()>>>>,
}

impl InodeLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, inode_id: InodeId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(inode_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn lock(&self, inode_id: InodeId) -> OwnedMutexGuard<()> {
        self.lock_for(inode_id).lock_owned().await
    }

    /// Drop the registry entry once an inode is destroyed.
    pub fn forget(&self, inode_id: InodeId) {
        self.locks.lock().unwrap().remove(&inode_id);
    }
}

impl Default for InodeLocks {
    fn default() -> Self {
        Self::new()
    }
}
