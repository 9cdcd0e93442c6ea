use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;

use fs_types::InodeId;

/// Per-inode sync state. The inode outlives its syncs; Deleting is the only
/// path out of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Dirty,
    Pulling,
    Pushing,
    Rebasing,
    Deleting,
}

pub struct SyncStateMap {
    states: Mutex<HashMap<InodeId, SyncState>>,
}

impl SyncStateMap {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, inode_id: InodeId) -> SyncState {
        self.states
            .lock()
            .unwrap()
            .get(&inode_id)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    pub fn set(&self, inode_id: InodeId, state: SyncState) {
        debug!("sync state: inode {} -> {:?}", inode_id, state);
        self.states.lock().unwrap().insert(inode_id, state);
    }

    /// True when a push may start: not already pushing, not being deleted.
    pub fn can_push(&self, inode_id: InodeId) -> bool {
        !matches!(
            self.get(inode_id),
            SyncState::Pushing | SyncState::Rebasing | SyncState::Deleting
        )
    }

    pub fn forget(&self, inode_id: InodeId) {
        self.states.lock().unwrap().remove(&inode_id);
    }
}

impl Default for SyncStateMap {
    fn default() -> Self {
        Self::new()
    }
}
