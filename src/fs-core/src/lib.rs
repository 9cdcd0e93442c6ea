mod cache;
mod executor;
mod handle;
mod locks;
mod mount;
pub mod ops;
mod sweep;
pub mod sync;

#[cfg(test)]
mod fs_core_tests;

pub use cache::CacheManager;
pub use executor::Executor;
pub use handle::{check_access, Caller, HandleTable, OpenFlags};
pub use locks::InodeLocks;
pub use mount::Mount;
pub use sweep::{acquire_cache_lock, startup_sweep, SweepReport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Mount-wide run state. Entered-degraded is sticky: once a permanent
/// upstream failure marks the mount read-only, only a remount clears it.
pub struct MountState {
    read_only: AtomicBool,
    degraded_reason: Mutex<Option<String>>,
}

impl MountState {
    pub fn new(read_only: bool) -> Self {
        Self {
            read_only: AtomicBool::new(read_only),
            degraded_reason: Mutex::new(None),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn enter_degraded(&self, reason: String) {
        log::error!("mount entering read-only degraded mode: {}", reason);
        self.read_only.store(true, Ordering::SeqCst);
        *self.degraded_reason.lock().unwrap() = Some(reason);
    }

    pub fn degraded_reason(&self) -> Option<String> {
        self.degraded_reason.lock().unwrap().clone()
    }
}
