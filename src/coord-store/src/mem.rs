use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use fs_types::{unix_timestamp_ms, FsError, FsResult};

use crate::{CoordEvent, CoordStore};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct LockEntry {
    token: String,
    expires_at_ms: u64,
}

#[derive(Default)]
struct BarrierState {
    arrivals: u64,
}

/// In-process CoordStore for single-host mounts and tests. Locks expire by
/// wall-clock TTL exactly like the external service; pub/sub is a broadcast
/// channel per topic.
pub struct MemCoordStore {
    locks: Mutex<HashMap<String, LockEntry>>,
    counters: Mutex<HashMap<String, i64>>,
    channels: Mutex<HashMap<String, broadcast::Sender<CoordEvent>>>,
    barriers: Mutex<HashMap<String, BarrierState>>,
    barrier_notify: Arc<Notify>,
    token_seq: AtomicU64,
}

impl MemCoordStore {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            barriers: Mutex::new(HashMap::new()),
            barrier_notify: Arc::new(Notify::new()),
            token_seq: AtomicU64::new(1),
        }
    }

    fn next_token(&self) -> String {
        let seq = self.token_seq.fetch_add(1, Ordering::SeqCst);
        format!("tok-{}-{}", seq, unix_timestamp_ms())
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<CoordEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordStore for MemCoordStore {
    async fn acquire(&self, lock_key: &str, ttl: Duration) -> FsResult<Option<String>> {
        let now = unix_timestamp_ms();
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get(lock_key) {
            if entry.expires_at_ms > now {
                return Ok(None);
            }
            debug!("MemCoordStore: lock {} expired, reclaiming", lock_key);
        }
        let token = self.next_token();
        locks.insert(
            lock_key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at_ms: now + ttl.as_millis() as u64,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, lock_key: &str, token: &str) -> FsResult<()> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(lock_key) {
            Some(entry) if entry.token == token => {
                locks.remove(lock_key);
                Ok(())
            }
            Some(_) => Err(FsError::PermissionDenied(format!(
                "release of lock {} with stale token",
                lock_key
            ))),
            None => Ok(()),
        }
    }

    async fn refresh(&self, lock_key: &str, token: &str, ttl: Duration) -> FsResult<()> {
        let now = unix_timestamp_ms();
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(lock_key) {
            Some(entry) if entry.token == token => {
                entry.expires_at_ms = now + ttl.as_millis() as u64;
                Ok(())
            }
            Some(_) => Err(FsError::Stale(format!(
                "refresh of lock {} with stale token",
                lock_key
            ))),
            None => Err(FsError::NotFound(format!("lock not held: {}", lock_key))),
        }
    }

    async fn counter_incr(&self, key: &str, delta: i64) -> FsResult<i64> {
        let mut counters = self.counters.lock().unwrap();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn publish(&self, channel: &str, event: &CoordEvent) -> FsResult<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender_for(channel).send(event.clone());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> FsResult<broadcast::Receiver<CoordEvent>> {
        Ok(self.sender_for(channel).subscribe())
    }

    async fn barrier(&self, key: &str, n: u64) -> FsResult<()> {
        {
            let mut barriers = self.barriers.lock().unwrap();
            let state = barriers.entry(key.to_string()).or_default();
            state.arrivals += 1;
            if state.arrivals >= n {
                self.barrier_notify.notify_waiters();
                return Ok(());
            }
        }
        loop {
            let notified = self.barrier_notify.notified();
            {
                let barriers = self.barriers.lock().unwrap();
                if barriers.get(key).map(|s| s.arrivals).unwrap_or(0) >= n {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LockGuard, EVENT_CHANNEL};

    #[tokio::test]
    async fn test_acquire_and_busy() {
        let store = MemCoordStore::new();
        let token = store.acquire("k", Duration::from_secs(10)).await.unwrap();
        assert!(token.is_some());
        assert!(store.acquire("k", Duration::from_secs(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemCoordStore::new();
        let token = store.acquire("k", Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(store.release("k", "stolen").await.is_err());
        store.release("k", &token).await.unwrap();
        assert!(store.acquire("k", Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_reclaims_lock() {
        let store = MemCoordStore::new();
        store.acquire("k", Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.acquire("k", Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl() {
        let store = MemCoordStore::new();
        let token = store.acquire("k", Duration::from_millis(50)).await.unwrap().unwrap();
        store.refresh("k", &token, Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.acquire("k", Duration::from_secs(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counter_incr() {
        let store = MemCoordStore::new();
        assert_eq!(store.counter_incr("c", 1).await.unwrap(), 1);
        assert_eq!(store.counter_incr("c", 2).await.unwrap(), 3);
        assert_eq!(store.counter_incr("c", -3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemCoordStore::new();
        let mut rx = store.subscribe(EVENT_CHANNEL).await.unwrap();
        let event = CoordEvent::Pushed { inode_id: 7, version: 3 };
        store.publish(EVENT_CHANNEL, &event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_barrier_releases_at_n() {
        let store = Arc::new(MemCoordStore::new());
        let store2 = store.clone();
        let waiter = tokio::spawn(async move { store2.barrier("b", 2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        store.barrier("b", 2).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lock_guard_scoped_release() {
        let store: Arc<dyn CoordStore> = Arc::new(MemCoordStore::new());
        let guard = LockGuard::acquire(store.clone(), "k", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(LockGuard::acquire(store.clone(), "k", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());
        guard.release().await.unwrap();
        assert!(LockGuard::acquire(store, "k", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }
}
