use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use fs_types::{FsError, FsResult};

use crate::backend::{ObjectRef, RemoteBackend, RemoteDirEntry};

/// Content-addressed in-memory backend for tests and offline mounts.
/// Capabilities are derived from the object bytes, so a put of identical
/// content returns the same capability.
pub struct MemBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashMap<String, Vec<RemoteDirEntry>>>,
    offline: AtomicBool,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an unreachable backend: every call fails with
    /// BackendUnavailable until turned back on.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn check_online(&self) -> FsResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FsError::BackendUnavailable("backend offline".to_string()));
        }
        Ok(())
    }

    fn file_ref(data: &[u8]) -> ObjectRef {
        ObjectRef::new(format!("obj:{}", hex::encode(Sha256::digest(data))))
    }

    fn dir_ref(entries: &[RemoteDirEntry]) -> ObjectRef {
        let encoded = serde_json::to_vec(entries).unwrap_or_default();
        ObjectRef::new(format!("dir:{}", hex::encode(Sha256::digest(&encoded))))
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemBackend {
    async fn get_object(&self, obj: &ObjectRef, range: Option<Range<u64>>) -> FsResult<Vec<u8>> {
        self.check_online()?;
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(obj.as_str())
            .ok_or_else(|| FsError::NotFound(format!("object not found: {}", obj)))?;
        match range {
            Some(range) => {
                let start = std::cmp::min(range.start as usize, data.len());
                let end = std::cmp::min(range.end as usize, data.len());
                Ok(data[start..std::cmp::max(start, end)].to_vec())
            }
            None => Ok(data.clone()),
        }
    }

    async fn put_object(&self, data: &[u8]) -> FsResult<ObjectRef> {
        self.check_online()?;
        let obj = Self::file_ref(data);
        self.objects
            .lock()
            .unwrap()
            .insert(obj.as_str().to_string(), data.to_vec());
        Ok(obj)
    }

    async fn get_dir(&self, obj: &ObjectRef) -> FsResult<Vec<RemoteDirEntry>> {
        self.check_online()?;
        self.dirs
            .lock()
            .unwrap()
            .get(obj.as_str())
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("dir not found: {}", obj)))
    }

    async fn put_dir(
        &self,
        _prior: Option<&ObjectRef>,
        entries: &[RemoteDirEntry],
    ) -> FsResult<ObjectRef> {
        self.check_online()?;
        let obj = Self::dir_ref(entries);
        self.dirs
            .lock()
            .unwrap()
            .insert(obj.as_str().to_string(), entries.to_vec());
        Ok(obj)
    }

    async fn delete(&self, obj: &ObjectRef) -> FsResult<()> {
        self.check_online()?;
        let removed = self.objects.lock().unwrap().remove(obj.as_str()).is_some()
            || self.dirs.lock().unwrap().remove(obj.as_str()).is_some();
        if removed {
            Ok(())
        } else {
            Err(FsError::NotFound(format!("object not found: {}", obj)))
        }
    }
}
