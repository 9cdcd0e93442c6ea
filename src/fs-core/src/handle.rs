use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fs_types::{unix_timestamp, DirEntry, FsError, FsResult, HandleId, InodeId, InodeRecord};

/// Decoded POSIX open flags the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self { read: true, write: false, append: false }
    }

    pub fn read_write() -> Self {
        Self { read: true, write: true, append: false }
    }

    pub fn from_posix(flags: u32) -> Self {
        let accmode = flags as i32 & libc::O_ACCMODE;
        Self {
            read: accmode == libc::O_RDONLY || accmode == libc::O_RDWR,
            write: accmode == libc::O_WRONLY || accmode == libc::O_RDWR,
            append: flags as i32 & libc::O_APPEND != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileHandle {
    pub handle_id: HandleId,
    pub inode_id: InodeId,
    pub flags: OpenFlags,
    pub opened_at: u64,
}

struct DirHandle {
    inode_id: InodeId,
    /// Snapshot taken at opendir (or the last rewind). Entries added during
    /// enumeration need not appear; removed entries need not disappear.
    snapshot: Vec<DirEntry>,
    /// Lexicographic key of the last returned entry.
    cursor: Option<String>,
}

/// Tracks open file and directory handles. Handle ids are monotonic and
/// never reused within a mount.
pub struct HandleTable {
    next_id: AtomicU64,
    files: Mutex<HashMap<HandleId, FileHandle>>,
    dirs: Mutex<HashMap<HandleId, DirHandle>>,
}

/// Caller identity, for permission checks.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Classic owner/group/other rwx check. `want` is a bitmask of R_OK/W_OK/X_OK.
pub fn check_access(record: &InodeRecord, caller: &Caller, want: u32) -> FsResult<()> {
    if caller.uid == 0 {
        return Ok(());
    }
    let mode = record.mode;
    let granted = if caller.uid == record.uid {
        (mode >> 6) & 0o7
    } else if caller.gid == record.gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    if want & !granted != 0 {
        return Err(FsError::PermissionDenied(format!(
            "inode {} mode {:o} denies mask {:o} to uid {}",
            record.inode_id, mode, want, caller.uid
        )));
    }
    Ok(())
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
        }
    }

    fn alloc_id(&self) -> HandleId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Validate permissions against the inode and create a file handle.
    pub fn open(
        &self,
        record: &InodeRecord,
        caller: &Caller,
        flags: OpenFlags,
    ) -> FsResult<HandleId> {
        let mut want = 0;
        if flags.read {
            want |= libc::R_OK as u32;
        }
        if flags.write || flags.append {
            want |= libc::W_OK as u32;
        }
        check_access(record, caller, want)?;

        let handle_id = self.alloc_id();
        self.files.lock().unwrap().insert(
            handle_id,
            FileHandle {
                handle_id,
                inode_id: record.inode_id,
                flags,
                opened_at: unix_timestamp(),
            },
        );
        Ok(handle_id)
    }

    pub fn get_file(&self, handle_id: HandleId) -> FsResult<FileHandle> {
        self.files
            .lock()
            .unwrap()
            .get(&handle_id)
            .cloned()
            .ok_or_else(|| FsError::InvalidParam(format!("bad file handle: {}", handle_id)))
    }

    /// Close a file handle. Returns the inode id and how many handles on
    /// that inode remain open, so the caller can run unlink finalization at
    /// zero.
    pub fn release(&self, handle_id: HandleId) -> FsResult<(InodeId, usize)> {
        let mut files = self.files.lock().unwrap();
        let handle = files
            .remove(&handle_id)
            .ok_or_else(|| FsError::InvalidParam(format!("bad file handle: {}", handle_id)))?;
        let remaining = files
            .values()
            .filter(|h| h.inode_id == handle.inode_id)
            .count();
        Ok((handle.inode_id, remaining))
    }

    pub fn open_count(&self, inode_id: InodeId) -> usize {
        self.files
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.inode_id == inode_id)
            .count()
    }

    pub fn dir_open_count(&self, inode_id: InodeId) -> usize {
        self.dirs
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.inode_id == inode_id)
            .count()
    }

    pub fn opendir(
        &self,
        record: &InodeRecord,
        caller: &Caller,
        snapshot: Vec<DirEntry>,
    ) -> FsResult<HandleId> {
        check_access(record, caller, libc::R_OK as u32)?;
        let handle_id = self.alloc_id();
        self.dirs.lock().unwrap().insert(
            handle_id,
            DirHandle {
                inode_id: record.inode_id,
                snapshot,
                cursor: None,
            },
        );
        Ok(handle_id)
    }

    pub fn dir_inode(&self, handle_id: HandleId) -> FsResult<InodeId> {
        self.dirs
            .lock()
            .unwrap()
            .get(&handle_id)
            .map(|h| h.inode_id)
            .ok_or_else(|| FsError::InvalidParam(format!("bad dir handle: {}", handle_id)))
    }

    /// Next batch from the handle's snapshot. An explicit `cursor` repositions
    /// enumeration after that key; otherwise it continues from the handle's
    /// own position.
    pub fn readdir_batch(
        &self,
        handle_id: HandleId,
        cursor: Option<&str>,
        max_entries: usize,
    ) -> FsResult<Vec<DirEntry>> {
        let mut dirs = self.dirs.lock().unwrap();
        let handle = dirs
            .get_mut(&handle_id)
            .ok_or_else(|| FsError::InvalidParam(format!("bad dir handle: {}", handle_id)))?;

        let after: Option<&str> = match cursor {
            Some(c) if c.is_empty() => None,
            Some(c) => Some(c),
            None => handle.cursor.as_deref(),
        };

        let batch: Vec<DirEntry> = handle
            .snapshot
            .iter()
            .filter(|e| match after {
                Some(after) => e.name.as_str() > after,
                None => true,
            })
            .take(max_entries)
            .cloned()
            .collect();

        if let Some(last) = batch.last() {
            handle.cursor = Some(last.name.clone());
        } else if cursor.is_some() {
            handle.cursor = after.map(|s| s.to_string());
        }
        Ok(batch)
    }

    /// Reset enumeration over a fresh snapshot.
    pub fn rewinddir(&self, handle_id: HandleId, snapshot: Vec<DirEntry>) -> FsResult<()> {
        let mut dirs = self.dirs.lock().unwrap();
        let handle = dirs
            .get_mut(&handle_id)
            .ok_or_else(|| FsError::InvalidParam(format!("bad dir handle: {}", handle_id)))?;
        handle.snapshot = snapshot;
        handle.cursor = None;
        Ok(())
    }

    pub fn releasedir(&self, handle_id: HandleId) -> FsResult<InodeId> {
        self.dirs
            .lock()
            .unwrap()
            .remove(&handle_id)
            .map(|h| h.inode_id)
            .ok_or_else(|| FsError::InvalidParam(format!("bad dir handle: {}", handle_id)))
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
