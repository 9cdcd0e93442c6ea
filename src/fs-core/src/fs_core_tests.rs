use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

use coord_store::{CoordStore, MemCoordStore};
use fs_types::{FsConfig, FsError, HandleId, InodeId, InodeKind, ROOT_INODE_ID};
use remote_client::{MemBackend, ObjectRef, RemoteBackend, RemoteDirEntry};

use crate::cache::CacheManager;
use crate::handle::{Caller, OpenFlags};
use crate::ops::{FsReply, FsRequest};
use crate::sync::SyncHooks;
use crate::Mount;

const BLOCK_SIZE: u32 = 4096;

fn test_config(tmp: &TempDir) -> FsConfig {
    let mut cfg = FsConfig::new(
        tmp.path().join("cache"),
        "mem:".to_string(),
        String::new(),
    );
    cfg.block_size = BLOCK_SIZE;
    cfg.block_ttl_secs = 3600;
    cfg.dirty_flush_interval_secs = 3600;
    cfg.cache_bytes_max = 0;
    cfg.push_retry_limit = 2;
    cfg
}

struct Fx {
    mount: Mount,
    backend: Arc<MemBackend>,
    coord: Arc<MemCoordStore>,
    _tmp: TempDir,
}

async fn fixture() -> Fx {
    fixture_with(|_| {}).await
}

async fn fixture_with<F: FnOnce(&mut FsConfig)>(tweak: F) -> Fx {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    tweak(&mut cfg);
    let backend = Arc::new(MemBackend::new());
    let coord = Arc::new(MemCoordStore::new());
    let mount = Mount::mount(cfg, backend.clone(), coord.clone())
        .await
        .unwrap();
    Fx { mount, backend, coord, _tmp: tmp }
}

fn root() -> Caller {
    Caller::root()
}

async fn mkdir(mount: &Mount, parent: InodeId, name: &str) -> InodeId {
    match mount
        .apply(&root(), FsRequest::Mkdir { parent, name: name.to_string(), mode: 0o755 })
        .await
        .unwrap()
    {
        FsReply::Entry(attr) => attr.inode_id,
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn create(mount: &Mount, parent: InodeId, name: &str) -> (InodeId, HandleId) {
    match mount
        .apply(
            &root(),
            FsRequest::Create {
                parent,
                name: name.to_string(),
                mode: 0o644,
                flags: OpenFlags::read_write(),
            },
        )
        .await
        .unwrap()
    {
        FsReply::Created { handle, attr } => (attr.inode_id, handle),
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn lookup(mount: &Mount, parent: InodeId, name: &str) -> Option<InodeId> {
    match mount
        .apply(&root(), FsRequest::Lookup { parent, name: name.to_string() })
        .await
    {
        Ok(FsReply::Entry(attr)) => Some(attr.inode_id),
        Err(FsError::NotFound(_)) => None,
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn open(mount: &Mount, inode: InodeId, flags: OpenFlags) -> HandleId {
    match mount.apply(&root(), FsRequest::Open { inode, flags }).await.unwrap() {
        FsReply::Handle(handle) => handle,
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn write_at(mount: &Mount, handle: HandleId, offset: u64, data: &[u8]) -> u32 {
    match mount
        .apply(&root(), FsRequest::Write { handle, offset, data: data.to_vec() })
        .await
        .unwrap()
    {
        FsReply::Written(n) => n,
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn read_at(mount: &Mount, handle: HandleId, offset: u64, size: u32) -> Vec<u8> {
    match mount
        .apply(&root(), FsRequest::Read { handle, offset, size })
        .await
        .unwrap()
    {
        FsReply::Data(data) => data,
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn fsync(mount: &Mount, handle: HandleId) {
    mount.apply(&root(), FsRequest::Fsync { handle }).await.unwrap();
}

async fn release(mount: &Mount, handle: HandleId) {
    mount.apply(&root(), FsRequest::Release { handle }).await.unwrap();
}

async fn readdir_names(mount: &Mount, dir: InodeId) -> Vec<String> {
    let handle = match mount.apply(&root(), FsRequest::Opendir { inode: dir }).await.unwrap() {
        FsReply::Handle(h) => h,
        other => panic!("unexpected reply: {:?}", other),
    };
    let mut names = Vec::new();
    loop {
        match mount
            .apply(&root(), FsRequest::Readdir { handle, cursor: None, max_entries: 2 })
            .await
            .unwrap()
        {
            FsReply::Entries(batch) => {
                if batch.is_empty() {
                    break;
                }
                names.extend(batch.into_iter().map(|e| e.name));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
    mount.apply(&root(), FsRequest::Releasedir { handle }).await.unwrap();
    names
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Seed the backend with one file under a root directory and return the
/// root capability to mount with.
async fn seed_remote_tree(backend: &MemBackend, name: &str, content: &[u8]) -> String {
    let file_ref = backend.put_object(content).await.unwrap();
    let dir_ref = backend
        .put_dir(
            None,
            &[RemoteDirEntry {
                name: name.to_string(),
                child_ref: file_ref,
                kind: InodeKind::File,
                size: Some(content.len() as u64),
            }],
        )
        .await
        .unwrap();
    dir_ref.as_str().to_string()
}

// ==================== Property Tests ====================

#[tokio::test]
async fn test_p1_write_fsync_drop_cache_read_roundtrip() {
    let fx = fixture().await;
    let data = pattern(BLOCK_SIZE as usize * 2 + 500, 7);

    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    assert_eq!(write_at(&fx.mount, handle, 0, &data).await as usize, data.len());
    fsync(&fx.mount, handle).await;

    fx.mount.cache().drop_clean_cache().await.unwrap();
    assert!(fx.mount.cache().sync().blocks().iterate(ino).await.unwrap().is_empty());

    let back = read_at(&fx.mount, handle, 0, data.len() as u32).await;
    assert_eq!(back, data);
}

#[tokio::test]
async fn test_p2_cold_cache_read_through() {
    let content = pattern(BLOCK_SIZE as usize + 123, 3);
    let backend = Arc::new(MemBackend::new());
    let root_cap = seed_remote_tree(&backend, "remote_file", &content).await;

    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.root_capability = root_cap;
    let mount = Mount::mount(cfg, backend, Arc::new(MemCoordStore::new())).await.unwrap();

    let ino = lookup(&mount, ROOT_INODE_ID, "remote_file").await.unwrap();
    let handle = open(&mount, ino, OpenFlags::read_only()).await;
    let back = read_at(&mount, handle, 0, content.len() as u32).await;
    assert_eq!(back, content);
}

#[tokio::test]
async fn test_p3_reads_never_evict_dirty_blocks() {
    let content = pattern(BLOCK_SIZE as usize * 3, 9);
    let backend = Arc::new(MemBackend::new());
    let root_cap = seed_remote_tree(&backend, "big", &content).await;

    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.root_capability = root_cap;
    cfg.cache_bytes_max = 2 * BLOCK_SIZE as u64;
    let mount = Mount::mount(cfg, backend, Arc::new(MemCoordStore::new())).await.unwrap();

    // One dirty, unpushed block.
    let (dirty_ino, dirty_handle) = create(&mount, ROOT_INODE_ID, "dirty").await;
    write_at(&mount, dirty_handle, 0, b"precious local bytes").await;

    // Read the remote file in pieces, forcing eviction pressure.
    let big = lookup(&mount, ROOT_INODE_ID, "big").await.unwrap();
    let big_handle = open(&mount, big, OpenFlags::read_only()).await;
    assert_eq!(
        read_at(&mount, big_handle, 0, BLOCK_SIZE * 2).await,
        content[..BLOCK_SIZE as usize * 2]
    );
    assert_eq!(
        read_at(&mount, big_handle, BLOCK_SIZE as u64 * 2, BLOCK_SIZE).await,
        content[BLOCK_SIZE as usize * 2..]
    );

    let entries = mount.cache().sync().blocks().iterate(dirty_ino).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].meta.dirty);
    let record = mount.cache().inodes().get(dirty_ino).unwrap();
    assert!(record.dirty_mask.has_data());
}

#[tokio::test]
async fn test_p4_single_push_per_inode() {
    let fx = fixture().await;
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, b"data").await;

    // Hold the push lock the way an in-flight push would.
    let token = fx
        .coord
        .acquire(&format!("push:{}", ino), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let err = fx.mount.context().sync.push_upstream(ino).await.unwrap_err();
    assert!(err.is_busy());

    fx.coord.release(&format!("push:{}", ino), &token).await.unwrap();
    fx.mount.context().sync.push_upstream(ino).await.unwrap();
}

#[tokio::test]
async fn test_p5_version_strictly_increases() {
    let fx = fixture().await;
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    let meta = fx.mount.cache().inodes().clone();

    let mut versions = vec![meta.get(ino).unwrap().version];
    write_at(&fx.mount, handle, 0, b"one").await;
    versions.push(meta.get(ino).unwrap().version);
    write_at(&fx.mount, handle, 100, b"two").await;
    versions.push(meta.get(ino).unwrap().version);
    fx.mount
        .apply(&root(), FsRequest::Truncate { inode: ino, size: 50 })
        .await
        .unwrap();
    versions.push(meta.get(ino).unwrap().version);
    fsync(&fx.mount, handle).await;

    // Pulls after a cache drop also advance the version.
    fx.mount.cache().drop_clean_cache().await.unwrap();
    read_at(&fx.mount, handle, 0, 50).await;
    versions.push(meta.get(ino).unwrap().version);

    for pair in versions.windows(2) {
        assert!(pair[1] > pair[0], "versions not strictly increasing: {:?}", versions);
    }
}

#[tokio::test]
async fn test_p7_push_of_clean_inode_is_noop() {
    let fx = fixture().await;
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, b"stable content").await;
    fsync(&fx.mount, handle).await;

    let objects_before = fx.backend.object_count();
    let version_before = fx.mount.cache().inodes().get(ino).unwrap().version;

    fsync(&fx.mount, handle).await;

    assert_eq!(fx.backend.object_count(), objects_before);
    assert_eq!(fx.mount.cache().inodes().get(ino).unwrap().version, version_before);
}

#[tokio::test]
async fn test_p8_crash_preserves_acknowledged_writes() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let backend = Arc::new(MemBackend::new());
    let data = pattern(BLOCK_SIZE as usize + 77, 5);

    let ino = {
        let mount = Mount::mount(cfg.clone(), backend.clone(), Arc::new(MemCoordStore::new()))
            .await
            .unwrap();
        let (ino, handle) = create(&mount, ROOT_INODE_ID, "f").await;
        write_at(&mount, handle, 0, &data).await;
        // No fsync, no unmount: the process dies here.
        drop(mount);
        ino
    };

    // Keep the backend unreachable so the sweep's re-queued push cannot
    // clean the inode before the assertions run.
    backend.set_offline(true);
    let mount = Mount::mount(cfg, backend, Arc::new(MemCoordStore::new())).await.unwrap();
    let record = mount.cache().inodes().get(ino).unwrap();
    assert!(record.dirty_mask.has_data());

    let handle = open(&mount, ino, OpenFlags::read_only()).await;
    assert_eq!(read_at(&mount, handle, 0, data.len() as u32).await, data);
}

#[tokio::test]
async fn test_orphan_blocks_collected_on_startup() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let backend = Arc::new(MemBackend::new());

    {
        let mount = Mount::mount(cfg.clone(), backend.clone(), Arc::new(MemCoordStore::new()))
            .await
            .unwrap();
        // A block belonging to no inode row.
        mount
            .cache()
            .sync()
            .blocks()
            .write_block(9999, 0, 0, b"orphan", 1)
            .await
            .unwrap();
        drop(mount);
    }

    let mount = Mount::mount(cfg, backend, Arc::new(MemCoordStore::new())).await.unwrap();
    assert!(mount.cache().sync().blocks().iterate(9999).await.unwrap().is_empty());
}

// ==================== End-to-End Scenarios ====================

#[tokio::test]
async fn test_scenario_mkdir_write_remount_read() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let backend = Arc::new(MemBackend::new());

    {
        let mount = Mount::mount(cfg.clone(), backend.clone(), Arc::new(MemCoordStore::new()))
            .await
            .unwrap();
        let a = mkdir(&mount, ROOT_INODE_ID, "a").await;
        let (_ino, handle) = create(&mount, a, "x").await;
        write_at(&mount, handle, 0, b"hi").await;
        release(&mount, handle).await;
        mount.unmount().await.unwrap();
    }
    assert!(backend.object_count() > 0);

    let mount = Mount::mount(cfg, backend, Arc::new(MemCoordStore::new())).await.unwrap();
    let a = lookup(&mount, ROOT_INODE_ID, "a").await.unwrap();
    let x = lookup(&mount, a, "x").await.unwrap();
    let handle = open(&mount, x, OpenFlags::read_only()).await;
    assert_eq!(read_at(&mount, handle, 0, 10).await, b"hi");
}

#[tokio::test]
async fn test_scenario_concurrent_disjoint_writers() {
    let fx = fixture().await;
    let mount = Arc::new(fx.mount);
    let (ino, h1) = create(&mount, ROOT_INODE_ID, "f").await;
    let h2 = open(&mount, ino, OpenFlags::read_write()).await;

    let lo = pattern(BLOCK_SIZE as usize, 1);
    let hi = pattern(BLOCK_SIZE as usize, 2);

    let m1 = mount.clone();
    let lo_clone = lo.clone();
    let w1 = tokio::spawn(async move { write_at(&m1, h1, 0, &lo_clone).await });
    let m2 = mount.clone();
    let hi_clone = hi.clone();
    let w2 = tokio::spawn(async move { write_at(&m2, h2, BLOCK_SIZE as u64, &hi_clone).await });
    w1.await.unwrap();
    w2.await.unwrap();

    fsync(&mount, h1).await;
    fsync(&mount, h2).await;

    let record = mount.cache().inodes().get(ino).unwrap();
    assert_eq!(record.version, 2, "exactly one version bump per write");
    assert!(record.dirty_mask.is_clean());

    let remote_ref = ObjectRef::new(record.remote_ref.unwrap());
    let remote = fx.backend.get_object(&remote_ref, None).await.unwrap();
    let mut expected = lo;
    expected.extend_from_slice(&hi);
    assert_eq!(remote, expected);
}

/// Simulates a remote out-of-band mutation landing between a push's dirty
/// snapshot and its commit, through the main-phase hook.
struct RemoteRaceHook {
    cache: OnceLock<Arc<CacheManager>>,
    backend: Arc<MemBackend>,
    armed: AtomicBool,
    payload: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl SyncHooks for RemoteRaceHook {
    async fn on_push_snapshot(&self, inode_id: InodeId) {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let payload = self.payload.lock().unwrap().take().unwrap();
        let new_ref = self.backend.put_object(&payload).await.unwrap();
        self.cache
            .get()
            .unwrap()
            .apply_invalidation(inode_id, Some(new_ref.as_str().to_string()))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_scenario_stale_push_rebases_and_reapplies() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let backend = Arc::new(MemBackend::new());
    let hook = Arc::new(RemoteRaceHook {
        cache: OnceLock::new(),
        backend: backend.clone(),
        armed: AtomicBool::new(false),
        payload: Mutex::new(None),
    });
    let mount = Mount::mount_with(
        cfg,
        backend.clone(),
        Arc::new(MemCoordStore::new()),
        hook.clone(),
        Arc::new(crate::sync::LastWriterWins),
    )
    .await
    .unwrap();
    hook.cache.set(mount.cache().clone()).map_err(|_| ()).unwrap();

    let (ino, handle) = create(&mount, ROOT_INODE_ID, "f").await;
    write_at(&mount, handle, 0, b"hello world").await;
    fsync(&mount, handle).await;
    let first_ref = mount.cache().inodes().get(ino).unwrap().remote_ref.unwrap();

    // Writer A touches byte 0; the remote mutates out-of-band mid-push.
    write_at(&mount, handle, 0, b"A").await;
    *hook.payload.lock().unwrap() = Some(b"HELLO WORLD".to_vec());
    hook.armed.store(true, Ordering::SeqCst);
    fsync(&mount, handle).await;

    let record = mount.cache().inodes().get(ino).unwrap();
    let final_ref = record.remote_ref.unwrap();
    assert_ne!(final_ref, first_ref);
    assert!(record.dirty_mask.is_clean());

    // A's write survived the rebase.
    let remote = backend.get_object(&ObjectRef::new(final_ref), None).await.unwrap();
    assert_eq!(remote, b"Aello world");
}

#[tokio::test]
async fn test_scenario_eviction_spares_dirty_and_keeps_mask_clean() {
    let fx = fixture_with(|cfg| cfg.cache_bytes_max = 8 * BLOCK_SIZE as u64).await;
    let big_data = pattern(6 * BLOCK_SIZE as usize, 11);

    let (big, big_handle) = create(&fx.mount, ROOT_INODE_ID, "big").await;
    write_at(&fx.mount, big_handle, 0, &big_data).await;
    fsync(&fx.mount, big_handle).await;

    let (other, other_handle) = create(&fx.mount, ROOT_INODE_ID, "other").await;
    write_at(&fx.mount, other_handle, 0, &pattern(4 * BLOCK_SIZE as usize, 13)).await;

    // LRU clean blocks of /big were evicted; its dirty mask stayed clean.
    let big_blocks = fx.mount.cache().sync().blocks().iterate(big).await.unwrap();
    assert!(big_blocks.len() < 6, "expected evictions, all 6 blocks resident");
    assert!(fx.mount.cache().inodes().get(big).unwrap().dirty_mask.is_clean());

    let other_blocks = fx.mount.cache().sync().blocks().iterate(other).await.unwrap();
    assert_eq!(other_blocks.len(), 4);
    assert!(other_blocks.iter().all(|e| e.meta.dirty));

    // Evicted content comes back through the remote.
    assert_eq!(read_at(&fx.mount, big_handle, 0, 6 * BLOCK_SIZE).await, big_data);
}

#[tokio::test]
async fn test_scenario_unreachable_backend_degrades_mount() {
    let fx = fixture().await;
    let (_ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, b"doomed").await;

    fx.backend.set_offline(true);
    let err = fx
        .mount
        .apply(&root(), FsRequest::Fsync { handle })
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);

    // The mount is read-only now.
    assert!(fx.mount.state().is_read_only());
    let err = fx
        .mount
        .apply(&root(), FsRequest::Write { handle, offset: 100, data: b"no".to_vec() })
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EROFS);

    // Reads still work.
    assert_eq!(read_at(&fx.mount, handle, 0, 6).await, b"doomed");
}

#[tokio::test]
async fn test_scenario_unlink_with_open_handle() {
    let fx = fixture().await;
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "x").await;
    write_at(&fx.mount, handle, 0, b"content").await;
    fsync(&fx.mount, handle).await;
    let remote_ref = fx.mount.cache().inodes().get(ino).unwrap().remote_ref.unwrap();

    fx.mount
        .apply(&root(), FsRequest::Unlink { parent: ROOT_INODE_ID, name: "x".to_string() })
        .await
        .unwrap();

    // Gone from the directory, still readable through the held handle.
    assert!(!readdir_names(&fx.mount, ROOT_INODE_ID).await.contains(&"x".to_string()));
    assert_eq!(read_at(&fx.mount, handle, 0, 7).await, b"content");
    assert!(fx.backend.get_object(&ObjectRef::new(remote_ref.clone()), None).await.is_ok());

    // Last close issues the remote delete and destroys the inode.
    release(&fx.mount, handle).await;
    assert!(fx
        .backend
        .get_object(&ObjectRef::new(remote_ref), None)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(fx.mount.cache().inodes().try_get(ino).unwrap().is_none());
}

// ==================== Operation Contracts ====================

#[tokio::test]
async fn test_read_clamps_to_eof() {
    let fx = fixture().await;
    let (_ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, b"short").await;
    assert_eq!(read_at(&fx.mount, handle, 0, 1000).await, b"short");
    assert_eq!(read_at(&fx.mount, handle, 3, 1000).await, b"rt");
    assert!(read_at(&fx.mount, handle, 100, 10).await.is_empty());
}

#[tokio::test]
async fn test_append_ignores_offset() {
    let fx = fixture().await;
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, b"base").await;

    let append_handle = open(
        &fx.mount,
        ino,
        OpenFlags { read: true, write: true, append: true },
    )
    .await;
    write_at(&fx.mount, append_handle, 0, b"+tail").await;
    assert_eq!(read_at(&fx.mount, handle, 0, 100).await, b"base+tail");
}

#[tokio::test]
async fn test_write_past_end_zero_fills_gap() {
    let fx = fixture().await;
    let (_ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, BLOCK_SIZE as u64 + 10, b"tail").await;

    let data = read_at(&fx.mount, handle, 0, BLOCK_SIZE + 14).await;
    assert_eq!(data.len(), BLOCK_SIZE as usize + 14);
    assert!(data[..BLOCK_SIZE as usize + 10].iter().all(|b| *b == 0));
    assert_eq!(&data[BLOCK_SIZE as usize + 10..], b"tail");
}

#[tokio::test]
async fn test_truncate_shrinks_and_reads_back() {
    let fx = fixture().await;
    let data = pattern(BLOCK_SIZE as usize * 2, 21);
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, &data).await;

    fx.mount
        .apply(&root(), FsRequest::Truncate { inode: ino, size: 100 })
        .await
        .unwrap();
    assert_eq!(read_at(&fx.mount, handle, 0, BLOCK_SIZE * 2).await, data[..100]);

    // Old tail bytes do not resurface after growing again.
    fx.mount
        .apply(&root(), FsRequest::Truncate { inode: ino, size: 200 })
        .await
        .unwrap();
    let grown = read_at(&fx.mount, handle, 0, 200).await;
    assert_eq!(&grown[..100], &data[..100]);
    assert!(grown[100..].iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_rename_replaces_target() {
    let fx = fixture().await;
    let (src, src_handle) = create(&fx.mount, ROOT_INODE_ID, "src").await;
    write_at(&fx.mount, src_handle, 0, b"source").await;
    release(&fx.mount, src_handle).await;
    let (dst, dst_handle) = create(&fx.mount, ROOT_INODE_ID, "dst").await;
    release(&fx.mount, dst_handle).await;

    fx.mount
        .apply(
            &root(),
            FsRequest::Rename {
                old_parent: ROOT_INODE_ID,
                old_name: "src".to_string(),
                new_parent: ROOT_INODE_ID,
                new_name: "dst".to_string(),
            },
        )
        .await
        .unwrap();

    assert!(lookup(&fx.mount, ROOT_INODE_ID, "src").await.is_none());
    assert_eq!(lookup(&fx.mount, ROOT_INODE_ID, "dst").await, Some(src));
    // The displaced inode was finalized.
    assert!(fx.mount.cache().inodes().try_get(dst).unwrap().is_none());
}

#[tokio::test]
async fn test_rename_file_over_dir_rejected() {
    let fx = fixture().await;
    mkdir(&fx.mount, ROOT_INODE_ID, "d").await;
    let (_f, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    release(&fx.mount, handle).await;

    let err = fx
        .mount
        .apply(
            &root(),
            FsRequest::Rename {
                old_parent: ROOT_INODE_ID,
                old_name: "f".to_string(),
                new_parent: ROOT_INODE_ID,
                new_name: "d".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EISDIR);
    assert!(lookup(&fx.mount, ROOT_INODE_ID, "f").await.is_some());
    assert!(lookup(&fx.mount, ROOT_INODE_ID, "d").await.is_some());
}

#[tokio::test]
async fn test_rename_dir_over_file_rejected() {
    let fx = fixture().await;
    mkdir(&fx.mount, ROOT_INODE_ID, "d").await;
    let (_f, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    release(&fx.mount, handle).await;

    let err = fx
        .mount
        .apply(
            &root(),
            FsRequest::Rename {
                old_parent: ROOT_INODE_ID,
                old_name: "d".to_string(),
                new_parent: ROOT_INODE_ID,
                new_name: "f".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTDIR);
}

#[tokio::test]
async fn test_rename_dir_over_nonempty_dir_rejected() {
    let fx = fixture().await;
    mkdir(&fx.mount, ROOT_INODE_ID, "d1").await;
    let d2 = mkdir(&fx.mount, ROOT_INODE_ID, "d2").await;
    let (_f, handle) = create(&fx.mount, d2, "x").await;
    release(&fx.mount, handle).await;

    let err = fx
        .mount
        .apply(
            &root(),
            FsRequest::Rename {
                old_parent: ROOT_INODE_ID,
                old_name: "d1".to_string(),
                new_parent: ROOT_INODE_ID,
                new_name: "d2".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert!(lookup(&fx.mount, d2, "x").await.is_some());
}

#[tokio::test]
async fn test_rename_dir_over_empty_dir_replaces() {
    let fx = fixture().await;
    let d1 = mkdir(&fx.mount, ROOT_INODE_ID, "d1").await;
    let d2 = mkdir(&fx.mount, ROOT_INODE_ID, "d2").await;

    fx.mount
        .apply(
            &root(),
            FsRequest::Rename {
                old_parent: ROOT_INODE_ID,
                old_name: "d1".to_string(),
                new_parent: ROOT_INODE_ID,
                new_name: "d2".to_string(),
            },
        )
        .await
        .unwrap();

    assert!(lookup(&fx.mount, ROOT_INODE_ID, "d1").await.is_none());
    assert_eq!(lookup(&fx.mount, ROOT_INODE_ID, "d2").await, Some(d1));
    // The displaced empty directory was fully unlinked and finalized.
    assert!(fx.mount.cache().inodes().try_get(d2).unwrap().is_none());
}

#[tokio::test]
async fn test_rename_into_own_subtree_rejected() {
    let fx = fixture().await;
    let a = mkdir(&fx.mount, ROOT_INODE_ID, "a").await;
    let b = mkdir(&fx.mount, a, "b").await;

    for new_parent in [a, b] {
        let err = fx
            .mount
            .apply(
                &root(),
                FsRequest::Rename {
                    old_parent: ROOT_INODE_ID,
                    old_name: "a".to_string(),
                    new_parent,
                    new_name: "a2".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }
    // The tree is unchanged.
    assert_eq!(lookup(&fx.mount, ROOT_INODE_ID, "a").await, Some(a));
    assert_eq!(lookup(&fx.mount, a, "b").await, Some(b));
}

#[tokio::test]
async fn test_rmdir_refuses_non_empty() {
    let fx = fixture().await;
    let a = mkdir(&fx.mount, ROOT_INODE_ID, "a").await;
    let (_ino, handle) = create(&fx.mount, a, "x").await;
    release(&fx.mount, handle).await;

    let err = fx
        .mount
        .apply(&root(), FsRequest::Rmdir { parent: ROOT_INODE_ID, name: "a".to_string() })
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);

    fx.mount
        .apply(&root(), FsRequest::Unlink { parent: a, name: "x".to_string() })
        .await
        .unwrap();
    fx.mount
        .apply(&root(), FsRequest::Rmdir { parent: ROOT_INODE_ID, name: "a".to_string() })
        .await
        .unwrap();
    assert!(lookup(&fx.mount, ROOT_INODE_ID, "a").await.is_none());
}

#[tokio::test]
async fn test_rmdir_with_open_handle_defers_finalize() {
    let fx = fixture().await;
    let d = mkdir(&fx.mount, ROOT_INODE_ID, "d").await;
    let handle = match fx.mount.apply(&root(), FsRequest::Opendir { inode: d }).await.unwrap() {
        FsReply::Handle(h) => h,
        other => panic!("unexpected reply: {:?}", other),
    };

    fx.mount
        .apply(&root(), FsRequest::Rmdir { parent: ROOT_INODE_ID, name: "d".to_string() })
        .await
        .unwrap();

    // Gone from the namespace, but the open handle keeps the inode alive.
    assert!(lookup(&fx.mount, ROOT_INODE_ID, "d").await.is_none());
    let record = fx.mount.cache().inodes().get(d).unwrap();
    assert_eq!(record.nlink, 0);
    match fx
        .mount
        .apply(&root(), FsRequest::Readdir { handle, cursor: None, max_entries: 10 })
        .await
        .unwrap()
    {
        FsReply::Entries(entries) => assert!(entries.is_empty()),
        other => panic!("unexpected reply: {:?}", other),
    }

    // The last closedir finalizes it.
    fx.mount
        .apply(&root(), FsRequest::Releasedir { handle })
        .await
        .unwrap();
    assert!(fx.mount.cache().inodes().try_get(d).unwrap().is_none());
}

#[tokio::test]
async fn test_symlink_roundtrip() {
    let fx = fixture().await;
    let reply = fx
        .mount
        .apply(
            &root(),
            FsRequest::Symlink {
                parent: ROOT_INODE_ID,
                name: "ln".to_string(),
                target: "/a/b/c".to_string(),
            },
        )
        .await
        .unwrap();
    let ino = match reply {
        FsReply::Entry(attr) => {
            assert_eq!(attr.kind, InodeKind::Symlink);
            attr.inode_id
        }
        other => panic!("unexpected reply: {:?}", other),
    };

    match fx.mount.apply(&root(), FsRequest::Readlink { inode: ino }).await.unwrap() {
        FsReply::Target(target) => assert_eq!(target, "/a/b/c"),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_statfs_reports_usage() {
    let fx = fixture().await;
    let (_ino, handle) = create(&fx.mount, ROOT_INODE_ID, "f").await;
    write_at(&fx.mount, handle, 0, &pattern(BLOCK_SIZE as usize, 1)).await;

    match fx.mount.apply(&root(), FsRequest::Statfs).await.unwrap() {
        FsReply::Statfs(info) => {
            assert_eq!(info.block_size, BLOCK_SIZE);
            assert!(info.used_bytes >= BLOCK_SIZE as u64);
            assert!(info.dirty_bytes >= BLOCK_SIZE as u64);
            assert!(info.inode_count >= 2);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_permission_denied_for_other_user() {
    let fx = fixture().await;
    let (ino, handle) = create(&fx.mount, ROOT_INODE_ID, "private").await;
    release(&fx.mount, handle).await;
    fx.mount
        .apply(
            &root(),
            FsRequest::Setattr {
                inode: ino,
                mode: Some(0o600),
                uid: Some(1000),
                gid: Some(1000),
                size: None,
                atime: None,
                mtime: None,
            },
        )
        .await
        .unwrap();

    let stranger = Caller { uid: 2000, gid: 2000 };
    let err = fx
        .mount
        .apply(&stranger, FsRequest::Open { inode: ino, flags: OpenFlags::read_only() })
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EACCES);
}

#[tokio::test]
async fn test_second_mount_of_same_cache_fails() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let backend = Arc::new(MemBackend::new());
    let _mount = Mount::mount(cfg.clone(), backend.clone(), Arc::new(MemCoordStore::new()))
        .await
        .unwrap();

    let err = Mount::mount(cfg, backend, Arc::new(MemCoordStore::new()))
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(err.is_busy());
}
