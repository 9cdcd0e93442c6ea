use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use fs_types::{
    block_count, unix_timestamp, BlockMeta, FsError, FsResult, InodeId, Version,
};

const BLOCKS_DIR_NAME: &str = "blocks";
const META_EXT: &str = "meta";
const META_TMP_EXT: &str = "meta.tmp";

/// A present block known to the store, as reported by `iterate` and `scan`.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub inode_id: InodeId,
    pub index: u64,
    pub meta: BlockMeta,
}

/// Fixed-size block files on local disk, addressed by `(inode_id, index)`.
/// Each block is a regular file under `blocks/<shard>/<inode_id>/<index>`
/// with a JSON sidecar `<index>.meta` holding length, dirty, present,
/// last_access_ts, write_version and optional checksum.
pub struct BlockStore {
    blocks_dir: PathBuf,
    block_size: u32,
}

impl BlockStore {
    pub async fn open(cache_root: &Path, block_size: u32) -> FsResult<Self> {
        if block_size == 0 {
            return Err(FsError::InvalidParam("block_size must be non-zero".to_string()));
        }
        let blocks_dir = cache_root.join(BLOCKS_DIR_NAME);
        fs::create_dir_all(&blocks_dir)
            .await
            .map_err(|e| FsError::IoError(format!("create blocks dir failed: {}", e)))?;
        Ok(Self { blocks_dir, block_size })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn inode_dir(&self, inode_id: InodeId) -> PathBuf {
        let shard = format!("{:02x}", inode_id % 256);
        self.blocks_dir.join(shard).join(inode_id.to_string())
    }

    fn block_path(&self, inode_id: InodeId, index: u64) -> PathBuf {
        self.inode_dir(inode_id).join(index.to_string())
    }

    fn meta_path(&self, inode_id: InodeId, index: u64) -> PathBuf {
        self.inode_dir(inode_id).join(format!("{}.{}", index, META_EXT))
    }

    async fn load_meta(&self, inode_id: InodeId, index: u64) -> FsResult<Option<BlockMeta>> {
        let meta_path = self.meta_path(inode_id, index);
        let meta_str = match fs::read_to_string(&meta_path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::IoError(format!("read sidecar failed: {}", e))),
        };
        match serde_json::from_str::<BlockMeta>(&meta_str) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(
                    "BlockStore: corrupt sidecar for inode {} block {}, purging: {}",
                    inode_id, index, e
                );
                self.purge(inode_id, index).await?;
                Ok(None)
            }
        }
    }

    /// Persist a sidecar atomically: write a tmp file, then rename over.
    async fn save_meta(&self, inode_id: InodeId, index: u64, meta: &BlockMeta) -> FsResult<()> {
        let dir = self.inode_dir(inode_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FsError::IoError(format!("create inode dir failed: {}", e)))?;
        let tmp_path = dir.join(format!("{}.{}", index, META_TMP_EXT));
        let meta_str =
            serde_json::to_string(meta).map_err(|e| FsError::Internal(e.to_string()))?;
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| FsError::IoError(format!("create sidecar failed: {}", e)))?;
        file.write_all(meta_str.as_bytes())
            .await
            .map_err(|e| FsError::IoError(format!("write sidecar failed: {}", e)))?;
        fs::rename(&tmp_path, self.meta_path(inode_id, index))
            .await
            .map_err(|e| FsError::IoError(format!("rename sidecar failed: {}", e)))?;
        Ok(())
    }

    /// Remove block and sidecar unconditionally. Used on corruption; eviction
    /// goes through `evict` which refuses dirty blocks.
    async fn purge(&self, inode_id: InodeId, index: u64) -> FsResult<()> {
        for path in [self.block_path(inode_id, index), self.meta_path(inode_id, index)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::IoError(format!("purge block failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Returns the block's bytes, or None when the block is MISSING (never
    /// fetched, evicted, or found corrupt). A sidecar/data mismatch purges
    /// the block so the caller schedules a re-fetch.
    pub async fn read_block(&self, inode_id: InodeId, index: u64) -> FsResult<Option<Vec<u8>>> {
        let mut meta = match self.load_meta(inode_id, index).await? {
            Some(meta) if meta.present => meta,
            _ => return Ok(None),
        };

        let block_path = self.block_path(inode_id, index);
        let mut file = match File::open(&block_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "BlockStore: sidecar present but data missing, inode {} block {}",
                    inode_id, index
                );
                self.purge(inode_id, index).await?;
                return Ok(None);
            }
            Err(e) => return Err(FsError::IoError(format!("open block failed: {}", e))),
        };

        let file_len = file
            .metadata()
            .await
            .map_err(|e| FsError::IoError(format!("stat block failed: {}", e)))?
            .len();
        if file_len != meta.length as u64 {
            warn!(
                "BlockStore: length mismatch for inode {} block {} (file {} vs sidecar {}), purging",
                inode_id, index, file_len, meta.length
            );
            self.purge(inode_id, index).await?;
            return Ok(None);
        }

        let mut data = vec![0u8; meta.length as usize];
        file.read_exact(&mut data)
            .await
            .map_err(|e| FsError::IoError(format!("read block failed: {}", e)))?;

        if let Some(expected) = &meta.checksum {
            let actual = hex::encode(Sha256::digest(&data));
            if &actual != expected {
                warn!(
                    "BlockStore: checksum mismatch for inode {} block {}, purging",
                    inode_id, index
                );
                self.purge(inode_id, index).await?;
                return Ok(None);
            }
        }

        meta.last_access_ts = unix_timestamp();
        self.save_meta(inode_id, index, &meta).await?;
        Ok(Some(data))
    }

    /// Write `data` in place at `offset_in_block`, extending the block's
    /// length as needed and marking it dirty under `version`. On I/O failure
    /// the sidecar keeps its prior state.
    pub async fn write_block(
        &self,
        inode_id: InodeId,
        index: u64,
        offset_in_block: u32,
        data: &[u8],
        version: Version,
    ) -> FsResult<()> {
        let end = offset_in_block as u64 + data.len() as u64;
        if end > self.block_size as u64 {
            return Err(FsError::InvalidParam(format!(
                "write beyond block boundary: {} > {}",
                end, self.block_size
            )));
        }

        let dir = self.inode_dir(inode_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FsError::IoError(format!("create inode dir failed: {}", e)))?;

        let prior = self.load_meta(inode_id, index).await?;

        let block_path = self.block_path(inode_id, index);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&block_path)
            .await
            .map_err(|e| FsError::IoError(format!("open block for write failed: {}", e)))?;
        file.seek(SeekFrom::Start(offset_in_block as u64))
            .await
            .map_err(|e| FsError::IoError(format!("seek block failed: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| FsError::IoError(format!("write block failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| FsError::IoError(format!("flush block failed: {}", e)))?;

        let now = unix_timestamp();
        let mut meta = match prior {
            Some(mut m) => {
                m.length = std::cmp::max(m.length, end as u32);
                m.present = true;
                m.last_access_ts = now;
                m
            }
            None => BlockMeta::new(end as u32, now, version),
        };
        meta.dirty = true;
        meta.write_version = version;
        meta.checksum = None;
        self.save_meta(inode_id, index, &meta).await?;
        Ok(())
    }

    /// Install a whole block fetched from the remote: present and clean,
    /// with the backend checksum when one was provided.
    pub async fn install_pulled_block(
        &self,
        inode_id: InodeId,
        index: u64,
        data: &[u8],
        checksum: Option<String>,
    ) -> FsResult<()> {
        if data.len() > self.block_size as usize {
            return Err(FsError::InvalidParam(format!(
                "pulled block larger than block size: {}",
                data.len()
            )));
        }

        // Never clobber locally dirty bytes with remote data.
        if let Some(meta) = self.load_meta(inode_id, index).await? {
            if meta.dirty {
                debug!(
                    "BlockStore: skip installing pulled block over dirty inode {} block {}",
                    inode_id, index
                );
                return Ok(());
            }
        }

        let dir = self.inode_dir(inode_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FsError::IoError(format!("create inode dir failed: {}", e)))?;

        let block_path = self.block_path(inode_id, index);
        let mut file = File::create(&block_path)
            .await
            .map_err(|e| FsError::IoError(format!("create block failed: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| FsError::IoError(format!("write pulled block failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| FsError::IoError(format!("flush pulled block failed: {}", e)))?;

        let mut meta = BlockMeta::new(data.len() as u32, unix_timestamp(), 0);
        meta.checksum = checksum;
        self.save_meta(inode_id, index, &meta).await?;
        Ok(())
    }

    /// Clear the dirty bit, but only when the block was last staged at or
    /// before `version` — bytes written after the push snapshot stay dirty.
    pub async fn mark_clean(
        &self,
        inode_id: InodeId,
        index: u64,
        version: Version,
    ) -> FsResult<()> {
        let mut meta = self
            .load_meta(inode_id, index)
            .await?
            .ok_or_else(|| {
                FsError::NotFound(format!("block not present: inode {} index {}", inode_id, index))
            })?;
        if meta.write_version > version {
            return Err(FsError::Stale(format!(
                "block staged at version {} cannot be cleaned at version {}",
                meta.write_version, version
            )));
        }
        if meta.dirty {
            meta.dirty = false;
            self.save_meta(inode_id, index, &meta).await?;
        }
        Ok(())
    }

    /// Remove a clean block and its sidecar. Refuses dirty blocks.
    pub async fn evict(&self, inode_id: InodeId, index: u64) -> FsResult<()> {
        match self.load_meta(inode_id, index).await? {
            Some(meta) if meta.dirty => Err(FsError::Busy(format!(
                "refusing to evict dirty block: inode {} index {}",
                inode_id, index
            ))),
            Some(_) => self.purge(inode_id, index).await,
            None => Ok(()),
        }
    }

    /// Present blocks of one inode in ascending index order.
    pub async fn iterate(&self, inode_id: InodeId) -> FsResult<Vec<BlockEntry>> {
        let dir = self.inode_dir(inode_id);
        let mut entries = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(FsError::IoError(format!("read inode dir failed: {}", e))),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| FsError::IoError(format!("read inode dir failed: {}", e)))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Data files are bare indices; skip sidecars and tmp leftovers.
            let Ok(index) = name.parse::<u64>() else {
                continue;
            };
            if let Some(meta) = self.load_meta(inode_id, index).await? {
                if meta.present {
                    entries.push(BlockEntry { inode_id, index, meta });
                }
            }
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    /// Drop blocks past the new end of file and trim the new final block.
    pub async fn truncate_blocks(&self, inode_id: InodeId, new_size: u64) -> FsResult<()> {
        let keep = block_count(new_size, self.block_size);
        for entry in self.iterate(inode_id).await? {
            if entry.index >= keep {
                self.purge(inode_id, entry.index).await?;
            }
        }

        if keep == 0 {
            return Ok(());
        }

        let last_index = keep - 1;
        let last_len = (new_size - last_index * self.block_size as u64) as u32;
        if let Some(mut meta) = self.load_meta(inode_id, last_index).await? {
            if meta.length > last_len {
                let block_path = self.block_path(inode_id, last_index);
                let file = OpenOptions::new()
                    .write(true)
                    .open(&block_path)
                    .await
                    .map_err(|e| FsError::IoError(format!("open block for truncate failed: {}", e)))?;
                file.set_len(last_len as u64)
                    .await
                    .map_err(|e| FsError::IoError(format!("truncate block failed: {}", e)))?;
                meta.length = last_len;
                meta.checksum = None;
                self.save_meta(inode_id, last_index, &meta).await?;
            }
        }
        Ok(())
    }

    /// Remove every block of an inode, dirty or not. Used by inode
    /// destruction and the startup orphan sweep.
    pub async fn remove_inode(&self, inode_id: InodeId) -> FsResult<()> {
        let dir = self.inode_dir(inode_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::IoError(format!("remove inode dir failed: {}", e))),
        }
    }

    /// Walk every present block in the store. Startup-time only.
    pub async fn scan(&self) -> FsResult<Vec<BlockEntry>> {
        let mut result = Vec::new();
        let mut shards = match fs::read_dir(&self.blocks_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(FsError::IoError(format!("read blocks dir failed: {}", e))),
        };
        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| FsError::IoError(format!("read blocks dir failed: {}", e)))?
        {
            let mut inodes = match fs::read_dir(shard.path()).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Some(inode_entry) = inodes
                .next_entry()
                .await
                .map_err(|e| FsError::IoError(format!("read shard dir failed: {}", e)))?
            {
                let Ok(inode_id) = inode_entry.file_name().to_string_lossy().parse::<InodeId>()
                else {
                    continue;
                };
                result.extend(self.iterate(inode_id).await?);
            }
        }
        Ok(result)
    }
}
