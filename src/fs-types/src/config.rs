use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;
pub const DEFAULT_CACHE_BYTES_MAX: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_BLOCK_TTL_SECS: u64 = 10;
pub const DEFAULT_DIRTY_FLUSH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;
pub const DEFAULT_PULL_GLOBAL_LIMIT: usize = 16;
pub const DEFAULT_PULL_INODE_LIMIT: usize = 4;
pub const DEFAULT_PUSH_GLOBAL_LIMIT: usize = 4;
pub const DEFAULT_PUSH_RETRY_LIMIT: u32 = 5;

fn default_cache_bytes_max() -> u64 {
    DEFAULT_CACHE_BYTES_MAX
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_block_ttl_secs() -> u64 {
    DEFAULT_BLOCK_TTL_SECS
}

fn default_dirty_flush_interval_secs() -> u64 {
    DEFAULT_DIRTY_FLUSH_INTERVAL_SECS
}

fn default_network_timeout_secs() -> u64 {
    DEFAULT_NETWORK_TIMEOUT_SECS
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

fn default_pull_global_limit() -> usize {
    DEFAULT_PULL_GLOBAL_LIMIT
}

fn default_pull_inode_limit() -> usize {
    DEFAULT_PULL_INODE_LIMIT
}

fn default_push_global_limit() -> usize {
    DEFAULT_PUSH_GLOBAL_LIMIT
}

fn default_push_retry_limit() -> u32 {
    DEFAULT_PUSH_RETRY_LIMIT
}

/// Mount-time configuration, delivered by the mount driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub cache_root: PathBuf,
    pub remote_endpoint: String,
    pub root_capability: String,
    /// Path of the SQLite inode store file. Defaults to `<cache_root>/inodes.db`.
    #[serde(default)]
    pub inode_store_url: Option<String>,
    /// Endpoint of the coordination service. Empty means in-process.
    #[serde(default)]
    pub coord_store_url: Option<String>,
    #[serde(default = "default_cache_bytes_max")]
    pub cache_bytes_max: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_block_ttl_secs")]
    pub block_ttl_secs: u64,
    #[serde(default = "default_dirty_flush_interval_secs")]
    pub dirty_flush_interval_secs: u64,
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_pull_global_limit")]
    pub pull_global_limit: usize,
    #[serde(default = "default_pull_inode_limit")]
    pub pull_inode_limit: usize,
    #[serde(default = "default_push_global_limit")]
    pub push_global_limit: usize,
    #[serde(default = "default_push_retry_limit")]
    pub push_retry_limit: u32,
    /// Mount the tree read-only; every mutating operation fails with EROFS.
    #[serde(default)]
    pub read_only: bool,
}

impl FsConfig {
    pub fn new(cache_root: PathBuf, remote_endpoint: String, root_capability: String) -> Self {
        Self {
            cache_root,
            remote_endpoint,
            root_capability,
            inode_store_url: None,
            coord_store_url: None,
            cache_bytes_max: DEFAULT_CACHE_BYTES_MAX,
            block_size: DEFAULT_BLOCK_SIZE,
            block_ttl_secs: DEFAULT_BLOCK_TTL_SECS,
            dirty_flush_interval_secs: DEFAULT_DIRTY_FLUSH_INTERVAL_SECS,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            pull_global_limit: DEFAULT_PULL_GLOBAL_LIMIT,
            pull_inode_limit: DEFAULT_PULL_INODE_LIMIT,
            push_global_limit: DEFAULT_PUSH_GLOBAL_LIMIT,
            push_retry_limit: DEFAULT_PUSH_RETRY_LIMIT,
            read_only: false,
        }
    }

    pub fn inode_db_path(&self) -> PathBuf {
        match &self.inode_store_url {
            Some(url) if !url.is_empty() => PathBuf::from(url),
            _ => self.cache_root.join("inodes.db"),
        }
    }
}
