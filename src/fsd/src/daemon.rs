use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coord_store::{CoordStore, MemCoordStore};
use fs_core::Mount;
use fs_types::{FsConfig, FsError, FsResult};
use remote_client::{HttpBackend, MemBackend, RemoteBackend};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fsd/config.json";

/// In-memory backend scheme for offline and development mounts.
const MEM_ENDPOINT: &str = "mem:";

pub struct DaemonRunOptions {
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
    pub read_only: bool,
}

pub fn load_config(path: &PathBuf) -> FsResult<FsConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FsError::IoError(format!("read config {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<FsConfig>(&content)
        .map_err(|e| FsError::InvalidParam(format!("parse config failed: {}", e)))
}

fn build_backend(cfg: &FsConfig) -> FsResult<Arc<dyn RemoteBackend>> {
    if cfg.remote_endpoint == MEM_ENDPOINT {
        return Ok(Arc::new(MemBackend::new()));
    }
    Ok(Arc::new(HttpBackend::new(
        &cfg.remote_endpoint,
        Duration::from_secs(cfg.network_timeout_secs),
    )?))
}

fn build_coord(cfg: &FsConfig) -> Arc<dyn CoordStore> {
    // Mounts are single-host; the in-process store covers the intra-host
    // exclusion the engine needs. An external endpoint would slot in here.
    if let Some(url) = &cfg.coord_store_url {
        if !url.is_empty() {
            warn!("coord endpoint {} configured; using in-process store on this host", url);
        }
    }
    Arc::new(MemCoordStore::new())
}

pub fn run_daemon(options: DaemonRunOptions) -> FsResult<()> {
    let mut cfg = load_config(&options.config_path)?;
    if options.read_only {
        cfg.read_only = true;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| FsError::Internal(format!("build runtime failed: {}", e)))?;

    runtime.block_on(async move {
        let backend = build_backend(&cfg)?;
        let coord = build_coord(&cfg);
        let mount = Mount::mount(cfg, backend, coord).await?;

        info!(
            "serving {} (cache {})",
            options.mountpoint.display(),
            mount.cache().config().cache_root.display()
        );

        // The kernel bridge drives mount.apply(); this process stays up
        // until it is told to stop.
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| FsError::Internal(format!("signal wait failed: {}", e)))?;

        info!("shutdown requested, draining");
        mount.unmount().await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "cache_root": "/var/cache/fsd",
                "remote_endpoint": "http://127.0.0.1:3456",
                "root_capability": "dir:root"
            }"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.block_size, fs_types::DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.network_timeout_secs, fs_types::DEFAULT_NETWORK_TIMEOUT_SECS);
        assert!(!cfg.read_only);
        assert_eq!(cfg.inode_db_path(), PathBuf::from("/var/cache/fsd/inodes.db"));
    }

    #[test]
    fn test_load_config_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(&path).is_err());
    }
}
