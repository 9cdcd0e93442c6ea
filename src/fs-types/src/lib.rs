mod block;
mod config;
mod inode;

pub use block::*;
pub use config::*;
pub use inode::*;

use reqwest::StatusCode;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("is a directory: {0}")]
    IsDir(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("stale version: {0}")]
    Stale(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("cache full: {0}")]
    CacheFull(String),
    #[error("corrupt block: {0}")]
    Corrupt(String),
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => FsError::NotFound(info),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => FsError::PermissionDenied(info),
            StatusCode::CONFLICT => FsError::AlreadyExists(info),
            _ => FsError::BackendUnavailable(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, FsError::Stale(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, FsError::Busy(_))
    }

    /// POSIX errno the caller-facing layer should report for this error.
    /// Recoverable kinds (Stale, Busy, Corrupt) only reach here once local
    /// recovery is exhausted.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotDir(_) => libc::ENOTDIR,
            FsError::IsDir(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::InvalidParam(_) => libc::EINVAL,
            FsError::Busy(_) => libc::EBUSY,
            FsError::CacheFull(_) => libc::ENOSPC,
            FsError::ReadOnly(_) => libc::EROFS,
            FsError::Stale(_)
            | FsError::BackendUnavailable(_)
            | FsError::Corrupt(_)
            | FsError::IoError(_)
            | FsError::DbError(_)
            | FsError::Internal(_)
            | FsError::Fatal(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

pub type InodeId = u64;
pub type HandleId = u64;
pub type Version = u64;

pub const ROOT_INODE_ID: InodeId = 1;

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
