use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use fs_types::{FsResult, InodeKind};

/// Opaque capability issued by the remote backend, naming an immutable
/// object. The core never inspects its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(String);

impl ObjectRef {
    pub fn new(cap: impl Into<String>) -> Self {
        ObjectRef(cap.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One child in a remote directory listing. `size` is the object's logical
/// length when the backend reports one; it seeds inode discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDirEntry {
    pub name: String,
    pub child_ref: ObjectRef,
    pub kind: InodeKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
}

/// The minimal capability interface the core consumes from the distributed
/// object store. Objects are immutable: every write yields a new capability.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Fetch object bytes, optionally restricted to a byte range.
    async fn get_object(&self, obj: &ObjectRef, range: Option<Range<u64>>) -> FsResult<Vec<u8>>;

    /// Store bytes; returns the capability of the new object.
    async fn put_object(&self, data: &[u8]) -> FsResult<ObjectRef>;

    async fn get_dir(&self, obj: &ObjectRef) -> FsResult<Vec<RemoteDirEntry>>;

    /// Write a directory's child set; `prior` is the capability being
    /// superseded, when one exists.
    async fn put_dir(
        &self,
        prior: Option<&ObjectRef>,
        entries: &[RemoteDirEntry],
    ) -> FsResult<ObjectRef>;

    async fn delete(&self, obj: &ObjectRef) -> FsResult<()>;
}
