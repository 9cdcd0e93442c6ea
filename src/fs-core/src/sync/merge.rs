use std::collections::BTreeMap;

use fs_types::{DirEntry, InodeId, InodeRecord};

/// How a rebase reconciles a locally dirty inode with a diverged remote copy.
/// The engine preserves locally dirty blocks unconditionally; the policy
/// decides the surviving file size and the merged directory child set.
pub trait MergePolicy: Send + Sync {
    /// Merged logical size after pulling a diverged remote object of
    /// `remote_len` bytes under a locally dirty record.
    fn merge_file_size(&self, local: &InodeRecord, remote_len: u64) -> u64;

    /// Merged child set: `local` is the authoritative local listing,
    /// `remote` the freshly pulled one (already resolved to local inode
    /// ids), `tombstones` the names removed locally since the last push.
    fn merge_children(
        &self,
        local: &[DirEntry],
        remote: &[(String, InodeId)],
        tombstones: &[String],
    ) -> Vec<(String, InodeId)>;
}

/// Default policy: last writer wins for file data (the in-flight local push
/// is the later writer, so local dirty bytes and local extensions survive);
/// directory adds are unioned and locally performed removes win.
pub struct LastWriterWins;

impl MergePolicy for LastWriterWins {
    fn merge_file_size(&self, local: &InodeRecord, remote_len: u64) -> u64 {
        if local.mtime >= local.last_sync_ts {
            // Local writes are newer than the last agreed state: keep the
            // local length, extended by any remote growth past it.
            std::cmp::max(local.size, remote_len)
        } else {
            remote_len
        }
    }

    fn merge_children(
        &self,
        local: &[DirEntry],
        remote: &[(String, InodeId)],
        tombstones: &[String],
    ) -> Vec<(String, InodeId)> {
        let mut merged: BTreeMap<String, InodeId> = BTreeMap::new();
        for (name, child_id) in remote {
            if tombstones.iter().any(|t| t == name) {
                continue;
            }
            merged.insert(name.clone(), *child_id);
        }
        // Local entries override remote ones of the same name and add the
        // not-yet-pushed creations.
        for entry in local {
            merged.insert(entry.name.clone(), entry.child_id);
        }
        merged.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_types::{InodeKind, ROOT_INODE_ID};

    fn local_entry(name: &str, id: InodeId) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            child_id: id,
            kind: InodeKind::File,
        }
    }

    #[test]
    fn test_merge_children_union_and_tombstones() {
        let policy = LastWriterWins;
        let local = vec![local_entry("local_new", 10), local_entry("both", 11)];
        let remote = vec![
            ("both".to_string(), 11),
            ("remote_new".to_string(), 12),
            ("locally_removed".to_string(), 13),
        ];
        let tombstones = vec!["locally_removed".to_string()];

        let merged = policy.merge_children(&local, &remote, &tombstones);
        let names: Vec<&str> = merged.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["both", "local_new", "remote_new"]);
    }

    #[test]
    fn test_merge_file_size_local_newer() {
        let policy = LastWriterWins;
        let mut record = InodeRecord::new_file(ROOT_INODE_ID, "f", 0o644, 0, 0);
        record.size = 100;
        record.mtime = 2000;
        record.last_sync_ts = 1000;
        assert_eq!(policy.merge_file_size(&record, 50), 100);
        assert_eq!(policy.merge_file_size(&record, 400), 400);
    }

    #[test]
    fn test_merge_file_size_remote_newer() {
        let policy = LastWriterWins;
        let mut record = InodeRecord::new_file(ROOT_INODE_ID, "f", 0o644, 0, 0);
        record.size = 100;
        record.mtime = 500;
        record.last_sync_ts = 1000;
        assert_eq!(policy.merge_file_size(&record, 50), 50);
    }
}
