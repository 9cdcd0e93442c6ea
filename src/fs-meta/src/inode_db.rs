use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use fs_types::{
    unix_timestamp, DirEntry, DirtyMask, FsError, FsResult, InodeId, InodeKind, InodeRecord,
    Version, ROOT_INODE_ID,
};

/// Durable map over inode rows and directory entries, transactional at the
/// granularity of a single inode. `version` is the optimistic-concurrency
/// key: `update` fails with `Stale` when the stored version differs from the
/// caller's expected version.
pub struct InodeStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> FsError {
    FsError::DbError(e.to_string())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InodeRecord> {
    let kind_str: String = row.get(1)?;
    let kind = InodeKind::from_str(&kind_str)
        .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?;
    Ok(InodeRecord {
        inode_id: row.get::<_, i64>(0)? as InodeId,
        kind,
        mode: row.get::<_, i64>(2)? as u32,
        uid: row.get::<_, i64>(3)? as u32,
        gid: row.get::<_, i64>(4)? as u32,
        size: row.get::<_, i64>(5)? as u64,
        atime: row.get::<_, i64>(6)? as u64,
        mtime: row.get::<_, i64>(7)? as u64,
        ctime: row.get::<_, i64>(8)? as u64,
        nlink: row.get::<_, i64>(9)? as u32,
        remote_ref: row.get(10)?,
        parent_id: row.get::<_, Option<i64>>(11)?.map(|v| v as InodeId),
        name_in_parent: row.get(12)?,
        symlink_target: row.get(13)?,
        version: row.get::<_, i64>(14)? as Version,
        dirty_mask: DirtyMask::from_bits(row.get::<_, i64>(15)? as u8),
        last_sync_ts: row.get::<_, i64>(16)? as u64,
    })
}

const INODE_COLUMNS: &str = "inode_id, kind, mode, uid, gid, size, atime, mtime, ctime, nlink, \
     remote_ref, parent_id, name_in_parent, symlink_target, version, dirty_mask, last_sync_ts";

impl InodeStore {
    pub fn new(db_path: &Path) -> FsResult<Self> {
        debug!("InodeStore: open db at {}", db_path.to_string_lossy());
        let conn = Connection::open(db_path).map_err(|e| {
            warn!("InodeStore: open db failed! {}", e);
            FsError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS inodes (
                inode_id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                mode INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                size INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                ctime INTEGER NOT NULL,
                nlink INTEGER NOT NULL,
                remote_ref TEXT,
                parent_id INTEGER,
                name_in_parent TEXT NOT NULL,
                symlink_target TEXT,
                version INTEGER NOT NULL,
                dirty_mask INTEGER NOT NULL,
                last_sync_ts INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("InodeStore: create inodes table failed! {}", e);
            FsError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dentries (
                parent_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                child_id INTEGER NOT NULL,
                PRIMARY KEY (parent_id, name)
            )",
            [],
        )
        .map_err(|e| {
            warn!("InodeStore: create dentries table failed! {}", e);
            FsError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_dentries_child ON dentries(child_id)",
            [],
        )
        .map_err(db_err)?;

        // Names removed locally but not yet pushed. A remote listing must not
        // resurrect them; cleared once the parent's push lands.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tombstones (
                parent_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                deleted_at INTEGER NOT NULL,
                PRIMARY KEY (parent_id, name)
            )",
            [],
        )
        .map_err(db_err)?;

        let store = Self { conn: Mutex::new(conn) };
        store.bootstrap_root()?;
        Ok(store)
    }

    fn bootstrap_root(&self) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT inode_id FROM inodes WHERE inode_id = ?1",
                params![ROOT_INODE_ID as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if exists.is_some() {
            return Ok(());
        }

        let now = unix_timestamp() as i64;
        conn.execute(
            "INSERT INTO inodes (inode_id, kind, mode, uid, gid, size, atime, mtime, ctime,
                nlink, remote_ref, parent_id, name_in_parent, symlink_target, version,
                dirty_mask, last_sync_ts)
             VALUES (?1, 'dir', 493, 0, 0, 0, ?2, ?2, ?2, 2, NULL, NULL, '', NULL, 0, 0, 0)",
            params![ROOT_INODE_ID as i64, now],
        )
        .map_err(|e| {
            warn!("InodeStore: bootstrap root failed! {}", e);
            FsError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn get(&self, inode_id: InodeId) -> FsResult<InodeRecord> {
        self.try_get(inode_id)?
            .ok_or_else(|| FsError::NotFound(format!("inode not found: {}", inode_id)))
    }

    pub fn try_get(&self, inode_id: InodeId) -> FsResult<Option<InodeRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM inodes WHERE inode_id = ?1", INODE_COLUMNS),
            params![inode_id as i64],
            row_to_record,
        )
        .optional()
        .map_err(|e| {
            warn!("InodeStore: get inode failed! {}", e);
            FsError::DbError(e.to_string())
        })
    }

    /// Lookup through the dentry table; directory block content is never
    /// consulted.
    pub fn get_by_path(&self, parent_id: InodeId, name: &str) -> FsResult<Option<InodeRecord>> {
        let conn = self.conn.lock().unwrap();
        let qualified_columns: String = INODE_COLUMNS
            .split(", ")
            .map(|c| format!("inodes.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.query_row(
            &format!(
                "SELECT {} FROM inodes
                 JOIN dentries ON dentries.child_id = inodes.inode_id
                 WHERE dentries.parent_id = ?1 AND dentries.name = ?2",
                qualified_columns
            ),
            params![parent_id as i64, name],
            row_to_record,
        )
        .optional()
        .map_err(|e| {
            warn!("InodeStore: get_by_path failed! {}", e);
            FsError::DbError(e.to_string())
        })
    }

    /// Insert a new inode and, when it has a parent, its dentry, in one
    /// transaction. Assigns and returns the new monotonic inode id.
    pub fn insert(&self, record: &mut InodeRecord) -> FsResult<InodeId> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;

        if let Some(parent_id) = record.parent_id {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT child_id FROM dentries WHERE parent_id = ?1 AND name = ?2",
                    params![parent_id as i64, record.name_in_parent],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if existing.is_some() {
                return Err(FsError::AlreadyExists(format!(
                    "entry exists: {}/{}",
                    parent_id, record.name_in_parent
                )));
            }
        }

        tx.execute(
            "INSERT INTO inodes (kind, mode, uid, gid, size, atime, mtime, ctime, nlink,
                remote_ref, parent_id, name_in_parent, symlink_target, version, dirty_mask,
                last_sync_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.kind.to_str(),
                record.mode as i64,
                record.uid as i64,
                record.gid as i64,
                record.size as i64,
                record.atime as i64,
                record.mtime as i64,
                record.ctime as i64,
                record.nlink as i64,
                record.remote_ref,
                record.parent_id.map(|v| v as i64),
                record.name_in_parent,
                record.symlink_target,
                record.version as i64,
                record.dirty_mask.bits() as i64,
                record.last_sync_ts as i64,
            ],
        )
        .map_err(|e| {
            warn!("InodeStore: insert inode failed! {}", e);
            FsError::DbError(e.to_string())
        })?;
        let inode_id = tx.last_insert_rowid() as InodeId;

        if let Some(parent_id) = record.parent_id {
            tx.execute(
                "INSERT INTO dentries (parent_id, name, child_id) VALUES (?1, ?2, ?3)",
                params![parent_id as i64, record.name_in_parent, inode_id as i64],
            )
            .map_err(|e| {
                warn!("InodeStore: insert dentry failed! {}", e);
                FsError::DbError(e.to_string())
            })?;
        }

        tx.commit().map_err(db_err)?;
        record.inode_id = inode_id;
        Ok(inode_id)
    }

    /// Compare-and-set update: the row is written only when its stored
    /// version equals `expected_version`.
    pub fn update(&self, record: &InodeRecord, expected_version: Version) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE inodes SET kind = ?1, mode = ?2, uid = ?3, gid = ?4, size = ?5,
                    atime = ?6, mtime = ?7, ctime = ?8, nlink = ?9, remote_ref = ?10,
                    parent_id = ?11, name_in_parent = ?12, symlink_target = ?13, version = ?14,
                    dirty_mask = ?15, last_sync_ts = ?16
                 WHERE inode_id = ?17 AND version = ?18",
                params![
                    record.kind.to_str(),
                    record.mode as i64,
                    record.uid as i64,
                    record.gid as i64,
                    record.size as i64,
                    record.atime as i64,
                    record.mtime as i64,
                    record.ctime as i64,
                    record.nlink as i64,
                    record.remote_ref,
                    record.parent_id.map(|v| v as i64),
                    record.name_in_parent,
                    record.symlink_target,
                    record.version as i64,
                    record.dirty_mask.bits() as i64,
                    record.last_sync_ts as i64,
                    record.inode_id as i64,
                    expected_version as i64,
                ],
            )
            .map_err(|e| {
                warn!("InodeStore: update inode failed! {}", e);
                FsError::DbError(e.to_string())
            })?;

        if changed == 1 {
            return Ok(());
        }

        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM inodes WHERE inode_id = ?1",
                params![record.inode_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match exists {
            Some(actual) => Err(FsError::Stale(format!(
                "inode {} at version {}, expected {}",
                record.inode_id, actual, expected_version
            ))),
            None => Err(FsError::NotFound(format!("inode not found: {}", record.inode_id))),
        }
    }

    /// Remove the inode row and any dentries pointing at it.
    pub fn delete(&self, inode_id: InodeId) -> FsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM dentries WHERE child_id = ?1",
            params![inode_id as i64],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM inodes WHERE inode_id = ?1",
            params![inode_id as i64],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Children of a directory in lexicographic name order, the order the
    /// readdir cursor is defined over.
    pub fn list_children(&self, parent_id: InodeId) -> FsResult<Vec<DirEntry>> {
        self.list_children_after(parent_id, None, usize::MAX)
    }

    /// Children with names strictly greater than `cursor`, up to `limit`.
    pub fn list_children_after(
        &self,
        parent_id: InodeId,
        cursor: Option<&str>,
        limit: usize,
    ) -> FsResult<Vec<DirEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT dentries.name, dentries.child_id, inodes.kind
                 FROM dentries JOIN inodes ON inodes.inode_id = dentries.child_id
                 WHERE dentries.parent_id = ?1 AND dentries.name > ?2
                 ORDER BY dentries.name ASC
                 LIMIT ?3",
            )
            .map_err(db_err)?;
        let limit = std::cmp::min(limit, i64::MAX as usize) as i64;
        let rows = stmt
            .query_map(params![parent_id as i64, cursor.unwrap_or(""), limit], |row| {
                let kind_str: String = row.get(2)?;
                let kind = InodeKind::from_str(&kind_str)
                    .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?;
                Ok(DirEntry {
                    name: row.get(0)?,
                    child_id: row.get::<_, i64>(1)? as InodeId,
                    kind,
                })
            })
            .map_err(db_err)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }

    /// Atomically replace the whole child set of a directory. Readers see
    /// either the full old set or the full new set, never a mix.
    pub fn replace_children(
        &self,
        parent_id: InodeId,
        entries: &[(String, InodeId)],
    ) -> FsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM dentries WHERE parent_id = ?1",
            params![parent_id as i64],
        )
        .map_err(db_err)?;
        for (name, child_id) in entries {
            tx.execute(
                "INSERT INTO dentries (parent_id, name, child_id) VALUES (?1, ?2, ?3)",
                params![parent_id as i64, name, *child_id as i64],
            )
            .map_err(|e| {
                warn!("InodeStore: replace_children insert failed! {}", e);
                FsError::DbError(e.to_string())
            })?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn add_entry(&self, parent_id: InodeId, name: &str, child_id: InodeId) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO dentries (parent_id, name, child_id) VALUES (?1, ?2, ?3)",
            params![parent_id as i64, name, child_id as i64],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(FsError::AlreadyExists(format!("entry exists: {}/{}", parent_id, name)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn remove_entry(&self, parent_id: InodeId, name: &str) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM dentries WHERE parent_id = ?1 AND name = ?2",
                params![parent_id as i64, name],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(FsError::NotFound(format!("no entry: {}/{}", parent_id, name)));
        }
        Ok(())
    }

    /// Atomic rename in a single transaction. When the destination name
    /// exists it is replaced; the displaced child id is returned so the
    /// caller can finalize it. A displaced directory loses its only name and
    /// is fully unlinked; a displaced file loses one link. Kind and
    /// emptiness compatibility of source and destination is the caller's
    /// responsibility (the POSIX checks live in the rename operation).
    pub fn rename_entry(
        &self,
        old_parent: InodeId,
        old_name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> FsResult<Option<InodeId>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;

        let moved: Option<i64> = tx
            .query_row(
                "SELECT child_id FROM dentries WHERE parent_id = ?1 AND name = ?2",
                params![old_parent as i64, old_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let moved = moved
            .ok_or_else(|| FsError::NotFound(format!("no entry: {}/{}", old_parent, old_name)))?;

        let displaced: Option<i64> = tx
            .query_row(
                "SELECT child_id FROM dentries WHERE parent_id = ?1 AND name = ?2",
                params![new_parent as i64, new_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        if let Some(displaced) = displaced {
            let displaced_kind: String = tx
                .query_row(
                    "SELECT kind FROM inodes WHERE inode_id = ?1",
                    params![displaced],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            tx.execute(
                "DELETE FROM dentries WHERE parent_id = ?1 AND name = ?2",
                params![new_parent as i64, new_name],
            )
            .map_err(db_err)?;
            if displaced_kind == "dir" {
                tx.execute(
                    "UPDATE inodes SET nlink = 0, version = version + 1 WHERE inode_id = ?1",
                    params![displaced],
                )
                .map_err(db_err)?;
            } else {
                tx.execute(
                    "UPDATE inodes SET nlink = MAX(nlink - 1, 0), version = version + 1
                     WHERE inode_id = ?1",
                    params![displaced],
                )
                .map_err(db_err)?;
            }
        }

        tx.execute(
            "DELETE FROM dentries WHERE parent_id = ?1 AND name = ?2",
            params![old_parent as i64, old_name],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO dentries (parent_id, name, child_id) VALUES (?1, ?2, ?3)",
            params![new_parent as i64, new_name, moved],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE inodes SET parent_id = ?1, name_in_parent = ?2, version = version + 1,
                ctime = ?3
             WHERE inode_id = ?4",
            params![new_parent as i64, new_name, unix_timestamp() as i64, moved],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(displaced.map(|v| v as InodeId))
    }

    pub fn add_tombstone(&self, parent_id: InodeId, name: &str) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO tombstones (parent_id, name, deleted_at) VALUES (?1, ?2, ?3)",
            params![parent_id as i64, name, unix_timestamp() as i64],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn list_tombstones(&self, parent_id: InodeId) -> FsResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM tombstones WHERE parent_id = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![parent_id as i64], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(db_err)?);
        }
        Ok(names)
    }

    pub fn clear_tombstones(&self, parent_id: InodeId) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM tombstones WHERE parent_id = ?1",
            params![parent_id as i64],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Inodes with no remaining links, candidates for finalization.
    pub fn list_orphans(&self) -> FsResult<Vec<InodeId>> {
        self.query_ids("SELECT inode_id FROM inodes WHERE nlink = 0")
    }

    /// Inodes with local changes awaiting a push.
    pub fn list_dirty(&self) -> FsResult<Vec<InodeId>> {
        self.query_ids("SELECT inode_id FROM inodes WHERE dirty_mask != 0")
    }

    pub fn all_inode_ids(&self) -> FsResult<Vec<InodeId>> {
        self.query_ids("SELECT inode_id FROM inodes")
    }

    fn query_ids(&self, sql: &str) -> FsResult<Vec<InodeId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)? as InodeId);
        }
        Ok(ids)
    }
}
