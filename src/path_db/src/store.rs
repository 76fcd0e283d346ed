use log::debug;
use pathmap_lib::{FileChecksumEntry, FilesystemStats, PathDbResult, PathMapEntry, ReclaimRecord};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::HashSet;

use crate::config::PathDbConfig;
use crate::session::StoreSession;

/// Idempotent schema for the six index tables. Primary keys match the
/// wide-column contract; `reversemap` renders the per-blob path set as one
/// row per element so set add/remove stay single-statement operations.
pub(crate) const SCHEMA_DDL: &str = "
    CREATE TABLE IF NOT EXISTS pathmap (
        filesystem  TEXT NOT NULL,
        parentpath  TEXT NOT NULL,
        filename    TEXT NOT NULL,
        fileid      TEXT,
        filestorage TEXT,
        size        INTEGER NOT NULL DEFAULT 0,
        creation    INTEGER NOT NULL,
        expiration  INTEGER,
        checksum    TEXT,
        PRIMARY KEY (filesystem, parentpath, filename)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS reversemap (
        fileid TEXT NOT NULL,
        path   TEXT NOT NULL,
        PRIMARY KEY (fileid, path)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS reclaim (
        partition INTEGER NOT NULL,
        deletion  INTEGER NOT NULL,
        fileid    TEXT NOT NULL,
        storage   TEXT NOT NULL,
        checksum  TEXT,
        PRIMARY KEY (partition, deletion, fileid)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS filesystem (
        filesystem TEXT PRIMARY KEY,
        filecount  INTEGER NOT NULL DEFAULT 0,
        size       INTEGER NOT NULL DEFAULT 0
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS filechecksum (
        checksum TEXT PRIMARY KEY,
        fileid   TEXT NOT NULL,
        storage  TEXT NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS proxysites (
        site TEXT PRIMARY KEY
    ) WITHOUT ROWID;";

const PATHMAP_COLUMNS: &str = "filesystem, parentpath, filename, fileid, filestorage, size, creation, expiration, checksum";

/// Typed statement layer over the six tables.
///
/// Every method is one autonomous statement; the multi-table protocol above
/// never gets cross-table atomicity from this layer. The `exist_file_count`,
/// `first_existing_filename`, and `reverse_map_remove` statements are the
/// read-after-write-critical ones: a removal must be observed by the next
/// orphan check.
pub(crate) struct IndexStore {
    session: StoreSession,
}

impl IndexStore {
    pub fn open(config: &PathDbConfig) -> PathDbResult<Self> {
        Ok(Self {
            session: StoreSession::open(config)?,
        })
    }

    pub fn close(&self) {
        self.session.close();
    }

    // ========== pathmap ==========

    pub fn get_path_map(
        &self,
        filesystem: &str,
        parent_path: &str,
        filename: &str,
    ) -> PathDbResult<Option<PathMapEntry>> {
        let sql = format!(
            "SELECT {} FROM pathmap WHERE filesystem = ? AND parentpath = ? AND filename = ?",
            PATHMAP_COLUMNS
        );
        self.session.execute(|conn| {
            conn.prepare_cached(&sql)?
                .query_row(params![filesystem, parent_path, filename], entry_from_row)
                .optional()
        })
    }

    pub fn save_path_map(&self, entry: &PathMapEntry) -> PathDbResult<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO pathmap ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            PATHMAP_COLUMNS
        );
        self.session.execute(|conn| {
            conn.prepare_cached(&sql)?.execute(params![
                entry.filesystem,
                entry.parent_path,
                entry.filename,
                entry.file_id,
                entry.file_storage,
                entry.size,
                entry.creation,
                entry.expiration,
                entry.checksum,
            ])?;
            Ok(())
        })
    }

    /// Insert-if-absent used for directory materialization, so repeated
    /// `make_dirs` sweeps keep the original row untouched.
    pub fn save_path_map_if_absent(&self, entry: &PathMapEntry) -> PathDbResult<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO pathmap ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            PATHMAP_COLUMNS
        );
        self.session.execute(|conn| {
            conn.prepare_cached(&sql)?.execute(params![
                entry.filesystem,
                entry.parent_path,
                entry.filename,
                entry.file_id,
                entry.file_storage,
                entry.size,
                entry.creation,
                entry.expiration,
                entry.checksum,
            ])?;
            Ok(())
        })
    }

    pub fn delete_path_map(
        &self,
        filesystem: &str,
        parent_path: &str,
        filename: &str,
    ) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "DELETE FROM pathmap WHERE filesystem = ? AND parentpath = ? AND filename = ?",
            )?
            .execute(params![filesystem, parent_path, filename])?;
            Ok(())
        })
    }

    pub fn list_entries(
        &self,
        filesystem: &str,
        parent_path: &str,
    ) -> PathDbResult<Vec<PathMapEntry>> {
        let sql = format!(
            "SELECT {} FROM pathmap WHERE filesystem = ? AND parentpath = ? ORDER BY filename",
            PATHMAP_COLUMNS
        );
        self.session.execute(|conn| {
            conn.prepare_cached(&sql)?
                .query_map(params![filesystem, parent_path], entry_from_row)?
                .collect()
        })
    }

    pub fn count_children(&self, filesystem: &str, parent_path: &str) -> PathDbResult<i64> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "SELECT count(*) FROM pathmap WHERE filesystem = ? AND parentpath = ?",
            )?
            .query_row(params![filesystem, parent_path], |row| row.get(0))
        })
    }

    /// Strict-file existence count, scoped to the exact row key.
    pub fn exist_file_count(
        &self,
        filesystem: &str,
        parent_path: &str,
        filename: &str,
    ) -> PathDbResult<i64> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "SELECT count(*) FROM pathmap WHERE filesystem = ? AND parentpath = ? AND filename = ?",
            )?
            .query_row(params![filesystem, parent_path, filename], |row| row.get(0))
        })
    }

    /// IN-list existence probe over up to a handful of filename spellings.
    pub fn first_existing_filename(
        &self,
        filesystem: &str,
        parent_path: &str,
        filenames: &[&str],
    ) -> PathDbResult<Option<String>> {
        if filenames.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT filename FROM pathmap WHERE filesystem = ? AND parentpath = ? AND filename IN ({}) LIMIT 1",
            placeholders(filenames.len())
        );
        self.session.execute(|conn| {
            let values = [filesystem, parent_path]
                .into_iter()
                .chain(filenames.iter().copied());
            conn.prepare_cached(&sql)?
                .query_row(params_from_iter(values), |row| row.get(0))
                .optional()
        })
    }

    pub fn update_expiration(
        &self,
        filesystem: &str,
        parent_path: &str,
        filename: &str,
        expiration: Option<i64>,
    ) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "UPDATE pathmap SET expiration = ? WHERE filesystem = ? AND parentpath = ? AND filename = ?",
            )?
            .execute(params![expiration, filesystem, parent_path, filename])?;
            Ok(())
        })
    }

    /// Which of the candidate filesystems hold the given row. The result
    /// carries no ordering.
    pub fn containing_filesystems(
        &self,
        candidates: &[String],
        parent_path: &str,
        filename: &str,
    ) -> PathDbResult<HashSet<String>> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT filesystem FROM pathmap WHERE filesystem IN ({}) AND parentpath = ? AND filename = ?",
            placeholders(candidates.len())
        );
        self.session.execute(|conn| {
            let values = candidates
                .iter()
                .map(|c| c.as_str())
                .chain([parent_path, filename]);
            conn.prepare_cached(&sql)?
                .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
                .collect()
        })
    }

    // ========== reversemap ==========

    pub fn reverse_map_add(&self, file_id: &str, path: &str) -> PathDbResult<()> {
        debug!("add to reverse map, file id: {}, path: {}", file_id, path);
        self.session.execute(|conn| {
            conn.prepare_cached("INSERT OR IGNORE INTO reversemap (fileid, path) VALUES (?, ?)")?
                .execute(params![file_id, path])?;
            Ok(())
        })
    }

    pub fn reverse_map_remove(&self, file_id: &str, path: &str) -> PathDbResult<()> {
        debug!("delete from reverse map, file id: {}, path: {}", file_id, path);
        self.session.execute(|conn| {
            conn.prepare_cached("DELETE FROM reversemap WHERE fileid = ? AND path = ?")?
                .execute(params![file_id, path])?;
            Ok(())
        })
    }

    pub fn reverse_map_paths(&self, file_id: &str) -> PathDbResult<HashSet<String>> {
        self.session.execute(|conn| {
            conn.prepare_cached("SELECT path FROM reversemap WHERE fileid = ?")?
                .query_map(params![file_id], |row| row.get::<_, String>(0))?
                .collect()
        })
    }

    // ========== filesystem counters ==========

    pub fn filesystem_increment(&self, filesystem: &str, count: i64, size: i64) -> PathDbResult<()> {
        debug!("update filesystem '{}', count: +{}, size: +{}", filesystem, count, size);
        self.apply_filesystem_delta(filesystem, count, size)
    }

    pub fn filesystem_decrement(&self, filesystem: &str, count: i64, size: i64) -> PathDbResult<()> {
        debug!("update filesystem '{}', count: -{}, size: -{}", filesystem, count, size);
        self.apply_filesystem_delta(filesystem, -count, -size)
    }

    fn apply_filesystem_delta(&self, filesystem: &str, count: i64, size: i64) -> PathDbResult<()> {
        // Counter-column semantics: the row materializes on first update.
        self.session.execute(|conn| {
            conn.prepare_cached(
                "INSERT INTO filesystem (filesystem, filecount, size) VALUES (?, ?, ?)
                 ON CONFLICT(filesystem) DO UPDATE SET
                     filecount = filecount + excluded.filecount,
                     size = size + excluded.size",
            )?
            .execute(params![filesystem, count, size])?;
            Ok(())
        })
    }

    pub fn get_filesystem(&self, filesystem: &str) -> PathDbResult<Option<FilesystemStats>> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "SELECT filesystem, filecount, size FROM filesystem WHERE filesystem = ?",
            )?
            .query_row(params![filesystem], stats_from_row)
            .optional()
        })
    }

    pub fn list_filesystems(&self) -> PathDbResult<Vec<FilesystemStats>> {
        self.session.execute(|conn| {
            conn.prepare_cached("SELECT filesystem, filecount, size FROM filesystem")?
                .query_map([], stats_from_row)?
                .collect()
        })
    }

    pub fn delete_filesystem(&self, filesystem: &str) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached("DELETE FROM filesystem WHERE filesystem = ?")?
                .execute(params![filesystem])?;
            Ok(())
        })
    }

    // ========== filechecksum ==========

    pub fn get_file_checksum(&self, checksum: &str) -> PathDbResult<Option<FileChecksumEntry>> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "SELECT checksum, fileid, storage FROM filechecksum WHERE checksum = ?",
            )?
            .query_row(params![checksum], |row| {
                Ok(FileChecksumEntry {
                    checksum: row.get(0)?,
                    file_id: row.get(1)?,
                    storage: row.get(2)?,
                })
            })
            .optional()
        })
    }

    pub fn save_file_checksum(&self, entry: &FileChecksumEntry) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO filechecksum (checksum, fileid, storage) VALUES (?, ?, ?)",
            )?
            .execute(params![entry.checksum, entry.file_id, entry.storage])?;
            Ok(())
        })
    }

    pub fn delete_file_checksum(&self, checksum: &str) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached("DELETE FROM filechecksum WHERE checksum = ?")?
                .execute(params![checksum])?;
            Ok(())
        })
    }

    // ========== reclaim ==========

    pub fn save_reclaim(&self, record: &ReclaimRecord) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO reclaim (partition, deletion, fileid, storage, checksum)
                 VALUES (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                record.partition,
                record.deletion,
                record.file_id,
                record.storage,
                record.checksum,
            ])?;
            Ok(())
        })
    }

    pub fn list_reclaim(
        &self,
        partition: i64,
        threshold: i64,
        limit: usize,
    ) -> PathDbResult<Vec<ReclaimRecord>> {
        self.session.execute(|conn| {
            if limit > 0 {
                conn.prepare_cached(
                    "SELECT partition, deletion, fileid, storage, checksum FROM reclaim
                     WHERE partition = ? AND deletion < ? LIMIT ?",
                )?
                .query_map(params![partition, threshold, limit as i64], reclaim_from_row)?
                .collect()
            } else {
                conn.prepare_cached(
                    "SELECT partition, deletion, fileid, storage, checksum FROM reclaim
                     WHERE partition = ? AND deletion < ?",
                )?
                .query_map(params![partition, threshold], reclaim_from_row)?
                .collect()
            }
        })
    }

    pub fn delete_reclaim(&self, record: &ReclaimRecord) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached(
                "DELETE FROM reclaim WHERE partition = ? AND deletion = ? AND fileid = ?",
            )?
            .execute(params![record.partition, record.deletion, record.file_id])?;
            Ok(())
        })
    }

    // ========== proxysites ==========

    pub fn is_proxy_site(&self, site: &str) -> PathDbResult<bool> {
        let found: Option<String> = self.session.execute(|conn| {
            conn.prepare_cached("SELECT site FROM proxysites WHERE site = ?")?
                .query_row(params![site], |row| row.get(0))
                .optional()
        })?;
        Ok(found.is_some())
    }

    pub fn list_proxy_sites(&self) -> PathDbResult<Vec<String>> {
        self.session.execute(|conn| {
            conn.prepare_cached("SELECT site FROM proxysites")?
                .query_map([], |row| row.get::<_, String>(0))?
                .collect()
        })
    }

    pub fn save_proxy_site(&self, site: &str) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached("INSERT OR IGNORE INTO proxysites (site) VALUES (?)")?
                .execute(params![site])?;
            Ok(())
        })
    }

    pub fn delete_proxy_site(&self, site: &str) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached("DELETE FROM proxysites WHERE site = ?")?
                .execute(params![site])?;
            Ok(())
        })
    }

    pub fn truncate_proxy_sites(&self) -> PathDbResult<()> {
        self.session.execute(|conn| {
            conn.prepare_cached("DELETE FROM proxysites")?.execute([])?;
            Ok(())
        })
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<PathMapEntry> {
    Ok(PathMapEntry {
        filesystem: row.get(0)?,
        parent_path: row.get(1)?,
        filename: row.get(2)?,
        file_id: row.get(3)?,
        file_storage: row.get(4)?,
        size: row.get(5)?,
        creation: row.get(6)?,
        expiration: row.get(7)?,
        checksum: row.get(8)?,
    })
}

fn stats_from_row(row: &Row<'_>) -> rusqlite::Result<FilesystemStats> {
    Ok(FilesystemStats {
        filesystem: row.get(0)?,
        file_count: row.get(1)?,
        size: row.get(2)?,
    })
}

fn reclaim_from_row(row: &Row<'_>) -> rusqlite::Result<ReclaimRecord> {
    Ok(ReclaimRecord {
        partition: row.get(0)?,
        deletion: row.get(1)?,
        file_id: row.get(2)?,
        storage: row.get(3)?,
        checksum: row.get(4)?,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
