use log::{debug, info, warn};
use pathmap_lib::{
    filename, marshal, normalize, normalize_parent_path, parent_path, parents_bottom_up,
    random_file_id, FileChecksumEntry, FileInfo, FileType, FilesystemStats, PathDbError,
    PathDbResult, PathMapEntry, PhysicalStore, ReclaimRecord, ROOT_DIR,
};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::PathDbConfig;
use crate::executor::AsyncJobExecutor;
use crate::store::IndexStore;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Outcome of one reclamation sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub reclaimed: usize,
    pub aborted: usize,
    pub failed: usize,
}

/// The path-mapped storage index.
///
/// Maps `(filesystem, path)` names to content-addressed blobs held in an
/// external physical store. Content is deduplicated through the checksum
/// index; a reverse index and per-filesystem counters follow every insert
/// and delete through background jobs, and blobs whose last reference is
/// gone are queued for deferred reclamation.
///
/// The primary path-map mutation of each operation is synchronous; the
/// reverse-map, counter, directory-materialization, and reclaim-queue side
/// effects run on the job executor's worker pool. Across operations,
/// ordering is only what the store's single-row semantics provide, so
/// callers with conflicting writes serialize them themselves.
pub struct PathDb {
    store: Arc<IndexStore>,
    executor: AsyncJobExecutor,
    gc_grace_period_hours: i64,
    proxy_sites_cache: RwLock<HashSet<String>>,
}

impl PathDb {
    pub fn new(config: PathDbConfig) -> PathDbResult<Self> {
        let store = Arc::new(IndexStore::open(&config)?);
        Ok(Self {
            store,
            executor: AsyncJobExecutor::new(config.job_queue_depth, config.job_worker_count),
            gc_grace_period_hours: config.gc_grace_period_hours,
            proxy_sites_cache: RwLock::new(HashSet::new()),
        })
    }

    // ========== existence ==========

    /// Check what kind of entry a path names. A path without a trailing `/`
    /// is probed under both its file and directory spelling.
    pub async fn exists(&self, filesystem: &str, path: &str) -> PathDbResult<Option<FileType>> {
        if path == ROOT_DIR {
            return Ok(Some(FileType::Dir));
        }
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            return Ok(None);
        };
        let found = if name.ends_with('/') {
            self.store
                .first_existing_filename(filesystem, &parent, &[name.as_str()])?
        } else {
            let dir_name = format!("{}/", name);
            self.store
                .first_existing_filename(filesystem, &parent, &[name.as_str(), dir_name.as_str()])?
        };
        match &found {
            Some(f) => debug!(
                "{} exists in filesystem {}, filename: {}",
                path, filesystem, f
            ),
            None => debug!("{} not exists in filesystem {}", path, filesystem),
        }
        Ok(found.map(|f| {
            if f.ends_with('/') {
                FileType::Dir
            } else {
                FileType::File
            }
        }))
    }

    /// Strict-file existence: only the exact file row counts.
    pub async fn exists_file(&self, filesystem: &str, path: &str) -> PathDbResult<bool> {
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            return Ok(false);
        };
        let count = self.store.exist_file_count(filesystem, &parent, &name)?;
        debug!(
            "file {} {} in filesystem {}",
            path,
            if count > 0 { "exists" } else { "not exists" },
            filesystem
        );
        Ok(count > 0)
    }

    pub async fn is_directory(&self, filesystem: &str, path: &str) -> PathDbResult<bool> {
        if path == ROOT_DIR {
            return Ok(true);
        }
        let dir_path = normalize_parent_path(path);
        let (Some(parent), Some(name)) = (parent_path(&dir_path), filename(&dir_path)) else {
            return Ok(false);
        };
        let found = self
            .store
            .first_existing_filename(filesystem, &parent, &[name.as_str()])?;
        Ok(found.is_some())
    }

    pub async fn is_file(&self, filesystem: &str, path: &str) -> PathDbResult<bool> {
        if path.ends_with('/') {
            return Ok(false);
        }
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            return Ok(false);
        };
        let found = self
            .store
            .first_existing_filename(filesystem, &parent, &[name.as_str()])?;
        Ok(found.is_some())
    }

    // ========== listing and traversal ==========

    pub async fn list(
        &self,
        filesystem: &str,
        path: &str,
        file_type: FileType,
    ) -> PathDbResult<Vec<PathMapEntry>> {
        let parent = normalize_parent_path(path);
        let entries = self.store.list_entries(filesystem, &parent)?;
        Ok(entries
            .into_iter()
            .filter(|e| file_type.matches(&e.filename))
            .collect())
    }

    pub async fn list_recursive(
        &self,
        filesystem: &str,
        path: &str,
        limit: usize,
        file_type: FileType,
    ) -> PathDbResult<Vec<PathMapEntry>> {
        let mut out = Vec::new();
        self.traverse(filesystem, path, |entry| out.push(entry.clone()), limit, file_type)
            .await?;
        Ok(out)
    }

    /// Pre-order depth-first walk below `path`. Every visited directory
    /// issues one list query; entries matching `file_type` are handed to
    /// the consumer. A `limit > 0` stops the walk after that many matches.
    pub async fn traverse(
        &self,
        filesystem: &str,
        path: &str,
        mut consumer: impl FnMut(&PathMapEntry),
        limit: usize,
        file_type: FileType,
    ) -> PathDbResult<()> {
        debug!("traverse filesystem: {}, path: {}", filesystem, path);

        // The root "/" has no row of its own; its children are listed under
        // the bare root prefix.
        let root_key = if path == ROOT_DIR {
            ROOT_DIR.to_string()
        } else {
            let dir_path = normalize_parent_path(path);
            let (Some(parent), Some(name)) = (parent_path(&dir_path), filename(&dir_path)) else {
                return Ok(());
            };
            match self.store.get_path_map(filesystem, &parent, &name)? {
                Some(entry) => normalize(&entry.parent_path, &entry.filename),
                None => {
                    debug!(
                        "traverse root not found, filesystem: {}, path: {}",
                        filesystem, dir_path
                    );
                    return Ok(());
                }
            }
        };

        let mut emitted = 0usize;
        let mut stack: Vec<PathMapEntry> = Vec::new();
        push_children(&mut stack, self.store.list_entries(filesystem, &root_key)?);
        while let Some(entry) = stack.pop() {
            if file_type.matches(&entry.filename) {
                consumer(&entry);
                emitted += 1;
                if limit > 0 && emitted >= limit {
                    info!("traverse reached result set limit {}", limit);
                    return Ok(());
                }
            }
            if entry.filename.ends_with('/') {
                let key = normalize(&entry.parent_path, &entry.filename);
                push_children(&mut stack, self.store.list_entries(filesystem, &key)?);
            }
        }
        Ok(())
    }

    // ========== point reads ==========

    pub async fn get_path_map(
        &self,
        filesystem: &str,
        path: &str,
    ) -> PathDbResult<Option<PathMapEntry>> {
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            debug!("get path map, filesystem: {}, invalid path: {}", filesystem, path);
            return Ok(None);
        };
        self.store.get_path_map(filesystem, &parent, &name)
    }

    pub async fn get_file_length(&self, filesystem: &str, path: &str) -> PathDbResult<i64> {
        Ok(self
            .get_path_map(filesystem, path)
            .await?
            .map(|e| e.size)
            .unwrap_or(-1))
    }

    pub async fn get_file_last_modified(&self, filesystem: &str, path: &str) -> PathDbResult<i64> {
        Ok(self
            .get_path_map(filesystem, path)
            .await?
            .filter(|e| e.file_id.is_some())
            .map(|e| e.creation)
            .unwrap_or(-1))
    }

    /// Resolve a path to its physical storage token. An expired entry is
    /// deleted on the spot and reported as absent; reads are the only
    /// expiration trigger.
    pub async fn get_storage_file(
        &self,
        filesystem: &str,
        path: &str,
    ) -> PathDbResult<Option<String>> {
        let Some(entry) = self.get_path_map(filesystem, path).await? else {
            return Ok(None);
        };
        if let Some(expiration) = entry.expiration {
            if expiration < now_millis() {
                info!(
                    "file expired, filesystem: {}, path: {}, expiration: {}",
                    filesystem, path, expiration
                );
                self.delete(filesystem, path).await?;
                return Ok(None);
            }
        }
        Ok(entry.file_storage)
    }

    pub async fn expire(&self, filesystem: &str, path: &str, expiration: i64) -> PathDbResult<()> {
        debug!(
            "set file expiration, filesystem: {}, path: {}, expiration: {}",
            filesystem, path, expiration
        );
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            return Ok(());
        };
        self.store
            .update_expiration(filesystem, &parent, &name, Some(expiration))
    }

    // ========== mutation ==========

    /// Insert or replace the entry at `(filesystem, path)`.
    ///
    /// Content with an already-known checksum is retargeted at the canonical
    /// blob and the caller's redundant copy is queued for reclamation; an
    /// unknown checksum registers the caller's blob as primary. Ancestor
    /// directories, the reverse map, and the filesystem counters follow
    /// through background jobs.
    pub async fn insert(
        &self,
        filesystem: &str,
        path: &str,
        creation: i64,
        expiration: Option<i64>,
        file_info: &FileInfo,
        size: i64,
        checksum: &str,
    ) -> PathDbResult<()> {
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            return Err(PathDbError::InvalidPath(path.to_string()));
        };
        let entry = PathMapEntry {
            filesystem: filesystem.to_string(),
            parent_path: parent,
            filename: name,
            file_id: Some(file_info.file_id.clone()),
            file_storage: Some(file_info.file_storage.clone()),
            size,
            creation,
            expiration,
            checksum: if checksum.is_empty() {
                None
            } else {
                Some(checksum.to_string())
            },
        };
        self.insert_entry(entry).await
    }

    async fn insert_entry(&self, mut entry: PathMapEntry) -> PathDbResult<()> {
        debug!("insert: {:?}", entry);
        let filesystem = entry.filesystem.clone();

        // Ancestor directories materialize behind the primary row write.
        {
            let store = self.store.clone();
            let fs = filesystem.clone();
            let parent = entry.parent_path.clone();
            self.executor
                .submit(async move {
                    if let Err(e) = make_dirs_in_store(&store, &fs, &parent) {
                        warn!(
                            "make dirs failed, filesystem: {}, path: {}, err: {}",
                            fs, parent, e
                        );
                    }
                })
                .await;
        }

        let path = entry.path();
        if self.get_path_map(&filesystem, &path).await?.is_some() {
            // Replace: run the predecessor through the delete flow so its
            // reverse-map and counter contributions are unwound first.
            self.delete(&filesystem, &path).await?;
        }

        let mut is_duplicate = false;
        if let Some(checksum) = entry.checksum.clone() {
            match self.store.get_file_checksum(&checksum)? {
                Some(existing) => {
                    debug!("file checksum exists, use existing file: {}", existing.storage);
                    is_duplicate = true;
                    let caller_storage = entry.file_storage.take();
                    entry.file_id = Some(existing.file_id.clone());
                    entry.file_storage = Some(existing.storage.clone());
                    if let Some(caller_storage) = caller_storage {
                        if caller_storage != existing.storage {
                            // The caller already wrote a redundant blob.
                            // Queue it under a tombstone id; the id names
                            // the queue entry, not the blob.
                            let store = self.store.clone();
                            let tombstone = random_file_id();
                            let checksum = checksum.clone();
                            self.executor
                                .submit(async move {
                                    if let Err(e) = enqueue_reclaim(
                                        &store,
                                        &tombstone,
                                        &caller_storage,
                                        Some(&checksum),
                                    ) {
                                        warn!(
                                            "reclaim enqueue failed, storage: {}, err: {}",
                                            caller_storage, e
                                        );
                                    }
                                })
                                .await;
                        }
                    }
                }
                None => {
                    debug!("file checksum not exists, mark current file as primary: {:?}", entry);
                    if let (Some(file_id), Some(storage)) =
                        (entry.file_id.clone(), entry.file_storage.clone())
                    {
                        self.store.save_file_checksum(&FileChecksumEntry {
                            checksum: checksum.clone(),
                            file_id,
                            storage,
                        })?;
                    }
                }
            }
        }

        self.store.save_path_map(&entry)?;

        {
            let store = self.store.clone();
            let fs = filesystem.clone();
            let path = path.clone();
            let entry = entry.clone();
            self.executor
                .submit(async move {
                    post_insertion_actions(&store, &fs, &path, &entry, is_duplicate);
                })
                .await;
        }

        debug!("insert finished: {}", entry.filename);
        Ok(())
    }

    pub async fn delete(&self, filesystem: &str, path: &str) -> PathDbResult<bool> {
        self.delete_with_force(filesystem, path, false).await
    }

    /// Delete the entry at `(filesystem, path)`. Deleting a missing entry
    /// succeeds. A directory must be empty unless `force` is set; force
    /// does not cascade to children.
    pub async fn delete_with_force(
        &self,
        filesystem: &str,
        path: &str,
        force: bool,
    ) -> PathDbResult<bool> {
        let mut found = self.get_path_map(filesystem, path).await?;
        if found.is_none() && !path.ends_with('/') {
            // A bare directory path ("/d" naming the row "d/") resolves to
            // its directory row, so the emptiness probe still applies.
            found = self.get_path_map(filesystem, &format!("{}/", path)).await?;
        }
        let Some(entry) = found else {
            debug!("file not exists, filesystem: {}, path: {}", filesystem, path);
            return Ok(true);
        };
        let logical_path = entry.path();

        if entry.file_id.is_none() {
            if force || self.is_empty_directory(filesystem, &logical_path)? {
                info!("delete dir (force: {}), {:?}", force, entry);
                self.store
                    .delete_path_map(filesystem, &entry.parent_path, &entry.filename)?;
                return Ok(true);
            }
            warn!("can not delete non-empty directory, {:?}", entry);
            return Ok(false);
        }

        info!("delete path map, {:?}", entry);
        self.store
            .delete_path_map(filesystem, &entry.parent_path, &entry.filename)?;

        let store = self.store.clone();
        let fs = filesystem.to_string();
        self.executor
            .submit(async move {
                post_deletion_actions(&store, &fs, &logical_path, &entry);
            })
            .await;
        Ok(true)
    }

    fn is_empty_directory(&self, filesystem: &str, path: &str) -> PathDbResult<bool> {
        let parent = normalize_parent_path(path);
        let count = self.store.count_children(filesystem, &parent)?;
        let empty = count <= 0;
        debug!(
            "dir '{}' is {} in filesystem '{}'",
            parent,
            if empty { "empty" } else { "not empty" },
            filesystem
        );
        Ok(empty)
    }

    /// Copy is a metadata operation: the target shares the source's blob.
    /// An existing target is deleted first. `creation`/`expiration`
    /// default to the source's values when not given.
    pub async fn copy(
        &self,
        from_filesystem: &str,
        from_path: &str,
        to_filesystem: &str,
        to_path: &str,
        creation: Option<i64>,
        expiration: Option<i64>,
    ) -> PathDbResult<bool> {
        let Some(source) = self.get_path_map(from_filesystem, from_path).await? else {
            warn!("copy source not found, {}:{}", from_filesystem, from_path);
            return Ok(false);
        };
        if self.get_path_map(to_filesystem, to_path).await?.is_some() {
            info!("copy target already exists, delete it. {}:{}", to_filesystem, to_path);
            self.delete(to_filesystem, to_path).await?;
        }
        let (Some(parent), Some(name)) = (parent_path(to_path), filename(to_path)) else {
            return Err(PathDbError::InvalidPath(to_path.to_string()));
        };
        let target = PathMapEntry {
            filesystem: to_filesystem.to_string(),
            parent_path: parent,
            filename: name,
            file_id: source.file_id.clone(),
            file_storage: source.file_storage.clone(),
            size: source.size,
            creation: creation.unwrap_or(source.creation),
            expiration: expiration.or(source.expiration),
            checksum: source.checksum.clone(),
        };
        self.insert_entry(target).await?;
        Ok(true)
    }

    /// Materialize every missing ancestor directory of `path`. Idempotent.
    pub async fn make_dirs(&self, filesystem: &str, path: &str) -> PathDbResult<()> {
        make_dirs_in_store(&self.store, filesystem, path)
    }

    // ========== reclamation ==========

    /// Reclaim records in the current hour partition that are older than
    /// the grace period. `limit = 0` lists the whole partition.
    pub async fn list_orphaned_files(&self, limit: usize) -> PathDbResult<Vec<ReclaimRecord>> {
        let now = now_millis();
        let partition = hour_of_day(now);
        let threshold = reclaim_threshold(now, self.gc_grace_period_hours);
        let records = self.store.list_reclaim(partition, threshold, limit)?;
        info!(
            "list orphaned files, now: {}, threshold: {}, limit: {}, size: {}",
            now,
            threshold,
            limit,
            records.len()
        );
        Ok(records)
    }

    pub async fn remove_from_reclaim(&self, record: &ReclaimRecord) -> PathDbResult<()> {
        self.store.delete_reclaim(record)
    }

    /// Run one reclamation pass against the physical store.
    ///
    /// Each listed record is double-checked against the reverse map first:
    /// a blob that picked up a reference since it was queued must not be
    /// deleted, and its stale record is dropped. The pass tolerates
    /// double-queued records and already-missing blobs.
    pub async fn sweep_orphaned_files(
        &self,
        physical: &dyn PhysicalStore,
        limit: usize,
    ) -> PathDbResult<SweepStats> {
        let mut stats = SweepStats::default();
        for record in self.list_orphaned_files(limit).await? {
            if !self.store.reverse_map_paths(&record.file_id)?.is_empty() {
                info!(
                    "reclaim aborted, blob is referenced again, file id: {}",
                    record.file_id
                );
                self.store.delete_reclaim(&record)?;
                stats.aborted += 1;
                continue;
            }
            let info = FileInfo {
                file_id: record.file_id.clone(),
                file_storage: record.storage.clone(),
            };
            if physical.delete(&info).await {
                self.store.delete_reclaim(&record)?;
                stats.reclaimed += 1;
            } else {
                warn!("physical delete failed, storage: {}", record.storage);
                stats.failed += 1;
            }
        }
        Ok(stats)
    }

    // ========== filesystems ==========

    pub async fn get_filesystem(&self, filesystem: &str) -> PathDbResult<Option<FilesystemStats>> {
        self.store.get_filesystem(filesystem)
    }

    pub async fn get_filesystems(&self) -> PathDbResult<Vec<FilesystemStats>> {
        self.store.list_filesystems()
    }

    /// Drop the counter row of an empty filesystem. Refused otherwise.
    pub async fn purge_filesystem(&self, filesystem: &str) -> PathDbResult<bool> {
        let Some(stats) = self.store.get_filesystem(filesystem)? else {
            return Ok(false);
        };
        if stats.file_count != 0 {
            warn!("refuse to purge non-empty filesystem, {:?}", stats);
            return Ok(false);
        }
        info!("purge filesystem: {:?}", stats);
        self.store.delete_filesystem(filesystem)?;
        Ok(true)
    }

    pub async fn get_file_checksum(
        &self,
        checksum: &str,
    ) -> PathDbResult<Option<FileChecksumEntry>> {
        self.store.get_file_checksum(checksum)
    }

    pub async fn get_paths_by_file_id(&self, file_id: &str) -> PathDbResult<HashSet<String>> {
        self.store.reverse_map_paths(file_id)
    }

    /// Which of the candidate filesystems contain `path`. Unordered.
    pub async fn get_file_system_containing(
        &self,
        candidates: &[String],
        path: &str,
    ) -> PathDbResult<HashSet<String>> {
        debug!(
            "get filesystems containing path {}, candidates: {:?}",
            path, candidates
        );
        if path == ROOT_DIR || candidates.is_empty() {
            return Ok(HashSet::new());
        }
        let (Some(parent), Some(name)) = (parent_path(path), filename(path)) else {
            return Ok(HashSet::new());
        };
        self.store.containing_filesystems(candidates, &parent, &name)
    }

    /// First candidate, in the caller's order, containing `path`. The store
    /// query carries no ordering, so the result set is filtered against the
    /// given list.
    pub async fn get_first_file_system_containing(
        &self,
        candidates: &[String],
        path: &str,
    ) -> PathDbResult<Option<String>> {
        let found = self.get_file_system_containing(candidates, path).await?;
        Ok(candidates
            .iter()
            .find(|c| found.contains(c.as_str()))
            .cloned())
    }

    // ========== proxy sites ==========

    pub async fn is_proxy_site(&self, site: &str) -> PathDbResult<bool> {
        self.store.is_proxy_site(site)
    }

    pub async fn get_proxy_site_list(&self) -> PathDbResult<Vec<String>> {
        self.store.list_proxy_sites()
    }

    pub async fn save_proxy_site(&self, site: &str) -> PathDbResult<()> {
        debug!("save proxy site, {}", site);
        self.store.save_proxy_site(site)?;
        if let Ok(mut cache) = self.proxy_sites_cache.write() {
            cache.insert(site.to_string());
        }
        Ok(())
    }

    pub async fn delete_proxy_site(&self, site: &str) -> PathDbResult<()> {
        debug!("delete proxy site, {}", site);
        self.store.delete_proxy_site(site)?;
        if let Ok(mut cache) = self.proxy_sites_cache.write() {
            cache.remove(site);
        }
        Ok(())
    }

    pub async fn delete_all_proxy_sites(&self) -> PathDbResult<()> {
        self.store.truncate_proxy_sites()?;
        if let Ok(mut cache) = self.proxy_sites_cache.write() {
            cache.clear();
        }
        Ok(())
    }

    /// Reload the in-memory proxy-site cache from the table. Mutations are
    /// write-through; this is the explicit warmup for a fresh instance.
    pub async fn refresh_proxy_sites_cache(&self) -> PathDbResult<()> {
        let sites = self.store.list_proxy_sites()?;
        if let Ok(mut cache) = self.proxy_sites_cache.write() {
            *cache = sites.into_iter().collect();
        }
        Ok(())
    }

    pub fn proxy_sites_cache(&self) -> HashSet<String> {
        self.proxy_sites_cache
            .read()
            .map(|cache| cache.clone())
            .unwrap_or_default()
    }

    // ========== lifecycle ==========

    /// Wait until every background job submitted so far has been applied.
    pub async fn flush_background_jobs(&self) {
        self.executor.flush().await;
    }

    /// Drain the background queue and park the store session. The instance
    /// stays usable; the next operation re-establishes what it needs.
    pub async fn close(&self) {
        info!("close path db");
        self.executor.shutdown_and_wait().await;
        self.store.close();
        debug!("path db closed");
    }
}

fn push_children(stack: &mut Vec<PathMapEntry>, children: Vec<PathMapEntry>) {
    // Reversed so the leftmost child is visited first off the stack.
    for child in children.into_iter().rev() {
        stack.push(child);
    }
}

fn make_dirs_in_store(store: &IndexStore, filesystem: &str, path: &str) -> PathDbResult<()> {
    debug!("make dirs, filesystem: {}, path: {}", filesystem, path);
    if path == ROOT_DIR {
        return Ok(());
    }
    let dir_path = normalize_parent_path(path);
    let (Some(parent), Some(name)) = (parent_path(&dir_path), filename(&dir_path)) else {
        return Ok(());
    };
    if store
        .first_existing_filename(filesystem, &parent, &[name.as_str()])?
        .is_some()
    {
        debug!("dir already exists, filesystem: {}, path: {}", filesystem, dir_path);
        return Ok(());
    }
    let mut persist = vec![dir_entry(filesystem, &parent, &name)];
    persist.extend(parents_bottom_up(filesystem, &parent, dir_entry));
    debug!("persist dirs: {:?}", persist);
    for entry in &persist {
        store.save_path_map_if_absent(entry)?;
    }
    Ok(())
}

fn dir_entry(filesystem: &str, parent_path: &str, name: &str) -> PathMapEntry {
    PathMapEntry {
        filesystem: filesystem.to_string(),
        parent_path: parent_path.to_string(),
        filename: name.to_string(),
        file_id: None,
        file_storage: None,
        size: 0,
        creation: now_millis(),
        expiration: None,
        checksum: None,
    }
}

fn post_insertion_actions(
    store: &IndexStore,
    filesystem: &str,
    path: &str,
    entry: &PathMapEntry,
    is_duplicate: bool,
) {
    if let Some(file_id) = &entry.file_id {
        if let Err(e) = store.reverse_map_add(file_id, &marshal(filesystem, path)) {
            warn!("reverse map add failed, file id: {}, err: {}", file_id, e);
        }
    }
    // Duplicates share a blob, so they add no physical bytes.
    let size = if is_duplicate { 0 } else { entry.size };
    if let Err(e) = store.filesystem_increment(filesystem, 1, size) {
        warn!("filesystem increment failed, filesystem: {}, err: {}", filesystem, e);
    }
}

fn post_deletion_actions(store: &IndexStore, filesystem: &str, path: &str, entry: &PathMapEntry) {
    let Some(file_id) = &entry.file_id else {
        return;
    };
    if let Err(e) = store.reverse_map_remove(file_id, &marshal(filesystem, path)) {
        warn!("reverse map remove failed, file id: {}, err: {}", file_id, e);
        return;
    }
    let remaining = match store.reverse_map_paths(file_id) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("reverse map read failed, file id: {}, err: {}", file_id, e);
            return;
        }
    };
    let mut reclaimed_size = 0;
    if remaining.is_empty() {
        // Last reference gone: retire the checksum row and queue the blob.
        if let Some(checksum) = &entry.checksum {
            debug!("delete file checksum, {}", checksum);
            if let Err(e) = store.delete_file_checksum(checksum) {
                warn!("file checksum delete failed, checksum: {}, err: {}", checksum, e);
            }
        }
        let storage = entry.file_storage.as_deref().unwrap_or_default();
        if let Err(e) = enqueue_reclaim(store, file_id, storage, entry.checksum.as_deref()) {
            warn!("reclaim enqueue failed, file id: {}, err: {}", file_id, e);
        }
        reclaimed_size = entry.size;
    }
    if let Err(e) = store.filesystem_decrement(filesystem, 1, reclaimed_size) {
        warn!("filesystem decrement failed, filesystem: {}, err: {}", filesystem, e);
    }
}

fn enqueue_reclaim(
    store: &IndexStore,
    file_id: &str,
    storage: &str,
    checksum: Option<&str>,
) -> PathDbResult<()> {
    let deletion = now_millis();
    let record = ReclaimRecord {
        partition: hour_of_day(deletion),
        deletion,
        file_id: file_id.to_string(),
        storage: storage.to_string(),
        checksum: checksum.map(|c| c.to_string()),
    };
    debug!("reclaim, {:?}", record);
    store.save_reclaim(&record)
}

fn reclaim_threshold(now: i64, grace_period_hours: i64) -> i64 {
    if grace_period_hours <= 0 {
        return now;
    }
    now - grace_period_hours * MILLIS_PER_HOUR
}

fn hour_of_day(millis: i64) -> i64 {
    (millis / MILLIS_PER_HOUR) % 24
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
