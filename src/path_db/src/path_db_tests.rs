#[cfg(test)]
mod tests {
    use crate::config::PathDbConfig;
    use crate::path_db::PathDb;
    use blob_store::FileBasedBlobStore;
    use pathmap_lib::{FileInfo, FileType, PhysicalStore};
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::time::sleep;

    fn test_config(tmp: &TempDir) -> PathDbConfig {
        let mut config = PathDbConfig::new(tmp.path().join("pathmap.db"));
        config.gc_grace_period_hours = 0;
        config
    }

    fn create_db(tmp: &TempDir) -> PathDb {
        PathDb::new(test_config(tmp)).unwrap()
    }

    fn info(file_id: &str, storage: &str) -> FileInfo {
        FileInfo {
            file_id: file_id.to_string(),
            file_storage: storage.to_string(),
        }
    }

    /// Flush background jobs, then step past the reclaim threshold
    /// (`deletion < now` is strict).
    async fn settle(db: &PathDb) {
        db.flush_background_jobs().await;
        sleep(Duration::from_millis(5)).await;
    }

    // ==================== Scenarios ====================

    #[tokio::test]
    async fn test_basic_create_read() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        assert_eq!(db.exists("fs1", "/a/b.txt").await.unwrap(), Some(FileType::File));
        assert_eq!(db.exists("fs1", "/a").await.unwrap(), Some(FileType::Dir));
        assert_eq!(db.exists("fs1", "/").await.unwrap(), Some(FileType::Dir));
        assert_eq!(db.get_file_length("fs1", "/a/b.txt").await.unwrap(), 5);
        assert_eq!(db.get_file_last_modified("fs1", "/a/b.txt").await.unwrap(), 100);

        let stats = db.get_filesystem("fs1").await.unwrap().unwrap();
        assert_eq!((stats.file_count, stats.size), (1, 5));

        let paths = db.get_paths_by_file_id("F1").await.unwrap();
        assert_eq!(paths, HashSet::from(["fs1:/a/b.txt".to_string()]));
    }

    #[tokio::test]
    async fn test_dedup_reuses_primary_blob() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        db.insert("fs2", "/x/y.txt", 200, None, &info("F2", "st2"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        let entry = db.get_path_map("fs2", "/x/y.txt").await.unwrap().unwrap();
        assert_eq!(entry.file_id.as_deref(), Some("F1"));
        assert_eq!(entry.file_storage.as_deref(), Some("st1"));

        let stats = db.get_filesystem("fs2").await.unwrap().unwrap();
        assert_eq!((stats.file_count, stats.size), (1, 0));

        // The redundant blob the second caller wrote is queued for reclaim.
        let orphans = db.list_orphaned_files(0).await.unwrap();
        assert!(orphans.iter().any(|r| r.storage == "st2"));
        assert!(!orphans.iter().any(|r| r.storage == "st1"));
    }

    #[tokio::test]
    async fn test_delete_last_reference_retires_blob() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        db.insert("fs2", "/x/y.txt", 200, None, &info("F2", "st2"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        // Conflicting writers serialize themselves: both deletes decide on
        // the same blob's reverse map, so settle between them.
        assert!(db.delete("fs2", "/x/y.txt").await.unwrap());
        settle(&db).await;
        assert!(db.delete("fs1", "/a/b.txt").await.unwrap());
        settle(&db).await;

        assert!(db.get_file_checksum("C1").await.unwrap().is_none());
        let orphans = db.list_orphaned_files(0).await.unwrap();
        assert!(orphans
            .iter()
            .any(|r| r.file_id == "F1" && r.storage == "st1"));

        let fs1 = db.get_filesystem("fs1").await.unwrap().unwrap();
        let fs2 = db.get_filesystem("fs2").await.unwrap().unwrap();
        assert_eq!((fs1.file_count, fs1.size), (0, 0));
        assert_eq!((fs2.file_count, fs2.size), (0, 0));
    }

    #[tokio::test]
    async fn test_expired_entry_is_deleted_on_read() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, Some(50), &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        assert!(db.get_storage_file("fs1", "/a/b.txt").await.unwrap().is_none());
        assert!(db.get_path_map("fs1", "/a/b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_operation_takes_effect_lazily() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        assert!(db.get_storage_file("fs1", "/a/b.txt").await.unwrap().is_some());
        db.expire("fs1", "/a/b.txt", 1).await.unwrap();
        assert!(db.get_storage_file("fs1", "/a/b.txt").await.unwrap().is_none());
        assert!(db.get_path_map("fs1", "/a/b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_empty_dir_needs_force() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/d/f", 100, None, &info("F1", "st1"), 5, "")
            .await
            .unwrap();
        settle(&db).await;

        assert!(!db.delete_with_force("fs1", "/d", false).await.unwrap());
        assert!(db.delete_with_force("fs1", "/d", true).await.unwrap());
        settle(&db).await;

        // Force does not cascade: the child row stays behind, orphaned.
        assert!(db.get_path_map("fs1", "/d/f").await.unwrap().is_some());
        assert!(db.get_path_map("fs1", "/d/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_traverse_respects_limit() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        for i in 0..10 {
            db.insert(
                "fs1",
                &format!("/f{}.txt", i),
                100,
                None,
                &info(&format!("F{}", i), &format!("st{}", i)),
                1,
                "",
            )
            .await
            .unwrap();
        }
        settle(&db).await;

        let mut seen = Vec::new();
        db.traverse("fs1", "/", |e| seen.push(e.filename.clone()), 3, FileType::All)
            .await
            .unwrap();
        assert_eq!(seen.len(), 3);

        let all = db.list_recursive("fs1", "/", 0, FileType::All).await.unwrap();
        assert_eq!(all.len(), 10);
    }

    // ==================== Invariants ====================

    #[tokio::test]
    async fn test_exists_consistent_with_get_path_map() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        assert!(db.exists("fs1", "/nope").await.unwrap().is_none());
        assert!(db.get_path_map("fs1", "/nope").await.unwrap().is_none());

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        assert!(db.exists("fs1", "/a/b.txt").await.unwrap().is_some());
        assert!(db.get_path_map("fs1", "/a/b.txt").await.unwrap().is_some());
        assert!(db.exists("fs1", "/a/").await.unwrap().is_some());
        assert!(db.get_path_map("fs1", "/a/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checksum_row_tracks_path_map_blob() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        let checksum = db.get_file_checksum("C1").await.unwrap().unwrap();
        let entry = db.get_path_map("fs1", "/a/b.txt").await.unwrap().unwrap();
        assert_eq!(Some(checksum.file_id), entry.file_id);
        assert_eq!(Some(checksum.storage), entry.file_storage);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        assert!(db.delete("fs1", "/a/b.txt").await.unwrap());
        settle(&db).await;
        let stats_after_first = db.get_filesystem("fs1").await.unwrap().unwrap();
        let orphans_after_first = db.list_orphaned_files(0).await.unwrap();

        assert!(db.delete("fs1", "/a/b.txt").await.unwrap());
        settle(&db).await;
        let stats_after_second = db.get_filesystem("fs1").await.unwrap().unwrap();
        let orphans_after_second = db.list_orphaned_files(0).await.unwrap();

        assert_eq!(stats_after_first, stats_after_second);
        assert_eq!(orphans_after_first, orphans_after_second);
    }

    #[tokio::test]
    async fn test_insert_round_trip() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, Some(9_999_999_999_999), &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();

        let entry = db.get_path_map("fs1", "/a/b.txt").await.unwrap().unwrap();
        assert_eq!(entry.filesystem, "fs1");
        assert_eq!(entry.parent_path, "/a/");
        assert_eq!(entry.filename, "b.txt");
        assert_eq!(entry.file_id.as_deref(), Some("F1"));
        assert_eq!(entry.file_storage.as_deref(), Some("st1"));
        assert_eq!(entry.size, 5);
        assert_eq!(entry.creation, 100);
        assert_eq!(entry.expiration, Some(9_999_999_999_999));
        assert_eq!(entry.checksum.as_deref(), Some("C1"));
    }

    #[tokio::test]
    async fn test_duplicates_do_not_double_count_bytes() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/one", 100, None, &info("F1", "st1"), 7, "C1")
            .await
            .unwrap();
        db.insert("fs1", "/a/two", 100, None, &info("F2", "st2"), 7, "C1")
            .await
            .unwrap();
        settle(&db).await;

        let stats = db.get_filesystem("fs1").await.unwrap().unwrap();
        assert_eq!((stats.file_count, stats.size), (2, 7));
    }

    #[tokio::test]
    async fn test_orphan_listed_after_last_reference_gone() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;
        assert!(db.list_orphaned_files(0).await.unwrap().is_empty());

        db.delete("fs1", "/a/b.txt").await.unwrap();
        settle(&db).await;

        let orphans = db.list_orphaned_files(0).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].file_id, "F1");
        assert_eq!(orphans[0].storage, "st1");
        assert_eq!(orphans[0].checksum.as_deref(), Some("C1"));

        db.remove_from_reclaim(&orphans[0]).await.unwrap();
        assert!(db.list_orphaned_files(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_shares_the_blob() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        assert!(db
            .copy("fs1", "/a/b.txt", "fs2", "/c/d.txt", Some(300), None)
            .await
            .unwrap());
        settle(&db).await;

        let target = db.get_path_map("fs2", "/c/d.txt").await.unwrap().unwrap();
        assert_eq!(target.file_id.as_deref(), Some("F1"));
        assert_eq!(target.file_storage.as_deref(), Some("st1"));
        assert_eq!(target.size, 5);
        assert_eq!(target.creation, 300);

        // The copy is a duplicate reference: it adds no physical bytes.
        let stats = db.get_filesystem("fs2").await.unwrap().unwrap();
        assert_eq!((stats.file_count, stats.size), (1, 0));

        let paths = db.get_paths_by_file_id("F1").await.unwrap();
        assert!(paths.contains("fs1:/a/b.txt"));
        assert!(paths.contains("fs2:/c/d.txt"));

        assert!(!db
            .copy("fs1", "/missing", "fs2", "/e", None, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_make_dirs_is_idempotent_and_complete() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.make_dirs("fs1", "/a/b/c").await.unwrap();
        db.make_dirs("fs1", "/a/b/c").await.unwrap();

        for dir in ["/a", "/a/b", "/a/b/c"] {
            assert!(db.is_directory("fs1", dir).await.unwrap(), "missing {}", dir);
        }
        assert_eq!(db.list("fs1", "/a", FileType::Dir).await.unwrap().len(), 1);
        assert_eq!(db.list("fs1", "/", FileType::Dir).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_containing_honors_caller_order() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        for fs in ["B", "C"] {
            db.insert(fs, "/a/b.txt", 100, None, &info(&format!("F-{}", fs), "st"), 5, "")
                .await
                .unwrap();
        }
        settle(&db).await;

        let candidates: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let found = db
            .get_file_system_containing(&candidates, "/a/b.txt")
            .await
            .unwrap();
        assert_eq!(found, HashSet::from(["B".to_string(), "C".to_string()]));

        assert_eq!(
            db.get_first_file_system_containing(&candidates, "/a/b.txt")
                .await
                .unwrap()
                .as_deref(),
            Some("B")
        );
        let reversed: Vec<String> = ["C", "B"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            db.get_first_file_system_containing(&reversed, "/a/b.txt")
                .await
                .unwrap()
                .as_deref(),
            Some("C")
        );
        assert!(db
            .get_first_file_system_containing(&candidates, "/")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_replace_unwinds_predecessor() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "C1")
            .await
            .unwrap();
        settle(&db).await;
        db.insert("fs1", "/a/b.txt", 200, None, &info("F2", "st2"), 9, "C2")
            .await
            .unwrap();
        settle(&db).await;

        let entry = db.get_path_map("fs1", "/a/b.txt").await.unwrap().unwrap();
        assert_eq!(entry.file_id.as_deref(), Some("F2"));
        assert_eq!(entry.size, 9);

        let stats = db.get_filesystem("fs1").await.unwrap().unwrap();
        assert_eq!((stats.file_count, stats.size), (1, 9));

        // The predecessor lost its last reference.
        assert!(db.get_file_checksum("C1").await.unwrap().is_none());
        assert!(db.get_paths_by_file_id("F1").await.unwrap().is_empty());
        let orphans = db.list_orphaned_files(0).await.unwrap();
        assert!(orphans.iter().any(|r| r.file_id == "F1"));
    }

    #[tokio::test]
    async fn test_list_filters_by_file_type() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/f1", 100, None, &info("F1", "st1"), 1, "")
            .await
            .unwrap();
        db.insert("fs1", "/a/b/f2", 100, None, &info("F2", "st2"), 1, "")
            .await
            .unwrap();
        settle(&db).await;

        let files = db.list("fs1", "/a", FileType::File).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "f1");

        let dirs = db.list("fs1", "/a", FileType::Dir).await.unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].filename, "b/");

        assert_eq!(db.list("fs1", "/a", FileType::All).await.unwrap().len(), 2);

        let recursive_files = db
            .list_recursive("fs1", "/", 0, FileType::File)
            .await
            .unwrap();
        assert_eq!(recursive_files.len(), 2);
    }

    // ==================== Filesystems and proxy sites ====================

    #[tokio::test]
    async fn test_purge_filesystem_requires_empty() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "")
            .await
            .unwrap();
        settle(&db).await;

        assert!(!db.purge_filesystem("fs1").await.unwrap());
        db.delete("fs1", "/a/b.txt").await.unwrap();
        settle(&db).await;

        assert!(db.purge_filesystem("fs1").await.unwrap());
        assert!(db.get_filesystem("fs1").await.unwrap().is_none());
        assert!(db.get_filesystems().await.unwrap().is_empty());
        assert!(!db.purge_filesystem("fs1").await.unwrap());
    }

    #[tokio::test]
    async fn test_proxy_sites_crud_and_cache() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.save_proxy_site("site-a").await.unwrap();
        db.save_proxy_site("site-b").await.unwrap();
        assert!(db.is_proxy_site("site-a").await.unwrap());
        assert_eq!(db.get_proxy_site_list().await.unwrap().len(), 2);
        assert!(db.proxy_sites_cache().contains("site-a"));

        db.delete_proxy_site("site-a").await.unwrap();
        assert!(!db.is_proxy_site("site-a").await.unwrap());
        assert!(!db.proxy_sites_cache().contains("site-a"));

        // A fresh instance starts cold and warms up explicitly.
        let db2 = create_db(&tmp);
        assert!(db2.proxy_sites_cache().is_empty());
        db2.refresh_proxy_sites_cache().await.unwrap();
        assert_eq!(db2.proxy_sites_cache(), HashSet::from(["site-b".to_string()]));

        db2.delete_all_proxy_sites().await.unwrap();
        assert!(db2.get_proxy_site_list().await.unwrap().is_empty());
        assert!(db2.proxy_sites_cache().is_empty());
    }

    // ==================== Lifecycle ====================

    #[tokio::test]
    async fn test_operations_resume_after_close() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);

        db.insert("fs1", "/a/b.txt", 100, None, &info("F1", "st1"), 5, "")
            .await
            .unwrap();
        db.close().await;

        // The guard re-establishes the session and the executor restarts.
        assert_eq!(db.exists("fs1", "/a/b.txt").await.unwrap(), Some(FileType::File));
        db.insert("fs1", "/a/c.txt", 100, None, &info("F2", "st2"), 3, "")
            .await
            .unwrap();
        settle(&db).await;

        let stats = db.get_filesystem("fs1").await.unwrap().unwrap();
        assert_eq!(stats.file_count, 2);
    }

    // ==================== Sweeper ====================

    #[tokio::test]
    async fn test_sweep_deletes_orphaned_blob() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);
        let blobs = FileBasedBlobStore::new(tmp.path().join("blobs"));

        let info = blobs.get_file_info("fs1", "/a/b.txt").await;
        let mut out = blobs.open_output(&info).await.unwrap();
        out.write_all(b"hello").await.unwrap();
        out.flush().await.unwrap();
        let blob_path = tmp.path().join("blobs").join(&info.file_storage);
        assert!(blob_path.exists());

        db.insert("fs1", "/a/b.txt", 100, None, &info, 5, "C1")
            .await
            .unwrap();
        settle(&db).await;
        db.delete("fs1", "/a/b.txt").await.unwrap();
        settle(&db).await;

        let stats = db.sweep_orphaned_files(&blobs, 0).await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.aborted, 0);
        assert!(!blob_path.exists());
        assert!(db.list_orphaned_files(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_aborts_when_blob_referenced_again() {
        let tmp = TempDir::new().unwrap();
        let db = create_db(&tmp);
        let blobs = FileBasedBlobStore::new(tmp.path().join("blobs"));

        let info = blobs.get_file_info("fs1", "/a/b.txt").await;
        let mut out = blobs.open_output(&info).await.unwrap();
        out.write_all(b"hello").await.unwrap();
        out.flush().await.unwrap();
        let blob_path = tmp.path().join("blobs").join(&info.file_storage);

        db.insert("fs1", "/a/b.txt", 100, None, &info, 5, "C1")
            .await
            .unwrap();
        settle(&db).await;
        db.delete("fs1", "/a/b.txt").await.unwrap();
        settle(&db).await;

        // A late-arriving insert references the same blob before the
        // sweeper runs; the queued record is stale.
        db.insert("fs1", "/a/again.txt", 300, None, &info, 5, "C1")
            .await
            .unwrap();
        settle(&db).await;

        let stats = db.sweep_orphaned_files(&blobs, 0).await.unwrap();
        assert_eq!(stats.reclaimed, 0);
        assert_eq!(stats.aborted, 1);
        assert!(blob_path.exists());
        assert!(db.list_orphaned_files(0).await.unwrap().is_empty());
    }
}
