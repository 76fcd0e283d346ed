use async_trait::async_trait;
use log::{debug, error};
use pathmap_lib::{random_file_id, FileInfo, PathDbError, PathDbResult, PhysicalStore};
use std::path::PathBuf;
use tokio::fs::{self, File};

const LEVEL_1_DIR_LEN: usize = 2;
const LEVEL_2_DIR_LEN: usize = 2;

/// Flat-file physical store. Blobs live under a two-level shard directory
/// derived from the first characters of their id, so the storage token of
/// a blob is `"ab/cd/<file_id>"` relative to the base directory.
pub struct FileBasedBlobStore {
    base_dir: PathBuf,
}

impl FileBasedBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    fn storage_dir(file_id: &str) -> String {
        let folder = &file_id[..LEVEL_1_DIR_LEN];
        let sub_folder = &file_id[LEVEL_1_DIR_LEN..LEVEL_1_DIR_LEN + LEVEL_2_DIR_LEN];
        format!("{}/{}", folder, sub_folder)
    }
}

#[async_trait]
impl PhysicalStore for FileBasedBlobStore {
    async fn get_file_info(&self, _filesystem: &str, _path: &str) -> FileInfo {
        let file_id = random_file_id();
        let file_storage = format!("{}/{}", Self::storage_dir(&file_id), file_id);
        FileInfo {
            file_id,
            file_storage,
        }
    }

    async fn open_output(&self, info: &FileInfo) -> PathDbResult<File> {
        let target = self.base_dir.join(&info.file_storage);
        if let Some(dir) = target.parent() {
            if !dir.is_dir() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| PathDbError::IoError(format!("create storage dir failed: {}", e)))?;
            }
        }
        File::create(&target)
            .await
            .map_err(|e| PathDbError::IoError(format!("create storage file failed: {}", e)))
    }

    async fn open_input(&self, storage: &str) -> PathDbResult<Option<File>> {
        let target = self.base_dir.join(storage);
        if target.is_dir() || !target.exists() {
            debug!("target file not exists, file: {}", target.display());
            return Ok(None);
        }
        let file = File::open(&target)
            .await
            .map_err(|e| PathDbError::IoError(format!("open storage file failed: {}", e)))?;
        Ok(Some(file))
    }

    async fn delete(&self, info: &FileInfo) -> bool {
        let target = self.base_dir.join(&info.file_storage);
        match fs::remove_file(&target).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                error!("failed to delete file: {:?}, err: {}", info, e);
                false
            }
        }
    }
}
