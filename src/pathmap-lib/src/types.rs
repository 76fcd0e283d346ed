use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;

use crate::{normalize, PathDbResult};

/// Entry kinds used to filter list and traverse results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    All,
    File,
    Dir,
}

impl FileType {
    /// Directory rows are the ones whose filename keeps a trailing `/`.
    pub fn matches(&self, filename: &str) -> bool {
        match self {
            FileType::All => true,
            FileType::Dir => filename.ends_with('/'),
            FileType::File => !filename.ends_with('/'),
        }
    }
}

/// One path-map row. Directories carry no `file_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapEntry {
    pub filesystem: String,
    pub parent_path: String,
    pub filename: String,
    pub file_id: Option<String>,
    pub file_storage: Option<String>,
    pub size: i64,
    /// Milliseconds since the Unix epoch.
    pub creation: i64,
    pub expiration: Option<i64>,
    pub checksum: Option<String>,
}

impl PathMapEntry {
    pub fn is_directory(&self) -> bool {
        self.file_id.is_none()
    }

    /// The full logical path this row names.
    pub fn path(&self) -> String {
        normalize(&self.parent_path, &self.filename)
    }
}

/// A freshly minted physical location, handed out by the physical store
/// before any bytes are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub file_storage: String,
}

/// Canonical blob for one content checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksumEntry {
    pub checksum: String,
    pub file_id: String,
    pub storage: String,
}

/// One queued blob awaiting physical deletion after the grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimRecord {
    /// Hour-of-day of `deletion`, 0-23.
    pub partition: i64,
    /// Milliseconds since the Unix epoch.
    pub deletion: i64,
    pub file_id: String,
    pub storage: String,
    pub checksum: Option<String>,
}

/// Per-filesystem aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemStats {
    pub filesystem: String,
    pub file_count: i64,
    pub size: i64,
}

/// The physical blob store the index collaborates with. Storage tokens are
/// opaque to the index and never validated.
#[async_trait]
pub trait PhysicalStore: Send + Sync {
    /// Mint a fresh blob location for a logical path about to be written.
    async fn get_file_info(&self, filesystem: &str, path: &str) -> FileInfo;

    /// Open the blob for writing, creating parent directories on demand.
    async fn open_output(&self, info: &FileInfo) -> PathDbResult<File>;

    /// Open the blob named by a storage token. `None` if it does not exist.
    async fn open_input(&self, storage: &str) -> PathDbResult<Option<File>>;

    /// Delete the blob. A missing blob counts as deleted.
    async fn delete(&self, info: &FileInfo) -> bool;
}
