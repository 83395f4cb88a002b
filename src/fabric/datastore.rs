use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::storage::url::DatastoreUrl;

/// One entry of a datastore directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// File operations on a single datastore. Paths are relative to the
/// datastore root and use `/` separators.
#[async_trait]
pub trait Datastore: Send + Sync {
    fn name(&self) -> &str;

    /// Create a directory. Without `create_parents` an existing directory is
    /// reported as `AlreadyExists`.
    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Entries of a directory, sorted by name.
    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Write a whole file, replacing any previous content.
    async fn upload(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Atomically replace `to` with `from`.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a file or a directory tree. Absent paths are not an error.
    async fn remove_all(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn url(&self, path: &str) -> DatastoreUrl {
        DatastoreUrl::new(self.name(), path)
    }
}
