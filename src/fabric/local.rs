//! Host-directory implementations of `Datastore` and `DiskBackend`.
//!
//! A datastore is a directory on the host. A virtual disk is a JSON
//! descriptor at `<name>.vmdk` with its extent beside it in
//! `<name>-delta.vmdk/`; attaching a disk hands out the extent directory as
//! the device, and mounting exposes that directory at the mount path.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fabric::datastore::{Datastore, FileInfo};
use crate::fabric::disk::{DiskBackend, DiskError, DiskMode, DiskSpec};
use crate::storage::url::{DatastoreUrl, clean_path};

/// File holding the filesystem label written by `mkfs`.
const LABEL_FILE: &str = ".fslabel";

// ---------------------------------------------------------------------------
// Datastore
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LocalDatastore {
    name: String,
    root: PathBuf,
}

impl LocalDatastore {
    /// Back datastore `name` with the host directory `root`, creating it if
    /// needed.
    pub fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("create datastore root {}", root.display()), e))?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a datastore-relative path. Paths escaping the root are
    /// rejected.
    pub fn host_path(&self, path: &str) -> Result<PathBuf> {
        let cleaned = clean_path(path.trim_start_matches('/'));
        let rel = Path::new(&cleaned);
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::InvalidArgument(format!("path {path:?} escapes datastore")));
        }
        if cleaned == "." {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(rel))
    }

    fn host_path_of(&self, url: &DatastoreUrl) -> Result<PathBuf> {
        if url.datastore != self.name {
            return Err(Error::InvalidArgument(format!(
                "{url} is not on datastore {}",
                self.name
            )));
        }
        self.host_path(&url.path)
    }
}

fn file_info(name: String, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name,
        is_dir: meta.is_dir(),
        size: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

#[async_trait]
impl Datastore for LocalDatastore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()> {
        let host = self.host_path(path)?;
        let res = if create_parents {
            tokio::fs::create_dir_all(&host).await
        } else {
            tokio::fs::create_dir(&host).await
        };
        res.map_err(|e| Error::io(format!("mkdir {}", self.url(path)), e))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let host = self.host_path(path)?;
        let meta = tokio::fs::metadata(&host)
            .await
            .map_err(|e| Error::io(format!("stat {}", self.url(path)), e))?;
        let name = host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(file_info(name, &meta))
    }

    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        let host = self.host_path(path)?;
        let ctx = || format!("ls {}", self.url(path));

        let mut dir = tokio::fs::read_dir(&host).await.map_err(|e| Error::io(ctx(), e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| Error::io(ctx(), e))? {
            let meta = entry.metadata().await.map_err(|e| Error::io(ctx(), e))?;
            entries.push(file_info(entry.file_name().to_string_lossy().into_owned(), &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<()> {
        let host = self.host_path(path)?;
        tokio::fs::write(&host, data)
            .await
            .map_err(|e| Error::io(format!("upload {}", self.url(path)), e))
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let host = self.host_path(path)?;
        tokio::fs::read(&host)
            .await
            .map_err(|e| Error::io(format!("download {}", self.url(path)), e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.host_path(from)?;
        let dst = self.host_path(to)?;
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| Error::io(format!("rename {} to {}", self.url(from), self.url(to)), e))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let host = self.host_path(path)?;
        let meta = match tokio::fs::symlink_metadata(&host).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(format!("stat {}", self.url(path)), e)),
        };
        let res = if meta.is_dir() {
            tokio::fs::remove_dir_all(&host).await
        } else {
            tokio::fs::remove_file(&host).await
        };
        res.map_err(|e| Error::io(format!("remove {}", self.url(path)), e))
    }
}

// ---------------------------------------------------------------------------
// Disks
// ---------------------------------------------------------------------------

/// On-datastore descriptor of a simulated virtual disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub capacity_kb: u64,
    /// Descriptor of the parent disk in the backing chain.
    pub parent: Option<DatastoreUrl>,
    /// Extent file name, relative to the descriptor's directory.
    pub extent: String,
}

pub struct LocalDisks {
    datastore: Arc<LocalDatastore>,
    attached: Mutex<HashMap<DatastoreUrl, DiskMode>>,
}

impl LocalDisks {
    pub fn new(datastore: Arc<LocalDatastore>) -> Self {
        Self {
            datastore,
            attached: Mutex::new(HashMap::new()),
        }
    }

    fn io_err(context: String) -> impl FnOnce(std::io::Error) -> DiskError {
        move |e| DiskError::io(context, e)
    }

    fn host(&self, path: &DatastoreUrl) -> Result<PathBuf, DiskError> {
        self.datastore.host_path_of(path).map_err(|e| DiskError::AttachFailed {
            path: path.clone(),
            reason: e.to_string(),
        })
    }

    pub async fn descriptor(&self, path: &DatastoreUrl) -> Result<DiskDescriptor, DiskError> {
        let host = self.host(path)?;
        let raw = tokio::fs::read(&host)
            .await
            .map_err(Self::io_err(format!("read descriptor {path}")))?;
        serde_json::from_slice(&raw).map_err(|e| {
            DiskError::io(
                format!("parse descriptor {path}"),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Host directory holding the disk's content.
    pub async fn extent_path(&self, path: &DatastoreUrl) -> Result<PathBuf, DiskError> {
        let desc = self.descriptor(path).await?;
        let host = self.host(path)?;
        Ok(host.with_file_name(desc.extent))
    }

    pub fn is_attached(&self, path: &DatastoreUrl) -> bool {
        self.attached
            .lock()
            .map(|a| a.contains_key(path))
            .unwrap_or(false)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().map(|a| a.len()).unwrap_or(0)
    }
}

fn extent_name(path: &DatastoreUrl) -> String {
    let file = path.file_name();
    let stem = file.strip_suffix(".vmdk").unwrap_or(file);
    format!("{stem}-delta.vmdk")
}

#[async_trait]
impl DiskBackend for LocalDisks {
    async fn create(&self, spec: &DiskSpec) -> Result<(), DiskError> {
        let host = self.host(&spec.path)?;
        if tokio::fs::try_exists(&host).await.unwrap_or(false) {
            return Err(DiskError::DiskExists(spec.path.clone()));
        }

        let capacity_kb = match (&spec.parent, spec.capacity_kb) {
            (Some(parent), requested) => {
                let parent_desc = match self.descriptor(parent).await {
                    Ok(desc) => desc,
                    Err(DiskError::Io { source, .. })
                        if source.kind() == std::io::ErrorKind::NotFound =>
                    {
                        return Err(DiskError::ParentMissing(parent.clone()));
                    }
                    Err(e) => return Err(e),
                };
                requested.unwrap_or(parent_desc.capacity_kb)
            }
            (None, Some(capacity)) => capacity,
            (None, None) => return Err(DiskError::CapacityRequired(spec.path.clone())),
        };

        let desc = DiskDescriptor {
            capacity_kb,
            parent: spec.parent.clone(),
            extent: extent_name(&spec.path),
        };
        let raw = serde_json::to_vec_pretty(&desc)
            .map_err(|e| DiskError::io("encode descriptor", std::io::Error::other(e)))?;

        tokio::fs::create_dir(host.with_file_name(&desc.extent))
            .await
            .map_err(Self::io_err(format!("create extent for {}", spec.path)))?;
        tokio::fs::write(&host, raw)
            .await
            .map_err(Self::io_err(format!("write descriptor {}", spec.path)))?;

        debug!(disk = %spec.path, parent = ?spec.parent, capacity_kb, "disk created");
        Ok(())
    }

    async fn attach(&self, path: &DatastoreUrl, mode: DiskMode) -> Result<PathBuf, DiskError> {
        let device = self
            .extent_path(path)
            .await
            .map_err(|e| DiskError::AttachFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let mut attached = self.attached.lock().map_err(|_| DiskError::AttachFailed {
            path: path.clone(),
            reason: "attachment table poisoned".to_owned(),
        })?;
        if attached.contains_key(path) {
            return Err(DiskError::AttachFailed {
                path: path.clone(),
                reason: "already attached".to_owned(),
            });
        }
        attached.insert(path.clone(), mode);

        info!(disk = %path, device = %device.display(), "disk attached");
        Ok(device)
    }

    async fn detach(&self, path: &DatastoreUrl) -> Result<(), DiskError> {
        let removed = self
            .attached
            .lock()
            .map(|mut a| a.remove(path).is_some())
            .unwrap_or(false);
        if !removed {
            return Err(DiskError::NotAttached(path.clone()));
        }
        info!(disk = %path, "disk detached");
        Ok(())
    }

    async fn mkfs(&self, device: &Path, label: &str) -> Result<(), DiskError> {
        let meta = tokio::fs::metadata(device)
            .await
            .map_err(Self::io_err(format!("stat device {}", device.display())))?;
        if !meta.is_dir() {
            return Err(DiskError::io(
                format!("mkfs {}", device.display()),
                std::io::Error::other("device is not a block extent"),
            ));
        }
        tokio::fs::write(device.join(LABEL_FILE), label)
            .await
            .map_err(Self::io_err(format!("mkfs {}", device.display())))
    }

    async fn mount(&self, device: &Path, target: &Path, _opts: &[String]) -> Result<(), DiskError> {
        let failed = |reason: String| DiskError::MountFailed {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            reason,
        };

        match tokio::fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => {
                // an empty mount point is replaced by the mount
                tokio::fs::remove_dir(target)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
            Ok(_) => return Err(failed("mount point is in use".to_owned())),
            Err(_) => {}
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        tokio::fs::symlink(device, target)
            .await
            .map_err(|e| failed(e.to_string()))?;

        debug!(device = %device.display(), target = %target.display(), "mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), DiskError> {
        let meta = tokio::fs::symlink_metadata(target)
            .await
            .map_err(|_| DiskError::NotMounted(target.to_path_buf()))?;
        if !meta.file_type().is_symlink() {
            return Err(DiskError::NotMounted(target.to_path_buf()));
        }
        tokio::fs::remove_file(target)
            .await
            .map_err(|_| DiskError::Busy(target.to_path_buf()))?;

        debug!(target = %target.display(), "unmounted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn datastore(dir: &tempfile::TempDir) -> Arc<LocalDatastore> {
        Arc::new(LocalDatastore::open("ds1", dir.path().join("ds1")).unwrap())
    }

    #[tokio::test]
    async fn mkdir_reports_existing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ds = datastore(&dir);

        ds.mkdir("VIC/store", true).await.unwrap();
        let err = ds.mkdir("VIC/store", false).await.unwrap_err();
        assert!(err.is_already_exists(), "got: {err:?}");

        let listing = ds.ls("VIC").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_dir);
        assert_eq!(listing[0].name, "store");
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let ds = datastore(&dir);
        assert!(ds.host_path("../outside").is_err());
        assert_eq!(ds.host_path("/a/./b").unwrap(), ds.root().join("a/b"));
    }

    #[tokio::test]
    async fn upload_rename_download() {
        let dir = tempfile::tempdir().unwrap();
        let ds = datastore(&dir);

        ds.upload("blob.tmp", b"payload").await.unwrap();
        ds.rename("blob.tmp", "blob").await.unwrap();
        assert_eq!(ds.download("blob").await.unwrap(), b"payload");
        assert!(!ds.exists("blob.tmp").await.unwrap());

        ds.remove_all("blob").await.unwrap();
        ds.remove_all("blob").await.unwrap();
        assert!(ds.download("blob").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn disk_chain_and_attach_rules() {
        let dir = tempfile::tempdir().unwrap();
        let ds = datastore(&dir);
        let disks = LocalDisks::new(ds.clone());
        ds.mkdir("d", true).await.unwrap();

        let base = ds.url("d/base.vmdk");
        let child = ds.url("d/child.vmdk");

        let err = disks
            .create(&DiskSpec {
                path: base.clone(),
                parent: None,
                capacity_kb: None,
                mode: DiskMode::Persistent,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::CapacityRequired(_)));

        disks
            .create(&DiskSpec {
                path: base.clone(),
                parent: None,
                capacity_kb: Some(1024),
                mode: DiskMode::Persistent,
            })
            .await
            .unwrap();

        let err = disks
            .create(&DiskSpec {
                path: child.clone(),
                parent: Some(ds.url("d/missing.vmdk")),
                capacity_kb: None,
                mode: DiskMode::Persistent,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::ParentMissing(_)), "got: {err:?}");

        disks
            .create(&DiskSpec {
                path: child.clone(),
                parent: Some(base.clone()),
                capacity_kb: None,
                mode: DiskMode::Persistent,
            })
            .await
            .unwrap();
        let desc = disks.descriptor(&child).await.unwrap();
        assert_eq!(desc.parent.as_ref(), Some(&base));
        assert_eq!(desc.capacity_kb, 1024);

        let device = disks.attach(&child, DiskMode::Persistent).await.unwrap();
        assert!(device.ends_with("child-delta.vmdk"));
        assert!(disks.attach(&child, DiskMode::Persistent).await.is_err());

        disks.detach(&child).await.unwrap();
        assert!(matches!(
            disks.detach(&child).await,
            Err(DiskError::NotAttached(_))
        ));
    }

    #[tokio::test]
    async fn mount_exposes_the_extent() {
        let dir = tempfile::tempdir().unwrap();
        let ds = datastore(&dir);
        let disks = LocalDisks::new(ds.clone());
        ds.mkdir("d", true).await.unwrap();

        let disk = ds.url("d/x.vmdk");
        disks
            .create(&DiskSpec {
                path: disk.clone(),
                parent: None,
                capacity_kb: Some(64),
                mode: DiskMode::Persistent,
            })
            .await
            .unwrap();
        let device = disks.attach(&disk, DiskMode::Persistent).await.unwrap();
        disks.mkfs(&device, "containerfs").await.unwrap();

        let target = dir.path().join("mnt/x");
        disks.mount(&device, &target, &[]).await.unwrap();
        std::fs::write(target.join("hello"), b"hi").unwrap();
        disks.unmount(&target).await.unwrap();

        assert_eq!(std::fs::read(device.join("hello")).unwrap(), b"hi");
        assert_eq!(
            std::fs::read_to_string(device.join(LABEL_FILE)).unwrap(),
            "containerfs"
        );
        assert!(matches!(
            disks.unmount(&target).await,
            Err(DiskError::NotMounted(_))
        ));
    }
}
