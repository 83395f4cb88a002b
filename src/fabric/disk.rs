use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::storage::url::DatastoreUrl;

/// How a disk is attached to the control VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskMode {
    #[default]
    Persistent,
    IndependentPersistent,
    NonPersistent,
}

/// Request to create a virtual disk.
///
/// A disk with a parent is a copy-on-write child of that disk and inherits
/// its capacity; a disk without one must state its capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub path: DatastoreUrl,
    pub parent: Option<DatastoreUrl>,
    pub capacity_kb: Option<u64>,
    pub mode: DiskMode,
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk {0} already exists")]
    DiskExists(DatastoreUrl),
    #[error("parent disk {0} does not exist")]
    ParentMissing(DatastoreUrl),
    #[error("disk {0} has no parent and no capacity")]
    CapacityRequired(DatastoreUrl),
    #[error("attaching {path} failed: {reason}")]
    AttachFailed { path: DatastoreUrl, reason: String },
    #[error("disk {0} is not attached")]
    NotAttached(DatastoreUrl),
    #[error("mounting {device} at {target} failed: {reason}")]
    MountFailed {
        device: PathBuf,
        target: PathBuf,
        reason: String,
    },
    #[error("{0} is not mounted")]
    NotMounted(PathBuf),
    #[error("{0} is busy")]
    Busy(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl DiskError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        DiskError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<DiskError> for Error {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::DiskExists(path) => Error::AlreadyExists(format!("disk {path}")),
            DiskError::ParentMissing(path) => Error::NotFound(format!("parent disk {path}")),
            DiskError::CapacityRequired(_) | DiskError::NotAttached(_) => {
                Error::InvalidArgument(err.to_string())
            }
            DiskError::AttachFailed { .. } => Error::Fabric(err.to_string()),
            DiskError::Io { context, source } => Error::Io { context, source },
            DiskError::MountFailed { .. } | DiskError::NotMounted(_) | DiskError::Busy(_) => {
                let context = err.to_string();
                Error::Io {
                    source: io::Error::other(context.clone()),
                    context,
                }
            }
        }
    }
}

/// Block-level operations on datastore-resident virtual disks, performed
/// on behalf of the control VM.
#[async_trait]
pub trait DiskBackend: Send + Sync {
    async fn create(&self, spec: &DiskSpec) -> Result<(), DiskError>;

    /// Attach the disk to the control VM and return its device path.
    async fn attach(&self, path: &DatastoreUrl, mode: DiskMode) -> Result<PathBuf, DiskError>;

    async fn detach(&self, path: &DatastoreUrl) -> Result<(), DiskError>;

    async fn mkfs(&self, device: &Path, label: &str) -> Result<(), DiskError>;

    async fn mount(&self, device: &Path, target: &Path, opts: &[String]) -> Result<(), DiskError>;

    async fn unmount(&self, target: &Path) -> Result<(), DiskError>;
}
