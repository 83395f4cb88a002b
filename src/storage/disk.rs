//! Disk manager: scoped attach and mount of virtual disks on the control VM.
//!
//! `create_and_attach` hands back an [`AttachedDisk`] and `mount` a
//! [`MountedDisk`]. Both must be released through `detach` / `unmount`; a
//! guard dropped on an error path schedules its own release on the runtime
//! so the control VM never leaks a device or a mount. The number of disks
//! attached at once is bounded by a semaphore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::fabric::{DiskBackend, DiskSpec};
use crate::op::Operation;
use crate::storage::url::DatastoreUrl;

/// Limit of disks the control VM keeps attached at once.
pub const MAX_ATTACHED_DISKS: usize = 8;

pub struct DiskManager {
    backend: Arc<dyn DiskBackend>,
    slots: Arc<Semaphore>,
}

/// A disk currently attached to the control VM.
pub struct AttachedDisk {
    path: DatastoreUrl,
    device: PathBuf,
    backend: Arc<dyn DiskBackend>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

/// A filesystem on an attached disk, reachable under `target`.
pub struct MountedDisk {
    target: PathBuf,
    backend: Arc<dyn DiskBackend>,
    released: bool,
}

impl AttachedDisk {
    pub fn path(&self) -> &DatastoreUrl {
        &self.path
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

impl MountedDisk {
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for AttachedDisk {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(disk = %self.path, "attached disk dropped without detach, detaching in background");

        let backend = self.backend.clone();
        let path = self.path.clone();
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = backend.detach(&path).await {
                        error!(disk = %path, error = %e, "background detach failed");
                    }
                    drop(permit);
                });
            }
            Err(_) => error!(disk = %path, "no runtime available to detach disk"),
        }
    }
}

impl Drop for MountedDisk {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(target = %self.target.display(), "mount dropped without unmount, unmounting in background");

        let backend = self.backend.clone();
        let target = self.target.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = backend.unmount(&target).await {
                        error!(target = %target.display(), error = %e, "background unmount failed");
                    }
                });
            }
            Err(_) => error!(target = %target.display(), "no runtime available to unmount"),
        }
    }
}

impl DiskManager {
    pub fn new(backend: Arc<dyn DiskBackend>, max_attached: usize) -> Self {
        Self {
            backend,
            slots: Arc::new(Semaphore::new(max_attached.max(1))),
        }
    }

    /// Create `spec` on the datastore and attach it. The disk file is kept
    /// if the attach itself fails.
    pub async fn create_and_attach(&self, op: &Operation, spec: &DiskSpec) -> Result<AttachedDisk> {
        let permit = op
            .run(async {
                self.slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::ResourceExhausted("disk attach slots closed".to_owned()))
            })
            .await?;

        op.check()?;
        self.backend.create(spec).await?;

        op.check()?;
        let device = self.backend.attach(&spec.path, spec.mode).await?;

        debug!(disk = %spec.path, device = %device.display(), "created and attached");
        Ok(AttachedDisk {
            path: spec.path.clone(),
            device,
            backend: self.backend.clone(),
            permit: Some(permit),
            released: false,
        })
    }

    /// Detach a disk. Runs regardless of cancellation so cleanup paths can
    /// rely on it.
    pub async fn detach(&self, mut disk: AttachedDisk) -> Result<()> {
        disk.released = true;
        self.backend.detach(&disk.path).await?;
        Ok(())
    }

    pub async fn mkfs(&self, op: &Operation, disk: &AttachedDisk, label: &str) -> Result<()> {
        op.check()?;
        self.backend.mkfs(&disk.device, label).await?;
        debug!(disk = %disk.path, label, "filesystem created");
        Ok(())
    }

    pub async fn mount(
        &self,
        op: &Operation,
        disk: &AttachedDisk,
        target: &Path,
        opts: &[String],
    ) -> Result<MountedDisk> {
        op.check()?;
        self.backend.mount(&disk.device, target, opts).await?;
        Ok(MountedDisk {
            target: target.to_path_buf(),
            backend: self.backend.clone(),
            released: false,
        })
    }

    /// Unmount; the disk stays attached.
    pub async fn unmount(&self, mut mount: MountedDisk) -> Result<()> {
        mount.released = true;
        self.backend.unmount(&mount.target).await?;
        Ok(())
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fabric::{Datastore, DiskMode, LocalDatastore, LocalDisks};

    struct Fixture {
        _dir: tempfile::TempDir,
        ds: Arc<LocalDatastore>,
        disks: Arc<LocalDisks>,
        mgr: DiskManager,
    }

    async fn fixture(max: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ds = Arc::new(LocalDatastore::open("ds1", dir.path().join("ds")).unwrap());
        ds.mkdir("d", true).await.unwrap();
        let disks = Arc::new(LocalDisks::new(ds.clone()));
        let mgr = DiskManager::new(disks.clone(), max);
        Fixture {
            _dir: dir,
            ds,
            disks,
            mgr,
        }
    }

    fn spec(ds: &LocalDatastore, name: &str) -> DiskSpec {
        DiskSpec {
            path: ds.url(&format!("d/{name}.vmdk")),
            parent: None,
            capacity_kb: Some(128),
            mode: DiskMode::Persistent,
        }
    }

    #[tokio::test]
    async fn attach_slots_are_bounded_and_returned() {
        let fx = fixture(1).await;
        let op = Operation::new("test");

        let first = fx.mgr.create_and_attach(&op, &spec(&fx.ds, "a")).await.unwrap();
        assert_eq!(fx.mgr.available_slots(), 0);

        let bounded = op.with_timeout(Duration::from_millis(20));
        let err = fx
            .mgr
            .create_and_attach(&bounded, &spec(&fx.ds, "b"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DeadlineExceeded), "got: {err:?}");

        fx.mgr.detach(first).await.unwrap();
        assert_eq!(fx.mgr.available_slots(), 1);
        assert_eq!(fx.disks.attached_count(), 0);
    }

    #[tokio::test]
    async fn dropped_guard_detaches_in_background() {
        let fx = fixture(2).await;
        let op = Operation::new("test");

        let disk = fx.mgr.create_and_attach(&op, &spec(&fx.ds, "a")).await.unwrap();
        let path = disk.path().clone();
        assert!(fx.disks.is_attached(&path));
        drop(disk);

        for _ in 0..50 {
            if !fx.disks.is_attached(&path) && fx.mgr.available_slots() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.disks.is_attached(&path), "disk still attached after drop");
        assert_eq!(fx.mgr.available_slots(), 2);
    }

    #[tokio::test]
    async fn create_of_existing_disk_fails() {
        let fx = fixture(2).await;
        let op = Operation::new("test");

        let disk = fx.mgr.create_and_attach(&op, &spec(&fx.ds, "a")).await.unwrap();
        fx.mgr.detach(disk).await.unwrap();

        let err = fx
            .mgr
            .create_and_attach(&op, &spec(&fx.ds, "a"))
            .await
            .err()
            .unwrap();
        assert!(err.is_already_exists(), "got: {err:?}");
        assert_eq!(fx.mgr.available_slots(), 2);
    }
}
