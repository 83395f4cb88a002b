//! Datastore-backed image store.
//!
//! Layout under the datastore:
//!
//! ```text
//! <root>/<store>/
//!     <id>/
//!         <id>.vmdk           child disk of the parent's disk
//!         imageMetadata/<key> opaque bytes per key
//!     parents.bin             parent map sidecar
//! ```
//!
//! A write walks a fixed sequence of stages; any failure after the image
//! directory exists releases whatever is still held (mount, attachment) and
//! removes the directory before the error is returned.
//!
//! ```text
//! Begin → DirCreated → ChildAttached → ChildMounted → ArchiveExtracted
//!       → Unmounted → Detached → MetadataWritten → ParentMapSaved → Done
//! ```

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{Instrument, debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::fabric::{Datastore, DiskMode, DiskSpec};
use crate::op::Operation;
use crate::storage::disk::{AttachedDisk, DiskManager, MountedDisk};
use crate::storage::image::{ArchiveReader, Image, ImageStorer, Metadata};
use crate::storage::parent_map::{ParentMap, SCRATCH_ID};
use crate::storage::url::{DatastoreUrl, image_url, store_name, store_url};

pub const METADATA_DIR: &str = "imageMetadata";
pub const DEFAULT_ROOT: &str = "VIC";
pub const DEFAULT_DISK_LABEL: &str = "containerfs";
pub const DEFAULT_SCRATCH_SIZE_KB: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ImageStoreSettings {
    /// Service base for store and image URLs.
    pub service: Url,
    /// Datastore directory holding all stores.
    pub root: String,
    /// Host directory under which child disks are mounted during writes.
    pub mount_root: PathBuf,
    pub scratch_size_kb: u64,
    pub disk_label: String,
}

type ParentMapSlot = Arc<AsyncMutex<Option<ParentMap>>>;

pub struct ImageStore {
    datastore: Arc<dyn Datastore>,
    disks: DiskManager,
    settings: ImageStoreSettings,
    parent_maps: Mutex<HashMap<String, ParentMapSlot>>,
}

/// Stage reached by a single `write_image` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Begin,
    DirCreated,
    ChildAttached,
    ChildMounted,
    ArchiveExtracted,
    Unmounted,
    Detached,
    MetadataWritten,
    ParentMapSaved,
    Done,
}

/// Resources a write holds, released on the failure path.
struct WriteProgress {
    stage: WriteStage,
    dir_created: bool,
    attached: Option<AttachedDisk>,
    mounted: Option<MountedDisk>,
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("invalid {kind} {name:?}")));
    }
    Ok(())
}

impl ImageStore {
    pub fn new(datastore: Arc<dyn Datastore>, disks: DiskManager, settings: ImageStoreSettings) -> Self {
        Self {
            datastore,
            disks,
            settings,
            parent_maps: Mutex::new(HashMap::new()),
        }
    }

    fn store_dir(&self, store: &str) -> String {
        format!("{}/{}", self.settings.root, store)
    }

    fn image_dir(&self, store: &str, id: &str) -> String {
        format!("{}/{}/{}", self.settings.root, store, id)
    }

    fn disk_path(&self, store: &str, id: &str) -> DatastoreUrl {
        self.datastore
            .url(&format!("{}/{}.vmdk", self.image_dir(store, id), id))
    }

    /// The store's parent map, restored on first use and locked for the
    /// caller. Holding the guard serializes parent-map writes per store.
    async fn parent_map(&self, store: &str) -> Result<OwnedMutexGuard<Option<ParentMap>>> {
        let slot = {
            let mut maps = self.parent_maps.lock().unwrap_or_else(PoisonError::into_inner);
            maps.entry(store.to_owned()).or_default().clone()
        };
        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            *guard = Some(ParentMap::restore(self.datastore.clone(), &self.store_dir(store)).await?);
        }
        Ok(guard)
    }

    async fn write_scratch(&self, op: &Operation, store: &str) -> Result<()> {
        self.datastore
            .mkdir(&self.image_dir(store, SCRATCH_ID), false)
            .await?;

        let spec = DiskSpec {
            path: self.disk_path(store, SCRATCH_ID),
            parent: None,
            capacity_kb: Some(self.settings.scratch_size_kb),
            mode: DiskMode::Persistent,
        };
        let disk = self.disks.create_and_attach(op, &spec).await?;
        let formatted = self.disks.mkfs(op, &disk, &self.settings.disk_label).await;
        let detached = self.disks.detach(disk).await;
        formatted?;
        detached?;

        let guard = self.parent_map(store).await?;
        if let Some(map) = guard.as_ref() {
            map.save().await?;
        }
        Ok(())
    }

    async fn read_metadata(&self, store: &str, id: &str) -> Result<Metadata> {
        let dir = format!("{}/{}", self.image_dir(store, id), METADATA_DIR);
        let entries = match self.datastore.ls(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Metadata::new()),
            Err(e) => return Err(e),
        };

        let mut metadata = Metadata::new();
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            let value = self
                .datastore
                .download(&format!("{dir}/{}", entry.name))
                .await?;
            metadata.insert(entry.name, value);
        }
        Ok(metadata)
    }

    async fn write_metadata(&self, store: &str, id: &str, metadata: &Metadata) -> Result<()> {
        let dir = format!("{}/{}", self.image_dir(store, id), METADATA_DIR);
        self.datastore.mkdir(&dir, true).await?;
        for (key, value) in metadata {
            self.datastore.upload(&format!("{dir}/{key}"), value).await?;
        }
        Ok(())
    }

    fn image(&self, store: &str, id: &str, parent: Option<String>, metadata: Metadata) -> Result<Image> {
        Ok(Image {
            id: id.to_owned(),
            store: store_url(&self.settings.service, store)?,
            parent,
            self_link: image_url(&self.settings.service, store, id)?,
            metadata,
            disk: self.disk_path(store, id),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_stages(
        &self,
        op: &Operation,
        store: &str,
        parent: &Image,
        id: &str,
        metadata: Metadata,
        digest: Option<&str>,
        archive: ArchiveReader,
        progress: &mut WriteProgress,
    ) -> Result<Image> {
        op.check()?;
        self.datastore
            .mkdir(&self.image_dir(store, id), false)
            .await
            .map_err(|e| match e {
                Error::AlreadyExists(_) => Error::AlreadyExists(format!("image {id} in store {store}")),
                e => e,
            })?;
        progress.dir_created = true;
        progress.stage = WriteStage::DirCreated;

        let spec = DiskSpec {
            path: self.disk_path(store, id),
            parent: Some(parent.disk.clone()),
            capacity_kb: None,
            mode: DiskMode::Persistent,
        };
        let disk = self.disks.create_and_attach(op, &spec).await?;
        progress.stage = WriteStage::ChildAttached;

        let target = self
            .settings
            .mount_root
            .join(format!("{store}-{id}-{:08x}", rand::random::<u32>()));
        let mounted = self.disks.mount(op, &disk, &target, &[]).await;
        progress.attached = Some(disk);
        progress.mounted = Some(mounted?);
        progress.stage = WriteStage::ChildMounted;

        let computed = {
            let op = op.clone();
            tokio::task::spawn_blocking(move || extract_archive(archive, &target, &op))
                .await
                .map_err(|e| Error::Io {
                    context: format!("extract archive for image {id}"),
                    source: io::Error::other(e),
                })??
        };
        if let Some(expected) = digest {
            if !expected.eq_ignore_ascii_case(&computed) {
                return Err(Error::InvalidArgument(format!(
                    "archive digest mismatch for image {id}: expected {expected}, got {computed}"
                )));
            }
        }
        progress.stage = WriteStage::ArchiveExtracted;

        if let Some(mounted) = progress.mounted.take() {
            self.disks.unmount(mounted).await?;
        }
        progress.stage = WriteStage::Unmounted;

        if let Some(disk) = progress.attached.take() {
            self.disks.detach(disk).await?;
        }
        progress.stage = WriteStage::Detached;

        op.check()?;
        self.write_metadata(store, id, &metadata).await?;
        progress.stage = WriteStage::MetadataWritten;

        {
            let mut guard = self.parent_map(store).await?;
            let map = guard
                .as_mut()
                .ok_or_else(|| Error::NotFound(format!("parent map of store {store}")))?;
            map.add(id, &parent.id)?;
            if let Err(e) = map.save().await {
                map.remove(id);
                return Err(e);
            }
        }
        progress.stage = WriteStage::ParentMapSaved;

        let image = self.image(store, id, Some(parent.id.clone()), metadata)?;
        progress.stage = WriteStage::Done;
        Ok(image)
    }

    /// Release everything a failed write still holds. Runs to completion
    /// even when the operation was cancelled.
    async fn abandon_write(&self, store: &str, id: &str, progress: WriteProgress) {
        let WriteProgress {
            stage,
            dir_created,
            attached,
            mounted,
        } = progress;

        if let Some(mounted) = mounted {
            if let Err(e) = self.disks.unmount(mounted).await {
                warn!(store, id, ?stage, error = %e, "cleanup: unmount failed");
            }
        }
        if let Some(disk) = attached {
            if let Err(e) = self.disks.detach(disk).await {
                warn!(store, id, ?stage, error = %e, "cleanup: detach failed");
            }
        }
        if dir_created {
            if let Err(e) = self.datastore.remove_all(&self.image_dir(store, id)).await {
                warn!(store, id, ?stage, error = %e, "cleanup: removing image directory failed");
            }
        }
    }
}

/// Reader wrapper that hashes what passes through and stops at the next
/// read once the operation is cancelled.
struct DigestReader<'a> {
    inner: ArchiveReader,
    hasher: Sha256,
    op: &'a Operation,
}

impl Read for DigestReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Err(e) = self.op.check() {
            return Err(io::Error::other(e.to_string()));
        }
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Unpack a tar stream into `target`, returning the stream's digest.
fn extract_archive(archive: ArchiveReader, target: &Path, op: &Operation) -> Result<String> {
    let mut reader = DigestReader {
        inner: archive,
        hasher: Sha256::new(),
        op,
    };

    let unpacked = {
        let mut tar = tar::Archive::new(&mut reader);
        tar.set_preserve_permissions(true);
        tar.set_overwrite(true);
        tar.unpack(target)
    }
    .and_then(|()| io::copy(&mut reader, &mut io::sink()).map(drop));

    if let Err(source) = unpacked {
        op.check()?;
        return Err(Error::Io {
            context: format!("extract archive into {}", target.display()),
            source,
        });
    }
    Ok(format!("sha256:{}", hex::encode(reader.hasher.finalize())))
}

#[async_trait]
impl ImageStorer for ImageStore {
    async fn create_image_store(&self, op: &Operation, name: &str) -> Result<Url> {
        validate_name("store name", name)?;
        op.check()?;

        self.datastore.mkdir(&self.settings.root, true).await?;
        self.datastore
            .mkdir(&self.store_dir(name), false)
            .await
            .map_err(|e| match e {
                Error::AlreadyExists(_) => Error::AlreadyExists(format!("image store {name}")),
                e => e,
            })?;

        if let Err(e) = self.write_scratch(op, name).await {
            warn!(store = name, error = %e, "scratch creation failed, removing store");
            self.parent_maps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            if let Err(e) = self.datastore.remove_all(&self.store_dir(name)).await {
                warn!(store = name, error = %e, "cleanup: removing store directory failed");
            }
            return Err(e);
        }

        info!(store = name, op = op.id(), "image store created");
        Ok(store_url(&self.settings.service, name)?)
    }

    async fn get_image_store(&self, _op: &Operation, name: &str) -> Result<Url> {
        validate_name("store name", name)?;
        match self.datastore.stat(&self.store_dir(name)).await {
            Ok(info) if info.is_dir => Ok(store_url(&self.settings.service, name)?),
            Ok(_) => Err(Error::NotFound(format!("image store {name}"))),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("image store {name}"))),
            Err(e) => Err(e),
        }
    }

    async fn list_image_stores(&self, _op: &Operation) -> Result<Vec<Url>> {
        let entries = match self.datastore.ls(&self.settings.root).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        entries
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| store_url(&self.settings.service, &e.name).map_err(Error::from))
            .collect()
    }

    async fn write_image(
        &self,
        op: &Operation,
        parent: &Image,
        id: &str,
        metadata: Metadata,
        digest: Option<&str>,
        archive: ArchiveReader,
    ) -> Result<Image> {
        let store = store_name(&parent.store)?;
        if id == SCRATCH_ID {
            return Err(Error::InvalidArgument(format!("{SCRATCH_ID} is a reserved image id")));
        }
        validate_name("image id", id)?;
        for key in metadata.keys() {
            validate_name("metadata key", key)?;
        }
        {
            let guard = self.parent_map(&store).await?;
            let known = parent.id == SCRATCH_ID
                || guard.as_ref().is_some_and(|map| map.get(&parent.id).is_some());
            if !known {
                return Err(Error::NotFound(format!("parent image {} in store {store}", parent.id)));
            }
        }

        let span = tracing::info_span!("write_image", op = op.id(), store = %store, id);
        async {
            let mut progress = WriteProgress {
                stage: WriteStage::Begin,
                dir_created: false,
                attached: None,
                mounted: None,
            };

            match self
                .write_stages(op, &store, parent, id, metadata, digest, archive, &mut progress)
                .await
            {
                Ok(image) => {
                    info!(parent = %parent.id, "image written");
                    Ok(image)
                }
                Err(e) => {
                    warn!(stage = ?progress.stage, error = %e, "image write failed, cleaning up");
                    self.abandon_write(&store, id, progress).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_image(&self, _op: &Operation, store: &Url, id: &str) -> Result<Image> {
        let name = store_name(store)?;
        validate_name("image id", id)?;

        match self.datastore.stat(&self.image_dir(&name, id)).await {
            Ok(info) if info.is_dir => {}
            Ok(_) => return Err(Error::NotFound(format!("image {id} in store {name}"))),
            Err(e) if e.is_not_found() => {
                return Err(Error::NotFound(format!("image {id} in store {name}")));
            }
            Err(e) => return Err(e),
        }

        let metadata = self.read_metadata(&name, id).await?;
        let parent = if id == SCRATCH_ID {
            None
        } else {
            let guard = self.parent_map(&name).await?;
            let parent = guard.as_ref().and_then(|map| map.get(id)).map(str::to_owned);
            Some(parent.ok_or_else(|| Error::NotFound(format!("parent link for image {id}")))?)
        };

        debug!(store = %name, id, ?parent, "image loaded");
        self.image(&name, id, parent, metadata)
    }

    async fn list_images(
        &self,
        op: &Operation,
        store: &Url,
        ids: Option<&[String]>,
    ) -> Result<Vec<Image>> {
        let name = store_name(store)?;
        let entries = match self.datastore.ls(&self.store_dir(&name)).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Err(Error::NotFound(format!("image store {name}"))),
            Err(e) => return Err(e),
        };

        let mut images = Vec::new();
        for entry in entries.into_iter().filter(|e| e.is_dir) {
            if let Some(ids) = ids {
                if !ids.iter().any(|id| *id == entry.name) {
                    continue;
                }
            }
            op.check()?;
            images.push(self.get_image(op, store, &entry.name).await?);
        }
        Ok(images)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
