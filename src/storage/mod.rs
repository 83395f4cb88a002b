//! Layered image storage.
//!
//! ```text
//! url          store:// and ds:// references, volume store specs
//! parent_map   per-store child -> parent sidecar
//! disk         scoped attach / mount of virtual disks
//! image_store  datastore-backed store of copy-on-write image disks
//! cache        name-lookup cache fronting the image store
//! ```

pub mod cache;
pub mod disk;
pub mod image;
pub mod image_store;
pub mod parent_map;
pub mod url;

pub use cache::NameLookupCache;
pub use disk::{AttachedDisk, DiskManager, MAX_ATTACHED_DISKS, MountedDisk};
pub use image::{ArchiveReader, Image, ImageStorer, Metadata};
pub use image_store::{ImageStore, ImageStoreSettings, WriteStage};
pub use parent_map::{ParentMap, SCRATCH_ID};
pub use url::{DatastoreUrl, UrlError, VolumeStore};
