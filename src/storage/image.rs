use std::collections::BTreeMap;
use std::io::Read;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;
use crate::op::Operation;
use crate::storage::parent_map::SCRATCH_ID;
use crate::storage::url::{DatastoreUrl, image_url, store_name};

/// Opaque per-image metadata, one entry per key.
pub type Metadata = BTreeMap<String, Vec<u8>>;

/// A streamed layer archive.
pub type ArchiveReader = Box<dyn Read + Send>;

/// An immutable image record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// URL of the store holding the image.
    pub store: Url,
    /// Id of the parent image in the same store; `None` only for scratch.
    pub parent: Option<String>,
    pub self_link: Url,
    pub metadata: Metadata,
    /// The image's virtual disk.
    pub disk: DatastoreUrl,
}

impl Image {
    pub fn is_scratch(&self) -> bool {
        self.id == SCRATCH_ID
    }

    pub fn store_name(&self) -> Result<String> {
        Ok(store_name(&self.store)?)
    }

    /// Self link of the parent image.
    pub fn parent_link(&self) -> Result<Option<Url>> {
        let Some(parent) = &self.parent else {
            return Ok(None);
        };
        Ok(Some(image_url(&self.store, &self.store_name()?, parent)?))
    }
}

/// Operations of a content-addressed image store.
///
/// Implemented by the datastore-backed store and by the name-lookup cache
/// that fronts it.
#[async_trait]
pub trait ImageStorer: Send + Sync {
    /// Create a store and its scratch image.
    async fn create_image_store(&self, op: &Operation, name: &str) -> Result<Url>;

    async fn get_image_store(&self, op: &Operation, name: &str) -> Result<Url>;

    async fn list_image_stores(&self, op: &Operation) -> Result<Vec<Url>>;

    /// Write a child of `parent` whose content is the archive read from
    /// `archive`. `digest`, when given as `sha256:<hex>`, must match the
    /// archive stream.
    async fn write_image(
        &self,
        op: &Operation,
        parent: &Image,
        id: &str,
        metadata: Metadata,
        digest: Option<&str>,
        archive: ArchiveReader,
    ) -> Result<Image>;

    async fn get_image(&self, op: &Operation, store: &Url, id: &str) -> Result<Image>;

    /// Images of a store, optionally restricted to `ids`.
    async fn list_images(
        &self,
        op: &Operation,
        store: &Url,
        ids: Option<&[String]>,
    ) -> Result<Vec<Image>>;
}
