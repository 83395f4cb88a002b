//! Name-lookup cache over an [`ImageStorer`].
//!
//! Holds `store URL -> (id -> image)` for every store this process knows
//! about. All mutations go through the cache, so a listing of a known store
//! never touches the datastore. The table lock is a plain `RwLock` and is
//! never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::op::Operation;
use crate::storage::image::{ArchiveReader, Image, ImageStorer, Metadata};
use crate::storage::parent_map::SCRATCH_ID;
use crate::storage::url::store_name;

type StoreIndex = BTreeMap<String, Image>;

pub struct NameLookupCache {
    inner: Arc<dyn ImageStorer>,
    stores: RwLock<HashMap<Url, StoreIndex>>,
}

impl NameLookupCache {
    pub fn new(inner: Arc<dyn ImageStorer>) -> Self {
        Self {
            inner,
            stores: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, store: &Url, id: &str) -> Option<Image> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store)
            .and_then(|images| images.get(id).cloned())
    }

    fn is_known(&self, store: &Url) -> bool {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(store)
    }

    fn insert(&self, image: Image) {
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(image.store.clone())
            .or_default()
            .insert(image.id.clone(), image);
    }

    /// Load every image of `store` from the backing store into the cache.
    async fn load_store(&self, op: &Operation, store: &Url) -> Result<()> {
        let images = self.inner.list_images(op, store, None).await?;
        let index: StoreIndex = images.into_iter().map(|i| (i.id.clone(), i)).collect();

        debug!(store = %store, images = index.len(), "store loaded into cache");
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(store.clone(), index);
        Ok(())
    }

    /// Load `store` whole on first touch, so a single lookup never leaves a
    /// partial index behind.
    async fn ensure_loaded(&self, op: &Operation, store: &Url) -> Result<()> {
        if !self.is_known(store) {
            self.load_store(op, store).await?;
        }
        Ok(())
    }

    /// Rebuild the cache from the backing store. Run at startup.
    pub async fn repopulate(&self, op: &Operation) -> Result<()> {
        let stores = self.inner.list_image_stores(op).await?;
        let mut fresh = HashMap::with_capacity(stores.len());
        for store in stores {
            op.check()?;
            let images = self.inner.list_images(op, &store, None).await?;
            let index: StoreIndex = images.into_iter().map(|i| (i.id.clone(), i)).collect();
            fresh.insert(store, index);
        }

        let (stores, images) = (fresh.len(), fresh.values().map(BTreeMap::len).sum::<usize>());
        *self.stores.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!(stores, images, "image cache repopulated");
        Ok(())
    }

    /// Number of images cached for `store`, if the store is known.
    pub fn cached_len(&self, store: &Url) -> Option<usize> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store)
            .map(BTreeMap::len)
    }
}

#[async_trait]
impl ImageStorer for NameLookupCache {
    async fn create_image_store(&self, op: &Operation, name: &str) -> Result<Url> {
        let url = self.inner.create_image_store(op, name).await?;
        let scratch = self.inner.get_image(op, &url, SCRATCH_ID).await?;

        let mut index = StoreIndex::new();
        index.insert(SCRATCH_ID.to_owned(), scratch);
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), index);
        Ok(url)
    }

    async fn get_image_store(&self, op: &Operation, name: &str) -> Result<Url> {
        let url = self.inner.get_image_store(op, name).await?;
        if !self.is_known(&url) {
            self.load_store(op, &url).await?;
        }
        Ok(url)
    }

    async fn list_image_stores(&self, op: &Operation) -> Result<Vec<Url>> {
        self.inner.list_image_stores(op).await
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
        self.ensure_loaded(op, &parent.store).await?;

        // parent must exist before anything is written
        let parent = match self.cached(&parent.store, &parent.id) {
            Some(parent) => parent,
            None => {
                let found = self.inner.get_image(op, &parent.store, &parent.id).await?;
                self.insert(found.clone());
                found
            }
        };
        if self.cached(&parent.store, id).is_some() {
            let store = store_name(&parent.store)?;
            return Err(Error::AlreadyExists(format!("image {id} in store {store}")));
        }

        let image = self
            .inner
            .write_image(op, &parent, id, metadata, digest, archive)
            .await?;
        self.insert(image.clone());
        Ok(image)
    }

    async fn get_image(&self, op: &Operation, store: &Url, id: &str) -> Result<Image> {
        self.ensure_loaded(op, store).await?;
        if let Some(image) = self.cached(store, id) {
            return Ok(image);
        }
        let image = self.inner.get_image(op, store, id).await?;
        self.insert(image.clone());
        Ok(image)
    }

    /// Images in id order. Served from the cache once the store is known.
    async fn list_images(
        &self,
        op: &Operation,
        store: &Url,
        ids: Option<&[String]>,
    ) -> Result<Vec<Image>> {
        self.ensure_loaded(op, store).await?;

        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        let images = stores
            .get(store)
            .ok_or_else(|| Error::NotFound(format!("image store {store}")))?;
        Ok(match ids {
            Some(ids) => images
                .values()
                .filter(|image| ids.contains(&image.id))
                .cloned()
                .collect(),
            None => images.values().cloned().collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::fabric::{LocalDatastore, LocalDisks};
    use crate::storage::disk::DiskManager;
    use crate::storage::image_store::{DEFAULT_DISK_LABEL, DEFAULT_ROOT, ImageStore, ImageStoreSettings};

    /// Counts calls that reach the backing store.
    struct Counting {
        inner: ImageStore,
        lists: AtomicUsize,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl ImageStorer for Counting {
        async fn create_image_store(&self, op: &Operation, name: &str) -> Result<Url> {
            self.inner.create_image_store(op, name).await
        }
        async fn get_image_store(&self, op: &Operation, name: &str) -> Result<Url> {
            self.inner.get_image_store(op, name).await
        }
        async fn list_image_stores(&self, op: &Operation) -> Result<Vec<Url>> {
            self.inner.list_image_stores(op).await
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
            self.inner.write_image(op, parent, id, metadata, digest, archive).await
        }
        async fn get_image(&self, op: &Operation, store: &Url, id: &str) -> Result<Image> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get_image(op, store, id).await
        }
        async fn list_images(
            &self,
            op: &Operation,
            store: &Url,
            ids: Option<&[String]>,
        ) -> Result<Vec<Image>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list_images(op, store, ids).await
        }
    }

    fn backing(dir: &tempfile::TempDir) -> Arc<Counting> {
        let ds = Arc::new(LocalDatastore::open("ds1", dir.path().join("ds")).unwrap());
        let disks = Arc::new(LocalDisks::new(ds.clone()));
        Arc::new(Counting {
            inner: ImageStore::new(
                ds,
                DiskManager::new(disks, 8),
                ImageStoreSettings {
                    service: Url::parse("http://portlayer.local").unwrap(),
                    root: DEFAULT_ROOT.to_owned(),
                    mount_root: dir.path().join("mnt"),
                    scratch_size_kb: 1024,
                    disk_label: DEFAULT_DISK_LABEL.to_owned(),
                },
            ),
            lists: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        })
    }

    fn empty_tar() -> ArchiveReader {
        let bytes = tar::Builder::new(Vec::new()).into_inner().unwrap();
        Box::new(std::io::Cursor::new(bytes))
    }

    #[tokio::test]
    async fn listing_a_known_store_skips_the_datastore() {
        let dir = tempfile::tempdir().unwrap();
        let inner = backing(&dir);
        let cache = NameLookupCache::new(inner.clone());
        let op = Operation::new("test");

        let url = cache.create_image_store(&op, "s").await.unwrap();
        let scratch = cache.get_image(&op, &url, SCRATCH_ID).await.unwrap();
        cache
            .write_image(&op, &scratch, "a", Metadata::new(), None, empty_tar())
            .await
            .unwrap();

        let gets_before = inner.gets.load(Ordering::SeqCst);
        let images = cache.list_images(&op, &url, None).await.unwrap();
        let ids: Vec<_> = images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", SCRATCH_ID]);
        assert_eq!(inner.lists.load(Ordering::SeqCst), 0, "list went to the datastore");
        assert_eq!(inner.gets.load(Ordering::SeqCst), gets_before);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_from_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NameLookupCache::new(backing(&dir));
        let op = Operation::new("test");

        let url = cache.create_image_store(&op, "s").await.unwrap();
        let scratch = cache.get_image(&op, &url, SCRATCH_ID).await.unwrap();
        cache
            .write_image(&op, &scratch, "a", Metadata::new(), None, empty_tar())
            .await
            .unwrap();

        let err = cache
            .write_image(&op, &scratch, "a", Metadata::new(), None, empty_tar())
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "got: {err:?}");
    }

    #[tokio::test]
    async fn repopulate_rebuilds_from_the_datastore() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("test");
        let url = {
            let cache = NameLookupCache::new(backing(&dir));
            let url = cache.create_image_store(&op, "s").await.unwrap();
            let scratch = cache.get_image(&op, &url, SCRATCH_ID).await.unwrap();
            for id in ["a", "b"] {
                cache
                    .write_image(&op, &scratch, id, Metadata::new(), None, empty_tar())
                    .await
                    .unwrap();
            }
            url
        };

        let cache = NameLookupCache::new(backing(&dir));
        assert_eq!(cache.cached_len(&url), None);
        cache.repopulate(&op).await.unwrap();
        assert_eq!(cache.cached_len(&url), Some(3));

        let b = cache.get_image(&op, &url, "b").await.unwrap();
        assert_eq!(b.parent.as_deref(), Some(SCRATCH_ID));
    }

    #[tokio::test]
    async fn first_lookup_loads_the_whole_store() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("test");
        let url = {
            let store = backing(&dir);
            let url = store.create_image_store(&op, "s").await.unwrap();
            let scratch = store.get_image(&op, &url, SCRATCH_ID).await.unwrap();
            for id in ["a", "b", "c"] {
                store
                    .write_image(&op, &scratch, id, Metadata::new(), None, empty_tar())
                    .await
                    .unwrap();
            }
            url
        };

        let cache = NameLookupCache::new(backing(&dir));
        cache.get_image(&op, &url, SCRATCH_ID).await.unwrap();
        assert_eq!(cache.cached_len(&url), Some(4));
        assert_eq!(cache.list_images(&op, &url, None).await.unwrap().len(), 4);

        let cache = NameLookupCache::new(backing(&dir));
        let scratch = ImageStorer::get_image(&*backing(&dir), &op, &url, SCRATCH_ID).await.unwrap();
        cache
            .write_image(&op, &scratch, "d", Metadata::new(), None, empty_tar())
            .await
            .unwrap();
        let ids: Vec<_> = cache
            .list_images(&op, &url, None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", SCRATCH_ID]);
    }

    #[tokio::test]
    async fn missing_parent_fails_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NameLookupCache::new(backing(&dir));
        let op = Operation::new("test");

        let url = cache.create_image_store(&op, "s").await.unwrap();
        let mut ghost = cache.get_image(&op, &url, SCRATCH_ID).await.unwrap();
        ghost.id = "ghost".to_owned();

        let err = cache
            .write_image(&op, &ghost, "child", Metadata::new(), None, empty_tar())
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "got: {err:?}");
        assert_eq!(cache.cached_len(&url), Some(1));
    }
}
