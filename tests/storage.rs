//! Image store scenarios over a host-directory datastore: store creation,
//! scratch, layered writes, restart and listing through the name-lookup
//! cache.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use url::Url;

use vch_portlayer::error::Error;
use vch_portlayer::fabric::{LocalDatastore, LocalDisks};
use vch_portlayer::op::Operation;
use vch_portlayer::storage::image_store::{DEFAULT_DISK_LABEL, DEFAULT_ROOT};
use vch_portlayer::storage::{
    ArchiveReader, DiskManager, ImageStore, ImageStoreSettings, ImageStorer, Metadata, NameLookupCache, SCRATCH_ID,
};

const SERVICE: &str = "http://portlayer.test";

fn image_store(dir: &Path) -> ImageStore {
    let ds = Arc::new(LocalDatastore::open("ds1", dir.join("ds")).unwrap());
    let disks = DiskManager::new(Arc::new(LocalDisks::new(ds.clone())), 8);
    ImageStore::new(
        ds,
        disks,
        ImageStoreSettings {
            service: Url::parse(SERVICE).unwrap(),
            root: DEFAULT_ROOT.to_owned(),
            mount_root: dir.join("mnt"),
            scratch_size_kb: 1024,
            disk_label: DEFAULT_DISK_LABEL.to_owned(),
        },
    )
}

fn empty_tar() -> ArchiveReader {
    let bytes = tar::Builder::new(Vec::new()).into_inner().unwrap();
    Box::new(Cursor::new(bytes))
}

#[tokio::test]
async fn second_store_create_already_exists() {
    let dir = tempfile::tempdir().unwrap();
    let store = image_store(dir.path());
    let op = Operation::new("test");

    let url = store.create_image_store(&op, "testStore").await.unwrap();
    assert_eq!(url.as_str(), format!("{SERVICE}/storage/testStore"));

    let err = store.create_image_store(&op, "testStore").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "got: {err:?}");
}

#[tokio::test]
async fn scratch_exists_right_after_create() {
    let dir = tempfile::tempdir().unwrap();
    let store = image_store(dir.path());
    let op = Operation::new("test");

    let url = store.create_image_store(&op, "testStore").await.unwrap();
    let scratch = store.get_image(&op, &url, SCRATCH_ID).await.unwrap();
    assert!(scratch.parent.is_none());
    assert_eq!(scratch.store, url);
}

#[tokio::test]
async fn parent_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let op = Operation::new("test");
    let url = {
        let store = image_store(dir.path());
        let url = store.create_image_store(&op, "testStore").await.unwrap();
        let scratch = store.get_image(&op, &url, SCRATCH_ID).await.unwrap();
        let image = store
            .write_image(&op, &scratch, "id-1", Metadata::new(), None, empty_tar())
            .await
            .unwrap();
        assert_eq!(image.parent.as_deref(), Some(SCRATCH_ID));
        url
    };

    let restarted = image_store(dir.path());
    let image = restarted.get_image(&op, &url, "id-1").await.unwrap();
    assert_eq!(image.parent.as_deref(), Some(SCRATCH_ID));
    assert_eq!(
        image.parent_link().unwrap().unwrap(),
        restarted.get_image(&op, &url, SCRATCH_ID).await.unwrap().self_link
    );
}

#[tokio::test]
async fn listing_returns_every_write() {
    let dir = tempfile::tempdir().unwrap();
    let cache = NameLookupCache::new(Arc::new(image_store(dir.path())));
    let op = Operation::new("test");

    let url = cache.create_image_store(&op, "testStore").await.unwrap();
    let scratch = cache.get_image(&op, &url, SCRATCH_ID).await.unwrap();
    for n in 1..=50 {
        cache
            .write_image(&op, &scratch, &format!("id-{n}"), Metadata::new(), None, empty_tar())
            .await
            .unwrap();
    }

    let all = cache.list_images(&op, &url, None).await.unwrap();
    assert_eq!(all.len(), 51);

    let wanted = ["id-1".to_owned(), "id-2".to_owned(), "id-3".to_owned()];
    let mut some: Vec<String> = cache
        .list_images(&op, &url, Some(&wanted[..]))
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    some.sort();
    assert_eq!(some, wanted);

    // a fresh cache over the same datastore sees the same images
    let reloaded = NameLookupCache::new(Arc::new(image_store(dir.path())));
    reloaded.repopulate(&op).await.unwrap();
    assert_eq!(reloaded.list_images(&op, &url, None).await.unwrap().len(), 51);
}
