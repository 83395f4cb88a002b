//! Control-plane HTTP API.
//!
//! ```text
//! POST   /storage                               create image store
//! GET    /storage                               list image stores
//! GET    /storage/{store}?ids=a,b               list images
//! GET    /storage/{store}/info/{id}             get image
//! PUT    /storage/{store}/{parent}/{id}?sum=..  write image (tar body)
//!
//! POST   /containers                            create, returns id + handle
//! GET    /containers                            list container ids
//! GET    /containers/{id}                       fresh handle for a container
//! GET    /containers/{id}/state                 committed state
//! PUT    /handles/{handle}/state                {"state": "RUNNING" | "STOPPED"}
//! PUT    /handles/{handle}/endpoints            {"scope": "bridge", "ip": null}
//! POST   /handles/{handle}/commit               apply the handle
//! ```
//!
//! Errors map to status codes through [`Error::status_code`](crate::error::Error::status_code).

pub mod containers;
pub mod error;
pub mod storage;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::PortLayerConfig;
use crate::error::{Error, Result};
use crate::exec::{Executor, Registry};
use crate::fabric::{LocalDatastore, LocalDisks, SimCompute};
use crate::op::Operation;
use crate::paths::PortLayerPaths;
use crate::storage::{DiskManager, ImageStore, ImageStorer, NameLookupCache};

/// Host the local compute simulator places every VM on.
pub const LOCAL_HOST: &str = "localhost";

/// Shared state behind every route.
pub struct PortLayer {
    pub images: Arc<dyn ImageStorer>,
    pub registry: Arc<Registry>,
    pub operation_timeout: Duration,
    pub pipe_close_timeout: Duration,
}

impl PortLayer {
    pub fn new(images: Arc<dyn ImageStorer>, registry: Arc<Registry>) -> Self {
        Self {
            images,
            registry,
            operation_timeout: crate::op::DEFAULT_TIMEOUT,
            pipe_close_timeout: crate::pipe::DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// A port layer over a host-directory datastore and the compute
    /// simulator. The image cache is repopulated before returning.
    pub async fn local(cfg: &PortLayerConfig, paths: &PortLayerPaths) -> Result<Self> {
        let datastore = Arc::new(LocalDatastore::open(
            cfg.storage.datastore.clone(),
            cfg.datastore_path(paths),
        )?);
        let disks = DiskManager::new(
            Arc::new(LocalDisks::new(datastore.clone())),
            cfg.storage.max_attached_disks,
        );
        let store = ImageStore::new(datastore, disks, cfg.image_store_settings(cfg.mount_root(paths))?);

        let cache = NameLookupCache::new(Arc::new(store));
        let op = Operation::new("startup").with_timeout(cfg.operation_timeout());
        cache.repopulate(&op).await?;

        let compute = SimCompute::new();
        compute.add_host(&cfg.storage.datastore, LOCAL_HOST);
        let executor = Arc::new(Executor::new(Arc::new(compute), cfg.executor_settings()));
        let registry = Arc::new(
            Registry::new(executor, cfg.exec.handle_cache_size).with_scopes(Arc::new(cfg.scopes()?)),
        );

        info!(
            datastore = %cfg.storage.datastore,
            root = %cfg.datastore_path(paths).display(),
            "port layer ready"
        );
        Ok(Self {
            images: Arc::new(cache),
            registry,
            operation_timeout: cfg.operation_timeout(),
            pipe_close_timeout: cfg.pipe_close_timeout(),
        })
    }

    /// Root operation for one API call.
    pub fn op(&self, name: &str) -> Operation {
        Operation::new(name).with_timeout(self.operation_timeout)
    }
}

pub fn router(state: Arc<PortLayer>) -> Router {
    Router::new()
        .route("/storage", post(storage::create_store).get(storage::list_stores))
        .route("/storage/{store}", get(storage::list_images))
        .route("/storage/{store}/info/{id}", get(storage::get_image))
        .route(
            "/storage/{store}/{parent}/{id}",
            put(storage::write_image).layer(DefaultBodyLimit::disable()),
        )
        .route("/containers", post(containers::create).get(containers::list))
        .route("/containers/{id}", get(containers::get))
        .route("/containers/{id}/state", get(containers::state))
        .route("/handles/{handle}/state", put(containers::state_change))
        .route("/handles/{handle}/endpoints", put(containers::add_endpoint))
        .route("/handles/{handle}/commit", post(containers::commit))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<PortLayer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| Error::io("listener address", e))?;
    info!(%addr, "api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::io(format!("serve {addr}"), e))
}
