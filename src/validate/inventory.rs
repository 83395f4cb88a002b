//! What validation needs to know about the fabric, behind [`Inventory`].
//!
//! [`LocalInventory`] answers from an [`InventorySnapshot`], a TOML
//! description of a vCenter or ESX target. The CLI validates against one
//! and the tests build them inline.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeKind {
    Host,
    Cluster,
    ResourcePool,
}

/// A placement target. `path` is the full inventory path, e.g.
/// `/dc1/host/cluster1/Resources/pool1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResource {
    pub path: String,
    pub kind: ComputeKind,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// DRS state of the owning cluster; ignored for standalone hosts.
    #[serde(default)]
    pub drs_enabled: bool,
}

impl ComputeResource {
    /// Path below the datacenter's host folder with `Resources` elided:
    /// `/dc1/host/cluster1/Resources/pool1` becomes `cluster1/pool1`.
    pub fn short_path(&self) -> String {
        let below = self
            .path
            .split_once("/host/")
            .map_or(self.path.as_str(), |(_, rest)| rest);
        below
            .split('/')
            .filter(|part| !part.is_empty() && *part != "Resources")
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    Standard,
    Distributed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    #[serde(default)]
    pub kind: NetworkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreMount {
    pub host: String,
    #[serde(default = "writable")]
    pub writable: bool,
}

fn writable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreInfo {
    pub name: String,
    #[serde(default)]
    pub mounts: Vec<DatastoreMount>,
}

impl DatastoreInfo {
    pub fn writable_by(&self, host: &str) -> bool {
        self.mounts.iter().any(|m| m.host == host && m.writable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    /// Outgoing TCP ports the host firewall allows.
    #[serde(default)]
    pub open_ports: Vec<u16>,
}

/// Read access to the fabric inventory, plus the one advanced-option write
/// the dispatcher performs.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Whether the target is a vCenter rather than a standalone host.
    fn is_vcenter(&self) -> bool;

    async fn login(&self, user: &str, password: &str) -> Result<()>;

    /// SHA-1 thumbprint of the target's certificate.
    async fn thumbprint(&self) -> Result<String>;

    async fn datacenters(&self) -> Result<Vec<String>>;

    async fn compute_resources(&self, datacenter: &str) -> Result<Vec<ComputeResource>>;

    async fn networks(&self, datacenter: &str) -> Result<Vec<NetworkInfo>>;

    async fn datastores(&self, datacenter: &str) -> Result<Vec<DatastoreInfo>>;

    async fn hosts(&self, datacenter: &str) -> Result<Vec<HostInfo>>;

    async fn license_features(&self) -> Result<Vec<String>>;

    /// Advanced setting of the target.
    async fn option(&self, key: &str) -> Result<Option<String>>;

    async fn set_option(&self, key: &str, value: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatacenterSnapshot {
    pub name: String,
    pub compute: Vec<ComputeResource>,
    pub networks: Vec<NetworkInfo>,
    pub datastores: Vec<DatastoreInfo>,
    pub hosts: Vec<HostInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventorySnapshot {
    pub vcenter: bool,
    pub thumbprint: String,
    /// user -> password
    pub users: BTreeMap<String, String>,
    pub license_features: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub datacenters: Vec<DatacenterSnapshot>,
}

impl InventorySnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
        toml::from_str(&text).map_err(|e| Error::InvalidArgument(format!("{}: {e}", path.display())))
    }
}

pub struct LocalInventory {
    snapshot: Mutex<InventorySnapshot>,
}

impl LocalInventory {
    pub fn new(snapshot: InventorySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InventorySnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        self.lock().clone()
    }

    fn datacenter<T>(&self, name: &str, f: impl FnOnce(&DatacenterSnapshot) -> T) -> Result<T> {
        let snapshot = self.lock();
        let dc = snapshot
            .datacenters
            .iter()
            .find(|dc| dc.name == name)
            .ok_or_else(|| Error::NotFound(format!("datacenter {name}")))?;
        Ok(f(dc))
    }
}

#[async_trait]
impl Inventory for LocalInventory {
    fn is_vcenter(&self) -> bool {
        self.lock().vcenter
    }

    async fn login(&self, user: &str, password: &str) -> Result<()> {
        match self.lock().users.get(user) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(Error::PermissionDenied(format!("login failed for {user}"))),
        }
    }

    async fn thumbprint(&self) -> Result<String> {
        Ok(self.lock().thumbprint.clone())
    }

    async fn datacenters(&self) -> Result<Vec<String>> {
        Ok(self.lock().datacenters.iter().map(|dc| dc.name.clone()).collect())
    }

    async fn compute_resources(&self, datacenter: &str) -> Result<Vec<ComputeResource>> {
        self.datacenter(datacenter, |dc| dc.compute.clone())
    }

    async fn networks(&self, datacenter: &str) -> Result<Vec<NetworkInfo>> {
        self.datacenter(datacenter, |dc| dc.networks.clone())
    }

    async fn datastores(&self, datacenter: &str) -> Result<Vec<DatastoreInfo>> {
        self.datacenter(datacenter, |dc| dc.datastores.clone())
    }

    async fn hosts(&self, datacenter: &str) -> Result<Vec<HostInfo>> {
        self.datacenter(datacenter, |dc| dc.hosts.clone())
    }

    async fn license_features(&self) -> Result<Vec<String>> {
        Ok(self.lock().license_features.clone())
    }

    async fn option(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().options.get(key).cloned())
    }

    async fn set_option(&self, key: &str, value: &str) -> Result<()> {
        self.lock().options.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
