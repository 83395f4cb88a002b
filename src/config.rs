//! Port-layer configuration.
//!
//! Loaded from `portlayer.toml` in the config directory (or `--config`).
//! Every section and field has a default, so an empty or partial file is
//! valid.
//!
//! ```toml
//! [service]
//! url = "http://localhost:2377"
//! listen = "127.0.0.1:2378"
//!
//! [storage]
//! datastore = "datastore1"
//! image_root = "VIC"
//!
//! [exec]
//! bridge_subnet = "172.16.0.0/16"
//!
//! [toolbox]
//! poll_interval_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::exec::{ExecutorSettings, Scopes, Subnet};
use crate::exec::registry::DEFAULT_HANDLE_CACHE_SIZE;
use crate::paths::PortLayerPaths;
use crate::storage::image_store::{DEFAULT_DISK_LABEL, DEFAULT_ROOT, DEFAULT_SCRATCH_SIZE_KB};
use crate::storage::{ImageStoreSettings, MAX_ATTACHED_DISKS};
use crate::toolbox::hgfs::{self, DEFAULT_MAX_SESSIONS};
use crate::toolbox::{CommandServer, ProcessManager, ServiceSettings};
use crate::toolbox::process::DEFAULT_EXPIRY;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortLayerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub exec: ExecConfig,
    pub toolbox: ToolboxConfig,
    pub pipe: PipeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base of every store and image URL handed out.
    pub url: String,
    /// Address the HTTP API binds.
    pub listen: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:2377".to_owned(),
            listen: "127.0.0.1:2378".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub datastore: String,
    /// Host directory backing the simulated datastore; `<data>/datastore`
    /// when unset.
    pub datastore_path: Option<PathBuf>,
    pub image_root: String,
    pub scratch_size_kb: u64,
    pub disk_label: String,
    pub max_attached_disks: usize,
    /// Where image disks are mounted while written; `<data>/mnt` when unset.
    pub mount_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            datastore: "datastore1".to_owned(),
            datastore_path: None,
            image_root: DEFAULT_ROOT.to_owned(),
            scratch_size_kb: DEFAULT_SCRATCH_SIZE_KB,
            disk_label: DEFAULT_DISK_LABEL.to_owned(),
            max_attached_disks: MAX_ATTACHED_DISKS,
            mount_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub attach_host: String,
    pub attach_port: u16,
    pub boot_iso: String,
    pub vm_folder: String,
    pub handle_cache_size: usize,
    pub operation_timeout_secs: u64,
    /// Port group backing the bridge scope.
    pub bridge_port_group: String,
    pub bridge_subnet: Subnet,
}

impl Default for ExecConfig {
    fn default() -> Self {
        let exec = ExecutorSettings::default();
        Self {
            num_cpus: exec.num_cpus,
            memory_mb: exec.memory_mb,
            attach_host: exec.attach_host,
            attach_port: exec.attach_port,
            boot_iso: exec.boot_iso,
            vm_folder: exec.vm_folder,
            handle_cache_size: DEFAULT_HANDLE_CACHE_SIZE,
            operation_timeout_secs: 180,
            bridge_port_group: "bridge".to_owned(),
            bridge_subnet: Subnet {
                addr: std::net::Ipv4Addr::new(172, 16, 0, 0),
                prefix: 16,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolboxConfig {
    pub name: String,
    pub poll_interval_ms: u64,
    pub process_expiry_secs: u64,
    pub hgfs_max_sessions: usize,
}

impl Default for ToolboxConfig {
    fn default() -> Self {
        let service = ServiceSettings::default();
        Self {
            name: service.name,
            poll_interval_ms: service.poll_interval.as_millis() as u64,
            process_expiry_secs: DEFAULT_EXPIRY.as_secs(),
            hgfs_max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub close_timeout_secs: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            close_timeout_secs: crate::pipe::DEFAULT_CLOSE_TIMEOUT.as_secs(),
        }
    }
}

impl PortLayerConfig {
    /// Read `path`, or return the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).map_err(|e| Error::InvalidArgument(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path.display().to_string(), e)),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn datastore_path(&self, paths: &PortLayerPaths) -> PathBuf {
        self.storage.datastore_path.clone().unwrap_or_else(|| paths.datastore())
    }

    pub fn mount_root(&self, paths: &PortLayerPaths) -> PathBuf {
        self.storage.mount_root.clone().unwrap_or_else(|| paths.mounts())
    }

    pub fn service_url(&self) -> Result<Url> {
        Url::parse(&self.service.url)
            .map_err(|e| Error::InvalidArgument(format!("service url {:?}: {e}", self.service.url)))
    }

    pub fn image_store_settings(&self, mount_root: PathBuf) -> Result<ImageStoreSettings> {
        Ok(ImageStoreSettings {
            service: self.service_url()?,
            root: self.storage.image_root.clone(),
            mount_root,
            scratch_size_kb: self.storage.scratch_size_kb,
            disk_label: self.storage.disk_label.clone(),
        })
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            num_cpus: self.exec.num_cpus,
            memory_mb: self.exec.memory_mb,
            datastore: self.storage.datastore.clone(),
            boot_iso: self.exec.boot_iso.clone(),
            vm_folder: self.exec.vm_folder.clone(),
            attach_host: self.exec.attach_host.clone(),
            attach_port: self.exec.attach_port,
        }
    }

    /// Network scopes holding the bridge scope only.
    pub fn scopes(&self) -> Result<Scopes> {
        Scopes::new(&self.exec.bridge_port_group, self.exec.bridge_subnet)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            name: self.toolbox.name.clone(),
            poll_interval: Duration::from_millis(self.toolbox.poll_interval_ms),
        }
    }

    /// Guest command handlers with this config's process expiry and HGFS
    /// session cap.
    pub fn command_server(&self) -> CommandServer {
        CommandServer::new(
            Arc::new(ProcessManager::new(self.process_expiry())),
            Arc::new(hgfs::Server::new(self.toolbox.hgfs_max_sessions)),
        )
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.exec.operation_timeout_secs)
    }

    pub fn process_expiry(&self) -> Duration {
        Duration::from_secs(self.toolbox.process_expiry_secs)
    }

    pub fn pipe_close_timeout(&self) -> Duration {
        Duration::from_secs(self.pipe.close_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
