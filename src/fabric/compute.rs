use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fabric::disk::DiskMode;
use crate::storage::url::DatastoreUrl;

/// Managed-object reference of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostRef(pub String);

/// Managed-object reference of a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmRef(pub String);

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PoweredOff,
    PoweredOn,
    Suspended,
}

/// Serial port backed by a network URI. The guest side connects out to
/// `uri` when `direction_client` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPort {
    pub uri: String,
    pub direction_client: bool,
    pub yield_on_poll: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub path: DatastoreUrl,
    pub parent: Option<DatastoreUrl>,
    pub capacity_kb: Option<u64>,
    pub mode: DiskMode,
}

/// The subset of a VM configuration the control plane sets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmConfigSpec {
    pub name: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub folder: String,
    pub datastore: String,
    pub boot_iso: Option<DatastoreUrl>,
    pub serial_port: Option<SerialPort>,
    pub disks: Vec<VirtualDisk>,
    /// Out-of-band key/value area readable by the guest.
    pub extra_config: BTreeMap<String, String>,
}

/// VM-level fabric operations. Every call is a task submission that may
/// suspend until the task completes.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Hosts that can reach `datastore`.
    async fn hosts_for_datastore(&self, datastore: &str) -> Result<Vec<HostRef>>;

    async fn create_vm(&self, spec: &VmConfigSpec, host: &HostRef) -> Result<VmRef>;

    async fn reconfigure_vm(&self, vm: &VmRef, spec: &VmConfigSpec) -> Result<()>;

    async fn power_on(&self, vm: &VmRef) -> Result<()>;

    async fn power_off(&self, vm: &VmRef) -> Result<()>;

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState>;

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfigSpec>;
}
