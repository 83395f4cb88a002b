//! Executor: turns a container's executor config into a VM on the fabric.

use std::sync::Arc;

use tracing::{Instrument, info};

use crate::error::Result;
use crate::exec::config::{self, ExecutorConfig};
use crate::exec::placement::{Placement, RandomPlacement};
use crate::fabric::{Compute, DiskMode, PowerState, SerialPort, VirtualDisk, VmConfigSpec, VmRef};
use crate::op::Operation;
use crate::storage::url::DatastoreUrl;

/// Fixed VM shape and the location of the control plane's attach listener.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub num_cpus: u32,
    pub memory_mb: u64,
    /// Datastore holding container disks and the boot ISO.
    pub datastore: String,
    /// Path of the boot ISO on `datastore`.
    pub boot_iso: String,
    pub vm_folder: String,
    pub attach_host: String,
    pub attach_port: u16,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            num_cpus: 2,
            memory_mb: 2048,
            datastore: "datastore1".to_owned(),
            boot_iso: "bootstrap.iso".to_owned(),
            vm_folder: "vch".to_owned(),
            attach_host: "127.0.0.1".to_owned(),
            attach_port: 2377,
        }
    }
}

pub struct Executor {
    compute: Arc<dyn Compute>,
    placement: Box<dyn Placement>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(compute: Arc<dyn Compute>, settings: ExecutorSettings) -> Self {
        Self {
            compute,
            placement: Box::new(RandomPlacement),
            settings,
        }
    }

    /// Replace the default random host choice.
    pub fn with_placement(mut self, placement: impl Placement + 'static) -> Self {
        self.placement = Box::new(placement);
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn compute(&self) -> &Arc<dyn Compute> {
        &self.compute
    }

    /// VM config for `config`. When `image` is given the container gets a
    /// child disk of that image's disk.
    pub fn vm_spec(&self, config: &ExecutorConfig, image: Option<&DatastoreUrl>) -> Result<VmConfigSpec> {
        let id = &config.common.id;
        let ds = &self.settings.datastore;

        let disks = image
            .map(|parent| VirtualDisk {
                path: DatastoreUrl::new(ds.clone(), &format!("{id}/{id}.vmdk")),
                parent: Some(parent.clone()),
                capacity_kb: None,
                mode: DiskMode::Persistent,
            })
            .into_iter()
            .collect();

        Ok(VmConfigSpec {
            name: id.clone(),
            num_cpus: self.settings.num_cpus,
            memory_mb: self.settings.memory_mb,
            folder: self.settings.vm_folder.clone(),
            datastore: ds.clone(),
            boot_iso: Some(DatastoreUrl::new(ds.clone(), &self.settings.boot_iso)),
            serial_port: Some(SerialPort {
                uri: format!("tcp://{}:{}", self.settings.attach_host, self.settings.attach_port),
                direction_client: true,
                yield_on_poll: true,
            }),
            disks,
            extra_config: config::encode(config)?,
        })
    }

    /// Place and create the VM. The VM is left powered off.
    pub async fn create(&self, op: &Operation, spec: &VmConfigSpec) -> Result<VmRef> {
        let span = tracing::info_span!("create_vm", op = op.id(), name = %spec.name);
        async {
            let hosts = op
                .run(self.compute.hosts_for_datastore(&self.settings.datastore))
                .await?;
            let host = self.placement.choose(&self.settings.datastore, &hosts)?;

            let vm = op.run(self.compute.create_vm(spec, &host)).await?;
            info!(vm = %vm, host = %host, "container vm created");
            Ok(vm)
        }
        .instrument(span)
        .await
    }

    pub async fn reconfigure(&self, op: &Operation, vm: &VmRef, spec: &VmConfigSpec) -> Result<()> {
        op.run(self.compute.reconfigure_vm(vm, spec)).await
    }

    pub async fn start(&self, op: &Operation, vm: &VmRef) -> Result<()> {
        op.run(self.compute.power_on(vm)).await
    }

    pub async fn stop(&self, op: &Operation, vm: &VmRef) -> Result<()> {
        op.run(self.compute.power_off(vm)).await
    }

    pub async fn power_state(&self, op: &Operation, vm: &VmRef) -> Result<PowerState> {
        op.run(self.compute.power_state(vm)).await
    }

    /// The executor config the guest would read from `vm` right now.
    pub async fn guest_config(&self, op: &Operation, vm: &VmRef) -> Result<ExecutorConfig> {
        let spec = op.run(self.compute.vm_config(vm)).await?;
        config::decode(&spec.extra_config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::exec::config::CreateConfig;
    use crate::fabric::{HostRef, SimCompute};

    struct First;

    impl Placement for First {
        fn choose(&self, _datastore: &str, hosts: &[HostRef]) -> Result<HostRef> {
            hosts
                .first()
                .cloned()
                .ok_or_else(|| Error::Fabric("none".into()))
        }
    }

    fn config() -> ExecutorConfig {
        let create = CreateConfig {
            path: "/bin/true".into(),
            ..Default::default()
        };
        ExecutorConfig::for_create("c0ffee", &create, "KEY".into())
    }

    #[test]
    fn spec_carries_serial_console_and_guest_config() {
        let exec = Executor::new(Arc::new(SimCompute::new()), ExecutorSettings::default());
        let cfg = config();
        let image = DatastoreUrl::new("datastore1", "VIC/s/l1/l1.vmdk");
        let spec = exec.vm_spec(&cfg, Some(&image)).unwrap();

        assert_eq!(spec.num_cpus, 2);
        assert_eq!(spec.memory_mb, 2048);
        let serial = spec.serial_port.as_ref().unwrap();
        assert_eq!(serial.uri, "tcp://127.0.0.1:2377");
        assert!(serial.direction_client);
        assert_eq!(spec.disks.len(), 1);
        assert_eq!(spec.disks[0].parent.as_ref(), Some(&image));
        assert_eq!(config::decode(&spec.extra_config).unwrap(), cfg);
    }

    #[tokio::test]
    async fn create_uses_the_placement_hook() {
        let sim = Arc::new(SimCompute::new());
        sim.add_host("datastore1", "h1");
        sim.add_host("datastore1", "h2");
        let exec = Executor::new(sim.clone(), ExecutorSettings::default()).with_placement(First);
        let op = Operation::new("test");

        let spec = exec.vm_spec(&config(), None).unwrap();
        let vm = exec.create(&op, &spec).await.unwrap();
        assert_eq!(sim.vm(&vm).unwrap().host, HostRef("h1".into()));
        assert_eq!(exec.power_state(&op, &vm).await.unwrap(), PowerState::PoweredOff);
        assert_eq!(exec.guest_config(&op, &vm).await.unwrap(), config());
    }

    #[tokio::test]
    async fn no_attached_host_is_a_fabric_error() {
        let exec = Executor::new(Arc::new(SimCompute::new()), ExecutorSettings::default());
        let op = Operation::new("test");
        let spec = exec.vm_spec(&config(), None).unwrap();
        let err = exec.create(&op, &spec).await.unwrap_err();
        assert!(matches!(err, Error::Fabric(_)), "got: {err:?}");
    }
}
