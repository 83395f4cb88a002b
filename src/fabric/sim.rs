//! In-memory `Compute` fabric.
//!
//! VMs are records in a table; power operations flip a flag. Tasks can be
//! slowed down with a fixed latency and made to fail once with
//! [`SimCompute::fail_next`], which is how the commit path's failure
//! handling is exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fabric::compute::{Compute, HostRef, PowerState, VmConfigSpec, VmRef};

/// Task kinds that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimTask {
    Create,
    Reconfigure,
    PowerOn,
    PowerOff,
}

#[derive(Debug, Clone)]
pub struct SimVm {
    pub spec: VmConfigSpec,
    pub host: HostRef,
    pub power: PowerState,
    /// Number of reconfigure tasks applied.
    pub reconfigures: u32,
}

#[derive(Default)]
struct SimState {
    hosts: BTreeMap<String, Vec<HostRef>>,
    vms: HashMap<VmRef, SimVm>,
    next_id: u64,
    fail: HashSet<SimTask>,
}

#[derive(Default)]
pub struct SimCompute {
    state: Mutex<SimState>,
    latency: Duration,
}

impl SimCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task sleeps for `latency` before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| Error::Fabric("simulator state poisoned".to_owned()))
    }

    /// Make `host` reachable from `datastore`.
    pub fn add_host(&self, datastore: &str, host: &str) {
        if let Ok(mut state) = self.lock() {
            state
                .hosts
                .entry(datastore.to_owned())
                .or_default()
                .push(HostRef(host.to_owned()));
        }
    }

    /// Fail the next task of kind `task`.
    pub fn fail_next(&self, task: SimTask) {
        if let Ok(mut state) = self.lock() {
            state.fail.insert(task);
        }
    }

    pub fn vm(&self, vm: &VmRef) -> Option<SimVm> {
        self.lock().ok().and_then(|s| s.vms.get(vm).cloned())
    }

    pub fn vm_count(&self) -> usize {
        self.lock().map(|s| s.vms.len()).unwrap_or(0)
    }

    async fn task(&self, kind: SimTask) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.lock()?.fail.remove(&kind) {
            return Err(Error::Fabric(format!("{kind:?} task failed")));
        }
        Ok(())
    }

    fn with_vm<T>(&self, vm: &VmRef, f: impl FnOnce(&mut SimVm) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        let record = state
            .vms
            .get_mut(vm)
            .ok_or_else(|| Error::NotFound(format!("vm {vm}")))?;
        f(record)
    }
}

#[async_trait]
impl Compute for SimCompute {
    async fn hosts_for_datastore(&self, datastore: &str) -> Result<Vec<HostRef>> {
        Ok(self.lock()?.hosts.get(datastore).cloned().unwrap_or_default())
    }

    async fn create_vm(&self, spec: &VmConfigSpec, host: &HostRef) -> Result<VmRef> {
        self.task(SimTask::Create).await?;

        let mut state = self.lock()?;
        if state.vms.values().any(|vm| vm.spec.name == spec.name) {
            return Err(Error::Fabric(format!("duplicate vm name {}", spec.name)));
        }
        state.next_id += 1;
        let vm = VmRef(format!("vm-{}", state.next_id));
        state.vms.insert(
            vm.clone(),
            SimVm {
                spec: spec.clone(),
                host: host.clone(),
                power: PowerState::PoweredOff,
                reconfigures: 0,
            },
        );

        info!(vm = %vm, host = %host, name = %spec.name, "vm created");
        Ok(vm)
    }

    async fn reconfigure_vm(&self, vm: &VmRef, spec: &VmConfigSpec) -> Result<()> {
        self.task(SimTask::Reconfigure).await?;
        self.with_vm(vm, |record| {
            record.spec = spec.clone();
            record.reconfigures += 1;
            Ok(())
        })?;
        debug!(vm = %vm, "vm reconfigured");
        Ok(())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<()> {
        self.task(SimTask::PowerOn).await?;
        self.with_vm(vm, |record| {
            if record.power == PowerState::PoweredOn {
                return Err(Error::Fabric(format!("vm {vm} is already powered on")));
            }
            record.power = PowerState::PoweredOn;
            Ok(())
        })?;
        info!(vm = %vm, "vm powered on");
        Ok(())
    }

    async fn power_off(&self, vm: &VmRef) -> Result<()> {
        self.task(SimTask::PowerOff).await?;
        self.with_vm(vm, |record| {
            record.power = PowerState::PoweredOff;
            Ok(())
        })?;
        info!(vm = %vm, "vm powered off");
        Ok(())
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        self.with_vm(vm, |record| Ok(record.power))
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfigSpec> {
        self.with_vm(vm, |record| Ok(record.spec.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let sim = SimCompute::new();
        sim.add_host("ds1", "host-1");
        let host = HostRef("host-1".into());

        sim.fail_next(SimTask::Create);
        let spec = VmConfigSpec {
            name: "c1".into(),
            ..Default::default()
        };
        assert!(matches!(
            sim.create_vm(&spec, &host).await,
            Err(Error::Fabric(_))
        ));

        let vm = sim.create_vm(&spec, &host).await.unwrap();
        assert_eq!(sim.power_state(&vm).await.unwrap(), PowerState::PoweredOff);
        sim.power_on(&vm).await.unwrap();
        assert!(sim.power_on(&vm).await.is_err());
        assert_eq!(sim.hosts_for_datastore("ds1").await.unwrap(), vec![host]);
        assert!(sim.hosts_for_datastore("ds2").await.unwrap().is_empty());
    }
}
