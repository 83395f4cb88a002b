//! Process-wide container registry and handle table.
//!
//! Lock order: the container map, then a container's commit lock. The
//! handle table is never held across an `.await`; while it is held a
//! container's config and then the network scopes may be locked.
//!
//! An endpoint reserved through a handle belongs to that draft until a
//! commit writes it into the container's config. A draft that is evicted,
//! or whose commit fails before the fabric took its config, gives its
//! addresses back.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::config::{CreateConfig, ExecutorConfig};
use crate::exec::container::Container;
use crate::exec::executor::Executor;
use crate::exec::handle::Handle;
use crate::exec::network::{Endpoint, Scopes};
use crate::op::Operation;
use crate::storage::url::DatastoreUrl;

pub const DEFAULT_HANDLE_CACHE_SIZE: usize = 1000;

/// Bytes in a container id.
pub const CONTAINER_ID_LEN: usize = 32;

/// Bounded handle store; the oldest handle is evicted first.
struct HandleTable {
    capacity: usize,
    handles: HashMap<String, Handle>,
    order: VecDeque<String>,
}

impl HandleTable {
    /// Store `handle`, returning the handles evicted to make room.
    fn insert(&mut self, handle: Handle) -> Vec<Handle> {
        let key = handle.key().to_owned();
        if self.handles.insert(key.clone(), handle).is_none() {
            self.order.push_back(key);
        }
        let mut evicted = Vec::new();
        while self.handles.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            if let Some(old) = self.handles.remove(&oldest) {
                debug!(handle = %oldest, "handle evicted");
                evicted.push(old);
            }
        }
        evicted
    }

    /// Whether a live handle of `container` other than `except` reserved
    /// `scope`.
    fn reserves(&self, container: &Container, scope: &str, except: &str) -> bool {
        self.handles.values().any(|h| {
            h.key() != except
                && std::ptr::eq(h.container().as_ref(), container)
                && h.pending_endpoints().iter().any(|s| s == scope)
        })
    }

    fn remove(&mut self, key: &str) -> Option<Handle> {
        let handle = self.handles.remove(key)?;
        self.order.retain(|k| k != key);
        Some(handle)
    }
}

pub struct Registry {
    executor: Arc<Executor>,
    scopes: Option<Arc<Scopes>>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    handles: Mutex<HandleTable>,
}

pub fn new_container_id() -> String {
    hex::encode(rand::random::<[u8; CONTAINER_ID_LEN]>())
}

impl Registry {
    pub fn new(executor: Arc<Executor>, handle_cache_size: usize) -> Self {
        Self {
            executor,
            scopes: None,
            containers: Mutex::new(HashMap::new()),
            handles: Mutex::new(HandleTable {
                capacity: handle_cache_size.max(1),
                handles: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Network scopes handles may attach containers to.
    pub fn with_scopes(mut self, scopes: Arc<Scopes>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn scopes(&self) -> Option<&Arc<Scopes>> {
        self.scopes.as_ref()
    }

    fn lock_handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, handle: Handle) -> Handle {
        let mut table = self.lock_handles();
        for old in table.insert(handle.clone()) {
            self.release_pending(&table, &old);
        }
        handle
    }

    /// Give back the addresses `handle` reserved, unless the container's
    /// committed config or another live draft still uses them.
    fn release_pending(&self, table: &HandleTable, handle: &Handle) {
        let Some(scopes) = &self.scopes else { return };
        if handle.pending_endpoints().is_empty() {
            return;
        }
        let container = handle.container();
        let committed = container.config().networks;
        for scope in handle.pending_endpoints() {
            if committed.contains_key(scope) || table.reserves(container, scope, handle.key()) {
                continue;
            }
            match scopes.remove_endpoint(scope, container.id()) {
                Ok(()) => debug!(container = container.id(), scope = %scope, handle = %handle, "endpoint released"),
                Err(e) => warn!(container = container.id(), scope = %scope, error = %e, "releasing endpoint"),
            }
        }
    }

    /// Register a new draft container and return a handle on it. `key` is
    /// the attach key written into its config.
    pub fn new_container(&self, create: &CreateConfig, key: String, image: Option<DatastoreUrl>) -> Handle {
        let id = new_container_id();
        let config = ExecutorConfig::for_create(&id, create, key);
        let container = Arc::new(Container::new(config, image));

        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), container.clone());
        info!(container = %id, "container registered");
        self.store(Handle::new(container))
    }

    pub fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// A new handle on container `id` each call.
    pub fn get_container(&self, id: &str) -> Option<Handle> {
        let container = self.container(id)?;
        Some(self.store(Handle::new(container)))
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// A copy of the handle stored under `key`.
    pub fn handle(&self, key: &str) -> Result<Handle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handle {key}")))
    }

    /// Apply `f` to the stored handle.
    pub fn update_handle<T>(&self, key: &str, f: impl FnOnce(&mut Handle) -> Result<T>) -> Result<T> {
        let mut table = self.lock_handles();
        let handle = table
            .handles
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("handle {key}")))?;
        f(handle)
    }

    /// Attach the draft under `key` to `scope`, at `ip` or the next free
    /// address.
    pub fn add_endpoint(&self, key: &str, scope: &str, ip: Option<Ipv4Addr>) -> Result<Endpoint> {
        let scopes = self
            .scopes
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("scope {scope}")))?;
        self.update_handle(key, |handle| handle.add_endpoint(scopes, scope, ip))
    }

    /// Commit the handle stored under `key`. The handle is consumed whether
    /// or not the commit succeeds.
    pub async fn commit(&self, op: &Operation, key: &str) -> Result<()> {
        let handle = self
            .lock_handles()
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("handle {key}")))?;

        let container = handle.container().clone();
        let draft = handle.clone();
        let result = container.commit(op, &self.executor, handle).await;
        if result.is_err() {
            let table = self.lock_handles();
            self.release_pending(&table, &draft);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::exec::config;
    use crate::exec::container::ContainerState;
    use crate::exec::executor::ExecutorSettings;
    use crate::exec::handle::TargetState;
    use crate::exec::network::BRIDGE_SCOPE;
    use crate::fabric::{SimCompute, SimTask};

    fn scopes() -> Arc<Scopes> {
        Arc::new(Scopes::new("bridge-pg", "172.16.0.0/16".parse().unwrap()).unwrap())
    }

    fn registry(capacity: usize) -> Registry {
        let exec = Executor::new(Arc::new(SimCompute::new()), ExecutorSettings::default());
        Registry::new(Arc::new(exec), capacity).with_scopes(scopes())
    }

    /// A registry whose datastore is reachable from one simulated host.
    fn hosted(sim: SimCompute) -> (Registry, Arc<SimCompute>) {
        let settings = ExecutorSettings::default();
        let sim = Arc::new(sim);
        sim.add_host(&settings.datastore, "host-1");
        let exec = Executor::new(sim.clone(), settings);
        (Registry::new(Arc::new(exec), 16).with_scopes(scopes()), sim)
    }

    fn bridge_members(reg: &Registry) -> Vec<String> {
        let bridge = reg.scopes().unwrap().scope(BRIDGE_SCOPE).unwrap();
        bridge.members().map(|(id, _)| id.to_owned()).collect()
    }

    /// Commit a fresh handle on `id` that targets `target`.
    async fn commit_to(reg: &Registry, id: &str, target: Option<TargetState>) -> Result<()> {
        let h = reg.get_container(id).unwrap();
        if let Some(target) = target {
            reg.update_handle(h.key(), |h| {
                h.set_state(target);
                Ok(())
            })
            .unwrap();
        }
        reg.commit(&Operation::new("test"), h.key()).await
    }

    /// The config the guest reads from the fabric.
    async fn fabric_config(reg: &Registry, container: &Container) -> ExecutorConfig {
        let vm = container.vm().unwrap();
        reg.executor().guest_config(&Operation::new("test"), &vm).await.unwrap()
    }

    fn create() -> CreateConfig {
        CreateConfig {
            path: "/bin/true".into(),
            ..Default::default()
        }
    }

    #[test]
    fn get_returns_a_new_handle_each_call() {
        let reg = registry(8);
        let h = reg.new_container(&create(), String::new(), None);
        let id = h.config().common.id.clone();
        assert_eq!(id.len(), CONTAINER_ID_LEN * 2);

        let a = reg.get_container(&id).unwrap();
        let b = reg.get_container(&id).unwrap();
        assert_ne!(a.key(), b.key());
        assert!(reg.get_container("missing").is_none());
        assert_eq!(reg.container_ids(), vec![id]);
    }

    #[test]
    fn oldest_handles_are_evicted() {
        let reg = registry(2);
        let first = reg.new_container(&create(), String::new(), None);
        let id = first.config().common.id.clone();
        let second = reg.get_container(&id).unwrap();
        let third = reg.get_container(&id).unwrap();

        assert!(reg.handle(first.key()).unwrap_err().is_not_found());
        reg.handle(second.key()).unwrap();
        reg.handle(third.key()).unwrap();
    }

    #[tokio::test]
    async fn commit_consumes_the_handle() {
        let reg = registry(8);
        let h = reg.new_container(&create(), String::new(), None);
        let op = Operation::new("test");

        // no host attached to the datastore: the commit fails
        assert!(reg.commit(&op, h.key()).await.is_err());
        assert!(reg.commit(&op, h.key()).await.unwrap_err().is_not_found());
    }

    #[test]
    fn evicted_drafts_release_their_endpoints() {
        let reg = registry(3);
        let first = reg.new_container(&create(), String::new(), None);
        let id = first.config().common.id.clone();
        let second = reg.get_container(&id).unwrap();

        let a = reg.add_endpoint(first.key(), BRIDGE_SCOPE, None).unwrap();
        let b = reg.add_endpoint(second.key(), BRIDGE_SCOPE, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(bridge_members(&reg), vec![id.clone()]);

        // evicting the first draft keeps the address the second one holds
        reg.get_container(&id).unwrap();
        reg.get_container(&id).unwrap();
        assert!(reg.handle(first.key()).unwrap_err().is_not_found());
        assert_eq!(bridge_members(&reg), vec![id.clone()]);

        reg.get_container(&id).unwrap();
        assert!(reg.handle(second.key()).unwrap_err().is_not_found());
        assert!(bridge_members(&reg).is_empty());
    }

    #[test]
    fn unknown_scope_is_not_found() {
        let reg = registry(4);
        let h = reg.new_container(&create(), String::new(), None);
        assert!(reg.add_endpoint(h.key(), "nowhere", None).unwrap_err().is_not_found());

        let bare = Registry::new(reg.executor().clone(), 4);
        let h = bare.new_container(&create(), String::new(), None);
        assert!(bare.add_endpoint(h.key(), BRIDGE_SCOPE, None).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn failed_commit_releases_the_drafts_endpoints() {
        let reg = registry(8);
        let h = reg.new_container(&create(), String::new(), None);
        reg.add_endpoint(h.key(), BRIDGE_SCOPE, None).unwrap();
        assert_eq!(bridge_members(&reg).len(), 1);

        // no host: the VM is never created
        assert!(reg.commit(&Operation::new("test"), h.key()).await.is_err());
        assert!(bridge_members(&reg).is_empty());
    }

    #[tokio::test]
    async fn committed_endpoints_survive_eviction() {
        let (reg, _sim) = hosted(SimCompute::new());
        let h = reg.new_container(&create(), String::new(), None);
        let id = h.config().common.id.clone();
        let endpoint = reg.add_endpoint(h.key(), BRIDGE_SCOPE, None).unwrap();
        reg.commit(&Operation::new("test"), h.key()).await.unwrap();

        let container = reg.container(&id).unwrap();
        assert_eq!(container.config().networks[BRIDGE_SCOPE], endpoint);

        // a later draft re-adding the committed scope reserves nothing new
        let again = reg.get_container(&id).unwrap();
        assert_eq!(reg.add_endpoint(again.key(), BRIDGE_SCOPE, None).unwrap(), endpoint);
        assert!(reg.handle(again.key()).unwrap().pending_endpoints().is_empty());
        for _ in 0..16 {
            reg.get_container(&id).unwrap();
        }
        assert_eq!(bridge_members(&reg), vec![id]);
    }

    #[tokio::test]
    async fn fabric_config_tracks_every_commit() {
        let (reg, sim) = hosted(SimCompute::new());
        let id = reg.new_container(&create(), String::new(), None).config().common.id.clone();
        let container = reg.container(&id).unwrap();

        commit_to(&reg, &id, None).await.unwrap();
        assert_eq!(container.state(), ContainerState::Created);
        assert_eq!(fabric_config(&reg, &container).await, container.config());

        let h = reg.get_container(&id).unwrap();
        reg.add_endpoint(h.key(), BRIDGE_SCOPE, None).unwrap();
        reg.update_handle(h.key(), |h| {
            h.set_state(TargetState::Running);
            Ok(())
        })
        .unwrap();
        let draft = reg.handle(h.key()).unwrap().config().clone();
        reg.commit(&Operation::new("test"), h.key()).await.unwrap();
        assert_eq!(container.state(), ContainerState::Running);

        let on_fabric = fabric_config(&reg, &container).await;
        assert_eq!(on_fabric, container.config());
        assert_eq!(on_fabric.networks, draft.networks);
        assert!(on_fabric.sessions[&id].started.is_some());

        commit_to(&reg, &id, Some(TargetState::Stopped)).await.unwrap();
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(fabric_config(&reg, &container).await, container.config());
        assert!(container.config().sessions[&id].stopped.is_some());

        commit_to(&reg, &id, Some(TargetState::Running)).await.unwrap();
        assert_eq!(container.state(), ContainerState::Running);
        assert_eq!(fabric_config(&reg, &container).await, container.config());

        let vm = sim.vm(&container.vm().unwrap()).unwrap();
        assert_eq!(vm.spec.extra_config, config::encode(&container.config()).unwrap());
        assert_eq!(sim.vm_count(), 1);
    }

    #[tokio::test]
    async fn failed_power_task_keeps_the_prior_state() {
        let (reg, sim) = hosted(SimCompute::new());
        let id = reg.new_container(&create(), String::new(), None).config().common.id.clone();
        let container = reg.container(&id).unwrap();
        commit_to(&reg, &id, Some(TargetState::Running)).await.unwrap();
        let running = container.config();

        // power-off runs before the reconfigure, so nothing is applied
        sim.fail_next(SimTask::PowerOff);
        assert!(commit_to(&reg, &id, Some(TargetState::Stopped)).await.is_err());
        assert_eq!(container.state(), ContainerState::Running);
        assert_eq!(container.config(), running);
        assert_eq!(fabric_config(&reg, &container).await, running);

        commit_to(&reg, &id, Some(TargetState::Stopped)).await.unwrap();
        sim.fail_next(SimTask::PowerOn);
        assert!(commit_to(&reg, &id, Some(TargetState::Running)).await.is_err());
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(fabric_config(&reg, &container).await, container.config());
    }

    #[tokio::test]
    async fn concurrent_commits_apply_in_order() {
        let (reg, sim) = hosted(SimCompute::new().with_latency(Duration::from_millis(10)));
        let id = reg.new_container(&create(), String::new(), None).config().common.id.clone();
        let container = reg.container(&id).unwrap();

        let first = reg.get_container(&id).unwrap();
        let second = reg.get_container(&id).unwrap();
        for (h, target) in [(&first, TargetState::Running), (&second, TargetState::Stopped)] {
            reg.update_handle(h.key(), |h| {
                h.set_state(target);
                Ok(())
            })
            .unwrap();
        }

        let op = Operation::new("test");
        let (a, b) = tokio::join!(reg.commit(&op, first.key()), reg.commit(&op, second.key()));
        a.unwrap();
        b.unwrap();

        // the second draft never saw the first one's start time
        let last = container.config();
        assert_eq!(container.state(), ContainerState::Stopped);
        assert!(last.sessions[&id].started.is_none());
        assert!(last.sessions[&id].stopped.is_some());
        assert_eq!(fabric_config(&reg, &container).await, last);
        assert_eq!(sim.vm_count(), 1);
    }
}
