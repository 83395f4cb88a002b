//! Committed containers and their lifecycle.
//!
//! Lifecycle (statig machine, one per container):
//! ```text
//! Draft --Created--> Materialized (superstate)
//!                        ├── Created
//!                        ├── Running   ←Started─┐
//!                        └── Stopped   ─Started─┘
//! ```
//!
//! Only a commit moves the machine; commits on one container are serialized
//! by its commit lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use statig::blocking::StateMachine;
use statig::prelude::*;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::config::ExecutorConfig;
use crate::exec::executor::Executor;
use crate::exec::handle::{Handle, TargetState};
use crate::fabric::{PowerState, VmRef};
use crate::op::Operation;
use crate::storage::url::DatastoreUrl;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Fabric facts reported to the lifecycle machine by the commit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    VmCreated,
    PoweredOn,
    PoweredOff,
}

/// Externally visible container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerState {
    Draft,
    Created,
    Running,
    Stopped,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Lifecycle;

#[state_machine(
    initial = "State::draft()",
    state(derive(Debug, Clone, PartialEq))
)]
impl Lifecycle {
    /// No VM on the fabric yet.
    #[state]
    fn draft(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::VmCreated => Transition(State::created()),
            _ => Handled,
        }
    }

    /// A VM exists. Power transitions are the same from every child.
    #[superstate]
    fn materialized(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PoweredOn => Transition(State::running()),
            LifecycleEvent::PoweredOff => Transition(State::stopped()),
            LifecycleEvent::VmCreated => Handled,
        }
    }

    #[state(superstate = "materialized")]
    fn created(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            // powering off a VM that never ran leaves it Created
            LifecycleEvent::PoweredOff => Handled,
            _ => Super,
        }
    }

    #[state(superstate = "materialized")]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PoweredOn => Handled,
            _ => Super,
        }
    }

    #[state(superstate = "materialized")]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PoweredOff => Handled,
            _ => Super,
        }
    }
}

fn visible(state: &State) -> ContainerState {
    match state {
        State::Draft { .. } => ContainerState::Draft,
        State::Created { .. } => ContainerState::Created,
        State::Running { .. } => ContainerState::Running,
        State::Stopped { .. } => ContainerState::Stopped,
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

struct Inner {
    config: ExecutorConfig,
    vm: Option<VmRef>,
    /// Disk of the image the container descends from.
    image: Option<DatastoreUrl>,
    lifecycle: StateMachine<Lifecycle>,
}

pub struct Container {
    id: String,
    commit_lock: AsyncMutex<()>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ContainerState>,
}

impl Container {
    pub fn new(config: ExecutorConfig, image: Option<DatastoreUrl>) -> Self {
        let (state_tx, _) = watch::channel(ContainerState::Draft);
        Self {
            id: config.common.id.clone(),
            commit_lock: AsyncMutex::new(()),
            inner: Mutex::new(Inner {
                config,
                vm: None,
                image,
                lifecycle: Lifecycle.state_machine(),
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vm(&self) -> Option<VmRef> {
        self.lock().vm.clone()
    }

    /// Last committed executor config.
    pub fn config(&self) -> ExecutorConfig {
        self.lock().config.clone()
    }

    pub fn image(&self) -> Option<DatastoreUrl> {
        self.lock().image.clone()
    }

    pub fn state(&self) -> ContainerState {
        *self.state_tx.borrow()
    }

    /// Resolves once the container reaches `target`.
    pub async fn wait_for_state(&self, op: &Operation, target: ContainerState) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        op.run(async move {
            rx.wait_for(|s| *s == target)
                .await
                .map(drop)
                .map_err(|_| Error::NotFound(format!("container {}", self.id)))
        })
        .await
    }

    fn record(&self, event: LifecycleEvent) {
        let state = {
            let mut inner = self.lock();
            inner.lifecycle.handle(&event);
            visible(inner.lifecycle.state())
        };
        debug!(container = %self.id, ?event, ?state, "lifecycle");
        self.state_tx.send_replace(state);
    }

    /// Materialize `handle` on the fabric. Serialized per container; the
    /// last commit wins.
    pub(crate) async fn commit(&self, op: &Operation, executor: &Executor, handle: Handle) -> Result<()> {
        let _serial = op.run(async { Ok(self.commit_lock.lock().await) }).await?;
        let span = tracing::info_span!("commit", op = op.id(), container = %self.id);
        self.commit_locked(op, executor, handle).instrument(span).await
    }

    async fn commit_locked(&self, op: &Operation, executor: &Executor, handle: Handle) -> Result<()> {
        let target = handle.target();
        let mut config = handle.into_config();

        let now = Utc::now().timestamp();
        if let Some(session) = config.primary_session_mut() {
            match target {
                Some(TargetState::Running) => session.started = Some(now),
                Some(TargetState::Stopped) => session.stopped = Some(now),
                None => {}
            }
        }

        let (vm, image) = {
            let inner = self.lock();
            (inner.vm.clone(), inner.image.clone())
        };
        let spec = executor.vm_spec(&config, image.as_ref())?;

        let vm = match vm {
            None => {
                let vm = executor.create(op, &spec).await?;
                // a created VM is a fabric fact even if a later step fails
                {
                    let mut inner = self.lock();
                    inner.vm = Some(vm.clone());
                    inner.config = config.clone();
                }
                self.record(LifecycleEvent::VmCreated);
                vm
            }
            Some(vm) => {
                if target == Some(TargetState::Stopped)
                    && executor.power_state(op, &vm).await? == PowerState::PoweredOn
                {
                    executor.stop(op, &vm).await?;
                    self.record(LifecycleEvent::PoweredOff);
                }
                executor.reconfigure(op, &vm, &spec).await?;
                self.lock().config = config.clone();
                vm
            }
        };

        match target {
            Some(TargetState::Running) => {
                if executor.power_state(op, &vm).await? != PowerState::PoweredOn {
                    executor.start(op, &vm).await?;
                }
                self.record(LifecycleEvent::PoweredOn);
            }
            Some(TargetState::Stopped) => {
                if executor.power_state(op, &vm).await? == PowerState::PoweredOn {
                    warn!(vm = %vm, "vm still powered on after stop, powering off");
                    executor.stop(op, &vm).await?;
                }
                self.record(LifecycleEvent::PoweredOff);
            }
            None => {}
        }

        info!(vm = %vm, state = ?self.state(), "committed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_fabric_events() {
        let mut sm = Lifecycle.state_machine();
        assert_eq!(visible(sm.state()), ContainerState::Draft);

        // power events before the VM exists are ignored
        sm.handle(&LifecycleEvent::PoweredOn);
        assert_eq!(visible(sm.state()), ContainerState::Draft);

        sm.handle(&LifecycleEvent::VmCreated);
        assert_eq!(visible(sm.state()), ContainerState::Created);

        sm.handle(&LifecycleEvent::PoweredOff);
        assert_eq!(visible(sm.state()), ContainerState::Created);

        sm.handle(&LifecycleEvent::PoweredOn);
        assert_eq!(visible(sm.state()), ContainerState::Running);

        sm.handle(&LifecycleEvent::PoweredOff);
        assert_eq!(visible(sm.state()), ContainerState::Stopped);

        sm.handle(&LifecycleEvent::VmCreated);
        assert_eq!(visible(sm.state()), ContainerState::Stopped);

        sm.handle(&LifecycleEvent::PoweredOn);
        assert_eq!(visible(sm.state()), ContainerState::Running);
    }
}
