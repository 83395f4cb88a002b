//! Handles: private drafts of a container's intended state.
//!
//! A handle owns a copy of the container's executor config. Mutations stay
//! on the handle until it is committed; two handles of the same container
//! never see each other's changes.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exec::config::ExecutorConfig;
use crate::exec::container::Container;
use crate::exec::network::{Endpoint, Scopes};

/// Bytes of randomness in a handle key.
pub const HANDLE_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetState {
    Running,
    Stopped,
}

impl FromStr for TargetState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(TargetState::Running),
            "STOPPED" => Ok(TargetState::Stopped),
            other => Err(Error::InvalidArgument(format!("unknown state {other:?}"))),
        }
    }
}

#[derive(Clone)]
pub struct Handle {
    key: String,
    container: Arc<Container>,
    config: ExecutorConfig,
    target: Option<TargetState>,
    /// Scopes this draft reserved an address in that the committed config
    /// does not hold yet.
    pending: Vec<String>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("container", &self.container.id())
            .field("target", &self.target)
            .field("pending", &self.pending)
            .finish()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

pub fn new_handle_key() -> String {
    hex::encode(rand::random::<[u8; HANDLE_KEY_LEN]>())
}

impl Handle {
    /// A fresh handle on `container`, starting from its committed config.
    pub fn new(container: Arc<Container>) -> Self {
        let config = container.config();
        Self {
            key: new_handle_key(),
            container,
            config,
            target: None,
            pending: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn target(&self) -> Option<TargetState> {
        self.target
    }

    pub fn set_state(&mut self, state: TargetState) {
        self.target = Some(state);
    }

    /// Attach the container to `scope`. The endpoint lands in the config
    /// written at commit.
    pub fn add_endpoint(&mut self, scopes: &Scopes, scope: &str, ip: Option<Ipv4Addr>) -> Result<Endpoint> {
        let endpoint = scopes.add_endpoint(scope, &self.config.common.id, ip)?;
        let committed = self.container.config().networks.contains_key(scope);
        if !committed && !self.pending.iter().any(|s| s == scope) {
            self.pending.push(scope.to_owned());
        }
        self.config.networks.insert(scope.to_owned(), endpoint.clone());
        Ok(endpoint)
    }

    /// Scopes holding an address for this draft only.
    pub fn pending_endpoints(&self) -> &[String] {
        &self.pending
    }

    pub(crate) fn into_config(self) -> ExecutorConfig {
        self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::config::CreateConfig;
    use crate::exec::network::BRIDGE_SCOPE;

    fn container() -> Arc<Container> {
        let create = CreateConfig {
            path: "/bin/true".into(),
            ..Default::default()
        };
        Arc::new(Container::new(ExecutorConfig::for_create("abc", &create, String::new()), None))
    }

    #[test]
    fn handles_do_not_share_drafts() {
        let c = container();
        let scopes = Scopes::new("pg", "172.16.0.0/16".parse().unwrap()).unwrap();

        let mut a = Handle::new(c.clone());
        let b = Handle::new(c.clone());
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().len(), HANDLE_KEY_LEN * 2);

        a.set_state(TargetState::Running);
        a.add_endpoint(&scopes, BRIDGE_SCOPE, None).unwrap();
        assert_eq!(b.target(), None);
        assert!(b.config().networks.is_empty());
        assert!(c.config().networks.is_empty());
        assert!(a.config().networks.contains_key(BRIDGE_SCOPE));
        assert_eq!(a.pending_endpoints(), [BRIDGE_SCOPE.to_owned()]);
        assert!(b.pending_endpoints().is_empty());

        // adding the same scope twice reserves it once
        a.add_endpoint(&scopes, BRIDGE_SCOPE, None).unwrap();
        assert_eq!(a.pending_endpoints().len(), 1);
    }

    #[test]
    fn target_state_parses_api_strings() {
        assert_eq!("RUNNING".parse::<TargetState>().unwrap(), TargetState::Running);
        assert_eq!("STOPPED".parse::<TargetState>().unwrap(), TargetState::Stopped);
        assert!("PAUSED".parse::<TargetState>().is_err());
    }
}
