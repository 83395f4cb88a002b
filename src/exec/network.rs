//! Network scopes and container endpoints.
//!
//! A scope is a named network backed by a port group. The bridge scope
//! always exists; the others are registered from install-time
//! configuration. Endpoints get the next free address in their scope's
//! subnet unless a static address is requested.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const BRIDGE_SCOPE: &str = "bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Bridge,
    External,
    Client,
    Management,
    Container,
}

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 30 {
            return Err(Error::InvalidArgument(format!("subnet /{prefix} has no host addresses")));
        }
        let mask = Self::mask_of(prefix);
        Ok(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask_of(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
    }

    fn network(&self) -> u32 {
        u32::from(self.addr)
    }

    fn broadcast(&self) -> u32 {
        self.network() | !Self::mask_of(self.prefix)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_of(self.prefix) == self.network()
    }

    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.addr) || other.contains(self.addr)
    }

    /// Addresses usable by hosts: the network and broadcast addresses are
    /// excluded.
    fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.network() + 1..self.broadcast()).map(Ipv4Addr::from)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidArgument(format!("invalid subnet {s:?}"));
        let (addr, prefix) = s.split_once('/').ok_or_else(bad)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let prefix: u8 = prefix.parse().map_err(|_| bad())?;
        if prefix > 32 {
            return Err(bad());
        }
        Subnet::new(addr, prefix)
    }
}

impl TryFrom<String> for Subnet {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Subnet> for String {
    fn from(s: Subnet) -> String {
        s.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSpec {
    pub name: String,
    pub kind: ScopeKind,
    /// Port group on the fabric backing the scope.
    pub port_group: String,
    pub subnet: Subnet,
    /// Defaults to the first host address of the subnet.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    pub kind: ScopeKind,
    pub port_group: String,
    pub subnet: Subnet,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    allocated: BTreeSet<Ipv4Addr>,
    /// container id -> address
    members: BTreeMap<String, Ipv4Addr>,
}

/// A container's attachment to a scope, as recorded in its executor config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scope: String,
    pub port_group: String,
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
}

impl Scope {
    fn endpoint(&self, ip: Ipv4Addr) -> Endpoint {
        Endpoint {
            scope: self.name.clone(),
            port_group: self.port_group.clone(),
            ip,
            prefix: self.subnet.prefix,
            gateway: self.gateway,
            nameservers: self.dns.clone(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, Ipv4Addr)> {
        self.members.iter().map(|(id, ip)| (id.as_str(), *ip))
    }
}

pub struct Scopes {
    scopes: Mutex<BTreeMap<String, Scope>>,
}

impl Scopes {
    /// A registry holding only the bridge scope on `bridge_port_group`.
    pub fn new(bridge_port_group: &str, bridge_subnet: Subnet) -> Result<Self> {
        let scopes = Self {
            scopes: Mutex::new(BTreeMap::new()),
        };
        scopes.add_scope(ScopeSpec {
            name: BRIDGE_SCOPE.to_owned(),
            kind: ScopeKind::Bridge,
            port_group: bridge_port_group.to_owned(),
            subnet: bridge_subnet,
            gateway: None,
            dns: Vec::new(),
        })?;
        Ok(scopes)
    }

    pub fn add_scope(&self, spec: ScopeSpec) -> Result<()> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        if scopes.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("scope {}", spec.name)));
        }
        if let Some(clash) = scopes.values().find(|s| s.subnet.overlaps(&spec.subnet)) {
            return Err(Error::InvalidArgument(format!(
                "subnet {} of scope {} overlaps scope {}",
                spec.subnet, spec.name, clash.name
            )));
        }

        let gateway = match spec.gateway {
            Some(gw) if spec.subnet.contains(gw) => gw,
            Some(gw) => {
                return Err(Error::InvalidArgument(format!(
                    "gateway {gw} is outside {}",
                    spec.subnet
                )));
            }
            None => spec
                .subnet
                .hosts()
                .next()
                .ok_or_else(|| Error::InvalidArgument(format!("subnet {} is empty", spec.subnet)))?,
        };

        debug!(scope = %spec.name, kind = ?spec.kind, subnet = %spec.subnet, %gateway, "scope added");
        scopes.insert(
            spec.name.clone(),
            Scope {
                name: spec.name,
                kind: spec.kind,
                port_group: spec.port_group,
                subnet: spec.subnet,
                gateway,
                dns: spec.dns,
                allocated: BTreeSet::from([gateway]),
                members: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn scope(&self, name: &str) -> Option<Scope> {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Attach `container` to `scope`, reserving `ip` or the next free
    /// address.
    pub fn add_endpoint(&self, scope: &str, container: &str, ip: Option<Ipv4Addr>) -> Result<Endpoint> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        let scope = scopes
            .get_mut(scope)
            .ok_or_else(|| Error::NotFound(format!("scope {scope}")))?;

        if let Some(existing) = scope.members.get(container) {
            return Ok(scope.endpoint(*existing));
        }

        let ip = match ip {
            Some(ip) if !scope.subnet.contains(ip) => {
                return Err(Error::InvalidArgument(format!(
                    "{ip} is outside scope {} ({})",
                    scope.name, scope.subnet
                )));
            }
            Some(ip) if scope.allocated.contains(&ip) => {
                return Err(Error::AlreadyExists(format!("address {ip} in scope {}", scope.name)));
            }
            Some(ip) => ip,
            None => scope
                .subnet
                .hosts()
                .find(|ip| !scope.allocated.contains(ip))
                .ok_or_else(|| Error::ResourceExhausted(format!("addresses in scope {}", scope.name)))?,
        };

        scope.allocated.insert(ip);
        scope.members.insert(container.to_owned(), ip);
        debug!(scope = %scope.name, container, %ip, "endpoint added");
        Ok(scope.endpoint(ip))
    }

    pub fn remove_endpoint(&self, scope: &str, container: &str) -> Result<()> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        let scope = scopes
            .get_mut(scope)
            .ok_or_else(|| Error::NotFound(format!("scope {scope}")))?;
        let ip = scope
            .members
            .remove(container)
            .ok_or_else(|| Error::NotFound(format!("endpoint of {container} in scope {}", scope.name)))?;
        scope.allocated.remove(&ip);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
