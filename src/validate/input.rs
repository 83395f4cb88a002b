//! The install envelope: what the operator asked for, before any of it has
//! been checked against the fabric.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::storage::url::DatastoreUrl;

/// Network used for the public role when none is named.
pub const DEFAULT_PUBLIC_NETWORK: &str = "VM Network";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    pub name: String,
    /// `a.b.c.d/prefix`; DHCP when absent.
    pub static_ip: Option<String>,
    pub gateway: Option<String>,
}

impl NetworkSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// `[user[:password]@]host[/datacenter]`, optionally with a scheme.
    pub target: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub thumbprint: Option<String>,
    /// Cluster, host or resource pool, as a full inventory path or a
    /// trailing part of one (`cluster1/pool1`).
    pub compute_resource: Option<String>,
    pub bridge_network: String,
    pub public_network: Option<NetworkSpec>,
    pub client_network: Option<NetworkSpec>,
    pub management_network: Option<NetworkSpec>,
    /// `[ds://]datastore[/path]`
    pub image_store: String,
    /// `[scheme://]target/path[?opts]:label`
    pub volume_stores: Vec<String>,
    /// `udp://host[:port]` or `tcp://host[:port]`
    pub syslog_address: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
}

impl InstallConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
        toml::from_str(&text).map_err(|e| Error::InvalidArgument(format!("{}: {e}", path.display())))
    }

    /// Public network, defaulted.
    pub fn public(&self) -> NetworkSpec {
        self.public_network
            .clone()
            .unwrap_or_else(|| NetworkSpec::named(DEFAULT_PUBLIC_NETWORK))
    }

    /// Client and management fall back to the public network.
    pub fn client(&self) -> NetworkSpec {
        self.client_network.clone().unwrap_or_else(|| self.public())
    }

    pub fn management(&self) -> NetworkSpec {
        self.management_network.clone().unwrap_or_else(|| self.public())
    }

    /// `(role, network)` for every role except the bridge.
    pub fn roles(&self) -> [(&'static str, NetworkSpec); 3] {
        [
            ("public", self.public()),
            ("client", self.client()),
            ("management", self.management()),
        ]
    }
}

/// A parsed target: connection URL plus the datacenter path, if given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: Url,
    pub datacenter: Option<String>,
}

pub fn parse_target(raw: &str) -> Result<Target> {
    if raw.trim().is_empty() {
        return Err(Error::InvalidArgument("target is required".into()));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("https://{raw}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| Error::InvalidArgument(format!("target {raw:?}: {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidArgument(format!("target {raw:?} has no host")));
    }

    let datacenter = url.path().trim_matches('/').to_owned();
    url.set_path("/sdk");
    Ok(Target {
        url,
        datacenter: (!datacenter.is_empty()).then_some(datacenter),
    })
}

/// Parse `[ds://]datastore[/path]`.
pub fn parse_image_store(raw: &str) -> Result<DatastoreUrl> {
    if raw.is_empty() {
        return Err(Error::InvalidArgument("image store is required".into()));
    }
    let url = if raw.starts_with("ds://") {
        DatastoreUrl::parse(raw)?
    } else if raw.contains("://") {
        return Err(Error::InvalidArgument(format!("image store {raw:?} must be a datastore")));
    } else {
        let (datastore, path) = raw.split_once('/').unwrap_or((raw, ""));
        DatastoreUrl::new(datastore, path)
    };
    Ok(url)
}

/// Parse `a.b.c.d/prefix`.
pub fn parse_cidr(raw: &str) -> Result<(Ipv4Addr, u8)> {
    let invalid = || Error::InvalidArgument(format!("{raw:?} is not an IPv4 CIDR address"));
    let (ip, prefix) = raw.split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix == 0 || prefix > 32 {
        return Err(invalid());
    }
    Ok((ip, prefix))
}

pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, prefix: u8) -> bool {
    let mask = u32::MAX << (32 - u32::from(prefix));
    u32::from(a) & mask == u32::from(b) & mask
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_keeps_credentials_and_datacenter() {
        let t = parse_target("admin:secret@vc.example.com/dc1").unwrap();
        assert_eq!(t.url.username(), "admin");
        assert_eq!(t.url.password(), Some("secret"));
        assert_eq!(t.url.host_str(), Some("vc.example.com"));
        assert_eq!(t.url.path(), "/sdk");
        assert_eq!(t.datacenter.as_deref(), Some("dc1"));

        let t = parse_target("https://esx.local").unwrap();
        assert_eq!(t.datacenter, None);

        assert!(parse_target("").is_err());
    }

    #[test]
    fn image_store_forms() {
        assert_eq!(parse_image_store("datastore1").unwrap(), DatastoreUrl::new("datastore1", ""));
        assert_eq!(
            parse_image_store("datastore1/vch/images").unwrap(),
            DatastoreUrl::new("datastore1", "vch/images")
        );
        assert_eq!(
            parse_image_store("ds://datastore1/x").unwrap(),
            DatastoreUrl::new("datastore1", "x")
        );
        assert!(parse_image_store("nfs://host/x").is_err());
        assert!(parse_image_store("").is_err());
    }

    #[test]
    fn cidr_and_subnets() {
        let (ip, prefix) = parse_cidr("10.0.0.5/24").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(prefix, 24);
        assert!(same_subnet(ip, Ipv4Addr::new(10, 0, 0, 1), prefix));
        assert!(!same_subnet(ip, Ipv4Addr::new(10, 0, 1, 1), prefix));
        assert!(parse_cidr("10.0.0.5").is_err());
        assert!(parse_cidr("10.0.0.5/33").is_err());
    }

    #[test]
    fn unnamed_roles_fall_back_to_public() {
        let cfg: InstallConfig = toml::from_str(
            r#"
            target = "vc"
            bridge_network = "bridge"
            [client_network]
            name = "client"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.public().name, DEFAULT_PUBLIC_NETWORK);
        assert_eq!(cfg.client().name, "client");
        assert_eq!(cfg.management().name, DEFAULT_PUBLIC_NETWORK);
    }
}
