use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::error::Error;
use crate::storage::url::{DATASTORE_SCHEME, DatastoreUrl, VolumeStore, parse_volume_store};
use crate::validate::input::{
    InstallConfig, NetworkSpec, Target, parse_cidr, parse_image_store, parse_target, same_subnet,
};
use crate::validate::inventory::{ComputeKind, ComputeResource, Inventory, NetworkKind};
use crate::validate::{Check, CollectIssue, Prerequisite, Report, Resolved};

/// Outgoing port the serial-over-LAN attach channel uses.
pub const SERIAL_OVER_LAN_PORT: u16 = 2377;

/// vCenter setting that keeps network-backed serial ports across vMotion.
pub const PERSIST_NETWORK_BACKING_KEY: &str = "config.vpxd.serialport.persistNetworkBacking";

pub const FEATURE_SERIAL_URI: &str = "serialuri";
pub const FEATURE_DVS: &str = "dvs";

pub struct Validator {
    inventory: Arc<dyn Inventory>,
}

impl Validator {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    /// Run every check and return the accumulated report.
    pub async fn validate(&self, cfg: &InstallConfig) -> Report {
        let mut report = Report::default();

        let target = parse_target(&cfg.target).collect_issue(&mut report, Check::Target);
        check_syslog(cfg, &mut report);
        check_tls(cfg, &mut report);
        check_proxies(cfg, &mut report);
        check_static_ips(cfg, &mut report);
        check_role_conflicts(cfg, &mut report);
        let image_store = parse_image_store(&cfg.image_store).collect_issue(&mut report, Check::Storage);
        let volume_stores: Vec<VolumeStore> = cfg
            .volume_stores
            .iter()
            .filter_map(|raw| {
                parse_volume_store(raw)
                    .map_err(Error::from)
                    .collect_issue(&mut report, Check::Storage)
            })
            .collect();

        let Some(target) = target else {
            return report;
        };
        if !self.login(cfg, &target, &mut report).await {
            return report;
        }
        self.check_thumbprint(cfg, &mut report).await;
        self.check_license(&mut report).await;
        self.check_prerequisites(&mut report).await;

        let Some(datacenter) = self.datacenter(target.datacenter.as_deref(), &mut report).await else {
            return report;
        };
        self.check_networks(&datacenter, cfg, &mut report).await;

        let compute = self
            .compute(&datacenter, cfg.compute_resource.as_deref(), &mut report)
            .await;
        if let Some(compute) = &compute {
            check_drs(compute, &mut report);
            self.check_firewall(&datacenter, compute, &mut report).await;
        }
        self.check_datastores(
            &datacenter,
            compute.as_ref(),
            image_store.as_ref(),
            &volume_stores,
            &mut report,
        )
        .await;

        report.resolved = compute.map(|compute| Resolved {
            datacenter,
            compute: compute.path,
            hosts: compute.hosts,
            image_store,
        });
        info!(issues = report.issues.len(), prerequisites = report.prerequisites.len(), "validation finished");
        report
    }

    async fn login(&self, cfg: &InstallConfig, target: &Target, report: &mut Report) -> bool {
        let user = cfg
            .user
            .clone()
            .or_else(|| Some(target.url.username().to_owned()).filter(|u| !u.is_empty()));
        let password = cfg
            .password
            .clone()
            .or_else(|| target.url.password().map(str::to_owned))
            .unwrap_or_default();

        let Some(user) = user else {
            report.push(Check::Credentials, "user is required");
            return false;
        };
        debug!(%user, host = ?target.url.host_str(), "logging in");
        self.inventory
            .login(&user, &password)
            .await
            .collect_issue(report, Check::Credentials)
            .is_some()
    }

    async fn check_thumbprint(&self, cfg: &InstallConfig, report: &mut Report) {
        let Some(expected) = &cfg.thumbprint else {
            return;
        };
        let Some(actual) = self.inventory.thumbprint().await.collect_issue(report, Check::Target) else {
            return;
        };
        let normalize = |t: &str| t.replace(':', "").to_ascii_uppercase();
        if normalize(expected) != normalize(&actual) {
            report.suggest(
                Check::Target,
                format!("certificate thumbprint does not match {expected}"),
                vec![actual],
            );
        }
    }

    async fn check_license(&self, report: &mut Report) {
        let Some(features) = self.inventory.license_features().await.collect_issue(report, Check::License) else {
            return;
        };
        let mut required = vec![FEATURE_SERIAL_URI];
        if self.inventory.is_vcenter() {
            required.push(FEATURE_DVS);
        }
        for feature in required {
            if !features.iter().any(|f| f == feature) {
                report.push(Check::License, format!("license lacks the {feature} feature"));
            }
        }
    }

    async fn check_prerequisites(&self, report: &mut Report) {
        if !self.inventory.is_vcenter() {
            return;
        }
        let current = self
            .inventory
            .option(PERSIST_NETWORK_BACKING_KEY)
            .await
            .collect_issue(report, Check::Target);
        if let Some(current) = current {
            if current.as_deref() != Some("true") {
                report.prerequisites.push(Prerequisite {
                    key: PERSIST_NETWORK_BACKING_KEY.to_owned(),
                    value: "true".to_owned(),
                });
            }
        }
    }

    async fn datacenter(&self, requested: Option<&str>, report: &mut Report) -> Option<String> {
        let all = self.inventory.datacenters().await.collect_issue(report, Check::Datacenter)?;
        if let Some(name) = requested {
            if all.iter().any(|dc| dc == name) {
                return Some(name.to_owned());
            }
            report.suggest(Check::Datacenter, format!("datacenter {name} not found"), all);
            return None;
        }
        match all.len() {
            1 => all.into_iter().next(),
            0 => {
                report.push(Check::Datacenter, "target has no datacenters");
                None
            }
            _ => {
                report.suggest(Check::Datacenter, "target has several datacenters, name one", all);
                None
            }
        }
    }

    /// Resolve the compute path to exactly one resource.
    async fn compute(&self, datacenter: &str, requested: Option<&str>, report: &mut Report) -> Option<ComputeResource> {
        let all = self
            .inventory
            .compute_resources(datacenter)
            .await
            .collect_issue(report, Check::Compute)?;
        let top_level: Vec<String> = all
            .iter()
            .filter(|r| r.kind != ComputeKind::ResourcePool)
            .map(ComputeResource::short_path)
            .collect();

        let matches: Vec<&ComputeResource> = match requested {
            None => all.iter().filter(|r| r.kind != ComputeKind::ResourcePool).collect(),
            Some(path) if path.starts_with('/') => all.iter().filter(|r| r.path == path).collect(),
            Some(path) => {
                let path = path.trim_end_matches('/');
                let suffix = format!("/{path}");
                all.iter()
                    .filter(|r| {
                        let short = r.short_path();
                        short == path || short.ends_with(&suffix)
                    })
                    .collect()
            }
        };

        match (requested, matches.as_slice()) {
            (_, [only]) => Some((*only).clone()),
            (None, []) => {
                report.push(Check::Compute, format!("datacenter {datacenter} has no compute resources"));
                None
            }
            (None, _) => {
                report.suggest(Check::Compute, "compute resource must be specified", top_level);
                None
            }
            (Some(path), []) => {
                report.suggest(Check::Compute, format!("compute resource {path} not found"), top_level);
                None
            }
            (Some(path), _) => {
                let candidates = matches.iter().map(|r| r.short_path()).collect();
                report.suggest(Check::Compute, format!("compute resource {path} is ambiguous"), candidates);
                None
            }
        }
    }

    async fn check_networks(&self, datacenter: &str, cfg: &InstallConfig, report: &mut Report) {
        let Some(networks) = self.inventory.networks(datacenter).await.collect_issue(report, Check::Network) else {
            return;
        };
        let vcenter = self.inventory.is_vcenter();

        if cfg.bridge_network.is_empty() {
            report.push(Check::Network, "bridge network is required");
        } else {
            match networks.iter().find(|n| n.name == cfg.bridge_network) {
                None => {
                    let candidates = networks
                        .iter()
                        .filter(|n| !vcenter || n.kind == NetworkKind::Distributed)
                        .map(|n| n.name.clone())
                        .collect();
                    report.suggest(
                        Check::Network,
                        format!("bridge network {} not found", cfg.bridge_network),
                        candidates,
                    );
                }
                Some(n) if vcenter && n.kind != NetworkKind::Distributed => {
                    report.push(
                        Check::Network,
                        format!("bridge network {} must be a distributed port group", n.name),
                    );
                }
                Some(_) => {}
            }
        }

        let mut missing = BTreeSet::new();
        for (role, spec) in cfg.roles() {
            if spec.name == cfg.bridge_network {
                report.push(
                    Check::Network,
                    format!("{role} network {} is also the bridge network", spec.name),
                );
            } else if !networks.iter().any(|n| n.name == spec.name) && missing.insert(spec.name.clone()) {
                report.push(Check::Network, format!("{role} network {} not found", spec.name));
            }
        }
    }

    async fn check_firewall(&self, datacenter: &str, compute: &ComputeResource, report: &mut Report) {
        let Some(hosts) = self.inventory.hosts(datacenter).await.collect_issue(report, Check::Firewall) else {
            return;
        };
        for name in &compute.hosts {
            let open = hosts
                .iter()
                .find(|h| &h.name == name)
                .is_some_and(|h| h.open_ports.contains(&SERIAL_OVER_LAN_PORT));
            if !open {
                report.push(
                    Check::Firewall,
                    format!("host {name} firewall blocks outgoing tcp/{SERIAL_OVER_LAN_PORT}"),
                );
            }
        }
    }

    async fn check_datastores(
        &self,
        datacenter: &str,
        compute: Option<&ComputeResource>,
        image_store: Option<&DatastoreUrl>,
        volume_stores: &[VolumeStore],
        report: &mut Report,
    ) {
        let mut wanted: Vec<(String, String)> = Vec::new();
        if let Some(url) = image_store {
            wanted.push(("image store".to_owned(), url.datastore.clone()));
        }
        for store in volume_stores.iter().filter(|s| s.url.scheme() == DATASTORE_SCHEME) {
            if let Some(host) = store.url.host_str() {
                wanted.push((format!("volume store {}", store.label), host.to_owned()));
            }
        }
        if wanted.is_empty() {
            return;
        }

        let Some(datastores) = self.inventory.datastores(datacenter).await.collect_issue(report, Check::Storage) else {
            return;
        };
        for (role, name) in wanted {
            let Some(ds) = datastores.iter().find(|d| d.name == name) else {
                let candidates = datastores.iter().map(|d| d.name.clone()).collect();
                report.suggest(Check::Storage, format!("{role} datastore {name} not found"), candidates);
                continue;
            };
            for host in compute.map(|c| c.hosts.as_slice()).unwrap_or_default() {
                if !ds.writable_by(host) {
                    report.push(
                        Check::Storage,
                        format!("{role} datastore {name} is not writable from host {host}"),
                    );
                }
            }
        }
    }
}

fn check_drs(compute: &ComputeResource, report: &mut Report) {
    if compute.kind != ComputeKind::Host && !compute.drs_enabled {
        report.push(Check::Drs, format!("DRS is disabled on {}", compute.short_path()));
    }
}

fn check_syslog(cfg: &InstallConfig, report: &mut Report) {
    let Some(raw) = &cfg.syslog_address else {
        return;
    };
    match Url::parse(raw) {
        Ok(url) if !matches!(url.scheme(), "udp" | "tcp") => {
            report.push(Check::Syslog, format!("syslog address {raw} must use udp or tcp"));
        }
        Ok(url) if url.host_str().is_none_or(str::is_empty) => {
            report.push(Check::Syslog, format!("syslog address {raw} has no host"));
        }
        Ok(_) => {}
        Err(e) => report.push(Check::Syslog, format!("syslog address {raw}: {e}")),
    }
}

fn check_tls(cfg: &InstallConfig, report: &mut Report) {
    match (&cfg.tls_cert, &cfg.tls_key) {
        (None, None) => {}
        (Some(_), None) | (None, Some(_)) => {
            report.push(Check::Tls, "certificate and key must be given together");
        }
        (Some(cert), Some(key)) => {
            for path in [cert, key] {
                if !path.is_file() {
                    report.push(Check::Tls, format!("{} is not a readable file", path.display()));
                }
            }
        }
    }
}

fn check_proxies(cfg: &InstallConfig, report: &mut Report) {
    for (name, raw) in [("http", &cfg.http_proxy), ("https", &cfg.https_proxy)] {
        let Some(raw) = raw else { continue };
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
            Ok(_) => report.push(Check::Proxy, format!("{name} proxy {raw} must be an http(s) URL")),
            Err(e) => report.push(Check::Proxy, format!("{name} proxy {raw}: {e}")),
        }
    }
}

/// Explicitly configured roles; defaulted roles carry no addressing.
fn explicit_roles(cfg: &InstallConfig) -> Vec<(&'static str, &NetworkSpec)> {
    [
        ("public", &cfg.public_network),
        ("client", &cfg.client_network),
        ("management", &cfg.management_network),
    ]
    .into_iter()
    .filter_map(|(role, spec)| spec.as_ref().map(|spec| (role, spec)))
    .collect()
}

fn check_static_ips(cfg: &InstallConfig, report: &mut Report) {
    for (role, spec) in explicit_roles(cfg) {
        let Some(raw) = &spec.static_ip else {
            if spec.gateway.is_some() {
                report.push(Check::Network, format!("{role} gateway given without a static IP"));
            }
            continue;
        };
        let Some((ip, prefix)) = parse_cidr(raw).collect_issue(report, Check::Network) else {
            continue;
        };
        let Some(gateway) = &spec.gateway else { continue };
        match gateway.parse::<Ipv4Addr>() {
            Ok(gw) if same_subnet(ip, gw, prefix) => {}
            Ok(_) => report.push(
                Check::Network,
                format!("{role} gateway {gateway} is not in {raw}"),
            ),
            Err(_) => report.push(Check::Network, format!("{role} gateway {gateway} is not an IPv4 address")),
        }
    }
}

/// Roles other than the bridge may share a network, but then they share
/// one interface and must agree on its address.
fn check_role_conflicts(cfg: &InstallConfig, report: &mut Report) {
    let roles = explicit_roles(cfg);
    for (i, (a, spec_a)) in roles.iter().enumerate() {
        for (b, spec_b) in &roles[i + 1..] {
            let both_static = spec_a.static_ip.is_some() && spec_b.static_ip.is_some();
            if spec_a.name == spec_b.name && both_static && spec_a.static_ip != spec_b.static_ip {
                report.push(
                    Check::Network,
                    format!("{a} and {b} share network {} but have different static IPs", spec_a.name),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
