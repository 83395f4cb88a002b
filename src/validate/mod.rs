//! Pre-flight validation of an install against the fabric inventory.
//!
//! ```text
//!   InstallConfig ──▶ Validator ──(reads)──▶ dyn Inventory
//!                        │
//!                        ▼
//!                     Report { issues, prerequisites, resolved }
//!                        │
//!                        ▼
//!   Dispatcher::apply_prerequisites ──(writes)──▶ dyn Inventory
//! ```
//!
//! Validation never mutates the fabric. Checks accumulate into a [`Report`]
//! rather than stopping at the first failure; only a failed login or an
//! unresolvable datacenter cuts the fabric checks short. Settings the
//! target is missing but the install can fix itself are reported as
//! [`Prerequisite`]s and written by the [`Dispatcher`].

pub mod dispatcher;
pub mod input;
pub mod inventory;
pub mod validator;

use std::fmt;

use serde::Serialize;

use crate::storage::url::DatastoreUrl;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use dispatcher::Dispatcher;
pub use input::{InstallConfig, NetworkSpec};
pub use inventory::{Inventory, InventorySnapshot, LocalInventory};
pub use validator::Validator;

/// Which family of checks an issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Target,
    Credentials,
    Datacenter,
    Compute,
    Network,
    Storage,
    Firewall,
    Drs,
    License,
    Syslog,
    Tls,
    Proxy,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Check::Target => "target",
            Check::Credentials => "credentials",
            Check::Datacenter => "datacenter",
            Check::Compute => "compute",
            Check::Network => "network",
            Check::Storage => "storage",
            Check::Firewall => "firewall",
            Check::Drs => "drs",
            Check::License => "license",
            Check::Syslog => "syslog",
            Check::Tls => "tls",
            Check::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub check: Check,
    pub message: String,
    /// Alternatives to offer when a name was ambiguous or unknown.
    pub suggestions: Vec<String>,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check, self.message)?;
        if !self.suggestions.is_empty() {
            write!(f, " (suggestions: {})", self.suggestions.join(", "))?;
        }
        Ok(())
    }
}

/// A target setting the install needs and may set itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prerequisite {
    pub key: String,
    pub value: String,
}

/// The placement validation settled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub datacenter: String,
    pub compute: String,
    pub hosts: Vec<String>,
    pub image_store: Option<DatastoreUrl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub issues: Vec<Issue>,
    pub prerequisites: Vec<Prerequisite>,
    pub resolved: Option<Resolved>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn push(&mut self, check: Check, message: impl Into<String>) {
        self.suggest(check, message, Vec::new());
    }

    pub fn suggest(&mut self, check: Check, message: impl Into<String>, suggestions: Vec<String>) {
        self.issues.push(Issue {
            check,
            message: message.into(),
            suggestions,
        });
    }

    /// Issues from one family of checks.
    pub fn issues_for(&self, check: Check) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |issue| issue.check == check)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(resolved) = &self.resolved {
            writeln!(f, "datacenter: {}", resolved.datacenter)?;
            writeln!(f, "compute:    {}", resolved.compute)?;
            writeln!(f, "hosts:      {}", resolved.hosts.join(", "))?;
        }
        for p in &self.prerequisites {
            writeln!(f, "will set {} = {}", p.key, p.value)?;
        }
        if self.issues.is_empty() {
            return writeln!(f, "validation passed");
        }
        writeln!(f, "validation found {} issue(s):", self.issues.len())?;
        for issue in &self.issues {
            writeln!(f, "  {issue}")?;
        }
        Ok(())
    }
}

/// Fold a fallible check into the report, keeping going.
pub(crate) trait CollectIssue<T> {
    fn collect_issue(self, report: &mut Report, check: Check) -> Option<T>;
}

impl<T> CollectIssue<T> for crate::error::Result<T> {
    fn collect_issue(self, report: &mut Report, check: Check) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(err) => {
                report.push(check, err.to_string());
                None
            }
        }
    }
}
