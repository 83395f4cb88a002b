//! vch-portlayer: control-plane core of a virtual container host.
//!
//! ```text
//! api ──▶ storage (image stores, name-lookup cache) ──▶ fabric::Datastore / DiskBackend
//!     └─▶ exec (registry, handles, executor)         ──▶ fabric::Compute
//! toolbox (VIX commands, processes, HGFS)  guest side of the VM channel
//! validate                                  pre-install checks of a target
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod exec;
pub mod fabric;
pub mod logging;
pub mod op;
pub mod paths;
pub mod pipe;
pub mod storage;
pub mod toolbox;
pub mod validate;

pub use error::{Error, Result};
