//! Container execution: handles, the container registry and the executor.
//!
//! ```text
//! API call ──▶ Registry ──▶ Handle (draft) ──commit──▶ Container ──▶ Executor ──▶ Compute
//! ```

pub mod config;
pub mod container;
pub mod executor;
pub mod handle;
pub mod network;
pub mod placement;
pub mod registry;

pub use config::{CreateConfig, ExecutorConfig};
pub use container::{Container, ContainerState};
pub use executor::{Executor, ExecutorSettings};
pub use handle::{Handle, TargetState};
pub use network::{BRIDGE_SCOPE, Endpoint, ScopeKind, ScopeSpec, Scopes, Subnet};
pub use placement::{Placement, RandomPlacement};
pub use registry::Registry;
