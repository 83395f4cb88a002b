//! Seams onto the virtualization fabric.
//!
//! The control plane talks to three kinds of fabric service, each behind an
//! async trait so the storage and exec layers never see SDK types:
//!
//! ```text
//! Datastore    file operations on a named datastore (dirs, blobs, rename)
//! DiskBackend  virtual disk create / attach / mkfs / mount on the control VM
//! Compute      VM create / reconfigure / power operations and host lookup
//! ```
//!
//! `local` implements `Datastore` and `DiskBackend` over a host directory;
//! `sim` implements `Compute` in memory. Both are what `serve` runs against
//! and what the test suites exercise.

pub mod compute;
pub mod datastore;
pub mod disk;
pub mod local;
pub mod sim;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use compute::{Compute, HostRef, PowerState, SerialPort, VirtualDisk, VmConfigSpec, VmRef};
pub use datastore::{Datastore, FileInfo};
pub use disk::{DiskBackend, DiskError, DiskMode, DiskSpec};
pub use local::{LocalDatastore, LocalDisks};
pub use sim::{SimCompute, SimTask};
