//! # virtjrpc hypervisor layer
//!
//! Hypervisor abstraction for the virtjrpc control-plane daemon.
//!
//! The crate is organized around one seam:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │     protocols (gate, lifecycle, backup,      │
//! │     snapshots, SR-IOV, agent, aggregators)   │
//! └──────────────────────┬───────────────────────┘
//!                        │ Connector / Hypervisor
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//! ┌──────────────────┐       ┌──────────────────┐
//! │ LibvirtConnector │       │  MockConnector   │
//! │ (virt + virsh)   │       │  (in-memory)     │
//! └──────────────────┘       └──────────────────┘
//! ```
//!
//! Everything above the seam is plain logic over XML documents and typed
//! values, which is what the test suites exercise. The libvirt backend is
//! compiled in with the `libvirt` feature.

pub mod agent;
pub mod archive;
pub mod backup;
pub mod create;
pub mod error;
pub mod gate;
pub mod ident;
pub mod info;
pub mod lifecycle;
pub mod mock;
pub mod snapshot;
pub mod sriov;
pub mod storage;
pub mod traits;
pub mod types;
pub mod xml;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use error::{Error, Result};
pub use mock::{HostModel, MockConnector};
pub use traits::{Connector, Hypervisor};
pub use types::*;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtConnector;
