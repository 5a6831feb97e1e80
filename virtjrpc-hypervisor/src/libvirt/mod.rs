//! Libvirt backend: the `virt` bindings for connection, domain, storage,
//! network and node-device primitives, with a `virsh` process shim for the
//! API families the bindings do not expose (snapshots, block jobs, guest
//! agent commands, metadata, device I/O tuning, scheduler parameters).

mod backend;
mod virsh;

pub use backend::LibvirtConnector;
