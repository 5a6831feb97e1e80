//! # virtjrpc daemon library
//!
//! The daemon's building blocks: CLI, lock registry, admission control,
//! the JSON-RPC surface and the HTTP server. `main.rs` wires them up; the
//! integration tests drive them against the mock hypervisor.

pub mod cli;
pub mod limit;
pub mod locks;
pub mod rpc;
pub mod server;
