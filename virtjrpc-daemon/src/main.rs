//! # virtjrpc daemon
//!
//! Single-host control plane for the local hypervisor: a JSON-RPC 2.0 API
//! over HTTP (TCP or Unix socket) for domain lifecycle, SR-IOV VLAN
//! rebinding, storage volumes, snapshots, live backups and guest-agent
//! brokering.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use virtjrpc_daemon::cli::Args;
use virtjrpc_daemon::rpc::service::AppState;
use virtjrpc_daemon::server;
use virtjrpc_hypervisor::Connector;

const APP: &str = "virt-jrpc";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.dev && !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("virtjrpc must be run with root privileges");
    }

    virtjrpc_common::init_logging(&args.log_level, args.log_to_files, APP)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting virtjrpc daemon"
    );

    let state = Arc::new(AppState::new(build_connector(&args)));
    server::run(state, &args).await
}

#[cfg(feature = "libvirt")]
fn build_connector(args: &Args) -> Arc<dyn Connector> {
    if args.dev {
        info!("development mode, serving the mock hypervisor");
        Arc::new(virtjrpc_hypervisor::MockConnector::default())
    } else {
        Arc::new(virtjrpc_hypervisor::LibvirtConnector::default())
    }
}

#[cfg(not(feature = "libvirt"))]
fn build_connector(args: &Args) -> Arc<dyn Connector> {
    if !args.dev {
        tracing::warn!("built without libvirt support, serving the mock hypervisor");
    }
    Arc::new(virtjrpc_hypervisor::MockConnector::default())
}
