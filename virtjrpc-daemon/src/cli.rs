//! Command-line argument parsing.

use clap::Parser;

/// virtjrpc - JSON-RPC control plane for the local hypervisor
#[derive(Parser, Debug, Clone)]
#[command(name = "virtjrpc")]
#[command(about = "JSON-RPC control plane for the local hypervisor")]
#[command(version)]
pub struct Args {
    /// IP the JSON-RPC server will bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: String,

    /// Port the JSON-RPC server will bind to
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Path to a Unix domain socket to bind instead of IP:port
    #[arg(long)]
    pub unix_socket: Option<String>,

    /// Also write events to /var/log/virt-jrpc-main.log and errors to
    /// /var/log/virt-jrpc-errors.log
    #[arg(long, default_value_t = false)]
    pub log_to_files: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Serve the in-memory mock hypervisor instead of libvirt
    #[arg(long, default_value_t = false)]
    pub dev: bool,
}
