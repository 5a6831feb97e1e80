//! The hypervisor seam.
//!
//! Every protocol in this crate is written against [`Hypervisor`], a
//! session handed out by a [`Connector`] for the duration of one request.
//! The libvirt backend implements it over a fresh connection per request;
//! the mock backend implements it over an in-memory host model for tests
//! and development mode.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Opens hypervisor sessions. One session per request; dropping the session
/// releases the underlying connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, mode: AccessMode) -> Result<Box<dyn Hypervisor>>;
}

/// A single hypervisor session.
///
/// The trait deliberately stays at the level of the native management API:
/// lookups by name, XML in and out, flagged setters. Composition (gates,
/// validation, multi-step protocols, aggregation) lives above the seam so
/// the mock can stand in for libvirt everywhere.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // -- node -------------------------------------------------------------

    async fn hostname(&self) -> Result<String>;
    async fn lib_version(&self) -> Result<u64>;
    async fn node_info(&self) -> Result<NodeHardware>;
    async fn node_cpu_stats(&self) -> Result<NodeCpuStats>;
    /// /proc/meminfo figures of the node (the balloon-independent truth).
    async fn node_memory_stats(&self) -> Result<NodeMemoryStats>;
    /// Node uptime in nanoseconds, from /proc/uptime.
    async fn node_uptime(&self) -> Result<u64>;
    /// Number of active domains.
    async fn num_of_domains(&self) -> Result<u32>;
    /// Number of active networks.
    async fn num_of_networks(&self) -> Result<u32>;

    // -- domains: lookup and introspection --------------------------------

    async fn list_domain_names(&self) -> Result<Vec<String>>;
    async fn domain_exists(&self, domain: &str) -> Result<bool>;
    async fn domain_runtime(&self, domain: &str) -> Result<DomainRuntime>;
    /// Domain XML; `inactive` selects the persistent definition.
    async fn domain_xml(&self, domain: &str, inactive: bool) -> Result<String>;
    /// Bulk stats for one domain: balloon, block, cpu-total, state, vcpu.
    async fn domain_stats(&self, domain: &str) -> Result<DomainStats>;
    async fn domain_memory_stats(&self, domain: &str) -> Result<DomainMemoryStats>;
    async fn current_vcpus(&self, domain: &str) -> Result<u64>;
    async fn max_vcpus(&self, domain: &str) -> Result<u64>;

    // -- domains: lifecycle ------------------------------------------------

    async fn start_domain(&self, domain: &str) -> Result<()>;
    async fn shutdown_domain(&self, domain: &str) -> Result<()>;
    async fn reboot_domain(&self, domain: &str) -> Result<()>;
    async fn reset_domain(&self, domain: &str) -> Result<()>;
    /// Destroy a running domain; `graceful` flushes the hypervisor caches
    /// before killing the process.
    async fn destroy_domain(&self, domain: &str, graceful: bool) -> Result<()>;
    /// Undefine with managed save, snapshot metadata and NVRAM removal.
    async fn undefine_domain(&self, domain: &str) -> Result<()>;
    /// Define a new persistent domain, validating the XML against the
    /// schema.
    async fn define_domain(&self, xml: &str) -> Result<()>;

    // -- domains: tuning ---------------------------------------------------

    async fn set_autostart(&self, domain: &str, autostart: bool) -> Result<()>;
    async fn set_memory(&self, domain: &str, kib: u64, affect: AffectFlags) -> Result<()>;
    /// CONFIG | MAXIMUM; only legal on stopped domains.
    async fn set_max_memory(&self, domain: &str, kib: u64) -> Result<()>;
    async fn set_memory_stats_period(
        &self,
        domain: &str,
        period_secs: i32,
        affect: AffectFlags,
    ) -> Result<()>;
    async fn set_vcpus(&self, domain: &str, count: u32, affect: AffectFlags) -> Result<()>;
    /// CONFIG | MAXIMUM | HOTPLUGGABLE; only legal on stopped domains.
    async fn set_max_vcpus(&self, domain: &str, count: u32) -> Result<()>;
    async fn set_scheduler_cpu_shares(
        &self,
        domain: &str,
        shares: u64,
        affect: AffectFlags,
    ) -> Result<()>;
    async fn set_block_io_tune(
        &self,
        domain: &str,
        device: &str,
        update: IoTuneUpdate,
        affect: AffectFlags,
    ) -> Result<()>;
    async fn block_io_tune(
        &self,
        domain: &str,
        device: &str,
        impact: Impact,
    ) -> Result<IoTuneParams>;
    async fn blkio_params(&self, domain: &str, impact: Impact) -> Result<BlkioParams>;
    async fn scheduler_info(&self, domain: &str, impact: Impact) -> Result<SchedulerParams>;

    // -- domains: metadata -------------------------------------------------

    /// Read the custom metadata element registered under `uri`.
    async fn metadata(&self, domain: &str, uri: &str) -> Result<String>;
    /// Store a custom metadata element under `key`/`uri`.
    async fn set_metadata(&self, domain: &str, xml: &str, key: &str, uri: &str) -> Result<()>;

    // -- domains: device attach/detach (MODIFY_CURRENT) --------------------

    async fn attach_device(&self, domain: &str, xml: &str) -> Result<()>;
    async fn detach_device(&self, domain: &str, xml: &str) -> Result<()>;

    // -- domains: block jobs ----------------------------------------------

    async fn block_job_info(&self, domain: &str, device: &str) -> Result<BlockJobInfo>;
    /// Start an active, shallow block commit on `device`.
    async fn block_commit_active(&self, domain: &str, device: &str) -> Result<()>;
    /// Abort the block job on `device` with PIVOT | ASYNC.
    async fn block_job_pivot(&self, domain: &str, device: &str) -> Result<()>;

    // -- snapshots ---------------------------------------------------------

    async fn snapshot_names(&self, domain: &str, filter: SnapshotFilter) -> Result<Vec<String>>;
    async fn create_snapshot(
        &self,
        domain: &str,
        xml: &str,
        flags: SnapshotCreateFlags,
    ) -> Result<()>;
    async fn delete_snapshot(&self, domain: &str, name: &str) -> Result<()>;
    async fn revert_snapshot(&self, domain: &str, name: &str) -> Result<()>;
    async fn snapshot_children_count(&self, domain: &str, name: &str) -> Result<i64>;
    async fn snapshot_parent(&self, domain: &str, name: &str) -> Result<Option<String>>;
    async fn snapshot_is_current(&self, domain: &str, name: &str) -> Result<bool>;

    // -- storage -----------------------------------------------------------

    async fn list_pool_names(&self, filter: PoolFilter) -> Result<Vec<String>>;
    async fn pool_info(&self, pool: &str) -> Result<PoolInfo>;
    async fn pool_xml(&self, pool: &str) -> Result<String>;
    async fn pool_is_active(&self, pool: &str) -> Result<bool>;
    async fn pool_is_persistent(&self, pool: &str) -> Result<bool>;
    async fn pool_autostart(&self, pool: &str) -> Result<bool>;
    async fn pool_volume_names(&self, pool: &str) -> Result<Vec<String>>;
    async fn refresh_pool(&self, pool: &str) -> Result<()>;
    async fn volume_xml(&self, pool: &str, volume: &str) -> Result<String>;
    /// Create a volume in `pool` from `source` using the prepared XML.
    async fn clone_volume(&self, pool: &str, source: &str, xml: &str) -> Result<()>;
    /// Typed lookup: `Ok(None)` is the ordinary "no such volume" outcome.
    async fn find_volume_by_path(&self, path: &str) -> Result<Option<VolumeRef>>;
    /// Delete a volume (NORMAL flag: the backing file is removed).
    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()>;

    // -- networks ----------------------------------------------------------

    /// Active, persistent, autostarted networks.
    async fn list_network_names(&self) -> Result<Vec<String>>;
    async fn network_xml(&self, network: &str) -> Result<String>;
    async fn network_exists(&self, network: &str) -> Result<bool>;

    // -- node devices -------------------------------------------------------

    /// Node devices with the net capability.
    async fn list_net_node_devices(&self) -> Result<Vec<String>>;
    async fn node_device_xml(&self, name: &str) -> Result<String>;

    // -- guest agent --------------------------------------------------------

    /// Send a raw JSON command to the guest agent with the default timeout
    /// and return the raw JSON response.
    async fn agent_command(&self, domain: &str, command: &str) -> Result<String>;
    async fn set_user_password(&self, domain: &str, user: &str, password: &str) -> Result<()>;
}
