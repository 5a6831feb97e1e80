//! The two read aggregators (per-domain and per-node), the guest-agent
//! summary, and the /proc readers backing the node figures.
//!
//! Aggregation is best-effort by design: a failed sub-acquisition degrades
//! its field to a zero value instead of failing the response.

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::agent;
use crate::error::{Error, Result};
use crate::snapshot::{list_snapshots, SnapshotEntry};
use crate::sriov::{domain_net_info, network_vf_usage, NetInfo};
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml::domain as domain_xml;

const UNKNOWN: &str = "unknown";

// -- wire types: per-domain ------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuInfoView {
    #[serde(rename = "TotalTime")]
    pub total_time: u64,
    #[serde(rename = "TotalUser")]
    pub total_user: u64,
    #[serde(rename = "TotalSystem")]
    pub total_system: u64,
    #[serde(rename = "CurrentVCPUs")]
    pub current_vcpus: u64,
    #[serde(rename = "MaximumVCPUs")]
    pub maximum_vcpus: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemInfoView {
    #[serde(rename = "Current")]
    pub current: u64,
    #[serde(rename = "Maximum")]
    pub maximum: u64,
    #[serde(rename = "SwapIn")]
    pub swap_in: u64,
    #[serde(rename = "SwapOut")]
    pub swap_out: u64,
    #[serde(rename = "MajorFault")]
    pub major_fault: u64,
    #[serde(rename = "MinorFault")]
    pub minor_fault: u64,
    #[serde(rename = "Unused")]
    pub unused: u64,
    #[serde(rename = "Available")]
    pub available: u64,
    #[serde(rename = "Usable")]
    pub usable: u64,
    #[serde(rename = "Used")]
    pub used: u64,
    #[serde(rename = "Rss")]
    pub rss: u64,
    #[serde(rename = "LastUpdate")]
    pub last_update: u64,
    #[serde(rename = "Period")]
    pub period: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VcpuInfoView {
    #[serde(rename = "Num")]
    pub num: usize,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Time")]
    pub time: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockIoView {
    #[serde(rename = "ModificationImpact")]
    pub modification_impact: String,
    #[serde(flatten)]
    pub params: IoTuneParams,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockParamsView {
    #[serde(rename = "ModificationImpact")]
    pub modification_impact: String,
    #[serde(flatten)]
    pub params: BlkioParams,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerInfoView {
    #[serde(rename = "ModificationImpact")]
    pub modification_impact: String,
    #[serde(flatten)]
    pub params: SchedulerParams,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockJobInfoView {
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(rename = "Bandwidth")]
    pub bandwidth: u64,
    #[serde(rename = "Cur")]
    pub cur: u64,
    #[serde(rename = "End")]
    pub end: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockInfoView {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "BackingIndex")]
    pub backing_index: u64,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "RdReqs")]
    pub rd_reqs: u64,
    #[serde(rename = "RdBytes")]
    pub rd_bytes: u64,
    #[serde(rename = "RdTimes")]
    pub rd_times: u64,
    #[serde(rename = "WrReqs")]
    pub wr_reqs: u64,
    #[serde(rename = "WrBytes")]
    pub wr_bytes: u64,
    #[serde(rename = "WrTimes")]
    pub wr_times: u64,
    #[serde(rename = "FlReqs")]
    pub fl_reqs: u64,
    #[serde(rename = "FlTimes")]
    pub fl_times: u64,
    #[serde(rename = "Errors")]
    pub errors: u64,
    #[serde(rename = "Allocation")]
    pub allocation: u64,
    #[serde(rename = "Capacity")]
    pub capacity: u64,
    #[serde(rename = "Physical")]
    pub physical: u64,
    #[serde(rename = "BlockIO")]
    pub block_io: Vec<BlockIoView>,
    #[serde(rename = "JobInfo")]
    pub job_info: BlockJobInfoView,
}

/// Everything `Info` returns for one domain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InfoResponse {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Persistent")]
    pub persistent: bool,
    #[serde(rename = "Updated")]
    pub updated: bool,
    #[serde(rename = "Autostart")]
    pub autostart: bool,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Reason")]
    pub reason: String,
    #[serde(rename = "NodeFQDN")]
    pub node_host: String,
    #[serde(rename = "HypervisorType")]
    pub hypervisor_type: String,
    #[serde(rename = "Security")]
    pub security: String,
    #[serde(rename = "SchedulerInfo")]
    pub scheduler_info: Vec<SchedulerInfoView>,
    #[serde(rename = "CPU")]
    pub cpu: CpuInfoView,
    #[serde(rename = "VCPU")]
    pub vcpu: Vec<VcpuInfoView>,
    #[serde(rename = "Mem")]
    pub mem: MemInfoView,
    #[serde(rename = "Net")]
    pub net: Vec<NetInfo>,
    #[serde(rename = "BlockParams")]
    pub block_params: Vec<BlockParamsView>,
    #[serde(rename = "Block")]
    pub block: Vec<BlockInfoView>,
    #[serde(rename = "SnapshotCount")]
    pub snapshot_count: i64,
    #[serde(rename = "SnapshotInfo")]
    pub snapshot_info: Vec<SnapshotEntry>,
}

// -- wire types: per-node --------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeHardwareView {
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Memory")]
    pub memory: u64,
    #[serde(rename = "Cpus")]
    pub cpus: u32,
    #[serde(rename = "MHz")]
    pub mhz: u32,
    #[serde(rename = "Nodes")]
    pub nodes: u32,
    #[serde(rename = "Sockets")]
    pub sockets: u32,
    #[serde(rename = "Cores")]
    pub cores: u32,
    #[serde(rename = "Threads")]
    pub threads: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeCpuStatsView {
    #[serde(rename = "Kernel")]
    pub kernel: u64,
    #[serde(rename = "User")]
    pub user: u64,
    #[serde(rename = "Idle")]
    pub idle: u64,
    #[serde(rename = "Iowait")]
    pub iowait: u64,
    #[serde(rename = "Interrupt")]
    pub interrupt: u64,
    #[serde(rename = "Utilization")]
    pub utilization: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeNetworkView {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "UsedVFs")]
    pub used_vfs: i64,
    #[serde(rename = "AvailableVFs")]
    pub available_vfs: i64,
    #[serde(rename = "TotalVFs")]
    pub total_vfs: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodePoolView {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Persistent")]
    pub persistent: bool,
    #[serde(rename = "Autostart")]
    pub autostart: bool,
    #[serde(rename = "Capacity")]
    pub capacity: u64,
    #[serde(rename = "Allocation")]
    pub allocation: u64,
    #[serde(rename = "Available")]
    pub available: u64,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "VolumesCount")]
    pub volumes_count: usize,
    #[serde(rename = "Templates")]
    pub templates: Vec<String>,
}

/// Everything `HypervisorInfo` returns for the node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeInfoResponse {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Uptime")]
    pub uptime: u64,
    #[serde(rename = "LibvirtVersion")]
    pub libvirt_version: u64,
    #[serde(rename = "VCPUsCount")]
    pub vcpus_count: u64,
    #[serde(rename = "ActiveNetworkCount")]
    pub active_network_count: u32,
    #[serde(rename = "ActiveDomainCount")]
    pub active_domain_count: u32,
    #[serde(rename = "HardwareInfo")]
    pub hardware_info: NodeHardwareView,
    #[serde(rename = "CPUStats")]
    pub cpu_stats: NodeCpuStatsView,
    #[serde(rename = "MemoryStats")]
    pub memory_stats: NodeMemoryStats,
    #[serde(rename = "Network")]
    pub network: Vec<NodeNetworkView>,
    #[serde(rename = "Pool")]
    pub pool: Vec<NodePoolView>,
}

// -- wire types: guest agent ----------------------------------------------

/// Everything `QemuAgentInfo` returns for one domain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QemuAgentResponse {
    #[serde(rename = "Available")]
    pub available: bool,
    #[serde(rename = "AgentVersion")]
    pub agent_version: String,
    #[serde(rename = "Time")]
    pub time: i64,
    #[serde(rename = "Timezone")]
    pub timezone: String,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "OSInfo")]
    pub os_info: agent::GuestOsInfo,
    #[serde(rename = "LoadAverage")]
    pub load_average: agent::GuestLoadAverage,
    #[serde(rename = "Uptime")]
    pub uptime: agent::GuestUptime,
    #[serde(rename = "Users")]
    pub users: Vec<agent::GuestUser>,
    #[serde(rename = "FSInfo")]
    pub fs_info: Vec<agent::GuestFilesystem>,
    #[serde(rename = "Network")]
    pub network: Vec<agent::GuestNetwork>,
}

// -- state decoding --------------------------------------------------------

/// Decode the raw libvirt state/reason pair into the printable matrix.
pub fn decode_domain_state(raw: Option<RawDomainState>) -> (String, String) {
    let Some(raw) = raw else {
        return (
            "DOMAIN_STATE_UNKNOWN".to_string(),
            "DOMAIN_REASON_UNKNOWN".to_string(),
        );
    };

    let (state, reason) = match raw.state {
        0 => ("DOMAIN_NOSTATE", "DOMAIN_NOSTATE_UNKNOWN"),
        1 => (
            "DOMAIN_RUNNING",
            match raw.reason {
                1 => "DOMAIN_RUNNING_BOOTED",
                2 => "DOMAIN_RUNNING_MIGRATED",
                3 => "DOMAIN_RUNNING_RESTORED",
                4 => "DOMAIN_RUNNING_FROM_SNAPSHOT",
                5 => "DOMAIN_RUNNING_UNPAUSED",
                6 => "DOMAIN_RUNNING_MIGRATION_CANCELED",
                7 => "DOMAIN_RUNNING_SAVE_CANCELED",
                8 => "DOMAIN_RUNNING_WAKEUP",
                9 => "DOMAIN_RUNNING_CRASHED",
                10 => "DOMAIN_RUNNING_POSTCOPY",
                _ => "DOMAIN_RUNNING_UNKNOWN",
            },
        ),
        2 => ("DOMAIN_BLOCKED", "DOMAIN_BLOCKED_UNKNOWN"),
        3 => (
            "DOMAIN_PAUSED",
            match raw.reason {
                1 => "DOMAIN_PAUSED_USER",
                2 => "DOMAIN_PAUSED_MIGRATION",
                3 => "DOMAIN_PAUSED_SAVE",
                4 => "DOMAIN_PAUSED_DUMP",
                5 => "DOMAIN_PAUSED_IOERROR",
                6 => "DOMAIN_PAUSED_WATCHDOG",
                7 => "DOMAIN_PAUSED_FROM_SNAPSHOT",
                8 => "DOMAIN_PAUSED_SHUTTING_DOWN",
                9 => "DOMAIN_PAUSED_SNAPSHOT",
                10 => "DOMAIN_PAUSED_CRASHED",
                11 => "DOMAIN_PAUSED_STARTING_UP",
                12 => "DOMAIN_PAUSED_POSTCOPY",
                13 => "DOMAIN_PAUSED_POSTCOPY_FAILED",
                _ => "DOMAIN_PAUSED_UNKNOWN",
            },
        ),
        4 => (
            "DOMAIN_SHUTDOWN",
            match raw.reason {
                1 => "DOMAIN_SHUTDOWN_USER",
                _ => "DOMAIN_SHUTDOWN_UNKNOWN",
            },
        ),
        5 => (
            "DOMAIN_SHUTOFF",
            match raw.reason {
                1 => "DOMAIN_SHUTOFF_SHUTDOWN",
                2 => "DOMAIN_SHUTOFF_DESTROYED",
                3 => "DOMAIN_SHUTOFF_CRASHED",
                4 => "DOMAIN_SHUTOFF_MIGRATED",
                5 => "DOMAIN_SHUTOFF_SAVED",
                6 => "DOMAIN_SHUTOFF_FAILED",
                7 => "DOMAIN_SHUTOFF_FROM_SNAPSHOT",
                _ => "DOMAIN_SHUTOFF_UNKNOWN",
            },
        ),
        6 => (
            "DOMAIN_CRASHED",
            match raw.reason {
                1 => "DOMAIN_CRASHED_PANICKED",
                _ => "DOMAIN_CRASHED_UNKNOWN",
            },
        ),
        7 => ("DOMAIN_PMSUSPENDED", "DOMAIN_PMSUSPENDED_UNKNOWN"),
        _ => ("DOMAIN_STATE_UNKNOWN", "DOMAIN_REASON_UNKNOWN"),
    };

    (state.to_string(), reason.to_string())
}

fn decode_vcpu_state(raw: i32) -> &'static str {
    match raw {
        0 => "VCPU_OFFLINE",
        1 => "VCPU_RUNNING",
        2 => "VCPU_BLOCKED",
        _ => "VCPU_UNKNOWN",
    }
}

// -- /proc readers ---------------------------------------------------------

/// Parse /proc/meminfo content into the node memory figures.
///
/// Two guards against distorted readings inside containers: an available
/// figure above total collapses to free, and a negative used computation
/// falls back to `total - free`.
pub fn parse_meminfo(content: &str) -> NodeMemoryStats {
    let mut stats = NodeMemoryStats::default();

    for line in content.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = rest.split_whitespace().next() else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match name.trim() {
            "MemTotal" => stats.total = value,
            "MemAvailable" => stats.available = value,
            "MemFree" => stats.free = value,
            "Cached" => stats.cached = value,
            "Buffers" => stats.buffers = value,
            "SwapTotal" => stats.swap_total = value,
            "SwapFree" => stats.swap_free = value,
            "SwapCached" => stats.swap_cached = value,
            _ => {}
        }
    }

    if stats.available > stats.total {
        stats.available = stats.free;
    }

    stats.used = stats
        .total
        .checked_sub(stats.free)
        .and_then(|v| v.checked_sub(stats.cached))
        .and_then(|v| v.checked_sub(stats.buffers))
        .unwrap_or_else(|| stats.total.saturating_sub(stats.free));

    stats
}

/// Parse /proc/uptime content into nanoseconds.
pub fn parse_proc_uptime(content: &str) -> Result<u64> {
    let fields: Vec<&str> = content.trim().split(' ').collect();
    if fields.len() != 2 {
        return Err(Error::Internal("unknown /proc/uptime format".to_string()));
    }
    let seconds: f64 = fields[0]
        .parse()
        .map_err(|_| Error::Internal("unknown /proc/uptime format".to_string()))?;
    Ok((seconds * 1_000_000_000.0) as u64)
}

// -- aggregators -----------------------------------------------------------

/// Compose the per-domain response. Every sub-acquisition degrades to a
/// zero value on failure.
pub async fn domain_info(hv: &dyn Hypervisor, domain: &str) -> Result<InfoResponse> {
    let runtime = hv.domain_runtime(domain).await?;
    let stats = hv.domain_stats(domain).await?;

    let mut r = InfoResponse {
        name: runtime.name.clone(),
        uuid: runtime.uuid.clone(),
        timestamp: Utc::now().timestamp(),
        active: runtime.active,
        persistent: runtime.persistent,
        updated: runtime.updated,
        autostart: runtime.autostart,
        security: runtime.security_label.clone(),
        ..InfoResponse::default()
    };

    let (state, reason) = decode_domain_state(stats.state);
    r.state = state;
    r.reason = reason;

    r.node_host = hv.hostname().await.unwrap_or_else(|_| UNKNOWN.to_string());

    r.mem.current = stats.balloon_current_kib;
    r.mem.maximum = stats.balloon_maximum_kib;

    r.vcpu = stats
        .vcpus
        .iter()
        .enumerate()
        .map(|(i, v)| VcpuInfoView {
            num: i,
            state: decode_vcpu_state(v.state).to_string(),
            time: v.time,
        })
        .collect();

    r.cpu = CpuInfoView {
        total_time: stats.cpu_time,
        total_user: stats.cpu_user,
        total_system: stats.cpu_system,
        current_vcpus: hv.current_vcpus(domain).await.unwrap_or(0),
        maximum_vcpus: hv.max_vcpus(domain).await.unwrap_or(0),
    };

    r.net = domain_net_info(hv, domain).await.unwrap_or_default();

    let both_layers = r.persistent && r.active;

    r.block_params
        .push(blkio_view(hv, domain, Impact::Current).await);
    if both_layers {
        r.block_params
            .push(blkio_view(hv, domain, Impact::Config).await);
    }

    for b in &stats.blocks {
        let mut view = BlockInfoView {
            name: b.name.clone(),
            backing_index: b.backing_index,
            path: b.path.clone(),
            rd_reqs: b.rd_reqs,
            rd_bytes: b.rd_bytes,
            rd_times: b.rd_times,
            wr_reqs: b.wr_reqs,
            wr_bytes: b.wr_bytes,
            wr_times: b.wr_times,
            fl_reqs: b.fl_reqs,
            fl_times: b.fl_times,
            errors: b.errors,
            allocation: b.allocation,
            capacity: b.capacity,
            physical: b.physical,
            ..BlockInfoView::default()
        };

        view.block_io
            .push(io_tune_view(hv, domain, &b.name, Impact::Current).await);
        if both_layers {
            view.block_io
                .push(io_tune_view(hv, domain, &b.name, Impact::Config).await);
        }

        view.job_info = match hv.block_job_info(domain, &b.name).await {
            Ok(job) => BlockJobInfoView {
                type_name: job.kind.as_str().to_string(),
                bandwidth: job.bandwidth,
                cur: job.cur,
                end: job.end,
            },
            Err(_) => BlockJobInfoView::default(),
        };

        r.block.push(view);
    }

    if let Ok(sched) = hv.scheduler_info(domain, Impact::Current).await {
        r.scheduler_info.push(SchedulerInfoView {
            modification_impact: Impact::Current.as_str().to_string(),
            params: sched,
        });
    }
    if both_layers {
        if let Ok(sched) = hv.scheduler_info(domain, Impact::Config).await {
            r.scheduler_info.push(SchedulerInfoView {
                modification_impact: Impact::Config.as_str().to_string(),
                params: sched,
            });
        }
    }

    match hv.domain_xml(domain, false).await {
        Ok(xml) => {
            r.hypervisor_type = domain_xml::hypervisor_type(&xml)
                .unwrap_or_else(|_| UNKNOWN.to_string());
            if let Ok(mem) = hv.domain_memory_stats(domain).await {
                r.mem.swap_in = mem.swap_in;
                r.mem.swap_out = mem.swap_out;
                r.mem.major_fault = mem.major_fault;
                r.mem.minor_fault = mem.minor_fault;
                r.mem.unused = mem.unused;
                r.mem.available = mem.available;
                r.mem.usable = mem.usable;
                r.mem.used = mem.available.saturating_sub(mem.unused);
                r.mem.last_update = mem.last_update;
                r.mem.rss = mem.rss;
                r.mem.period = domain_xml::memballoon_stats_period(&xml).unwrap_or(0);
            }
        }
        Err(e) => {
            warn!(domain, error = %e, "failed to read domain XML");
            r.hypervisor_type = UNKNOWN.to_string();
        }
    }

    r.snapshot_count = hv
        .snapshot_names(domain, SnapshotFilter::All)
        .await
        .map(|s| s.len() as i64)
        .unwrap_or(0);
    r.snapshot_info = list_snapshots(hv, domain).await;

    Ok(r)
}

async fn blkio_view(hv: &dyn Hypervisor, domain: &str, impact: Impact) -> BlockParamsView {
    BlockParamsView {
        modification_impact: impact.as_str().to_string(),
        params: hv.blkio_params(domain, impact).await.unwrap_or_default(),
    }
}

async fn io_tune_view(
    hv: &dyn Hypervisor,
    domain: &str,
    device: &str,
    impact: Impact,
) -> BlockIoView {
    BlockIoView {
        modification_impact: impact.as_str().to_string(),
        params: hv
            .block_io_tune(domain, device, impact)
            .await
            .unwrap_or_default(),
    }
}

/// Sum of the current vCPU allocation across every domain on the host.
async fn assigned_vcpus(hv: &dyn Hypervisor) -> Result<u64> {
    let mut count = 0;
    for name in hv.list_domain_names().await? {
        count += hv.current_vcpus(&name).await.unwrap_or(0);
    }
    Ok(count)
}

/// Compose the per-node response.
pub async fn node_info_response(hv: &dyn Hypervisor) -> Result<NodeInfoResponse> {
    let mut r = NodeInfoResponse {
        timestamp: Utc::now().timestamp(),
        ..NodeInfoResponse::default()
    };

    r.hostname = hv.hostname().await.unwrap_or_else(|_| UNKNOWN.to_string());
    r.uptime = hv.node_uptime().await.unwrap_or(0);
    r.libvirt_version = hv.lib_version().await?;

    let hw = hv.node_info().await?;
    r.hardware_info = NodeHardwareView {
        model: hw.model,
        memory: hw.memory_kib,
        cpus: hw.cpus,
        mhz: hw.mhz,
        nodes: hw.nodes,
        sockets: hw.sockets,
        cores: hw.cores,
        threads: hw.threads,
    };

    let cpu = hv.node_cpu_stats().await?;
    r.cpu_stats = NodeCpuStatsView {
        kernel: cpu.kernel,
        user: cpu.user,
        idle: cpu.idle,
        iowait: cpu.iowait,
        interrupt: cpu.interrupt,
        utilization: cpu.utilization,
    };

    r.memory_stats = hv.node_memory_stats().await?;
    r.active_domain_count = hv.num_of_domains().await?;
    r.vcpus_count = assigned_vcpus(hv).await.unwrap_or(0);
    r.active_network_count = hv.num_of_networks().await?;

    for name in hv.list_network_names().await? {
        let Ok((used, total)) = network_vf_usage(hv, &name).await else {
            continue;
        };
        let total = total as i64;
        let used = used as i64;
        r.network.push(NodeNetworkView {
            name,
            used_vfs: used,
            total_vfs: total.max(0),
            available_vfs: (total - used).max(0),
        });
    }

    for name in hv.list_pool_names(PoolFilter::Directory).await? {
        let Ok(info) = hv.pool_info(&name).await else {
            continue;
        };
        let Ok(path) = crate::storage::pool_path(hv, &name).await else {
            continue;
        };

        let volumes = hv.pool_volume_names(&name).await.unwrap_or_default();
        let templates = volumes
            .iter()
            .filter(|v| v.contains("template"))
            .cloned()
            .collect();

        r.pool.push(NodePoolView {
            state: info.state.as_str().to_string(),
            active: hv.pool_is_active(&name).await.unwrap_or(false),
            persistent: hv.pool_is_persistent(&name).await.unwrap_or(false),
            autostart: hv.pool_autostart(&name).await.unwrap_or(false),
            capacity: info.capacity,
            allocation: info.allocation,
            available: info.available,
            path,
            volumes_count: volumes.len(),
            templates,
            name,
        });
    }

    Ok(r)
}

/// Compose the guest-agent summary. When the agent does not answer the
/// ping, every other field stays at its zero value.
pub async fn qemu_agent_info(hv: &dyn Hypervisor, domain: &str) -> QemuAgentResponse {
    let mut r = QemuAgentResponse {
        available: agent::ping(hv, domain).await,
        ..QemuAgentResponse::default()
    };
    if !r.available {
        return r;
    }

    r.agent_version = agent::agent_version(hv, domain).await.unwrap_or_default();
    r.time = agent::guest_time(hv, domain).await.unwrap_or(0);
    r.timezone = agent::timezone(hv, domain).await.unwrap_or_default();
    r.hostname = agent::hostname(hv, domain).await.unwrap_or_default();
    r.os_info = agent::os_info(hv, domain).await.unwrap_or_default();
    r.fs_info = agent::fs_info(hv, domain).await.unwrap_or_default();
    r.network = agent::network_interfaces(hv, domain).await.unwrap_or_default();
    r.load_average = agent::load_average(hv, domain).await.unwrap_or_default();
    r.users = agent::users(hv, domain).await.unwrap_or_default();
    r.uptime = agent::uptime(hv, domain).await.unwrap_or_default();

    r
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       32614356 kB\n\
                           MemFree:        24735764 kB\n\
                           MemAvailable:   29105488 kB\n\
                           Buffers:          517948 kB\n\
                           Cached:          3763440 kB\n\
                           SwapCached:            0 kB\n\
                           SwapTotal:       1003516 kB\n\
                           SwapFree:        1003516 kB\n";

    #[test]
    fn meminfo_parses_and_computes_used() {
        let stats = parse_meminfo(MEMINFO);
        assert_eq!(stats.total, 32614356);
        assert_eq!(stats.free, 24735764);
        assert_eq!(stats.available, 29105488);
        assert_eq!(
            stats.used,
            32614356 - 24735764 - 3763440 - 517948
        );
        assert_eq!(stats.swap_total, 1003516);
    }

    #[test]
    fn meminfo_available_above_total_collapses_to_free() {
        let content = "MemTotal: 1000 kB\nMemFree: 400 kB\nMemAvailable: 2000 kB\n";
        let stats = parse_meminfo(content);
        assert_eq!(stats.available, 400);
    }

    #[test]
    fn meminfo_used_underflow_falls_back() {
        // cached + buffers above total - free forces the fallback formula
        let content =
            "MemTotal: 1000 kB\nMemFree: 400 kB\nCached: 500 kB\nBuffers: 200 kB\n";
        let stats = parse_meminfo(content);
        assert_eq!(stats.used, 600);
    }

    #[test]
    fn uptime_converts_to_nanoseconds() {
        assert_eq!(
            parse_proc_uptime("12.25 48.00\n").unwrap(),
            12_250_000_000
        );
        assert!(parse_proc_uptime("12.25").is_err());
        assert!(parse_proc_uptime("a b").is_err());
    }

    #[test]
    fn state_matrix_decodes() {
        let (s, r) = decode_domain_state(Some(RawDomainState { state: 1, reason: 1 }));
        assert_eq!(s, "DOMAIN_RUNNING");
        assert_eq!(r, "DOMAIN_RUNNING_BOOTED");

        let (s, r) = decode_domain_state(Some(RawDomainState { state: 5, reason: 2 }));
        assert_eq!(s, "DOMAIN_SHUTOFF");
        assert_eq!(r, "DOMAIN_SHUTOFF_DESTROYED");

        let (s, r) = decode_domain_state(Some(RawDomainState { state: 42, reason: 0 }));
        assert_eq!(s, "DOMAIN_STATE_UNKNOWN");
        assert_eq!(r, "DOMAIN_REASON_UNKNOWN");

        let (s, _) = decode_domain_state(None);
        assert_eq!(s, "DOMAIN_STATE_UNKNOWN");
    }
}
