//! Core data types shared between the hypervisor seam and the protocols.

use serde::Serialize;

/// Session access mode against the local hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Flags sampled from a domain handle that decide how a mutation is applied
/// and whether the safety gate lets it through.
#[derive(Debug, Clone, Default)]
pub struct DomainRuntime {
    pub name: String,
    pub uuid: String,
    pub active: bool,
    pub persistent: bool,
    pub updated: bool,
    pub autostart: bool,
    pub security_label: String,
}

/// Raw libvirt state/reason pair; decoded to strings by the aggregator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDomainState {
    pub state: u32,
    pub reason: i32,
}

/// Which layer of the domain definition a tuning change applies to.
/// CONFIG when persistent, LIVE when active, on top of CURRENT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AffectFlags {
    pub config: bool,
    pub live: bool,
}

/// Modification impact selector for read-back of tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impact {
    Current,
    Config,
    Live,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::Current => "DOMAIN_AFFECT_CURRENT",
            Impact::Config => "DOMAIN_AFFECT_CONFIG",
            Impact::Live => "DOMAIN_AFFECT_LIVE",
        }
    }
}

/// Block job classification as reported per block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockJobKind {
    #[default]
    None,
    Pull,
    Copy,
    Commit,
    ActiveCommit,
}

impl BlockJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockJobKind::None => "",
            BlockJobKind::Pull => "DOMAIN_BLOCK_JOB_TYPE_PULL",
            BlockJobKind::Copy => "DOMAIN_BLOCK_JOB_TYPE_COPY",
            BlockJobKind::Commit => "DOMAIN_BLOCK_JOB_TYPE_COMMIT",
            BlockJobKind::ActiveCommit => "DOMAIN_BLOCK_JOB_TYPE_ACTIVE_COMMIT",
        }
    }

    /// A job kind that blocks every mutation while in flight.
    pub fn is_running(&self) -> bool {
        !matches!(self, BlockJobKind::None)
    }
}

/// Progress of a block job on a single device.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockJobInfo {
    pub kind: BlockJobKind,
    pub bandwidth: u64,
    pub cur: u64,
    pub end: u64,
}

/// Per-vCPU state sample.
#[derive(Debug, Clone, Copy)]
pub struct VcpuStat {
    /// Raw libvirt vCPU state code.
    pub state: i32,
    /// Consumed CPU time in nanoseconds.
    pub time: u64,
}

/// Per-block-device counters out of the bulk stats call.
#[derive(Debug, Clone, Default)]
pub struct BlockStat {
    pub name: String,
    pub backing_index: u64,
    pub path: String,
    pub rd_reqs: u64,
    pub rd_bytes: u64,
    pub rd_times: u64,
    pub wr_reqs: u64,
    pub wr_bytes: u64,
    pub wr_times: u64,
    pub fl_reqs: u64,
    pub fl_times: u64,
    pub errors: u64,
    pub allocation: u64,
    pub capacity: u64,
    pub physical: u64,
}

/// Bundle returned by the bulk domain stats query
/// (balloon, block, cpu-total, state, vcpu).
#[derive(Debug, Clone, Default)]
pub struct DomainStats {
    pub state: Option<RawDomainState>,
    pub balloon_current_kib: u64,
    pub balloon_maximum_kib: u64,
    pub cpu_time: u64,
    pub cpu_user: u64,
    pub cpu_system: u64,
    pub vcpus: Vec<VcpuStat>,
    pub blocks: Vec<BlockStat>,
}

/// Balloon-driver memory statistics, all sizes in KiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainMemoryStats {
    pub swap_in: u64,
    pub swap_out: u64,
    pub major_fault: u64,
    pub minor_fault: u64,
    pub unused: u64,
    pub available: u64,
    pub actual: u64,
    pub usable: u64,
    pub last_update: u64,
    pub rss: u64,
}

/// Block device I/O limits (virsh blkdeviotune).
#[derive(Debug, Clone, Default, Serialize)]
pub struct IoTuneParams {
    #[serde(rename = "ReadBytesSec")]
    pub read_bytes_sec: u64,
    #[serde(rename = "ReadBytesSecMax")]
    pub read_bytes_sec_max: u64,
    #[serde(rename = "ReadBytesSecMaxLength")]
    pub read_bytes_sec_max_length: u64,
    #[serde(rename = "ReadIopsSec")]
    pub read_iops_sec: u64,
    #[serde(rename = "ReadIopsSecMax")]
    pub read_iops_sec_max: u64,
    #[serde(rename = "ReadIopsSecMaxLength")]
    pub read_iops_sec_max_length: u64,
    #[serde(rename = "SizeIopsSec")]
    pub size_iops_sec: u64,
    #[serde(rename = "TotalBytesSec")]
    pub total_bytes_sec: u64,
    #[serde(rename = "TotalBytesSecMax")]
    pub total_bytes_sec_max: u64,
    #[serde(rename = "TotalBytesSecMaxLength")]
    pub total_bytes_sec_max_length: u64,
    #[serde(rename = "TotalIopsSec")]
    pub total_iops_sec: u64,
    #[serde(rename = "TotalIopsSecMax")]
    pub total_iops_sec_max: u64,
    #[serde(rename = "TotalIopsSecMaxLength")]
    pub total_iops_sec_max_length: u64,
    #[serde(rename = "WriteBytesSec")]
    pub write_bytes_sec: u64,
    #[serde(rename = "WriteBytesSecMax")]
    pub write_bytes_sec_max: u64,
    #[serde(rename = "WriteBytesSecMaxLength")]
    pub write_bytes_sec_max_length: u64,
    #[serde(rename = "WriteIopsSec")]
    pub write_iops_sec: u64,
    #[serde(rename = "WriteIopsSecMax")]
    pub write_iops_sec_max: u64,
    #[serde(rename = "WriteIopsSecMaxLength")]
    pub write_iops_sec_max_length: u64,
    #[serde(rename = "GroupName")]
    pub group_name: String,
}

/// The subset of the I/O limits a caller may change. Read/write IOPS with
/// their burst ceilings; everything else is left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoTuneUpdate {
    pub read_iops_sec: u64,
    pub read_iops_sec_max: u64,
    pub read_iops_sec_max_length: u64,
    pub write_iops_sec: u64,
    pub write_iops_sec_max: u64,
    pub write_iops_sec_max_length: u64,
}

/// Whole-domain block I/O weights (virsh blkiotune).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlkioParams {
    #[serde(rename = "Weight")]
    pub weight: u32,
    #[serde(rename = "DeviceWeight")]
    pub device_weight: String,
    #[serde(rename = "DeviceReadIops")]
    pub device_read_iops: String,
    #[serde(rename = "DeviceWriteIops")]
    pub device_write_iops: String,
    #[serde(rename = "DeviceReadBps")]
    pub device_read_bps: String,
    #[serde(rename = "DeviceWriteBps")]
    pub device_write_bps: String,
}

/// Scheduler parameters (virsh schedinfo).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerParams {
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(rename = "CPUShares")]
    pub cpu_shares: u64,
    #[serde(rename = "GlobalPeriod")]
    pub global_period: u64,
    #[serde(rename = "GlobalQuota")]
    pub global_quota: i64,
    #[serde(rename = "VcpuPeriod")]
    pub vcpu_period: u64,
    #[serde(rename = "VcpuQuota")]
    pub vcpu_quota: i64,
    #[serde(rename = "EmulatorPeriod")]
    pub emulator_period: u64,
    #[serde(rename = "EmulatorQuota")]
    pub emulator_quota: i64,
    #[serde(rename = "IothreadPeriod")]
    pub iothread_period: u64,
    #[serde(rename = "IothreadQuota")]
    pub iothread_quota: i64,
}

/// Hypervisor node hardware summary (virNodeGetInfo).
#[derive(Debug, Clone, Default)]
pub struct NodeHardware {
    pub model: String,
    /// Total memory in KiB.
    pub memory_kib: u64,
    pub cpus: u32,
    pub mhz: u32,
    pub nodes: u32,
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

/// Node-wide CPU time counters, nanoseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCpuStats {
    pub kernel: u64,
    pub user: u64,
    pub idle: u64,
    pub iowait: u64,
    pub interrupt: u64,
    pub utilization: u64,
}

/// Node memory figures parsed out of /proc/meminfo, all KiB.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeMemoryStats {
    #[serde(rename = "Total")]
    pub total: u64,
    #[serde(rename = "Available")]
    pub available: u64,
    #[serde(rename = "Used")]
    pub used: u64,
    #[serde(rename = "Free")]
    pub free: u64,
    #[serde(rename = "Cached")]
    pub cached: u64,
    #[serde(rename = "Buffers")]
    pub buffers: u64,
    #[serde(rename = "SwapTotal")]
    pub swap_total: u64,
    #[serde(rename = "SwapFree")]
    pub swap_free: u64,
    #[serde(rename = "SwapCached")]
    pub swap_cached: u64,
}

/// Storage pool runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolState {
    Inactive,
    Building,
    Running,
    Degraded,
    Inaccessible,
    #[default]
    Unknown,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Inactive => "STORAGE_POOL_INACTIVE",
            PoolState::Building => "STORAGE_POOL_BUILDING",
            PoolState::Running => "STORAGE_POOL_RUNNING",
            PoolState::Degraded => "STORAGE_POOL_DEGRADED",
            PoolState::Inaccessible => "STORAGE_POOL_INACCESSIBLE",
            PoolState::Unknown => "STORAGE_POOL_UNKNOWN",
        }
    }
}

/// Storage pool capacity snapshot, sizes in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolInfo {
    pub state: PoolState,
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
}

/// Which pools a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFilter {
    /// Directory-backed pools regardless of state.
    Directory,
    /// Directory-backed pools that are currently active.
    DirectoryActive,
    /// Active and persistent pools of any backend.
    ActivePersistent,
}

/// A resolved storage volume: the typed "it exists" outcome of a lookup by
/// path, as opposed to `None` for absence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    pub pool: String,
    pub name: String,
    pub path: String,
}

/// Snapshot list filters, one per libvirt list flag the API exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFilter {
    All,
    Roots,
    Internal,
    External,
    DiskOnly,
    Active,
    Inactive,
    Metadata,
    NoMetadata,
    Leaves,
    NoLeaves,
}

/// Flags for snapshot creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCreateFlags {
    pub disk_only: bool,
    pub quiesce: bool,
    pub atomic: bool,
    pub no_metadata: bool,
    pub halt: bool,
}

impl SnapshotCreateFlags {
    /// Flag set used for the live-backup external snapshot.
    pub fn external_backup() -> Self {
        SnapshotCreateFlags {
            disk_only: true,
            quiesce: true,
            atomic: true,
            no_metadata: true,
            halt: false,
        }
    }

    /// Flag set used for an internal snapshot of a stopped domain.
    pub fn internal_halt() -> Self {
        SnapshotCreateFlags {
            disk_only: false,
            quiesce: false,
            atomic: true,
            no_metadata: false,
            halt: true,
        }
    }
}
