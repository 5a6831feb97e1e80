//! The method table: every JSON-RPC method, each following the same
//! sequence. Acquire the registry entry for the resource, open a session,
//! consult the safety gate, run the operation, release everything in
//! reverse by dropping the guards.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use virtjrpc_hypervisor::backup::BackupConfig;
use virtjrpc_hypervisor::gate::{self, Mutation};
use virtjrpc_hypervisor::types::AccessMode;
use virtjrpc_hypervisor::{create, ident, info, lifecycle, snapshot, sriov, storage};
use virtjrpc_hypervisor::{Connector, Hypervisor};

use crate::limit::TokenBucket;
use crate::locks::{LockGuard, LockRegistry, DEFAULT_WAIT_SECS, LOCAL_HYPERVISOR, SLOW_WAIT_SECS};

use super::{parse_params, RpcError};

/// Shared state of the RPC surface.
pub struct AppState {
    pub connector: Arc<dyn Connector>,
    pub locks: Arc<LockRegistry>,
    pub limiter: TokenBucket,
    pub backup: BackupConfig,
    pub sriov_settle: Duration,
}

impl AppState {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        AppState {
            connector,
            locks: LockRegistry::new(),
            limiter: TokenBucket::default(),
            backup: BackupConfig::default(),
            sriov_settle: sriov::DEFAULT_SETTLE,
        }
    }
}

fn refused() -> RpcError {
    RpcError::server_error("thread safety lock, function is temporarily unavailable")
}

fn server_err(e: virtjrpc_hypervisor::Error) -> RpcError {
    RpcError::server_error(e.to_string())
}

async fn lock(state: &AppState, key: &str, budget: u32) -> Result<LockGuard, RpcError> {
    state.locks.acquire(key, budget).await.ok_or_else(refused)
}

async fn connect(state: &AppState, mode: AccessMode) -> Result<Box<dyn Hypervisor>, RpcError> {
    state.connector.connect(mode).await.map_err(server_err)
}

// -- param shapes ----------------------------------------------------------

#[derive(Deserialize)]
struct DomainParams {
    #[serde(rename = "Domain")]
    domain: String,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(rename = "Search", default)]
    search: String,
}

#[derive(Deserialize)]
struct PvidParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "MAC")]
    mac: String,
    #[serde(rename = "PVID")]
    pvid: u32,
}

#[derive(Deserialize)]
struct SpeedParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Speed")]
    speed: u32,
}

#[derive(Deserialize)]
struct PasswordParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "VMUser")]
    user: String,
    #[serde(rename = "VMPassword")]
    password: String,
}

#[derive(Deserialize)]
struct MemoryParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Memory")]
    memory_kib: u64,
}

#[derive(Deserialize)]
struct PeriodParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Period")]
    period_secs: i32,
}

#[derive(Deserialize)]
struct VcpuParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "VCPUsNum")]
    vcpus: u32,
}

#[derive(Deserialize)]
struct SharesParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "CPUShares")]
    shares: u64,
}

#[derive(Deserialize)]
struct IopsParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Device")]
    device: String,
    #[serde(rename = "Read")]
    read: u64,
    #[serde(rename = "Write")]
    write: u64,
}

#[derive(Deserialize)]
struct AutostartParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Autostart")]
    autostart: bool,
}

#[derive(Deserialize)]
struct SnapshotParams {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct CloneParams {
    #[serde(rename = "Storage")]
    storage: String,
    #[serde(rename = "LeftImageName")]
    left: String,
    #[serde(rename = "RightImageName")]
    right: String,
}

#[derive(Deserialize)]
struct CreateParams {
    #[serde(rename = "UUID", default)]
    uuid: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "VCPU")]
    vcpus: u32,
    #[serde(rename = "Memory")]
    memory_kib: u64,
    #[serde(rename = "Storage")]
    storage: String,
    #[serde(rename = "Template")]
    template: String,
    #[serde(rename = "Network")]
    network: String,
    #[serde(rename = "MAC")]
    mac: String,
    #[serde(rename = "VLAN")]
    vlan: u32,
}

#[derive(Deserialize)]
struct CheckParams {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "VCPU")]
    vcpus: u32,
    #[serde(rename = "Memory")]
    memory_kib: u64,
    #[serde(rename = "Storage")]
    storage: String,
    #[serde(rename = "Network")]
    network: String,
}

// -- dispatch --------------------------------------------------------------

pub async fn dispatch(
    state: &AppState,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    match method {
        "Ping" => Ok(json!(true)),
        "GenUUID" => Ok(json!(ident::gen_uuid())),
        "GenMAC" => Ok(json!(ident::gen_mac())),

        "Lock" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            state.locks.insert(&p.domain).await;
            Ok(json!(true))
        }
        "UnLock" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            state.locks.remove(&p.domain).await;
            Ok(json!(true))
        }
        "ListLocks" => Ok(json!(state.locks.list())),

        "HypervisorInfo" => hypervisor_info(state).await,
        "RefreshAllStorgePools" => refresh_all_pools(state).await,
        "Info" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            domain_info(state, p.domain).await
        }
        "QemuAgentInfo" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            qemu_agent_info(state, p.domain).await
        }
        "Domains" => {
            let p: SearchParams = parse_params(params, &["Search"])?;
            list_domains(state, p.search).await
        }

        "SetPVIDForNetworkDevice" => {
            let p: PvidParams = parse_params(params, &["Domain", "MAC", "PVID"])?;
            set_pvid(state, p).await
        }
        "SetNetworkSpeed" => {
            let p: SpeedParams = parse_params(params, &["Domain", "Speed"])?;
            set_network_speed(state, p).await
        }
        "SetPassword" => {
            let p: PasswordParams =
                parse_params(params, &["Domain", "VMUser", "VMPassword"])?;
            set_password(state, p).await
        }
        "SetMemory" => {
            let p: MemoryParams = parse_params(params, &["Domain", "Memory"])?;
            set_memory(state, p).await
        }
        "SetMemoryStatsPeriod" => {
            let p: PeriodParams = parse_params(params, &["Domain", "Period"])?;
            set_memory_stats_period(state, p).await
        }
        "SetMaxMemory" => {
            let p: MemoryParams = parse_params(params, &["Domain", "Memory"])?;
            set_max_memory(state, p).await
        }
        "SetVCPUs" => {
            let p: VcpuParams = parse_params(params, &["Domain", "VCPUsNum"])?;
            set_vcpus(state, p).await
        }
        "SetMaxVCPUs" => {
            let p: VcpuParams = parse_params(params, &["Domain", "VCPUsNum"])?;
            set_max_vcpus(state, p).await
        }
        "SetDomainSchedulerCPUShares" => {
            let p: SharesParams = parse_params(params, &["Domain", "CPUShares"])?;
            set_cpu_shares(state, p).await
        }
        "SetDomainDeviceIOPS" => {
            let p: IopsParams =
                parse_params(params, &["Domain", "Device", "Read", "Write"])?;
            set_device_iops(state, p).await
        }
        "SetAutostart" => {
            let p: AutostartParams = parse_params(params, &["Domain", "Autostart"])?;
            set_autostart(state, p).await
        }

        "Reboot" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            plain_lifecycle(state, p.domain, LifecycleOp::Reboot).await
        }
        "Shutdown" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            plain_lifecycle(state, p.domain, LifecycleOp::Shutdown).await
        }
        "Reset" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            plain_lifecycle(state, p.domain, LifecycleOp::Reset).await
        }
        "Start" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            plain_lifecycle(state, p.domain, LifecycleOp::Start).await
        }
        "Destroy" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            destroy(state, p.domain).await
        }

        "MakeSnapshot" => {
            let p: SnapshotParams = parse_params(params, &["Domain", "Name"])?;
            make_snapshot(state, p).await
        }
        "RemoveSnapshot" => {
            let p: SnapshotParams = parse_params(params, &["Domain", "Name"])?;
            remove_snapshot(state, p).await
        }
        "RevertToSnapshot" => {
            let p: SnapshotParams = parse_params(params, &["Domain", "Name"])?;
            revert_to_snapshot(state, p).await
        }
        "MakeBackup" => {
            let p: DomainParams = parse_params(params, &["Domain"])?;
            make_backup(state, p.domain).await
        }

        "CloneImage" => {
            let p: CloneParams =
                parse_params(params, &["Storage", "LeftImageName", "RightImageName"])?;
            clone_image(state, p).await
        }
        "Create" => {
            let p: CreateParams = parse_params(
                params,
                &[
                    "UUID", "Name", "VCPU", "Memory", "Storage", "Template", "Network",
                    "MAC", "VLAN",
                ],
            )?;
            create_domain(state, p).await
        }
        "CheckResources" => {
            let p: CheckParams =
                parse_params(params, &["Name", "VCPU", "Memory", "Storage", "Network"])?;
            check_resources(state, p).await
        }

        _ => Err(RpcError::method_not_found(method)),
    }
}

// -- read methods ----------------------------------------------------------

async fn hypervisor_info(state: &AppState) -> Result<Value, RpcError> {
    let _guard = lock(state, LOCAL_HYPERVISOR, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadOnly).await?;
    let response = info::node_info_response(hv.as_ref())
        .await
        .map_err(server_err)?;
    serde_json::to_value(response).map_err(|e| RpcError::server_error(e.to_string()))
}

async fn refresh_all_pools(state: &AppState) -> Result<Value, RpcError> {
    let _guard = lock(state, LOCAL_HYPERVISOR, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;
    storage::refresh_all_pools(hv.as_ref())
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn domain_info(state: &AppState, domain: String) -> Result<Value, RpcError> {
    let _guard = lock(state, &domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadOnly).await?;
    let response = info::domain_info(hv.as_ref(), &domain)
        .await
        .map_err(server_err)?;
    serde_json::to_value(response).map_err(|e| RpcError::server_error(e.to_string()))
}

async fn qemu_agent_info(state: &AppState, domain: String) -> Result<Value, RpcError> {
    let _guard = lock(state, &domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &domain)
        .await
        .map_err(server_err)?;
    gate::require_active_for_agent(&cond).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    let response = info::qemu_agent_info(hv.as_ref(), &domain).await;
    serde_json::to_value(response).map_err(|e| RpcError::server_error(e.to_string()))
}

async fn list_domains(state: &AppState, search: String) -> Result<Value, RpcError> {
    let _guard = lock(state, LOCAL_HYPERVISOR, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadOnly).await?;

    let names = hv.list_domain_names().await.map_err(server_err)?;
    let needle = search.to_lowercase();
    let matched: Vec<String> = names
        .into_iter()
        .filter(|n| needle.is_empty() || n.to_lowercase().starts_with(&needle))
        .collect();
    Ok(json!(matched))
}

// -- SR-IOV and guest methods ----------------------------------------------

async fn set_pvid(state: &AppState, p: PvidParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    sriov::set_pvid(hv.as_ref(), &p.domain, &p.mac, p.pvid, state.sriov_settle)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_network_speed(state: &AppState, p: SpeedParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    sriov::set_network_rate(hv.as_ref(), &p.domain, p.speed)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_password(state: &AppState, p: PasswordParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_active_for_password(&cond).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    hv.set_user_password(&p.domain, &p.user, &p.password)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

// -- tuning methods --------------------------------------------------------

async fn set_memory(state: &AppState, p: MemoryParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    lifecycle::set_current_memory(hv.as_ref(), &p.domain, p.memory_kib)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_memory_stats_period(state: &AppState, p: PeriodParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    lifecycle::set_memory_stats_period(hv.as_ref(), &p.domain, p.period_secs)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_max_memory(state: &AppState, p: MemoryParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_inactive(&cond, Mutation::SetMaxMemory).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    hv.set_max_memory(&p.domain, p.memory_kib)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_vcpus(state: &AppState, p: VcpuParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    lifecycle::set_current_vcpus(hv.as_ref(), &p.domain, p.vcpus)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_max_vcpus(state: &AppState, p: VcpuParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_inactive(&cond, Mutation::SetMaxVcpus).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    hv.set_max_vcpus(&p.domain, p.vcpus)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_cpu_shares(state: &AppState, p: SharesParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    lifecycle::set_scheduler_cpu_shares(hv.as_ref(), &p.domain, p.shares)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_device_iops(state: &AppState, p: IopsParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    lifecycle::set_device_iops(hv.as_ref(), &p.domain, &p.device, p.read, p.write)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn set_autostart(state: &AppState, p: AutostartParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    hv.set_autostart(&p.domain, p.autostart)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

// -- lifecycle methods -----------------------------------------------------

enum LifecycleOp {
    Start,
    Shutdown,
    Reboot,
    Reset,
}

async fn plain_lifecycle(
    state: &AppState,
    domain: String,
    op: LifecycleOp,
) -> Result<Value, RpcError> {
    let _guard = lock(state, &domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample_basic(hv.as_ref(), &domain)
        .await
        .map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;

    match op {
        LifecycleOp::Start => hv.start_domain(&domain).await,
        LifecycleOp::Shutdown => hv.shutdown_domain(&domain).await,
        LifecycleOp::Reboot => hv.reboot_domain(&domain).await,
        LifecycleOp::Reset => hv.reset_domain(&domain).await,
    }
    .map_err(server_err)?;
    Ok(json!(true))
}

async fn destroy(state: &AppState, domain: String) -> Result<Value, RpcError> {
    let _guard = lock(state, &domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample(hv.as_ref(), &domain).await.map_err(server_err)?;
    gate::require_inactive(&cond, Mutation::Destroy).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;
    gate::require_no_backup_leftover(&cond).map_err(server_err)?;

    lifecycle::destroy(hv.as_ref(), &domain)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

// -- snapshot methods ------------------------------------------------------

async fn make_snapshot(state: &AppState, p: SnapshotParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_inactive(&cond, Mutation::MakeSnapshot).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;
    gate::require_no_backup_leftover(&cond).map_err(server_err)?;

    snapshot::make_internal_snapshot(hv.as_ref(), &p.domain, &p.name)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn remove_snapshot(state: &AppState, p: SnapshotParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_inactive(&cond, Mutation::DeleteSnapshot).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;
    gate::require_no_backup_leftover(&cond).map_err(server_err)?;

    snapshot::remove_snapshot(hv.as_ref(), &p.domain, &p.name)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn revert_to_snapshot(state: &AppState, p: SnapshotParams) -> Result<Value, RpcError> {
    let _guard = lock(state, &p.domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    let cond = gate::sample(hv.as_ref(), &p.domain)
        .await
        .map_err(server_err)?;
    gate::require_inactive(&cond, Mutation::RevertSnapshot).map_err(server_err)?;
    gate::require_no_block_job(&cond).map_err(server_err)?;
    gate::require_no_backup_leftover(&cond).map_err(server_err)?;

    snapshot::revert_to_snapshot(hv.as_ref(), &p.domain, &p.name)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn make_backup(state: &AppState, domain: String) -> Result<Value, RpcError> {
    let _guard = lock(state, &domain, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    virtjrpc_hypervisor::backup::make_backup(hv.as_ref(), &domain, &state.backup)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

// -- provisioning methods --------------------------------------------------

async fn clone_image(state: &AppState, p: CloneParams) -> Result<Value, RpcError> {
    let key = format!("{}|{}", p.storage, p.left);
    let _guard = lock(state, &key, SLOW_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    storage::clone_image(hv.as_ref(), &p.storage, &p.left, &p.right)
        .await
        .map_err(server_err)?;
    Ok(json!(true))
}

async fn create_domain(state: &AppState, p: CreateParams) -> Result<Value, RpcError> {
    let _guard = lock(state, LOCAL_HYPERVISOR, SLOW_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadWrite).await?;

    create::create(
        hv.as_ref(),
        create::CreateRequest {
            uuid: p.uuid,
            name: p.name,
            vcpus: p.vcpus,
            memory_kib: p.memory_kib,
            storage: p.storage,
            template: p.template,
            network: p.network,
            mac: p.mac,
            vlan: p.vlan,
        },
    )
    .await
    .map_err(server_err)?;
    Ok(json!(true))
}

async fn check_resources(state: &AppState, p: CheckParams) -> Result<Value, RpcError> {
    let _guard = lock(state, LOCAL_HYPERVISOR, DEFAULT_WAIT_SECS).await?;
    let hv = connect(state, AccessMode::ReadOnly).await?;

    create::check_resources(
        hv.as_ref(),
        &p.name,
        p.vcpus,
        p.memory_kib,
        &p.storage,
        &p.network,
    )
    .await
    .map_err(server_err)?;
    Ok(json!(true))
}
