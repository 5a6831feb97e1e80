//! New-domain provisioning: ordered validation, template clone and define.

use tracing::{error, info};

use crate::error::{Error, Result};
use crate::ident::{gen_uuid, validate_domain_name, validate_mac, validate_uuid};
use crate::sriov::network_vf_usage;
use crate::storage::{clone_volume_by_name, new_domain_image_path};
use crate::traits::Hypervisor;
use crate::types::PoolState;
use crate::xml::domain::DomainXmlBuilder;

/// Hard floor for guest memory, KiB.
const MIN_MEMORY_KIB: u64 = 256 * 1024;
/// A pool must keep this much headroom to accept a new image, bytes.
const MIN_POOL_AVAILABLE: u64 = 50 * 1024 * 1024 * 1024;
/// Ceiling for hot-pluggable vCPUs of a new domain.
const DEFAULT_MAX_VCPUS: u32 = 16;

/// Everything `Create` needs.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub uuid: String,
    pub name: String,
    pub vcpus: u32,
    pub memory_kib: u64,
    pub storage: String,
    pub template: String,
    pub network: String,
    pub mac: String,
    pub vlan: u32,
}

async fn validate_name_available(hv: &dyn Hypervisor, name: &str) -> Result<()> {
    validate_domain_name(name)?;
    if hv.domain_exists(name).await? {
        return Err(Error::validation(format!("domain: {} already exists", name)));
    }
    Ok(())
}

async fn validate_vcpus(hv: &dyn Hypervisor, vcpus: u32) -> Result<()> {
    if vcpus == 0 {
        return Err(Error::validation("vCPU can not be 0"));
    }
    let node = hv.node_info().await?;
    if vcpus > node.cpus {
        return Err(Error::validation(format!(
            "amount of vCPUs: {} are greater than physically available hypervisor cores: {}",
            vcpus, node.cpus
        )));
    }
    Ok(())
}

async fn validate_memory(hv: &dyn Hypervisor, memory_kib: u64) -> Result<()> {
    if memory_kib == 0 {
        return Err(Error::validation("memory can not be 0"));
    }
    if memory_kib < MIN_MEMORY_KIB {
        return Err(Error::validation("memory can not be lesser that 256 MB"));
    }
    let stats = hv.node_memory_stats().await?;
    let max_memory = 2 * memory_kib;
    if max_memory > stats.available {
        return Err(Error::validation(format!(
            "amount of maximum memory for domain: {} KiB is greater than available memory on hypervisor: {} KiB",
            max_memory, stats.available
        )));
    }
    Ok(())
}

async fn validate_storage(hv: &dyn Hypervisor, pool: &str) -> Result<()> {
    if pool.is_empty() {
        return Err(Error::validation("storage pool name can not be empty"));
    }
    let info = hv.pool_info(pool).await?;
    if info.state != PoolState::Running {
        return Err(Error::validation(format!(
            "storage pool {} is not running normally",
            pool
        )));
    }
    if info.available < MIN_POOL_AVAILABLE {
        return Err(Error::validation(format!(
            "storage pool {} free space at critical levels: {} bytes",
            pool, info.available
        )));
    }
    Ok(())
}

async fn validate_template(hv: &dyn Hypervisor, pool: &str, template: &str) -> Result<()> {
    let volumes = hv.pool_volume_names(pool).await?;
    if volumes.iter().any(|v| v == template) {
        return Ok(());
    }
    Err(Error::validation(format!(
        "failed to find template: {} in storage {}",
        template, pool
    )))
}

async fn validate_network_vf(hv: &dyn Hypervisor, network: &str) -> Result<()> {
    if network.is_empty() {
        return Err(Error::validation("network name can not be empty"));
    }
    if !hv.network_exists(network).await? {
        return Err(Error::validation(format!(
            "network {} does not exist",
            network
        )));
    }
    let (used, total) = network_vf_usage(hv, network).await?;
    if used >= total {
        return Err(Error::validation("no empty network VF available"));
    }
    Ok(())
}

/// The full validation chain of `Create`, in order; the first failure wins.
async fn validate_create(hv: &dyn Hypervisor, req: &CreateRequest) -> Result<()> {
    validate_uuid(&req.uuid)?;
    validate_name_available(hv, &req.name).await?;
    validate_vcpus(hv, req.vcpus).await?;
    validate_memory(hv, req.memory_kib).await?;
    validate_storage(hv, &req.storage).await?;
    validate_template(hv, &req.storage, &req.template).await?;
    validate_network_vf(hv, &req.network).await?;
    validate_mac(&req.mac)?;
    Ok(())
}

/// `CheckResources`: the subset of the chain a caller can answer without
/// naming a template, UUID or MAC.
pub async fn check_resources(
    hv: &dyn Hypervisor,
    name: &str,
    vcpus: u32,
    memory_kib: u64,
    storage: &str,
    network: &str,
) -> Result<()> {
    validate_name_available(hv, name).await?;
    validate_vcpus(hv, vcpus).await?;
    validate_memory(hv, memory_kib).await?;
    validate_storage(hv, storage).await?;
    validate_network_vf(hv, network).await?;
    Ok(())
}

/// Define a new domain: validate, render the domain XML, clone the
/// template image to `<pool>/<name>.qcow2`, then define with schema
/// validation. Returns the UUID the domain was created with.
pub async fn create(hv: &dyn Hypervisor, mut req: CreateRequest) -> Result<String> {
    if req.uuid.is_empty() {
        req.uuid = gen_uuid();
    }

    if let Err(e) = validate_create(hv, &req).await {
        error!(domain = %req.name, error = %e, "failed to validate domain options");
        return Err(Error::validation(format!(
            "failed to validate domain options: {}",
            e
        )));
    }

    let image_path = new_domain_image_path(hv, &req.name, &req.storage)
        .await
        .map_err(|e| {
            error!(domain = %req.name, error = %e, "failed to allocate name for domain image");
            e
        })?;
    info!(domain = %req.name, image = %image_path, "allocated name for domain image");

    let xml = DomainXmlBuilder {
        uuid: req.uuid.clone(),
        name: req.name.clone(),
        vcpus: req.vcpus,
        max_vcpus: DEFAULT_MAX_VCPUS,
        memory_kib: req.memory_kib,
        max_memory_kib: 2 * req.memory_kib,
        image_path,
        network: req.network.clone(),
        mac: req.mac.clone(),
        vlan: req.vlan,
    }
    .build();

    clone_volume_by_name(
        hv,
        &req.storage,
        &req.template,
        &format!("{}.qcow2", req.name),
    )
    .await?;

    hv.define_domain(&xml).await?;
    info!(domain = %req.name, uuid = %req.uuid, "defined domain");

    Ok(req.uuid)
}
