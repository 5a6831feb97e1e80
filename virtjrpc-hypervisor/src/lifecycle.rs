//! Domain lifecycle and tuning operations.
//!
//! Start/shutdown/reboot/reset are passthroughs on the seam. Destroy is a
//! composite: archive every disk, tear the domain down, then sweep its
//! volumes out of the pools. The tuning setters share one pattern: compute
//! CONFIG/LIVE from the persistent/active flags, then call the native
//! setter.

use tracing::{error, info};

use crate::archive;
use crate::error::{Error, Result};
use crate::traits::Hypervisor;
use crate::types::{AffectFlags, IoTuneUpdate, PoolFilter};
use crate::xml::domain::block_device_paths;

/// Burst ceiling offsets and window lengths applied on top of the base
/// read/write IOPS figures.
const READ_IOPS_BURST_MARGIN: u64 = 100;
const WRITE_IOPS_BURST_MARGIN: u64 = 50;
const READ_IOPS_BURST_SECS: u64 = 15;
const WRITE_IOPS_BURST_SECS: u64 = 5;

/// CONFIG when the definition persists, LIVE when the domain runs.
pub async fn affect_flags(hv: &dyn Hypervisor, domain: &str) -> Result<AffectFlags> {
    let runtime = hv.domain_runtime(domain).await?;
    Ok(AffectFlags {
        config: runtime.persistent,
        live: runtime.active,
    })
}

pub async fn set_current_memory(hv: &dyn Hypervisor, domain: &str, kib: u64) -> Result<()> {
    let affect = affect_flags(hv, domain).await?;
    hv.set_memory(domain, kib, affect).await?;
    info!(domain, kib, "current available memory for domain set");
    Ok(())
}

pub async fn set_memory_stats_period(
    hv: &dyn Hypervisor,
    domain: &str,
    period_secs: i32,
) -> Result<()> {
    let affect = affect_flags(hv, domain).await?;
    hv.set_memory_stats_period(domain, period_secs, affect).await?;
    info!(domain, period_secs, "memory stats collection period set");
    Ok(())
}

pub async fn set_current_vcpus(hv: &dyn Hypervisor, domain: &str, count: u32) -> Result<()> {
    let affect = affect_flags(hv, domain).await?;
    hv.set_vcpus(domain, count, affect).await?;
    info!(domain, count, "current online vCPUs for domain set");
    Ok(())
}

pub async fn set_scheduler_cpu_shares(
    hv: &dyn Hypervisor,
    domain: &str,
    shares: u64,
) -> Result<()> {
    let affect = affect_flags(hv, domain).await?;
    hv.set_scheduler_cpu_shares(domain, shares, affect).await?;
    info!(domain, shares, "scheduler CPU shares for domain set");
    Ok(())
}

/// Set read/write IOPS caps on one block device, deriving the burst
/// ceilings and their windows from the base values.
pub async fn set_device_iops(
    hv: &dyn Hypervisor,
    domain: &str,
    device: &str,
    read: u64,
    write: u64,
) -> Result<()> {
    let affect = affect_flags(hv, domain).await?;
    let update = IoTuneUpdate {
        read_iops_sec: read,
        read_iops_sec_max: read + READ_IOPS_BURST_MARGIN,
        read_iops_sec_max_length: READ_IOPS_BURST_SECS,
        write_iops_sec: write,
        write_iops_sec_max: write + WRITE_IOPS_BURST_MARGIN,
        write_iops_sec_max_length: WRITE_IOPS_BURST_SECS,
    };
    hv.set_block_io_tune(domain, device, update, affect).await?;
    info!(domain, device, read, write, "block device IOPS caps set");
    Ok(())
}

/// Tear a domain down for good:
///
/// 1. archive every block path (a failed archive aborts the destroy),
/// 2. destroy if active (graceful), undefine if persistent (managed save,
///    snapshot metadata and NVRAM removed with it),
/// 3. refresh every active persistent pool and delete the volumes backing
///    the former block paths,
/// 4. verify the paths no longer resolve to volumes.
pub async fn destroy(hv: &dyn Hypervisor, domain: &str) -> Result<()> {
    let xml = hv.domain_xml(domain, false).await?;
    let paths = block_device_paths(&xml)?;

    for path in &paths {
        archive::create_backup(path)?;
    }

    let runtime = hv.domain_runtime(domain).await?;
    if runtime.active {
        hv.destroy_domain(domain, true).await?;
        info!(domain, "domain destroyed");
    }
    if runtime.persistent {
        hv.undefine_domain(domain).await?;
        info!(domain, "domain undefined");
    }

    let pools = hv.list_pool_names(PoolFilter::ActivePersistent).await?;
    if pools.is_empty() {
        return Err(Error::native("pool array can not be zero sized"));
    }

    for pool in pools {
        if hv.refresh_pool(&pool).await.is_err() {
            continue;
        }
        let Ok(volumes) = hv.pool_volume_names(&pool).await else {
            continue;
        };
        for vol in volumes {
            let Ok(vol_xml) = hv.volume_xml(&pool, &vol).await else {
                continue;
            };
            let Ok(desc) = crate::xml::volume::parse(&vol_xml) else {
                continue;
            };
            let Some(vol_path) = desc.target_path else {
                continue;
            };
            if paths.iter().any(|p| *p == vol_path) {
                if let Err(e) = hv.delete_volume(&pool, &vol).await {
                    error!(pool = %pool, volume = %vol, error = %e, "failed to delete volume");
                }
            }
        }
    }

    for path in &paths {
        if hv.find_volume_by_path(path).await?.is_some() {
            error!(domain, path = %path, "failed to remove volume backing former block path");
        }
    }

    info!(domain, "destroyed domain");
    Ok(())
}
