//! Storage pool and volume operations above the seam.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::traits::Hypervisor;
use crate::types::PoolFilter;
use crate::xml::{pool, volume};

/// Refresh usage statistics of every active directory-based pool. A pool
/// that fails to refresh is skipped, not fatal.
pub async fn refresh_all_pools(hv: &dyn Hypervisor) -> Result<()> {
    for name in hv.list_pool_names(PoolFilter::DirectoryActive).await? {
        if let Err(e) = hv.refresh_pool(&name).await {
            warn!(pool = %name, error = %e, "failed to refresh storage pool");
        }
    }
    Ok(())
}

/// The target filesystem path of a pool.
pub async fn pool_path(hv: &dyn Hypervisor, name: &str) -> Result<String> {
    pool::target_path(&hv.pool_xml(name).await?)
}

/// The image path a new domain will own inside `pool`, refusing names that
/// already resolve to a volume.
pub async fn new_domain_image_path(
    hv: &dyn Hypervisor,
    domain: &str,
    pool: &str,
) -> Result<String> {
    let base = pool_path(hv, pool).await?;
    let image_path = format!("{}/{}.qcow2", base.trim_end_matches('/'), domain);
    if hv.find_volume_by_path(&image_path).await?.is_some() {
        return Err(Error::validation(format!("image: {} exists", image_path)));
    }
    Ok(image_path)
}

/// Clone volume `left` to `right` inside `storage` by rewriting the source
/// volume XML: fresh identity, accounting stripped, format preserved.
pub async fn clone_volume_by_name(
    hv: &dyn Hypervisor,
    storage: &str,
    left: &str,
    right: &str,
) -> Result<()> {
    let base = pool_path(hv, storage).await?;
    let target_path = format!("{}/{}", base.trim_end_matches('/'), right);

    let source_xml = hv.volume_xml(storage, left).await?;
    let clone_xml = volume::clone_volume_xml(&source_xml, right, &target_path)?;

    hv.clone_volume(storage, left, &clone_xml).await?;
    info!(
        pool = %storage,
        from = %left,
        to = %target_path,
        "cloned storage volume"
    );
    Ok(())
}

/// The `CloneImage` operation: refresh the directory pools, then clone.
pub async fn clone_image(
    hv: &dyn Hypervisor,
    storage: &str,
    left: &str,
    right: &str,
) -> Result<()> {
    refresh_all_pools(hv).await?;
    clone_volume_by_name(hv, storage, left, right).await
}
