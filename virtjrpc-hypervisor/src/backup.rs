//! Live backup of a running domain: external snapshot, archive, active
//! block commit, pivot, overlay cleanup.
//!
//! The sequence never stops the guest. A DISK_ONLY quiesced snapshot
//! redirects writes into per-disk overlay files, the now frozen originals
//! are archived, and an active shallow block commit merges the overlays
//! back before pivoting each disk onto its original file. A failure after
//! the snapshot leaves the overlay in the chain on purpose: the safety
//! gate keeps refusing mutations on the domain until an operator resolves
//! the leftover.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::archive;
use crate::error::{Error, Result};
use crate::gate;
use crate::storage::refresh_all_pools;
use crate::traits::Hypervisor;
use crate::types::{BlockJobKind, SnapshotCreateFlags};
use crate::xml::domain::{block_device_names, block_device_paths, parse_disks};
use crate::xml::snapshot::build_snapshot_xml;

/// Name given to the backup snapshot; libvirt derives the overlay file
/// names from it, `<disk>.external.snapshot.qcow2`.
pub const SNAPSHOT_NAME: &str = "external.snapshot.qcow2";

/// Timing knobs of the commit wait loop. The defaults poll every 5 s,
/// require 3 consecutive completed probes and give up after an hour.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub poll_interval: Duration,
    pub stable_probes: u32,
    pub wall_budget: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            poll_interval: Duration::from_secs(5),
            stable_probes: 3,
            wall_budget: Duration::from_secs(60 * 60),
        }
    }
}

/// Whether a snapshot-chain path may be deleted by the cleanup sweep.
/// Only overlay files under the libvirt image tree qualify, and only when
/// the path is free of globbing and traversal surprises.
pub fn overlay_deletable(path: &str) -> bool {
    path.starts_with("/var/lib/libvirt/")
        && path.ends_with(".external.snapshot.qcow2")
        && !path.contains(' ')
        && !path.contains("../")
        && !path.contains('*')
}

/// Wait for the active commit on `disk` to drain.
///
/// Two stop conditions, deliberately distinct: the job vanishing
/// (`cur == end == 0`) means it aborted underneath us, while progress
/// pinned at completion (`cur == end > 0`) for `stable_probes` consecutive
/// polls means the mirror is ready to pivot. Returns `false` only when the
/// wall-clock budget runs out.
pub async fn wait_block_commit(
    hv: &dyn Hypervisor,
    domain: &str,
    disk: &str,
    cfg: &BackupConfig,
) -> bool {
    let started = Instant::now();
    let mut stable = 0u32;

    loop {
        if started.elapsed() > cfg.wall_budget {
            warn!(domain, disk, "stopped waiting for active block job, timeout exceeded");
            return false;
        }
        if stable == cfg.stable_probes {
            info!(domain, disk, "stopped waiting for active block job");
            return true;
        }

        sleep(cfg.poll_interval).await;

        let Ok(job) = hv.block_job_info(domain, disk).await else {
            continue;
        };

        if job.cur == job.end && job.end == 0 {
            error!(domain, disk, "active block job stopped unexpectedly");
            return true;
        }

        if job.kind == BlockJobKind::ActiveCommit && job.cur == job.end && job.end > 0 {
            stable += 1;
            info!(
                domain,
                disk,
                cur = job.cur,
                end = job.end,
                probe = stable,
                "block commit pinned at completion"
            );
        } else {
            info!(domain, disk, cur = job.cur, end = job.end, "block commit in progress");
        }
    }
}

/// Delete the overlay files the snapshot left behind, each one gated by
/// the path policy. The pools are refreshed first so the overlays resolve
/// to volumes.
async fn delete_overlays(hv: &dyn Hypervisor, paths: &[String]) -> Result<()> {
    refresh_all_pools(hv).await?;

    for path in paths {
        if !overlay_deletable(path) {
            info!(path = %path, "safety check, not removing");
            continue;
        }

        let Some(vol) = hv.find_volume_by_path(path).await? else {
            return Err(Error::NotFound(format!(
                "no storage volume resolves to {}",
                path
            )));
        };
        hv.delete_volume(&vol.pool, &vol.name).await.map_err(|e| {
            error!(path = %path, error = %e, "failed to remove redundant external snapshot");
            e
        })?;
        info!(path = %path, "removed redundant external snapshot");
    }

    Ok(())
}

/// Run the full live-backup protocol against a running domain.
pub async fn make_backup(hv: &dyn Hypervisor, domain: &str, cfg: &BackupConfig) -> Result<()> {
    let condition = gate::sample(hv, domain).await?;
    gate::require_active_for_backup(&condition)?;
    gate::require_no_block_job(&condition)?;
    gate::require_no_backup_in_flight(&condition)?;

    let xml = hv.domain_xml(domain, false).await?;
    let disks = parse_disks(&xml)?;
    let snapshot_xml =
        build_snapshot_xml(domain, SNAPSHOT_NAME, &disks, false, Utc::now())?;

    // The paths before the snapshot are the data to archive: once the
    // overlay exists they become read-only backing files.
    let original_paths = block_device_paths(&xml)?;

    hv.create_snapshot(domain, &snapshot_xml, SnapshotCreateFlags::external_backup())
        .await?;
    info!(domain, "created external backup snapshot");

    for path in &original_paths {
        archive::create_backup(path)?;
    }

    let post_xml = hv.domain_xml(domain, false).await?;
    let devices = block_device_names(&post_xml)?;
    let overlay_paths = block_device_paths(&post_xml)?;

    for disk in &devices {
        hv.block_commit_active(domain, disk).await?;
        info!(domain, disk = %disk, "started active block commit");

        if !wait_block_commit(hv, domain, disk, cfg).await {
            continue;
        }

        hv.block_job_pivot(domain, disk).await?;
        info!(domain, disk = %disk, "pivoted active block commit");
    }

    delete_overlays(hv, &overlay_paths).await?;

    if gate::has_external_backup_leftover(hv, domain).await? {
        return Err(Error::native("domain backup job failed"));
    }

    info!(domain, "domain backup job succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_path_policy() {
        assert!(overlay_deletable(
            "/var/lib/libvirt/images/vm01.qcow2.external.snapshot.qcow2"
        ));
        // outside the image tree
        assert!(!overlay_deletable(
            "/etc/passwd.external.snapshot.qcow2"
        ));
        // wrong suffix
        assert!(!overlay_deletable("/var/lib/libvirt/images/vm01.qcow2"));
        // spaces, traversal, globs
        assert!(!overlay_deletable(
            "/var/lib/libvirt/images/vm 01.external.snapshot.qcow2"
        ));
        assert!(!overlay_deletable(
            "/var/lib/libvirt/images/../shadow.external.snapshot.qcow2"
        ));
        assert!(!overlay_deletable(
            "/var/lib/libvirt/images/*.external.snapshot.qcow2"
        ));
    }
}
