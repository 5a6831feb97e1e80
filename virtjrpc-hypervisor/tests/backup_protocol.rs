//! Live-backup protocol against the mock host: snapshot, archive, commit,
//! pivot, cleanup, and the failure modes that leave the gate closed.

use std::time::Duration;

use virtjrpc_hypervisor::backup::{self, BackupConfig};
use virtjrpc_hypervisor::gate;
use virtjrpc_hypervisor::mock::{domain_xml_fixture, HostModel, MockConnector, MockDomain};
use virtjrpc_hypervisor::types::{AccessMode, BlockJobInfo, BlockJobKind, RawDomainState};
use virtjrpc_hypervisor::xml::domain::block_device_paths;
use virtjrpc_hypervisor::{Connector, Hypervisor};

fn fast_config() -> BackupConfig {
    BackupConfig {
        poll_interval: Duration::from_millis(5),
        stable_probes: 3,
        wall_budget: Duration::from_secs(2),
    }
}

/// A running domain with one real disk file inside a registered pool.
fn host_with_running_domain(dir: &std::path::Path) -> (MockConnector, String) {
    let disk_path = dir.join("vm01.qcow2");
    std::fs::write(&disk_path, vec![7u8; 64 * 1024]).unwrap();

    let mut model = HostModel::default();
    let pool = model.add_pool("pool-a", dir.to_str().unwrap(), 200 * 1024 * 1024 * 1024);
    pool.add_volume("vm01.qcow2", disk_path.to_str().unwrap());

    let xml = domain_xml_fixture(
        "vm01",
        "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
        &[("sda", disk_path.to_str().unwrap())],
        &[],
    );
    model.add_domain(
        "vm01",
        MockDomain {
            xml,
            active: true,
            persistent: true,
            state: RawDomainState { state: 1, reason: 1 },
            current_vcpus: 2,
            max_vcpus: 16,
            ..MockDomain::default()
        },
    );

    (MockConnector::new(model), disk_path.display().to_string())
}

#[tokio::test]
async fn backup_of_stopped_domain_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host_with_running_domain(dir.path());
    {
        let state = connector.state();
        state.lock().domains.get_mut("vm01").unwrap().active = false;
    }
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = backup::make_backup(hv.as_ref(), "vm01", &fast_config())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "domain must be active while creating backup"
    );
}

#[tokio::test]
async fn backup_succeeds_and_pivots_back_to_the_original_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, disk_path) = host_with_running_domain(dir.path());
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    backup::make_backup(hv.as_ref(), "vm01", &fast_config())
        .await
        .expect("backup must run to completion");

    // The data archive was produced next to the original disk.
    let archives: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("vm01.qcow2_") && n.ends_with("_backup.lz4"))
        .collect();
    assert_eq!(archives.len(), 1, "expected one archive for {}", disk_path);

    // After the pivot the active chain is the original file again and no
    // block job remains.
    let xml = hv.domain_xml("vm01", false).await.unwrap();
    assert_eq!(block_device_paths(&xml).unwrap(), vec![disk_path]);
    let cond = gate::sample(hv.as_ref(), "vm01").await.unwrap();
    assert!(!cond.block_job_running);
    assert!(!cond.external_backup_leftover);
}

#[tokio::test]
async fn leftover_overlay_blocks_backup_and_snapshot_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = dir.path().join("vm01.external.snapshot.qcow2");
    std::fs::write(&overlay, b"stale overlay").unwrap();

    let mut model = HostModel::default();
    model.add_pool("pool-a", dir.path().to_str().unwrap(), 200 * 1024 * 1024 * 1024);
    let xml = domain_xml_fixture(
        "vm01",
        "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
        &[("sda", overlay.to_str().unwrap())],
        &[],
    );
    model.add_domain(
        "vm01",
        MockDomain {
            xml,
            active: true,
            persistent: true,
            state: RawDomainState { state: 1, reason: 1 },
            ..MockDomain::default()
        },
    );
    let connector = MockConnector::new(model);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = backup::make_backup(hv.as_ref(), "vm01", &fast_config())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "sanity lock, domain has unfinished backup");

    // The snapshot-family wording for the same predicate.
    let cond = gate::sample(hv.as_ref(), "vm01").await.unwrap();
    assert_eq!(
        gate::require_no_backup_leftover(&cond)
            .unwrap_err()
            .to_string(),
        "sanity lock, domain has unfinished internal backup"
    );
}

#[tokio::test]
async fn archive_failure_aborts_and_closes_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, disk_path) = host_with_running_domain(dir.path());
    // The disk vanishes before the backup runs: the snapshot still
    // happens, the archive step then fails and no cleanup is attempted.
    std::fs::remove_file(&disk_path).unwrap();

    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();
    assert!(backup::make_backup(hv.as_ref(), "vm01", &fast_config())
        .await
        .is_err());

    // The overlay is still the active layer, so the gate refuses a retry.
    let cond = gate::sample(hv.as_ref(), "vm01").await.unwrap();
    assert!(cond.external_backup_leftover);
    let err = backup::make_backup(hv.as_ref(), "vm01", &fast_config())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "sanity lock, domain has unfinished backup");
}

#[tokio::test]
async fn wait_loop_stops_on_stable_completion() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host_with_running_domain(dir.path());
    {
        let state = connector.state();
        state.lock().domains.get_mut("vm01").unwrap().block_jobs.insert(
            "sda".to_string(),
            BlockJobInfo {
                kind: BlockJobKind::ActiveCommit,
                bandwidth: 0,
                cur: 4096,
                end: 4096,
            },
        );
    }
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    assert!(backup::wait_block_commit(hv.as_ref(), "vm01", "sda", &fast_config()).await);
}

#[tokio::test]
async fn wait_loop_detects_vanished_job() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host_with_running_domain(dir.path());
    {
        let state = connector.state();
        state.lock().domains.get_mut("vm01").unwrap().block_jobs.insert(
            "sda".to_string(),
            BlockJobInfo {
                kind: BlockJobKind::ActiveCommit,
                bandwidth: 0,
                cur: 0,
                end: 0,
            },
        );
    }
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    // cur == end == 0 is the "job aborted underneath us" arm: the wait
    // returns promptly instead of burning the whole budget.
    let started = std::time::Instant::now();
    assert!(backup::wait_block_commit(hv.as_ref(), "vm01", "sda", &fast_config()).await);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn wait_loop_gives_up_at_wall_budget() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host_with_running_domain(dir.path());
    {
        let state = connector.state();
        // A job that never reaches completion.
        state.lock().domains.get_mut("vm01").unwrap().block_jobs.insert(
            "sda".to_string(),
            BlockJobInfo {
                kind: BlockJobKind::ActiveCommit,
                bandwidth: 0,
                cur: 10,
                end: 4096,
            },
        );
    }
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let cfg = BackupConfig {
        poll_interval: Duration::from_millis(5),
        stable_probes: 3,
        wall_budget: Duration::from_millis(50),
    };
    assert!(!backup::wait_block_commit(hv.as_ref(), "vm01", "sda", &cfg).await);
}

#[tokio::test]
async fn mutations_are_gated_while_block_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host_with_running_domain(dir.path());
    {
        let state = connector.state();
        state.lock().domains.get_mut("vm01").unwrap().block_jobs.insert(
            "sda".to_string(),
            BlockJobInfo {
                kind: BlockJobKind::ActiveCommit,
                bandwidth: 0,
                cur: 10,
                end: 4096,
            },
        );
    }
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = backup::make_backup(hv.as_ref(), "vm01", &fast_config())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "sanity lock, block device job is currently in process"
    );
}
