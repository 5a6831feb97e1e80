//! Destroy: archive side-effect, undefine, and the volume sweep property.

use virtjrpc_hypervisor::lifecycle;
use virtjrpc_hypervisor::mock::{domain_xml_fixture, HostModel, MockConnector, MockDomain};
use virtjrpc_hypervisor::types::{AccessMode, RawDomainState};
use virtjrpc_hypervisor::{Connector, Hypervisor};

fn host(dir: &std::path::Path, active: bool) -> (MockConnector, String) {
    let disk_path = dir.join("vm01.qcow2");
    std::fs::write(&disk_path, vec![9u8; 16 * 1024]).unwrap();

    let other_path = dir.join("keeper.qcow2");
    std::fs::write(&other_path, b"other tenant").unwrap();

    let mut model = HostModel::default();
    let pool = model.add_pool("pool-a", dir.to_str().unwrap(), 200 * 1024 * 1024 * 1024);
    pool.add_volume("vm01.qcow2", disk_path.to_str().unwrap());
    pool.add_volume("keeper.qcow2", other_path.to_str().unwrap());

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
            active,
            persistent: true,
            state: RawDomainState {
                state: if active { 1 } else { 5 },
                reason: 1,
            },
            ..MockDomain::default()
        },
    );

    (MockConnector::new(model), disk_path.display().to_string())
}

#[tokio::test]
async fn destroy_removes_domain_and_matching_volumes_only() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, disk_path) = host(dir.path(), false);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    lifecycle::destroy(hv.as_ref(), "vm01").await.unwrap();

    // The domain is gone.
    assert!(!hv.domain_exists("vm01").await.unwrap());

    // No volume resolves to any former block path of the domain.
    assert!(hv.find_volume_by_path(&disk_path).await.unwrap().is_none());
    assert!(!std::path::Path::new(&disk_path).exists());

    // Volumes of other tenants survive the sweep.
    let keeper = dir.path().join("keeper.qcow2");
    assert!(hv
        .find_volume_by_path(keeper.to_str().unwrap())
        .await
        .unwrap()
        .is_some());
    assert!(keeper.exists());
}

#[tokio::test]
async fn destroy_archives_every_disk_first() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host(dir.path(), false);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    lifecycle::destroy(hv.as_ref(), "vm01").await.unwrap();

    let archives = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("vm01.qcow2_") && n.ends_with("_backup.lz4"))
        .count();
    assert_eq!(archives, 1);
}

#[tokio::test]
async fn destroy_aborts_when_the_archive_cannot_be_produced() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, disk_path) = host(dir.path(), false);
    std::fs::remove_file(&disk_path).unwrap();

    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();
    assert!(lifecycle::destroy(hv.as_ref(), "vm01").await.is_err());

    // Nothing was torn down.
    assert!(hv.domain_exists("vm01").await.unwrap());
}

#[tokio::test]
async fn destroy_tears_down_an_active_domain_when_invoked_directly() {
    // The RPC gate refuses active domains; the lifecycle op itself follows
    // the destroy-then-undefine ladder when reached with one.
    let dir = tempfile::tempdir().unwrap();
    let (connector, _) = host(dir.path(), true);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    lifecycle::destroy(hv.as_ref(), "vm01").await.unwrap();
    assert!(!hv.domain_exists("vm01").await.unwrap());
}
