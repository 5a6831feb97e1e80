//! Provisioning flow against the mock host: the ordered validation chain,
//! the template clone and the final define.

use virtjrpc_hypervisor::create::{self, CreateRequest};
use virtjrpc_hypervisor::ident::validate_uuid;
use virtjrpc_hypervisor::mock::{HostModel, MockConnector};
use virtjrpc_hypervisor::types::AccessMode;
use virtjrpc_hypervisor::xml::{domain as domain_xml, PciAddress};
use virtjrpc_hypervisor::{Connector, Hypervisor};

fn vf(function: u32) -> PciAddress {
    PciAddress {
        domain: 0,
        bus: 6,
        slot: 0x10,
        function,
    }
}

/// pool-a with the ubuntu template on disk, pf-enp6s2f0 with 8 free VFs.
fn provisioning_host(dir: &std::path::Path) -> MockConnector {
    let template_path = dir.join("ubuntu-22.04.qcow2");
    std::fs::write(&template_path, vec![1u8; 8 * 1024]).unwrap();

    let mut model = HostModel::default();
    let pool = model.add_pool("pool-a", dir.to_str().unwrap(), 200 * 1024 * 1024 * 1024);
    pool.add_volume("ubuntu-22.04.qcow2", template_path.to_str().unwrap());
    model.add_network(
        "pf-enp6s2f0",
        &[vf(0), vf(1), vf(2), vf(3), vf(4), vf(5), vf(6), vf(7)],
    );
    MockConnector::new(model)
}

fn request() -> CreateRequest {
    CreateRequest {
        uuid: String::new(),
        name: "vm01".to_string(),
        vcpus: 2,
        memory_kib: 524288,
        storage: "pool-a".to_string(),
        template: "ubuntu-22.04.qcow2".to_string(),
        network: "pf-enp6s2f0".to_string(),
        mac: "52:54:00:ab:cd:ef".to_string(),
        vlan: 222,
    }
}

#[tokio::test]
async fn create_defines_domain_and_clones_template() {
    let dir = tempfile::tempdir().unwrap();
    let connector = provisioning_host(dir.path());
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let uuid = create::create(hv.as_ref(), request()).await.unwrap();
    validate_uuid(&uuid).unwrap();

    // The image was cloned into the pool under the domain name.
    let clone = dir.path().join("vm01.qcow2");
    assert!(clone.exists());
    assert_eq!(std::fs::read(&clone).unwrap(), vec![1u8; 8 * 1024]);

    // The domain exists, is persistent and carries the requested shape.
    assert!(hv.domain_exists("vm01").await.unwrap());
    let runtime = hv.domain_runtime("vm01").await.unwrap();
    assert!(runtime.persistent);
    assert!(!runtime.active);
    assert_eq!(runtime.uuid, uuid);

    let xml = hv.domain_xml("vm01", false).await.unwrap();
    assert!(xml.contains("<vcpu placement='static' current='2'>16</vcpu>"));
    assert!(xml.contains("<memory unit='KiB'>1048576</memory>"));
    assert!(xml.contains("<currentMemory unit='KiB'>524288</currentMemory>"));
    let interfaces = domain_xml::parse_interfaces(&xml).unwrap();
    assert_eq!(interfaces[0].mac.as_deref(), Some("52:54:00:ab:cd:ef"));
    assert_eq!(interfaces[0].pvid(), Some(222));
}

#[tokio::test]
async fn create_keeps_a_supplied_uuid() {
    let dir = tempfile::tempdir().unwrap();
    let connector = provisioning_host(dir.path());
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let mut req = request();
    req.uuid = "0d15ea5e-dead-4ead-9ead-defec8eddead".to_string();
    let uuid = create::create(hv.as_ref(), req).await.unwrap();
    assert_eq!(uuid, "0d15ea5e-dead-4ead-9ead-defec8eddead");
}

#[tokio::test]
async fn create_is_rejected_by_memory_floor_before_any_clone() {
    let dir = tempfile::tempdir().unwrap();
    let connector = provisioning_host(dir.path());
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let mut req = request();
    req.memory_kib = 131072;
    let err = create::create(hv.as_ref(), req).await.unwrap_err();
    assert!(
        err.to_string().contains("memory can not be lesser that 256 MB"),
        "got: {}",
        err
    );

    assert!(!dir.path().join("vm01.qcow2").exists());
    assert!(!hv.domain_exists("vm01").await.unwrap());
}

#[tokio::test]
async fn create_validation_order_and_messages() {
    let dir = tempfile::tempdir().unwrap();
    let connector = provisioning_host(dir.path());
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    // bad UUID wins over everything else
    let mut req = request();
    req.uuid = "not-a-uuid".to_string();
    let err = create::create(hv.as_ref(), req).await.unwrap_err();
    assert!(err.to_string().contains("not valid UUID"));

    // bad name
    let mut req = request();
    req.name = "vm 01".to_string();
    let err = create::create(hv.as_ref(), req).await.unwrap_err();
    assert!(err.to_string().contains("not valid name"));

    // vCPUs above the node
    let mut req = request();
    req.vcpus = 999;
    let err = create::create(hv.as_ref(), req).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("greater than physically available hypervisor cores"));

    // missing template
    let mut req = request();
    req.template = "debian-13.qcow2".to_string();
    let err = create::create(hv.as_ref(), req).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("failed to find template: debian-13.qcow2 in storage pool-a"));

    // foreign MAC prefix is validated last
    let mut req = request();
    req.mac = "fa:16:3e:aa:bb:cc".to_string();
    let err = create::create(hv.as_ref(), req).await.unwrap_err();
    assert!(err.to_string().contains("non valid QEMU-KVM vendor prefix"));
}

#[tokio::test]
async fn create_is_refused_when_no_vf_is_free() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("ubuntu-22.04.qcow2");
    std::fs::write(&template_path, b"img").unwrap();

    let mut model = HostModel::default();
    let pool = model.add_pool("pool-a", dir.path().to_str().unwrap(), 200 * 1024 * 1024 * 1024);
    pool.add_volume("ubuntu-22.04.qcow2", template_path.to_str().unwrap());
    // One VF in the pool, and an existing domain already consuming it.
    model.add_network("pf-enp6s2f0", &[vf(0)]);
    {
        use virtjrpc_hypervisor::mock::{domain_xml_fixture, FixtureInterface, MockDomain};
        let xml = domain_xml_fixture(
            "tenant",
            "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
            &[],
            &[FixtureInterface {
                mac: "52:54:00:00:00:01".to_string(),
                network: "pf-enp6s2f0".to_string(),
                vlan: Some(10),
                hostdev: Some(vf(0)),
            }],
        );
        model.add_domain(
            "tenant",
            MockDomain {
                xml,
                active: true,
                persistent: true,
                ..MockDomain::default()
            },
        );
    }
    let connector = MockConnector::new(model);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = create::create(hv.as_ref(), request()).await.unwrap_err();
    assert!(err.to_string().contains("no empty network VF available"));
}

#[tokio::test]
async fn create_refuses_a_taken_name() {
    let dir = tempfile::tempdir().unwrap();
    let connector = provisioning_host(dir.path());
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    create::create(hv.as_ref(), request()).await.unwrap();
    let err = create::create(hv.as_ref(), request()).await.unwrap_err();
    assert!(err.to_string().contains("domain: vm01 already exists"));
}

#[tokio::test]
async fn check_resources_runs_the_reduced_chain() {
    let dir = tempfile::tempdir().unwrap();
    let connector = provisioning_host(dir.path());
    let hv = connector.connect(AccessMode::ReadOnly).await.unwrap();

    create::check_resources(hv.as_ref(), "vm02", 2, 524288, "pool-a", "pf-enp6s2f0")
        .await
        .unwrap();

    let err = create::check_resources(hv.as_ref(), "vm02", 2, 524288, "pool-b", "pf-enp6s2f0")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to find storage pool: pool-b"));
}

#[tokio::test]
async fn pool_below_headroom_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("ubuntu-22.04.qcow2");
    std::fs::write(&template_path, b"img").unwrap();

    let mut model = HostModel::default();
    // 10 GiB available is under the 50 GiB headroom requirement.
    let pool = model.add_pool("pool-a", dir.path().to_str().unwrap(), 10 * 1024 * 1024 * 1024);
    pool.add_volume("ubuntu-22.04.qcow2", template_path.to_str().unwrap());
    model.add_network("pf-enp6s2f0", &[vf(0)]);
    let connector = MockConnector::new(model);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = create::create(hv.as_ref(), request()).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("storage pool pool-a free space at critical levels"));
}
