//! SR-IOV flows: the VLAN PVID rebind cycle, the metadata-only rate
//! mutation, and VF accounting across domains and networks.

use std::time::Duration;

use virtjrpc_hypervisor::mock::{
    domain_xml_fixture, FixtureInterface, HostModel, MockConnector, MockDomain,
};
use virtjrpc_hypervisor::sriov;
use virtjrpc_hypervisor::types::{AccessMode, RawDomainState};
use virtjrpc_hypervisor::{Connector, Hypervisor};
use virtjrpc_hypervisor::xml::domain::{parse_interfaces, METADATA_NS_URI};
use virtjrpc_hypervisor::xml::PciAddress;

const MAC: &str = "52:54:00:ab:cd:ef";

fn vf(function: u32) -> PciAddress {
    PciAddress {
        domain: 0,
        bus: 6,
        slot: 0x10,
        function,
    }
}

fn host(active: bool) -> MockConnector {
    let mut model = HostModel::default();
    let xml = domain_xml_fixture(
        "vm01",
        "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
        &[("sda", "/var/lib/libvirt/images/vm01.qcow2")],
        &[FixtureInterface {
            mac: MAC.to_string(),
            network: "pf-enp6s2f0".to_string(),
            vlan: Some(222),
            hostdev: Some(vf(2)),
        }],
    );
    let mut domain = MockDomain {
        xml,
        active,
        persistent: true,
        state: RawDomainState {
            state: if active { 1 } else { 5 },
            reason: 1,
        },
        ..MockDomain::default()
    };
    domain.metadata.insert(
        METADATA_NS_URI.to_string(),
        sriov::build_network_tuning_xml(&sriov::NetworkTuning {
            max_tx_rate: 100,
            qos: 0,
            trust: "off".to_string(),
            spoof_chk: "on".to_string(),
            query_rss: "off".to_string(),
        }),
    );
    model.add_domain("vm01", domain);
    model.add_network("pf-enp6s2f0", &[vf(0), vf(1), vf(2), vf(3)]);
    MockConnector::new(model)
}

#[tokio::test]
async fn pvid_rebind_rewrites_the_vlan_tag() {
    let connector = host(false);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    sriov::set_pvid(hv.as_ref(), "vm01", MAC, 333, Duration::ZERO)
        .await
        .unwrap();

    let xml = hv.domain_xml("vm01", false).await.unwrap();
    let interfaces = parse_interfaces(&xml).unwrap();
    let nic = interfaces
        .iter()
        .find(|i| i.mac.as_deref() == Some(MAC))
        .expect("interface must be re-attached");
    assert_eq!(nic.pvid(), Some(333));
    assert_eq!(nic.source_network.as_deref(), Some("pf-enp6s2f0"));
}

#[tokio::test]
async fn pvid_rebind_is_refused_while_running() {
    let connector = host(true);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = sriov::set_pvid(hv.as_ref(), "vm01", MAC, 333, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "domain must not be active while setting PVID for network device"
    );
}

#[tokio::test]
async fn pvid_rebind_validates_the_mac_first() {
    let connector = host(false);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = sriov::set_pvid(hv.as_ref(), "vm01", "fa:16:3e:aa:bb:cc", 333, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("non valid QEMU-KVM vendor prefix"));

    let err = sriov::set_pvid(hv.as_ref(), "vm01", "52:54:00:00:00:99", 333, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no interfaces match specified MAC");
}

#[tokio::test]
async fn pvid_rebind_requires_a_pf_backed_network() {
    let mut model = HostModel::default();
    let xml = domain_xml_fixture(
        "vm01",
        "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
        &[],
        &[FixtureInterface {
            mac: MAC.to_string(),
            network: "default".to_string(),
            vlan: None,
            hostdev: None,
        }],
    );
    model.add_domain(
        "vm01",
        MockDomain {
            xml,
            persistent: true,
            ..MockDomain::default()
        },
    );
    let connector = MockConnector::new(model);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = sriov::set_pvid(hv.as_ref(), "vm01", MAC, 333, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "malformed XML description for interface");
}

#[tokio::test]
async fn network_rate_rewrites_only_the_tx_rate() {
    let connector = host(false);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    sriov::set_network_rate(hv.as_ref(), "vm01", 250).await.unwrap();

    // The read path is namespace-qualified: the blob comes back under the
    // same URI it was stored with.
    let tuning = sriov::network_tuning(hv.as_ref(), "vm01").await.unwrap();
    assert_eq!(tuning.max_tx_rate, 250);
    assert_eq!(tuning.trust, "off");
    assert_eq!(tuning.spoof_chk, "on");
    assert_eq!(tuning.query_rss, "off");
    assert_eq!(tuning.qos, 0);
}

#[tokio::test]
async fn network_rate_is_refused_while_running() {
    let connector = host(true);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = sriov::set_network_rate(hv.as_ref(), "vm01", 250)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "domain must not be active while setting speed for network device"
    );
}

#[tokio::test]
async fn vf_usage_counts_the_intersection() {
    let connector = host(false);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    // vm01 consumes VF 0000:06:10.2 out of the 4 the network hands out.
    let (used, total) = sriov::network_vf_usage(hv.as_ref(), "pf-enp6s2f0")
        .await
        .unwrap();
    assert_eq!((used, total), (1, 4));

    assert_eq!(
        sriov::network_name_for_vf(hv.as_ref(), vf(2)).await.unwrap(),
        "pf-enp6s2f0"
    );
    assert!(sriov::network_name_for_vf(hv.as_ref(), vf(7)).await.is_err());
}
