//! SR-IOV passthrough: VLAN PVID re-binding, VF/PF resolution and the
//! network-tuning metadata blob consumed by the post-start hook.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ident::validate_mac;
use crate::traits::Hypervisor;
use crate::xml::domain::{parse_interfaces, METADATA_NS_URI};
use crate::xml::nodedev;
use crate::xml::network::hostdev_vf_addresses;
use crate::xml::{escape, PciAddress};

/// Delay after a hostdev detach or attach so the device settles before the
/// next modification.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(3);

// -- network-tuning metadata ----------------------------------------------

/// The per-domain VF tuning hints stored in the domain metadata element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkTuning {
    #[serde(rename = "MaxTxRate")]
    pub max_tx_rate: u32,
    #[serde(rename = "QoS")]
    pub qos: u32,
    #[serde(rename = "Trust")]
    pub trust: String,
    #[serde(rename = "SpoofChk")]
    pub spoof_chk: String,
    #[serde(rename = "QueryRss")]
    pub query_rss: String,
}

impl Default for NetworkTuning {
    fn default() -> Self {
        NetworkTuning {
            max_tx_rate: 0,
            qos: 0,
            trust: "off".to_string(),
            spoof_chk: "on".to_string(),
            query_rss: "off".to_string(),
        }
    }
}

/// Parse the `<custom>` metadata element.
pub fn parse_network_tuning(xml: &str) -> Result<NetworkTuning> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| Error::Xml(e.to_string()))?;
    let mut tuning = NetworkTuning {
        trust: String::new(),
        spoof_chk: String::new(),
        query_rss: String::new(),
        ..NetworkTuning::default()
    };

    let mut seen = false;
    for node in doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("network"))
    {
        seen = true;
        let value = node.text().unwrap_or_default().trim();
        match node.attribute("type") {
            Some("max_tx_rate") => {
                tuning.max_tx_rate = value
                    .parse()
                    .map_err(|_| Error::Xml("non numeric max_tx_rate in metadata".to_string()))?
            }
            Some("qos") => {
                tuning.qos = value
                    .parse()
                    .map_err(|_| Error::Xml("non numeric qos in metadata".to_string()))?
            }
            Some("trust") => tuning.trust = value.to_string(),
            Some("spoofchk") => tuning.spoof_chk = value.to_string(),
            Some("query_rss") => tuning.query_rss = value.to_string(),
            _ => {}
        }
    }

    if !seen {
        return Err(Error::Xml("empty network section in XML".to_string()));
    }
    Ok(tuning)
}

/// Serialize the tuning hints back into the metadata element, filling unset
/// string fields with their defaults.
pub fn build_network_tuning_xml(tuning: &NetworkTuning) -> String {
    let trust = if tuning.trust.is_empty() { "off" } else { &tuning.trust };
    let spoof_chk = if tuning.spoof_chk.is_empty() { "on" } else { &tuning.spoof_chk };
    let query_rss = if tuning.query_rss.is_empty() { "off" } else { &tuning.query_rss };

    format!(
        "<custom>\
         <network type=\"max_tx_rate\">{}</network>\
         <network type=\"qos\">{}</network>\
         <network type=\"trust\">{}</network>\
         <network type=\"spoofchk\">{}</network>\
         <network type=\"query_rss\">{}</network>\
         </custom>",
        tuning.max_tx_rate,
        tuning.qos,
        escape(trust),
        escape(spoof_chk),
        escape(query_rss),
    )
}

/// Read the stored tuning hints of a domain.
pub async fn network_tuning(hv: &dyn Hypervisor, domain: &str) -> Result<NetworkTuning> {
    let xml = hv.metadata(domain, METADATA_NS_URI).await?;
    parse_network_tuning(&xml)
}

/// Rewrite only the transmit-rate hint, preserving the rest of the blob.
/// The domain must be stopped; the hook applies the hint on next start.
pub async fn set_network_rate(hv: &dyn Hypervisor, domain: &str, rate: u32) -> Result<()> {
    let runtime = hv.domain_runtime(domain).await?;
    if runtime.active {
        return Err(Error::gate(
            "domain must not be active while setting speed for network device",
        ));
    }

    let mut tuning = network_tuning(hv, domain).await?;
    tuning.max_tx_rate = rate;

    let xml = build_network_tuning_xml(&tuning);
    hv.set_metadata(domain, &xml, "my", METADATA_NS_URI).await?;
    info!(domain, rate, "updated network metadata for domain");
    Ok(())
}

// -- VLAN PVID rebind -----------------------------------------------------

/// Re-bind the VLAN PVID of the hostdev interface identified by `mac`.
///
/// Only legal on a stopped domain: the interface is detached, rewritten
/// with the single new tag and re-attached, with a settle delay between the
/// steps. Success is confirmed by re-reading the interface list.
pub async fn set_pvid(
    hv: &dyn Hypervisor,
    domain: &str,
    mac: &str,
    pvid: u32,
    settle: Duration,
) -> Result<()> {
    validate_mac(mac)?;

    let runtime = hv.domain_runtime(domain).await?;
    if runtime.active {
        return Err(Error::gate(
            "domain must not be active while setting PVID for network device",
        ));
    }

    let xml = hv.domain_xml(domain, false).await?;
    let interfaces = parse_interfaces(&xml)?;

    let Some(nic) = interfaces
        .iter()
        .find(|i| i.mac.as_deref() == Some(mac))
    else {
        return Err(Error::validation("no interfaces match specified MAC"));
    };

    let pf_backed = nic
        .source_network
        .as_deref()
        .map(|n| n.starts_with("pf-"))
        .unwrap_or(false);
    if !pf_backed {
        return Err(Error::validation(
            "malformed XML description for interface",
        ));
    }

    let old_xml = nic.raw.clone();
    let new_xml = nic.with_pvid(pvid)?;
    info!(domain, mac, pvid, "prepared interface XML with new VLAN PVID");

    hv.detach_device(domain, &old_xml).await?;
    tokio::time::sleep(settle).await;
    hv.attach_device(domain, &new_xml).await?;
    tokio::time::sleep(settle).await;

    let xml = hv.domain_xml(domain, false).await?;
    let rebound = parse_interfaces(&xml)?
        .iter()
        .any(|i| i.mac.as_deref() == Some(mac));
    if !rebound {
        return Err(Error::validation("no interfaces match specified MAC"));
    }

    info!(domain, mac, pvid, "changed VLAN PVID for network device");
    Ok(())
}

// -- VF accounting --------------------------------------------------------

/// VF PCI addresses consumed by every domain on the host.
pub async fn domains_vf_addresses(hv: &dyn Hypervisor) -> Result<Vec<PciAddress>> {
    let mut used = Vec::new();
    for name in hv.list_domain_names().await? {
        let Ok(xml) = hv.domain_xml(&name, false).await else {
            continue;
        };
        let Ok(interfaces) = parse_interfaces(&xml) else {
            continue;
        };
        for iface in interfaces {
            if iface.is_hostdev_passthrough() {
                if let Some(addr) = iface.hostdev_address {
                    used.push(addr);
                }
            }
        }
    }
    Ok(used)
}

/// `(used, total)` VF counts of a hostdev network.
pub async fn network_vf_usage(hv: &dyn Hypervisor, network: &str) -> Result<(usize, usize)> {
    let xml = hv.network_xml(network).await?;
    let pool = hostdev_vf_addresses(&xml)?;
    let consumed = domains_vf_addresses(hv).await?;

    let used = pool
        .iter()
        .map(|addr| consumed.iter().filter(|c| *c == addr).count())
        .sum();
    Ok((used, pool.len()))
}

/// The defined network a VF address belongs to.
pub async fn network_name_for_vf(hv: &dyn Hypervisor, vf: PciAddress) -> Result<String> {
    for name in hv.list_network_names().await? {
        let Ok(xml) = hv.network_xml(&name).await else {
            continue;
        };
        let Ok(pool) = hostdev_vf_addresses(&xml) else {
            continue;
        };
        if pool.contains(&vf) {
            return Ok(name);
        }
    }
    Err(Error::NotFound(
        "no defined network matches search criteria".to_string(),
    ))
}

// -- per-domain interface report ------------------------------------------

/// PCI identity of a bound VF and its physical function.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetPci {
    #[serde(rename = "VFaddr")]
    pub vf_addr: String,
    #[serde(rename = "PFaddr")]
    pub pf_addr: String,
    #[serde(rename = "VFName")]
    pub vf_name: String,
    #[serde(rename = "PFName")]
    pub pf_name: String,
}

/// One SR-IOV interface of a domain, resolved end to end.
#[derive(Debug, Clone, Serialize)]
pub struct NetInfo {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "PVID")]
    pub pvid: String,
    #[serde(rename = "PFName")]
    pub pf_name: String,
    #[serde(rename = "VFName")]
    pub vf_name: String,
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "PCI")]
    pub pci: NetPci,
    #[serde(rename = "Metadata")]
    pub metadata: NetworkTuning,
    #[serde(rename = "Desc")]
    pub desc: String,
}

/// The net-capable node device name of a physical function, resolved by
/// walking the host device tree for a child of `pf_pci_name`.
pub async fn find_node_pf_name(hv: &dyn Hypervisor, pf_pci_name: &str) -> Result<String> {
    for dev in hv.list_net_node_devices().await? {
        let Ok(xml) = hv.node_device_xml(&dev).await else {
            continue;
        };
        let Ok(info) = nodedev::parse(&xml) else {
            continue;
        };
        if info.parent.as_deref() == Some(pf_pci_name) {
            if let Some(iface) = info.net_interface {
                return Ok(iface);
            }
        }
    }
    Err(Error::NotFound("device not found".to_string()))
}

/// The `vfN` ordinal of a VF, resolved through the physfn symlink farm in
/// sysfs: `<vf sysfs path>/physfn/virtfnN -> .../<vf pci address>`.
pub fn vf_ordinal_name(vf_sysfs_path: &str, vf_addr: &str) -> Option<String> {
    let physfn = Path::new(vf_sysfs_path).join("physfn");
    let entries = std::fs::read_dir(&physfn).ok()?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if !name.starts_with("virtfn") {
            continue;
        }
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let points_at = target
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        if points_at == vf_addr {
            return Some(name.replacen("virtfn", "vf", 1));
        }
    }
    None
}

/// Resolve every SR-IOV interface of a domain: MAC, PVID, VF/PF PCI
/// identity, the owning network and the stored tuning hints. Devices that
/// cannot be fully resolved are skipped rather than failing the report.
pub async fn domain_net_info(hv: &dyn Hypervisor, domain: &str) -> Result<Vec<NetInfo>> {
    let xml = hv.domain_xml(domain, false).await?;
    let interfaces = parse_interfaces(&xml)?;

    let Ok(tuning) = network_tuning(hv, domain).await else {
        return Ok(Vec::new());
    };

    let mut nets = Vec::new();

    for iface in &interfaces {
        let Some(mac) = iface.mac.clone() else {
            warn!(domain, "network device has no MAC address");
            continue;
        };
        if !iface.is_hostdev_passthrough() {
            continue;
        }
        let vf = iface.hostdev_address.expect("passthrough implies address");

        let pvid = match &iface.vlan {
            Some(v) if v.trunk => {
                warn!(domain, mac = %mac, "device has trunk configuration");
                continue;
            }
            _ => iface
                .pvid()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        };

        let mut net = NetInfo {
            mac,
            pvid,
            pf_name: String::new(),
            vf_name: String::new(),
            network: String::new(),
            pci: NetPci::default(),
            metadata: tuning.clone(),
            desc: String::new(),
        };

        let vf_dev_name = vf.node_device_name();
        if let Ok(dev_xml) = hv.node_device_xml(&vf_dev_name).await {
            if let Ok(dev) = nodedev::parse(&dev_xml) {
                if let Some(pf) = dev.pci.as_ref().and_then(|p| p.phys_function) {
                    net.pci = NetPci {
                        vf_addr: vf.to_string(),
                        pf_addr: pf.to_string(),
                        vf_name: vf_dev_name.clone(),
                        pf_name: pf.node_device_name(),
                    };
                    net.desc = dev.description().unwrap_or_default();

                    if let Some(path) = dev.path.as_deref() {
                        if let Some(ordinal) = vf_ordinal_name(path, &vf.to_string()) {
                            net.vf_name = ordinal;
                        }
                    }

                    match find_node_pf_name(hv, &pf.node_device_name()).await {
                        Ok(name) => net.pf_name = name,
                        Err(_) => continue,
                    }

                    match network_name_for_vf(hv, vf).await {
                        Ok(name) => net.network = name,
                        Err(_) => continue,
                    }
                }
            }
        }

        nets.push(net);
    }

    Ok(nets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_round_trips_through_xml() {
        let tuning = NetworkTuning {
            max_tx_rate: 250,
            qos: 7,
            trust: "on".to_string(),
            spoof_chk: "off".to_string(),
            query_rss: "on".to_string(),
        };
        let xml = build_network_tuning_xml(&tuning);
        assert_eq!(parse_network_tuning(&xml).unwrap(), tuning);
    }

    #[test]
    fn tuning_defaults_fill_unset_fields() {
        let tuning = NetworkTuning {
            max_tx_rate: 100,
            qos: 0,
            trust: String::new(),
            spoof_chk: String::new(),
            query_rss: String::new(),
        };
        let xml = build_network_tuning_xml(&tuning);
        let parsed = parse_network_tuning(&xml).unwrap();
        assert_eq!(parsed.trust, "off");
        assert_eq!(parsed.spoof_chk, "on");
        assert_eq!(parsed.query_rss, "off");
    }

    #[test]
    fn empty_metadata_is_an_error() {
        let err = parse_network_tuning("<custom/>").unwrap_err();
        assert!(err.to_string().contains("empty network section"));
    }

    #[test]
    fn vf_ordinal_resolves_through_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("0000:06:10.2");
        let physfn = device.join("physfn");
        std::fs::create_dir_all(&physfn).unwrap();

        let target = dir.path().join("devices").join("0000:06:10.2");
        std::fs::create_dir_all(&target).unwrap();
        std::os::unix::fs::symlink(&target, physfn.join("virtfn3")).unwrap();

        let other = dir.path().join("devices").join("0000:06:10.0");
        std::fs::create_dir_all(&other).unwrap();
        std::os::unix::fs::symlink(&other, physfn.join("virtfn0")).unwrap();

        assert_eq!(
            vf_ordinal_name(device.to_str().unwrap(), "0000:06:10.2"),
            Some("vf3".to_string())
        );
        assert_eq!(vf_ordinal_name(device.to_str().unwrap(), "0000:06:99.9"), None);
    }
}
