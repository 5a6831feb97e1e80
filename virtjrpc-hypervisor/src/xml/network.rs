//! Network XML: SR-IOV hostdev forward pools.

use crate::error::Result;

use super::{parse_doc, PciAddress};

/// The VF PCI addresses a hostdev-forward network hands out.
///
/// Only managed hostdev forwards driven by vfio or kvm count; anything else
/// yields an empty set, mirroring how the network is consumed.
pub fn hostdev_vf_addresses(xml: &str) -> Result<Vec<PciAddress>> {
    let doc = parse_doc(xml)?;
    let mut out = Vec::new();

    let Some(forward) = doc
        .descendants()
        .find(|n| n.has_tag_name("forward"))
    else {
        return Ok(out);
    };

    let mode_ok = forward
        .attribute("mode")
        .map(|m| m.eq_ignore_ascii_case("hostdev"))
        == Some(true);
    let managed_ok = forward
        .attribute("managed")
        .map(|m| m.eq_ignore_ascii_case("yes"))
        == Some(true);
    let driver_ok = forward
        .children()
        .find(|c| c.has_tag_name("driver"))
        .and_then(|d| d.attribute("name"))
        .map(|n| n.eq_ignore_ascii_case("vfio") || n.eq_ignore_ascii_case("kvm"))
        == Some(true);

    if !(mode_ok && managed_ok && driver_ok) {
        return Ok(out);
    }

    for addr in forward.children().filter(|c| c.has_tag_name("address")) {
        if let Some(pci) = PciAddress::from_node(addr) {
            out.push(pci);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<network>
  <name>pf-enp6s2f0</name>
  <forward mode='hostdev' managed='yes'>
    <driver name='vfio'/>
    <address type='pci' domain='0x0000' bus='0x06' slot='0x10' function='0x0'/>
    <address type='pci' domain='0x0000' bus='0x06' slot='0x10' function='0x2'/>
  </forward>
</network>"#;

    #[test]
    fn collects_vf_addresses() {
        let addrs = hostdev_vf_addresses(FIXTURE).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].to_string(), "0000:06:10.2");
    }

    #[test]
    fn non_hostdev_forward_is_empty() {
        let xml = FIXTURE.replace("hostdev", "nat");
        assert!(hostdev_vf_addresses(&xml).unwrap().is_empty());
    }

    #[test]
    fn unmanaged_forward_is_empty() {
        let xml = FIXTURE.replace("managed='yes'", "managed='no'");
        assert!(hostdev_vf_addresses(&xml).unwrap().is_empty());
    }
}
