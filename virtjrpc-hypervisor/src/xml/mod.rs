//! Typed codec over the XML documents the hypervisor library speaks.
//!
//! Parsing uses `roxmltree`; generation assembles strings. Rewrites that
//! must survive unknown vendor extensions (the SR-IOV interface splice)
//! operate on byte ranges of the original document instead of re-emitting
//! from a lossy model.

pub mod domain;
pub mod network;
pub mod nodedev;
pub mod pool;
pub mod snapshot;
pub mod volume;

use std::fmt;

use crate::error::{Error, Result};

pub(crate) fn parse_doc(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(xml).map_err(|e| Error::Xml(e.to_string()))
}

/// XML-escape a text or attribute value.
pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// A PCI address as libvirt prints it in hostdev sources, network forward
/// pools and node device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
}

impl PciAddress {
    /// Parse the four `0x`-prefixed attributes of an `<address>` element.
    pub fn from_node(node: roxmltree::Node<'_, '_>) -> Option<PciAddress> {
        Some(PciAddress {
            domain: hex_attr(node, "domain")?,
            bus: hex_attr(node, "bus")?,
            slot: hex_attr(node, "slot")?,
            function: hex_attr(node, "function")?,
        })
    }

    /// The node-device name libvirt derives from the address,
    /// e.g. `pci_0000_06_10_2`.
    pub fn node_device_name(&self) -> String {
        format!(
            "pci_{:04x}_{:02x}_{:02x}_{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl fmt::Display for PciAddress {
    /// Canonical `dddd:bb:ss.f` form, e.g. `0000:06:10.2`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

fn hex_attr(node: roxmltree::Node<'_, '_>, name: &str) -> Option<u32> {
    let raw = node.attribute(name)?;
    let raw = raw.trim().trim_start_matches("0x");
    u32::from_str_radix(raw, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pci_address_formats() {
        let xml = r#"<address type='pci' domain='0x0000' bus='0x06' slot='0x10' function='0x2'/>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let addr = PciAddress::from_node(doc.root_element()).unwrap();
        assert_eq!(addr.to_string(), "0000:06:10.2");
        assert_eq!(addr.node_device_name(), "pci_0000_06_10_2");
    }

    #[test]
    fn escape_handles_markup() {
        assert_eq!(escape("a<b>&'\""), "a&lt;b&gt;&amp;&apos;&quot;");
    }
}
