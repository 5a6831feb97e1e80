//! Node device XML: PCI descriptors and their capabilities.

use crate::error::Result;

use super::{parse_doc, PciAddress};

/// Parsed node device descriptor.
#[derive(Debug, Clone, Default)]
pub struct NodeDeviceInfo {
    pub name: String,
    pub parent: Option<String>,
    /// sysfs path of the device.
    pub path: Option<String>,
    /// Interface name when the device carries the net capability.
    pub net_interface: Option<String>,
    pub pci: Option<PciCapability>,
}

#[derive(Debug, Clone, Default)]
pub struct PciCapability {
    pub vendor_name: String,
    pub product_name: String,
    /// The physical function a VF belongs to.
    pub phys_function: Option<PciAddress>,
}

impl NodeDeviceInfo {
    /// `"<vendor> <product>"` one-liner for display.
    pub fn description(&self) -> Option<String> {
        let pci = self.pci.as_ref()?;
        Some(format!("{} {}", pci.vendor_name, pci.product_name))
    }
}

pub fn parse(xml: &str) -> Result<NodeDeviceInfo> {
    let doc = parse_doc(xml)?;
    let root = doc.root_element();
    let mut info = NodeDeviceInfo::default();

    for child in root.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "name" => info.name = child.text().unwrap_or_default().trim().to_string(),
            "parent" => info.parent = child.text().map(|t| t.trim().to_string()),
            "path" => info.path = child.text().map(|t| t.trim().to_string()),
            "capability" => match child.attribute("type") {
                Some("net") => {
                    info.net_interface = child
                        .children()
                        .find(|c| c.has_tag_name("interface"))
                        .and_then(|i| i.text())
                        .map(|t| t.trim().to_string());
                }
                Some("pci") => {
                    let mut pci = PciCapability::default();
                    for sub in child.children().filter(|c| c.is_element()) {
                        match sub.tag_name().name() {
                            "vendor" => {
                                pci.vendor_name =
                                    sub.text().unwrap_or_default().trim().to_string()
                            }
                            "product" => {
                                pci.product_name =
                                    sub.text().unwrap_or_default().trim().to_string()
                            }
                            "capability" => {
                                if sub.attribute("type") == Some("phys_function") {
                                    pci.phys_function = sub
                                        .children()
                                        .find(|c| c.has_tag_name("address"))
                                        .and_then(PciAddress::from_node);
                                }
                            }
                            _ => {}
                        }
                    }
                    info.pci = Some(pci);
                }
                _ => {}
            },
            _ => {}
        }
    }

    Ok(info)
}
