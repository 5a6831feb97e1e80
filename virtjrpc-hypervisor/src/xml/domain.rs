//! Domain XML: parsing of the device tree and generation of new-domain
//! definitions.

use std::ops::Range;

use crate::error::{Error, Result};

use super::{escape, parse_doc, PciAddress};

/// One `<disk>` element of the domain device tree.
#[derive(Debug, Clone)]
pub struct DiskDevice {
    /// The `device` attribute; block-path logic only considers `disk`.
    pub device: String,
    pub target_dev: Option<String>,
    pub source_path: Option<String>,
    pub read_only: bool,
    pub shareable: bool,
    pub transient: bool,
}

impl DiskDevice {
    /// Disks eligible for snapshotting: plain writable non-transient disks.
    pub fn snapshottable(&self) -> bool {
        self.device == "disk" && !self.read_only && !self.shareable && !self.transient
    }
}

/// One `<interface>` element, with enough raw context to rewrite it.
#[derive(Debug, Clone)]
pub struct InterfaceDevice {
    pub type_name: String,
    pub managed: bool,
    pub mac: Option<String>,
    pub source_network: Option<String>,
    pub hostdev_address: Option<PciAddress>,
    pub vlan: Option<VlanConfig>,
    /// Raw bytes of the element in the source document.
    pub raw: String,
    /// Byte range of the `<vlan>` element relative to `raw`, when present.
    vlan_span: Option<Range<usize>>,
}

#[derive(Debug, Clone, Default)]
pub struct VlanConfig {
    pub trunk: bool,
    pub tags: Vec<VlanTag>,
}

#[derive(Debug, Clone)]
pub struct VlanTag {
    pub id: u32,
    pub native_mode: Option<String>,
}

impl InterfaceDevice {
    /// A managed SR-IOV passthrough function: hostdev source with a PCI
    /// address and a MAC to identify it by.
    pub fn is_hostdev_passthrough(&self) -> bool {
        self.managed && self.mac.is_some() && self.hostdev_address.is_some()
    }

    /// The port VLAN id: the single untagged-traffic tag. Trunk
    /// configurations have no PVID.
    pub fn pvid(&self) -> Option<u32> {
        let vlan = self.vlan.as_ref()?;
        if vlan.trunk {
            return None;
        }
        vlan.tags
            .iter()
            .find(|t| t.native_mode.is_none())
            .map(|t| t.id)
    }

    /// Rewrite this interface with a single VLAN tag, leaving every other
    /// byte of the original element untouched.
    pub fn with_pvid(&self, pvid: u32) -> Result<String> {
        let vlan = format!("<vlan><tag id='{}'/></vlan>", pvid);
        if let Some(span) = &self.vlan_span {
            let mut out = String::with_capacity(self.raw.len() + vlan.len());
            out.push_str(&self.raw[..span.start]);
            out.push_str(&vlan);
            out.push_str(&self.raw[span.end..]);
            return Ok(out);
        }
        let Some(close) = self.raw.rfind("</interface>") else {
            return Err(Error::Xml(
                "interface element has no closing tag".to_string(),
            ));
        };
        let mut out = String::with_capacity(self.raw.len() + vlan.len());
        out.push_str(&self.raw[..close]);
        out.push_str(&vlan);
        out.push_str(&self.raw[close..]);
        Ok(out)
    }
}

/// Byte span of the element starting at `start`, where `tag` is its name.
/// Handles self-closing elements; nested same-name elements do not occur in
/// the subtrees this codec touches.
fn element_span(xml: &str, start: usize, tag: &str) -> Result<Range<usize>> {
    let rest = &xml[start..];
    let open_end = rest
        .find('>')
        .ok_or_else(|| Error::Xml(format!("unterminated <{}> element", tag)))?;
    if rest[..open_end].ends_with('/') {
        return Ok(start..start + open_end + 1);
    }
    let close = format!("</{}>", tag);
    let close_at = rest
        .find(&close)
        .ok_or_else(|| Error::Xml(format!("missing </{}> close tag", tag)))?;
    Ok(start..start + close_at + close.len())
}

/// Parse every `<disk>` of the domain device tree.
pub fn parse_disks(xml: &str) -> Result<Vec<DiskDevice>> {
    let doc = parse_doc(xml)?;
    let mut disks = Vec::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("disk")) {
        let mut disk = DiskDevice {
            device: node.attribute("device").unwrap_or("disk").to_string(),
            target_dev: None,
            source_path: None,
            read_only: false,
            shareable: false,
            transient: false,
        };
        for child in node.children().filter(|c| c.is_element()) {
            match child.tag_name().name() {
                "target" => disk.target_dev = child.attribute("dev").map(str::to_string),
                "source" => disk.source_path = child.attribute("file").map(str::to_string),
                "readonly" => disk.read_only = true,
                "shareable" => disk.shareable = true,
                "transient" => disk.transient = true,
                _ => {}
            }
        }
        disks.push(disk);
    }
    Ok(disks)
}

/// Target device names (`sda`, `vda`, ...) of every `disk`-class device.
pub fn block_device_names(xml: &str) -> Result<Vec<String>> {
    Ok(parse_disks(xml)?
        .into_iter()
        .filter(|d| d.device == "disk")
        .filter_map(|d| d.target_dev)
        .collect())
}

/// Backing file paths of every `disk`-class device.
pub fn block_device_paths(xml: &str) -> Result<Vec<String>> {
    Ok(parse_disks(xml)?
        .into_iter()
        .filter(|d| d.device == "disk")
        .filter_map(|d| d.source_path)
        .collect())
}

/// Parse every `<interface>` of the domain device tree, keeping the raw
/// element bytes for rewrites.
pub fn parse_interfaces(xml: &str) -> Result<Vec<InterfaceDevice>> {
    let doc = parse_doc(xml)?;
    let mut out = Vec::new();

    for node in doc.descendants().filter(|n| n.has_tag_name("interface")) {
        // Skip <interface> children of other elements (none exist today in
        // the device tree, but node devices reuse the tag name).
        if node.parent().map(|p| p.tag_name().name()) != Some("devices") {
            continue;
        }

        let start = node.range().start;
        let span = element_span(xml, start, "interface")?;
        let raw = xml[span.clone()].to_string();

        let mut iface = InterfaceDevice {
            type_name: node.attribute("type").unwrap_or_default().to_string(),
            managed: node.attribute("managed").map(|m| m.eq_ignore_ascii_case("yes"))
                == Some(true),
            mac: None,
            source_network: None,
            hostdev_address: None,
            vlan: None,
            raw,
            vlan_span: None,
        };

        for child in node.children().filter(|c| c.is_element()) {
            match child.tag_name().name() {
                "mac" => iface.mac = child.attribute("address").map(str::to_string),
                "source" => {
                    iface.source_network = child.attribute("network").map(str::to_string);
                    if let Some(addr) = child
                        .children()
                        .find(|c| c.has_tag_name("address"))
                        .and_then(PciAddress::from_node)
                    {
                        iface.hostdev_address = Some(addr);
                    }
                }
                "vlan" => {
                    let vlan_abs = element_span(xml, child.range().start, "vlan")?;
                    iface.vlan_span =
                        Some(vlan_abs.start - span.start..vlan_abs.end - span.start);
                    let mut vlan = VlanConfig {
                        trunk: child.attribute("trunk").map(|t| t.eq_ignore_ascii_case("yes"))
                            == Some(true),
                        tags: Vec::new(),
                    };
                    for tag in child.children().filter(|c| c.has_tag_name("tag")) {
                        let Some(id) = tag.attribute("id").and_then(|v| v.parse().ok()) else {
                            continue;
                        };
                        vlan.tags.push(VlanTag {
                            id,
                            native_mode: tag.attribute("nativeMode").map(str::to_string),
                        });
                    }
                    iface.vlan = Some(vlan);
                }
                _ => {}
            }
        }

        out.push(iface);
    }

    if out.is_empty() {
        return Err(Error::Xml(
            "no interfaces in device XML section".to_string(),
        ));
    }
    Ok(out)
}

/// The memballoon stats collection period in seconds.
pub fn memballoon_stats_period(xml: &str) -> Result<u32> {
    let doc = parse_doc(xml)?;
    doc.descendants()
        .find(|n| n.has_tag_name("memballoon"))
        .and_then(|b| b.children().find(|c| c.has_tag_name("stats")))
        .and_then(|s| s.attribute("period"))
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Xml("no memballoon stats period in domain XML".to_string()))
}

/// The hypervisor driver of the domain (the root `type` attribute).
pub fn hypervisor_type(xml: &str) -> Result<String> {
    let doc = parse_doc(xml)?;
    doc.root_element()
        .attribute("type")
        .map(|t| t.to_uppercase())
        .ok_or_else(|| Error::Xml("domain XML has no type attribute".to_string()))
}

/// The runtime security label, when the domain carries one.
pub fn security_label(xml: &str) -> Option<String> {
    let doc = parse_doc(xml).ok()?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("seclabel"))
        .and_then(|s| s.children().find(|c| c.has_tag_name("label")))
        .and_then(|l| l.text())
        .map(|t| t.trim().to_string())
}

/// The `<name>` of a domain definition.
pub fn domain_name(xml: &str) -> Result<String> {
    let doc = parse_doc(xml)?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::Xml("domain XML has no name".to_string()))
}

/// The `<uuid>` of a domain definition.
pub fn domain_uuid(xml: &str) -> Result<String> {
    let doc = parse_doc(xml)?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("uuid"))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::Xml("domain XML has no uuid".to_string()))
}

/// Builder for a new KVM domain definition.
///
/// Emits the fixed machine shape every domain on this host gets: SMBIOS
/// identity, ACPI/APIC, host-model CPU, catchup RTC, virtio-scsi disk
/// controller with I/O caps, virtio input, a guest-agent channel, a
/// memballoon with a 3 s stats period and the network-tuning metadata
/// element consumed by the post-start hook.
pub struct DomainXmlBuilder {
    pub uuid: String,
    pub name: String,
    pub vcpus: u32,
    pub max_vcpus: u32,
    pub memory_kib: u64,
    pub max_memory_kib: u64,
    pub image_path: String,
    pub network: String,
    pub mac: String,
    pub vlan: u32,
}

/// Namespace URI of the custom network-tuning metadata element.
pub const METADATA_NS_URI: &str = "1c5537ac-8c84-4313-a8e7-9dd8d45ac7ed";

impl DomainXmlBuilder {
    pub fn build(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <metadata>
    <my:custom xmlns:my="{ns}">
      <my:network type="max_tx_rate">100</my:network>
      <my:network type="trust">off</my:network>
      <my:network type="spoofchk">on</my:network>
      <my:network type="query_rss">off</my:network>
      <my:network type="qos">0</my:network>
    </my:custom>
  </metadata>
  <memory unit='KiB'>{max_memory}</memory>
  <currentMemory unit='KiB'>{memory}</currentMemory>
  <vcpu placement='static' current='{vcpus}'>{max_vcpus}</vcpu>
  <cputune>
    <shares>1024</shares>
  </cputune>
  <sysinfo type='smbios'>
    <bios>
      <entry name='vendor'>KVM</entry>
    </bios>
    <system>
      <entry name='manufacturer'>KVM</entry>
      <entry name='product'>VM</entry>
    </system>
    <baseBoard>
      <entry name='manufacturer'>KVM</entry>
      <entry name='product'>VM</entry>
    </baseBoard>
  </sysinfo>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
    <smbios mode='sysinfo'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-model' check='partial'>
    <model fallback='allow'/>
  </cpu>
  <clock offset='utc'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <pm>
    <suspend-to-mem enabled='yes'/>
    <suspend-to-disk enabled='no'/>
  </pm>
  <devices>
    <emulator>/usr/bin/kvm-spice</emulator>
    <controller type='scsi' index='0' model='virtio-scsi'/>
    <controller type='usb' index='0' model='ich9-ehci1'/>
    <controller type='pci' index='0' model='pci-root'/>
    <controller type='ide' index='0'/>
    <controller type='virtio-serial' index='0'/>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='directsync' error_policy='enospace' rerror_policy='stop' discard='unmap'/>
      <source file='{image}'/>
      <target dev='sda' bus='scsi'/>
      <iotune>
        <read_iops_sec>1000</read_iops_sec>
        <write_iops_sec>400</write_iops_sec>
        <read_iops_sec_max>1100</read_iops_sec_max>
        <write_iops_sec_max>450</write_iops_sec_max>
        <read_iops_sec_max_length>15</read_iops_sec_max_length>
        <write_iops_sec_max_length>5</write_iops_sec_max_length>
      </iotune>
    </disk>
    <interface type='network'>
      <mac address='{mac}'/>
      <source network='{network}'/>
      <vlan>
        <tag id='{vlan}'/>
      </vlan>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <input type='keyboard' bus='virtio'/>
    <input type='mouse' bus='virtio'/>
    <memballoon model='virtio'>
      <stats period='3'/>
    </memballoon>
  </devices>
</domain>
"#,
            name = escape(&self.name),
            uuid = escape(&self.uuid),
            ns = METADATA_NS_URI,
            max_memory = self.max_memory_kib,
            memory = self.memory_kib,
            vcpus = self.vcpus,
            max_vcpus = self.max_vcpus,
            image = escape(&self.image_path),
            mac = escape(&self.mac),
            network = escape(&self.network),
            vlan = self.vlan,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<domain type='kvm'>
  <name>vm01</name>
  <uuid>7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a</uuid>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/vm01.qcow2'/>
      <target dev='sda' bus='scsi'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/var/lib/libvirt/images/boot.iso'/>
      <target dev='sdb' bus='ide'/>
      <readonly/>
    </disk>
    <interface type='network' managed='yes' custom='keep-me'>
      <mac address='52:54:00:ab:cd:ef'/>
      <source network='pf-enp6s2f0'>
        <address type='pci' domain='0x0000' bus='0x06' slot='0x10' function='0x2'/>
      </source>
      <vlan>
        <tag id='222'/>
      </vlan>
    </interface>
    <memballoon model='virtio'>
      <stats period='3'/>
    </memballoon>
  </devices>
</domain>"#;

    #[test]
    fn disks_are_parsed_with_flags() {
        let disks = parse_disks(FIXTURE).unwrap();
        assert_eq!(disks.len(), 2);
        assert!(disks[0].snapshottable());
        assert!(!disks[1].snapshottable());
        assert_eq!(
            block_device_paths(FIXTURE).unwrap(),
            vec![
                "/var/lib/libvirt/images/vm01.qcow2",
                "/var/lib/libvirt/images/boot.iso"
            ]
        );
        assert_eq!(block_device_names(FIXTURE).unwrap(), vec!["sda"]);
    }

    #[test]
    fn interfaces_expose_pvid_and_pci() {
        let ifaces = parse_interfaces(FIXTURE).unwrap();
        assert_eq!(ifaces.len(), 1);
        let iface = &ifaces[0];
        assert_eq!(iface.mac.as_deref(), Some("52:54:00:ab:cd:ef"));
        assert_eq!(iface.source_network.as_deref(), Some("pf-enp6s2f0"));
        assert_eq!(iface.pvid(), Some(222));
        let pci = iface.hostdev_address.unwrap();
        assert_eq!(pci.to_string(), "0000:06:10.2");
    }

    #[test]
    fn vlan_splice_preserves_unknown_attributes() {
        let ifaces = parse_interfaces(FIXTURE).unwrap();
        let rewritten = ifaces[0].with_pvid(333).unwrap();
        assert!(rewritten.contains("custom='keep-me'"));
        assert!(rewritten.contains("<vlan><tag id='333'/></vlan>"));
        assert!(!rewritten.contains("id='222'"));
        assert!(rewritten.contains("52:54:00:ab:cd:ef"));
    }

    #[test]
    fn vlan_splice_inserts_when_absent() {
        let xml = FIXTURE.replace("<vlan>\n        <tag id='222'/>\n      </vlan>", "");
        let ifaces = parse_interfaces(&xml).unwrap();
        assert_eq!(ifaces[0].pvid(), None);
        let rewritten = ifaces[0].with_pvid(100).unwrap();
        assert!(rewritten.contains("<vlan><tag id='100'/></vlan>"));
        assert!(rewritten.ends_with("</interface>"));
    }

    #[test]
    fn trunk_has_no_pvid() {
        let xml = FIXTURE.replace("<vlan>", "<vlan trunk='yes'>");
        let ifaces = parse_interfaces(&xml).unwrap();
        assert_eq!(ifaces[0].pvid(), None);
    }

    #[test]
    fn memballoon_period() {
        assert_eq!(memballoon_stats_period(FIXTURE).unwrap(), 3);
    }

    #[test]
    fn builder_emits_machine_shape() {
        let xml = DomainXmlBuilder {
            uuid: "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a".to_string(),
            name: "vm01".to_string(),
            vcpus: 2,
            max_vcpus: 16,
            memory_kib: 524288,
            max_memory_kib: 1048576,
            image_path: "/pools/a/vm01.qcow2".to_string(),
            network: "pf-enp6s2f0".to_string(),
            mac: "52:54:00:ab:cd:ef".to_string(),
            vlan: 222,
        }
        .build();

        assert_eq!(domain_name(&xml).unwrap(), "vm01");
        assert_eq!(hypervisor_type(&xml).unwrap(), "KVM");
        assert_eq!(memballoon_stats_period(&xml).unwrap(), 3);
        assert!(xml.contains("<vcpu placement='static' current='2'>16</vcpu>"));
        assert!(xml.contains("<memory unit='KiB'>1048576</memory>"));
        assert!(xml.contains("<currentMemory unit='KiB'>524288</currentMemory>"));
        assert!(xml.contains("cache='directsync'"));
        assert!(xml.contains("org.qemu.guest_agent.0"));
        assert!(xml.contains(METADATA_NS_URI));

        let ifaces = parse_interfaces(&xml).unwrap();
        assert_eq!(ifaces[0].pvid(), Some(222));
        let disks = parse_disks(&xml).unwrap();
        assert_eq!(disks[0].source_path.as_deref(), Some("/pools/a/vm01.qcow2"));
    }
}
