//! Storage volume XML: parsing and the clone rewrite.

use crate::error::{Error, Result};

use super::{escape, parse_doc};

/// Parsed storage volume descriptor.
#[derive(Debug, Clone, Default)]
pub struct VolumeDesc {
    pub name: String,
    pub key: Option<String>,
    pub target_path: Option<String>,
    pub format: Option<String>,
    pub has_backing_store: bool,
}

pub fn parse(xml: &str) -> Result<VolumeDesc> {
    let doc = parse_doc(xml)?;
    let root = doc.root_element();
    let mut desc = VolumeDesc::default();

    for child in root.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "name" => desc.name = child.text().unwrap_or_default().trim().to_string(),
            "key" => desc.key = child.text().map(|t| t.trim().to_string()),
            "backingStore" => desc.has_backing_store = true,
            "target" => {
                desc.target_path = child
                    .children()
                    .find(|c| c.has_tag_name("path"))
                    .and_then(|p| p.text())
                    .map(|t| t.trim().to_string());
                desc.format = child
                    .children()
                    .find(|c| c.has_tag_name("format"))
                    .and_then(|f| f.attribute("type"))
                    .map(str::to_string);
            }
            _ => {}
        }
    }

    Ok(desc)
}

/// Produce the XML a clone of `source_xml` is created from: same format,
/// fresh name/key/target path, with size accounting, timestamps and any
/// backing store stripped so the driver recomputes them for the new file.
///
/// Cloning a volume that itself has a backing store is refused: the clone
/// would silently share state with the backing chain.
pub fn clone_volume_xml(source_xml: &str, new_name: &str, new_path: &str) -> Result<String> {
    let desc = parse(source_xml)?;

    if desc.has_backing_store {
        return Err(Error::validation(
            "not cloning, volume has a backing store",
        ));
    }
    if desc.target_path.is_none() {
        return Err(Error::validation(
            "not cloning, volume has no target description",
        ));
    }

    let format = desc.format.as_deref().unwrap_or("qcow2");

    Ok(format!(
        r#"<volume type='file'>
  <name>{name}</name>
  <key>{key}</key>
  <target>
    <path>{path}</path>
    <format type='{format}'/>
  </target>
</volume>"#,
        name = escape(new_name),
        key = escape(new_path),
        path = escape(new_path),
        format = escape(format),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<volume type='file'>
  <name>ubuntu-22.04.qcow2</name>
  <key>/var/lib/libvirt/images/ubuntu-22.04.qcow2</key>
  <capacity unit='bytes'>21474836480</capacity>
  <allocation unit='bytes'>2147483648</allocation>
  <physical unit='bytes'>2147483649</physical>
  <target>
    <path>/var/lib/libvirt/images/ubuntu-22.04.qcow2</path>
    <format type='qcow2'/>
    <timestamps><mtime>1600000000</mtime></timestamps>
  </target>
</volume>"#;

    #[test]
    fn clone_rewrites_identity_and_strips_accounting() {
        let xml =
            clone_volume_xml(FIXTURE, "vm01.qcow2", "/var/lib/libvirt/images/vm01.qcow2")
                .unwrap();
        let desc = parse(&xml).unwrap();
        assert_eq!(desc.name, "vm01.qcow2");
        assert_eq!(desc.key.as_deref(), Some("/var/lib/libvirt/images/vm01.qcow2"));
        assert_eq!(
            desc.target_path.as_deref(),
            Some("/var/lib/libvirt/images/vm01.qcow2")
        );
        assert_eq!(desc.format.as_deref(), Some("qcow2"));
        assert!(!xml.contains("capacity"));
        assert!(!xml.contains("allocation"));
        assert!(!xml.contains("physical"));
        assert!(!xml.contains("timestamps"));
    }

    #[test]
    fn backing_store_refuses_clone() {
        let xml = FIXTURE.replace(
            "<target>",
            "<backingStore><path>/base.qcow2</path></backingStore><target>",
        );
        let err = clone_volume_xml(&xml, "x", "/x").unwrap_err();
        assert!(err.to_string().contains("backing store"));
    }
}
