//! Storage pool XML.

use crate::error::{Error, Result};

use super::parse_doc;

/// The target filesystem path of a directory-based pool.
pub fn target_path(xml: &str) -> Result<String> {
    let doc = parse_doc(xml)?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("target"))
        .and_then(|t| t.children().find(|c| c.has_tag_name("path")))
        .and_then(|p| p.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::Xml("empty target in storage pool XML".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_target_path() {
        let xml = r#"<pool type='dir'>
  <name>pool-a</name>
  <target>
    <path>/var/lib/libvirt/images</path>
    <permissions><mode>0711</mode></permissions>
  </target>
</pool>"#;
        assert_eq!(target_path(xml).unwrap(), "/var/lib/libvirt/images");
    }

    #[test]
    fn missing_target_is_an_error() {
        let err = target_path("<pool type='dir'><name>x</name></pool>").unwrap_err();
        assert!(err.to_string().contains("empty target"));
    }
}
