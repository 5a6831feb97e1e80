//! Snapshot XML generation.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

use super::domain::DiskDevice;
use super::escape;

/// Build the `<domainsnapshot>` document covering every snapshottable disk
/// of the domain. `internal` picks the per-disk snapshot mode; external
/// snapshots grow an overlay file next to each disk image.
pub fn build_snapshot_xml(
    domain: &str,
    name: &str,
    disks: &[DiskDevice],
    internal: bool,
    at: DateTime<Utc>,
) -> Result<String> {
    let mode = if internal { "internal" } else { "external" };

    let mut disks_xml = String::new();
    for disk in disks.iter().filter(|d| d.snapshottable()) {
        let Some(dev) = &disk.target_dev else {
            continue;
        };
        disks_xml.push_str(&format!(
            "<disk name='{}' snapshot='{}'/>",
            escape(dev),
            mode
        ));
    }

    if disks_xml.is_empty() {
        return Err(Error::Xml("no disk found".to_string()));
    }

    let description = format!(
        "snapshot named as: {}; for: {}; taken at: {}",
        name,
        domain,
        at.to_rfc3339()
    );

    Ok(format!(
        r#"<domainsnapshot>
  <name>{}</name>
  <description>{}</description>
  <disks>{}</disks>
</domainsnapshot>"#,
        escape(name),
        escape(&description),
        disks_xml
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(dev: &str, read_only: bool) -> DiskDevice {
        DiskDevice {
            device: "disk".to_string(),
            target_dev: Some(dev.to_string()),
            source_path: Some(format!("/var/lib/libvirt/images/{}.qcow2", dev)),
            read_only,
            shareable: false,
            transient: false,
        }
    }

    #[test]
    fn covers_writable_disks_only() {
        let xml = build_snapshot_xml(
            "vm01",
            "external.snapshot.qcow2",
            &[disk("sda", false), disk("sdb", true)],
            false,
            Utc::now(),
        )
        .unwrap();
        assert!(xml.contains("<disk name='sda' snapshot='external'/>"));
        assert!(!xml.contains("sdb"));
        assert!(xml.contains("<name>external.snapshot.qcow2</name>"));
        assert!(xml.contains("for: vm01"));
    }

    #[test]
    fn internal_mode() {
        let xml =
            build_snapshot_xml("vm01", "pre-upgrade", &[disk("sda", false)], true, Utc::now())
                .unwrap();
        assert!(xml.contains("snapshot='internal'"));
    }

    #[test]
    fn no_eligible_disk_is_an_error() {
        let err = build_snapshot_xml("vm01", "s", &[disk("sda", true)], true, Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("no disk found"));
    }
}
