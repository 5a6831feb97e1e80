//! Snapshot operations and the flag-membership listing.

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::traits::Hypervisor;
use crate::types::{SnapshotCreateFlags, SnapshotFilter};
use crate::xml::domain::parse_disks;
use crate::xml::snapshot::build_snapshot_xml;

/// Take an internal snapshot of a stopped domain covering every writable
/// disk. The HALT flag keeps the domain down if libvirt decided to start it
/// for the operation.
pub async fn make_internal_snapshot(
    hv: &dyn Hypervisor,
    domain: &str,
    name: &str,
) -> Result<()> {
    let xml = hv.domain_xml(domain, true).await?;
    let disks = parse_disks(&xml)?;
    let snapshot_xml = build_snapshot_xml(domain, name, &disks, true, Utc::now())?;
    hv.create_snapshot(domain, &snapshot_xml, SnapshotCreateFlags::internal_halt())
        .await?;
    info!(domain, name, "created internal domain snapshot");
    Ok(())
}

pub async fn remove_snapshot(hv: &dyn Hypervisor, domain: &str, name: &str) -> Result<()> {
    hv.delete_snapshot(domain, name).await?;
    info!(domain, name, "deleted domain snapshot");
    Ok(())
}

pub async fn revert_to_snapshot(hv: &dyn Hypervisor, domain: &str, name: &str) -> Result<()> {
    hv.revert_snapshot(domain, name).await?;
    info!(domain, name, "reverted domain to snapshot");
    Ok(())
}

/// One snapshot of a domain with its flag memberships. Failures while
/// resolving individual fields are accumulated instead of aborting the
/// listing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Parent")]
    pub parent: String,
    #[serde(rename = "ChildrenCount")]
    pub children_count: i64,
    #[serde(rename = "IsCurrent")]
    pub is_current: bool,
    #[serde(rename = "IsInternal")]
    pub is_internal: bool,
    #[serde(rename = "IsExternal")]
    pub is_external: bool,
    #[serde(rename = "IsDiskOnly")]
    pub is_disk_only: bool,
    #[serde(rename = "WasActive")]
    pub was_active: bool,
    #[serde(rename = "WasInactive")]
    pub was_inactive: bool,
    #[serde(rename = "HasMetadata")]
    pub has_metadata: bool,
    #[serde(rename = "HasNoMetadata")]
    pub has_no_metadata: bool,
    #[serde(rename = "HasChildren")]
    pub has_children: bool,
    #[serde(rename = "HasNoChildren")]
    pub has_no_children: bool,
    #[serde(rename = "HasNoParents")]
    pub has_no_parents: bool,
    #[serde(rename = "Error")]
    pub error: bool,
    #[serde(rename = "ErrorMessage")]
    pub error_message: Vec<String>,
}

fn sanitize(name: &str) -> String {
    name.trim().to_lowercase()
}

struct FlagList {
    names: Vec<String>,
    error: Option<String>,
}

async fn flag_list(hv: &dyn Hypervisor, domain: &str, filter: SnapshotFilter) -> FlagList {
    match hv.snapshot_names(domain, filter).await {
        Ok(names) => FlagList {
            names: names.iter().map(|n| sanitize(n)).collect(),
            error: None,
        },
        Err(e) => FlagList {
            names: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

impl FlagList {
    fn contains(&self, name: &str, entry: &mut SnapshotEntry) -> bool {
        if let Some(e) = &self.error {
            entry.error = true;
            entry.error_message.push(e.clone());
            return false;
        }
        self.names.iter().any(|n| n == name)
    }
}

/// List every snapshot of a domain with the full flag matrix, children
/// count and parent name (roots get `/`).
pub async fn list_snapshots(hv: &dyn Hypervisor, domain: &str) -> Vec<SnapshotEntry> {
    let Ok(all) = hv.snapshot_names(domain, SnapshotFilter::All).await else {
        return Vec::new();
    };

    let roots = flag_list(hv, domain, SnapshotFilter::Roots).await;
    let internal = flag_list(hv, domain, SnapshotFilter::Internal).await;
    let external = flag_list(hv, domain, SnapshotFilter::External).await;
    let disk_only = flag_list(hv, domain, SnapshotFilter::DiskOnly).await;
    let active = flag_list(hv, domain, SnapshotFilter::Active).await;
    let inactive = flag_list(hv, domain, SnapshotFilter::Inactive).await;
    let metadata = flag_list(hv, domain, SnapshotFilter::Metadata).await;
    let no_metadata = flag_list(hv, domain, SnapshotFilter::NoMetadata).await;
    let leaves = flag_list(hv, domain, SnapshotFilter::Leaves).await;
    let no_leaves = flag_list(hv, domain, SnapshotFilter::NoLeaves).await;

    let mut entries = Vec::with_capacity(all.len());

    for name in all {
        let mut entry = SnapshotEntry {
            name: name.clone(),
            ..SnapshotEntry::default()
        };
        let key = sanitize(&name);

        entry.children_count = hv
            .snapshot_children_count(domain, &name)
            .await
            .unwrap_or(0);

        entry.has_no_parents = roots.contains(&key, &mut entry);
        if entry.has_no_parents {
            entry.parent = "/".to_string();
        } else {
            match hv.snapshot_parent(domain, &name).await {
                Ok(parent) => entry.parent = parent.unwrap_or_default(),
                Err(e) => {
                    entry.error = true;
                    entry.error_message.push(e.to_string());
                }
            }
        }

        match hv.snapshot_is_current(domain, &name).await {
            Ok(current) => entry.is_current = current,
            Err(e) => {
                entry.error = true;
                entry.error_message.push(e.to_string());
            }
        }

        entry.is_internal = internal.contains(&key, &mut entry);
        entry.is_external = external.contains(&key, &mut entry);
        entry.is_disk_only = disk_only.contains(&key, &mut entry);
        entry.was_active = active.contains(&key, &mut entry);
        entry.was_inactive = inactive.contains(&key, &mut entry);
        entry.has_metadata = metadata.contains(&key, &mut entry);
        entry.has_no_metadata = no_metadata.contains(&key, &mut entry);
        entry.has_no_children = leaves.contains(&key, &mut entry);
        entry.has_children = no_leaves.contains(&key, &mut entry);

        entries.push(entry);
    }

    entries
}
