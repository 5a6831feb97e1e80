//! The safety gate: stateless predicates consulted before any mutation.
//!
//! A gate decision is made against a [`DomainCondition`] sampled once at
//! the start of the handler, so a single request sees one consistent view
//! of the domain.

use crate::error::{Error, Result};
use crate::traits::Hypervisor;
use crate::types::SnapshotFilter;
use crate::xml::domain::{block_device_names, block_device_paths};

/// File suffix every live-backup overlay carries; a block path ending in it
/// means a backup never finished merging back.
pub const EXTERNAL_SNAPSHOT_SUFFIX: &str = "external.snapshot.qcow2";

/// The mutation classes whose refusal messages differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Destroy,
    MakeSnapshot,
    DeleteSnapshot,
    RevertSnapshot,
    SetMaxMemory,
    SetMaxVcpus,
    SetPvid,
    SetNetworkSpeed,
}

impl Mutation {
    fn active_refusal(&self) -> &'static str {
        match self {
            Mutation::Destroy => "domain must not be active while being destroyed",
            Mutation::MakeSnapshot => {
                "domain must not be active while creating internal snapshot"
            }
            Mutation::DeleteSnapshot => "domain must not be active while deleting snapshot",
            Mutation::RevertSnapshot => "domain must not be active while reverting to snapshot",
            Mutation::SetMaxMemory => {
                "domain must not be active while setting maximum memory value"
            }
            Mutation::SetMaxVcpus => "domain must not be active while setting maximum vCPU value",
            Mutation::SetPvid => "domain must not be active while setting PVID for network device",
            Mutation::SetNetworkSpeed => {
                "domain must not be active while setting speed for network device"
            }
        }
    }
}

/// One consistent sample of the flags the gate rules on.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainCondition {
    pub active: bool,
    pub block_job_running: bool,
    pub external_backup_leftover: bool,
}

/// The mutation requires a stopped domain.
pub fn require_inactive(cond: &DomainCondition, mutation: Mutation) -> Result<()> {
    if cond.active {
        return Err(Error::gate(mutation.active_refusal()));
    }
    Ok(())
}

/// The mutation requires a running domain.
pub fn require_active_for_backup(cond: &DomainCondition) -> Result<()> {
    if !cond.active {
        return Err(Error::gate("domain must be active while creating backup"));
    }
    Ok(())
}

/// The guest agent is only reachable on a running domain.
pub fn require_active_for_agent(cond: &DomainCondition) -> Result<()> {
    if !cond.active {
        return Err(Error::gate(
            "domain must be active while talking to the guest agent",
        ));
    }
    Ok(())
}

/// Password changes go through the guest agent and need a running domain.
pub fn require_active_for_password(cond: &DomainCondition) -> Result<()> {
    if !cond.active {
        return Err(Error::gate(
            "domain must be active while setting user password",
        ));
    }
    Ok(())
}

/// No mutation may overlap an in-flight block job.
pub fn require_no_block_job(cond: &DomainCondition) -> Result<()> {
    if cond.block_job_running {
        return Err(Error::gate(
            "sanity lock, block device job is currently in process",
        ));
    }
    Ok(())
}

/// Snapshot-related mutations are refused while a broken backup left its
/// overlay in the chain.
pub fn require_no_backup_leftover(cond: &DomainCondition) -> Result<()> {
    if cond.external_backup_leftover {
        return Err(Error::gate(
            "sanity lock, domain has unfinished internal backup",
        ));
    }
    Ok(())
}

/// Same predicate with the wording MakeBackup reports.
pub fn require_no_backup_in_flight(cond: &DomainCondition) -> Result<()> {
    if cond.external_backup_leftover {
        return Err(Error::gate("sanity lock, domain has unfinished backup"));
    }
    Ok(())
}

/// Whether any block device of the domain is in a PULL/COPY/COMMIT/
/// ACTIVE_COMMIT job. A stopped domain cannot have one.
pub async fn block_job_running(hv: &dyn Hypervisor, domain: &str, active: bool) -> Result<bool> {
    if !active {
        return Ok(false);
    }
    let xml = hv.domain_xml(domain, false).await?;
    for dev in block_device_names(&xml)? {
        let Ok(job) = hv.block_job_info(domain, &dev).await else {
            continue;
        };
        if job.kind.is_running() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the domain still carries an external backup snapshot: either a
/// block path ending in the overlay suffix, or a registered external
/// snapshot.
pub async fn has_external_backup_leftover(hv: &dyn Hypervisor, domain: &str) -> Result<bool> {
    let xml = hv.domain_xml(domain, false).await?;
    for path in block_device_paths(&xml)? {
        if path.ends_with(EXTERNAL_SNAPSHOT_SUFFIX) {
            return Ok(true);
        }
    }
    let external = hv.snapshot_names(domain, SnapshotFilter::External).await?;
    Ok(!external.is_empty())
}

/// Sample everything the gate needs in one pass.
pub async fn sample(hv: &dyn Hypervisor, domain: &str) -> Result<DomainCondition> {
    let runtime = hv.domain_runtime(domain).await?;
    let block_job = block_job_running(hv, domain, runtime.active).await?;
    let leftover = has_external_backup_leftover(hv, domain).await?;
    Ok(DomainCondition {
        active: runtime.active,
        block_job_running: block_job,
        external_backup_leftover: leftover,
    })
}

/// Sample only the activity and block job flags, for mutations that do not
/// care about snapshot leftovers.
pub async fn sample_basic(hv: &dyn Hypervisor, domain: &str) -> Result<DomainCondition> {
    let runtime = hv.domain_runtime(domain).await?;
    let block_job = block_job_running(hv, domain, runtime.active).await?;
    Ok(DomainCondition {
        active: runtime.active,
        block_job_running: block_job,
        external_backup_leftover: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(active: bool, job: bool, leftover: bool) -> DomainCondition {
        DomainCondition {
            active,
            block_job_running: job,
            external_backup_leftover: leftover,
        }
    }

    #[test]
    fn truth_table_destroy_class() {
        // destroy / snapshot mutations: need inactive, no job, no leftover
        for active in [false, true] {
            for job in [false, true] {
                for leftover in [false, true] {
                    let c = cond(active, job, leftover);
                    let ok = require_inactive(&c, Mutation::Destroy)
                        .and_then(|_| require_no_block_job(&c))
                        .and_then(|_| require_no_backup_leftover(&c))
                        .is_ok();
                    assert_eq!(ok, !active && !job && !leftover);
                }
            }
        }
    }

    #[test]
    fn truth_table_backup() {
        for active in [false, true] {
            for job in [false, true] {
                for leftover in [false, true] {
                    let c = cond(active, job, leftover);
                    let ok = require_active_for_backup(&c)
                        .and_then(|_| require_no_block_job(&c))
                        .and_then(|_| require_no_backup_in_flight(&c))
                        .is_ok();
                    assert_eq!(ok, active && !job && !leftover);
                }
            }
        }
    }

    #[test]
    fn truth_table_plain_mutation() {
        // memory/vcpu/io mutations only care about block jobs
        for active in [false, true] {
            for job in [false, true] {
                let c = cond(active, job, false);
                assert_eq!(require_no_block_job(&c).is_ok(), !job);
            }
        }
    }

    #[test]
    fn refusal_messages_are_specific() {
        let c = cond(true, false, false);
        assert_eq!(
            require_inactive(&c, Mutation::SetPvid)
                .unwrap_err()
                .to_string(),
            "domain must not be active while setting PVID for network device"
        );
        assert_eq!(
            require_inactive(&c, Mutation::Destroy)
                .unwrap_err()
                .to_string(),
            "domain must not be active while being destroyed"
        );
        let stopped = cond(false, false, false);
        assert_eq!(
            require_active_for_backup(&stopped).unwrap_err().to_string(),
            "domain must be active while creating backup"
        );
        let busy = cond(true, true, false);
        assert_eq!(
            require_no_block_job(&busy).unwrap_err().to_string(),
            "sanity lock, block device job is currently in process"
        );
    }
}
