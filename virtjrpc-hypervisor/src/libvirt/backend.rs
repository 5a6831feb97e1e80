//! The libvirt-backed session.

use async_trait::async_trait;
use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::nodedev::NodeDevice;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{Error, Result};
use crate::info::{parse_meminfo, parse_proc_uptime};
use crate::traits::{Connector, Hypervisor};
use crate::types::*;
use crate::xml::domain as domain_xml;

use super::virsh::{
    self, lookup, lookup_i64, lookup_u64, parse_colon_pairs, parse_eq_pairs,
    parse_space_pairs, Virsh,
};

/// Opens read-only or read-write sessions against the local system URI.
pub struct LibvirtConnector {
    uri: String,
}

impl LibvirtConnector {
    pub fn new(uri: &str) -> Self {
        LibvirtConnector {
            uri: uri.to_string(),
        }
    }
}

impl Default for LibvirtConnector {
    fn default() -> Self {
        LibvirtConnector::new("qemu:///system")
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    async fn connect(&self, mode: AccessMode) -> Result<Box<dyn Hypervisor>> {
        let read_only = mode == AccessMode::ReadOnly;
        let conn = if read_only {
            Connect::open_read_only(Some(&self.uri))
        } else {
            Connect::open(Some(&self.uri))
        }
        .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        debug!(uri = %self.uri, read_only, "connected to local hypervisor");
        Ok(Box::new(LibvirtSession {
            conn,
            virsh: Virsh::new(&self.uri, read_only),
        }))
    }
}

/// One connection plus the virsh shim bound to the same URI.
pub struct LibvirtSession {
    conn: Connect,
    virsh: Virsh,
}

impl Drop for LibvirtSession {
    fn drop(&mut self) {
        // Close reports leaked references; log them, never fail the drop.
        match self.conn.close() {
            Ok(0) => debug!("connection closed: success"),
            Ok(refs) if refs > 0 => warn!(refs, "connection closed: has references"),
            Ok(_) => warn!("connection closed: error"),
            Err(e) => warn!(error = %e, "failed to close connection"),
        }
    }
}

fn native(e: virt::error::Error) -> Error {
    Error::native(e.to_string())
}

impl LibvirtSession {
    fn dom(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.conn, name)
            .map_err(|e| Error::NotFound(format!("failed to find domain: {}, {}", name, e)))
    }

    fn pool(&self, name: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.conn, name)
            .map_err(|e| Error::NotFound(format!("failed to find storage pool: {}, {}", name, e)))
    }

    fn impact_args(impact: Impact) -> &'static [&'static str] {
        match impact {
            Impact::Current => &[],
            Impact::Config => &["--config"],
            Impact::Live => &["--live"],
        }
    }

    fn affect_args(affect: AffectFlags) -> Vec<&'static str> {
        let mut args = Vec::new();
        if affect.config {
            args.push("--config");
        }
        if affect.live {
            args.push("--live");
        }
        args
    }
}

#[async_trait]
impl Hypervisor for LibvirtSession {
    async fn hostname(&self) -> Result<String> {
        self.conn.get_hostname().map_err(native)
    }

    async fn lib_version(&self) -> Result<u64> {
        self.conn.get_lib_version().map_err(native).map(|v| v as u64)
    }

    async fn node_info(&self) -> Result<NodeHardware> {
        let info = self.conn.get_node_info().map_err(native)?;
        Ok(NodeHardware {
            model: info.model,
            memory_kib: info.memory,
            cpus: info.cpus,
            mhz: info.mhz,
            nodes: info.nodes,
            sockets: info.sockets,
            cores: info.cores,
            threads: info.threads,
        })
    }

    async fn node_cpu_stats(&self) -> Result<NodeCpuStats> {
        let out = self.virsh.run(&["nodecpustats"]).await?;
        let pairs = parse_colon_pairs(&out);
        Ok(NodeCpuStats {
            kernel: lookup_u64(&pairs, "system"),
            user: lookup_u64(&pairs, "user"),
            idle: lookup_u64(&pairs, "idle"),
            iowait: lookup_u64(&pairs, "iowait"),
            interrupt: lookup_u64(&pairs, "intr"),
            utilization: 0,
        })
    }

    async fn node_memory_stats(&self) -> Result<NodeMemoryStats> {
        let content = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| Error::Internal(format!("failed to parse /proc/meminfo: {}", e)))?;
        Ok(parse_meminfo(&content))
    }

    async fn node_uptime(&self) -> Result<u64> {
        let content = std::fs::read_to_string("/proc/uptime")?;
        parse_proc_uptime(&content)
    }

    async fn num_of_domains(&self) -> Result<u32> {
        self.conn.num_of_domains().map_err(native)
    }

    async fn num_of_networks(&self) -> Result<u32> {
        self.conn.num_of_networks().map_err(native)
    }

    async fn list_domain_names(&self) -> Result<Vec<String>> {
        let domains = self.conn.list_all_domains(0).map_err(native)?;
        let mut names = Vec::with_capacity(domains.len());
        for dom in domains {
            match dom.get_name() {
                Ok(name) => names.push(name),
                Err(e) => warn!(error = %e, "failed to get domain name"),
            }
        }
        Ok(names)
    }

    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        Ok(Domain::lookup_by_name(&self.conn, domain).is_ok())
    }

    async fn domain_runtime(&self, domain: &str) -> Result<DomainRuntime> {
        let dom = self.dom(domain)?;
        let xml = dom.get_xml_desc(0).map_err(native)?;
        Ok(DomainRuntime {
            name: domain.to_string(),
            uuid: dom.get_uuid_string().map_err(native)?,
            active: dom.is_active().map_err(native)?,
            persistent: dom.is_persistent().map_err(native)?,
            updated: dom.is_updated().unwrap_or(false),
            autostart: dom.get_autostart().unwrap_or(false),
            security_label: domain_xml::security_label(&xml).unwrap_or_default(),
        })
    }

    async fn domain_xml(&self, domain: &str, inactive: bool) -> Result<String> {
        let dom = self.dom(domain)?;
        let flags = if inactive {
            sys::VIR_DOMAIN_XML_INACTIVE
        } else {
            0
        };
        dom.get_xml_desc(flags).map_err(native)
    }

    async fn domain_stats(&self, domain: &str) -> Result<DomainStats> {
        let out = self
            .virsh
            .run(&[
                "domstats", domain, "--state", "--balloon", "--block", "--cpu-total",
                "--vcpu",
            ])
            .await?;
        let pairs = parse_eq_pairs(&out);

        let mut stats = DomainStats {
            balloon_current_kib: lookup_u64(&pairs, "balloon.current"),
            balloon_maximum_kib: lookup_u64(&pairs, "balloon.maximum"),
            cpu_time: lookup_u64(&pairs, "cpu.time"),
            cpu_user: lookup_u64(&pairs, "cpu.user"),
            cpu_system: lookup_u64(&pairs, "cpu.system"),
            ..DomainStats::default()
        };

        if lookup(&pairs, "state.state").is_some() {
            stats.state = Some(RawDomainState {
                state: lookup_u64(&pairs, "state.state") as u32,
                reason: lookup_i64(&pairs, "state.reason") as i32,
            });
        }

        let vcpu_count = lookup_u64(&pairs, "vcpu.current") as usize;
        for i in 0..vcpu_count {
            stats.vcpus.push(VcpuStat {
                state: lookup_i64(&pairs, &format!("vcpu.{}.state", i)) as i32,
                time: lookup_u64(&pairs, &format!("vcpu.{}.time", i)),
            });
        }

        let block_count = lookup_u64(&pairs, "block.count") as usize;
        for i in 0..block_count {
            let key = |suffix: &str| format!("block.{}.{}", i, suffix);
            stats.blocks.push(BlockStat {
                name: lookup(&pairs, &key("name")).unwrap_or_default().to_string(),
                backing_index: lookup_u64(&pairs, &key("backingIndex")),
                path: lookup(&pairs, &key("path")).unwrap_or_default().to_string(),
                rd_reqs: lookup_u64(&pairs, &key("rd.reqs")),
                rd_bytes: lookup_u64(&pairs, &key("rd.bytes")),
                rd_times: lookup_u64(&pairs, &key("rd.times")),
                wr_reqs: lookup_u64(&pairs, &key("wr.reqs")),
                wr_bytes: lookup_u64(&pairs, &key("wr.bytes")),
                wr_times: lookup_u64(&pairs, &key("wr.times")),
                fl_reqs: lookup_u64(&pairs, &key("fl.reqs")),
                fl_times: lookup_u64(&pairs, &key("fl.times")),
                errors: lookup_u64(&pairs, &key("errors")),
                allocation: lookup_u64(&pairs, &key("allocation")),
                capacity: lookup_u64(&pairs, &key("capacity")),
                physical: lookup_u64(&pairs, &key("physical")),
            });
        }

        Ok(stats)
    }

    async fn domain_memory_stats(&self, domain: &str) -> Result<DomainMemoryStats> {
        let out = self.virsh.run(&["dommemstat", domain]).await?;
        let pairs = parse_space_pairs(&out);
        Ok(DomainMemoryStats {
            swap_in: lookup_u64(&pairs, "swap_in"),
            swap_out: lookup_u64(&pairs, "swap_out"),
            major_fault: lookup_u64(&pairs, "major_fault"),
            minor_fault: lookup_u64(&pairs, "minor_fault"),
            unused: lookup_u64(&pairs, "unused"),
            available: lookup_u64(&pairs, "available"),
            actual: lookup_u64(&pairs, "actual"),
            usable: lookup_u64(&pairs, "usable"),
            last_update: lookup_u64(&pairs, "last-update"),
            rss: lookup_u64(&pairs, "rss"),
        })
    }

    async fn current_vcpus(&self, domain: &str) -> Result<u64> {
        let dom = self.dom(domain)?;
        dom.get_vcpus_flags(sys::VIR_DOMAIN_VCPU_CURRENT)
            .map_err(native)
            .map(|v| v as u64)
    }

    async fn max_vcpus(&self, domain: &str) -> Result<u64> {
        let dom = self.dom(domain)?;
        dom.get_max_vcpus().map_err(native).map(|v| v as u64)
    }

    async fn start_domain(&self, domain: &str) -> Result<()> {
        self.dom(domain)?.create().map_err(native)?;
        info!(domain, "started domain");
        Ok(())
    }

    async fn shutdown_domain(&self, domain: &str) -> Result<()> {
        self.dom(domain)?.shutdown().map_err(native)?;
        info!(domain, "domain was shutdown");
        Ok(())
    }

    async fn reboot_domain(&self, domain: &str) -> Result<()> {
        self.dom(domain)?
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(native)?;
        info!(domain, "rebooted domain");
        Ok(())
    }

    async fn reset_domain(&self, domain: &str) -> Result<()> {
        self.virsh.run(&["reset", domain]).await?;
        info!(domain, "hard-reset domain");
        Ok(())
    }

    async fn destroy_domain(&self, domain: &str, graceful: bool) -> Result<()> {
        let dom = self.dom(domain)?;
        let flags = if graceful {
            sys::VIR_DOMAIN_DESTROY_GRACEFUL
        } else {
            sys::VIR_DOMAIN_DESTROY_DEFAULT
        };
        dom.destroy_flags(flags).map_err(native)?;
        info!(domain, "domain destroyed");
        Ok(())
    }

    async fn undefine_domain(&self, domain: &str) -> Result<()> {
        let dom = self.dom(domain)?;
        dom.undefine_flags(
            sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE
                | sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA
                | sys::VIR_DOMAIN_UNDEFINE_NVRAM,
        )
        .map_err(native)?;
        info!(domain, "domain undefined");
        Ok(())
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        Domain::define_xml_flags(&self.conn, xml, sys::VIR_DOMAIN_DEFINE_VALIDATE)
            .map_err(native)?;
        Ok(())
    }

    async fn set_autostart(&self, domain: &str, autostart: bool) -> Result<()> {
        self.dom(domain)?.set_autostart(autostart).map_err(native)?;
        Ok(())
    }

    async fn set_memory(&self, domain: &str, kib: u64, affect: AffectFlags) -> Result<()> {
        let mut flags = sys::VIR_DOMAIN_MEM_CURRENT;
        if affect.config {
            flags |= sys::VIR_DOMAIN_MEM_CONFIG;
        }
        if affect.live {
            flags |= sys::VIR_DOMAIN_MEM_LIVE;
        }
        self.dom(domain)?.set_memory_flags(kib, flags).map_err(native)
    }

    async fn set_max_memory(&self, domain: &str, kib: u64) -> Result<()> {
        self.dom(domain)?
            .set_memory_flags(kib, sys::VIR_DOMAIN_MEM_CONFIG | sys::VIR_DOMAIN_MEM_MAXIMUM)
            .map_err(native)
    }

    async fn set_memory_stats_period(
        &self,
        domain: &str,
        period_secs: i32,
        affect: AffectFlags,
    ) -> Result<()> {
        let period = period_secs.to_string();
        let mut args = vec!["dommemstat", domain, "--period", period.as_str()];
        args.extend(Self::affect_args(affect));
        self.virsh.run(&args).await?;
        Ok(())
    }

    async fn set_vcpus(&self, domain: &str, count: u32, affect: AffectFlags) -> Result<()> {
        let mut flags = sys::VIR_DOMAIN_VCPU_CURRENT;
        if affect.config {
            flags |= sys::VIR_DOMAIN_VCPU_CONFIG;
        }
        if affect.live {
            flags |= sys::VIR_DOMAIN_VCPU_LIVE;
        }
        self.dom(domain)?.set_vcpus_flags(count, flags).map_err(native)
    }

    async fn set_max_vcpus(&self, domain: &str, count: u32) -> Result<()> {
        self.dom(domain)?
            .set_vcpus_flags(
                count,
                sys::VIR_DOMAIN_VCPU_CONFIG
                    | sys::VIR_DOMAIN_VCPU_MAXIMUM
                    | sys::VIR_DOMAIN_VCPU_HOTPLUGGABLE,
            )
            .map_err(native)
    }

    async fn set_scheduler_cpu_shares(
        &self,
        domain: &str,
        shares: u64,
        affect: AffectFlags,
    ) -> Result<()> {
        let setting = format!("cpu_shares={}", shares);
        let mut args = vec!["schedinfo", domain, "--set", setting.as_str()];
        args.extend(Self::affect_args(affect));
        self.virsh.run(&args).await?;
        Ok(())
    }

    async fn set_block_io_tune(
        &self,
        domain: &str,
        device: &str,
        update: IoTuneUpdate,
        affect: AffectFlags,
    ) -> Result<()> {
        let read = update.read_iops_sec.to_string();
        let read_max = update.read_iops_sec_max.to_string();
        let read_len = update.read_iops_sec_max_length.to_string();
        let write = update.write_iops_sec.to_string();
        let write_max = update.write_iops_sec_max.to_string();
        let write_len = update.write_iops_sec_max_length.to_string();

        let mut args = vec![
            "blkdeviotune",
            domain,
            device,
            "--read-iops-sec",
            read.as_str(),
            "--read-iops-sec-max",
            read_max.as_str(),
            "--read-iops-sec-max-length",
            read_len.as_str(),
            "--write-iops-sec",
            write.as_str(),
            "--write-iops-sec-max",
            write_max.as_str(),
            "--write-iops-sec-max-length",
            write_len.as_str(),
        ];
        args.extend(Self::affect_args(affect));
        self.virsh.run(&args).await?;
        Ok(())
    }

    async fn block_io_tune(
        &self,
        domain: &str,
        device: &str,
        impact: Impact,
    ) -> Result<IoTuneParams> {
        let mut args = vec!["blkdeviotune", domain, device];
        args.extend_from_slice(Self::impact_args(impact));
        let out = self.virsh.run(&args).await?;
        let pairs = parse_colon_pairs(&out);
        Ok(IoTuneParams {
            read_bytes_sec: lookup_u64(&pairs, "read_bytes_sec"),
            read_bytes_sec_max: lookup_u64(&pairs, "read_bytes_sec_max"),
            read_bytes_sec_max_length: lookup_u64(&pairs, "read_bytes_sec_max_length"),
            read_iops_sec: lookup_u64(&pairs, "read_iops_sec"),
            read_iops_sec_max: lookup_u64(&pairs, "read_iops_sec_max"),
            read_iops_sec_max_length: lookup_u64(&pairs, "read_iops_sec_max_length"),
            size_iops_sec: lookup_u64(&pairs, "size_iops_sec"),
            total_bytes_sec: lookup_u64(&pairs, "total_bytes_sec"),
            total_bytes_sec_max: lookup_u64(&pairs, "total_bytes_sec_max"),
            total_bytes_sec_max_length: lookup_u64(&pairs, "total_bytes_sec_max_length"),
            total_iops_sec: lookup_u64(&pairs, "total_iops_sec"),
            total_iops_sec_max: lookup_u64(&pairs, "total_iops_sec_max"),
            total_iops_sec_max_length: lookup_u64(&pairs, "total_iops_sec_max_length"),
            write_bytes_sec: lookup_u64(&pairs, "write_bytes_sec"),
            write_bytes_sec_max: lookup_u64(&pairs, "write_bytes_sec_max"),
            write_bytes_sec_max_length: lookup_u64(&pairs, "write_bytes_sec_max_length"),
            write_iops_sec: lookup_u64(&pairs, "write_iops_sec"),
            write_iops_sec_max: lookup_u64(&pairs, "write_iops_sec_max"),
            write_iops_sec_max_length: lookup_u64(&pairs, "write_iops_sec_max_length"),
            group_name: lookup(&pairs, "group_name").unwrap_or_default().to_string(),
        })
    }

    async fn blkio_params(&self, domain: &str, impact: Impact) -> Result<BlkioParams> {
        let mut args = vec!["blkiotune", domain];
        args.extend_from_slice(Self::impact_args(impact));
        let out = self.virsh.run(&args).await?;
        let pairs = parse_colon_pairs(&out);
        Ok(BlkioParams {
            weight: lookup_u64(&pairs, "weight") as u32,
            device_weight: lookup(&pairs, "device_weight").unwrap_or_default().to_string(),
            device_read_iops: lookup(&pairs, "device_read_iops_sec")
                .unwrap_or_default()
                .to_string(),
            device_write_iops: lookup(&pairs, "device_write_iops_sec")
                .unwrap_or_default()
                .to_string(),
            device_read_bps: lookup(&pairs, "device_read_bytes_sec")
                .unwrap_or_default()
                .to_string(),
            device_write_bps: lookup(&pairs, "device_write_bytes_sec")
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn scheduler_info(&self, domain: &str, impact: Impact) -> Result<SchedulerParams> {
        let mut args = vec!["schedinfo", domain];
        args.extend_from_slice(Self::impact_args(impact));
        let out = self.virsh.run(&args).await?;
        let pairs = parse_colon_pairs(&out);
        Ok(SchedulerParams {
            type_name: lookup(&pairs, "Scheduler").unwrap_or_default().to_string(),
            cpu_shares: lookup_u64(&pairs, "cpu_shares"),
            global_period: lookup_u64(&pairs, "global_period"),
            global_quota: lookup_i64(&pairs, "global_quota"),
            vcpu_period: lookup_u64(&pairs, "vcpu_period"),
            vcpu_quota: lookup_i64(&pairs, "vcpu_quota"),
            emulator_period: lookup_u64(&pairs, "emulator_period"),
            emulator_quota: lookup_i64(&pairs, "emulator_quota"),
            iothread_period: lookup_u64(&pairs, "iothread_period"),
            iothread_quota: lookup_i64(&pairs, "iothread_quota"),
        })
    }

    async fn metadata(&self, domain: &str, uri: &str) -> Result<String> {
        self.virsh.run(&["metadata", domain, "--uri", uri]).await
    }

    async fn set_metadata(&self, domain: &str, xml: &str, key: &str, uri: &str) -> Result<()> {
        self.virsh
            .run(&[
                "metadata", domain, "--uri", uri, "--key", key, "--set", xml,
            ])
            .await?;
        Ok(())
    }

    async fn attach_device(&self, domain: &str, xml: &str) -> Result<()> {
        self.dom(domain)?
            .attach_device_flags(xml, sys::VIR_DOMAIN_DEVICE_MODIFY_CURRENT)
            .map_err(native)
    }

    async fn detach_device(&self, domain: &str, xml: &str) -> Result<()> {
        self.dom(domain)?
            .detach_device_flags(xml, sys::VIR_DOMAIN_DEVICE_MODIFY_CURRENT)
            .map_err(native)
    }

    async fn block_job_info(&self, domain: &str, device: &str) -> Result<BlockJobInfo> {
        let out = self
            .virsh
            .run(&["blockjob", domain, device, "--info", "--raw", "--bytes"])
            .await?;
        virsh::parse_block_job(&out)
    }

    async fn block_commit_active(&self, domain: &str, device: &str) -> Result<()> {
        self.virsh
            .run(&["blockcommit", domain, device, "--active", "--shallow"])
            .await?;
        Ok(())
    }

    async fn block_job_pivot(&self, domain: &str, device: &str) -> Result<()> {
        self.virsh
            .run(&["blockjob", domain, device, "--pivot", "--async"])
            .await?;
        Ok(())
    }

    async fn snapshot_names(&self, domain: &str, filter: SnapshotFilter) -> Result<Vec<String>> {
        let mut args = vec!["snapshot-list", domain, "--name"];
        match filter {
            SnapshotFilter::All => {}
            SnapshotFilter::Roots => args.push("--roots"),
            SnapshotFilter::Internal => args.push("--internal"),
            SnapshotFilter::External => args.push("--external"),
            SnapshotFilter::DiskOnly => args.push("--disk-only"),
            SnapshotFilter::Active => args.push("--active"),
            SnapshotFilter::Inactive => args.push("--inactive"),
            SnapshotFilter::Metadata => args.push("--metadata"),
            SnapshotFilter::NoMetadata => args.push("--no-metadata"),
            SnapshotFilter::Leaves => args.push("--leaves"),
            SnapshotFilter::NoLeaves => args.push("--no-leaves"),
        }
        let out = self.virsh.run(&args).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn create_snapshot(
        &self,
        domain: &str,
        xml: &str,
        flags: SnapshotCreateFlags,
    ) -> Result<()> {
        let mut args = vec!["snapshot-create", domain, "--xmlfile", "/dev/stdin"];
        if flags.disk_only {
            args.push("--disk-only");
        }
        if flags.quiesce {
            args.push("--quiesce");
        }
        if flags.atomic {
            args.push("--atomic");
        }
        if flags.no_metadata {
            args.push("--no-metadata");
        }
        if flags.halt {
            args.push("--halt");
        }
        self.virsh.run_with_stdin(&args, Some(xml)).await?;
        Ok(())
    }

    async fn delete_snapshot(&self, domain: &str, name: &str) -> Result<()> {
        self.virsh.run(&["snapshot-delete", domain, name]).await?;
        Ok(())
    }

    async fn revert_snapshot(&self, domain: &str, name: &str) -> Result<()> {
        self.virsh.run(&["snapshot-revert", domain, name]).await?;
        Ok(())
    }

    async fn snapshot_children_count(&self, domain: &str, name: &str) -> Result<i64> {
        let out = self
            .virsh
            .run(&["snapshot-info", domain, "--snapshotname", name])
            .await?;
        let pairs = parse_colon_pairs(&out);
        Ok(lookup_i64(&pairs, "Children"))
    }

    async fn snapshot_parent(&self, domain: &str, name: &str) -> Result<Option<String>> {
        let out = self
            .virsh
            .run(&["snapshot-info", domain, "--snapshotname", name])
            .await?;
        let pairs = parse_colon_pairs(&out);
        Ok(lookup(&pairs, "Parent")
            .filter(|p| !p.is_empty() && *p != "-")
            .map(str::to_string))
    }

    async fn snapshot_is_current(&self, domain: &str, name: &str) -> Result<bool> {
        let out = self
            .virsh
            .run(&["snapshot-info", domain, "--snapshotname", name])
            .await?;
        let pairs = parse_colon_pairs(&out);
        Ok(lookup(&pairs, "Current") == Some("yes"))
    }

    async fn list_pool_names(&self, filter: PoolFilter) -> Result<Vec<String>> {
        let flags = match filter {
            PoolFilter::Directory => sys::VIR_CONNECT_LIST_STORAGE_POOLS_DIR,
            PoolFilter::DirectoryActive => {
                sys::VIR_CONNECT_LIST_STORAGE_POOLS_DIR
                    | sys::VIR_CONNECT_LIST_STORAGE_POOLS_ACTIVE
            }
            PoolFilter::ActivePersistent => {
                sys::VIR_CONNECT_LIST_STORAGE_POOLS_ACTIVE
                    | sys::VIR_CONNECT_LIST_STORAGE_POOLS_PERSISTENT
            }
        };
        let pools = self.conn.list_all_storage_pools(flags).map_err(native)?;
        let mut names = Vec::with_capacity(pools.len());
        for pool in pools {
            match pool.get_name() {
                Ok(name) => names.push(name),
                Err(e) => warn!(error = %e, "failed to get storage pool name"),
            }
        }
        Ok(names)
    }

    async fn pool_info(&self, pool: &str) -> Result<PoolInfo> {
        let info = self.pool(pool)?.get_info().map_err(native)?;
        let state = match info.state {
            sys::VIR_STORAGE_POOL_INACTIVE => PoolState::Inactive,
            sys::VIR_STORAGE_POOL_BUILDING => PoolState::Building,
            sys::VIR_STORAGE_POOL_RUNNING => PoolState::Running,
            sys::VIR_STORAGE_POOL_DEGRADED => PoolState::Degraded,
            sys::VIR_STORAGE_POOL_INACCESSIBLE => PoolState::Inaccessible,
            _ => PoolState::Unknown,
        };
        Ok(PoolInfo {
            state,
            capacity: info.capacity,
            allocation: info.allocation,
            available: info.available,
        })
    }

    async fn pool_xml(&self, pool: &str) -> Result<String> {
        self.pool(pool)?.get_xml_desc(0).map_err(native)
    }

    async fn pool_is_active(&self, pool: &str) -> Result<bool> {
        self.pool(pool)?.is_active().map_err(native)
    }

    async fn pool_is_persistent(&self, pool: &str) -> Result<bool> {
        self.pool(pool)?.is_persistent().map_err(native)
    }

    async fn pool_autostart(&self, pool: &str) -> Result<bool> {
        self.pool(pool)?.get_autostart().map_err(native)
    }

    async fn pool_volume_names(&self, pool: &str) -> Result<Vec<String>> {
        let pool = self.pool(pool)?;
        let volumes = pool.list_all_volumes(0).map_err(native)?;
        let mut names = Vec::with_capacity(volumes.len());
        for vol in volumes {
            match vol.get_name() {
                Ok(name) => names.push(name),
                Err(e) => warn!(error = %e, "failed to get storage volume name"),
            }
        }
        Ok(names)
    }

    async fn refresh_pool(&self, pool: &str) -> Result<()> {
        self.pool(pool)?.refresh(0).map_err(native)
    }

    async fn volume_xml(&self, pool: &str, volume: &str) -> Result<String> {
        let pool = self.pool(pool)?;
        let vol = StorageVol::lookup_by_name(&pool, volume).map_err(|e| {
            Error::NotFound(format!("failed to find storage volume: {}, {}", volume, e))
        })?;
        vol.get_xml_desc(0).map_err(native)
    }

    async fn clone_volume(&self, pool: &str, source: &str, xml: &str) -> Result<()> {
        let pool = self.pool(pool)?;
        let src = StorageVol::lookup_by_name(&pool, source).map_err(|e| {
            Error::NotFound(format!("failed to find storage volume: {}, {}", source, e))
        })?;
        StorageVol::create_xml_from(&pool, xml, &src, 0).map_err(native)?;
        Ok(())
    }

    async fn find_volume_by_path(&self, path: &str) -> Result<Option<VolumeRef>> {
        // Lookup failure is the ordinary "no such volume" outcome here; the
        // native error does not distinguish missing from broken.
        let Ok(vol) = StorageVol::lookup_by_path(&self.conn, path) else {
            return Ok(None);
        };
        let name = vol.get_name().map_err(native)?;
        let pool = StoragePool::lookup_by_volume(&vol)
            .map_err(native)?
            .get_name()
            .map_err(native)?;
        Ok(Some(VolumeRef {
            pool,
            name,
            path: path.to_string(),
        }))
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        let pool = self.pool(pool)?;
        let vol = StorageVol::lookup_by_name(&pool, volume).map_err(|e| {
            Error::NotFound(format!("failed to find storage volume: {}, {}", volume, e))
        })?;
        vol.delete(sys::VIR_STORAGE_VOL_DELETE_NORMAL).map_err(native)
    }

    async fn list_network_names(&self) -> Result<Vec<String>> {
        let flags = sys::VIR_CONNECT_LIST_NETWORKS_ACTIVE
            | sys::VIR_CONNECT_LIST_NETWORKS_PERSISTENT
            | sys::VIR_CONNECT_LIST_NETWORKS_AUTOSTART;
        let networks = self.conn.list_all_networks(flags).map_err(native)?;
        let mut names = Vec::with_capacity(networks.len());
        for net in networks {
            match net.get_name() {
                Ok(name) => names.push(name),
                Err(e) => warn!(error = %e, "failed to get network name"),
            }
        }
        Ok(names)
    }

    async fn network_xml(&self, network: &str) -> Result<String> {
        let net = Network::lookup_by_name(&self.conn, network).map_err(|e| {
            Error::NotFound(format!("network {} does not exist: {}", network, e))
        })?;
        net.get_xml_desc(0).map_err(native)
    }

    async fn network_exists(&self, network: &str) -> Result<bool> {
        Ok(Network::lookup_by_name(&self.conn, network).is_ok())
    }

    async fn list_net_node_devices(&self) -> Result<Vec<String>> {
        let devs = self
            .conn
            .list_all_node_devices(sys::VIR_CONNECT_LIST_NODE_DEVICES_CAP_NET)
            .map_err(native)?;
        let mut names = Vec::with_capacity(devs.len());
        for dev in devs {
            match dev.get_name() {
                Ok(name) => names.push(name),
                Err(e) => warn!(error = %e, "failed to get node device name"),
            }
        }
        Ok(names)
    }

    async fn node_device_xml(&self, name: &str) -> Result<String> {
        let dev = NodeDevice::lookup_by_name(&self.conn, name)
            .map_err(|e| Error::NotFound(format!("failed to find device {}: {}", name, e)))?;
        dev.get_xml_desc(0).map_err(native)
    }

    async fn agent_command(&self, domain: &str, command: &str) -> Result<String> {
        self.virsh
            .run(&["qemu-agent-command", domain, command])
            .await
            .map_err(|e| Error::Agent(e.to_string()))
    }

    async fn set_user_password(&self, domain: &str, user: &str, password: &str) -> Result<()> {
        self.virsh
            .run(&["set-user-password", domain, user, password])
            .await?;
        Ok(())
    }
}
