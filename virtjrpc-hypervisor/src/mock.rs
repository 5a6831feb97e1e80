//! In-memory hypervisor backend.
//!
//! Models a small host (domains, directory pools with volumes, hostdev
//! networks, node devices, scripted guest agents) well enough to drive
//! every protocol in this crate without a running libvirt. Used by the
//! test suites and by the daemon's development mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::traits::{Connector, Hypervisor};
use crate::types::*;
use crate::xml::domain as domain_xml;
use crate::xml::{volume as volume_xml, PciAddress};

/// Scripted guest-agent: maps a raw command JSON to a raw response JSON.
pub type AgentHandler = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MockSnapshot {
    pub name: String,
    pub internal: bool,
    pub disk_only: bool,
    pub active_at_creation: bool,
    pub has_metadata: bool,
    pub current: bool,
    pub parent: Option<String>,
}

#[derive(Clone, Default)]
pub struct MockVolume {
    pub path: String,
}

#[derive(Clone, Default)]
pub struct MockPool {
    pub target_path: String,
    pub info: PoolInfo,
    pub active: bool,
    pub persistent: bool,
    pub autostart: bool,
    pub volumes: BTreeMap<String, MockVolume>,
}

#[derive(Clone, Default)]
pub struct MockDomain {
    pub xml: String,
    pub inactive_xml: Option<String>,
    pub active: bool,
    pub persistent: bool,
    pub updated: bool,
    pub autostart: bool,
    pub uuid: String,
    pub security_label: String,
    pub state: RawDomainState,
    pub memory_stats: DomainMemoryStats,
    pub balloon_current_kib: u64,
    pub balloon_maximum_kib: u64,
    pub current_vcpus: u64,
    pub max_vcpus: u64,
    pub block_jobs: HashMap<String, BlockJobInfo>,
    /// dev -> (overlay path, original path) while a backup overlay exists.
    pub overlays: HashMap<String, (String, String)>,
    pub snapshots: Vec<MockSnapshot>,
    /// namespace URI -> metadata element
    pub metadata: HashMap<String, String>,
    pub io_tune: HashMap<String, IoTuneParams>,
    pub scheduler: SchedulerParams,
    pub blkio: BlkioParams,
    pub memory_stats_period: i32,
    pub passwords: HashMap<String, String>,
    pub agent: Option<AgentHandler>,
}

/// The whole host.
pub struct HostModel {
    pub hostname: String,
    pub lib_version: u64,
    pub node: NodeHardware,
    pub cpu_stats: NodeCpuStats,
    pub memory: NodeMemoryStats,
    pub uptime_ns: u64,
    pub domains: BTreeMap<String, MockDomain>,
    pub pools: BTreeMap<String, MockPool>,
    /// network name -> network XML
    pub networks: BTreeMap<String, String>,
    /// node device name -> device XML
    pub node_devices: BTreeMap<String, String>,
}

impl Default for HostModel {
    fn default() -> Self {
        HostModel {
            hostname: "hv01.local".to_string(),
            lib_version: 8_000_000,
            node: NodeHardware {
                model: "x86_64".to_string(),
                memory_kib: 64 * 1024 * 1024,
                cpus: 16,
                mhz: 2400,
                nodes: 1,
                sockets: 1,
                cores: 8,
                threads: 2,
            },
            cpu_stats: NodeCpuStats::default(),
            memory: NodeMemoryStats {
                total: 64 * 1024 * 1024,
                available: 48 * 1024 * 1024,
                used: 8 * 1024 * 1024,
                free: 40 * 1024 * 1024,
                ..NodeMemoryStats::default()
            },
            uptime_ns: 3_600_000_000_000,
            domains: BTreeMap::new(),
            pools: BTreeMap::new(),
            networks: BTreeMap::new(),
            node_devices: BTreeMap::new(),
        }
    }
}

// -- fixtures ---------------------------------------------------------------

/// One interface of a domain fixture.
#[derive(Clone)]
pub struct FixtureInterface {
    pub mac: String,
    pub network: String,
    pub vlan: Option<u32>,
    pub hostdev: Option<PciAddress>,
}

/// Render a domain XML the parsers in this crate understand, shaped like
/// the definitions the daemon itself produces.
pub fn domain_xml_fixture(
    name: &str,
    uuid: &str,
    disks: &[(&str, &str)],
    interfaces: &[FixtureInterface],
) -> String {
    let mut devices = String::new();
    for (dev, path) in disks {
        devices.push_str(&format!(
            "    <disk type='file' device='disk'>\n      \
             <driver name='qemu' type='qcow2' cache='directsync'/>\n      \
             <source file='{}'/>\n      <target dev='{}' bus='scsi'/>\n    </disk>\n",
            path, dev
        ));
    }
    for iface in interfaces {
        let address = iface
            .hostdev
            .map(|a| {
                format!(
                    "\n        <address type='pci' domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/>\n      ",
                    a.domain, a.bus, a.slot, a.function
                )
            })
            .unwrap_or_default();
        let vlan = iface
            .vlan
            .map(|id| format!("      <vlan>\n        <tag id='{}'/>\n      </vlan>\n", id))
            .unwrap_or_default();
        devices.push_str(&format!(
            "    <interface type='network' managed='yes'>\n      \
             <mac address='{}'/>\n      <source network='{}'>{}</source>\n{}    </interface>\n",
            iface.mac, iface.network, address, vlan
        ));
    }

    format!(
        "<domain type='kvm'>\n  <name>{}</name>\n  <uuid>{}</uuid>\n  \
         <devices>\n{}    <memballoon model='virtio'>\n      <stats period='3'/>\n    \
         </memballoon>\n  </devices>\n</domain>\n",
        name, uuid, devices
    )
}

/// Render a hostdev-forward network XML handing out the given VFs.
pub fn network_xml_fixture(name: &str, vfs: &[PciAddress]) -> String {
    let addresses: String = vfs
        .iter()
        .map(|a| {
            format!(
                "    <address type='pci' domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/>\n",
                a.domain, a.bus, a.slot, a.function
            )
        })
        .collect();
    format!(
        "<network>\n  <name>{}</name>\n  <forward mode='hostdev' managed='yes'>\n    \
         <driver name='vfio'/>\n{}  </forward>\n</network>\n",
        name, addresses
    )
}

impl HostModel {
    /// Register a domain built from a fixture.
    pub fn add_domain(&mut self, name: &str, domain: MockDomain) {
        self.domains.insert(name.to_string(), domain);
    }

    /// Register a directory pool.
    pub fn add_pool(&mut self, name: &str, target_path: &str, available: u64) -> &mut MockPool {
        let pool = MockPool {
            target_path: target_path.to_string(),
            info: PoolInfo {
                state: PoolState::Running,
                capacity: available * 2,
                allocation: available,
                available,
            },
            active: true,
            persistent: true,
            autostart: true,
            volumes: BTreeMap::new(),
        };
        self.pools.insert(name.to_string(), pool);
        self.pools.get_mut(name).expect("pool just inserted")
    }

    pub fn add_network(&mut self, name: &str, vfs: &[PciAddress]) {
        self.networks
            .insert(name.to_string(), network_xml_fixture(name, vfs));
    }

    pub fn add_node_device(&mut self, name: &str, xml: &str) {
        self.node_devices.insert(name.to_string(), xml.to_string());
    }
}

impl MockPool {
    pub fn add_volume(&mut self, name: &str, path: &str) {
        self.volumes
            .insert(name.to_string(), MockVolume { path: path.to_string() });
    }
}

// -- connector --------------------------------------------------------------

/// Connector over a shared [`HostModel`]; every session sees the same host.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<HostModel>>,
}

impl MockConnector {
    pub fn new(model: HostModel) -> Self {
        MockConnector {
            state: Arc::new(Mutex::new(model)),
        }
    }

    /// Direct access to the host model for assertions and scripting.
    pub fn state(&self) -> Arc<Mutex<HostModel>> {
        self.state.clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        MockConnector::new(HostModel::default())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, mode: AccessMode) -> Result<Box<dyn Hypervisor>> {
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            mode,
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<HostModel>>,
    mode: AccessMode,
}

impl MockSession {
    fn writable(&self) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(Error::native(
                "operation forbidden for read only access connection",
            ));
        }
        Ok(())
    }

    fn with_domain<T>(
        &self,
        domain: &str,
        f: impl FnOnce(&MockDomain) -> Result<T>,
    ) -> Result<T> {
        let state = self.state.lock();
        let dom = state
            .domains
            .get(domain)
            .ok_or_else(|| Error::NotFound(format!("failed to find domain: {}", domain)))?;
        f(dom)
    }

    fn with_domain_mut<T>(
        &self,
        domain: &str,
        f: impl FnOnce(&mut MockDomain) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let dom = state
            .domains
            .get_mut(domain)
            .ok_or_else(|| Error::NotFound(format!("failed to find domain: {}", domain)))?;
        f(dom)
    }

    fn with_pool<T>(&self, pool: &str, f: impl FnOnce(&MockPool) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        let p = state
            .pools
            .get(pool)
            .ok_or_else(|| Error::NotFound(format!("failed to find storage pool: {}", pool)))?;
        f(p)
    }
}

/// The overlay file libvirt derives from a disk path and a snapshot name:
/// the extension is replaced by the snapshot name.
fn overlay_path(path: &str, snapshot: &str) -> String {
    match path.rfind('.') {
        Some(idx) => format!("{}.{}", &path[..idx], snapshot),
        None => format!("{}.{}", path, snapshot),
    }
}

fn snapshot_mode_internal(xml: &str) -> bool {
    xml.contains("snapshot='internal'")
}

fn snapshot_name_from_xml(xml: &str) -> Result<String> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| Error::Xml(e.to_string()))?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::Xml("snapshot XML has no name".to_string()))
}

fn mac_of_interface_xml(xml: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    doc.descendants()
        .find(|n| n.has_tag_name("mac"))
        .and_then(|m| m.attribute("address"))
        .map(str::to_string)
}

#[async_trait]
impl Hypervisor for MockSession {
    async fn hostname(&self) -> Result<String> {
        Ok(self.state.lock().hostname.clone())
    }

    async fn lib_version(&self) -> Result<u64> {
        Ok(self.state.lock().lib_version)
    }

    async fn node_info(&self) -> Result<NodeHardware> {
        Ok(self.state.lock().node.clone())
    }

    async fn node_cpu_stats(&self) -> Result<NodeCpuStats> {
        Ok(self.state.lock().cpu_stats)
    }

    async fn node_memory_stats(&self) -> Result<NodeMemoryStats> {
        Ok(self.state.lock().memory)
    }

    async fn node_uptime(&self) -> Result<u64> {
        Ok(self.state.lock().uptime_ns)
    }

    async fn num_of_domains(&self) -> Result<u32> {
        Ok(self.state.lock().domains.values().filter(|d| d.active).count() as u32)
    }

    async fn num_of_networks(&self) -> Result<u32> {
        Ok(self.state.lock().networks.len() as u32)
    }

    async fn list_domain_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().domains.keys().cloned().collect())
    }

    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        Ok(self.state.lock().domains.contains_key(domain))
    }

    async fn domain_runtime(&self, domain: &str) -> Result<DomainRuntime> {
        self.with_domain(domain, |d| {
            Ok(DomainRuntime {
                name: domain.to_string(),
                uuid: d.uuid.clone(),
                active: d.active,
                persistent: d.persistent,
                updated: d.updated,
                autostart: d.autostart,
                security_label: d.security_label.clone(),
            })
        })
    }

    async fn domain_xml(&self, domain: &str, inactive: bool) -> Result<String> {
        self.with_domain(domain, |d| {
            if inactive {
                Ok(d.inactive_xml.clone().unwrap_or_else(|| d.xml.clone()))
            } else {
                Ok(d.xml.clone())
            }
        })
    }

    async fn domain_stats(&self, domain: &str) -> Result<DomainStats> {
        self.with_domain(domain, |d| {
            let mut stats = DomainStats {
                state: Some(d.state),
                balloon_current_kib: d.balloon_current_kib,
                balloon_maximum_kib: d.balloon_maximum_kib,
                ..DomainStats::default()
            };
            for _ in 0..d.current_vcpus {
                stats.vcpus.push(VcpuStat {
                    state: if d.active { 1 } else { 0 },
                    time: 1_000_000,
                });
            }
            for disk in domain_xml::parse_disks(&d.xml)? {
                if disk.device != "disk" {
                    continue;
                }
                stats.blocks.push(BlockStat {
                    name: disk.target_dev.unwrap_or_default(),
                    path: disk.source_path.unwrap_or_default(),
                    ..BlockStat::default()
                });
            }
            Ok(stats)
        })
    }

    async fn domain_memory_stats(&self, domain: &str) -> Result<DomainMemoryStats> {
        self.with_domain(domain, |d| Ok(d.memory_stats))
    }

    async fn current_vcpus(&self, domain: &str) -> Result<u64> {
        self.with_domain(domain, |d| Ok(d.current_vcpus))
    }

    async fn max_vcpus(&self, domain: &str) -> Result<u64> {
        self.with_domain(domain, |d| Ok(d.max_vcpus))
    }

    async fn start_domain(&self, domain: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if d.active {
                return Err(Error::native("domain is already running"));
            }
            d.active = true;
            d.state = RawDomainState { state: 1, reason: 1 };
            Ok(())
        })
    }

    async fn shutdown_domain(&self, domain: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if !d.active {
                return Err(Error::native("domain is not running"));
            }
            d.active = false;
            d.state = RawDomainState { state: 5, reason: 1 };
            Ok(())
        })
    }

    async fn reboot_domain(&self, domain: &str) -> Result<()> {
        self.writable()?;
        self.with_domain(domain, |d| {
            if !d.active {
                return Err(Error::native("domain is not running"));
            }
            Ok(())
        })
    }

    async fn reset_domain(&self, domain: &str) -> Result<()> {
        self.writable()?;
        self.with_domain(domain, |d| {
            if !d.active {
                return Err(Error::native("domain is not running"));
            }
            Ok(())
        })
    }

    async fn destroy_domain(&self, domain: &str, _graceful: bool) -> Result<()> {
        self.writable()?;
        let mut state = self.state.lock();
        let dom = state
            .domains
            .get_mut(domain)
            .ok_or_else(|| Error::NotFound(format!("failed to find domain: {}", domain)))?;
        if !dom.active {
            return Err(Error::native("domain is not running"));
        }
        dom.active = false;
        dom.state = RawDomainState { state: 5, reason: 2 };
        if !dom.persistent {
            state.domains.remove(domain);
        }
        Ok(())
    }

    async fn undefine_domain(&self, domain: &str) -> Result<()> {
        self.writable()?;
        let mut state = self.state.lock();
        let dom = state
            .domains
            .get_mut(domain)
            .ok_or_else(|| Error::NotFound(format!("failed to find domain: {}", domain)))?;
        if dom.active {
            dom.persistent = false;
        } else {
            state.domains.remove(domain);
        }
        Ok(())
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        self.writable()?;
        let name = domain_xml::domain_name(xml)?;
        let uuid = domain_xml::domain_uuid(xml)?;
        let mut state = self.state.lock();
        if state.domains.contains_key(&name) {
            return Err(Error::native(format!("domain {} already defined", name)));
        }
        state.domains.insert(
            name,
            MockDomain {
                xml: xml.to_string(),
                uuid,
                persistent: true,
                state: RawDomainState { state: 5, reason: 0 },
                current_vcpus: 1,
                max_vcpus: 16,
                ..MockDomain::default()
            },
        );
        Ok(())
    }

    async fn set_autostart(&self, domain: &str, autostart: bool) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            d.autostart = autostart;
            Ok(())
        })
    }

    async fn set_memory(&self, domain: &str, kib: u64, _affect: AffectFlags) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if kib > d.balloon_maximum_kib && d.balloon_maximum_kib > 0 {
                return Err(Error::native(
                    "requested memory exceeds domain maximum",
                ));
            }
            d.balloon_current_kib = kib;
            Ok(())
        })
    }

    async fn set_max_memory(&self, domain: &str, kib: u64) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            d.balloon_maximum_kib = kib;
            Ok(())
        })
    }

    async fn set_memory_stats_period(
        &self,
        domain: &str,
        period_secs: i32,
        _affect: AffectFlags,
    ) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            d.memory_stats_period = period_secs;
            Ok(())
        })
    }

    async fn set_vcpus(&self, domain: &str, count: u32, _affect: AffectFlags) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if u64::from(count) > d.max_vcpus && d.max_vcpus > 0 {
                return Err(Error::native("requested vCPUs exceed domain maximum"));
            }
            d.current_vcpus = u64::from(count);
            Ok(())
        })
    }

    async fn set_max_vcpus(&self, domain: &str, count: u32) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            d.max_vcpus = u64::from(count);
            Ok(())
        })
    }

    async fn set_scheduler_cpu_shares(
        &self,
        domain: &str,
        shares: u64,
        _affect: AffectFlags,
    ) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            d.scheduler.cpu_shares = shares;
            Ok(())
        })
    }

    async fn set_block_io_tune(
        &self,
        domain: &str,
        device: &str,
        update: IoTuneUpdate,
        _affect: AffectFlags,
    ) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            let entry = d.io_tune.entry(device.to_string()).or_default();
            entry.read_iops_sec = update.read_iops_sec;
            entry.read_iops_sec_max = update.read_iops_sec_max;
            entry.read_iops_sec_max_length = update.read_iops_sec_max_length;
            entry.write_iops_sec = update.write_iops_sec;
            entry.write_iops_sec_max = update.write_iops_sec_max;
            entry.write_iops_sec_max_length = update.write_iops_sec_max_length;
            Ok(())
        })
    }

    async fn block_io_tune(
        &self,
        domain: &str,
        device: &str,
        _impact: Impact,
    ) -> Result<IoTuneParams> {
        self.with_domain(domain, |d| {
            d.io_tune
                .get(device)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no io tune for device {}", device)))
        })
    }

    async fn blkio_params(&self, domain: &str, _impact: Impact) -> Result<BlkioParams> {
        self.with_domain(domain, |d| Ok(d.blkio.clone()))
    }

    async fn scheduler_info(&self, domain: &str, _impact: Impact) -> Result<SchedulerParams> {
        self.with_domain(domain, |d| Ok(d.scheduler.clone()))
    }

    async fn metadata(&self, domain: &str, uri: &str) -> Result<String> {
        self.with_domain(domain, |d| {
            d.metadata.get(uri).cloned().ok_or_else(|| {
                Error::NotFound("requested metadata element is not present".to_string())
            })
        })
    }

    async fn set_metadata(&self, domain: &str, xml: &str, _key: &str, uri: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            d.metadata.insert(uri.to_string(), xml.to_string());
            Ok(())
        })
    }

    async fn attach_device(&self, domain: &str, xml: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            let Some(pos) = d.xml.rfind("</devices>") else {
                return Err(Error::Xml("domain XML has no devices section".to_string()));
            };
            d.xml.insert_str(pos, xml);
            Ok(())
        })
    }

    async fn detach_device(&self, domain: &str, xml: &str) -> Result<()> {
        self.writable()?;
        let mac = mac_of_interface_xml(xml)
            .ok_or_else(|| Error::Xml("device XML has no MAC to match by".to_string()))?;
        self.with_domain_mut(domain, |d| {
            let interfaces = domain_xml::parse_interfaces(&d.xml)?;
            let Some(iface) = interfaces.iter().find(|i| i.mac.as_deref() == Some(&*mac))
            else {
                return Err(Error::NotFound(
                    "no interfaces match specified MAC".to_string(),
                ));
            };
            d.xml = d.xml.replacen(&iface.raw, "", 1);
            Ok(())
        })
    }

    async fn block_job_info(&self, domain: &str, device: &str) -> Result<BlockJobInfo> {
        self.with_domain(domain, |d| {
            d.block_jobs.get(device).copied().ok_or_else(|| {
                Error::NotFound(format!("no block job on device {}", device))
            })
        })
    }

    async fn block_commit_active(&self, domain: &str, device: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if !d.active {
                return Err(Error::native("domain is not running"));
            }
            if !d.overlays.contains_key(device) {
                return Err(Error::native(format!(
                    "disk {} has no top image to commit",
                    device
                )));
            }
            d.block_jobs.insert(
                device.to_string(),
                BlockJobInfo {
                    kind: BlockJobKind::ActiveCommit,
                    bandwidth: 0,
                    cur: 4096,
                    end: 4096,
                },
            );
            Ok(())
        })
    }

    async fn block_job_pivot(&self, domain: &str, device: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if d.block_jobs.remove(device).is_none() {
                return Err(Error::native(format!(
                    "no active block job on device {}",
                    device
                )));
            }
            if let Some((overlay, original)) = d.overlays.remove(device) {
                d.xml = d.xml.replacen(&overlay, &original, 1);
            }
            Ok(())
        })
    }

    async fn snapshot_names(&self, domain: &str, filter: SnapshotFilter) -> Result<Vec<String>> {
        self.with_domain(domain, |d| {
            let children: Vec<&str> = d
                .snapshots
                .iter()
                .filter_map(|s| s.parent.as_deref())
                .collect();
            Ok(d.snapshots
                .iter()
                .filter(|s| match filter {
                    SnapshotFilter::All => true,
                    SnapshotFilter::Roots => s.parent.is_none(),
                    SnapshotFilter::Internal => s.internal,
                    SnapshotFilter::External => !s.internal,
                    SnapshotFilter::DiskOnly => s.disk_only,
                    SnapshotFilter::Active => s.active_at_creation,
                    SnapshotFilter::Inactive => !s.active_at_creation,
                    SnapshotFilter::Metadata => s.has_metadata,
                    SnapshotFilter::NoMetadata => !s.has_metadata,
                    SnapshotFilter::Leaves => !children.contains(&s.name.as_str()),
                    SnapshotFilter::NoLeaves => children.contains(&s.name.as_str()),
                })
                .map(|s| s.name.clone())
                .collect())
        })
    }

    async fn create_snapshot(
        &self,
        domain: &str,
        xml: &str,
        flags: SnapshotCreateFlags,
    ) -> Result<()> {
        self.writable()?;
        let name = snapshot_name_from_xml(xml)?;
        let internal = snapshot_mode_internal(xml);

        let mut state = self.state.lock();
        let was_active = state
            .domains
            .get(domain)
            .map(|d| d.active)
            .ok_or_else(|| Error::NotFound(format!("failed to find domain: {}", domain)))?;

        if !internal {
            // External snapshot: every disk gets an overlay file that
            // becomes the new write layer.
            let disks = {
                let dom = state.domains.get(domain).expect("checked above");
                domain_xml::parse_disks(&dom.xml)?
            };
            let mut rewrites = Vec::new();
            for disk in disks {
                if !disk.snapshottable() {
                    continue;
                }
                let (Some(dev), Some(path)) = (disk.target_dev, disk.source_path) else {
                    continue;
                };
                let overlay = overlay_path(&path, &name);
                if std::path::Path::new(&path).exists() {
                    std::fs::write(&overlay, b"overlay")?;
                }
                rewrites.push((dev, path, overlay));
            }

            for (dev, path, overlay) in &rewrites {
                let dom = state.domains.get_mut(domain).expect("checked above");
                dom.xml = dom.xml.replacen(path.as_str(), overlay.as_str(), 1);
                dom.overlays
                    .insert(dev.clone(), (overlay.clone(), path.clone()));
            }

            // Register overlay volumes with the pool that owns them.
            for (_, _, overlay) in &rewrites {
                for pool in state.pools.values_mut() {
                    if overlay.starts_with(&pool.target_path) {
                        let vol_name = overlay
                            .rsplit('/')
                            .next()
                            .unwrap_or(overlay.as_str())
                            .to_string();
                        pool.volumes
                            .insert(vol_name, MockVolume { path: overlay.clone() });
                    }
                }
            }
        }

        let dom = state.domains.get_mut(domain).expect("checked above");
        if !flags.no_metadata {
            for snap in dom.snapshots.iter_mut() {
                snap.current = false;
            }
            dom.snapshots.push(MockSnapshot {
                name,
                internal,
                disk_only: flags.disk_only,
                active_at_creation: was_active,
                has_metadata: true,
                current: true,
                parent: None,
            });
        }
        if flags.halt {
            dom.active = false;
            dom.state = RawDomainState { state: 5, reason: 1 };
        }
        Ok(())
    }

    async fn delete_snapshot(&self, domain: &str, name: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            let before = d.snapshots.len();
            d.snapshots.retain(|s| s.name != name);
            if d.snapshots.len() == before {
                return Err(Error::NotFound(format!(
                    "failed to find domain snapshot: {}",
                    name
                )));
            }
            Ok(())
        })
    }

    async fn revert_snapshot(&self, domain: &str, name: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            let found = d.snapshots.iter().any(|s| s.name == name);
            if !found {
                return Err(Error::NotFound(format!(
                    "failed to find domain snapshot: {}",
                    name
                )));
            }
            for snap in d.snapshots.iter_mut() {
                snap.current = snap.name == name;
            }
            Ok(())
        })
    }

    async fn snapshot_children_count(&self, domain: &str, name: &str) -> Result<i64> {
        self.with_domain(domain, |d| {
            Ok(d.snapshots
                .iter()
                .filter(|s| s.parent.as_deref() == Some(name))
                .count() as i64)
        })
    }

    async fn snapshot_parent(&self, domain: &str, name: &str) -> Result<Option<String>> {
        self.with_domain(domain, |d| {
            d.snapshots
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.parent.clone())
                .ok_or_else(|| {
                    Error::NotFound(format!("failed to find domain snapshot: {}", name))
                })
        })
    }

    async fn snapshot_is_current(&self, domain: &str, name: &str) -> Result<bool> {
        self.with_domain(domain, |d| {
            d.snapshots
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.current)
                .ok_or_else(|| {
                    Error::NotFound(format!("failed to find domain snapshot: {}", name))
                })
        })
    }

    async fn list_pool_names(&self, filter: PoolFilter) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .pools
            .iter()
            .filter(|(_, p)| match filter {
                PoolFilter::Directory => true,
                PoolFilter::DirectoryActive => p.active,
                PoolFilter::ActivePersistent => p.active && p.persistent,
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn pool_info(&self, pool: &str) -> Result<PoolInfo> {
        self.with_pool(pool, |p| Ok(p.info))
    }

    async fn pool_xml(&self, pool: &str) -> Result<String> {
        self.with_pool(pool, |p| {
            Ok(format!(
                "<pool type='dir'>\n  <name>{}</name>\n  <target>\n    <path>{}</path>\n  </target>\n</pool>\n",
                pool, p.target_path
            ))
        })
    }

    async fn pool_is_active(&self, pool: &str) -> Result<bool> {
        self.with_pool(pool, |p| Ok(p.active))
    }

    async fn pool_is_persistent(&self, pool: &str) -> Result<bool> {
        self.with_pool(pool, |p| Ok(p.persistent))
    }

    async fn pool_autostart(&self, pool: &str) -> Result<bool> {
        self.with_pool(pool, |p| Ok(p.autostart))
    }

    async fn pool_volume_names(&self, pool: &str) -> Result<Vec<String>> {
        self.with_pool(pool, |p| Ok(p.volumes.keys().cloned().collect()))
    }

    async fn refresh_pool(&self, pool: &str) -> Result<()> {
        self.with_pool(pool, |_| Ok(()))
    }

    async fn volume_xml(&self, pool: &str, volume: &str) -> Result<String> {
        self.with_pool(pool, |p| {
            let vol = p.volumes.get(volume).ok_or_else(|| {
                Error::NotFound(format!("failed to find storage volume: {}", volume))
            })?;
            Ok(format!(
                "<volume type='file'>\n  <name>{}</name>\n  <key>{}</key>\n  <target>\n    \
                 <path>{}</path>\n    <format type='qcow2'/>\n  </target>\n</volume>\n",
                volume, vol.path, vol.path
            ))
        })
    }

    async fn clone_volume(&self, pool: &str, source: &str, xml: &str) -> Result<()> {
        self.writable()?;
        let desc = volume_xml::parse(xml)?;
        let target = desc
            .target_path
            .clone()
            .ok_or_else(|| Error::Xml("clone XML has no target path".to_string()))?;

        let mut state = self.state.lock();
        let p = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| Error::NotFound(format!("failed to find storage pool: {}", pool)))?;
        let src = p.volumes.get(source).ok_or_else(|| {
            Error::NotFound(format!("failed to find storage volume: {}", source))
        })?;

        if std::path::Path::new(&src.path).exists() {
            std::fs::copy(&src.path, &target)?;
        }
        p.volumes
            .insert(desc.name.clone(), MockVolume { path: target });
        Ok(())
    }

    async fn find_volume_by_path(&self, path: &str) -> Result<Option<VolumeRef>> {
        let state = self.state.lock();
        for (pool_name, pool) in &state.pools {
            for (vol_name, vol) in &pool.volumes {
                if vol.path == path {
                    return Ok(Some(VolumeRef {
                        pool: pool_name.clone(),
                        name: vol_name.clone(),
                        path: vol.path.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        self.writable()?;
        let mut state = self.state.lock();
        let p = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| Error::NotFound(format!("failed to find storage pool: {}", pool)))?;
        let vol = p.volumes.remove(volume).ok_or_else(|| {
            Error::NotFound(format!("failed to find storage volume: {}", volume))
        })?;
        let _ = std::fs::remove_file(&vol.path);
        Ok(())
    }

    async fn list_network_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().networks.keys().cloned().collect())
    }

    async fn network_xml(&self, network: &str) -> Result<String> {
        self.state
            .lock()
            .networks
            .get(network)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("failed to find network: {}", network)))
    }

    async fn network_exists(&self, network: &str) -> Result<bool> {
        Ok(self.state.lock().networks.contains_key(network))
    }

    async fn list_net_node_devices(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .node_devices
            .iter()
            .filter(|(_, xml)| xml.contains("capability type='net'"))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn node_device_xml(&self, name: &str) -> Result<String> {
        self.state
            .lock()
            .node_devices
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("failed to find device {}", name)))
    }

    async fn agent_command(&self, domain: &str, command: &str) -> Result<String> {
        let handler = self.with_domain(domain, |d| {
            if !d.active {
                return Err(Error::native("domain is not running"));
            }
            d.agent.clone().ok_or_else(|| {
                Error::Agent("Guest agent is not configured".to_string())
            })
        })?;
        handler(command)
    }

    async fn set_user_password(&self, domain: &str, user: &str, password: &str) -> Result<()> {
        self.writable()?;
        self.with_domain_mut(domain, |d| {
            if !d.active {
                return Err(Error::native("domain is not running"));
            }
            d.passwords.insert(user.to_string(), password.to_string());
            Ok(())
        })
    }
}
