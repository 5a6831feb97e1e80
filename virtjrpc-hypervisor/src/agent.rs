//! Guest-agent bridge.
//!
//! Every call serializes a `{"execute": ..., "arguments": ...}` command,
//! ships it over the agent channel and deserializes the `return` shape the
//! caller expects. File reads stream chunk by chunk until the agent reports
//! EOF; each chunk's base64 payload must decode to exactly the advertised
//! byte count.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::traits::Hypervisor;

#[derive(Debug, Deserialize)]
struct AgentReturn<T> {
    #[serde(rename = "return")]
    value: T,
}

async fn execute<T: DeserializeOwned>(
    hv: &dyn Hypervisor,
    domain: &str,
    command: &str,
    arguments: Option<serde_json::Value>,
) -> Result<T> {
    let payload = match arguments {
        Some(args) => json!({ "execute": command, "arguments": args }),
        None => json!({ "execute": command }),
    };
    let raw = hv.agent_command(domain, &payload.to_string()).await?;
    let parsed: AgentReturn<T> = serde_json::from_str(&raw)
        .map_err(|e| Error::Agent(format!("failed to decode guest agent response: {}", e)))?;
    Ok(parsed.value)
}

/// `guest-ping`: whether the agent answers at all.
pub async fn ping(hv: &dyn Hypervisor, domain: &str) -> bool {
    execute::<serde_json::Value>(hv, domain, "guest-ping", None)
        .await
        .is_ok()
}

// -- file read protocol ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct FileReadChunk {
    count: usize,
    #[serde(rename = "buf-b64", default)]
    buf_b64: String,
    #[serde(default)]
    eof: bool,
}

async fn file_open(hv: &dyn Hypervisor, domain: &str, path: &str, mode: &str) -> Result<i64> {
    execute(hv, domain, "guest-file-open", Some(json!({ "path": path, "mode": mode }))).await
}

async fn file_close(hv: &dyn Hypervisor, domain: &str, handle: i64) -> Result<()> {
    let _: serde_json::Value =
        execute(hv, domain, "guest-file-close", Some(json!({ "handle": handle }))).await?;
    Ok(())
}

async fn file_read_all(hv: &dyn Hypervisor, domain: &str, handle: i64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let chunk: FileReadChunk =
            execute(hv, domain, "guest-file-read", Some(json!({ "handle": handle }))).await?;
        let decoded = BASE64
            .decode(chunk.buf_b64.as_bytes())
            .map_err(|e| Error::Agent(format!("failed to decode base64 payload: {}", e)))?;
        if decoded.len() != chunk.count {
            return Err(Error::Agent(
                "decoded base64 payload does not match original string size".to_string(),
            ));
        }
        buf.extend_from_slice(&decoded);
        if chunk.eof {
            break;
        }
    }
    Ok(buf)
}

/// Read a whole file from the guest. The handle is closed even when the
/// read fails; a close failure is logged but never masks the read outcome.
pub async fn read_file(hv: &dyn Hypervisor, domain: &str, path: &str) -> Result<String> {
    let handle = file_open(hv, domain, path, "r").await?;
    let read = file_read_all(hv, domain, handle).await;
    if let Err(e) = file_close(hv, domain, handle).await {
        warn!(domain, path, error = %e, "failed to close guest file handle");
    }
    let bytes = read?;
    debug!(domain, path, bytes = bytes.len(), "read guest file");
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// -- one-shot queries -----------------------------------------------------

/// Guest OS identity per `guest-get-osinfo`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestOsInfo {
    #[serde(rename(deserialize = "id", serialize = "ID"), default)]
    pub id: String,
    #[serde(rename(deserialize = "kernel-release", serialize = "KernelRelease"), default)]
    pub kernel_release: String,
    #[serde(rename(deserialize = "kernel-version", serialize = "KernelVersion"), default)]
    pub kernel_version: String,
    #[serde(rename(deserialize = "machine", serialize = "Machine"), default)]
    pub machine: String,
    #[serde(rename(deserialize = "name", serialize = "Name"), default)]
    pub name: String,
    #[serde(rename(deserialize = "pretty-name", serialize = "PrettyName"), default)]
    pub pretty_name: String,
    #[serde(rename(deserialize = "version", serialize = "Version"), default)]
    pub version: String,
    #[serde(rename(deserialize = "version-id", serialize = "VersionID"), default)]
    pub version_id: String,
}

pub async fn os_info(hv: &dyn Hypervisor, domain: &str) -> Result<GuestOsInfo> {
    execute(hv, domain, "guest-get-osinfo", None).await
}

pub async fn agent_version(hv: &dyn Hypervisor, domain: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Info {
        #[serde(default)]
        version: String,
    }
    let info: Info = execute(hv, domain, "guest-info", None).await?;
    Ok(info.version)
}

/// Guest wall-clock time in seconds since the Unix epoch.
pub async fn guest_time(hv: &dyn Hypervisor, domain: &str) -> Result<i64> {
    let nanos: i64 = execute(hv, domain, "guest-get-time", None).await?;
    Ok(nanos / 1_000_000_000)
}

pub async fn timezone(hv: &dyn Hypervisor, domain: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Tz {
        #[serde(default)]
        zone: String,
        #[serde(default)]
        offset: i64,
    }
    let tz: Tz = execute(hv, domain, "guest-get-timezone", None).await?;
    let separator = if tz.offset >= 0 { "+" } else { "" };
    Ok(format!("{}{}{}", tz.zone, separator, tz.offset))
}

pub async fn hostname(hv: &dyn Hypervisor, domain: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Host {
        #[serde(rename = "host-name", default)]
        host_name: String,
    }
    let host: Host = execute(hv, domain, "guest-get-host-name", None).await?;
    Ok(host.host_name)
}

/// A mounted guest filesystem per `guest-get-fsinfo`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestFilesystem {
    #[serde(rename = "MountPoint")]
    pub mount_point: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "FSType")]
    pub fs_type: String,
    #[serde(rename = "DevAlias")]
    pub dev_alias: Vec<String>,
}

pub async fn fs_info(hv: &dyn Hypervisor, domain: &str) -> Result<Vec<GuestFilesystem>> {
    #[derive(Deserialize)]
    struct RawDisk {
        #[serde(default)]
        dev: Option<String>,
    }
    #[derive(Deserialize)]
    struct RawFs {
        #[serde(default)]
        name: String,
        #[serde(default)]
        mountpoint: String,
        #[serde(rename = "type", default)]
        fs_type: String,
        #[serde(default)]
        disk: Vec<RawDisk>,
    }
    let raw: Vec<RawFs> = execute(hv, domain, "guest-get-fsinfo", None).await?;
    Ok(raw
        .into_iter()
        .map(|fs| GuestFilesystem {
            mount_point: fs.mountpoint,
            name: fs.name,
            fs_type: fs.fs_type,
            dev_alias: fs.disk.into_iter().filter_map(|d| d.dev).collect(),
        })
        .collect())
}

/// A guest NIC per `guest-network-get-interfaces`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestNetwork {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MAC")]
    pub hardware_address: String,
    #[serde(rename = "IP")]
    pub ip_addresses: Vec<GuestIpAddress>,
    #[serde(rename = "Statistics")]
    pub statistics: GuestNetworkStatistics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestIpAddress {
    #[serde(rename = "Type")]
    pub ip_address_type: String,
    #[serde(rename = "IP")]
    pub ip_address: String,
    #[serde(rename = "Prefix")]
    pub prefix: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GuestNetworkStatistics {
    #[serde(rename = "RxBytes")]
    pub rx_bytes: i64,
    #[serde(rename = "RxDropped")]
    pub rx_dropped: i64,
    #[serde(rename = "RxErrs")]
    pub rx_errs: i64,
    #[serde(rename = "RxPackets")]
    pub rx_packets: i64,
    #[serde(rename = "TxBytes")]
    pub tx_bytes: i64,
    #[serde(rename = "TxDropped")]
    pub tx_dropped: i64,
    #[serde(rename = "TxErrs")]
    pub tx_errs: i64,
    #[serde(rename = "TxPackets")]
    pub tx_packets: i64,
}

pub async fn network_interfaces(hv: &dyn Hypervisor, domain: &str) -> Result<Vec<GuestNetwork>> {
    #[derive(Deserialize, Default)]
    struct RawIp {
        #[serde(rename = "ip-address-type", default)]
        ip_address_type: String,
        #[serde(rename = "ip-address", default)]
        ip_address: String,
        #[serde(default)]
        prefix: i64,
    }
    #[derive(Deserialize, Default)]
    struct RawStats {
        #[serde(rename = "rx-bytes", default)]
        rx_bytes: i64,
        #[serde(rename = "rx-dropped", default)]
        rx_dropped: i64,
        #[serde(rename = "rx-errs", default)]
        rx_errs: i64,
        #[serde(rename = "rx-packets", default)]
        rx_packets: i64,
        #[serde(rename = "tx-bytes", default)]
        tx_bytes: i64,
        #[serde(rename = "tx-dropped", default)]
        tx_dropped: i64,
        #[serde(rename = "tx-errs", default)]
        tx_errs: i64,
        #[serde(rename = "tx-packets", default)]
        tx_packets: i64,
    }
    #[derive(Deserialize)]
    struct RawNic {
        #[serde(default)]
        name: String,
        #[serde(rename = "hardware-address", default)]
        hardware_address: String,
        #[serde(rename = "ip-addresses", default)]
        ip_addresses: Vec<RawIp>,
        #[serde(default)]
        statistics: RawStats,
    }

    let raw: Vec<RawNic> =
        execute(hv, domain, "guest-network-get-interfaces", None).await?;
    Ok(raw
        .into_iter()
        .map(|nic| GuestNetwork {
            name: nic.name,
            hardware_address: nic.hardware_address,
            ip_addresses: nic
                .ip_addresses
                .into_iter()
                .map(|ip| GuestIpAddress {
                    ip_address_type: ip.ip_address_type,
                    ip_address: ip.ip_address,
                    prefix: ip.prefix,
                })
                .collect(),
            statistics: GuestNetworkStatistics {
                rx_bytes: nic.statistics.rx_bytes,
                rx_dropped: nic.statistics.rx_dropped,
                rx_errs: nic.statistics.rx_errs,
                rx_packets: nic.statistics.rx_packets,
                tx_bytes: nic.statistics.tx_bytes,
                tx_dropped: nic.statistics.tx_dropped,
                tx_errs: nic.statistics.tx_errs,
                tx_packets: nic.statistics.tx_packets,
            },
        })
        .collect())
}

// -- in-guest file digests -------------------------------------------------

/// Load averages and scheduler totals parsed from `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GuestLoadAverage {
    #[serde(rename = "OneMinutes")]
    pub one_minutes: f64,
    #[serde(rename = "FiveMinutes")]
    pub five_minutes: f64,
    #[serde(rename = "TenMinutes")]
    pub ten_minutes: f64,
    #[serde(rename = "CurrentProcesses")]
    pub current_processes: u64,
    #[serde(rename = "TotalProcesses")]
    pub total_processes: u64,
}

pub fn parse_loadavg(content: &str) -> Result<GuestLoadAverage> {
    let fields: Vec<&str> = content.trim().split(' ').collect();
    if fields.len() < 5 {
        return Err(Error::Agent("unknown /proc/loadavg file format".to_string()));
    }

    let mut la = GuestLoadAverage::default();
    la.one_minutes = fields[0].parse().unwrap_or_default();
    la.five_minutes = fields[1].parse().unwrap_or_default();
    la.ten_minutes = fields[2].parse().unwrap_or_default();

    if let Some((cur, total)) = fields[3].split_once('/') {
        la.current_processes = cur.parse().unwrap_or_default();
        la.total_processes = total.parse().unwrap_or_default();
    }

    Ok(la)
}

/// Uptime and idle time in seconds parsed from `/proc/uptime`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GuestUptime {
    #[serde(rename = "Up")]
    pub up: f64,
    #[serde(rename = "Idle")]
    pub idle: f64,
}

pub fn parse_uptime(content: &str) -> Result<GuestUptime> {
    let fields: Vec<&str> = content.trim().split(' ').collect();
    if fields.len() < 2 {
        return Err(Error::Agent("unknown /proc/uptime file format".to_string()));
    }
    Ok(GuestUptime {
        up: fields[0]
            .parse()
            .map_err(|_| Error::Agent("unknown /proc/uptime file format".to_string()))?,
        idle: fields[1]
            .parse()
            .map_err(|_| Error::Agent("unknown /proc/uptime file format".to_string()))?,
    })
}

/// A human login account parsed from `/etc/passwd`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuestUser {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "HomeDir")]
    pub home_dir: String,
    #[serde(rename = "Shell")]
    pub shell: String,
}

/// Regular accounts only: uid >= 1000 and not the nobody user.
pub fn parse_passwd_users(content: &str) -> Vec<GuestUser> {
    let mut users = Vec::new();
    for line in content.trim().lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 {
            continue;
        }
        let Ok(uid) = fields[2].parse::<u64>() else {
            continue;
        };
        if uid >= 1000 && uid != 65534 {
            users.push(GuestUser {
                name: fields[0].to_string(),
                home_dir: fields[5].to_string(),
                shell: fields[6].to_string(),
            });
        }
    }
    users
}

pub async fn load_average(hv: &dyn Hypervisor, domain: &str) -> Result<GuestLoadAverage> {
    parse_loadavg(&read_file(hv, domain, "/proc/loadavg").await?)
}

pub async fn uptime(hv: &dyn Hypervisor, domain: &str) -> Result<GuestUptime> {
    parse_uptime(&read_file(hv, domain, "/proc/uptime").await?)
}

pub async fn users(hv: &dyn Hypervisor, domain: &str) -> Result<Vec<GuestUser>> {
    Ok(parse_passwd_users(&read_file(hv, domain, "/etc/passwd").await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadavg_parses() {
        let la = parse_loadavg("0.52 0.58 0.59 3/821 232717\n").unwrap();
        assert_eq!(la.one_minutes, 0.52);
        assert_eq!(la.five_minutes, 0.58);
        assert_eq!(la.ten_minutes, 0.59);
        assert_eq!(la.current_processes, 3);
        assert_eq!(la.total_processes, 821);
    }

    #[test]
    fn loadavg_rejects_short_lines() {
        assert!(parse_loadavg("0.52 0.58").is_err());
    }

    #[test]
    fn uptime_parses() {
        let up = parse_uptime("35435.51 137584.61\n").unwrap();
        assert_eq!(up.up, 35435.51);
        assert_eq!(up.idle, 137584.61);
        assert!(parse_uptime("garbage").is_err());
    }

    #[test]
    fn passwd_keeps_regular_accounts() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
                      nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n\
                      deploy:x:1000:1000:deploy:/home/deploy:/bin/bash\n\
                      broken:line\n\
                      ops:x:1001:1001::/home/ops:/bin/zsh\n";
        let users = parse_passwd_users(passwd);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "deploy");
        assert_eq!(users[1].shell, "/bin/zsh");
    }
}
