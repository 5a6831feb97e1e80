//! Guest-agent bridge against scripted agents: the chunked file-read
//! protocol, its payload invariant, and the aggregate summary.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{json, Value};

use virtjrpc_hypervisor::info::qemu_agent_info;
use virtjrpc_hypervisor::mock::{
    domain_xml_fixture, AgentHandler, HostModel, MockConnector, MockDomain,
};
use virtjrpc_hypervisor::types::{AccessMode, RawDomainState};
use virtjrpc_hypervisor::{agent, Connector, Error};

fn running_domain_with_agent(handler: AgentHandler) -> MockConnector {
    let mut model = HostModel::default();
    let xml = domain_xml_fixture(
        "vm01",
        "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
        &[("sda", "/var/lib/libvirt/images/vm01.qcow2")],
        &[],
    );
    model.add_domain(
        "vm01",
        MockDomain {
            xml,
            active: true,
            persistent: true,
            state: RawDomainState { state: 1, reason: 1 },
            agent: Some(handler),
            ..MockDomain::default()
        },
    );
    MockConnector::new(model)
}

fn execute_of(command: &str) -> (String, Value) {
    let parsed: Value = serde_json::from_str(command).unwrap();
    (
        parsed["execute"].as_str().unwrap_or_default().to_string(),
        parsed["arguments"].clone(),
    )
}

/// A file served in `chunks` pieces through the open/read/close protocol.
fn file_agent(content: &'static [u8], chunks: usize) -> AgentHandler {
    let cursor = Arc::new(Mutex::new(0usize));
    Arc::new(move |command: &str| {
        let (execute, _args) = execute_of(command);
        match execute.as_str() {
            "guest-file-open" => Ok(json!({ "return": 1000 }).to_string()),
            "guest-file-read" => {
                let mut pos = cursor.lock();
                let chunk_size = content.len().div_ceil(chunks);
                let start = *pos;
                let end = (start + chunk_size).min(content.len());
                *pos = end;
                let piece = &content[start..end];
                Ok(json!({
                    "return": {
                        "count": piece.len(),
                        "buf-b64": BASE64.encode(piece),
                        "eof": end == content.len(),
                    }
                })
                .to_string())
            }
            "guest-file-close" => Ok(json!({ "return": {} }).to_string()),
            other => Err(Error::Agent(format!("unscripted command {}", other))),
        }
    })
}

#[tokio::test]
async fn single_chunk_read_round_trips() {
    let connector = running_domain_with_agent(file_agent(b"0.52 0.58 0.59 3/821 232717\n", 1));
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let content = agent::read_file(hv.as_ref(), "vm01", "/proc/loadavg")
        .await
        .unwrap();
    assert_eq!(content, "0.52 0.58 0.59 3/821 232717\n");
}

#[tokio::test]
async fn multi_chunk_read_concatenates_until_eof() {
    const PASSWD: &[u8] = b"root:x:0:0:root:/root:/bin/bash\n\
                            deploy:x:1000:1000:deploy:/home/deploy:/bin/bash\n\
                            ops:x:1001:1001::/home/ops:/bin/zsh\n";
    let connector = running_domain_with_agent(file_agent(PASSWD, 4));
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let users = agent::users(hv.as_ref(), "vm01").await.unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].name, "deploy");
    assert_eq!(users[1].name, "ops");
}

#[tokio::test]
async fn payload_size_mismatch_is_a_hard_error() {
    let handler: AgentHandler = Arc::new(|command: &str| {
        let (execute, _) = execute_of(command);
        match execute.as_str() {
            "guest-file-open" => Ok(json!({ "return": 7 }).to_string()),
            "guest-file-read" => Ok(json!({
                "return": {
                    "count": 10,
                    "buf-b64": BASE64.encode(b"short"),
                    "eof": true,
                }
            })
            .to_string()),
            "guest-file-close" => Ok(json!({ "return": {} }).to_string()),
            other => Err(Error::Agent(format!("unscripted command {}", other))),
        }
    });
    let connector = running_domain_with_agent(handler);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let err = agent::read_file(hv.as_ref(), "vm01", "/etc/passwd")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "decoded base64 payload does not match original string size"
    );
}

#[tokio::test]
async fn close_runs_even_when_the_read_fails() {
    let closed = Arc::new(Mutex::new(false));
    let closed_probe = closed.clone();
    let handler: AgentHandler = Arc::new(move |command: &str| {
        let (execute, _) = execute_of(command);
        match execute.as_str() {
            "guest-file-open" => Ok(json!({ "return": 3 }).to_string()),
            "guest-file-read" => Err(Error::Agent("read exploded".to_string())),
            "guest-file-close" => {
                *closed.lock() = true;
                Ok(json!({ "return": {} }).to_string())
            }
            other => Err(Error::Agent(format!("unscripted command {}", other))),
        }
    });
    let connector = running_domain_with_agent(handler);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    assert!(agent::read_file(hv.as_ref(), "vm01", "/proc/uptime")
        .await
        .is_err());
    assert!(*closed_probe.lock(), "file handle must be closed");
}

#[tokio::test]
async fn agent_summary_aggregates_every_probe() {
    let handler: AgentHandler = Arc::new(|command: &str| {
        let (execute, args) = execute_of(command);
        let response = match execute.as_str() {
            "guest-ping" => json!({ "return": {} }),
            "guest-info" => json!({ "return": { "version": "7.2.0" } }),
            "guest-get-time" => json!({ "return": 1_700_000_000_000_000_000i64 }),
            "guest-get-timezone" => json!({ "return": { "zone": "UTC", "offset": 0 } }),
            "guest-get-host-name" => json!({ "return": { "host-name": "guest01" } }),
            "guest-get-osinfo" => json!({ "return": {
                "id": "ubuntu",
                "name": "Ubuntu",
                "pretty-name": "Ubuntu 22.04.3 LTS",
                "version": "22.04.3 LTS (Jammy Jellyfish)",
                "version-id": "22.04",
                "kernel-release": "5.15.0-83-generic",
                "kernel-version": "#92-Ubuntu SMP",
                "machine": "x86_64",
            }}),
            "guest-get-fsinfo" => json!({ "return": [{
                "name": "sda1",
                "mountpoint": "/",
                "type": "ext4",
                "disk": [{ "dev": "/dev/sda1" }],
            }]}),
            "guest-network-get-interfaces" => json!({ "return": [{
                "name": "ens3",
                "hardware-address": "52:54:00:ab:cd:ef",
                "ip-addresses": [
                    { "ip-address-type": "ipv4", "ip-address": "10.0.0.5", "prefix": 24 },
                ],
                "statistics": { "rx-bytes": 1024, "tx-bytes": 2048,
                                "rx-packets": 10, "tx-packets": 12,
                                "rx-errs": 0, "tx-errs": 0,
                                "rx-dropped": 0, "tx-dropped": 0 },
            }]}),
            "guest-file-open" => json!({ "return": 11 }),
            "guest-file-close" => json!({ "return": {} }),
            "guest-file-read" => {
                // Distinguish the three digest files by handle-independent
                // call order is fragile; serve by requested path instead.
                // The bridge opens one file at a time, so a static payload
                // per call works: loadavg, then passwd, then uptime.
                json!({ "return": {
                    "count": 28,
                    "buf-b64": BASE64.encode(b"0.10 0.20 0.30 1/100 4321\n a"),
                    "eof": true,
                }})
            }
            other => return Err(Error::Agent(format!("unscripted command {}", other))),
        };
        let _ = args;
        Ok(response.to_string())
    });
    let connector = running_domain_with_agent(handler);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let summary = qemu_agent_info(hv.as_ref(), "vm01").await;
    assert!(summary.available);
    assert_eq!(summary.agent_version, "7.2.0");
    assert_eq!(summary.time, 1_700_000_000);
    assert_eq!(summary.timezone, "UTC+0");
    assert_eq!(summary.hostname, "guest01");
    assert_eq!(summary.os_info.pretty_name, "Ubuntu 22.04.3 LTS");
    assert_eq!(summary.fs_info.len(), 1);
    assert_eq!(summary.fs_info[0].fs_type, "ext4");
    assert_eq!(summary.network.len(), 1);
    assert_eq!(summary.network[0].ip_addresses[0].ip_address, "10.0.0.5");
    assert_eq!(summary.load_average.one_minutes, 0.10);
}

#[tokio::test]
async fn summary_degrades_when_agent_is_silent() {
    let mut model = HostModel::default();
    let xml = domain_xml_fixture(
        "vm01",
        "7c1b2a96-87a4-43b2-9a1e-3d2f15de6c1a",
        &[("sda", "/var/lib/libvirt/images/vm01.qcow2")],
        &[],
    );
    model.add_domain(
        "vm01",
        MockDomain {
            xml,
            active: true,
            persistent: true,
            agent: None,
            ..MockDomain::default()
        },
    );
    let connector = MockConnector::new(model);
    let hv = connector.connect(AccessMode::ReadWrite).await.unwrap();

    let summary = qemu_agent_info(hv.as_ref(), "vm01").await;
    assert!(!summary.available);
    assert!(summary.agent_version.is_empty());
    assert!(summary.users.is_empty());
}
