//! Thin shim over the `virsh` binary for libvirt calls the `virt` bindings
//! do not cover. Outputs are the stable key/value listings virsh prints for
//! scripting, parsed tolerantly.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::types::{BlockJobInfo, BlockJobKind};

#[derive(Clone)]
pub struct Virsh {
    uri: String,
    read_only: bool,
}

impl Virsh {
    pub fn new(uri: &str, read_only: bool) -> Self {
        Virsh {
            uri: uri.to_string(),
            read_only,
        }
    }

    /// Run virsh with the session URI and return trimmed stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_stdin(args, None).await
    }

    /// Run virsh, optionally feeding `stdin` (used with `/dev/stdin` file
    /// arguments for XML payloads).
    pub async fn run_with_stdin(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.uri);
        if self.read_only {
            cmd.arg("--readonly");
        }
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::native(format!("failed to spawn virsh: {}", e)))?;

        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(payload.as_bytes())
                    .await
                    .map_err(|e| Error::native(format!("failed to feed virsh stdin: {}", e)))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::native(format!("virsh did not exit: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::native(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse `key : value` listings (schedinfo, blkdeviotune, snapshot-info).
pub fn parse_colon_pairs(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parse `key=value` listings (domstats, blockjob --raw).
pub fn parse_eq_pairs(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parse `key value` listings (dommemstat).
pub fn parse_space_pairs(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let mut it = line.split_whitespace();
            Some((it.next()?.to_string(), it.next()?.to_string()))
        })
        .collect()
}

pub fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn lookup_u64(pairs: &[(String, String)], key: &str) -> u64 {
    lookup(pairs, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn lookup_i64(pairs: &[(String, String)], key: &str) -> i64 {
    lookup(pairs, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Decode `virsh blockjob` output into a job description.
///
/// The `--raw` listing is `key=value`; older builds print a human progress
/// line like `Active Block Commit: [ 56 %]`, which still identifies the
/// job kind and progress.
pub fn parse_block_job(output: &str) -> Result<BlockJobInfo> {
    if output.is_empty() || output.contains("No current block job") {
        return Err(Error::NotFound("no current block job".to_string()));
    }

    let pairs = parse_eq_pairs(output);
    if !pairs.is_empty() {
        let kind = match lookup(&pairs, "type").unwrap_or_default() {
            "1" | "pull" | "Pull" => BlockJobKind::Pull,
            "2" | "copy" | "Copy" => BlockJobKind::Copy,
            "3" | "commit" | "Commit" => BlockJobKind::Commit,
            "4" | "active commit" | "Active Commit" => BlockJobKind::ActiveCommit,
            _ => BlockJobKind::None,
        };
        return Ok(BlockJobInfo {
            kind,
            bandwidth: lookup_u64(&pairs, "bandwidth"),
            cur: lookup_u64(&pairs, "cur"),
            end: lookup_u64(&pairs, "end"),
        });
    }

    let kind = if output.contains("Active Block Commit") {
        BlockJobKind::ActiveCommit
    } else if output.contains("Block Commit") {
        BlockJobKind::Commit
    } else if output.contains("Block Copy") {
        BlockJobKind::Copy
    } else if output.contains("Block Pull") {
        BlockJobKind::Pull
    } else {
        BlockJobKind::None
    };

    let percent = output
        .split('[')
        .nth(1)
        .and_then(|rest| rest.split('%').next())
        .and_then(|v| v.trim().parse::<u64>().ok());

    Ok(match percent {
        Some(p) => BlockJobInfo {
            kind,
            bandwidth: 0,
            cur: p,
            end: 100,
        },
        None => BlockJobInfo {
            kind,
            bandwidth: 0,
            cur: 0,
            end: 0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_pairs_parse() {
        let pairs = parse_colon_pairs("Scheduler      : posix\ncpu_shares     : 1024\n");
        assert_eq!(lookup(&pairs, "Scheduler"), Some("posix"));
        assert_eq!(lookup_u64(&pairs, "cpu_shares"), 1024);
    }

    #[test]
    fn eq_pairs_parse() {
        let pairs = parse_eq_pairs("state.state=1\nballoon.current=524288\n");
        assert_eq!(lookup_i64(&pairs, "state.state"), 1);
        assert_eq!(lookup_u64(&pairs, "balloon.current"), 524288);
    }

    #[test]
    fn block_job_raw_format() {
        let job = parse_block_job(" type=4\n bandwidth=0\n cur=4096\n end=4096\n").unwrap();
        assert_eq!(job.kind, BlockJobKind::ActiveCommit);
        assert_eq!(job.cur, 4096);
        assert_eq!(job.end, 4096);
    }

    #[test]
    fn block_job_progress_line() {
        let job = parse_block_job("Active Block Commit: [ 56 %]").unwrap();
        assert_eq!(job.kind, BlockJobKind::ActiveCommit);
        assert_eq!(job.cur, 56);
        assert_eq!(job.end, 100);
    }

    #[test]
    fn block_job_absent() {
        assert!(parse_block_job("").is_err());
        assert!(parse_block_job("No current block job for disk sda").is_err());
    }
}
