//! # Network Module
//!
//! Link and server reachability probes plus the availability monitor.
//!
//! This module handles:
//! - Physical link carrier ([`LinkStatusProbe`], sysfs `carrier` files)
//! - Bounded-time server reachability ([`ReachabilityProbe`], ICMP via `ping`)
//! - Interface MAC lookup for the telemetry device id

pub mod monitor;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Physical link state
#[cfg_attr(test, mockall::automock)]
pub trait LinkStatusProbe: Send + Sync {
    fn link_up(&self) -> bool;
}

/// Carrier detection through `/sys/class/net/<iface>/carrier`
///
/// The link is up when any listed interface reports carrier.
#[derive(Debug, Clone)]
pub struct SysfsCarrier {
    root: PathBuf,
    interfaces: Vec<String>,
}

impl SysfsCarrier {
    pub fn new(root: impl Into<PathBuf>, interfaces: Vec<String>) -> Self {
        Self {
            root: root.into(),
            interfaces,
        }
    }

    fn carrier(&self, interface: &str) -> bool {
        // Reading carrier of an interface that is administratively down fails
        std::fs::read_to_string(self.root.join(interface).join("carrier"))
            .map(|raw| raw.trim() == "1")
            .unwrap_or(false)
    }
}

impl LinkStatusProbe for SysfsCarrier {
    fn link_up(&self) -> bool {
        self.interfaces.iter().any(|iface| self.carrier(iface))
    }
}

/// Application-layer reachability of one host
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `true` when `host` answered within `limit`
    async fn reachable(&self, host: &str, limit: Duration) -> bool;
}

/// Single ICMP echo through the system `ping`
#[derive(Debug, Clone, Default)]
pub struct PingProbe;

impl PingProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn reachable(&self, host: &str, limit: Duration) -> bool {
        let deadline = limit.as_secs().max(1).to_string();
        let mut command = Command::new("ping");
        command
            .args(["-c", "1", "-w", &deadline, host])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // ping's own deadline is whole seconds; the outer timeout enforces `limit`
        match timeout(limit, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("ping {} could not run: {}", host, e);
                false
            }
            Err(_) => {
                debug!("ping {} timed out after {:?}", host, limit);
                false
            }
        }
    }
}

/// MAC address of `interface`, or `None` when it cannot be read
pub fn read_mac(sysfs_net_root: &Path, interface: &str) -> Option<String> {
    let raw = std::fs::read_to_string(sysfs_net_root.join(interface).join("address")).ok()?;
    let mac = raw.trim();
    if mac.is_empty() {
        None
    } else {
        Some(mac.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_net(entries: &[(&str, &str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (iface, carrier, address) in entries {
            let path = dir.path().join(iface);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("carrier"), carrier).unwrap();
            std::fs::write(path.join("address"), address).unwrap();
        }
        dir
    }

    #[test]
    fn test_carrier_any_interface() {
        let dir = fake_net(&[("eth0", "0\n", ""), ("eth1", "1\n", "")]);
        let probe = SysfsCarrier::new(dir.path(), vec!["eth0".to_string(), "eth1".to_string()]);
        assert!(probe.link_up());
    }

    #[test]
    fn test_carrier_down_or_missing() {
        let dir = fake_net(&[("eth0", "0\n", "")]);
        let probe = SysfsCarrier::new(dir.path(), vec!["eth0".to_string(), "eth1".to_string()]);
        assert!(!probe.link_up());
    }

    #[test]
    fn test_read_mac() {
        let dir = fake_net(&[("eth0", "1", "00:1a:2b:3c:4d:5e\n")]);
        assert_eq!(read_mac(dir.path(), "eth0"), Some("00:1a:2b:3c:4d:5e".to_string()));
        assert_eq!(read_mac(dir.path(), "eth9"), None);
    }

    #[tokio::test]
    async fn test_ping_unknown_host_is_unreachable() {
        let probe = PingProbe::new();
        assert!(!probe.reachable("host.invalid", Duration::from_millis(200)).await);
    }
}
