//! VM launcher and network-reset capabilities.
//!
//! The hypervisor lives outside the core: the surrounding runtime hands the
//! manager a `VmLauncher` that can produce a booted micro-VM with networking
//! and a guest socket, and tear one down by id. A mock implementation backs
//! tests and development.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{AgentHandshake, HANDSHAKE_SUBJECT};
use crate::bus::Bus;

/// A freshly launched micro-VM.
#[derive(Debug, Clone)]
pub struct LaunchedVm {
    /// Unique machine id.
    pub vmid: String,

    /// Guest IP address.
    pub ip: String,

    /// vCPUs allocated to the guest.
    pub vcpu_count: i64,

    /// Guest memory size in MiB.
    pub mem_size_mib: i64,
}

/// Capability that boots and destroys micro-VMs.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    /// Build and start a new VM.
    async fn launch(&self) -> Result<LaunchedVm>;

    /// Shut a VM down. Must be safe to call for ids the launcher no longer
    /// tracks.
    async fn shutdown(&self, vmid: &str) -> Result<()>;
}

/// Capability that resets host networking state before the pool warms.
pub trait NetworkReset: Send + Sync {
    fn reset(&self) -> Result<()>;
}

/// No-op network reset for tests and non-CNI hosts.
pub struct NoopNetworkReset;

impl NetworkReset for NoopNetworkReset {
    fn reset(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Mock launcher
// =============================================================================

/// Mock launcher for testing and development.
///
/// Launched "VMs" exist only as records; when constructed with a bus handle
/// the mock announces an agent handshake for each launch, the way a real
/// guest agent would after boot.
pub struct MockLauncher {
    counter: AtomicU64,
    fail_launches: bool,
    announce_handshake: bool,
    internal_bus: Option<Arc<dyn Bus>>,
    shutdowns: Mutex<Vec<String>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_launches: false,
            announce_handshake: false,
            internal_bus: None,
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    /// A mock whose launches announce handshakes on the internal bus.
    pub fn with_handshakes(internal_bus: Arc<dyn Bus>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_launches: false,
            announce_handshake: true,
            internal_bus: Some(internal_bus),
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    /// A mock that launches VMs whose agents never announce themselves.
    pub fn silent(internal_bus: Arc<dyn Bus>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_launches: false,
            announce_handshake: false,
            internal_bus: Some(internal_bus),
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    /// A mock that fails all launches.
    pub fn failing() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_launches: true,
            announce_handshake: false,
            internal_bus: None,
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    /// Ids passed to `shutdown`, in order.
    pub async fn shutdown_ids(&self) -> Vec<String> {
        self.shutdowns.lock().await.clone()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmLauncher for MockLauncher {
    async fn launch(&self) -> Result<LaunchedVm> {
        if self.fail_launches {
            anyhow::bail!("mock launcher configured to fail");
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let vm = LaunchedVm {
            vmid: format!("vm_{n:08x}"),
            ip: format!("192.168.127.{}", (n % 250) + 2),
            vcpu_count: 1,
            mem_size_mib: 256,
        };

        info!(vmid = %vm.vmid, ip = %vm.ip, "[MOCK] VM launched");

        if self.announce_handshake {
            if let Some(bus) = &self.internal_bus {
                let handshake = AgentHandshake {
                    machine_id: vm.vmid.clone(),
                    start_time: chrono::Utc::now(),
                    message: Some("mock agent ready".to_string()),
                };
                let payload = serde_json::to_vec(&handshake)?;
                bus.publish(HANDSHAKE_SUBJECT, Bytes::from(payload))
                    .await
                    .map_err(|e| anyhow::anyhow!("handshake publish failed: {e}"))?;
            }
        }

        Ok(vm)
    }

    async fn shutdown(&self, vmid: &str) -> Result<()> {
        debug!(vmid = %vmid, "[MOCK] VM shutdown");
        self.shutdowns.lock().await.push(vmid.to_string());
        Ok(())
    }
}

// =============================================================================
// Host cleanup
// =============================================================================

/// Remove hypervisor socket files created by this process from the OS temp
/// directory. Called once during node shutdown.
pub fn clean_sockets() {
    let marker = format!(".firecracker.sock-{}-", std::process::id());
    let dir = std::env::temp_dir();

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Failed to read temp directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().contains(&marker) {
            if let Err(err) = std::fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %err, "Failed to remove socket file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_launcher_assigns_unique_ids() {
        let launcher = MockLauncher::new();
        let a = launcher.launch().await.unwrap();
        let b = launcher.launch().await.unwrap();
        assert_ne!(a.vmid, b.vmid);
        assert!(a.vmid.starts_with("vm_"));
    }

    #[tokio::test]
    async fn test_mock_launcher_records_shutdowns() {
        let launcher = MockLauncher::new();
        let vm = launcher.launch().await.unwrap();
        launcher.shutdown(&vm.vmid).await.unwrap();
        assert_eq!(launcher.shutdown_ids().await, vec![vm.vmid]);
    }

    #[tokio::test]
    async fn test_failing_launcher() {
        let launcher = MockLauncher::failing();
        assert!(launcher.launch().await.is_err());
    }

    #[test]
    fn test_clean_sockets_tolerates_empty_dir() {
        // Nothing of ours in the temp dir; must not error or remove anything.
        clean_sockets();
    }
}
