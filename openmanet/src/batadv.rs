//! Interaction with the batman-adv mesh layer.
//!
//! All mesh state is read through the `batctl` command line tool, whose JSON subcommands are
//! invoked as subprocesses. The probe sits behind the [`MeshProbe`] trait so the engines can be
//! exercised against canned JSON in tests. Since multiple engines consult the mesh configuration
//! every few seconds, [`CachedProbe`] holds on to the last successful result for a short while to
//! avoid hammering the CLI. The cache is a plain value holder scoped to one probe instance,
//! correctness never depends on it.

use core::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::Command;
use tracing::trace;

/// How long a successful mesh config probe may be served from cache.
pub const MESH_CONFIG_TTL: Duration = Duration::from_secs(60);

/// Gateway mode string reported for nodes offering internet egress.
const GW_MODE_SERVER: &str = "server";
/// Gateway mode string reported for nodes using a peer as egress.
const GW_MODE_CLIENT: &str = "client";
/// Gateway mode string reported when gateway handling is disabled.
const GW_MODE_OFF: &str = "off";

/// The local mesh node configuration as reported by `batctl mj`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub algo_name: String,
    #[serde(default)]
    pub mesh_ifname: String,
    #[serde(default)]
    pub mesh_address: String,
    #[serde(default)]
    pub hard_ifname: String,
    /// Hardware address of the mesh interface. This is the identity batman-adv reports for
    /// gateway originators, and the identity our gateway records carry.
    #[serde(default)]
    pub hard_address: String,
    #[serde(default)]
    pub gw_mode: String,
    #[serde(default)]
    pub gw_bandwidth_down: u64,
    #[serde(default)]
    pub gw_bandwidth_up: u64,
    #[serde(default)]
    pub gw_sel_class: u32,
    #[serde(default)]
    pub hop_penalty: u32,
    #[serde(default)]
    pub orig_interval: u32,
    #[serde(default)]
    pub aggregated_ogms_enabled: bool,
    #[serde(default)]
    pub ap_isolation_enabled: bool,
    #[serde(default)]
    pub bonding_enabled: bool,
    #[serde(default)]
    pub bridge_loop_avoidance_enabled: bool,
    #[serde(default)]
    pub distributed_arp_table_enabled: bool,
    #[serde(default)]
    pub fragmentation_enabled: bool,
    #[serde(default)]
    pub multicast_forceflood_enabled: bool,
}

impl MeshConfig {
    /// Whether this node offers internet egress to the mesh.
    pub fn is_server(&self) -> bool {
        self.gw_mode == GW_MODE_SERVER
    }

    /// Whether this node selects a peer as its egress.
    pub fn is_client(&self) -> bool {
        self.gw_mode == GW_MODE_CLIENT
    }

    /// Whether gateway handling is disabled on this node.
    pub fn is_off(&self) -> bool {
        self.gw_mode == GW_MODE_OFF
    }
}

/// One entry of the gateway list reported by `batctl gwj`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayEntry {
    /// Originator address of the gateway, the mesh interface MAC of the announcing node.
    #[serde(default)]
    pub orig_address: String,
    #[serde(default)]
    pub router: String,
    #[serde(default)]
    pub hard_ifname: String,
    #[serde(default)]
    pub throughput: u64,
    #[serde(default)]
    pub bandwidth_up: u64,
    #[serde(default)]
    pub bandwidth_down: u64,
    /// Set on the entry the mesh routing algorithm selected. We respect this choice without
    /// re-ranking.
    #[serde(default)]
    pub best: bool,
}

/// The gateway entry batman-adv flagged as best, if any.
pub fn best(gateways: &[GatewayEntry]) -> Option<&GatewayEntry> {
    gateways.iter().find(|gw| gw.best)
}

/// An error while probing the mesh layer.
#[derive(Debug)]
pub enum ProbeError {
    /// The CLI could not be spawned.
    Io(io::Error),
    /// The CLI ran but exited unsuccessfully.
    Command(ExitStatus),
    /// The CLI output was not the JSON we expect.
    Json(serde_json::Error),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Io(e) => f.write_fmt(format_args!("failed to run mesh cli: {e}")),
            ProbeError::Command(status) => {
                f.write_fmt(format_args!("mesh cli exited with {status}"))
            }
            ProbeError::Json(e) => f.write_fmt(format_args!("malformed mesh cli output: {e}")),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Io(e) => Some(e),
            ProbeError::Json(e) => Some(e),
            ProbeError::Command(_) => None,
        }
    }
}

/// Read access to the mesh routing layer, one method per CLI subcommand.
pub trait MeshProbe: Send + Sync {
    /// The local mesh node configuration.
    fn mesh_config(&self) -> impl Future<Output = Result<MeshConfig, ProbeError>> + Send;

    /// The gateways currently known to batman-adv. Never cached, gateway selection must see
    /// fresh state.
    fn gateways(&self) -> impl Future<Output = Result<Vec<GatewayEntry>, ProbeError>> + Send;
}

/// [`MeshProbe`] implementation shelling out to `batctl`.
#[derive(Debug, Clone)]
pub struct BatctlProbe {
    command: String,
}

impl BatctlProbe {
    pub fn new() -> Self {
        Self {
            command: "batctl".to_string(),
        }
    }

    /// Use a different CLI binary, mainly useful on systems where batctl is not on the PATH.
    pub fn with_command(command: String) -> Self {
        Self { command }
    }

    async fn run(&self, subcommand: &str) -> Result<Vec<u8>, ProbeError> {
        let output = Command::new(&self.command)
            .arg(subcommand)
            .output()
            .await
            .map_err(ProbeError::Io)?;
        if !output.status.success() {
            return Err(ProbeError::Command(output.status));
        }
        Ok(output.stdout)
    }
}

impl Default for BatctlProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshProbe for BatctlProbe {
    async fn mesh_config(&self) -> Result<MeshConfig, ProbeError> {
        let stdout = self.run("mj").await?;
        serde_json::from_slice(&stdout).map_err(ProbeError::Json)
    }

    async fn gateways(&self) -> Result<Vec<GatewayEntry>, ProbeError> {
        let stdout = self.run("gwj").await?;
        serde_json::from_slice(&stdout).map_err(ProbeError::Json)
    }
}

/// A [`MeshProbe`] holding on to the last successful mesh config for a bounded time.
///
/// Concurrent readers may race on a cold cache and probe twice, which is harmless. Any probe
/// error invalidates the held value.
pub struct CachedProbe<P> {
    inner: P,
    ttl: Duration,
    cached: Mutex<Option<(Instant, MeshConfig)>>,
}

impl<P> CachedProbe<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

impl<P> MeshProbe for CachedProbe<P>
where
    P: MeshProbe,
{
    async fn mesh_config(&self) -> Result<MeshConfig, ProbeError> {
        if let Some((stored_at, config)) = &*self.cached.lock().unwrap() {
            if stored_at.elapsed() < self.ttl {
                trace!("serving mesh config from cache");
                return Ok(config.clone());
            }
        }

        match self.inner.mesh_config().await {
            Ok(config) => {
                *self.cached.lock().unwrap() = Some((Instant::now(), config.clone()));
                Ok(config)
            }
            Err(e) => {
                *self.cached.lock().unwrap() = None;
                Err(e)
            }
        }
    }

    async fn gateways(&self) -> Result<Vec<GatewayEntry>, ProbeError> {
        self.inner.gateways().await
    }
}

/// Truncate the batman-adv hosts file.
///
/// The file caches host name to originator bindings from previous runs. Stale entries confuse
/// gateway matching after nodes re-address, so the supervisor clears it once at startup.
pub async fn clear_bat_hosts(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, b"").await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted [`MeshProbe`] for engine tests.

    use std::sync::Mutex;

    use super::{GatewayEntry, MeshConfig, MeshProbe, ProbeError};

    pub struct FakeProbe {
        config: Mutex<Option<MeshConfig>>,
        gateways: Mutex<Vec<GatewayEntry>>,
        pub config_calls: Mutex<usize>,
    }

    impl FakeProbe {
        pub fn new(config: MeshConfig) -> Self {
            Self {
                config: Mutex::new(Some(config)),
                gateways: Mutex::new(Vec::new()),
                config_calls: Mutex::new(0),
            }
        }

        /// A probe which fails every mesh config call.
        pub fn failing() -> Self {
            Self {
                config: Mutex::new(None),
                gateways: Mutex::new(Vec::new()),
                config_calls: Mutex::new(0),
            }
        }

        pub fn with_gateways(self, gateways: Vec<GatewayEntry>) -> Self {
            *self.gateways.lock().unwrap() = gateways;
            self
        }

        pub fn set_gateways(&self, gateways: Vec<GatewayEntry>) {
            *self.gateways.lock().unwrap() = gateways;
        }
    }

    pub fn server_config(hard_address: &str) -> MeshConfig {
        MeshConfig {
            gw_mode: "server".to_string(),
            hard_address: hard_address.to_string(),
            ..Default::default()
        }
    }

    pub fn client_config() -> MeshConfig {
        MeshConfig {
            gw_mode: "client".to_string(),
            ..Default::default()
        }
    }

    impl MeshProbe for FakeProbe {
        async fn mesh_config(&self) -> Result<MeshConfig, ProbeError> {
            *self.config_calls.lock().unwrap() += 1;
            match &*self.config.lock().unwrap() {
                Some(config) => Ok(config.clone()),
                None => Err(ProbeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "batctl not available",
                ))),
            }
        }

        async fn gateways(&self) -> Result<Vec<GatewayEntry>, ProbeError> {
            Ok(self.gateways.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{server_config, FakeProbe};
    use super::*;

    const MESH_JSON: &str = r#"{
        "version": "2024.1",
        "algo_name": "BATMAN_V",
        "mesh_ifindex": 9,
        "mesh_ifname": "bat0",
        "mesh_address": "aa:bb:cc:dd:ee:ff",
        "hard_ifindex": 3,
        "hard_ifname": "wlan0",
        "hard_address": "02:ba:de:af:fe:01",
        "gw_mode": "server",
        "gw_bandwidth_down": 10000,
        "gw_bandwidth_up": 2000,
        "gw_sel_class": 20,
        "hop_penalty": 30,
        "orig_interval": 1000,
        "aggregated_ogms_enabled": true,
        "bridge_loop_avoidance_enabled": true,
        "distributed_arp_table_enabled": true,
        "fragmentation_enabled": true,
        "mcast_flags": {"raw": 0}
    }"#;

    const GATEWAYS_JSON: &str = r#"[
        {
            "hard_ifindex": 3,
            "hard_ifname": "wlan0",
            "orig_address": "02:ba:de:af:fe:01",
            "best": false,
            "throughput": 80000,
            "router": "02:ba:de:af:fe:01"
        },
        {
            "hard_ifindex": 3,
            "hard_ifname": "wlan0",
            "orig_address": "02:ba:de:af:fe:02",
            "best": true,
            "throughput": 110000,
            "router": "02:ba:de:af:fe:03"
        }
    ]"#;

    #[test]
    fn mesh_config_decodes_cli_output() {
        let config: MeshConfig = serde_json::from_str(MESH_JSON).expect("fixture decodes");
        assert_eq!(config.hard_address, "02:ba:de:af:fe:01");
        assert_eq!(config.mesh_ifname, "bat0");
        assert!(config.is_server());
        assert!(!config.is_client());
        assert!(!config.is_off());
    }

    #[test]
    fn gateway_list_decodes_and_selects_best() {
        let gateways: Vec<GatewayEntry> =
            serde_json::from_str(GATEWAYS_JSON).expect("fixture decodes");
        assert_eq!(gateways.len(), 2);

        let best = best(&gateways).expect("one entry is flagged best");
        assert_eq!(best.orig_address, "02:ba:de:af:fe:02");
    }

    #[test]
    fn best_is_none_without_flag() {
        let gateways = vec![GatewayEntry::default(), GatewayEntry::default()];
        assert!(best(&gateways).is_none());
    }

    #[tokio::test]
    async fn cache_serves_fresh_results() {
        let probe = CachedProbe::new(FakeProbe::new(server_config("02:00:00:00:00:01")), MESH_CONFIG_TTL);

        probe.mesh_config().await.expect("first probe");
        probe.mesh_config().await.expect("second probe");

        assert_eq!(*probe.inner.config_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_expires() {
        let probe = CachedProbe::new(
            FakeProbe::new(server_config("02:00:00:00:00:01")),
            Duration::ZERO,
        );

        probe.mesh_config().await.expect("first probe");
        probe.mesh_config().await.expect("second probe");

        assert_eq!(*probe.inner.config_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn cache_is_invalidated_on_error() {
        let probe = CachedProbe::new(FakeProbe::failing(), MESH_CONFIG_TTL);

        assert!(probe.mesh_config().await.is_err());
        assert!(probe.cached.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn bat_hosts_file_is_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bat-hosts");
        std::fs::write(&path, b"02:00:00:00:00:01 stale-gw\n").expect("seed file");

        clear_bat_hosts(&path).await.expect("clear succeeds");

        assert_eq!(std::fs::read(&path).expect("file readable"), b"");
    }
}
