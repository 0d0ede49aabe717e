//! Control plane for nodes in an OpenMANET mesh.
//!
//! The mesh itself is layer 2, routed by batman-adv. This crate runs the coordination on top:
//! a set of periodic workers gossiping typed records through the local Alfred daemon to
//! self-organize addressing and internet egress across the mesh, plus an optional push-to-talk
//! voice pipeline multicasting Opus frames on the mesh bridge.
//!
//! The [`Node`] owns everything: it boots the platform adapters, starts the enabled worker
//! pairs and the PTT session, and tears it all down when asked. There is no central coordinator
//! anywhere, every node runs this same symmetric logic and the mesh converges through the
//! gossiped records alone.

use core::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod addressing;
pub mod alfred;
pub mod batadv;
pub mod iface;
pub mod platform;
pub mod ptt;
pub mod records;
pub mod route;
pub mod shutdown;
pub mod uci;
pub mod workers;

use alfred::Client;
use batadv::{BatctlProbe, CachedProbe, MESH_CONFIG_TTL};
use platform::{NetPlatform, SystemPlatform};
use ptt::{PttConfig, PttSession};
use shutdown::Shutdown;
use uci::FsTree;
use workers::gateway::GatewayEngine;
use workers::node::NodeEngine;
use workers::reservation::ReservationEngine;
use workers::{spawn_ticker, Intervals};

/// Default name of the mesh bridge interface.
pub const DEFAULT_MESH_INTERFACE: &str = "br-ahwlan";
/// Default path of the batman-adv hosts file cleared at startup.
pub const DEFAULT_BAT_HOSTS_PATH: &str = "/etc/bat-hosts";

/// Config for an openmanet [`Node`].
pub struct Config {
    /// Name of the mesh bridge interface.
    pub iface: String,
    /// Path of the Alfred daemon socket.
    pub alfred_socket: PathBuf,
    /// Path of the batman-adv hosts file. Stale name bindings in it confuse gateway matching,
    /// it is cleared once at startup.
    pub bat_hosts_path: PathBuf,
    /// Root of the UCI configuration tree.
    pub uci_tree_path: PathBuf,
    /// Whether the gateway record workers run.
    pub gateway_records: bool,
    /// Whether the node presence workers run.
    pub node_records: bool,
    /// Whether the address reservation workers run.
    pub reservation_records: bool,
    /// Tick intervals for all worker pairs.
    pub intervals: Intervals,
    /// PTT voice configuration, if enabled.
    pub ptt: Option<PttConfig>,
}

/// A fatal bootstrap error. The engines themselves never surface errors upward, they log and
/// retry; only bootstrap can fail.
#[derive(Debug)]
pub enum NodeError {
    /// The Alfred daemon socket is unreachable.
    Alfred(alfred::AlfredError),
    /// The netlink connection could not be opened.
    Platform(io::Error),
    /// PTT was enabled but its pipeline could not be brought up.
    Ptt(ptt::PttError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Alfred(e) => f.write_fmt(format_args!("alfred unavailable: {e}")),
            NodeError::Platform(e) => f.write_fmt(format_args!("platform setup failed: {e}")),
            NodeError::Ptt(e) => f.write_fmt(format_args!("ptt setup failed: {e}")),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Alfred(e) => Some(e),
            NodeError::Platform(e) => Some(e),
            NodeError::Ptt(e) => Some(e),
        }
    }
}

/// A running mesh control plane node.
pub struct Node {
    shutdown: Shutdown,
    workers: Vec<JoinHandle<()>>,
    ptt: Option<PttSession>,
}

impl Node {
    /// Boot the node: verify the Alfred socket, clear stale mesh host names, start the enabled
    /// worker pairs and the PTT pipeline.
    pub async fn new(config: Config) -> Result<Self, NodeError> {
        // Best effort, a read only filesystem should not keep the mesh down.
        if let Err(e) = batadv::clear_bat_hosts(&config.bat_hosts_path).await {
            warn!(path = %config.bat_hosts_path.display(), err = %e, "failed to clear bat-hosts file");
        }

        let gossip = Client::new(config.alfred_socket.clone());
        gossip.check().await.map_err(NodeError::Alfred)?;

        let platform = SystemPlatform::new().map_err(NodeError::Platform)?;

        let shutdown = Shutdown::new();
        let mut workers = Vec::new();
        let intervals = config.intervals;

        if config.gateway_records {
            let engine = Arc::new(GatewayEngine::new(
                gossip.clone(),
                CachedProbe::new(BatctlProbe::new(), MESH_CONFIG_TTL),
                platform.clone(),
                config.iface.clone(),
            ));
            workers.push(spawn_ticker(
                "gateway-send",
                intervals.gateway_send,
                shutdown.subscribe(),
                {
                    let engine = engine.clone();
                    move || {
                        let engine = engine.clone();
                        async move { engine.tick_send().await }
                    }
                },
            ));
            workers.push(spawn_ticker(
                "gateway-recv",
                intervals.gateway_recv,
                shutdown.subscribe(),
                move || {
                    let engine = engine.clone();
                    async move { engine.tick_receive().await }
                },
            ));
        }

        if config.node_records {
            let engine = Arc::new(NodeEngine::new(
                gossip.clone(),
                platform.clone(),
                config.iface.clone(),
            ));
            workers.push(spawn_ticker(
                "node-send",
                intervals.node_send,
                shutdown.subscribe(),
                {
                    let engine = engine.clone();
                    move || {
                        let engine = engine.clone();
                        async move { engine.tick_send().await }
                    }
                },
            ));
            workers.push(spawn_ticker(
                "node-recv",
                intervals.node_recv,
                shutdown.subscribe(),
                move || {
                    let engine = engine.clone();
                    async move { engine.tick_receive().await }
                },
            ));
        }

        if config.reservation_records {
            let engine = Arc::new(ReservationEngine::new(
                gossip.clone(),
                CachedProbe::new(BatctlProbe::new(), MESH_CONFIG_TTL),
                platform.clone(),
                FsTree::new(config.uci_tree_path.clone()),
                config.iface.clone(),
            ));
            workers.push(spawn_ticker(
                "reservation-send",
                intervals.reservation_send,
                shutdown.subscribe(),
                {
                    let engine = engine.clone();
                    move || {
                        let engine = engine.clone();
                        async move { engine.tick_send().await }
                    }
                },
            ));
            workers.push(spawn_ticker(
                "reservation-recv",
                intervals.reservation_recv,
                shutdown.subscribe(),
                move || {
                    let engine = engine.clone();
                    async move { engine.tick_receive().await }
                },
            ));
        }

        let ptt = match config.ptt {
            Some(ptt_config) => {
                let iface = platform
                    .interface(&ptt_config.iface)
                    .await
                    .map_err(|e| NodeError::Ptt(ptt::PttError::Io(e)))?;
                let local_ip = iface.ipv4().ok_or_else(|| {
                    NodeError::Ptt(ptt::PttError::Io(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no IPv4 address on {}", ptt_config.iface),
                    )))
                })?;
                Some(
                    PttSession::start(ptt_config, local_ip)
                        .await
                        .map_err(NodeError::Ptt)?,
                )
            }
            None => None,
        };

        info!(workers = workers.len(), ptt = ptt.is_some(), "node started");
        Ok(Self {
            shutdown,
            workers,
            ptt,
        })
    }

    /// Stop every worker loop and the PTT session, then return. Workers observe the signal at
    /// their next suspension point.
    pub async fn stop(self) {
        self.shutdown.trigger();
        for worker in self.workers {
            let _ = worker.await;
        }
        if let Some(ptt) = self.ptt {
            ptt.stop().await;
        }
        info!("node stopped");
    }
}
