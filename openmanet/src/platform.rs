//! The platform surface the engines mutate.
//!
//! [`NetPlatform`] bundles everything the workers need from the host besides the config tree:
//! interface state, the default route, the network service reload hook and the host name. The
//! production implementation drives rtnetlink and the router's own init script; tests substitute
//! a scripted fake.

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;

use rtnetlink::Handle;
use tracing::debug;

use crate::iface::{self, Interface};
use crate::route::{self, Route};

/// Path of the network service init script on the router.
const NETWORK_SERVICE: &str = "/etc/init.d/network";

/// Host state consumed and mutated by the engines.
pub trait NetPlatform: Send + Sync {
    /// Look up a local interface by name.
    fn interface(&self, name: &str) -> impl Future<Output = io::Result<Interface>> + Send;

    /// The current IPv4 main table default route.
    fn default_route_v4(&self) -> impl Future<Output = io::Result<Option<Route>>> + Send;

    /// Atomically install or replace the IPv4 default route, preserving the existing metric.
    fn replace_default_route_v4(
        &self,
        gateway: Ipv4Addr,
        device: &str,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Ask the router to re-apply its network configuration.
    fn reload_network(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// The local host name.
    fn hostname(&self) -> io::Result<String>;
}

/// [`NetPlatform`] implementation backed by a shared rtnetlink connection.
#[derive(Clone)]
pub struct SystemPlatform {
    handle: Handle,
}

impl SystemPlatform {
    /// Open the netlink connection. The connection task lives for the rest of the process.
    pub fn new() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

impl NetPlatform for SystemPlatform {
    async fn interface(&self, name: &str) -> io::Result<Interface> {
        iface::interface_by_name(&self.handle, name).await
    }

    async fn default_route_v4(&self) -> io::Result<Option<Route>> {
        route::default_route_v4(&self.handle).await
    }

    async fn replace_default_route_v4(&self, gateway: Ipv4Addr, device: &str) -> io::Result<()> {
        route::replace_default_route_v4(&self.handle, gateway, device).await
    }

    async fn reload_network(&self) -> io::Result<()> {
        let status = tokio::process::Command::new(NETWORK_SERVICE)
            .arg("reload")
            .status()
            .await?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "network reload exited with {status}"
            )));
        }
        debug!("network service reloaded");
        Ok(())
    }

    fn hostname(&self) -> io::Result<String> {
        let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")?;
        Ok(raw.trim().to_string())
    }
}
