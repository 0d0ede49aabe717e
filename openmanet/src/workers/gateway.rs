//! Gateway announcement and selection.
//!
//! Nodes in gateway server mode periodically announce themselves: the mesh interface MAC (the
//! identity batman-adv reports for gateway originators) together with the bridge IPv4 clients
//! route towards. Client nodes match batman-adv's best gateway against the announcements and
//! point their default route at the matching bridge address. batman-adv picks the gateway, we
//! never re-rank; our only job is translating its layer 2 choice into a layer 3 route.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, error, info};

use crate::alfred::Gossip;
use crate::batadv::{self, MeshProbe};
use crate::platform::NetPlatform;
use crate::records::{DataType, GatewayRecord, RECORD_VERSION};

pub struct GatewayEngine<G, P, N> {
    gossip: G,
    probe: P,
    platform: N,
    /// Name of the mesh bridge interface.
    iface: String,
}

impl<G, P, N> GatewayEngine<G, P, N>
where
    G: Gossip,
    P: MeshProbe,
    N: NetPlatform,
{
    pub fn new(gossip: G, probe: P, platform: N, iface: String) -> Self {
        Self {
            gossip,
            probe,
            platform,
            iface,
        }
    }

    /// Announce this node as a gateway, if it is one.
    pub async fn tick_send(&self) {
        let mesh = match self.probe.mesh_config().await {
            Ok(mesh) => mesh,
            Err(e) => {
                error!(err = %e, "failed to probe mesh config");
                return;
            }
        };
        if !mesh.is_server() {
            debug!("not in gateway mode, no announcement");
            return;
        }

        let iface = match self.platform.interface(&self.iface).await {
            Ok(iface) => iface,
            Err(e) => {
                debug!(iface = %self.iface, err = %e, "bridge interface not available yet");
                return;
            }
        };
        let Some(ip) = iface.ipv4() else {
            debug!(iface = %self.iface, "bridge has no IPv4 address yet");
            return;
        };
        if ip.is_loopback() || ip.is_unspecified() {
            debug!(iface = %self.iface, ip = %ip, "bridge address unusable for announcements");
            return;
        }

        let hostname = self.platform.hostname().unwrap_or_else(|e| {
            error!(err = %e, "failed to read hostname");
            "unknown".to_string()
        });
        let record = GatewayRecord {
            mac: mesh.hard_address.clone(),
            ipaddr: ip.to_string(),
            hostname,
        };

        if let Err(e) = self
            .gossip
            .push(DataType::Gateway, RECORD_VERSION, record.to_bytes())
            .await
        {
            error!(err = %e, "failed to publish gateway record");
        }
    }

    /// Follow the mesh's gateway choice with our default route. Only runs on clients.
    pub async fn tick_receive(&self) {
        let mesh = match self.probe.mesh_config().await {
            Ok(mesh) => mesh,
            Err(e) => {
                error!(err = %e, "failed to probe mesh config");
                return;
            }
        };
        if mesh.is_server() {
            debug!("in gateway mode, not selecting a gateway");
            return;
        }

        let records = match self.gossip.fetch(DataType::Gateway).await {
            Ok(records) => records,
            Err(e) => {
                error!(err = %e, "failed to fetch gateway records");
                return;
            }
        };
        let gateways = match self.probe.gateways().await {
            Ok(gateways) => gateways,
            Err(e) => {
                error!(err = %e, "failed to probe mesh gateways");
                return;
            }
        };
        if gateways.is_empty() {
            debug!("no gateways known to the mesh");
            return;
        }
        let Some(best) = batadv::best(&gateways) else {
            debug!(count = gateways.len(), "no gateway flagged best yet");
            return;
        };

        for record in records {
            let gateway = match GatewayRecord::from_bytes(&record.data) {
                Ok(gateway) => gateway,
                Err(e) => {
                    error!(source = %record.source_mac(), err = %e, "undecodable gateway record");
                    continue;
                }
            };
            if gateway.mac != best.orig_address {
                continue;
            }

            let ip: Ipv4Addr = match gateway.ipaddr.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    error!(source = %record.source_mac(), ipaddr = %gateway.ipaddr, "gateway record carries an unparsable address");
                    continue;
                }
            };
            self.adopt_gateway(ip, &gateway.hostname).await;
            // batman-adv has exactly one best gateway, further records can't match.
            break;
        }
    }

    /// Point the default route at the given gateway, unless it already does.
    async fn adopt_gateway(&self, gateway: Ipv4Addr, hostname: &str) {
        let current = match self.platform.default_route_v4().await {
            Ok(route) => route,
            Err(e) => {
                error!(err = %e, "failed to read default route");
                return;
            }
        };
        let unchanged = current
            .as_ref()
            .and_then(|route| route.gateway)
            .map(|ip| ip == IpAddr::V4(gateway))
            .unwrap_or(false);
        if unchanged {
            debug!(gateway = %gateway, "default route already points at the best gateway");
            return;
        }

        match self
            .platform
            .replace_default_route_v4(gateway, &self.iface)
            .await
        {
            Ok(()) => info!(gateway = %gateway, hostname, "default route switched to best gateway"),
            Err(e) => error!(gateway = %gateway, err = %e, "failed to replace default route"),
        }
    }
}
