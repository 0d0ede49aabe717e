//! Node presence records.
//!
//! Every node periodically announces its bridge MAC, host name and bridge address. The consumer
//! side is informational, peers mainly feed dashboards and debugging; nothing on the node reacts
//! to it.

use tracing::{debug, error};

use crate::alfred::Gossip;
use crate::platform::NetPlatform;
use crate::records::{DataType, NodeRecord, RECORD_VERSION};

pub struct NodeEngine<G, N> {
    gossip: G,
    platform: N,
    iface: String,
}

impl<G, N> NodeEngine<G, N>
where
    G: Gossip,
    N: NetPlatform,
{
    pub fn new(gossip: G, platform: N, iface: String) -> Self {
        Self {
            gossip,
            platform,
            iface,
        }
    }

    pub async fn tick_send(&self) {
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

        let hostname = self.platform.hostname().unwrap_or_else(|e| {
            error!(err = %e, "failed to read hostname");
            "unknown".to_string()
        });
        let record = NodeRecord {
            mac: iface.mac,
            hostname,
            ipaddr: ip.to_string(),
        };

        if let Err(e) = self
            .gossip
            .push(DataType::Node, RECORD_VERSION, record.to_bytes())
            .await
        {
            error!(err = %e, "failed to publish node record");
        }
    }

    pub async fn tick_receive(&self) {
        let records = match self.gossip.fetch(DataType::Node).await {
            Ok(records) => records,
            Err(e) => {
                error!(err = %e, "failed to fetch node records");
                return;
            }
        };

        for record in records {
            match NodeRecord::from_bytes(&record.data) {
                Ok(node) => {
                    debug!(source = %record.source_mac(), hostname = %node.hostname, ipaddr = %node.ipaddr, "peer present")
                }
                Err(e) => {
                    error!(source = %record.source_mac(), err = %e, "undecodable node record")
                }
            }
        }
    }
}
