//! Distributed address reservation.
//!
//! A node is in one of two states, tracked by the `dhcpconfigured` flag in the config tree:
//!
//! * unconfigured: it broadcasts reservation requests so peers know its MAC, and on every
//!   receive tick tries to allocate a static address plus a DHCP window out of the observed
//!   reservations, then commits the result to the config tree in one transition.
//! * configured: it never allocates again. It only answers requests by republishing its settled
//!   reservation so joining nodes see the allocation.
//!
//! The configure transition is network section, DHCP section, network service reload, configured
//! flag, in that order. Any failing step aborts the tick without the flag being set, so the node
//! simply retries on the next tick.

use core::fmt;
use std::collections::HashSet;
use std::net::Ipv4Addr;

use tracing::{debug, error, info};

use crate::addressing::{
    self, DhcpRange, DEFAULT_DHCP_LIMIT, DHCP_LEASE_TIME, MESH_NETMASK,
};
use crate::alfred::{Gossip, Record};
use crate::batadv::MeshProbe;
use crate::iface::Interface;
use crate::platform::NetPlatform;
use crate::records::{AddressReservation, DataType, RECORD_VERSION};
use crate::uci::{self, UciTree};

/// Prefix marking an interface as the bridge over a physical link. UCI network and DHCP sections
/// are tied to the physical interface name.
const BRIDGE_PREFIX: &str = "br-";

pub struct ReservationEngine<G, P, N, U> {
    gossip: G,
    probe: P,
    platform: N,
    tree: U,
    iface: String,
}

/// The bridge carried no usable IPv4 address, so no response could be assembled.
#[derive(Debug)]
struct ResponseError;

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bridge has no usable IPv4 address")
    }
}

impl<G, P, N, U> ReservationEngine<G, P, N, U>
where
    G: Gossip,
    P: MeshProbe,
    N: NetPlatform,
    U: UciTree,
{
    pub fn new(gossip: G, probe: P, platform: N, tree: U, iface: String) -> Self {
        Self {
            gossip,
            probe,
            platform,
            tree,
            iface,
        }
    }

    /// The UCI section name for the bridge, the physical interface without the bridge prefix.
    fn physical_ifname(&self) -> &str {
        self.iface.strip_prefix(BRIDGE_PREFIX).unwrap_or(&self.iface)
    }

    /// Broadcast a reservation request while this node is unconfigured.
    pub async fn tick_send(&self) {
        match uci::dhcp_configured(&self.tree) {
            Ok(true) => {
                debug!("addressing already configured, no request");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(err = %e, "failed to read configured flag");
                return;
            }
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

        let request = AddressReservation {
            mac: iface.mac,
            static_ip: ip.to_string(),
            requesting_reservation: true,
            ..Default::default()
        };
        if let Err(e) = self
            .gossip
            .push(
                DataType::AddressReservation,
                RECORD_VERSION,
                request.to_bytes(),
            )
            .await
        {
            error!(err = %e, "failed to publish reservation request");
        }
    }

    /// Process the observed reservation set: answer requests when configured, allocate when not.
    pub async fn tick_receive(&self) {
        let records = match self.gossip.fetch(DataType::AddressReservation).await {
            Ok(records) => records,
            Err(e) => {
                error!(err = %e, "failed to fetch reservation records");
                return;
            }
        };
        let configured = match uci::dhcp_configured(&self.tree) {
            Ok(configured) => configured,
            Err(e) => {
                error!(err = %e, "failed to read configured flag");
                return;
            }
        };
        let iface = match self.platform.interface(&self.iface).await {
            Ok(iface) => iface,
            Err(e) => {
                debug!(iface = %self.iface, err = %e, "bridge interface not available yet");
                return;
            }
        };

        if configured {
            self.answer_requests(&records, &iface).await;
        } else {
            self.configure(&records).await;
        }
    }

    /// Republish our settled allocation for every requesting peer.
    async fn answer_requests(&self, records: &[Record], iface: &Interface) {
        for record in records {
            let reservation = match AddressReservation::from_bytes(&record.data) {
                Ok(reservation) => reservation,
                Err(e) => {
                    error!(source = %record.source_mac(), err = %e, "undecodable reservation record");
                    continue;
                }
            };
            if !reservation.requesting_reservation || reservation.mac == iface.mac {
                continue;
            }

            debug!(peer = %reservation.mac, "answering reservation request");
            let response = match self.build_response(iface) {
                Ok(response) => response,
                Err(e) => {
                    error!(err = %e, "failed to assemble reservation response");
                    continue;
                }
            };
            if let Err(e) = self
                .gossip
                .push(
                    DataType::AddressReservation,
                    RECORD_VERSION,
                    response.to_bytes(),
                )
                .await
            {
                error!(err = %e, "failed to publish reservation response");
            }
        }
    }

    fn build_response(&self, iface: &Interface) -> Result<AddressReservation, ResponseError> {
        let ip = iface.ipv4().ok_or(ResponseError)?;
        if ip.is_unspecified() || ip.is_loopback() {
            return Err(ResponseError);
        }
        let cidr = iface
            .cidr_strings()
            .into_iter()
            .next()
            .ok_or(ResponseError)?;
        let dhcp = uci::read_dhcp_section(&self.tree, self.physical_ifname());

        Ok(AddressReservation {
            mac: iface.mac.clone(),
            static_ip: ip.to_string(),
            reservation_cidr: cidr,
            uci_dhcp_start: dhcp.start.unwrap_or_default(),
            uci_dhcp_limit: dhcp.limit.unwrap_or_default(),
            requesting_reservation: false,
        })
    }

    /// Run the configure transition. Every step may abort the tick; the configured flag is only
    /// written once the live system carries the new state.
    async fn configure(&self, records: &[Record]) {
        let mesh = match self.probe.mesh_config().await {
            Ok(mesh) => mesh,
            Err(e) => {
                error!(err = %e, "failed to probe mesh config");
                return;
            }
        };
        let gateway_mode = mesh.is_server();

        let mut reserved = HashSet::new();
        let mut occupied = Vec::new();
        for record in records {
            let reservation = match AddressReservation::from_bytes(&record.data) {
                Ok(reservation) => reservation,
                Err(e) => {
                    error!(source = %record.source_mac(), err = %e, "undecodable reservation record");
                    continue;
                }
            };
            if let Ok(ip) = reservation.static_ip.parse::<Ipv4Addr>() {
                reserved.insert(ip);
            }
            // Records with unparsable windows are ignored for the DHCP computation.
            if let (Ok(start), Ok(limit)) = (
                reservation.uci_dhcp_start.parse::<u32>(),
                reservation.uci_dhcp_limit.parse::<u32>(),
            ) {
                if let Some(range) = DhcpRange::new(start, limit) {
                    occupied.push(range);
                }
            }
        }

        let static_ip = match addressing::select_static_ip(&reserved, gateway_mode) {
            Ok(ip) => ip,
            Err(e) => {
                error!(err = %e, "static address selection failed");
                return;
            }
        };
        let dhcp_start =
            match addressing::select_dhcp_start(&occupied, MESH_NETMASK, DEFAULT_DHCP_LIMIT) {
                Ok(start) => start,
                Err(e) => {
                    error!(err = %e, "dhcp window selection failed");
                    return;
                }
            };

        let section = self.physical_ifname().to_string();
        let network = uci::NetworkSection {
            proto: Some("static".to_string()),
            ipaddr: Some(static_ip.to_string()),
            netmask: Some(MESH_NETMASK.to_string()),
            device: Some(self.iface.clone()),
            ip6assign: Some("64".to_string()),
            ip6ifaceid: Some("eui64".to_string()),
            ip6class: vec!["local".to_string()],
            ..Default::default()
        };
        if let Err(e) = uci::write_network_section(&self.tree, &section, &network) {
            error!(err = %e, "failed to write network section");
            return;
        }

        let dhcp = uci::DhcpSection {
            interface: Some(section.clone()),
            start: Some(dhcp_start.to_string()),
            limit: Some(DEFAULT_DHCP_LIMIT.to_string()),
            leasetime: Some(DHCP_LEASE_TIME.to_string()),
            force: Some("1".to_string()),
            ..Default::default()
        };
        if let Err(e) = uci::write_dhcp_section(&self.tree, &section, &dhcp) {
            error!(err = %e, "failed to write dhcp section");
            return;
        }

        if let Err(e) = self.platform.reload_network().await {
            error!(err = %e, "network reload failed, will retry next tick");
            return;
        }

        if let Err(e) = uci::set_dhcp_configured(&self.tree) {
            error!(err = %e, "failed to persist configured flag, will reapply next tick");
            return;
        }

        info!(
            static_ip = %static_ip,
            dhcp_start,
            dhcp_limit = DEFAULT_DHCP_LIMIT,
            gateway_mode,
            "addressing configured"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alfred::testing::MemGossip;
    use crate::batadv::testing::{client_config, server_config, FakeProbe};
    use crate::platform::testing::FakePlatform;
    use crate::uci::FsTree;

    fn reservation_record(source_octet: u8, reservation: &AddressReservation) -> Record {
        Record {
            source: [0xaa, 0, 0, 0, 0, source_octet],
            data: reservation.to_bytes(),
        }
    }

    fn settled(mac: &str, ip: &str, start: &str, limit: &str) -> AddressReservation {
        AddressReservation {
            mac: mac.to_string(),
            static_ip: ip.to_string(),
            reservation_cidr: format!("{ip}/16"),
            uci_dhcp_start: start.to_string(),
            uci_dhcp_limit: limit.to_string(),
            requesting_reservation: false,
        }
    }

    fn engine(
        dir: &tempfile::TempDir,
        gossip: MemGossip,
        probe: FakeProbe,
        platform: FakePlatform,
    ) -> ReservationEngine<MemGossip, FakeProbe, FakePlatform, FsTree> {
        ReservationEngine::new(
            gossip,
            probe,
            platform,
            FsTree::new(dir.path().to_path_buf()),
            "br-ahwlan".to_string(),
        )
    }

    #[tokio::test]
    async fn unconfigured_node_requests_a_reservation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let e = engine(
            &dir,
            MemGossip::new(),
            FakeProbe::new(client_config()),
            FakePlatform::new()
                .with_bridge("aa:bb:cc:dd:ee:01", Some(Ipv4Addr::new(169, 254, 7, 7))),
        );

        e.tick_send().await;

        let pushed = e.gossip.pushed();
        assert_eq!(pushed.len(), 1);
        let request =
            AddressReservation::from_bytes(&pushed[0].1).expect("published record decodes");
        assert!(request.requesting_reservation);
        assert_eq!(request.mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(request.static_ip, "169.254.7.7");
    }

    #[tokio::test]
    async fn configured_node_stays_quiet_on_send() {
        let dir = tempfile::tempdir().expect("tempdir");
        let e = engine(
            &dir,
            MemGossip::new(),
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:01", Some(Ipv4Addr::new(10, 41, 2, 1))),
        );
        uci::set_dhcp_configured(&e.tree).expect("mark configured");

        e.tick_send().await;

        assert!(e.gossip.pushed().is_empty());
    }

    #[tokio::test]
    async fn client_join_scenario_converges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gossip = MemGossip::new();
        gossip.seed(
            DataType::AddressReservation,
            vec![reservation_record(
                1,
                &settled("aa:bb:cc:dd:ee:01", "10.41.0.5", "100", "150"),
            )],
        );
        let e = engine(
            &dir,
            gossip,
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(169, 254, 3, 3))),
        );

        e.tick_receive().await;

        // First free address outside the gateway and restricted slices.
        let network = uci::read_network_section(&e.tree, "ahwlan");
        assert_eq!(network.proto.as_deref(), Some("static"));
        assert_eq!(network.ipaddr.as_deref(), Some("10.41.1.1"));
        assert_eq!(network.netmask.as_deref(), Some("255.255.0.0"));
        assert_eq!(network.device.as_deref(), Some("br-ahwlan"));
        assert_eq!(network.ip6assign.as_deref(), Some("64"));

        // First window clear of [100, 249].
        let dhcp = uci::read_dhcp_section(&e.tree, "ahwlan");
        assert_eq!(dhcp.interface.as_deref(), Some("ahwlan"));
        assert_eq!(dhcp.start.as_deref(), Some("250"));
        assert_eq!(dhcp.limit.as_deref(), Some("16"));
        assert_eq!(dhcp.leasetime.as_deref(), Some("12h"));
        assert_eq!(dhcp.force.as_deref(), Some("1"));

        assert_eq!(*e.platform.network_reloads.lock().unwrap(), 1);
        assert!(uci::dhcp_configured(&e.tree).expect("flag readable"));
    }

    #[tokio::test]
    async fn gateway_node_allocates_from_the_zero_slice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let e = engine(
            &dir,
            MemGossip::new(),
            FakeProbe::new(server_config("02:ba:de:af:fe:01")),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:01", Some(Ipv4Addr::new(169, 254, 3, 3))),
        );

        e.tick_receive().await;

        let network = uci::read_network_section(&e.tree, "ahwlan");
        assert_eq!(network.ipaddr.as_deref(), Some("10.41.0.1"));
        assert!(uci::dhcp_configured(&e.tree).expect("flag readable"));
    }

    #[tokio::test]
    async fn second_tick_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let e = engine(
            &dir,
            MemGossip::new(),
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(169, 254, 3, 3))),
        );

        e.tick_receive().await;
        let first = uci::read_network_section(&e.tree, "ahwlan");

        e.tick_receive().await;
        let second = uci::read_network_section(&e.tree, "ahwlan");

        assert_eq!(first, second);
        // The transition ran exactly once.
        assert_eq!(*e.platform.network_reloads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_reload_aborts_the_transition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let e = engine(
            &dir,
            MemGossip::new(),
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(169, 254, 3, 3))),
        );
        *e.platform.fail_reload.lock().unwrap() = true;

        e.tick_receive().await;

        // Not configured, the node retries next tick.
        assert!(!uci::dhcp_configured(&e.tree).expect("flag readable"));

        // Once the platform recovers the transition completes.
        *e.platform.fail_reload.lock().unwrap() = false;
        e.tick_receive().await;
        assert!(uci::dhcp_configured(&e.tree).expect("flag readable"));
    }

    #[tokio::test]
    async fn malformed_records_do_not_block_convergence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gossip = MemGossip::new();
        gossip.seed(
            DataType::AddressReservation,
            vec![
                Record {
                    source: [0xaa, 0, 0, 0, 0, 9],
                    data: vec![0x0a, 0xff, 0xff],
                },
                reservation_record(1, &settled("aa:bb:cc:dd:ee:01", "10.41.1.1", "100", "16")),
            ],
        );
        let e = engine(
            &dir,
            gossip,
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(169, 254, 3, 3))),
        );

        e.tick_receive().await;

        let network = uci::read_network_section(&e.tree, "ahwlan");
        // The valid record's address is respected, the garbage one is skipped.
        assert_eq!(network.ipaddr.as_deref(), Some("10.41.1.2"));
        assert!(uci::dhcp_configured(&e.tree).expect("flag readable"));
    }

    #[tokio::test]
    async fn configured_node_answers_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gossip = MemGossip::new();
        gossip.seed(
            DataType::AddressReservation,
            vec![reservation_record(
                9,
                &AddressReservation {
                    mac: "aa:bb:cc:dd:ee:09".to_string(),
                    static_ip: "169.254.9.9".to_string(),
                    requesting_reservation: true,
                    ..Default::default()
                },
            )],
        );
        let e = engine(
            &dir,
            gossip,
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(10, 41, 1, 1))),
        );
        uci::write_dhcp_section(
            &e.tree,
            "ahwlan",
            &uci::DhcpSection {
                interface: Some("ahwlan".to_string()),
                start: Some("250".to_string()),
                limit: Some("16".to_string()),
                leasetime: Some("12h".to_string()),
                force: Some("1".to_string()),
                ..Default::default()
            },
        )
        .expect("seed dhcp section");
        uci::set_dhcp_configured(&e.tree).expect("mark configured");

        e.tick_receive().await;

        let pushed = e.gossip.pushed();
        assert_eq!(pushed.len(), 1);
        let response =
            AddressReservation::from_bytes(&pushed[0].1).expect("published record decodes");
        assert!(!response.requesting_reservation);
        assert_eq!(response.mac, "aa:bb:cc:dd:ee:02");
        assert_eq!(response.static_ip, "10.41.1.1");
        assert_eq!(response.reservation_cidr, "10.41.1.1/16");
        assert_eq!(response.uci_dhcp_start, "250");
        assert_eq!(response.uci_dhcp_limit, "16");
    }

    #[tokio::test]
    async fn configured_node_ignores_its_own_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gossip = MemGossip::new();
        gossip.seed(
            DataType::AddressReservation,
            vec![reservation_record(
                2,
                &AddressReservation {
                    mac: "aa:bb:cc:dd:ee:02".to_string(),
                    static_ip: "10.41.1.1".to_string(),
                    requesting_reservation: true,
                    ..Default::default()
                },
            )],
        );
        let e = engine(
            &dir,
            gossip,
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(10, 41, 1, 1))),
        );
        uci::set_dhcp_configured(&e.tree).expect("mark configured");

        e.tick_receive().await;

        assert!(e.gossip.pushed().is_empty());
    }

    #[tokio::test]
    async fn configured_node_never_reallocates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let e = engine(
            &dir,
            MemGossip::new(),
            FakeProbe::new(client_config()),
            FakePlatform::new().with_bridge("aa:bb:cc:dd:ee:02", Some(Ipv4Addr::new(10, 41, 1, 1))),
        );
        uci::set_dhcp_configured(&e.tree).expect("mark configured");

        e.tick_receive().await;

        assert_eq!(*e.platform.network_reloads.lock().unwrap(), 0);
        assert_eq!(
            uci::read_network_section(&e.tree, "ahwlan"),
            uci::NetworkSection::default()
        );
    }
}
