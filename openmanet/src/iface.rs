//! Local network interface inspection through rtnetlink.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkFlag};
use rtnetlink::Handle;

/// Link level flags we care about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub running: bool,
    pub multicast: bool,
}

/// One address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
    pub broadcast: Option<Ipv4Addr>,
}

/// A local network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    /// Hardware address in colon separated form, empty for links without one.
    pub mac: String,
    pub flags: LinkState,
    pub addrs: Vec<IfaceAddress>,
}

impl Interface {
    /// The first IPv4 address on the interface, if any.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|a| match a.addr {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    }

    /// The netmask of the first IPv4 address.
    pub fn netmask_v4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|a| match a.addr {
            IpAddr::V4(_) => Some(netmask_from_prefix(a.prefix_len)),
            IpAddr::V6(_) => None,
        })
    }

    /// All addresses in CIDR notation.
    pub fn cidr_strings(&self) -> Vec<String> {
        self.addrs
            .iter()
            .map(|a| format!("{}/{}", a.addr, a.prefix_len))
            .collect()
    }
}

/// Expand an IPv4 prefix length into a dotted netmask.
pub fn netmask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len.min(32) as u32)
    };
    Ipv4Addr::from(bits)
}

/// Look up an interface by name, including its assigned addresses.
pub async fn interface_by_name(handle: &Handle, name: &str) -> io::Result<Interface> {
    let link = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .map_err(io::Error::other)?
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("interface {name} not found"))
        })?;

    let mut iface = Interface {
        name: name.to_string(),
        index: link.header.index,
        ..Default::default()
    };
    for flag in &link.header.flags {
        match flag {
            LinkFlag::Up => iface.flags.up = true,
            LinkFlag::Running => iface.flags.running = true,
            LinkFlag::Multicast => iface.flags.multicast = true,
            _ => {}
        }
    }
    for attr in &link.attributes {
        match attr {
            LinkAttribute::Mtu(mtu) => iface.mtu = *mtu,
            LinkAttribute::Address(raw) => iface.mac = format_mac(raw),
            _ => {}
        }
    }

    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(iface.index)
        .execute();
    while let Some(msg) = addresses.try_next().await.map_err(io::Error::other)? {
        let mut addr = None;
        let mut local = None;
        let mut broadcast = None;
        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Address(ip) => addr = Some(*ip),
                AddressAttribute::Local(ip) => local = Some(*ip),
                AddressAttribute::Broadcast(ip) => broadcast = Some(*ip),
                _ => {}
            }
        }
        // For IPv4 the interface address lives in the local attribute, the address attribute
        // holds the peer on point to point links.
        if let Some(ip) = local.or(addr) {
            iface.addrs.push(IfaceAddress {
                addr: ip,
                prefix_len: msg.header.prefix_len,
                broadcast,
            });
        }
    }

    Ok(iface)
}

fn format_mac(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
