//! Address allocation over the shared mesh subnet.
//!
//! Every node carves its static address and DHCP window out of `10.41.0.0/16` using nothing but
//! the reservation records it observed on the gossip channel. There is no coordinator; two nodes
//! racing for the same address resolve the conflict on a later round once both see each other's
//! records. The functions here are pure, the reservation engine feeds them the decoded record
//! set.

use core::fmt;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// The mesh wide addressing subnet.
pub const MESH_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 41, 0, 0);
/// Netmask of [`MESH_NETWORK`].
pub const MESH_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);

/// Third octets reserved for infrastructure, never handed to regular nodes.
const RESTRICTED_SLICES: [u8; 2] = [253, 254];

/// Default size of the DHCP pool each node serves.
pub const DEFAULT_DHCP_LIMIT: u32 = 16;
/// Lease time written with every DHCP pool.
pub const DHCP_LEASE_TIME: &str = "12h";
/// Conventional low water mark for DHCP pools; the first search pass starts here.
const DHCP_SEARCH_FLOOR: u32 = 100;

/// No allocation satisfying the constraints exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    /// Every candidate static address is reserved.
    NoFreeAddress { gateway_mode: bool },
    /// No DHCP window of the requested size fits.
    NoFreeDhcpWindow { limit: u32 },
    /// The DHCP request itself was malformed.
    InvalidDhcpLimit,
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionError::NoFreeAddress { gateway_mode: true } => {
                f.write_str("no free address in the gateway slice 10.41.0.0/24")
            }
            SelectionError::NoFreeAddress {
                gateway_mode: false,
            } => f.write_str("no free address in 10.41.0.0/16"),
            SelectionError::NoFreeDhcpWindow { limit } => {
                f.write_fmt(format_args!("no free dhcp window of size {limit}"))
            }
            SelectionError::InvalidDhcpLimit => f.write_str("dhcp limit must be positive"),
        }
    }
}

impl std::error::Error for SelectionError {}

/// Pick a free static IPv4 address given the set of reserved ones.
///
/// Gateway nodes allocate out of the `10.41.0.0/24` slice. Everyone else walks the full `/16`,
/// skipping that slice, the restricted `10.41.253.0/24` and `10.41.254.0/24` slices, and the
/// network and broadcast addresses of each `/24`.
pub fn select_static_ip(
    reserved: &HashSet<Ipv4Addr>,
    gateway_mode: bool,
) -> Result<Ipv4Addr, SelectionError> {
    if gateway_mode {
        for host in 1..=254u8 {
            let candidate = Ipv4Addr::new(10, 41, 0, host);
            if !reserved.contains(&candidate) {
                return Ok(candidate);
            }
        }
        return Err(SelectionError::NoFreeAddress { gateway_mode });
    }

    for slice in 1..=255u8 {
        if RESTRICTED_SLICES.contains(&slice) {
            continue;
        }
        for host in 1..=254u8 {
            let candidate = Ipv4Addr::new(10, 41, slice, host);
            if !reserved.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(SelectionError::NoFreeAddress { gateway_mode })
}

/// A closed range of DHCP offsets, `[start, end]` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpRange {
    pub start: u32,
    pub end: u32,
}

impl DhcpRange {
    /// Build a range from a start offset and pool size. Returns `None` for empty pools and for
    /// pools whose end would not even fit a `u32`; both show up in gossiped records from
    /// misbehaving peers and are simply ignored.
    pub fn new(start: u32, limit: u32) -> Option<Self> {
        if start == 0 || limit == 0 {
            return None;
        }
        let end = start.checked_add(limit - 1)?;
        Some(Self { start, end })
    }

    /// Two closed ranges overlap iff each starts no later than the other ends.
    pub fn overlaps(&self, other: &DhcpRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Find the lowest DHCP start offset so a pool of `limit` addresses fits in the subnet without
/// touching any occupied range.
///
/// The search runs twice: first from the conventional floor of 100, then, if nothing fits up
/// there, from offset 1.
pub fn select_dhcp_start(
    occupied: &[DhcpRange],
    netmask: Ipv4Addr,
    limit: u32,
) -> Result<u32, SelectionError> {
    if limit == 0 {
        return Err(SelectionError::InvalidDhcpLimit);
    }

    let prefix_len = u32::from(netmask).count_ones();
    // Usable host count, network and broadcast addresses excluded.
    let usable = (1u64 << (32 - prefix_len)).saturating_sub(2) as u32;
    if usable < limit {
        return Err(SelectionError::NoFreeDhcpWindow { limit });
    }

    let mut ranges = occupied.to_vec();
    ranges.sort_by_key(|r| r.start);

    for floor in [DHCP_SEARCH_FLOOR, 1] {
        if let Some(start) = scan_from(floor, &ranges, usable, limit) {
            return Ok(start);
        }
    }

    Err(SelectionError::NoFreeDhcpWindow { limit })
}

fn scan_from(floor: u32, sorted: &[DhcpRange], usable: u32, limit: u32) -> Option<u32> {
    let mut candidate = floor;
    loop {
        let end = candidate.checked_add(limit - 1)?;
        if end > usable {
            return None;
        }
        let proposed = DhcpRange {
            start: candidate,
            end,
        };
        match sorted.iter().find(|range| range.overlaps(&proposed)) {
            // Jump past the conflicting range and try again.
            Some(conflict) => candidate = conflict.end.checked_add(1)?,
            None => return Some(candidate),
        }
    }
}
