//! IPv4 default route inspection and replacement through rtnetlink.
//!
//! The gateway engine owns the main table default route while the node runs in gateway client
//! mode. Replacement is atomic (`NLM_F_REPLACE`, never delete-then-add) and preserves the metric
//! of the route it supersedes.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteScope};
use rtnetlink::{Handle, IpVersion};
use tracing::debug;

/// Id of the main kernel routing table.
const RT_TABLE_MAIN: u32 = 254;

/// A kernel routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network, `None` for the default route.
    pub destination: Option<(IpAddr, u8)>,
    pub gateway: Option<IpAddr>,
    /// Output interface index.
    pub oif: Option<u32>,
    pub metric: u32,
    pub table: u32,
    pub scope: u8,
    pub protocol: u8,
}

/// The current IPv4 default route in the main table, if one exists.
pub async fn default_route_v4(handle: &Handle) -> io::Result<Option<Route>> {
    let mut routes = handle.route().get(IpVersion::V4).execute();

    while let Some(msg) = routes.try_next().await.map_err(io::Error::other)? {
        if msg.header.destination_prefix_length != 0 {
            continue;
        }

        let mut route = Route {
            destination: None,
            gateway: None,
            oif: None,
            metric: 0,
            table: msg.header.table as u32,
            scope: msg.header.scope.into(),
            protocol: msg.header.protocol.into(),
        };
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Gateway(RouteAddress::Inet(ip)) => {
                    route.gateway = Some(IpAddr::V4(*ip))
                }
                RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => {
                    route.gateway = Some(IpAddr::V6(*ip))
                }
                RouteAttribute::Oif(index) => route.oif = Some(*index),
                RouteAttribute::Priority(metric) => route.metric = *metric,
                RouteAttribute::Table(table) => route.table = *table,
                _ => {}
            }
        }

        if route.table == RT_TABLE_MAIN && route.gateway.is_some() {
            return Ok(Some(route));
        }
    }

    Ok(None)
}

/// Atomically install or replace the IPv4 main table default route.
///
/// The metric of an existing default route is carried over; without one the kernel default
/// applies.
pub async fn replace_default_route_v4(
    handle: &Handle,
    gateway: Ipv4Addr,
    device: &str,
) -> io::Result<()> {
    let link = handle
        .link()
        .get()
        .match_name(device.to_string())
        .execute()
        .try_next()
        .await
        .map_err(io::Error::other)?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {device} not found"),
            )
        })?;

    let existing_metric = default_route_v4(handle).await?.map(|route| route.metric);

    let mut request = handle
        .route()
        .add()
        .v4()
        .gateway(gateway)
        .output_interface(link.header.index)
        .scope(RouteScope::Universe);
    if let Some(metric) = existing_metric {
        request = request.priority(metric);
    }

    request
        .replace()
        .execute()
        .await
        .map_err(io::Error::other)?;
    debug!(gateway = %gateway, device, "default route replaced");

    Ok(())
}
