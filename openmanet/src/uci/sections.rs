//! Typed views on the UCI sections the daemon owns.

use super::{UciError, UciTree};

/// Namespace holding interface configuration.
pub const NS_NETWORK: &str = "network";
/// Namespace holding DHCP pool configuration.
pub const NS_DHCP: &str = "dhcp";
/// Namespace holding our own daemon state.
pub const NS_OPENMANET: &str = "openmanetd";

/// Name of the single section in the `openmanetd` namespace.
const OPENMANET_SECTION: &str = "config";
const OPENMANET_SECTION_TYPE: &str = "openmanet";

/// A network interface section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSection {
    pub proto: Option<String>,
    pub ipaddr: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
    pub device: Option<String>,
    pub ip6assign: Option<String>,
    pub ip6ifaceid: Option<String>,
    pub ip6class: Vec<String>,
}

/// A DHCP pool section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpSection {
    pub interface: Option<String>,
    pub start: Option<String>,
    pub limit: Option<String>,
    pub leasetime: Option<String>,
    pub ignore: Option<String>,
    pub force: Option<String>,
}

fn single<T: UciTree + ?Sized>(tree: &T, ns: &str, section: &str, option: &str) -> Option<String> {
    tree.get(ns, section, option)
        .and_then(|mut values| (!values.is_empty()).then(|| values.swap_remove(0)))
}

/// Read the network section with the given name. Absent options are `None`.
pub fn read_network_section<T: UciTree + ?Sized>(tree: &T, name: &str) -> NetworkSection {
    NetworkSection {
        proto: single(tree, NS_NETWORK, name, "proto"),
        ipaddr: single(tree, NS_NETWORK, name, "ipaddr"),
        netmask: single(tree, NS_NETWORK, name, "netmask"),
        gateway: single(tree, NS_NETWORK, name, "gateway"),
        dns: single(tree, NS_NETWORK, name, "dns"),
        device: single(tree, NS_NETWORK, name, "device"),
        ip6assign: single(tree, NS_NETWORK, name, "ip6assign"),
        ip6ifaceid: single(tree, NS_NETWORK, name, "ip6ifaceid"),
        ip6class: tree.get(NS_NETWORK, name, "ip6class").unwrap_or_default(),
    }
}

/// Create or update a network section and commit the change. Only the populated fields are
/// written, already present options keep their value.
pub fn write_network_section<T: UciTree + ?Sized>(
    tree: &T,
    name: &str,
    section: &NetworkSection,
) -> Result<(), UciError> {
    tree.add_section(NS_NETWORK, name, "interface")?;

    let plain_options = [
        ("proto", &section.proto),
        ("ipaddr", &section.ipaddr),
        ("netmask", &section.netmask),
        ("gateway", &section.gateway),
        ("dns", &section.dns),
        ("device", &section.device),
        ("ip6assign", &section.ip6assign),
        ("ip6ifaceid", &section.ip6ifaceid),
    ];
    for (option, value) in plain_options {
        if let Some(value) = value {
            tree.set_option(NS_NETWORK, name, option, value)?;
        }
    }
    if !section.ip6class.is_empty() {
        tree.set_list(NS_NETWORK, name, "ip6class", &section.ip6class)?;
    }

    tree.commit()
}

/// Read the DHCP pool section with the given name. Absent options are `None`.
pub fn read_dhcp_section<T: UciTree + ?Sized>(tree: &T, name: &str) -> DhcpSection {
    DhcpSection {
        interface: single(tree, NS_DHCP, name, "interface"),
        start: single(tree, NS_DHCP, name, "start"),
        limit: single(tree, NS_DHCP, name, "limit"),
        leasetime: single(tree, NS_DHCP, name, "leasetime"),
        ignore: single(tree, NS_DHCP, name, "ignore"),
        force: single(tree, NS_DHCP, name, "force"),
    }
}

/// Create or update a DHCP pool section and commit the change.
pub fn write_dhcp_section<T: UciTree + ?Sized>(
    tree: &T,
    name: &str,
    section: &DhcpSection,
) -> Result<(), UciError> {
    tree.add_section(NS_DHCP, name, "dhcp")?;

    let options = [
        ("interface", &section.interface),
        ("start", &section.start),
        ("limit", &section.limit),
        ("leasetime", &section.leasetime),
        ("ignore", &section.ignore),
        ("force", &section.force),
    ];
    for (option, value) in options {
        if let Some(value) = value {
            tree.set_option(NS_DHCP, name, option, value)?;
        }
    }

    tree.commit()
}

/// Whether this node already completed its addressing transition.
///
/// The flag is a stringly bool: unset and `"0"` mean unconfigured, any other value must parse as
/// an integer and means configured iff it is `1`.
pub fn dhcp_configured<T: UciTree + ?Sized>(tree: &T) -> Result<bool, UciError> {
    let Some(value) = single(tree, NS_OPENMANET, OPENMANET_SECTION, "dhcpconfigured") else {
        return Ok(false);
    };
    if value.is_empty() || value == "0" {
        return Ok(false);
    }
    let parsed: i64 = value.parse().map_err(|_| UciError::InvalidValue {
        option: "dhcpconfigured",
        value: value.clone(),
    })?;
    Ok(parsed == 1)
}

/// Persist the configured flag. This is the last step of the addressing transition, the node
/// only counts as configured once this returns.
pub fn set_dhcp_configured<T: UciTree + ?Sized>(tree: &T) -> Result<(), UciError> {
    tree.add_section(NS_OPENMANET, OPENMANET_SECTION, OPENMANET_SECTION_TYPE)?;
    tree.set_option(NS_OPENMANET, OPENMANET_SECTION, "dhcpconfigured", "1")?;
    tree.commit()
}

/// Reset the configured flag, forcing the node back through address selection.
pub fn clear_dhcp_configured<T: UciTree + ?Sized>(tree: &T) -> Result<(), UciError> {
    tree.add_section(NS_OPENMANET, OPENMANET_SECTION, OPENMANET_SECTION_TYPE)?;
    tree.set_option(NS_OPENMANET, OPENMANET_SECTION, "dhcpconfigured", "0")?;
    tree.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uci::FsTree;

    fn scratch_tree(dir: &tempfile::TempDir) -> FsTree {
        FsTree::new(dir.path().to_path_buf())
    }

    #[test]
    fn network_section_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = scratch_tree(&dir);

        let section = NetworkSection {
            proto: Some("static".to_string()),
            ipaddr: Some("10.41.2.1".to_string()),
            netmask: Some("255.255.0.0".to_string()),
            device: Some("br-ahwlan".to_string()),
            ip6assign: Some("64".to_string()),
            ip6ifaceid: Some("eui64".to_string()),
            ip6class: vec!["local".to_string()],
            ..Default::default()
        };
        write_network_section(&tree, "ahwlan", &section).expect("write succeeds");

        let reread = scratch_tree(&dir);
        assert_eq!(read_network_section(&reread, "ahwlan"), section);
    }

    #[test]
    fn dhcp_section_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = scratch_tree(&dir);

        let section = DhcpSection {
            interface: Some("ahwlan".to_string()),
            start: Some("100".to_string()),
            limit: Some("16".to_string()),
            leasetime: Some("12h".to_string()),
            force: Some("1".to_string()),
            ..Default::default()
        };
        write_dhcp_section(&tree, "ahwlan", &section).expect("write succeeds");

        let reread = scratch_tree(&dir);
        assert_eq!(read_dhcp_section(&reread, "ahwlan"), section);
    }

    #[test]
    fn configured_flag_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = scratch_tree(&dir);

        assert!(!dhcp_configured(&tree).expect("absent flag reads false"));

        set_dhcp_configured(&tree).expect("set succeeds");
        assert!(dhcp_configured(&tree).expect("flag reads true"));

        // Survives a fresh tree.
        let reread = scratch_tree(&dir);
        assert!(dhcp_configured(&reread).expect("persisted flag reads true"));

        clear_dhcp_configured(&tree).expect("clear succeeds");
        assert!(!dhcp_configured(&tree).expect("cleared flag reads false"));
    }

    #[test]
    fn mangled_configured_flag_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = scratch_tree(&dir);

        tree.add_section(NS_OPENMANET, OPENMANET_SECTION, OPENMANET_SECTION_TYPE)
            .expect("add section");
        tree.set_option(NS_OPENMANET, OPENMANET_SECTION, "dhcpconfigured", "yes")
            .expect("set option");

        assert!(matches!(
            dhcp_configured(&tree),
            Err(UciError::InvalidValue { .. })
        ));
    }
}
