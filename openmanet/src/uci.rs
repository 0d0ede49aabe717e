//! Access to the router's UCI configuration tree.
//!
//! UCI is a hierarchy of namespaces (one text file each), sections and options. The daemon only
//! touches the `network`, `dhcp` and `openmanetd` namespaces. All access goes through the
//! [`UciTree`] trait so engines can run against a scratch tree in tests; the production
//! implementation is [`FsTree`], which buffers edits in memory and persists them atomically on
//! [`commit`](UciTree::commit).

use core::fmt;
use std::io;

mod sections;
mod tree;

pub use sections::{
    clear_dhcp_configured, dhcp_configured, read_dhcp_section, read_network_section,
    set_dhcp_configured, write_dhcp_section, write_network_section, DhcpSection, NetworkSection,
    NS_DHCP, NS_NETWORK, NS_OPENMANET,
};
pub use tree::FsTree;

/// Default location of the UCI tree on OpenWrt systems.
pub const DEFAULT_TREE_PATH: &str = "/etc/config";

/// An error while reading or writing the configuration tree.
#[derive(Debug)]
pub enum UciError {
    Io(io::Error),
    /// An option was set on a section which does not exist.
    SectionNotFound { ns: String, section: String },
    /// A namespace file could not be parsed.
    Parse { ns: String, line: usize },
    /// An option held a value outside its expected domain.
    InvalidValue { option: &'static str, value: String },
}

impl fmt::Display for UciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UciError::Io(e) => f.write_fmt(format_args!("config tree io error: {e}")),
            UciError::SectionNotFound { ns, section } => {
                f.write_fmt(format_args!("section {ns}.{section} does not exist"))
            }
            UciError::Parse { ns, line } => {
                f.write_fmt(format_args!("malformed uci config {ns} at line {line}"))
            }
            UciError::InvalidValue { option, value } => {
                f.write_fmt(format_args!("invalid value {value:?} for option {option}"))
            }
        }
    }
}

impl std::error::Error for UciError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UciError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for UciError {
    fn from(e: io::Error) -> Self {
        UciError::Io(e)
    }
}

/// Read and write access to a UCI tree.
///
/// Edits are buffered until [`commit`](UciTree::commit), which persists every touched namespace
/// atomically. Implementations serialize their own critical sections, the trait can be shared
/// between concurrently running engines.
pub trait UciTree: Send + Sync {
    /// The values of an option, or `None` if the namespace, section or option is absent.
    /// Plain options yield a single element.
    fn get(&self, ns: &str, section: &str, option: &str) -> Option<Vec<String>>;

    /// Set a plain option on an existing section.
    fn set_option(&self, ns: &str, section: &str, option: &str, value: &str)
        -> Result<(), UciError>;

    /// Set a list option on an existing section, replacing any previous values.
    fn set_list(
        &self,
        ns: &str,
        section: &str,
        option: &str,
        values: &[String],
    ) -> Result<(), UciError>;

    /// Remove an option. Removing an absent option is not an error.
    fn del(&self, ns: &str, section: &str, option: &str) -> Result<(), UciError>;

    /// Create a named section of the given type. Creating a section which already exists is not
    /// an error.
    fn add_section(&self, ns: &str, section: &str, section_type: &str) -> Result<(), UciError>;

    /// Remove a section and everything in it. Removing an absent section is not an error.
    fn del_section(&self, ns: &str, section: &str) -> Result<(), UciError>;

    /// Persist all buffered edits.
    fn commit(&self) -> Result<(), UciError>;

    /// Drop buffered edits and re-read the on-disk state.
    fn reload(&self) -> Result<(), UciError>;
}
