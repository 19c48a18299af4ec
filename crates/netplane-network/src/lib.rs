//! # netplane-network
//!
//! Kernel networking primitives for netplane sandboxes.
//!
//! This crate wraps the host tools and syscalls the control plane drives:
//! network namespaces, Linux bridges, veth pairs, iptables chains and port
//! publishing, plus the per-sandbox `/etc/hosts` and `resolv.conf` files.

#![warn(missing_docs)]

pub mod bridge;
pub mod cmd;
pub mod etchosts;
pub mod iptables;
pub mod osl;
pub mod portmap;
pub mod resolvconf;
pub mod veth;

pub use bridge::Bridge;
pub use iptables::IpTables;
pub use osl::{Interface, InterfaceOptions, InterfaceStatistics, Namespace};
pub use portmap::{PortAllocator, PortMapper, PortMapping};
pub use resolvconf::ResolvConf;
pub use veth::VethPair;
