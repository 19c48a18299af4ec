//! Virtual ethernet pair management.

use std::path::Path;

use netplane_common::{MacAddress, NetResult};

use crate::cmd;

/// Prefix of generated interface names.
pub const VETH_PREFIX: &str = "veth";

/// Generate an unused-looking interface name: `prefix` plus 7 hex digits.
#[must_use]
pub fn generate_name(prefix: &str) -> String {
    let id = netplane_common::generate_id();
    format!("{prefix}{}", &id[..7])
}

/// A veth pair whose host side stays in the host namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name.
    pub host: String,
    /// Container-side interface name.
    pub container: String,
}

impl VethPair {
    /// Create a veth pair and bring the host side up.
    pub fn create(host_name: &str, container_name: &str, mtu: Option<u32>) -> NetResult<Self> {
        tracing::debug!(host_name, container_name, "Creating veth pair");

        let mtu = mtu.map(|m| m.to_string());
        let mut args = vec![
            "link",
            "add",
            host_name,
            "type",
            "veth",
            "peer",
            "name",
            container_name,
        ];
        if let Some(ref mtu) = mtu {
            args.extend(["mtu", mtu.as_str()]);
        }
        cmd::ip(&args)?;

        let pair = Self {
            host: host_name.to_string(),
            container: container_name.to_string(),
        };
        if let Err(e) = cmd::ip(&["link", "set", host_name, "up"]) {
            let _ = pair.delete();
            return Err(e);
        }
        Ok(pair)
    }

    /// Create a pair with generated names.
    pub fn create_random(mtu: Option<u32>) -> NetResult<Self> {
        Self::create(&generate_name(VETH_PREFIX), &generate_name(VETH_PREFIX), mtu)
    }

    /// Set the MAC of the container side.
    pub fn set_container_mac(&self, mac: MacAddress) -> NetResult<()> {
        cmd::ip(&["link", "set", &self.container, "address", &mac.to_string()])
    }

    /// Move the container side into the namespace bound at `netns`.
    pub fn move_to_netns(&self, netns: &Path) -> NetResult<()> {
        move_link_to_netns(&self.container, netns)
    }

    /// Delete the pair through its host side.
    pub fn delete(&self) -> NetResult<()> {
        delete_link(&self.host)
    }
}

/// Move `link` into the namespace bound at `netns`.
pub fn move_link_to_netns(link: &str, netns: &Path) -> NetResult<()> {
    tracing::debug!(interface = link, netns = %netns.display(), "Moving to netns");
    let path = netns.to_string_lossy();
    cmd::ip(&["link", "set", "dev", link, "netns", &path])
}

/// Delete a link, warning instead of failing when it is already gone.
pub fn delete_link(link: &str) -> NetResult<()> {
    tracing::debug!(link, "Deleting link");
    if let Err(e) = cmd::ip(&["link", "delete", link]) {
        tracing::warn!(link, error = %e, "ip link delete failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names() {
        let name = generate_name(VETH_PREFIX);
        assert_eq!(name.len(), 11);
        assert!(name.starts_with("veth"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, generate_name(VETH_PREFIX));
    }
}
