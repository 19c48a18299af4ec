//! Linux bridge management.

use ipnetwork::IpNetwork;
use netplane_common::{NetError, NetResult};

use crate::cmd;

/// A Linux bridge device in the host namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    name: String,
}

impl Bridge {
    /// Create the bridge if it does not exist yet and bring it up.
    pub fn ensure(name: &str, mtu: Option<u32>) -> NetResult<Self> {
        if !Self::exists(name) {
            tracing::debug!(name, "Creating bridge");
            let result = cmd::ip(&["link", "add", "name", name, "type", "bridge"]);
            // Lost a race with another creator.
            if result.is_err() && !Self::exists(name) {
                return Err(NetError::Internal {
                    message: format!("Failed to create bridge '{name}'"),
                });
            }
        }

        let bridge = Self {
            name: name.to_string(),
        };
        if let Some(mtu) = mtu {
            bridge.set_mtu(mtu)?;
        }
        bridge.up()?;

        tracing::info!(name, "Bridge ready");
        Ok(bridge)
    }

    /// Handle to an existing bridge.
    pub fn get(name: &str) -> NetResult<Self> {
        if !Self::exists(name) {
            return Err(NetError::not_found("bridge", name));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Whether a link named `name` exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        cmd::succeeds("ip", &["link", "show", name])
    }

    /// Bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the bridge up.
    pub fn up(&self) -> NetResult<()> {
        cmd::ip(&["link", "set", &self.name, "up"])
    }

    /// Set the bridge MTU.
    pub fn set_mtu(&self, mtu: u32) -> NetResult<()> {
        cmd::ip(&["link", "set", &self.name, "mtu", &mtu.to_string()])
    }

    /// Attach `interface` to the bridge.
    pub fn add_interface(&self, interface: &str) -> NetResult<()> {
        tracing::debug!(bridge = %self.name, interface, "Adding interface to bridge");
        cmd::ip(&["link", "set", interface, "master", &self.name])
    }

    /// Assign a gateway address. An address already present is not an
    /// error.
    pub fn add_address(&self, addr: &IpNetwork) -> NetResult<()> {
        let cidr = addr.to_string();
        let family = if addr.is_ipv6() { "-6" } else { "-4" };
        let current = cmd::output("ip", &[family, "addr", "show", "dev", &self.name])?;
        if current.contains(&format!(" {cidr} ")) {
            return Ok(());
        }
        tracing::debug!(bridge = %self.name, address = %cidr, "Setting bridge address");
        cmd::ip(&[family, "addr", "add", &cidr, "dev", &self.name])
    }

    /// Delete the bridge. A bridge that is already gone is not an error.
    pub fn delete(&self) -> NetResult<()> {
        tracing::debug!(name = %self.name, "Deleting bridge");
        if let Err(e) = cmd::ip(&["link", "delete", &self.name]) {
            if Self::exists(&self.name) {
                return Err(e);
            }
            tracing::warn!(name = %self.name, "Bridge already removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bridge() {
        assert!(!Bridge::exists("np_nonexistent0"));
        assert!(Bridge::get("np_nonexistent0").unwrap_err().is_not_found());
    }
}
