//! Interfaces owned by a sandbox namespace.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use netplane_common::MacAddress;

/// Settings applied to an interface when it enters a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceOptions {
    /// Hardware address.
    pub mac: Option<MacAddress>,
    /// IPv4 address.
    pub address: Option<IpNetwork>,
    /// IPv6 address.
    pub address_v6: Option<IpNetwork>,
    /// Extra link-local addresses.
    pub link_local: Vec<IpNetwork>,
    /// Routes reachable directly through this interface.
    pub routes: Vec<IpNetwork>,
    /// Interface MTU.
    pub mtu: Option<u32>,
}

impl InterfaceOptions {
    /// Set the MAC.
    #[must_use]
    pub const fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Set the IPv4 address.
    #[must_use]
    pub const fn with_address(mut self, addr: IpNetwork) -> Self {
        self.address = Some(addr);
        self
    }

    /// Set the IPv6 address.
    #[must_use]
    pub const fn with_address_v6(mut self, addr: IpNetwork) -> Self {
        self.address_v6 = Some(addr);
        self
    }

    /// Set the link-local list.
    #[must_use]
    pub fn with_link_local(mut self, addrs: Vec<IpNetwork>) -> Self {
        self.link_local = addrs;
        self
    }

    /// Set the connected routes.
    #[must_use]
    pub fn with_routes(mut self, routes: Vec<IpNetwork>) -> Self {
        self.routes = routes;
        self
    }
}

/// An interface that lives inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Name the link had in the host namespace.
    pub src_name: String,
    /// Name inside the sandbox, e.g. `eth0`.
    pub dst_name: String,
    /// Applied settings.
    pub options: InterfaceOptions,
}

impl Interface {
    /// Addresses assigned to this interface, primary ones first.
    pub fn addresses(&self) -> impl Iterator<Item = &IpNetwork> {
        self.options
            .address
            .iter()
            .chain(self.options.address_v6.iter())
            .chain(self.options.link_local.iter())
    }
}

/// The `ip` invocations that configure `dst_name` with `options`, in order.
#[must_use]
pub fn setup_commands(dst_name: &str, options: &InterfaceOptions) -> Vec<Vec<String>> {
    let mut cmds: Vec<Vec<String>> = Vec::new();
    let link = |args: &[&str]| -> Vec<String> {
        let mut v = vec!["link".to_string(), "set".to_string(), "dev".to_string(), dst_name.to_string()];
        v.extend(args.iter().map(|a| (*a).to_string()));
        v
    };

    if let Some(mac) = options.mac {
        cmds.push(link(&["address", &mac.to_string()]));
    }
    if let Some(mtu) = options.mtu {
        cmds.push(link(&["mtu", &mtu.to_string()]));
    }
    if let Some(addr) = options.address {
        cmds.push(addr_add(dst_name, &addr, false));
    }
    if let Some(addr) = options.address_v6 {
        cmds.push(addr_add(dst_name, &addr, true));
    }
    for addr in &options.link_local {
        cmds.push(addr_add(dst_name, addr, addr.is_ipv6()));
    }
    cmds.push(link(&["up"]));
    for route in &options.routes {
        let family = if route.is_ipv6() { "-6" } else { "-4" };
        let route = route.to_string();
        cmds.push(
            [family, "route", "add", route.as_str(), "dev", dst_name, "scope", "link"]
                .iter()
                .map(|a| (*a).to_string())
                .collect(),
        );
    }
    cmds
}

fn addr_add(dev: &str, addr: &IpNetwork, nodad: bool) -> Vec<String> {
    let family = if addr.is_ipv6() { "-6" } else { "-4" };
    let addr = addr.to_string();
    let mut v: Vec<String> = [family, "addr", "add", addr.as_str(), "dev", dev]
        .iter()
        .map(|a| (*a).to_string())
        .collect();
    if nodad {
        v.push("nodad".to_string());
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_order() {
        let opts = InterfaceOptions::default()
            .with_mac("02:42:ac:11:00:02".parse().unwrap())
            .with_address("172.17.0.2/16".parse().unwrap())
            .with_address_v6("fe90::2/64".parse().unwrap())
            .with_routes(vec!["10.10.0.0/16".parse().unwrap()]);
        let cmds: Vec<String> = setup_commands("eth0", &opts)
            .into_iter()
            .map(|c| c.join(" "))
            .collect();
        assert_eq!(
            cmds,
            [
                "link set dev eth0 address 02:42:ac:11:00:02",
                "-4 addr add 172.17.0.2/16 dev eth0",
                "-6 addr add fe90::2/64 dev eth0 nodad",
                "link set dev eth0 up",
                "-4 route add 10.10.0.0/16 dev eth0 scope link",
            ]
        );
    }

    #[test]
    fn addresses() {
        let iface = Interface {
            src_name: "veth1234567".to_string(),
            dst_name: "eth0".to_string(),
            options: InterfaceOptions::default()
                .with_address("10.0.0.2/24".parse().unwrap())
                .with_link_local(vec!["169.254.1.1/16".parse().unwrap()]),
        };
        assert_eq!(iface.addresses().count(), 2);
    }
}
