//! Bridge driver and bridge network configuration.

use std::net::IpAddr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

use netplane_common::types::overlaps;
use netplane_common::{GenericOptions, NetError, NetResult, netlabel};

use crate::driverapi::IpamData;

/// Driver option: turn on IPv4 forwarding when a network is created.
pub const ENABLE_IP_FORWARDING: &str = "io.netplane.bridge.enable_ip_forwarding";

/// Driver option: manage iptables rules for networks and published ports.
pub const ENABLE_IPTABLES: &str = "io.netplane.bridge.enable_iptables";

/// Prefix of the interface name inside the sandbox.
pub const CONTAINER_IFACE_PREFIX: &str = "eth";

/// Options the driver was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Enable IPv4 forwarding on network creation.
    pub enable_ip_forwarding: bool,
    /// Program iptables.
    pub enable_iptables: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enable_ip_forwarding: true,
            enable_iptables: true,
        }
    }
}

impl DriverConfig {
    /// Read the driver options. Unknown keys are ignored.
    pub fn from_options(options: &GenericOptions) -> NetResult<Self> {
        let mut config = Self::default();
        if let Some(value) = options.get(ENABLE_IP_FORWARDING) {
            config.enable_ip_forwarding = parse_bool(ENABLE_IP_FORWARDING, value)?;
        }
        if let Some(value) = options.get(ENABLE_IPTABLES) {
            config.enable_iptables = parse_bool(ENABLE_IPTABLES, value)?;
        }
        Ok(config)
    }
}

/// Configuration of one bridge network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Network ID.
    pub id: String,
    /// Name of the Linux bridge.
    pub bridge_name: String,
    /// Whether the network carries IPv6.
    pub enable_ipv6: bool,
    /// Masquerade traffic leaving the host.
    pub enable_ip_masquerade: bool,
    /// Allow traffic between containers on the bridge.
    pub enable_icc: bool,
    /// Cut the network off from the outside.
    pub internal: bool,
    /// MTU of the bridge and its veth pairs.
    pub mtu: Option<u32>,
    /// Host address published ports bind to by default.
    pub default_binding_ip: Option<IpAddr>,
    /// Bridge IPv4 address: the gateway with the pool prefix.
    pub address_v4: Option<Ipv4Network>,
    /// Bridge IPv6 address: the gateway with the pool prefix.
    pub address_v6: Option<Ipv6Network>,
    /// IPv6 pool, used to derive addresses from MACs.
    pub pool_v6: Option<Ipv6Network>,
}

impl NetworkConfig {
    /// Parse the options handed to `create_network`.
    ///
    /// Driver options come as string labels under
    /// [`netlabel::GENERIC_DATA`]; [`netlabel::ENABLE_IPV6`] and
    /// [`netlabel::INTERNAL`] are read last and win.
    pub fn from_options(nid: &str, options: &GenericOptions) -> NetResult<Self> {
        let mut config = Self {
            id: nid.to_string(),
            bridge_name: String::new(),
            enable_ipv6: false,
            enable_ip_masquerade: true,
            enable_icc: true,
            internal: false,
            mtu: None,
            default_binding_ip: None,
            address_v4: None,
            address_v6: None,
            pool_v6: None,
        };

        match options.get(netlabel::GENERIC_DATA) {
            Some(serde_json::Value::Object(labels)) => {
                for (label, value) in labels {
                    config.apply_label(label, value)?;
                }
            }
            Some(serde_json::Value::Null) | None => {}
            Some(other) => {
                return Err(NetError::bad_request(format!(
                    "do not recognize network configuration format: {other}"
                )));
            }
        }
        if let Some(v) = options.get(netlabel::ENABLE_IPV6).and_then(serde_json::Value::as_bool) {
            config.enable_ipv6 = v;
        }
        if options
            .get(netlabel::INTERNAL)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            config.internal = true;
        }

        if config.bridge_name.is_empty() {
            let short: String = nid.chars().take(12).collect();
            config.bridge_name = format!("br-{short}");
        }
        Ok(config)
    }

    fn apply_label(&mut self, label: &str, value: &serde_json::Value) -> NetResult<()> {
        match label {
            netlabel::BRIDGE_NAME => self.bridge_name = label_string(value),
            netlabel::DRIVER_MTU => {
                let raw = label_string(value);
                let mtu: u32 = raw
                    .parse()
                    .map_err(|e| parse_error(label, &raw, &format!("{e}")))?;
                self.mtu = (mtu > 0).then_some(mtu);
            }
            netlabel::ENABLE_IPV6 => self.enable_ipv6 = parse_bool(label, value)?,
            netlabel::BRIDGE_ENABLE_IP_MASQUERADE => self.enable_ip_masquerade = parse_bool(label, value)?,
            netlabel::BRIDGE_ENABLE_ICC => self.enable_icc = parse_bool(label, value)?,
            netlabel::BRIDGE_DEFAULT_BIND_IP => {
                let raw = label_string(value);
                let ip = raw.parse().map_err(|_| parse_error(label, &raw, "nil ip"))?;
                self.default_binding_ip = Some(ip);
            }
            _ => {}
        }
        Ok(())
    }

    /// Take the bridge addresses from the first pool of each family.
    pub fn process_ipam(&mut self, ipv4: &[IpamData], ipv6: &[IpamData]) -> NetResult<()> {
        if ipv4.len() > 1 {
            return Err(NetError::forbidden("bridge driver doesn't support multiple subnets"));
        }
        let Some(v4) = ipv4.first() else {
            return Err(NetError::bad_request(format!(
                "bridge network {} requires ipv4 configuration",
                self.id
            )));
        };
        if let Some(IpNetwork::V4(gw)) = v4.gateway {
            self.address_v4 = Some(gw);
        }

        if let Some(v6) = ipv6.first() {
            if let IpNetwork::V6(pool) = v6.pool {
                self.pool_v6 = Some(pool);
            }
            if let Some(IpNetwork::V6(gw)) = v6.gateway {
                self.address_v6 = Some(gw);
            }
        }
        Ok(())
    }

    /// Why `self` and `other` cannot coexist, if they cannot.
    #[must_use]
    pub fn conflicts(&self, other: &Self) -> Option<&'static str> {
        if self.bridge_name == other.bridge_name {
            return Some("networks have same bridge name");
        }
        let v4 = |c: &Self| c.address_v4.map(IpNetwork::V4);
        if let (Some(a), Some(b)) = (v4(self), v4(other)) {
            if overlaps(&a, &b) {
                return Some("networks have overlapping IPv4");
            }
        }
        let v6 = |c: &Self| c.address_v6.map(IpNetwork::V6);
        if let (Some(a), Some(b)) = (v6(self), v6(other)) {
            if overlaps(&a, &b) {
                return Some("networks have overlapping IPv6");
            }
        }
        None
    }
}

fn label_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_bool(label: &str, value: &serde_json::Value) -> NetResult<bool> {
    if let Some(b) = value.as_bool() {
        return Ok(b);
    }
    let raw = label_string(value);
    match raw.as_str() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(parse_error(label, &raw, "invalid syntax")),
    }
}

fn parse_error(label: &str, value: &str, reason: &str) -> NetError {
    NetError::bad_request(format!("failed to parse {label} value: {value} ({reason})"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn options(labels: &[(&str, &str)]) -> GenericOptions {
        let labels: serde_json::Map<String, serde_json::Value> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::String((*v).to_string())))
            .collect();
        GenericOptions::from([(netlabel::GENERIC_DATA.to_string(), serde_json::Value::Object(labels))])
    }

    fn ipam(pool: &str, gateway: &str) -> IpamData {
        IpamData {
            address_space: "LocalDefault".to_string(),
            pool: pool.parse().unwrap(),
            gateway: Some(gateway.parse().unwrap()),
            aux_addresses: BTreeMap::new(),
        }
    }

    #[test]
    fn defaults() {
        let config = NetworkConfig::from_options("0123456789abcdef", &GenericOptions::new()).unwrap();
        assert_eq!(config.bridge_name, "br-0123456789ab");
        assert!(config.enable_icc);
        assert!(config.enable_ip_masquerade);
        assert!(!config.internal);
        assert_eq!(config.mtu, None);
    }

    #[test]
    fn labels_are_parsed() {
        let mut opts = options(&[
            (netlabel::BRIDGE_NAME, "testnetwork"),
            (netlabel::BRIDGE_ENABLE_ICC, "false"),
            (netlabel::DRIVER_MTU, "1400"),
            (netlabel::BRIDGE_DEFAULT_BIND_IP, "127.0.0.1"),
        ]);
        opts.insert(netlabel::INTERNAL.to_string(), serde_json::Value::Bool(true));
        let config = NetworkConfig::from_options("n1", &opts).unwrap();
        assert_eq!(config.bridge_name, "testnetwork");
        assert!(!config.enable_icc);
        assert_eq!(config.mtu, Some(1400));
        assert_eq!(config.default_binding_ip, Some("127.0.0.1".parse().unwrap()));
        assert!(config.internal);
    }

    #[test]
    fn bad_values_are_bad_requests() {
        let err = NetworkConfig::from_options("n1", &options(&[(netlabel::BRIDGE_ENABLE_ICC, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, NetError::BadRequest { .. }));
        let err = NetworkConfig::from_options("n1", &options(&[(netlabel::DRIVER_MTU, "big")])).unwrap_err();
        assert!(matches!(err, NetError::BadRequest { .. }));
    }

    #[test]
    fn ipam_sets_bridge_addresses() {
        let mut config = NetworkConfig::from_options("n1", &GenericOptions::new()).unwrap();
        config
            .process_ipam(
                &[ipam("172.18.0.0/16", "172.18.0.1/16")],
                &[ipam("fe90::/64", "fe90::22/64")],
            )
            .unwrap();
        assert_eq!(config.address_v4, Some("172.18.0.1/16".parse().unwrap()));
        assert_eq!(config.address_v6, Some("fe90::22/64".parse().unwrap()));
        assert_eq!(config.pool_v6, Some("fe90::/64".parse().unwrap()));

        let err = config
            .process_ipam(
                &[ipam("10.0.0.0/24", "10.0.0.1/24"), ipam("10.0.1.0/24", "10.0.1.1/24")],
                &[],
            )
            .unwrap_err();
        assert!(err.is_forbidden());
    }

    #[test]
    fn overlapping_networks_conflict() {
        let mut a = NetworkConfig::from_options("aaaaaaaaaaaaaaaa", &GenericOptions::new()).unwrap();
        a.process_ipam(&[ipam("172.18.0.0/16", "172.18.0.1/16")], &[]).unwrap();
        let mut b = NetworkConfig::from_options("bbbbbbbbbbbbbbbb", &GenericOptions::new()).unwrap();
        b.process_ipam(&[ipam("172.18.5.0/24", "172.18.5.1/24")], &[]).unwrap();
        assert_eq!(a.conflicts(&b), Some("networks have overlapping IPv4"));

        let mut c = NetworkConfig::from_options("cccccccccccccccc", &GenericOptions::new()).unwrap();
        c.process_ipam(&[ipam("172.19.0.0/16", "172.19.0.1/16")], &[]).unwrap();
        assert_eq!(a.conflicts(&c), None);
        c.bridge_name.clone_from(&a.bridge_name);
        assert_eq!(a.conflicts(&c), Some("networks have same bridge name"));
    }

    #[test]
    fn driver_options() {
        let opts = GenericOptions::from([(ENABLE_IPTABLES.to_string(), serde_json::Value::Bool(false))]);
        let config = DriverConfig::from_options(&opts).unwrap();
        assert!(!config.enable_iptables);
        assert!(config.enable_ip_forwarding);
    }
}
