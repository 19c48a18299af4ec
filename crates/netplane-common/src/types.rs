//! IP, MAC and CIDR helpers plus the port and route records shared by
//! drivers, IPAM back-ends and the controller.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{NetError, NetResult};

/// Opaque driver and sandbox options, keyed by label.
pub type GenericOptions = BTreeMap<String, serde_json::Value>;

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl IpFamily {
    /// Family of an address.
    #[must_use]
    pub const fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Generate a MAC from an IPv4 address: `02:42:` followed by the four
    /// address bytes.
    #[must_use]
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        Self([0x02, 0x42, o[0], o[1], o[2], o[3]])
    }

    /// Generate a random locally administered unicast MAC.
    #[must_use]
    pub fn random() -> Self {
        let bytes = uuid::Uuid::new_v4();
        let b = bytes.as_bytes();
        let mut mac = [b[0], b[1], b[2], b[3], b[4], b[5]];
        mac[0] = (mac[0] & 0xfe) | 0x02;
        Self(mac)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::invalid_parameter(format!("invalid MAC address: {s}"));
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in &mut out {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(out))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl Protocol {
    /// Name used by iptables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "sctp" => Ok(Self::Sctp),
            other => Err(NetError::invalid_parameter(format!(
                "unknown protocol {other}"
            ))),
        }
    }
}

/// A port exposed by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportPort {
    /// Protocol.
    #[serde(rename = "Proto")]
    pub proto: Protocol,
    /// Port number.
    #[serde(rename = "Port")]
    pub port: u16,
}

impl fmt::Display for TransportPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    /// Protocol.
    #[serde(rename = "Proto")]
    pub proto: Protocol,
    /// Container address, filled in when the binding is programmed.
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Container port.
    #[serde(rename = "Port")]
    pub port: u16,
    /// Host address to bind; unspecified means all addresses.
    #[serde(rename = "HostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// Host port, or the start of a host port range. Zero picks any port.
    #[serde(rename = "HostPort")]
    pub host_port: u16,
    /// End of the host port range (inclusive), zero when not a range.
    #[serde(rename = "HostPortEnd", default)]
    pub host_port_end: u16,
}

impl PortBinding {
    /// A binding of `port` to `host_port`.
    #[must_use]
    pub const fn new(proto: Protocol, port: u16, host_port: u16) -> Self {
        Self {
            proto,
            ip: None,
            port,
            host_ip: None,
            host_port,
            host_port_end: 0,
        }
    }

    /// Set a host port range.
    #[must_use]
    pub const fn with_host_range(mut self, start: u16, end: u16) -> Self {
        self.host_port = start;
        self.host_port_end = end;
        self
    }

    /// Set the host address.
    #[must_use]
    pub const fn with_host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }
}

/// How a static route reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteType {
    /// Routed through a next-hop address.
    #[serde(rename = "NEXTHOP")]
    NextHop,
    /// Directly connected to the endpoint's interface.
    #[serde(rename = "CONNECTED")]
    Connected,
}

/// A route a driver asks the sandbox to install.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StaticRoute {
    /// Destination prefix.
    pub destination: IpNetwork,
    /// Route classification.
    pub route_type: RouteType,
    /// Next-hop address, absent for connected routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<IpAddr>,
}

/// Canonical form of a prefix: host bits cleared.
#[must_use]
pub fn canonical(net: IpNetwork) -> IpNetwork {
    match net {
        IpNetwork::V4(n) => IpNetwork::V4(
            Ipv4Network::new(n.network(), n.prefix()).unwrap_or(n),
        ),
        IpNetwork::V6(n) => IpNetwork::V6(
            Ipv6Network::new(n.network(), n.prefix()).unwrap_or(n),
        ),
    }
}

/// Parse a CIDR string, requiring an explicit prefix length.
///
/// # Errors
///
/// Returns [`NetError::InvalidParameter`] if the string is not a CIDR.
pub fn parse_cidr(s: &str) -> NetResult<IpNetwork> {
    if !s.contains('/') {
        return Err(NetError::invalid_parameter(format!(
            "invalid CIDR address: {s}"
        )));
    }
    Ok(s.parse::<IpNetwork>()?)
}

/// Whether two prefixes share any address.
#[must_use]
pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    match (a, b) {
        (IpNetwork::V4(_), IpNetwork::V4(_)) | (IpNetwork::V6(_), IpNetwork::V6(_)) => {
            a.contains(b.network()) || b.contains(a.network())
        }
        _ => false,
    }
}

/// Whether `ip` is a link-local unicast address (169.254/16 or fe80::/10).
#[must_use]
pub const fn is_link_local_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Build an IPv6 address from `prefix` with the MAC in the low 48 bits.
///
/// # Errors
///
/// Returns [`NetError::Forbidden`] if the prefix leaves fewer than 48 host
/// bits.
pub fn mac_derived_ipv6(prefix: Ipv6Network, mac: MacAddress) -> NetResult<Ipv6Network> {
    if prefix.prefix() > 80 {
        return Err(NetError::forbidden(format!(
            "cannot self generate an IPv6 address on network {prefix}: at least 48 host bits are needed"
        )));
    }
    let mut octets = prefix.network().octets();
    octets[10..16].copy_from_slice(&mac.octets());
    Ok(Ipv6Network::new(Ipv6Addr::from(octets), prefix.prefix())?)
}

/// The `in-addr.arpa` / `ip6.arpa` name for an address, with trailing dot.
#[must_use]
pub fn reverse_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}

/// Parse an `in-addr.arpa` / `ip6.arpa` name back into an address.
#[must_use]
pub fn parse_reverse_name(name: &str) -> Option<IpAddr> {
    let name = name.trim_end_matches('.');
    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let mut octets: Vec<u8> = rest
            .split('.')
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if octets.len() != 4 {
            return None;
        }
        octets.reverse();
        return Some(IpAddr::V4(Ipv4Addr::new(
            octets[0], octets[1], octets[2], octets[3],
        )));
    }
    let rest = name.strip_suffix(".ip6.arpa")?;
    let nibbles: Vec<u8> = rest
        .split('.')
        .map(|n| u8::from_str_radix(n, 16))
        .collect::<Result<_, _>>()
        .ok()?;
    if nibbles.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, pair) in nibbles.rchunks(2).enumerate() {
        octets[i] = (pair[1] << 4) | pair[0];
    }
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}
