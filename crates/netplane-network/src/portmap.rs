//! Host port publishing through iptables NAT rules.
//!
//! Host ports are reserved in a process-wide allocator, then a DNAT rule in
//! the [`CHAIN`] nat chain forwards traffic for the host port to the
//! container, and a MASQUERADE rule in `POSTROUTING` handles hairpin
//! traffic from the container to its own published port.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use netplane_common::{IpFamily, NetError, NetResult, PortBinding, Protocol};

use crate::iptables::{IpTables, NAT};

/// nat chain holding the DNAT rules for published ports.
pub const CHAIN: &str = "NETPLANE";

/// First port of the ephemeral range used when no host port is requested.
pub const EPHEMERAL_BEGIN: u16 = 49153;

/// Last port of the ephemeral range.
pub const EPHEMERAL_END: u16 = 60999;

static ALLOCATOR: Lazy<PortAllocator> = Lazy::new(PortAllocator::default);

/// Tracks host ports handed out per (host address, protocol).
#[derive(Debug, Default)]
pub struct PortAllocator {
    used: Mutex<HashMap<(IpAddr, Protocol), BTreeSet<u16>>>,
}

impl PortAllocator {
    /// The process-wide allocator.
    #[must_use]
    pub fn global() -> &'static Self {
        &ALLOCATOR
    }

    /// Reserve a port in `start..=end`. A zero range picks from the
    /// ephemeral range; `start == end` asks for exactly that port.
    pub fn request(&self, ip: IpAddr, proto: Protocol, start: u16, end: u16) -> NetResult<u16> {
        let (start, end) = match (start, end) {
            (0, _) => (EPHEMERAL_BEGIN, EPHEMERAL_END),
            (s, 0) => (s, s),
            (s, e) if e < s => {
                return Err(NetError::invalid_parameter(format!(
                    "invalid port range {s}-{e}"
                )));
            }
            range => range,
        };

        let mut used = self.used.lock();
        let ports = used.entry((ip, proto)).or_default();
        let port = (start..=end).find(|p| !ports.contains(p)).ok_or_else(|| {
            if start == end {
                NetError::forbidden(format!(
                    "Bind for {ip}:{start}/{proto} failed: port is already allocated"
                ))
            } else {
                NetError::NoAvailableIps {
                    pool: format!("{ip}:{start}-{end}/{proto}"),
                }
            }
        })?;
        ports.insert(port);
        Ok(port)
    }

    /// Return a port to the allocator.
    pub fn release(&self, ip: IpAddr, proto: Protocol, port: u16) {
        let mut used = self.used.lock();
        if let Some(ports) = used.get_mut(&(ip, proto)) {
            ports.remove(&port);
            if ports.is_empty() {
                used.remove(&(ip, proto));
            }
        }
    }
}

/// A programmed mapping between a host port and a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Host address the port is published on.
    pub host_ip: IpAddr,
    /// Host port.
    pub host_port: u16,
    /// Container address traffic is forwarded to.
    pub container_ip: IpAddr,
    /// Container port.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// Whether NAT rules were installed for this mapping.
    natted: bool,
}

impl PortMapping {
    /// The mapping as a concrete [`PortBinding`].
    #[must_use]
    pub fn to_binding(&self) -> PortBinding {
        PortBinding {
            proto: self.protocol,
            ip: Some(self.container_ip),
            port: self.container_port,
            host_ip: Some(self.host_ip),
            host_port: self.host_port,
            host_port_end: self.host_port,
        }
    }
}

/// Publishes the ports of one endpoint and removes them on drop.
#[derive(Debug)]
pub struct PortMapper {
    owner: String,
    bridge: String,
    mappings: Vec<PortMapping>,
}

impl PortMapper {
    /// A mapper for endpoint `owner` attached to `bridge`.
    #[must_use]
    pub fn new(owner: &str, bridge: &str) -> Self {
        Self {
            owner: owner.to_string(),
            bridge: bridge.to_string(),
            mappings: Vec::new(),
        }
    }

    /// Create the [`CHAIN`] nat chain and the jumps into it for `family`.
    pub fn setup_chain(family: IpFamily) -> NetResult<()> {
        let ipt = IpTables::new(family);
        ipt.ensure_chain(NAT, CHAIN)?;
        ipt.append_unique(
            NAT,
            "PREROUTING",
            &["-m", "addrtype", "--dst-type", "LOCAL", "-j", CHAIN],
        )?;
        let loopback = match family {
            IpFamily::V4 => "127.0.0.0/8",
            IpFamily::V6 => "::1/128",
        };
        ipt.append_unique(
            NAT,
            "OUTPUT",
            &[
                "!", "-d", loopback, "-m", "addrtype", "--dst-type", "LOCAL", "-j", CHAIN,
            ],
        )
    }

    /// Publish `bindings` for a container reachable at `container_v4` and
    /// optionally `container_v6`.
    ///
    /// A binding without a host address is published on `0.0.0.0` and, when
    /// `ip6tables` is usable, on `::` with the same host port. Returns the
    /// concrete bindings in publication order. On error every binding made
    /// so far is removed.
    pub fn map(
        &mut self,
        bindings: &[PortBinding],
        container_v4: Ipv4Addr,
        container_v6: Option<Ipv6Addr>,
        default_host_ip: Option<IpAddr>,
        ipv6_usable: bool,
    ) -> NetResult<Vec<PortBinding>> {
        let start = self.mappings.len();
        let result = self.map_all(bindings, container_v4, container_v6, default_host_ip, ipv6_usable);
        if let Err(e) = result {
            for mapping in self.mappings.split_off(start) {
                self.unmap(&mapping);
            }
            return Err(e);
        }
        Ok(self.mappings[start..]
            .iter()
            .map(PortMapping::to_binding)
            .collect())
    }

    fn map_all(
        &mut self,
        bindings: &[PortBinding],
        container_v4: Ipv4Addr,
        container_v6: Option<Ipv6Addr>,
        default_host_ip: Option<IpAddr>,
        ipv6_usable: bool,
    ) -> NetResult<()> {
        let allocator = PortAllocator::global();
        for binding in bindings {
            let host_ip = binding
                .host_ip
                .or(default_host_ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

            let mut targets: Vec<(IpAddr, IpAddr)> = Vec::with_capacity(2);
            match host_ip {
                IpAddr::V4(_) => {
                    targets.push((host_ip, IpAddr::V4(container_v4)));
                    if host_ip.is_unspecified() && ipv6_usable {
                        targets.push((
                            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                            container_v6.map_or(IpAddr::V4(container_v4), IpAddr::V6),
                        ));
                    }
                }
                IpAddr::V6(_) => {
                    if !ipv6_usable {
                        continue;
                    }
                    targets.push((host_ip, container_v6.map_or(IpAddr::V4(container_v4), IpAddr::V6)));
                }
            }

            // Every address of one binding shares the host port picked for
            // the first.
            let mut port = 0;
            for (host_ip, container_ip) in targets {
                port = if port == 0 {
                    allocator.request(host_ip, binding.proto, binding.host_port, binding.host_port_end)?
                } else {
                    allocator.request(host_ip, binding.proto, port, port)?
                };
                let mut mapping = PortMapping {
                    host_ip,
                    host_port: port,
                    container_ip,
                    container_port: binding.port,
                    protocol: binding.proto,
                    natted: false,
                };
                if let Err(e) = self.program(&mut mapping) {
                    allocator.release(host_ip, binding.proto, port);
                    return Err(e);
                }
                self.mappings.push(mapping);
            }
        }
        Ok(())
    }

    fn program(&self, mapping: &mut PortMapping) -> NetResult<()> {
        // A v6 listener forwarding to a v4-only container has no NAT path.
        if mapping.host_ip.is_ipv6() != mapping.container_ip.is_ipv6() {
            tracing::debug!(
                host_port = mapping.host_port,
                "No IPv6 address on container, port recorded without NAT rule"
            );
            return Ok(());
        }

        tracing::debug!(
            host_port = mapping.host_port,
            container_port = mapping.container_port,
            container_ip = %mapping.container_ip,
            protocol = %mapping.protocol,
            "Adding port mapping"
        );

        let ipt = IpTables::new(IpFamily::of(&mapping.host_ip));
        let rules = self.rules(mapping);
        ipt.append_unique(NAT, CHAIN, &as_refs(&rules.dnat))?;
        if let Err(e) = ipt.append_unique(NAT, "POSTROUTING", &as_refs(&rules.masquerade)) {
            let _ = ipt.delete(NAT, CHAIN, &as_refs(&rules.dnat));
            return Err(e);
        }
        mapping.natted = true;
        Ok(())
    }

    fn unmap(&self, mapping: &PortMapping) {
        tracing::debug!(
            host_port = mapping.host_port,
            container_port = mapping.container_port,
            "Removing port mapping"
        );
        if mapping.natted {
            let ipt = IpTables::new(IpFamily::of(&mapping.host_ip));
            let rules = self.rules(mapping);
            if let Err(e) = ipt.delete(NAT, CHAIN, &as_refs(&rules.dnat)) {
                tracing::warn!(error = %e, "Failed to remove DNAT rule");
            }
            if let Err(e) = ipt.delete(NAT, "POSTROUTING", &as_refs(&rules.masquerade)) {
                tracing::warn!(error = %e, "Failed to remove MASQUERADE rule");
            }
        }
        PortAllocator::global().release(mapping.host_ip, mapping.protocol, mapping.host_port);
    }

    fn rules(&self, mapping: &PortMapping) -> NatRules {
        let proto = mapping.protocol.as_str();
        let comment = format!("netplane-{}", self.owner);
        let host_port = mapping.host_port.to_string();
        let container_port = mapping.container_port.to_string();
        let container_ip = mapping.container_ip.to_string();
        let destination = match mapping.container_ip {
            IpAddr::V4(ip) => format!("{ip}:{container_port}"),
            IpAddr::V6(ip) => format!("[{ip}]:{container_port}"),
        };
        let host_ip = (!mapping.host_ip.is_unspecified()).then(|| mapping.host_ip.to_string());

        let mut dnat: Vec<&str> = vec!["-p", proto];
        if let Some(ref host_ip) = host_ip {
            dnat.extend(["-d", host_ip.as_str()]);
        }
        dnat.extend([
            "--dport",
            &host_port,
            "!",
            "-i",
            &self.bridge,
            "-m",
            "comment",
            "--comment",
            &comment,
            "-j",
            "DNAT",
            "--to-destination",
            &destination,
        ]);

        let masquerade: Vec<&str> = vec![
            "-p",
            proto,
            "-s",
            &container_ip,
            "-d",
            &container_ip,
            "--dport",
            &container_port,
            "-m",
            "comment",
            "--comment",
            &comment,
            "-j",
            "MASQUERADE",
        ];

        NatRules {
            dnat: dnat.into_iter().map(str::to_string).collect(),
            masquerade: masquerade.into_iter().map(str::to_string).collect(),
        }
    }

    /// Remove all mappings of this endpoint.
    pub fn unmap_all(&mut self) {
        let mappings: Vec<_> = self.mappings.drain(..).collect();
        for mapping in &mappings {
            self.unmap(mapping);
        }
    }

    /// Active mappings.
    #[must_use]
    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }
}

impl Drop for PortMapper {
    fn drop(&mut self) {
        self.unmap_all();
    }
}

struct NatRules {
    dnat: Vec<String>,
    masquerade: Vec<String>,
}

fn as_refs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn specific_port() {
        let alloc = PortAllocator::default();
        let ip = addr("10.1.1.1");
        assert_eq!(alloc.request(ip, Protocol::Tcp, 8080, 8080).unwrap(), 8080);
        assert!(alloc.request(ip, Protocol::Tcp, 8080, 8080).unwrap_err().is_forbidden());
        // Different protocol or address is a different port space.
        assert_eq!(alloc.request(ip, Protocol::Udp, 8080, 0).unwrap(), 8080);
        assert_eq!(alloc.request(addr("10.1.1.2"), Protocol::Tcp, 8080, 0).unwrap(), 8080);

        alloc.release(ip, Protocol::Tcp, 8080);
        assert_eq!(alloc.request(ip, Protocol::Tcp, 8080, 8080).unwrap(), 8080);
    }

    #[test]
    fn port_range() {
        let alloc = PortAllocator::default();
        let ip = addr("0.0.0.0");
        assert_eq!(alloc.request(ip, Protocol::Udp, 42000, 42001).unwrap(), 42000);
        assert_eq!(alloc.request(ip, Protocol::Udp, 42000, 42001).unwrap(), 42001);
        assert!(alloc.request(ip, Protocol::Udp, 42000, 42001).is_err());
        assert!(alloc.request(ip, Protocol::Udp, 10, 5).is_err());
    }

    #[test]
    fn ephemeral() {
        let alloc = PortAllocator::default();
        let port = alloc.request(addr("0.0.0.0"), Protocol::Tcp, 0, 0).unwrap();
        assert!((EPHEMERAL_BEGIN..=EPHEMERAL_END).contains(&port));
    }

    #[test]
    fn dnat_rule_text() {
        let mapper = PortMapper::new("ep1", "br0");
        let mapping = PortMapping {
            host_ip: addr("0.0.0.0"),
            host_port: 23000,
            container_ip: addr("172.17.0.2"),
            container_port: 230,
            protocol: Protocol::Tcp,
            natted: false,
        };
        let rules = mapper.rules(&mapping);
        assert_eq!(
            rules.dnat.join(" "),
            "-p tcp --dport 23000 ! -i br0 -m comment --comment netplane-ep1 -j DNAT --to-destination 172.17.0.2:230"
        );
        assert!(rules.masquerade.join(" ").starts_with("-p tcp -s 172.17.0.2 -d 172.17.0.2"));

        let v6 = PortMapping {
            host_ip: addr("::"),
            container_ip: addr("fe90::2"),
            ..mapping
        };
        assert!(mapper.rules(&v6).dnat.join(" ").ends_with("[fe90::2]:230"));
    }

    #[test]
    fn binding_from_mapping() {
        let mapping = PortMapping {
            host_ip: addr("0.0.0.0"),
            host_port: 32000,
            container_ip: addr("172.17.0.2"),
            container_port: 320,
            protocol: Protocol::Tcp,
            natted: false,
        };
        let binding = mapping.to_binding();
        assert_eq!(binding.host_port, 32000);
        assert_eq!(binding.host_port_end, 32000);
        assert_eq!(binding.ip, Some(addr("172.17.0.2")));
    }
}
