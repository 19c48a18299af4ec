//! Single-host networks on a Linux bridge.
//!
//! Each network owns a bridge carrying the gateway addresses. Each endpoint
//! is a veth pair whose host side is enslaved to the bridge; the other side
//! is moved into the sandbox on join. Published ports are DNATed through
//! the `NETPLANE` nat chain while the endpoint provides the sandbox's
//! gateway.

mod config;

use std::collections::HashMap;
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use parking_lot::{Mutex, RwLock};

use netplane_common::types::mac_derived_ipv6;
use netplane_common::{
    GenericOptions, IpFamily, MacAddress, NetError, NetResult, PortBinding, TransportPort, netlabel,
};
use netplane_network::iptables::{self, FILTER, NAT};
use netplane_network::{Bridge, IpTables, PortMapper, VethPair};

use crate::driverapi::{Capability, Driver, DriverRegistry, InterfaceInfo, IpamData, JoinInfo};

pub use config::{CONTAINER_IFACE_PREFIX, DriverConfig, ENABLE_IP_FORWARDING, ENABLE_IPTABLES, NetworkConfig};

/// Driver name.
pub const NETWORK_TYPE: &str = "bridge";

/// An iptables rule installed for a network, removed with it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    family: IpFamily,
    table: &'static str,
    chain: &'static str,
    args: Vec<String>,
}

impl Rule {
    fn new(family: IpFamily, table: &'static str, chain: &'static str, args: &[&str]) -> Self {
        Self {
            family,
            table,
            chain,
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    fn args(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }

    fn install(&self) -> NetResult<()> {
        IpTables::new(self.family).append_unique(self.table, self.chain, &self.args())
    }

    fn remove(&self) {
        if let Err(e) = IpTables::new(self.family).delete(self.table, self.chain, &self.args()) {
            tracing::warn!(table = self.table, chain = self.chain, error = %e, "Failed to remove iptables rule");
        }
    }
}

/// Rules a network needs, in installation order.
fn network_rules(config: &NetworkConfig) -> Vec<Rule> {
    let br = config.bridge_name.as_str();
    let mut rules = Vec::new();
    let mut families = vec![IpFamily::V4];
    if config.enable_ipv6 && IpTables::ipv6_usable() {
        families.push(IpFamily::V6);
    }

    for family in families {
        let subnet = match family {
            IpFamily::V4 => config.address_v4.map(|a| format!("{}/{}", a.network(), a.prefix())),
            IpFamily::V6 => config.address_v6.map(|a| format!("{}/{}", a.network(), a.prefix())),
        };

        if config.internal {
            rules.push(Rule::new(family, FILTER, "FORWARD", &["-i", br, "!", "-o", br, "-j", "DROP"]));
            rules.push(Rule::new(family, FILTER, "FORWARD", &["!", "-i", br, "-o", br, "-j", "DROP"]));
        } else {
            if config.enable_ip_masquerade {
                if let Some(subnet) = &subnet {
                    rules.push(Rule::new(
                        family,
                        NAT,
                        "POSTROUTING",
                        &["-s", subnet, "!", "-o", br, "-j", "MASQUERADE"],
                    ));
                }
            }
            rules.push(Rule::new(family, FILTER, "FORWARD", &["-i", br, "!", "-o", br, "-j", "ACCEPT"]));
            rules.push(Rule::new(
                family,
                FILTER,
                "FORWARD",
                &["-o", br, "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
            ));
        }
        let icc = if config.enable_icc { "ACCEPT" } else { "DROP" };
        rules.push(Rule::new(family, FILTER, "FORWARD", &["-i", br, "-o", br, "-j", icc]));
    }
    rules
}

#[derive(Debug)]
struct BridgeEndpoint {
    veth: VethPair,
    mac: MacAddress,
    addr: Option<Ipv4Network>,
    addrv6: Option<Ipv6Network>,
    exposed_ports: Vec<TransportPort>,
    port_mapping: Vec<PortBinding>,
    mapper: Option<PortMapper>,
}

impl BridgeEndpoint {
    fn release_ports(&mut self) {
        if let Some(mut mapper) = self.mapper.take() {
            mapper.unmap_all();
        }
        self.port_mapping.clear();
    }
}

#[derive(Debug)]
struct BridgeNetwork {
    config: NetworkConfig,
    bridge: Bridge,
    /// Whether the bridge existed before the network was created.
    user_bridge: bool,
    rules: Vec<Rule>,
    endpoints: Mutex<HashMap<String, BridgeEndpoint>>,
}

/// The `bridge` driver.
#[derive(Debug, Default)]
pub struct BridgeDriver {
    config: DriverConfig,
    networks: RwLock<HashMap<String, Arc<BridgeNetwork>>>,
    /// Serialises network creation so conflict checks see every network.
    create_lock: Mutex<()>,
}

impl BridgeDriver {
    /// A driver with `config`.
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Register the driver under [`NETWORK_TYPE`], configured from
    /// `options`.
    pub fn register(registry: &DriverRegistry, options: &GenericOptions) -> NetResult<()> {
        let config = DriverConfig::from_options(options)?;
        registry.register(NETWORK_TYPE, Arc::new(Self::new(config)), Capability::local())
    }

    fn network(&self, nid: &str) -> NetResult<Arc<BridgeNetwork>> {
        self.networks
            .read()
            .get(nid)
            .cloned()
            .ok_or_else(|| NetError::not_found("network", nid))
    }

    fn setup_fabric(&self, config: &NetworkConfig) -> NetResult<(Bridge, bool, Vec<Rule>)> {
        let user_bridge = Bridge::exists(&config.bridge_name);
        let bridge = Bridge::ensure(&config.bridge_name, config.mtu)?;

        let mut installed = Vec::new();
        let result = (|| -> NetResult<_> {
            if let Some(addr) = config.address_v4 {
                bridge.add_address(&IpNetwork::V4(addr))?;
            }
            if config.enable_ipv6 {
                if let Some(addr) = config.address_v6 {
                    bridge.add_address(&IpNetwork::V6(addr))?;
                }
            }
            if self.config.enable_ip_forwarding {
                iptables::enable_ip_forwarding()?;
            }
            if self.config.enable_iptables {
                PortMapper::setup_chain(IpFamily::V4)?;
                if config.enable_ipv6 && IpTables::ipv6_usable() {
                    PortMapper::setup_chain(IpFamily::V6)?;
                }
                for rule in network_rules(config) {
                    rule.install()?;
                    installed.push(rule);
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            for rule in installed.iter().rev() {
                rule.remove();
            }
            if !user_bridge {
                if let Err(de) = bridge.delete() {
                    tracing::warn!(bridge = %config.bridge_name, error = %de, "Failed to remove bridge after setup error");
                }
            }
            return Err(e);
        }
        Ok((bridge, user_bridge, installed))
    }
}

fn connectivity_options(options: &GenericOptions) -> NetResult<(Vec<PortBinding>, Vec<TransportPort>)> {
    let bindings = match options.get(netlabel::PORT_MAP) {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| NetError::bad_request(format!("invalid port mapping data: {e}")))?,
        None => Vec::new(),
    };
    let exposed = match options.get(netlabel::EXPOSED_PORTS) {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| NetError::bad_request(format!("invalid exposed ports data: {e}")))?,
        None => Vec::new(),
    };
    Ok((bindings, exposed))
}

impl Driver for BridgeDriver {
    fn create_network(
        &self,
        nid: &str,
        options: &GenericOptions,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> NetResult<()> {
        let mut config = NetworkConfig::from_options(nid, options)?;
        config.process_ipam(ipv4, ipv6)?;

        let _create = self.create_lock.lock();
        {
            let networks = self.networks.read();
            if networks.contains_key(nid) {
                return Err(NetError::forbidden(format!("network {nid} exists")));
            }
            for other in networks.values() {
                if let Some(reason) = config.conflicts(&other.config) {
                    return Err(NetError::forbidden(format!(
                        "cannot create network {nid} ({}): conflicts with network {} ({}): {reason}",
                        config.bridge_name, other.config.id, other.config.bridge_name
                    )));
                }
            }
        }

        let (bridge, user_bridge, rules) = self.setup_fabric(&config)?;
        tracing::info!(network = nid, bridge = %config.bridge_name, "Bridge network created");
        self.networks.write().insert(
            nid.to_string(),
            Arc::new(BridgeNetwork {
                config,
                bridge,
                user_bridge,
                rules,
                endpoints: Mutex::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    fn delete_network(&self, nid: &str) -> NetResult<()> {
        let Some(network) = self.networks.write().remove(nid) else {
            return Err(NetError::InternalMaskable {
                message: format!("network {nid} does not exist"),
            });
        };

        let mut endpoints = network.endpoints.lock();
        for (eid, mut ep) in endpoints.drain() {
            ep.release_ports();
            tracing::debug!(network = nid, endpoint = %eid, "Removing leftover bridge endpoint");
            if let Err(e) = ep.veth.delete() {
                tracing::warn!(endpoint = %eid, error = %e, "Failed to remove veth pair");
            }
        }
        drop(endpoints);

        for rule in network.rules.iter().rev() {
            rule.remove();
        }
        if !network.user_bridge {
            network.bridge.delete()?;
        }
        tracing::info!(network = nid, bridge = %network.config.bridge_name, "Bridge network deleted");
        Ok(())
    }

    fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        iface: &mut dyn InterfaceInfo,
        _options: &GenericOptions,
    ) -> NetResult<()> {
        let network = self.network(nid)?;
        if network.endpoints.lock().contains_key(eid) {
            return Err(NetError::forbidden(format!("endpoint with name {eid} already exists")));
        }

        let veth = VethPair::create_random(network.config.mtu).map_err(|e| {
            NetError::internal(format!("failed to add the host <=> sandbox pair interfaces: {e}"))
        })?;

        let result = (|| -> NetResult<_> {
            network.bridge.add_interface(&veth.host).map_err(|e| {
                NetError::internal(format!(
                    "adding interface {} to bridge {} failed: {e}",
                    veth.host, network.config.bridge_name
                ))
            })?;

            let addr = iface.address();
            let mac = match iface.mac_address() {
                Some(mac) => mac,
                None => {
                    let mac = addr.map_or_else(MacAddress::random, |a| MacAddress::from_ipv4(a.ip()));
                    iface.set_mac_address(mac)?;
                    mac
                }
            };

            let mut addrv6 = iface.address_ipv6();
            if addrv6.is_none() && network.config.enable_ipv6 {
                let prefix = network.config.pool_v6.or_else(|| {
                    network
                        .config
                        .address_v6
                        .and_then(|a| Ipv6Network::new(a.network(), a.prefix()).ok())
                });
                if let Some(prefix) = prefix {
                    let derived = mac_derived_ipv6(prefix, mac)?;
                    iface.set_ip_address(IpNetwork::V6(derived))?;
                    addrv6 = Some(derived);
                }
            }

            Ok(BridgeEndpoint {
                veth: veth.clone(),
                mac,
                addr,
                addrv6,
                exposed_ports: Vec::new(),
                port_mapping: Vec::new(),
                mapper: None,
            })
        })();

        match result {
            Ok(ep) => {
                tracing::debug!(network = nid, endpoint = eid, host_if = %ep.veth.host, "Bridge endpoint created");
                network.endpoints.lock().insert(eid.to_string(), ep);
                Ok(())
            }
            Err(e) => {
                if let Err(de) = veth.delete() {
                    tracing::warn!(host_if = %veth.host, error = %de, "Failed to remove veth pair after error");
                }
                Err(e)
            }
        }
    }

    fn delete_endpoint(&self, nid: &str, eid: &str) -> NetResult<()> {
        let network = self.network(nid).map_err(|e| NetError::InternalMaskable {
            message: e.to_string(),
        })?;
        let Some(mut ep) = network.endpoints.lock().remove(eid) else {
            // Not known after a restart; nothing left to tear down.
            return Ok(());
        };
        ep.release_ports();
        ep.veth.delete()?;
        tracing::debug!(network = nid, endpoint = eid, "Bridge endpoint deleted");
        Ok(())
    }

    fn endpoint_oper_info(&self, nid: &str, eid: &str) -> NetResult<GenericOptions> {
        let network = self.network(nid)?;
        let endpoints = network.endpoints.lock();
        let ep = endpoints
            .get(eid)
            .ok_or_else(|| NetError::not_found("endpoint", eid))?;

        let mut info = GenericOptions::new();
        if !ep.exposed_ports.is_empty() {
            info.insert(netlabel::EXPOSED_PORTS.to_string(), serde_json::to_value(&ep.exposed_ports)?);
        }
        if !ep.port_mapping.is_empty() {
            info.insert(netlabel::PORT_MAP.to_string(), serde_json::to_value(&ep.port_mapping)?);
        }
        info.insert(netlabel::MAC_ADDRESS.to_string(), serde_json::to_value(ep.mac)?);
        Ok(info)
    }

    fn join(
        &self,
        nid: &str,
        eid: &str,
        _sandbox_key: &str,
        jinfo: &mut dyn JoinInfo,
        _options: &GenericOptions,
    ) -> NetResult<()> {
        let network = self.network(nid)?;
        let src_name = network
            .endpoints
            .lock()
            .get(eid)
            .map(|ep| ep.veth.container.clone())
            .ok_or_else(|| NetError::not_found("endpoint", eid))?;

        jinfo.set_names(&src_name, CONTAINER_IFACE_PREFIX)?;
        if let Some(gw) = network.config.address_v4 {
            jinfo.set_gateway(gw.ip())?;
        }
        if network.config.enable_ipv6 {
            if let Some(gw) = network.config.address_v6 {
                jinfo.set_gateway_ipv6(gw.ip())?;
            }
        }
        Ok(())
    }

    fn leave(&self, nid: &str, eid: &str) -> NetResult<()> {
        let network = self.network(nid).map_err(|e| NetError::InternalMaskable {
            message: e.to_string(),
        })?;
        if !network.endpoints.lock().contains_key(eid) {
            return Err(NetError::not_found("endpoint", eid));
        }
        Ok(())
    }

    fn program_external_connectivity(&self, nid: &str, eid: &str, options: &GenericOptions) -> NetResult<()> {
        let network = self.network(nid)?;
        let (bindings, exposed) = connectivity_options(options)?;

        let mut endpoints = network.endpoints.lock();
        let ep = endpoints
            .get_mut(eid)
            .ok_or_else(|| NetError::not_found("endpoint", eid))?;
        ep.release_ports();
        ep.exposed_ports = exposed;

        if bindings.is_empty() || !self.config.enable_iptables {
            return Ok(());
        }
        let Some(addr) = ep.addr else {
            tracing::debug!(endpoint = eid, "No IPv4 address, ports not published");
            return Ok(());
        };

        let mut mapper = PortMapper::new(eid, &network.config.bridge_name);
        let v6 = ep.addrv6.map(|a| a.ip());
        ep.port_mapping = mapper.map(
            &bindings,
            addr.ip(),
            v6,
            network.config.default_binding_ip,
            IpTables::ipv6_usable(),
        )?;
        ep.mapper = Some(mapper);
        tracing::debug!(endpoint = eid, ports = ep.port_mapping.len(), "Ports published");
        Ok(())
    }

    fn revoke_external_connectivity(&self, nid: &str, eid: &str) -> NetResult<()> {
        let network = self.network(nid)?;
        let mut endpoints = network.endpoints.lock();
        let ep = endpoints
            .get_mut(eid)
            .ok_or_else(|| NetError::not_found("endpoint", eid))?;
        ep.release_ports();
        ep.exposed_ports.clear();
        Ok(())
    }

    fn network_type(&self) -> &str {
        NETWORK_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(internal: bool, icc: bool) -> NetworkConfig {
        let mut config = NetworkConfig::from_options("0123456789abcdef", &GenericOptions::new()).unwrap();
        config.address_v4 = Some("172.18.0.1/16".parse().unwrap());
        config.internal = internal;
        config.enable_icc = icc;
        config
    }

    #[test]
    fn external_network_masquerades() {
        let rules = network_rules(&config(false, true));
        let masq = rules.iter().find(|r| r.table == NAT).unwrap();
        assert_eq!(masq.chain, "POSTROUTING");
        assert_eq!(masq.args(), ["-s", "172.18.0.0/16", "!", "-o", "br-0123456789ab", "-j", "MASQUERADE"]);
        assert!(rules.iter().all(|r| !r.args.contains(&"DROP".to_string())));
    }

    #[test]
    fn internal_network_is_isolated() {
        let rules = network_rules(&config(true, false));
        assert!(rules.iter().all(|r| r.table == FILTER));
        let drops = rules.iter().filter(|r| r.args.last().is_some_and(|a| a == "DROP")).count();
        // Two isolation rules plus the inter-container drop.
        assert_eq!(drops, 3);
    }

    #[test]
    fn connectivity_options_parse() {
        let bindings = vec![PortBinding::new(netplane_common::Protocol::Tcp, 230, 23000)];
        let opts = GenericOptions::from([(
            netlabel::PORT_MAP.to_string(),
            serde_json::to_value(&bindings).unwrap(),
        )]);
        let (parsed, exposed) = connectivity_options(&opts).unwrap();
        assert_eq!(parsed, bindings);
        assert!(exposed.is_empty());

        let bad = GenericOptions::from([(netlabel::PORT_MAP.to_string(), serde_json::json!("80:80"))]);
        assert!(connectivity_options(&bad).is_err());
    }

    #[test]
    fn unknown_network_errors() {
        let driver = BridgeDriver::default();
        assert!(driver.delete_network("nope").unwrap_err().is_maskable());
        assert!(driver.delete_endpoint("nope", "e1").unwrap_err().is_maskable());
        assert!(driver.endpoint_oper_info("nope", "e1").unwrap_err().is_not_found());
        assert_eq!(driver.network_type(), "bridge");
    }
}
