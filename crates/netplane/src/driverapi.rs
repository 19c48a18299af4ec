//! Contract between the controller and network drivers.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use netplane_common::{GenericOptions, MacAddress, NetError, NetResult, RouteType};

use crate::datastore::DataScope;

/// Address data of one pool, as handed to a driver on network creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamData {
    /// Address space the pool was allocated from.
    pub address_space: String,
    /// Master pool.
    pub pool: IpNetwork,
    /// Gateway, with the pool's prefix length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpNetwork>,
    /// Reserved auxiliary addresses by name.
    #[serde(default)]
    pub aux_addresses: BTreeMap<String, IpNetwork>,
}

/// Kind of node discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryType {
    /// A cluster node appeared or left.
    Node,
    /// The encryption keys changed.
    EncryptionKeys,
}

/// What a driver declares at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Scope of the driver's networks in the datastore.
    pub data_scope: DataScope,
    /// Reach of the connectivity the driver provides.
    pub connectivity_scope: DataScope,
}

impl Capability {
    /// Capability of a single-host driver.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            data_scope: DataScope::Local,
            connectivity_scope: DataScope::Local,
        }
    }

    /// Capability of a multi-host driver.
    #[must_use]
    pub const fn global() -> Self {
        Self {
            data_scope: DataScope::Global,
            connectivity_scope: DataScope::Global,
        }
    }

    /// Whether the driver spans several hosts.
    #[must_use]
    pub fn is_multihost(&self) -> bool {
        self.connectivity_scope == DataScope::Global
    }
}

/// Interface data a driver may fill in during endpoint creation.
///
/// Every value can be set once; a second write is refused.
pub trait InterfaceInfo {
    /// MAC address, if assigned.
    fn mac_address(&self) -> Option<MacAddress>;

    /// IPv4 address with prefix, if assigned.
    fn address(&self) -> Option<Ipv4Network>;

    /// IPv6 address with prefix, if assigned.
    fn address_ipv6(&self) -> Option<Ipv6Network>;

    /// Assign the MAC address.
    fn set_mac_address(&mut self, mac: MacAddress) -> NetResult<()>;

    /// Assign an IPv4 or IPv6 address.
    fn set_ip_address(&mut self, address: IpNetwork) -> NetResult<()>;
}

/// What a driver may publish while joining an endpoint to a sandbox.
pub trait JoinInfo {
    /// Interface data of the joining endpoint.
    fn interface(&self) -> &dyn InterfaceInfo;

    /// Name of the host-side link to move into the sandbox and the prefix
    /// of its name there.
    fn set_names(&mut self, src_name: &str, dst_prefix: &str) -> NetResult<()>;

    /// IPv4 default gateway.
    fn set_gateway(&mut self, gateway: Ipv4Addr) -> NetResult<()>;

    /// IPv6 default gateway.
    fn set_gateway_ipv6(&mut self, gateway: Ipv6Addr) -> NetResult<()>;

    /// Extra route. A [`RouteType::Connected`] route carries no next hop.
    fn add_static_route(
        &mut self,
        destination: IpNetwork,
        route_type: RouteType,
        next_hop: Option<IpAddr>,
    ) -> NetResult<()>;

    /// Keep the default gateway network away from this sandbox.
    fn disable_gateway_service(&mut self);

    /// Publish an opaque entry for cluster propagation.
    fn add_table_entry(&mut self, table: &str, key: &str, value: Vec<u8>) -> NetResult<()>;
}

/// A network driver.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Create the fabric of a network.
    fn create_network(
        &self,
        nid: &str,
        options: &GenericOptions,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> NetResult<()>;

    /// Tear the fabric of a network down.
    fn delete_network(&self, nid: &str) -> NetResult<()>;

    /// Create an endpoint, possibly filling in `iface`.
    fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        iface: &mut dyn InterfaceInfo,
        options: &GenericOptions,
    ) -> NetResult<()>;

    /// Remove an endpoint.
    fn delete_endpoint(&self, nid: &str, eid: &str) -> NetResult<()>;

    /// Operational data of an endpoint.
    fn endpoint_oper_info(&self, nid: &str, eid: &str) -> NetResult<GenericOptions>;

    /// Attach an endpoint to the sandbox at `sandbox_key`.
    fn join(
        &self,
        nid: &str,
        eid: &str,
        sandbox_key: &str,
        jinfo: &mut dyn JoinInfo,
        options: &GenericOptions,
    ) -> NetResult<()>;

    /// Detach an endpoint from its sandbox.
    fn leave(&self, nid: &str, eid: &str) -> NetResult<()>;

    /// A discovery event appeared.
    fn discover_new(&self, _kind: DiscoveryType, _data: &serde_json::Value) -> NetResult<()> {
        Ok(())
    }

    /// A discovery event went away.
    fn discover_delete(&self, _kind: DiscoveryType, _data: &serde_json::Value) -> NetResult<()> {
        Ok(())
    }

    /// Give the endpoint outside access, e.g. published ports.
    fn program_external_connectivity(
        &self,
        _nid: &str,
        _eid: &str,
        _options: &GenericOptions,
    ) -> NetResult<()> {
        Ok(())
    }

    /// Undo [`Driver::program_external_connectivity`].
    fn revoke_external_connectivity(&self, _nid: &str, _eid: &str) -> NetResult<()> {
        Ok(())
    }

    /// Driver name.
    fn network_type(&self) -> &str;

    /// Whether the driver ships with netplane.
    fn is_built_in(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct Registered {
    driver: Arc<dyn Driver>,
    capability: Capability,
}

/// Drivers by name.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: RwLock<BTreeMap<String, Registered>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Forbidden`] if the name is taken and
    /// [`NetError::InvalidParameter`] if it is empty.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>, capability: Capability) -> NetResult<()> {
        if name.is_empty() {
            return Err(NetError::invalid_parameter("driver name must not be empty"));
        }
        let mut drivers = self.drivers.write();
        if drivers.contains_key(name) {
            return Err(NetError::forbidden(format!("driver {name} already registered")));
        }
        tracing::debug!(driver = name, scope = %capability.data_scope, "Registered network driver");
        drivers.insert(name.to_string(), Registered { driver, capability });
        Ok(())
    }

    /// Driver and capability registered under `name`.
    pub fn get(&self, name: &str) -> NetResult<(Arc<dyn Driver>, Capability)> {
        self.drivers
            .read()
            .get(name)
            .map(|r| (Arc::clone(&r.driver), r.capability))
            .ok_or_else(|| NetError::not_found("driver", name))
    }

    /// Capability registered under `name`.
    pub fn capability(&self, name: &str) -> NetResult<Capability> {
        self.get(name).map(|(_, cap)| cap)
    }

    /// Names of all registered drivers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.drivers.read().keys().cloned().collect()
    }

    /// Call `f` on every driver until it returns `true`.
    pub fn walk(&self, mut f: impl FnMut(&str, &Arc<dyn Driver>, Capability) -> bool) {
        let snapshot: Vec<(String, Registered)> = self
            .drivers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, reg) in &snapshot {
            if f(name, &reg.driver, reg.capability) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy;

    impl Driver for Dummy {
        fn create_network(&self, _: &str, _: &GenericOptions, _: &[IpamData], _: &[IpamData]) -> NetResult<()> {
            Ok(())
        }
        fn delete_network(&self, _: &str) -> NetResult<()> {
            Ok(())
        }
        fn create_endpoint(
            &self,
            _: &str,
            _: &str,
            _: &mut dyn InterfaceInfo,
            _: &GenericOptions,
        ) -> NetResult<()> {
            Ok(())
        }
        fn delete_endpoint(&self, _: &str, _: &str) -> NetResult<()> {
            Ok(())
        }
        fn endpoint_oper_info(&self, _: &str, _: &str) -> NetResult<GenericOptions> {
            Ok(GenericOptions::new())
        }
        fn join(&self, _: &str, _: &str, _: &str, _: &mut dyn JoinInfo, _: &GenericOptions) -> NetResult<()> {
            Ok(())
        }
        fn leave(&self, _: &str, _: &str) -> NetResult<()> {
            Ok(())
        }
        fn network_type(&self) -> &str {
            "dummy"
        }
    }

    #[test]
    fn register_and_lookup() {
        let reg = DriverRegistry::new();
        reg.register("dummy", Arc::new(Dummy), Capability::local()).unwrap();
        let (driver, cap) = reg.get("dummy").unwrap();
        assert_eq!(driver.network_type(), "dummy");
        assert!(!cap.is_multihost());
        assert_eq!(reg.names(), vec!["dummy".to_string()]);
    }

    #[test]
    fn duplicate_is_forbidden() {
        let reg = DriverRegistry::new();
        reg.register("dummy", Arc::new(Dummy), Capability::local()).unwrap();
        let err = reg.register("dummy", Arc::new(Dummy), Capability::global()).unwrap_err();
        assert!(err.is_forbidden());
        assert!(!reg.capability("dummy").unwrap().is_multihost());
    }

    #[test]
    fn missing_is_not_found() {
        let reg = DriverRegistry::new();
        assert!(reg.get("overlay").unwrap_err().is_not_found());
        assert!(reg.register("", Arc::new(Dummy), Capability::local()).is_err());
    }

    #[test]
    fn ipam_data_json() {
        let data = IpamData {
            address_space: "LocalDefault".to_string(),
            pool: "172.18.0.0/16".parse().unwrap(),
            gateway: Some("172.18.0.1/16".parse().unwrap()),
            aux_addresses: BTreeMap::new(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains(r#""Pool":"172.18.0.0/16""#));
        let back: IpamData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }
}
