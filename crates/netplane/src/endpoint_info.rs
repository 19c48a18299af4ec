//! Interface and join data of an endpoint.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use netplane_common::{MacAddress, NetError, NetResult, RouteType, StaticRoute};

use crate::driverapi::{InterfaceInfo, JoinInfo};

/// The container-facing interface of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInterface {
    /// MAC address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
    /// IPv4 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<Ipv4Network>,
    /// IPv6 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addrv6: Option<Ipv6Network>,
    /// Extra link-local addresses.
    #[serde(default, rename = "llAddrs")]
    pub ll_addrs: Vec<IpNetwork>,
    /// Name of the host-side link the driver prepared.
    #[serde(default, rename = "srcName")]
    pub src_name: String,
    /// Name prefix inside the sandbox.
    #[serde(default, rename = "dstPrefix")]
    pub dst_prefix: String,
    /// Directly connected routes through this interface.
    #[serde(default)]
    pub routes: Vec<IpNetwork>,
    /// Pool the IPv4 address came from.
    #[serde(default, rename = "v4PoolID")]
    pub v4_pool_id: String,
    /// Pool the IPv6 address came from.
    #[serde(default, rename = "v6PoolID")]
    pub v6_pool_id: String,
}

impl InterfaceInfo for EndpointInterface {
    fn mac_address(&self) -> Option<MacAddress> {
        self.mac
    }

    fn address(&self) -> Option<Ipv4Network> {
        self.addr
    }

    fn address_ipv6(&self) -> Option<Ipv6Network> {
        self.addrv6
    }

    fn set_mac_address(&mut self, mac: MacAddress) -> NetResult<()> {
        if self.mac.is_some() {
            return Err(NetError::forbidden("endpoint interface MAC address present"));
        }
        self.mac = Some(mac);
        Ok(())
    }

    fn set_ip_address(&mut self, address: IpNetwork) -> NetResult<()> {
        match address {
            IpNetwork::V4(v4) => {
                if self.addr.is_some() {
                    return Err(NetError::forbidden("endpoint interface IPv4 present"));
                }
                self.addr = Some(v4);
            }
            IpNetwork::V6(v6) => {
                if self.addrv6.is_some() {
                    return Err(NetError::forbidden("endpoint interface IPv6 present"));
                }
                self.addrv6 = Some(v6);
            }
        }
        Ok(())
    }
}

/// An opaque entry a driver publishes for cluster propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableEntry {
    /// Table name.
    pub table_name: String,
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: Vec<u8>,
}

/// What a driver published while joining the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointJoinInfo {
    /// IPv4 gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
    /// IPv6 gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw6: Option<Ipv6Addr>,
    /// Routes with a next hop.
    #[serde(default, rename = "StaticRoutes")]
    pub static_routes: Vec<StaticRoute>,
    /// Entries for cluster propagation.
    #[serde(default, rename = "driverTableEntries")]
    pub driver_table_entries: Vec<TableEntry>,
    /// Whether the default gateway network must stay away.
    #[serde(default, rename = "disableGatewayService")]
    pub disable_gateway_service: bool,
}

impl EndpointJoinInfo {
    /// Number of gateways weighted by family: 1 for IPv4, 2 for IPv6.
    #[must_use]
    pub fn gateway_weight(&self) -> u8 {
        u8::from(self.gw.is_some()) + 2 * u8::from(self.gw6.is_some())
    }

    /// Whether this join brought a gateway or a default route.
    #[must_use]
    pub fn has_gateway_or_default_route(&self) -> bool {
        self.gw.is_some()
            || self.gw6.is_some()
            || self
                .static_routes
                .iter()
                .any(|r| r.destination.prefix() == 0)
    }
}

/// The [`JoinInfo`] handed to a driver, writing into an endpoint's data.
#[derive(Debug)]
pub struct JoinContext<'a> {
    iface: &'a mut EndpointInterface,
    info: &'a mut EndpointJoinInfo,
}

impl<'a> JoinContext<'a> {
    /// Wrap an endpoint's interface and join data.
    pub fn new(iface: &'a mut EndpointInterface, info: &'a mut EndpointJoinInfo) -> Self {
        Self { iface, info }
    }
}

impl JoinInfo for JoinContext<'_> {
    fn interface(&self) -> &dyn InterfaceInfo {
        &*self.iface
    }

    fn set_names(&mut self, src_name: &str, dst_prefix: &str) -> NetResult<()> {
        self.iface.src_name = src_name.to_string();
        self.iface.dst_prefix = dst_prefix.to_string();
        Ok(())
    }

    fn set_gateway(&mut self, gateway: Ipv4Addr) -> NetResult<()> {
        self.info.gw = Some(gateway);
        Ok(())
    }

    fn set_gateway_ipv6(&mut self, gateway: Ipv6Addr) -> NetResult<()> {
        self.info.gw6 = Some(gateway);
        Ok(())
    }

    fn add_static_route(
        &mut self,
        destination: IpNetwork,
        route_type: RouteType,
        next_hop: Option<IpAddr>,
    ) -> NetResult<()> {
        match route_type {
            RouteType::Connected => {
                if next_hop.is_some() {
                    return Err(NetError::invalid_parameter(format!(
                        "connected route {destination} cannot have a next hop"
                    )));
                }
                self.iface.routes.push(destination);
            }
            RouteType::NextHop => {
                let Some(hop) = next_hop else {
                    return Err(NetError::invalid_parameter(format!(
                        "route {destination} needs a next hop"
                    )));
                };
                self.info.static_routes.push(StaticRoute {
                    destination,
                    route_type,
                    next_hop: Some(hop),
                });
            }
        }
        Ok(())
    }

    fn disable_gateway_service(&mut self) {
        self.info.disable_gateway_service = true;
    }

    fn add_table_entry(&mut self, table: &str, key: &str, value: Vec<u8>) -> NetResult<()> {
        self.info.driver_table_entries.push(TableEntry {
            table_name: table.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once() {
        let mut iface = EndpointInterface::default();
        iface.set_mac_address("02:42:ac:11:00:02".parse().unwrap()).unwrap();
        let err = iface
            .set_mac_address("02:42:ac:11:00:03".parse().unwrap())
            .unwrap_err();
        assert!(err.is_forbidden());

        iface.set_ip_address("172.17.0.2/16".parse().unwrap()).unwrap();
        iface.set_ip_address("fe90::2/64".parse().unwrap()).unwrap();
        assert!(iface.set_ip_address("172.17.0.3/16".parse().unwrap()).is_err());
        assert!(iface.set_ip_address("fe90::3/64".parse().unwrap()).is_err());
        assert_eq!(iface.address().unwrap().to_string(), "172.17.0.2/16");
    }

    #[test]
    fn routes_are_classified() {
        let mut iface = EndpointInterface::default();
        let mut info = EndpointJoinInfo::default();
        let mut ctx = JoinContext::new(&mut iface, &mut info);

        ctx.add_static_route("10.10.0.0/16".parse().unwrap(), RouteType::Connected, None)
            .unwrap();
        ctx.add_static_route(
            "10.20.0.0/16".parse().unwrap(),
            RouteType::NextHop,
            Some("10.10.0.1".parse().unwrap()),
        )
        .unwrap();
        assert!(
            ctx.add_static_route(
                "10.30.0.0/16".parse().unwrap(),
                RouteType::Connected,
                Some("10.10.0.1".parse().unwrap()),
            )
            .is_err()
        );
        assert!(
            ctx.add_static_route("10.40.0.0/16".parse().unwrap(), RouteType::NextHop, None)
                .is_err()
        );
        ctx.set_names("veth1234567", "eth").unwrap();
        ctx.disable_gateway_service();

        assert_eq!(iface.routes.len(), 1);
        assert_eq!(iface.src_name, "veth1234567");
        assert_eq!(info.static_routes.len(), 1);
        assert!(info.disable_gateway_service);
        assert!(!info.has_gateway_or_default_route());
    }

    #[test]
    fn gateway_weight() {
        let mut info = EndpointJoinInfo::default();
        assert_eq!(info.gateway_weight(), 0);
        info.gw = Some("10.0.0.1".parse().unwrap());
        assert_eq!(info.gateway_weight(), 1);
        info.gw6 = Some("fe90::1".parse().unwrap());
        assert_eq!(info.gateway_weight(), 3);
        assert!(info.has_gateway_or_default_route());
    }

    #[test]
    fn json_tolerates_missing_lists() {
        let iface: EndpointInterface =
            serde_json::from_str(r#"{"addr":"10.0.0.2/24","srcName":"veth0","dstPrefix":"eth"}"#)
                .unwrap();
        assert!(iface.ll_addrs.is_empty());
        assert!(iface.routes.is_empty());

        let full = EndpointInterface {
            mac: Some("aa:bb:cc:dd:ee:ff".parse().unwrap()),
            addr: Some("10.0.0.2/24".parse().unwrap()),
            addrv6: Some("fe90::aabb:ccdd:eeff/64".parse().unwrap()),
            ll_addrs: vec!["169.254.1.1/16".parse().unwrap()],
            src_name: "veth0".into(),
            dst_prefix: "eth".into(),
            routes: vec!["10.1.0.0/16".parse().unwrap()],
            v4_pool_id: "LocalDefault/10.0.0.0/24".into(),
            v6_pool_id: "LocalDefault/fe90::/64".into(),
        };
        let back: EndpointInterface =
            serde_json::from_str(&serde_json::to_string(&full).unwrap()).unwrap();
        assert_eq!(back, full);

        let info = EndpointJoinInfo {
            gw: Some("10.0.0.1".parse().unwrap()),
            static_routes: vec![StaticRoute {
                destination: "10.5.0.0/16".parse().unwrap(),
                route_type: RouteType::NextHop,
                next_hop: Some("10.0.0.254".parse().unwrap()),
            }],
            ..EndpointJoinInfo::default()
        };
        let back: EndpointJoinInfo =
            serde_json::from_str(&serde_json::to_string(&info).unwrap()).unwrap();
        assert_eq!(back, info);
    }
}
