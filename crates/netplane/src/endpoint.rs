//! Endpoints: address assignment, the join/leave protocol and deletion.
//!
//! Like [`Network`], an [`Endpoint`] value is a snapshot. Every mutating
//! operation re-reads the record from the store first and writes it back
//! with a CAS, so two controllers never silently overwrite each other.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use netplane_common::types::is_link_local_unicast;
use netplane_common::{
    GenericOptions, MacAddress, NetError, NetResult, PortBinding, Protocol, StaticRoute,
    TransportPort, generate_id, netlabel,
};

use crate::controller::ControllerInner;
use crate::datastore::{DataScope, KvObject};
use crate::driverapi::Driver;
use crate::endpoint_cnt::EndpointCnt;
use crate::endpoint_info::{EndpointInterface, EndpointJoinInfo, JoinContext};
use crate::ipamapi::{Ipam, IpamOptions};
use crate::network::Network;
use crate::sandbox::{self, Sandbox};

/// Store collection of endpoints.
pub const ENDPOINT_KEY: &str = "endpoint";

/// A published service port of a load-balanced endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortConfig {
    /// Port name, used in SRV lookups.
    pub name: String,
    /// Protocol.
    pub protocol: Protocol,
    /// Port inside the container.
    pub target_port: u16,
    /// Port published on the routing mesh.
    #[serde(default)]
    pub published_port: u16,
}

/// Options for [`Network::create_endpoint`].
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    pub(crate) ipv4: Option<IpAddr>,
    pub(crate) ipv6: Option<IpAddr>,
    pub(crate) link_local: Vec<IpNetwork>,
    pub(crate) ipam_options: IpamOptions,
    pub(crate) generic: GenericOptions,
    pub(crate) exposed_ports: Vec<TransportPort>,
    pub(crate) anonymous: bool,
    pub(crate) disable_resolution: bool,
    pub(crate) aliases: BTreeMap<String, String>,
    pub(crate) my_aliases: Vec<String>,
    pub(crate) svc_name: String,
    pub(crate) svc_id: String,
    pub(crate) virtual_ip: Option<IpAddr>,
    pub(crate) ingress_ports: Vec<PortConfig>,
    pub(crate) load_balancer: bool,
}

impl EndpointOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preferred addresses, link-local addresses and IPAM options.
    #[must_use]
    pub fn with_ipam(
        mut self,
        ipv4: Option<IpAddr>,
        ipv6: Option<IpAddr>,
        link_local: Vec<IpNetwork>,
        ipam_options: IpamOptions,
    ) -> Self {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self.link_local = link_local;
        self.ipam_options = ipam_options;
        self
    }

    /// Fixed MAC address.
    #[must_use]
    pub fn with_mac_address(mut self, mac: MacAddress) -> Self {
        self.generic.insert(
            netlabel::MAC_ADDRESS.to_string(),
            serde_json::Value::String(mac.to_string()),
        );
        self
    }

    /// Ports the container exposes.
    #[must_use]
    pub fn with_exposed_ports(mut self, ports: Vec<TransportPort>) -> Self {
        if let Ok(value) = serde_json::to_value(&ports) {
            self.generic.insert(netlabel::EXPOSED_PORTS.to_string(), value);
        }
        self.exposed_ports = ports;
        self
    }

    /// Ports to publish on the host.
    #[must_use]
    pub fn with_port_mapping(mut self, bindings: Vec<PortBinding>) -> Self {
        if let Ok(value) = serde_json::to_value(&bindings) {
            self.generic.insert(netlabel::PORT_MAP.to_string(), value);
        }
        self
    }

    /// Keep the endpoint out of the embedded DNS server.
    #[must_use]
    pub const fn with_disable_resolution(mut self) -> Self {
        self.disable_resolution = true;
        self
    }

    /// Do not publish the endpoint name in service records.
    #[must_use]
    pub const fn with_anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Let the sandbox resolve `alias` to the endpoint called `name`.
    #[must_use]
    pub fn with_alias(mut self, name: &str, alias: &str) -> Self {
        self.aliases.insert(alias.to_string(), name.to_string());
        self
    }

    /// Extra names published network-wide.
    #[must_use]
    pub fn with_my_aliases(mut self, aliases: Vec<String>) -> Self {
        self.my_aliases = aliases;
        self
    }

    /// Service this endpoint backs.
    #[must_use]
    pub fn with_service(
        mut self,
        name: &str,
        id: &str,
        virtual_ip: Option<IpAddr>,
        ingress_ports: Vec<PortConfig>,
    ) -> Self {
        self.svc_name = name.to_string();
        self.svc_id = id.to_string();
        self.virtual_ip = virtual_ip;
        self.ingress_ports = ingress_ports;
        self
    }

    /// Mark as the network's load-balancer endpoint.
    #[must_use]
    pub const fn with_load_balancer(mut self) -> Self {
        self.load_balancer = true;
        self
    }

    /// Merge driver options.
    #[must_use]
    pub fn with_generic(mut self, generic: GenericOptions) -> Self {
        self.generic.extend(generic);
        self
    }
}

/// Options for [`Endpoint::join`].
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub(crate) priority: i32,
    pub(crate) generic: GenericOptions,
}

impl JoinOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway election priority; higher wins.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Extra options handed to the driver.
    #[must_use]
    pub fn with_generic(mut self, generic: GenericOptions) -> Self {
        self.generic.extend(generic);
        self
    }
}

/// A network attachment point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(rename = "ep_iface", default)]
    pub(crate) iface: EndpointInterface,
    #[serde(rename = "joinInfo", default)]
    pub(crate) join_info: EndpointJoinInfo,
    #[serde(rename = "exposedPorts", default)]
    pub(crate) exposed_ports: Vec<TransportPort>,
    #[serde(default)]
    pub(crate) generic: GenericOptions,
    #[serde(rename = "sandbox", default)]
    pub(crate) sandbox_id: String,
    #[serde(default)]
    pub(crate) anonymous: bool,
    #[serde(rename = "disableResolution", default)]
    pub(crate) disable_resolution: bool,
    #[serde(rename = "myAliases", default)]
    pub(crate) my_aliases: Vec<String>,
    #[serde(default)]
    pub(crate) aliases: BTreeMap<String, String>,
    #[serde(rename = "svcName", default)]
    pub(crate) svc_name: String,
    #[serde(rename = "svcID", default)]
    pub(crate) svc_id: String,
    #[serde(rename = "virtualIP", default, skip_serializing_if = "Option::is_none")]
    pub(crate) virtual_ip: Option<IpAddr>,
    #[serde(rename = "ingressPorts", default)]
    pub(crate) ingress_ports: Vec<PortConfig>,
    #[serde(rename = "loadBalancer", default)]
    pub(crate) load_balancer: bool,
    #[serde(skip)]
    pub(crate) network_id: String,
    #[serde(skip)]
    pub(crate) scope: DataScope,
    #[serde(skip)]
    db_index: u64,
    #[serde(skip)]
    db_exists: bool,
    #[serde(skip)]
    pub(crate) ctrl: Weak<ControllerInner>,
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.iface == other.iface
            && self.join_info == other.join_info
            && self.exposed_ports == other.exposed_ports
            && self.generic == other.generic
            && self.sandbox_id == other.sandbox_id
            && self.anonymous == other.anonymous
            && self.disable_resolution == other.disable_resolution
            && self.my_aliases == other.my_aliases
            && self.aliases == other.aliases
            && self.svc_name == other.svc_name
            && self.svc_id == other.svc_id
            && self.virtual_ip == other.virtual_ip
            && self.ingress_ports == other.ingress_ports
            && self.load_balancer == other.load_balancer
    }
}

impl KvObject for Endpoint {
    fn key(&self) -> Vec<String> {
        vec![ENDPOINT_KEY.to_string(), self.network_id.clone(), self.id.clone()]
    }
    fn key_prefix(&self) -> Vec<String> {
        vec![ENDPOINT_KEY.to_string(), self.network_id.clone()]
    }
    fn index(&self) -> u64 {
        self.db_index
    }
    fn set_index(&mut self, index: u64) {
        self.db_index = index;
    }
    fn exists(&self) -> bool {
        self.db_exists
    }
    fn set_exists(&mut self) {
        self.db_exists = true;
    }
    fn data_scope(&self) -> DataScope {
        self.scope
    }
}

/// Stages of endpoint creation, in order. Rollback undoes every stage up to
/// and including the one reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Created {
    Addresses,
    Driver,
    Stored,
    Watched,
}

pub(crate) fn create(
    ctrl: &Arc<ControllerInner>,
    network: &Network,
    name: &str,
    options: EndpointOptions,
) -> NetResult<Endpoint> {
    let n = ctrl.network_from_store(&network.id)?;
    if n.in_delete {
        return Err(NetError::forbidden(format!(
            "network {} is being deleted",
            n.name
        )));
    }
    for addr in &options.link_local {
        if !is_link_local_unicast(&addr.ip()) {
            return Err(NetError::bad_request(format!(
                "invalid link local IP address: {}",
                addr.ip()
            )));
        }
    }

    let mut ep = Endpoint::from_options(ctrl, &n, name, &options)?;
    let ipam = ctrl.ipams.get(&n.ipam_type)?;
    let (driver, _) = ctrl.drivers.get(&n.network_type)?;
    let store = ctrl.store_for(n.scope)?.clone();

    ep.assign_address(ipam.as_ref(), &n, false, options.ipv4, &options.ipam_options)?;
    let mut reached = Created::Addresses;

    let result = (|| -> NetResult<()> {
        if !n.post_ipv6 {
            ep.assign_address(ipam.as_ref(), &n, true, options.ipv6, &options.ipam_options)?;
        }
        driver.create_endpoint(&n.id, &ep.id, &mut ep.iface, &ep.generic)?;
        reached = Created::Driver;

        if n.post_ipv6 {
            let preferred = options.ipv6.or_else(|| ep.iface.addrv6.map(|a| IpAddr::V6(a.ip())));
            ep.assign_address(ipam.as_ref(), &n, true, preferred, &options.ipam_options)?;
        }

        store.put_object_atomic(&mut ep)?;
        reached = Created::Stored;

        ctrl.watch_svc_record(&n, &ep);
        reached = Created::Watched;

        EndpointCnt::increment(&store, &n.id)?;
        Ok(())
    })();

    if let Err(e) = result {
        ep.undo_create(ctrl, &n, ipam.as_ref(), driver.as_ref(), reached);
        return Err(e);
    }
    tracing::debug!(network = %n.name, endpoint = %ep.name, id = %ep.id, "Endpoint created");
    Ok(ep)
}

impl Endpoint {
    fn from_options(
        ctrl: &Arc<ControllerInner>,
        n: &Network,
        name: &str,
        options: &EndpointOptions,
    ) -> NetResult<Self> {
        let mut iface = EndpointInterface {
            ll_addrs: options.link_local.clone(),
            ..EndpointInterface::default()
        };
        if let Some(value) = options.generic.get(netlabel::MAC_ADDRESS) {
            let mac: MacAddress = serde_json::from_value(value.clone())
                .map_err(|e| NetError::bad_request(format!("invalid MAC address: {e}")))?;
            iface.mac = Some(mac);
        }
        Ok(Self {
            id: generate_id(),
            name: name.to_string(),
            iface,
            join_info: EndpointJoinInfo::default(),
            exposed_ports: options.exposed_ports.clone(),
            generic: options.generic.clone(),
            sandbox_id: String::new(),
            anonymous: options.anonymous,
            disable_resolution: options.disable_resolution,
            my_aliases: options.my_aliases.clone(),
            aliases: options.aliases.clone(),
            svc_name: options.svc_name.clone(),
            svc_id: options.svc_id.clone(),
            virtual_ip: options.virtual_ip,
            ingress_ports: options.ingress_ports.clone(),
            load_balancer: options.load_balancer,
            network_id: n.id.clone(),
            scope: n.scope,
            db_index: 0,
            db_exists: false,
            ctrl: Arc::downgrade(ctrl),
        })
    }

    /// Bind a record read from the store to its network and controller.
    pub(crate) fn attach(mut self, ctrl: &Arc<ControllerInner>, n: &Network) -> Self {
        self.network_id.clone_from(&n.id);
        self.scope = n.scope;
        self.ctrl = Arc::downgrade(ctrl);
        self
    }

    pub(crate) fn controller(&self) -> NetResult<Arc<ControllerInner>> {
        self.ctrl.upgrade().ok_or_else(|| NetError::NoService {
            message: "controller is stopped".to_string(),
        })
    }

    /// Endpoint ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Endpoint name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ID of the owning network.
    #[must_use]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// The owning network, read from the store.
    pub fn network(&self) -> NetResult<Network> {
        self.controller()?.network_from_store(&self.network_id)
    }

    /// ID of the sandbox the endpoint is joined to, empty when detached.
    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// The sandbox the endpoint is joined to.
    #[must_use]
    pub fn sandbox(&self) -> Option<Sandbox> {
        if self.sandbox_id.is_empty() {
            return None;
        }
        self.ctrl.upgrade()?.sandbox_by_id(&self.sandbox_id)
    }

    /// Interface data.
    #[must_use]
    pub const fn iface(&self) -> &EndpointInterface {
        &self.iface
    }

    /// IPv4 address with prefix.
    #[must_use]
    pub const fn address(&self) -> Option<Ipv4Network> {
        self.iface.addr
    }

    /// IPv6 address with prefix.
    #[must_use]
    pub const fn address_ipv6(&self) -> Option<Ipv6Network> {
        self.iface.addrv6
    }

    /// MAC address.
    #[must_use]
    pub const fn mac_address(&self) -> Option<MacAddress> {
        self.iface.mac
    }

    /// Join data published by the driver.
    #[must_use]
    pub const fn join_info(&self) -> &EndpointJoinInfo {
        &self.join_info
    }

    /// Static routes published by the driver.
    #[must_use]
    pub fn static_routes(&self) -> &[StaticRoute] {
        &self.join_info.static_routes
    }

    /// Exposed ports.
    #[must_use]
    pub fn exposed_ports(&self) -> &[TransportPort] {
        &self.exposed_ports
    }

    /// Network-wide aliases.
    #[must_use]
    pub fn my_aliases(&self) -> &[String] {
        &self.my_aliases
    }

    /// Whether the endpoint name stays out of service records.
    #[must_use]
    pub const fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Whether the endpoint uses the embedded DNS server.
    #[must_use]
    pub const fn need_resolver(&self) -> bool {
        !self.disable_resolution
    }

    /// Fresh copy of this endpoint from the store.
    pub fn info(&self) -> NetResult<Self> {
        let ctrl = self.controller()?;
        let n = ctrl.network_from_store(&self.network_id)?;
        ctrl.endpoint_from_store(&n, &self.id)
    }

    /// Operational data the driver reports, e.g. the programmed port map.
    pub fn driver_info(&self) -> NetResult<GenericOptions> {
        let ctrl = self.controller()?;
        let n = ctrl.network_from_store(&self.network_id)?;
        let (driver, _) = ctrl.drivers.get(&n.network_type)?;
        driver.endpoint_oper_info(&n.id, &self.id)
    }

    pub(crate) fn first_address(&self) -> Option<IpAddr> {
        self.iface
            .addr
            .map(|a| IpAddr::V4(a.ip()))
            .or_else(|| self.iface.addrv6.map(|a| IpAddr::V6(a.ip())))
    }

    /// Reserve an address of one family from the first pool that has room,
    /// or from the pool holding `preferred`.
    fn assign_address(
        &mut self,
        ipam: &dyn Ipam,
        n: &Network,
        v6: bool,
        preferred: Option<IpAddr>,
        options: &IpamOptions,
    ) -> NetResult<()> {
        let infos = if v6 { &n.ipam_v6_info } else { &n.ipam_v4_info };
        if infos.is_empty() {
            return Ok(());
        }

        for info in infos {
            if let Some(ip) = preferred {
                if !info.data.pool.contains(ip) {
                    continue;
                }
            }
            match ipam.request_address(&info.pool_id, preferred, options) {
                Ok((addr, _)) => {
                    match addr {
                        Some(IpNetwork::V4(a)) => {
                            self.iface.addr = Some(a);
                            self.iface.v4_pool_id.clone_from(&info.pool_id);
                        }
                        Some(IpNetwork::V6(a)) => {
                            self.iface.addrv6 = Some(a);
                            self.iface.v6_pool_id.clone_from(&info.pool_id);
                        }
                        None => {}
                    }
                    return Ok(());
                }
                Err(NetError::NoAvailableIps { .. }) if preferred.is_none() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(ip) = preferred {
            return Err(NetError::bad_request(format!(
                "invalid address {ip}: it does not belong to any of this network's subnets"
            )));
        }
        Err(NetError::NoAvailableIps {
            pool: format!("IPv{} pools of network {} ({})", if v6 { 6 } else { 4 }, n.name, n.id),
        })
    }

    fn release_address(&self, ipam: &dyn Ipam) {
        if let Some(addr) = self.iface.addr {
            if !self.iface.v4_pool_id.is_empty() {
                if let Err(e) = ipam.release_address(&self.iface.v4_pool_id, IpAddr::V4(addr.ip())) {
                    tracing::warn!(endpoint = %self.name, address = %addr, error = %e, "Failed to release IPv4 address");
                }
            }
        }
        if let Some(addr) = self.iface.addrv6 {
            if !self.iface.v6_pool_id.is_empty() {
                if let Err(e) = ipam.release_address(&self.iface.v6_pool_id, IpAddr::V6(addr.ip())) {
                    tracing::warn!(endpoint = %self.name, address = %addr, error = %e, "Failed to release IPv6 address");
                }
            }
        }
    }

    fn undo_create(
        &self,
        ctrl: &ControllerInner,
        n: &Network,
        ipam: &dyn Ipam,
        driver: &dyn Driver,
        reached: Created,
    ) {
        if reached >= Created::Watched {
            ctrl.unwatch_svc_record(n, self);
        }
        if reached >= Created::Stored {
            if let Ok(store) = ctrl.store_for(n.scope) {
                if let Err(e) = store.delete_object_atomic(self) {
                    tracing::warn!(endpoint = %self.name, error = %e, "Failed to remove endpoint record during rollback");
                }
            }
        }
        if reached >= Created::Driver {
            if let Err(e) = driver.delete_endpoint(&n.id, &self.id) {
                tracing::warn!(endpoint = %self.name, error = %e, "Failed to remove driver endpoint during rollback");
            }
        }
        self.release_address(ipam);
    }

    /// Attach the endpoint to `sb`.
    ///
    /// # Errors
    ///
    /// [`NetError::Forbidden`] when the endpoint is already attached or the
    /// sandbox is being deleted; driver and store errors otherwise, after
    /// undoing every step taken.
    pub fn join(&self, sb: &Sandbox, options: JoinOptions) -> NetResult<()> {
        let _gate = sb.inner.gate.lock();
        self.sb_join(sb, &options)
    }

    /// Detach the endpoint from `sb`.
    pub fn leave(&self, sb: &Sandbox) -> NetResult<()> {
        let _gate = sb.inner.gate.lock();
        self.sb_leave(sb, false)
    }

    /// Join without taking the sandbox gate. The caller holds it.
    pub(crate) fn sb_join(&self, sb: &Sandbox, options: &JoinOptions) -> NetResult<()> {
        let ctrl = self.controller()?;
        let n = ctrl.network_from_store(&self.network_id)?;
        let ep = ctrl.endpoint_from_store(&n, &self.id)?;

        if sb.in_delete() {
            return Err(NetError::forbidden(format!(
                "sandbox {} is being deleted",
                sb.id()
            )));
        }
        if !ep.sandbox_id.is_empty() {
            return Err(NetError::forbidden(
                "another container is attached to the same network endpoint",
            ));
        }
        ctrl.claim_endpoint(&ep.id, sb.id())?;

        let result = ep.join_claimed(&ctrl, &n, sb, options);
        if result.is_err() {
            ctrl.release_claim(&self.id, sb.id());
        }
        result
    }

    fn join_claimed(
        mut self,
        ctrl: &Arc<ControllerInner>,
        n: &Network,
        sb: &Sandbox,
        options: &JoinOptions,
    ) -> NetResult<()> {
        let (driver, capability) = ctrl.drivers.get(&n.network_type)?;
        self.join_info = EndpointJoinInfo::default();

        let mut driver_opts = sb.labels();
        driver_opts.extend(options.generic.clone());
        {
            let mut jinfo = JoinContext::new(&mut self.iface, &mut self.join_info);
            driver.join(&n.id, &self.id, &sb.key(), &mut jinfo, &driver_opts)?;
        }

        let old_gw = sb.gateway_endpoint();
        if let Err(e) = self.attach_to_sandbox(ctrl, n, sb, options.priority, capability.is_multihost()) {
            if let Err(le) = driver.leave(&n.id, &self.id) {
                tracing::warn!(endpoint = %self.name, error = %le, "Driver leave failed during join rollback");
            }
            return Err(e);
        }
        tracing::debug!(endpoint = %self.name, sandbox = %sb.id(), "Endpoint joined sandbox");

        if sb.need_default_gw() && sb.endpoint_in_gw_network().is_none() {
            if let Err(e) = sb.setup_default_gw() {
                if let Err(le) = self.sb_leave(sb, true) {
                    tracing::warn!(endpoint = %self.name, error = %le, "Leave failed after default gateway error");
                }
                return Err(e);
            }
            return Ok(());
        }

        let new_gw = sb.gateway_endpoint();
        if new_gw.as_ref().map(|e| &e.id) != old_gw.as_ref().map(|e| &e.id) {
            if let Some(old) = &old_gw {
                tracing::debug!(endpoint = %old.name, "Revoking external connectivity");
                if let Err(e) = revoke_external(ctrl, old) {
                    tracing::warn!(endpoint = %old.name, error = %e, "Failed to revoke external connectivity");
                }
            }
            if !n.internal {
                tracing::debug!(endpoint = %self.name, "Programming external connectivity");
                let opts = sandbox::external_options(sb, &self);
                if let Err(e) = driver.program_external_connectivity(&n.id, &self.id, &opts) {
                    if let Err(le) = self.sb_leave(sb, true) {
                        tracing::warn!(endpoint = %self.name, error = %le, "Leave failed after external connectivity error");
                    }
                    return Err(NetError::internal(format!(
                        "driver failed programming external connectivity on endpoint {} ({}): {e}",
                        self.name, self.id
                    )));
                }
            }
        }

        if !sb.need_default_gw() {
            if let Err(e) = sb.clear_default_gw() {
                tracing::warn!(sandbox = %sb.id(), error = %e, "Failure while disconnecting from the gateway network");
            }
        }
        Ok(())
    }

    /// Everything a join does between the driver call and the gateway
    /// bookkeeping. On failure the sandbox is left as it was.
    fn attach_to_sandbox(
        &mut self,
        ctrl: &ControllerInner,
        n: &Network,
        sb: &Sandbox,
        priority: i32,
        multihost: bool,
    ) -> NetResult<()> {
        let watched = ctrl.watch_svc_record(n, self);

        let update_hosts = sandbox::updates_hosts(n);
        let records = if update_hosts {
            ctrl.svc_host_records(n, self)
        } else {
            Vec::new()
        };
        sb.add_hosts_entries(&records);
        if update_hosts {
            sb.add_own_hosts_entry(self);
        }

        self.sandbox_id = sb.id().to_string();
        sb.add_endpoint(self, n, priority, multihost);

        let result = (|| -> NetResult<()> {
            sb.update_dns()?;
            sb.populate_network_resources(&self.id)?;
            ctrl.store_for(n.scope)?.put_object_atomic(self)?;
            sb.store_update();
            Ok(())
        })();

        if let Err(e) = result {
            sb.clear_network_resources(&self.id);
            sb.delete_hosts_entries(&records);
            if update_hosts {
                sb.delete_own_hosts_entry(self);
            }
            if let Err(de) = sb.update_dns() {
                tracing::warn!(sandbox = %sb.id(), error = %de, "Failed to restore resolv.conf");
            }
            self.sandbox_id.clear();
            if watched {
                ctrl.unwatch_svc_record(n, self);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Leave without taking the sandbox gate. The caller holds it.
    pub(crate) fn sb_leave(&self, sb: &Sandbox, force: bool) -> NetResult<()> {
        let ctrl = self.controller()?;
        let n = ctrl
            .network_from_store(&self.network_id)
            .map_err(|e| NetError::internal(format!("failed to get network from store during leave: {e}")))?;
        let mut ep = ctrl
            .endpoint_from_store(&n, &self.id)
            .map_err(|e| NetError::internal(format!("failed to get endpoint from store during leave: {e}")))?;

        if ep.sandbox_id.is_empty() {
            return Err(NetError::forbidden("cannot leave endpoint with no attached sandbox"));
        }
        if ep.sandbox_id != sb.id() {
            return Err(NetError::forbidden(format!(
                "unexpected sandbox ID in leave request. Expected {}. Got {}",
                ep.sandbox_id,
                sb.id()
            )));
        }

        let driver = match ctrl.drivers.get(&n.network_type) {
            Ok((driver, _)) => Some(driver),
            Err(e) if force => {
                tracing::warn!(endpoint = %ep.name, error = %e, "Driver missing during forced leave");
                None
            }
            Err(e) => return Err(e),
        };

        let old_gw = sb.gateway_endpoint();
        let move_ext = old_gw.as_ref().is_some_and(|g| g.id == ep.id);
        if let Some(driver) = &driver {
            if move_ext {
                tracing::debug!(endpoint = %ep.name, "Revoking external connectivity");
                if let Err(e) = driver.revoke_external_connectivity(&n.id, &ep.id) {
                    tracing::warn!(endpoint = %ep.name, error = %e, "Driver failed revoking external connectivity");
                }
            }
            if let Err(e) = driver.leave(&n.id, &ep.id) {
                if !e.is_maskable() {
                    tracing::warn!(endpoint = %ep.name, error = %e, "Driver error disconnecting container");
                }
            }
        }

        sb.clear_network_resources(&ep.id);

        ep.sandbox_id.clear();
        ctrl.store_for(n.scope)?.put_object_atomic(&mut ep)?;
        ctrl.release_claim(&ep.id, sb.id());

        if sandbox::updates_hosts(&n) {
            sb.delete_hosts_entries(&ctrl.svc_host_records(&n, &ep));
            sb.delete_own_hosts_entry(&ep);
        }
        if let Err(e) = sb.update_dns() {
            tracing::warn!(sandbox = %sb.id(), error = %e, "Failed to update resolv.conf on leave");
        }
        sb.store_update();
        tracing::debug!(endpoint = %ep.name, sandbox = %sb.id(), "Endpoint left sandbox");

        if !sb.in_delete() && sb.need_default_gw() {
            return sb.setup_default_gw();
        }

        if move_ext {
            if let Some(new_gw) = sb.gateway_endpoint() {
                tracing::debug!(endpoint = %new_gw.name, "Programming external connectivity");
                let gw_net = ctrl.network_from_store(&new_gw.network_id)?;
                let (gw_driver, _) = ctrl.drivers.get(&gw_net.network_type)?;
                let opts = sandbox::external_options(sb, &new_gw);
                gw_driver
                    .program_external_connectivity(&gw_net.id, &new_gw.id, &opts)
                    .map_err(|e| {
                        NetError::internal(format!(
                            "driver failed programming external connectivity on endpoint {} ({}): {e}",
                            new_gw.name, new_gw.id
                        ))
                    })?;
            }
        }

        if !sb.need_default_gw() {
            if let Err(e) = sb.clear_default_gw() {
                tracing::warn!(sandbox = %sb.id(), error = %e, "Failure while disconnecting from the gateway network");
            }
        }
        Ok(())
    }

    /// Delete the endpoint. Refused while it is joined unless `force`.
    ///
    /// # Errors
    ///
    /// [`NetError::ActiveContainer`] when joined and not forced.
    pub fn delete(&self, force: bool) -> NetResult<()> {
        let ctrl = self.controller()?;
        let n = ctrl
            .network_from_store(&self.network_id)
            .map_err(|e| NetError::internal(format!("failed to get network during delete: {e}")))?;
        let mut ep = ctrl.endpoint_from_store(&n, &self.id)?;

        if !ep.sandbox_id.is_empty() {
            if !force {
                return Err(NetError::ActiveContainer {
                    name: ep.name.clone(),
                    id: ep.id.clone(),
                });
            }
            if let Some(sb) = ctrl.sandbox_by_id(&ep.sandbox_id) {
                let gate = sb.inner.gate.lock();
                if let Err(e) = ep.sb_leave(&sb, true) {
                    tracing::warn!(endpoint = %ep.name, error = %e, "Failed to leave sandbox while deleting endpoint");
                }
                drop(gate);
            }
            ctrl.release_claim_any(&ep.id);
            ep = ctrl.endpoint_from_store(&n, &self.id)?;
        }

        let store = ctrl.store_for(n.scope)?.clone();
        store.delete_object_atomic(&ep)?;

        if let Err(e) = EndpointCnt::decrement(&store, &n.id) {
            if !force {
                ep.restore_record(&store);
                return Err(e);
            }
            tracing::warn!(network = %n.name, error = %e, "Failed to decrement endpoint count");
        }

        ctrl.unwatch_svc_record(&n, &ep);

        match ctrl.drivers.get(&n.network_type) {
            Ok((driver, _)) => {
                if let Err(e) = driver.delete_endpoint(&n.id, &ep.id) {
                    if !force && !e.is_maskable() {
                        ctrl.watch_svc_record(&n, &ep);
                        if let Err(ie) = EndpointCnt::increment(&store, &n.id) {
                            tracing::warn!(network = %n.name, error = %ie, "Failed to restore endpoint count");
                        }
                        ep.restore_record(&store);
                        return Err(e);
                    }
                    if !e.is_maskable() {
                        tracing::warn!(endpoint = %ep.name, error = %e, "Driver failed to delete endpoint");
                    }
                }
            }
            Err(e) => tracing::warn!(endpoint = %ep.name, error = %e, "Driver missing while deleting endpoint"),
        }

        match ctrl.ipams.get(&n.ipam_type) {
            Ok(ipam) => ep.release_address(ipam.as_ref()),
            Err(e) => tracing::warn!(endpoint = %ep.name, error = %e, "IPAM missing, addresses not released"),
        }
        tracing::debug!(network = %n.name, endpoint = %ep.name, "Endpoint deleted");
        Ok(())
    }

    fn restore_record(&mut self, store: &crate::datastore::DataStore) {
        self.db_exists = false;
        self.db_index = 0;
        if let Err(e) = store.put_object_atomic(self) {
            tracing::warn!(endpoint = %self.name, error = %e, "Failed to restore endpoint record");
        }
    }

    /// Give the endpoint a new name, moving its service records along.
    pub(crate) fn rename(&self, name: &str) -> NetResult<()> {
        netplane_common::id::validate_name(name)?;
        let ctrl = self.controller()?;
        let n = ctrl.network_from_store(&self.network_id)?;
        let mut ep = ctrl.endpoint_from_store(&n, &self.id)?;
        if ep.name == name {
            return Ok(());
        }
        if n.endpoint_by_name(name).is_ok() {
            return Err(NetError::forbidden(format!(
                "endpoint with name {name} already exists in network {}",
                n.name
            )));
        }

        ctrl.update_svc_record(&n, &ep, false);
        let old_name = std::mem::replace(&mut ep.name, name.to_string());
        let old_anonymous = std::mem::replace(&mut ep.anonymous, false);
        ctrl.update_svc_record(&n, &ep, true);

        let store = ctrl.store_for(n.scope)?.clone();
        if let Err(e) = store.put_object_atomic(&mut ep) {
            ctrl.update_svc_record(&n, &ep, false);
            ep.name = old_name;
            ep.anonymous = old_anonymous;
            ctrl.update_svc_record(&n, &ep, true);
            return Err(e);
        }
        ctrl.refresh_local_endpoint(&n, &ep);
        if let Some(sb) = ctrl.sandbox_by_id(&ep.sandbox_id) {
            sb.refresh_endpoint(&ep);
        }

        // Poke remote watchers so they pick the new name up.
        match EndpointCnt::load(&store, &n.id) {
            Ok(cnt) => {
                if let Err(e) = EndpointCnt::set(&store, &n.id, cnt.count) {
                    tracing::debug!(network = %n.name, error = %e, "Endpoint count touch failed");
                }
            }
            Err(e) => tracing::debug!(network = %n.name, error = %e, "Endpoint count unreadable"),
        }
        tracing::debug!(endpoint = %old_name, new_name = name, "Endpoint renamed");
        Ok(())
    }
}

fn revoke_external(ctrl: &ControllerInner, ep: &Endpoint) -> NetResult<()> {
    let n = ctrl.network_from_store(&ep.network_id)?;
    let (driver, _) = ctrl.drivers.get(&n.network_type)?;
    driver.revoke_external_connectivity(&n.id, &ep.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_field_names() {
        let mut ep = Endpoint {
            id: "e1".into(),
            name: "web".into(),
            iface: EndpointInterface {
                mac: Some("02:42:ac:11:00:02".parse().unwrap()),
                addr: Some("172.17.0.2/16".parse().unwrap()),
                src_name: "veth0".into(),
                dst_prefix: "eth".into(),
                v4_pool_id: "LocalDefault/172.17.0.0/16".into(),
                ..EndpointInterface::default()
            },
            join_info: EndpointJoinInfo::default(),
            exposed_ports: vec![TransportPort {
                proto: Protocol::Tcp,
                port: 80,
            }],
            generic: GenericOptions::new(),
            sandbox_id: "sb1".into(),
            anonymous: false,
            disable_resolution: true,
            my_aliases: vec!["www".into()],
            aliases: BTreeMap::new(),
            svc_name: "websvc".into(),
            svc_id: "s1".into(),
            virtual_ip: Some("10.0.0.2".parse().unwrap()),
            ingress_ports: vec![PortConfig {
                name: "http".into(),
                protocol: Protocol::Tcp,
                target_port: 80,
                published_port: 8080,
            }],
            load_balancer: false,
            network_id: "n1".into(),
            scope: DataScope::Local,
            db_index: 0,
            db_exists: false,
            ctrl: Weak::new(),
        };

        let value = serde_json::to_value(&ep).unwrap();
        assert_eq!(value["ep_iface"]["addr"], "172.17.0.2/16");
        assert_eq!(value["ep_iface"]["v4PoolID"], "LocalDefault/172.17.0.0/16");
        assert_eq!(value["sandbox"], "sb1");
        assert_eq!(value["disableResolution"], true);
        assert_eq!(value["myAliases"][0], "www");
        assert_eq!(value["svcName"], "websvc");
        assert_eq!(value["virtualIP"], "10.0.0.2");
        assert_eq!(value["ingressPorts"][0]["TargetPort"], 80);
        assert!(value.get("network_id").is_none());

        let back: Endpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, ep);

        ep.set_index(7);
        assert_eq!(ep.key(), vec!["endpoint", "n1", "e1"]);
    }

    #[test]
    fn record_without_lists() {
        let ep: Endpoint = serde_json::from_str(
            r#"{"id":"e1","name":"web","ep_iface":{"srcName":"veth1","dstPrefix":"eth"}}"#,
        )
        .unwrap();
        assert!(ep.iface.ll_addrs.is_empty());
        assert!(ep.iface.routes.is_empty());
        assert!(ep.sandbox_id.is_empty());
        assert!(ep.need_resolver());
    }

    #[test]
    fn options_builders() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let opts = EndpointOptions::new()
            .with_mac_address(mac)
            .with_port_mapping(vec![PortBinding::new(Protocol::Tcp, 80, 8080)])
            .with_exposed_ports(vec![TransportPort {
                proto: Protocol::Tcp,
                port: 80,
            }])
            .with_alias("web", "frontend")
            .with_anonymous();

        assert_eq!(opts.generic[netlabel::MAC_ADDRESS], "aa:bb:cc:dd:ee:ff");
        assert!(opts.generic.contains_key(netlabel::PORT_MAP));
        assert!(opts.generic.contains_key(netlabel::EXPOSED_PORTS));
        assert_eq!(opts.aliases["frontend"], "web");
        assert!(opts.anonymous);

        let join = JoinOptions::new().with_priority(5);
        assert_eq!(join.priority, 5);
    }
}
