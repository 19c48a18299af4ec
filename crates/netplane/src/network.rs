//! Networks: IPAM configuration, pool reservations and driver fabric.
//!
//! The store holds the authoritative copy of every network. A [`Network`]
//! value is a snapshot read from it, carrying a weak handle on the
//! controller so operations can re-read fresh state.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use netplane_common::{GenericOptions, NetError, NetResult, netlabel};

use crate::controller::ControllerInner;
use crate::datastore::{DataScope, KvObject};
use crate::driverapi::IpamData;
use crate::endpoint::{self, Endpoint, EndpointOptions};
use crate::endpoint_cnt::EndpointCnt;
use crate::ipamapi::{self, Ipam, IpamOptions, PoolRequest};

/// Store collection of networks.
pub const NETWORK_KEY: &str = "network";

/// User intent for one address pool of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamConfig {
    /// Master pool to reserve. Empty lets the IPAM pick.
    #[serde(default)]
    pub preferred_pool: String,
    /// Range inside the pool container addresses come from.
    #[serde(default)]
    pub sub_pool: String,
    /// Gateway address.
    #[serde(default)]
    pub gateway: String,
    /// Addresses to keep away from containers, by name.
    #[serde(default)]
    pub aux_addresses: BTreeMap<String, String>,
}

impl IpamConfig {
    /// A configuration asking for `pool`.
    #[must_use]
    pub fn pool(pool: &str) -> Self {
        Self {
            preferred_pool: pool.to_string(),
            ..Self::default()
        }
    }

    /// Set the gateway.
    #[must_use]
    pub fn with_gateway(mut self, gateway: &str) -> Self {
        self.gateway = gateway.to_string();
        self
    }

    /// Set the sub-pool.
    #[must_use]
    pub fn with_sub_pool(mut self, sub_pool: &str) -> Self {
        self.sub_pool = sub_pool.to_string();
        self
    }

    /// Add an auxiliary address.
    #[must_use]
    pub fn with_aux_address(mut self, name: &str, ip: &str) -> Self {
        self.aux_addresses.insert(name.to_string(), ip.to_string());
        self
    }

    fn validate(&self) -> NetResult<()> {
        if !self.gateway.is_empty() && self.gateway.parse::<IpAddr>().is_err() {
            return Err(NetError::bad_request(format!(
                "invalid gateway address {} in Ipam configuration",
                self.gateway
            )));
        }
        Ok(())
    }

    fn parse_pool(value: &str) -> NetResult<Option<IpNetwork>> {
        if value.is_empty() {
            return Ok(None);
        }
        value
            .parse()
            .map(Some)
            .map_err(|_| NetError::bad_request(format!("invalid pool {value}")))
    }
}

/// Outcome of reserving one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamInfo {
    /// Pool ID handed out by the IPAM.
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    /// Metadata the IPAM returned with the pool.
    #[serde(rename = "Meta", default)]
    pub meta: IpamOptions,
    /// Pool, gateway and auxiliary addresses.
    #[serde(flatten)]
    pub data: IpamData,
}

/// How load-balanced traffic reaches service backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerMode {
    /// Destination NAT.
    #[default]
    Nat,
    /// Direct server return: the VIP lives on the backend's loopback.
    Dsr,
}

/// Options for [`crate::Controller::new_network`].
#[derive(Debug, Clone, Default)]
pub struct NetworkOptions {
    pub(crate) generic: GenericOptions,
    pub(crate) ipam_type: Option<String>,
    pub(crate) addr_space: String,
    pub(crate) ipam_options: IpamOptions,
    pub(crate) ipam_v4: Vec<IpamConfig>,
    pub(crate) ipam_v6: Vec<IpamConfig>,
    pub(crate) enable_ipv6: bool,
    pub(crate) defer_ipv6: bool,
    pub(crate) internal: bool,
    pub(crate) attachable: bool,
    pub(crate) ingress: bool,
    pub(crate) config_only: bool,
    pub(crate) config_from: String,
    pub(crate) persist: Option<bool>,
    pub(crate) labels: BTreeMap<String, String>,
    pub(crate) scope: Option<DataScope>,
    pub(crate) lb_mode: LoadBalancerMode,
}

impl NetworkOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge driver-facing generic options. `ENABLE_IPV6` and `INTERNAL`
    /// entries also set the matching flags.
    #[must_use]
    pub fn with_generic(mut self, generic: GenericOptions) -> Self {
        if let Some(v) = generic.get(netlabel::ENABLE_IPV6).and_then(serde_json::Value::as_bool) {
            self.enable_ipv6 = v;
        }
        if let Some(v) = generic.get(netlabel::INTERNAL).and_then(serde_json::Value::as_bool) {
            self.internal = v;
        }
        self.generic.extend(generic);
        self
    }

    /// Driver specific options.
    #[must_use]
    pub fn with_driver_opts(mut self, opts: BTreeMap<String, String>) -> Self {
        let value = serde_json::Value::Object(
            opts.into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
        );
        self.generic.insert(netlabel::GENERIC_DATA.to_string(), value);
        self
    }

    /// Address management: IPAM driver, address space, pool configurations
    /// per family and IPAM options.
    #[must_use]
    pub fn with_ipam(
        mut self,
        ipam_type: &str,
        addr_space: &str,
        v4: Vec<IpamConfig>,
        v6: Vec<IpamConfig>,
        options: IpamOptions,
    ) -> Self {
        if !ipam_type.is_empty() {
            self.ipam_type = Some(ipam_type.to_string());
        }
        self.addr_space = addr_space.to_string();
        self.ipam_v4 = v4;
        self.ipam_v6 = v6;
        self.ipam_options = options;
        self
    }

    /// Carry IPv6.
    #[must_use]
    pub fn with_enable_ipv6(mut self, enable: bool) -> Self {
        self.enable_ipv6 = enable;
        self.generic
            .insert(netlabel::ENABLE_IPV6.to_string(), serde_json::Value::Bool(enable));
        self
    }

    /// Let the driver pick endpoint IPv6 addresses; IPAM reserves them
    /// afterwards.
    #[must_use]
    pub const fn with_defer_ipv6_alloc(mut self, defer: bool) -> Self {
        self.defer_ipv6 = defer;
        self
    }

    /// No outside connectivity.
    #[must_use]
    pub fn with_internal(mut self) -> Self {
        self.internal = true;
        self.generic
            .insert(netlabel::INTERNAL.to_string(), serde_json::Value::Bool(true));
        self
    }

    /// Allow manual attachment in swarm mode.
    #[must_use]
    pub const fn with_attachable(mut self, attachable: bool) -> Self {
        self.attachable = attachable;
        self
    }

    /// Mark as the routing-mesh network.
    #[must_use]
    pub const fn with_ingress(mut self, ingress: bool) -> Self {
        self.ingress = ingress;
        self
    }

    /// Configuration holder only; never carries endpoints.
    #[must_use]
    pub const fn with_config_only(mut self) -> Self {
        self.config_only = true;
        self
    }

    /// Take IPAM and driver configuration from config-only network `name`.
    #[must_use]
    pub fn with_config_from(mut self, name: &str) -> Self {
        self.config_from = name.to_string();
        self
    }

    /// Whether the network survives a controller restart.
    #[must_use]
    pub const fn with_persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    /// User labels.
    #[must_use]
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Force a data scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: DataScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Load-balancer mode.
    #[must_use]
    pub const fn with_load_balancer_mode(mut self, mode: LoadBalancerMode) -> Self {
        self.lb_mode = mode;
        self
    }

    fn driver_opts_given(&self) -> bool {
        match self.generic.get(netlabel::GENERIC_DATA) {
            Some(serde_json::Value::Object(map)) => !map.is_empty(),
            Some(serde_json::Value::Null) | None => false,
            Some(_) => true,
        }
    }

    fn validate(&self, network_type: &str) -> NetResult<()> {
        if self.config_only && (self.ingress || self.internal || self.attachable || self.scope.is_some()) {
            return Err(NetError::forbidden(
                "configuration network can only contain network specific fields. \
                 Network operator fields like [ ingress | internal | attachable | scope ] are not supported.",
            ));
        }
        if !self.config_from.is_empty() {
            if self.config_only {
                return Err(NetError::forbidden(
                    "a configuration network cannot depend on another configuration network",
                ));
            }
            let custom_ipam = self
                .ipam_type
                .as_deref()
                .is_some_and(|t| t != default_ipam_for(network_type));
            if custom_ipam
                || self.enable_ipv6
                || !self.labels.is_empty()
                || !self.ipam_options.is_empty()
                || !self.ipam_v4.is_empty()
                || !self.ipam_v6.is_empty()
            {
                return Err(NetError::forbidden(
                    "user specified configurations are not supported if the network depends on a configuration network",
                ));
            }
            if self.driver_opts_given() {
                return Err(NetError::forbidden(
                    "network driver options are not supported if the network depends on a configuration network",
                ));
            }
        }
        Ok(())
    }
}

/// IPAM driver used by default for a network type.
#[must_use]
pub fn default_ipam_for(network_type: &str) -> &'static str {
    match network_type {
        "host" | "null" => ipamapi::NULL_IPAM,
        _ => ipamapi::DEFAULT_IPAM,
    }
}

/// A virtual network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) network_type: String,
    pub(crate) ipam_type: String,
    pub(crate) addr_space: String,
    #[serde(default)]
    pub(crate) ipam_options: IpamOptions,
    #[serde(default, rename = "ipamV4Config")]
    pub(crate) ipam_v4_config: Vec<IpamConfig>,
    #[serde(default, rename = "ipamV6Config")]
    pub(crate) ipam_v6_config: Vec<IpamConfig>,
    #[serde(default, rename = "ipamV4Info")]
    pub(crate) ipam_v4_info: Vec<IpamInfo>,
    #[serde(default, rename = "ipamV6Info")]
    pub(crate) ipam_v6_info: Vec<IpamInfo>,
    #[serde(default, rename = "enableIPv6")]
    pub(crate) enable_ipv6: bool,
    #[serde(default, rename = "postIPv6")]
    pub(crate) post_ipv6: bool,
    #[serde(default)]
    pub(crate) internal: bool,
    #[serde(default)]
    pub(crate) attachable: bool,
    #[serde(default)]
    pub(crate) ingress: bool,
    #[serde(default)]
    pub(crate) config_only: bool,
    #[serde(default)]
    pub(crate) config_from: String,
    #[serde(default)]
    pub(crate) generic: GenericOptions,
    #[serde(default)]
    pub(crate) labels: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) load_balancer_mode: LoadBalancerMode,
    pub(crate) persist: bool,
    pub(crate) scope: DataScope,
    #[serde(default)]
    pub(crate) in_delete: bool,
    #[serde(skip)]
    db_index: u64,
    #[serde(skip)]
    db_exists: bool,
    #[serde(skip)]
    pub(crate) ctrl: Weak<ControllerInner>,
}

impl PartialEq for Network {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.network_type == other.network_type
            && self.ipam_type == other.ipam_type
            && self.addr_space == other.addr_space
            && self.ipam_options == other.ipam_options
            && self.ipam_v4_config == other.ipam_v4_config
            && self.ipam_v6_config == other.ipam_v6_config
            && self.ipam_v4_info == other.ipam_v4_info
            && self.ipam_v6_info == other.ipam_v6_info
            && self.enable_ipv6 == other.enable_ipv6
            && self.post_ipv6 == other.post_ipv6
            && self.internal == other.internal
            && self.attachable == other.attachable
            && self.ingress == other.ingress
            && self.config_only == other.config_only
            && self.config_from == other.config_from
            && self.generic == other.generic
            && self.labels == other.labels
            && self.load_balancer_mode == other.load_balancer_mode
            && self.persist == other.persist
            && self.scope == other.scope
            && self.in_delete == other.in_delete
    }
}

impl KvObject for Network {
    fn key(&self) -> Vec<String> {
        vec![NETWORK_KEY.to_string(), self.id.clone()]
    }
    fn key_prefix(&self) -> Vec<String> {
        vec![NETWORK_KEY.to_string()]
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
    fn skip(&self) -> bool {
        !self.persist
    }
    fn data_scope(&self) -> DataScope {
        self.scope
    }
}

impl Network {
    pub(crate) fn from_options(
        ctrl: &Arc<ControllerInner>,
        network_type: &str,
        name: &str,
        id: String,
        options: &NetworkOptions,
    ) -> Self {
        let mut generic = options.generic.clone();
        generic
            .entry(netlabel::GENERIC_DATA.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        Self {
            id,
            name: name.to_string(),
            network_type: network_type.to_string(),
            ipam_type: options
                .ipam_type
                .clone()
                .unwrap_or_else(|| default_ipam_for(network_type).to_string()),
            addr_space: options.addr_space.clone(),
            ipam_options: options.ipam_options.clone(),
            ipam_v4_config: options.ipam_v4.clone(),
            ipam_v6_config: options.ipam_v6.clone(),
            ipam_v4_info: Vec::new(),
            ipam_v6_info: Vec::new(),
            enable_ipv6: options.enable_ipv6,
            post_ipv6: options.defer_ipv6,
            internal: options.internal,
            attachable: options.attachable,
            ingress: options.ingress,
            config_only: options.config_only,
            config_from: options.config_from.clone(),
            generic,
            labels: options.labels.clone(),
            load_balancer_mode: options.lb_mode,
            persist: options.persist.unwrap_or(true),
            scope: options.scope.unwrap_or_default(),
            in_delete: false,
            db_index: 0,
            db_exists: false,
            ctrl: Arc::downgrade(ctrl),
        }
    }

    pub(crate) fn attach(mut self, ctrl: &Arc<ControllerInner>) -> Self {
        self.ctrl = Arc::downgrade(ctrl);
        self
    }

    pub(crate) fn controller(&self) -> NetResult<Arc<ControllerInner>> {
        self.ctrl.upgrade().ok_or_else(|| NetError::NoService {
            message: "controller is stopped".to_string(),
        })
    }

    /// Network ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver name.
    #[must_use]
    pub fn network_type(&self) -> &str {
        &self.network_type
    }

    /// Data scope.
    #[must_use]
    pub const fn scope(&self) -> DataScope {
        self.scope
    }

    /// Whether the network has no outside connectivity.
    #[must_use]
    pub const fn internal(&self) -> bool {
        self.internal
    }

    /// Whether containers may be attached manually in swarm mode.
    #[must_use]
    pub const fn attachable(&self) -> bool {
        self.attachable
    }

    /// Whether this is the routing-mesh network.
    #[must_use]
    pub const fn ingress(&self) -> bool {
        self.ingress
    }

    /// Whether this network only holds configuration.
    #[must_use]
    pub const fn config_only(&self) -> bool {
        self.config_only
    }

    /// Config-only network this one takes its configuration from.
    #[must_use]
    pub fn config_from(&self) -> &str {
        &self.config_from
    }

    /// Whether IPv6 is enabled.
    #[must_use]
    pub const fn ipv6_enabled(&self) -> bool {
        self.enable_ipv6
    }

    /// User labels.
    #[must_use]
    pub const fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Options handed to the driver.
    #[must_use]
    pub const fn generic(&self) -> &GenericOptions {
        &self.generic
    }

    /// IPAM driver name.
    #[must_use]
    pub fn ipam_type(&self) -> &str {
        &self.ipam_type
    }

    /// Address space pools came from.
    #[must_use]
    pub fn addr_space(&self) -> &str {
        &self.addr_space
    }

    /// Pool configurations as requested, per family.
    #[must_use]
    pub fn ipam_config(&self) -> (&[IpamConfig], &[IpamConfig]) {
        (&self.ipam_v4_config, &self.ipam_v6_config)
    }

    /// Reserved pools, per family.
    #[must_use]
    pub fn ipam_info(&self) -> (&[IpamInfo], &[IpamInfo]) {
        (&self.ipam_v4_info, &self.ipam_v6_info)
    }

    /// Load-balancer mode.
    #[must_use]
    pub const fn load_balancer_mode(&self) -> LoadBalancerMode {
        self.load_balancer_mode
    }

    /// Whether the network is half deleted.
    #[must_use]
    pub const fn in_delete(&self) -> bool {
        self.in_delete
    }

    pub(crate) fn has_special_driver(&self) -> bool {
        matches!(self.network_type.as_str(), "host" | "null")
    }

    /// Create an endpoint on this network.
    ///
    /// # Errors
    ///
    /// Fails with [`NetError::InvalidName`] for a bad name,
    /// [`NetError::Forbidden`] on a config-only network or when the name is
    /// taken, and with whatever the IPAM, the driver or the store report.
    pub fn create_endpoint(&self, name: &str, options: EndpointOptions) -> NetResult<Endpoint> {
        netplane_common::id::validate_name(name)?;
        if self.config_only {
            return Err(NetError::forbidden(
                "cannot create endpoint on configuration-only network",
            ));
        }
        let ctrl = self.controller()?;
        // Held until the record is stored so the name check stays valid.
        let _guard = ctrl.network_lock(&self.id);
        if self.endpoint_by_name(name).is_ok() {
            return Err(NetError::forbidden(format!(
                "endpoint with name {name} already exists in network {}",
                self.name
            )));
        }
        endpoint::create(&ctrl, self, name, options)
    }

    /// Endpoints of this network, read from the store.
    pub fn endpoints(&self) -> NetResult<Vec<Endpoint>> {
        let ctrl = self.controller()?;
        ctrl.endpoints_of(self)
    }

    /// Call `f` on every endpoint until it returns `true`.
    pub fn walk_endpoints(&self, mut f: impl FnMut(&Endpoint) -> bool) -> NetResult<()> {
        for ep in self.endpoints()? {
            if f(&ep) {
                break;
            }
        }
        Ok(())
    }

    /// Endpoint named `name`.
    pub fn endpoint_by_name(&self, name: &str) -> NetResult<Endpoint> {
        if name.is_empty() {
            return Err(NetError::InvalidName {
                name: String::new(),
            });
        }
        self.endpoints()?
            .into_iter()
            .find(|ep| ep.name() == name)
            .ok_or_else(|| NetError::not_found("endpoint", name))
    }

    /// Endpoint with ID `id`.
    pub fn endpoint_by_id(&self, id: &str) -> NetResult<Endpoint> {
        if id.is_empty() {
            return Err(NetError::InvalidId { id: String::new() });
        }
        let ctrl = self.controller()?;
        ctrl.endpoint_from_store(self, id)
    }

    /// Delete the network. Refused while it has endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::ActiveEndpoints`] when endpoints remain and
    /// [`NetError::Forbidden`] when the driver refuses or a config-only
    /// network is still referenced.
    pub fn delete(&self) -> NetResult<()> {
        self.delete_with(false)
    }

    /// Delete the network even if endpoints remain or the driver fails.
    pub fn force_delete(&self) -> NetResult<()> {
        self.delete_with(true)
    }

    pub(crate) fn delete_with(&self, force: bool) -> NetResult<()> {
        let ctrl = self.controller()?;
        let _guard = ctrl.network_lock(&self.id);
        let mut n = ctrl.network_from_store(&self.id)?;
        let store = ctrl.store_for(n.scope)?.clone();

        if n.ingress && !force {
            return Err(NetError::ActiveEndpoints {
                name: n.name.clone(),
                id: n.id.clone(),
            });
        }
        let count = match EndpointCnt::load(&store, &n.id) {
            Ok(cnt) => cnt.count,
            Err(e) if e.is_not_found() => 0,
            Err(e) if force => {
                tracing::debug!(network = %n.name, error = %e, "Endpoint count unreadable");
                0
            }
            Err(e) => return Err(e),
        };
        if !force && count > 0 {
            if n.config_only {
                return Err(NetError::forbidden(format!(
                    "configuration network {:?} is in use",
                    n.name
                )));
            }
            return Err(NetError::ActiveEndpoints {
                name: n.name.clone(),
                id: n.id.clone(),
            });
        }

        n.in_delete = true;
        store.put_object_atomic(&mut n).map_err(|e| {
            NetError::internal(format!(
                "error marking network {} ({}) for removal: {e}",
                n.name, n.id
            ))
        })?;

        if !n.config_from.is_empty() {
            match ctrl.config_network(&n.config_from) {
                Ok(cfg) => {
                    let cfg_store = ctrl.store_for(cfg.scope)?;
                    if let Err(e) = EndpointCnt::decrement(cfg_store, &cfg.id) {
                        tracing::warn!(network = %cfg.name, error = %e, "Failed to release configuration network reference");
                    }
                }
                Err(e) => {
                    tracing::warn!(network = %n.config_from, error = %e, "Configuration network not found");
                }
            }
        }

        if !n.config_only {
            ctrl.cleanup_service_discovery(&n.id);
            if let Err(e) = n.delete_fabric(&ctrl) {
                if !force {
                    n.in_delete = false;
                    if let Err(e) = store.put_object_atomic(&mut n) {
                        tracing::warn!(network = %n.name, error = %e, "Failed to clear the delete mark");
                    }
                    return Err(e);
                }
                tracing::debug!(network = %n.name, error = %e, "Driver failed to delete stale network");
            }
        }

        let cnt = EndpointCnt::load(&store, &n.id);
        match cnt {
            Ok(cnt) => {
                if let Err(e) = store.delete_object_atomic(&cnt) {
                    if !force {
                        return Err(NetError::internal(format!(
                            "error deleting network endpoint count from store: {e}"
                        )));
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) if force => {
                tracing::debug!(network = %n.name, error = %e, "Endpoint count unreadable");
            }
            Err(e) => return Err(e),
        }
        store
            .delete_object_atomic(&n)
            .map_err(|e| NetError::internal(format!("error deleting network from store: {e}")))?;
        ctrl.forget_transient(&n.id);

        if !n.config_only {
            n.ipam_release(&ctrl);
        }
        tracing::info!(network = %n.name, id = %n.id, "Network deleted");
        Ok(())
    }

    fn delete_fabric(&self, ctrl: &ControllerInner) -> NetResult<()> {
        let (driver, _) = ctrl.drivers.get(&self.network_type)?;
        match driver.delete_network(&self.id) {
            Ok(()) => Ok(()),
            Err(e) if e.is_forbidden() => Err(e),
            Err(e) => {
                if !e.is_maskable() {
                    tracing::warn!(network = %self.name, error = %e, "Driver error deleting network");
                }
                Ok(())
            }
        }
    }

    /// Derive the address space from the driver's scope when none was
    /// given.
    fn derive_address_space(&self, ipam: &dyn Ipam, ctrl: &ControllerInner) -> NetResult<String> {
        let (local, global) = ipam.default_address_spaces()?;
        let cap = ctrl.drivers.capability(&self.network_type)?;
        Ok(if cap.data_scope == DataScope::Global {
            global
        } else {
            local
        })
    }

    /// Reserve pools, gateways and auxiliary addresses. On failure every
    /// reservation made so far is undone, newest first.
    pub(crate) fn ipam_allocate(&mut self, ctrl: &ControllerInner) -> NetResult<()> {
        if self.has_special_driver() {
            return Ok(());
        }
        let ipam = ctrl.ipams.get(&self.ipam_type)?;
        if self.addr_space.is_empty() {
            self.addr_space = self.derive_address_space(ipam.as_ref(), ctrl)?;
        }

        let mut undo = Vec::new();
        let result = self.ipam_allocate_versions(ipam.as_ref(), &mut undo);
        if let Err(e) = result {
            rollback(ipam.as_ref(), undo);
            self.ipam_v4_info.clear();
            self.ipam_v6_info.clear();
            return Err(e);
        }
        Ok(())
    }

    fn ipam_allocate_versions(&mut self, ipam: &dyn Ipam, undo: &mut Vec<Undo>) -> NetResult<()> {
        if self.ipam_v4_config.is_empty() {
            self.ipam_v4_config.push(IpamConfig::default());
        }
        let v4 = self.ipam_allocate_version(false, ipam, undo)?;
        self.ipam_v4_info = v4;

        if !self.enable_ipv6 {
            return Ok(());
        }
        if self.ipam_v6_config.is_empty() {
            self.ipam_v6_config.push(IpamConfig::default());
        }
        let v6 = self.ipam_allocate_version(true, ipam, undo)?;
        self.ipam_v6_info = v6;
        Ok(())
    }

    fn ipam_allocate_version(
        &self,
        v6: bool,
        ipam: &dyn Ipam,
        undo: &mut Vec<Undo>,
    ) -> NetResult<Vec<IpamInfo>> {
        let configs = if v6 { &self.ipam_v6_config } else { &self.ipam_v4_config };
        let mut infos = Vec::with_capacity(configs.len());

        for cfg in configs {
            cfg.validate()?;
            let request = PoolRequest {
                address_space: self.addr_space.clone(),
                pool: IpamConfig::parse_pool(&cfg.preferred_pool)?,
                sub_pool: IpamConfig::parse_pool(&cfg.sub_pool)?,
                options: self.ipam_options.clone(),
                v6,
            };
            let pool = ipam.request_pool(&request)?;
            undo.push(Undo::Pool(pool.id.clone()));
            tracing::debug!(network = %self.name, pool = %pool.pool, "Reserved address pool");

            let mut gateway = pool
                .meta
                .get(netlabel::GATEWAY)
                .and_then(|gw| gw.parse::<IpNetwork>().ok());

            if gateway.is_none() || !cfg.gateway.is_empty() {
                let preferred = if cfg.gateway.is_empty() {
                    None
                } else {
                    cfg.gateway.parse::<IpAddr>().ok()
                };
                let mut opts = IpamOptions::new();
                opts.insert(ipamapi::REQUEST_ADDRESS_TYPE.to_string(), netlabel::GATEWAY.to_string());
                let (addr, _) = ipam.request_address(&pool.id, preferred, &opts).map_err(|e| {
                    NetError::internal(format!("failed to allocate gateway ({}): {e}", cfg.gateway))
                })?;
                if let Some(addr) = addr {
                    undo.push(Undo::Address(pool.id.clone(), addr.ip()));
                }
                gateway = addr;
            }

            let mut aux_addresses = BTreeMap::new();
            for (name, value) in &cfg.aux_addresses {
                let ip: IpAddr = value.parse().map_err(|_| {
                    NetError::bad_request(format!(
                        "non parsable secondary ip address ({name}:{value}) passed for network {}",
                        self.name
                    ))
                })?;
                if !pool.pool.contains(ip) {
                    return Err(NetError::forbidden(format!(
                        "auxiliary address: ({name}:{value}) must belong to the master pool: {}",
                        pool.pool
                    )));
                }
                match ipam.request_address(&pool.id, Some(ip), &IpamOptions::new()) {
                    Ok((Some(addr), _)) => {
                        undo.push(Undo::Address(pool.id.clone(), addr.ip()));
                        aux_addresses.insert(name.clone(), addr);
                    }
                    Ok((None, _)) => {}
                    Err(NetError::IpOutOfRange { .. }) => {
                        tracing::warn!(
                            network = %self.name,
                            aux = %name,
                            ip = %ip,
                            "Auxiliary address outside the container sub-pool, not reserved"
                        );
                    }
                    Err(e) => {
                        return Err(NetError::internal(format!(
                            "failed to allocate secondary ip address ({name}:{value}): {e}"
                        )));
                    }
                }
            }

            infos.push(IpamInfo {
                pool_id: pool.id.clone(),
                meta: pool.meta.clone(),
                data: IpamData {
                    address_space: self.addr_space.clone(),
                    pool: pool.pool,
                    gateway,
                    aux_addresses,
                },
            });
        }
        Ok(infos)
    }

    /// Give every reservation back, newest first.
    pub(crate) fn ipam_release(&self, ctrl: &ControllerInner) {
        if self.has_special_driver() {
            return;
        }
        let ipam = match ctrl.ipams.get(&self.ipam_type) {
            Ok(ipam) => ipam,
            Err(e) => {
                tracing::warn!(network = %self.name, error = %e, "Cannot release addresses, IPAM missing");
                return;
            }
        };
        let mut undo = Vec::new();
        for info in self.ipam_v4_info.iter().chain(&self.ipam_v6_info) {
            undo.push(Undo::Pool(info.pool_id.clone()));
            if let Some(gw) = info.data.gateway {
                undo.push(Undo::Address(info.pool_id.clone(), gw.ip()));
            }
            for addr in info.data.aux_addresses.values() {
                undo.push(Undo::Address(info.pool_id.clone(), addr.ip()));
            }
        }
        rollback(ipam.as_ref(), undo);
    }

    /// Address data handed to the driver, per family.
    pub(crate) fn ipam_data(&self) -> (Vec<IpamData>, Vec<IpamData>) {
        (
            self.ipam_v4_info.iter().map(|i| i.data.clone()).collect(),
            self.ipam_v6_info.iter().map(|i| i.data.clone()).collect(),
        )
    }

    /// Copy configuration from config-only network `from`.
    pub(crate) fn apply_configuration_from(&mut self, from: &Self) {
        self.enable_ipv6 = from.enable_ipv6;
        self.labels.clone_from(&from.labels);
        self.ipam_type.clone_from(&from.ipam_type);
        self.ipam_options.clone_from(&from.ipam_options);
        self.ipam_v4_config.clone_from(&from.ipam_v4_config);
        self.ipam_v6_config.clone_from(&from.ipam_v6_config);
        if let Some(opts) = from.generic.get(netlabel::GENERIC_DATA) {
            self.generic
                .insert(netlabel::GENERIC_DATA.to_string(), opts.clone());
        }
        self.generic
            .insert(netlabel::ENABLE_IPV6.to_string(), serde_json::Value::Bool(self.enable_ipv6));
        self.generic
            .insert(netlabel::INTERNAL.to_string(), serde_json::Value::Bool(self.internal));
    }
}

/// A reservation to give back.
#[derive(Debug)]
enum Undo {
    Pool(String),
    Address(String, IpAddr),
}

fn rollback(ipam: &dyn Ipam, mut undo: Vec<Undo>) {
    while let Some(step) = undo.pop() {
        let result = match &step {
            Undo::Pool(id) => ipam.release_pool(id),
            Undo::Address(id, ip) => ipam.release_address(id, *ip),
        };
        if let Err(e) = result {
            tracing::warn!(step = ?step, error = %e, "Failed to release IPAM reservation");
        }
    }
}

pub(crate) fn validate_options(network_type: &str, options: &NetworkOptions) -> NetResult<()> {
    options.validate(network_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Network {
        Network {
            id: "n1".into(),
            name: "testnetwork".into(),
            network_type: "bridge".into(),
            ipam_type: "default".into(),
            addr_space: "LocalDefault".into(),
            ipam_options: IpamOptions::new(),
            ipam_v4_config: vec![IpamConfig::pool("192.168.100.0/24").with_gateway("192.168.100.1")],
            ipam_v6_config: vec![],
            ipam_v4_info: vec![IpamInfo {
                pool_id: "LocalDefault/192.168.100.0/24".into(),
                meta: IpamOptions::new(),
                data: IpamData {
                    address_space: "LocalDefault".into(),
                    pool: "192.168.100.0/24".parse().unwrap(),
                    gateway: Some("192.168.100.1/24".parse().unwrap()),
                    aux_addresses: BTreeMap::from([(
                        "dhcp".to_string(),
                        "192.168.100.250/24".parse().unwrap(),
                    )]),
                },
            }],
            ipam_v6_info: vec![],
            enable_ipv6: false,
            post_ipv6: false,
            internal: true,
            attachable: false,
            ingress: false,
            config_only: false,
            config_from: String::new(),
            generic: GenericOptions::from([(
                netlabel::GENERIC_DATA.to_string(),
                serde_json::json!({"BridgeName": "testnetwork"}),
            )]),
            labels: BTreeMap::new(),
            load_balancer_mode: LoadBalancerMode::Nat,
            persist: true,
            scope: DataScope::Local,
            in_delete: false,
            db_index: 0,
            db_exists: false,
            ctrl: Weak::new(),
        }
    }

    #[test]
    fn network_json_round_trip() {
        let n = sample();
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains(r#""networkType":"bridge""#));
        assert!(json.contains(r#""ipamV4Config""#));
        let back: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n);
    }

    #[test]
    fn ipam_info_is_flat() {
        let info = sample().ipam_v4_info.remove(0);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["PoolID"], "LocalDefault/192.168.100.0/24");
        assert_eq!(value["Pool"], "192.168.100.0/24");
        assert_eq!(value["Gateway"], "192.168.100.1/24");
        let back: IpamInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn gateway_must_parse() {
        assert!(IpamConfig::pool("10.0.0.0/24").with_gateway("10.0.0.1").validate().is_ok());
        let err = IpamConfig::pool("10.0.0.0/24").with_gateway("nope").validate().unwrap_err();
        assert_eq!(err.kind(), netplane_common::ErrorKind::BadRequest);
    }

    #[test]
    fn option_conflicts() {
        let bad = NetworkOptions::new().with_config_only().with_ingress(true);
        assert!(bad.validate("bridge").unwrap_err().is_forbidden());

        let bad = NetworkOptions::new().with_config_from("cfg").with_enable_ipv6(true);
        assert!(bad.validate("bridge").unwrap_err().is_forbidden());

        let bad = NetworkOptions::new()
            .with_config_from("cfg")
            .with_driver_opts(BTreeMap::from([("mtu".to_string(), "1400".to_string())]));
        assert!(bad.validate("bridge").unwrap_err().is_forbidden());

        let ok = NetworkOptions::new().with_config_from("cfg").with_attachable(true);
        assert!(ok.validate("bridge").is_ok());
    }

    #[test]
    fn generic_flags() {
        let opts = NetworkOptions::new().with_generic(GenericOptions::from([
            (netlabel::ENABLE_IPV6.to_string(), serde_json::Value::Bool(true)),
            (netlabel::INTERNAL.to_string(), serde_json::Value::Bool(true)),
        ]));
        assert!(opts.enable_ipv6);
        assert!(opts.internal);
    }

    #[test]
    fn default_ipam() {
        assert_eq!(default_ipam_for("bridge"), "default");
        assert_eq!(default_ipam_for("host"), "null");
    }
}
