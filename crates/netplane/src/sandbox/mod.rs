//! Sandboxes: the network side of a container.
//!
//! A [`Sandbox`] owns a network namespace, the container's `/etc/hosts` and
//! `resolv.conf`, and the list of endpoints joined to it. The list is kept
//! ordered by gateway preference so the first entry that can route is the
//! container's default gateway.
//!
//! Three locks guard a sandbox. `config` holds the options, `state` the
//! endpoint list and namespace handle, and `gate` serialises whole join and
//! leave operations. The state lock is never held across calls into the
//! controller, so the resolver and hosts-file patching can always read it.

mod default_gw;
mod dns;
mod resolve;
mod store;

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};

use netplane_common::{GenericOptions, NetError, NetResult, PortBinding, TransportPort, netlabel};
use netplane_network::osl::{InterfaceOptions, InterfaceStatistics, Namespace};
use netplane_network::etchosts;

use crate::controller::ControllerInner;
use crate::endpoint::{Endpoint, JoinOptions};
use crate::network::Network;
use crate::resolver::{ExtDns, Resolver};

pub use default_gw::GW_NETWORK;
pub(crate) use default_gw::gw_network_options;
pub(crate) use store::{SANDBOX_KEY, SandboxRecord};

/// ID the ingress sandbox always gets.
pub const INGRESS_SANDBOX_ID: &str = "ingress_sbox";

/// An extra `/etc/hosts` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraHost {
    /// Host name.
    pub name: String,
    /// Address.
    pub ip: String,
}

/// A hosts entry to rewrite in another container's file when this one
/// joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentUpdate {
    /// Container whose file gets patched.
    pub container_id: String,
    /// Host name to repoint.
    pub name: String,
    /// New address.
    pub ip: String,
}

/// Options for [`crate::Controller::new_sandbox`].
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    pub(crate) hostname: String,
    pub(crate) domainname: String,
    pub(crate) hosts_path: Option<PathBuf>,
    pub(crate) origin_hosts_path: Option<PathBuf>,
    pub(crate) extra_hosts: Vec<ExtraHost>,
    pub(crate) parent_updates: Vec<ParentUpdate>,
    pub(crate) resolv_conf_path: Option<PathBuf>,
    pub(crate) origin_resolv_conf_path: Option<PathBuf>,
    pub(crate) dns: Vec<String>,
    pub(crate) dns_search: Vec<String>,
    pub(crate) dns_options: Vec<String>,
    pub(crate) use_default_sandbox: bool,
    pub(crate) use_external_key: bool,
    pub(crate) generic: GenericOptions,
    pub(crate) exposed_ports: Vec<TransportPort>,
    pub(crate) port_bindings: Vec<PortBinding>,
    pub(crate) ingress: bool,
}

impl SandboxOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Container host name.
    #[must_use]
    pub fn hostname(mut self, name: &str) -> Self {
        self.hostname = name.to_string();
        self
    }

    /// Container domain name.
    #[must_use]
    pub fn domainname(mut self, name: &str) -> Self {
        self.domainname = name.to_string();
        self
    }

    /// Where to write `/etc/hosts`.
    #[must_use]
    pub fn hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_path = Some(path.into());
        self
    }

    /// Copy the hosts file from `path` instead of generating one.
    #[must_use]
    pub fn origin_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.origin_hosts_path = Some(path.into());
        self
    }

    /// Add an extra hosts entry.
    #[must_use]
    pub fn extra_host(mut self, name: &str, ip: &str) -> Self {
        self.extra_hosts.push(ExtraHost {
            name: name.to_string(),
            ip: ip.to_string(),
        });
        self
    }

    /// Repoint `name` at `ip` in the hosts file of `container_id`.
    #[must_use]
    pub fn parent_update(mut self, container_id: &str, name: &str, ip: &str) -> Self {
        self.parent_updates.push(ParentUpdate {
            container_id: container_id.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
        });
        self
    }

    /// Where to write `resolv.conf`.
    #[must_use]
    pub fn resolv_conf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf_path = Some(path.into());
        self
    }

    /// Copy `resolv.conf` from `path` verbatim and never regenerate it.
    #[must_use]
    pub fn origin_resolv_conf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.origin_resolv_conf_path = Some(path.into());
        self
    }

    /// Add a user nameserver.
    #[must_use]
    pub fn dns(mut self, server: &str) -> Self {
        self.dns.push(server.to_string());
        self
    }

    /// Add a search domain.
    #[must_use]
    pub fn dns_search(mut self, domain: &str) -> Self {
        self.dns_search.push(domain.to_string());
        self
    }

    /// Add a resolver option.
    #[must_use]
    pub fn dns_option(mut self, option: &str) -> Self {
        self.dns_options.push(option.to_string());
        self
    }

    /// Share the host's namespace.
    #[must_use]
    pub const fn use_default_sandbox(mut self) -> Self {
        self.use_default_sandbox = true;
        self
    }

    /// Wait for the namespace to be provided through
    /// [`Sandbox::set_key`].
    #[must_use]
    pub const fn use_external_key(mut self) -> Self {
        self.use_external_key = true;
        self
    }

    /// Extra labels handed to drivers.
    #[must_use]
    pub fn generic(mut self, generic: GenericOptions) -> Self {
        self.generic.extend(generic);
        self
    }

    /// Ports the container exposes.
    #[must_use]
    pub fn exposed_ports(mut self, ports: Vec<TransportPort>) -> Self {
        if let Ok(value) = serde_json::to_value(&ports) {
            self.generic.insert(netlabel::EXPOSED_PORTS.to_string(), value);
        }
        self.exposed_ports = ports;
        self
    }

    /// Ports to publish on the host.
    #[must_use]
    pub fn port_mapping(mut self, bindings: Vec<PortBinding>) -> Self {
        if let Ok(value) = serde_json::to_value(&bindings) {
            self.generic.insert(netlabel::PORT_MAP.to_string(), value);
        }
        self.port_bindings = bindings;
        self
    }

    /// Mark the sandbox as the routing-mesh ingress sandbox.
    #[must_use]
    pub const fn ingress(mut self) -> Self {
        self.ingress = true;
        self
    }

    /// Fill in default file locations for sandbox `id`.
    pub(crate) fn resolve_paths(&mut self, ctrl: &ControllerInner, id: &str) {
        let dir = if self.ingress {
            ctrl.config.paths.network_files()
        } else {
            ctrl.config.sandbox_files(id)
        };
        if self.hosts_path.is_none() {
            self.hosts_path = Some(dir.join("hosts"));
        }
        if self.resolv_conf_path.is_none() {
            self.resolv_conf_path = Some(dir.join("resolv.conf"));
        }
    }
}

/// Order of endpoints for gateway election; the smallest rank wins.
///
/// Higher join priority first, then endpoints outside the gateway network,
/// then non-internal networks, then endpoints with more gateways (IPv6
/// counting double), and finally network and endpoint names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct GatewayRank {
    priority: Reverse<i32>,
    in_gw_network: bool,
    internal: bool,
    gateways: Reverse<u8>,
    network: String,
    endpoint: String,
}

/// An endpoint as seen by the sandbox it is joined to.
#[derive(Debug, Clone)]
pub(crate) struct SandboxEndpoint {
    pub(crate) ep: Endpoint,
    pub(crate) network_name: String,
    pub(crate) network_type: String,
    pub(crate) internal: bool,
    pub(crate) ingress: bool,
    pub(crate) ipv6: bool,
    pub(crate) multihost: bool,
    pub(crate) priority: i32,
    /// Interface name inside the namespace once populated.
    pub(crate) dst_name: Option<String>,
}

impl SandboxEndpoint {
    fn new(ep: &Endpoint, n: &Network, priority: i32, multihost: bool) -> Self {
        Self {
            ep: ep.clone(),
            network_name: n.name.clone(),
            network_type: n.network_type.clone(),
            internal: n.internal,
            ingress: n.ingress,
            ipv6: n.enable_ipv6 || !n.ipam_v6_info.is_empty(),
            multihost,
            priority,
            dst_name: None,
        }
    }

    pub(crate) fn in_gw_network(&self) -> bool {
        self.network_name == GW_NETWORK && self.ep.name.starts_with("gateway_")
    }

    fn special(&self) -> bool {
        matches!(self.network_type.as_str(), "null" | "host")
    }

    pub(crate) fn rank(&self) -> GatewayRank {
        GatewayRank {
            priority: Reverse(self.priority),
            in_gw_network: self.in_gw_network(),
            internal: self.internal,
            gateways: Reverse(self.ep.join_info.gateway_weight()),
            network: self.network_name.clone(),
            endpoint: self.ep.name.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SandboxState {
    pub(crate) key: PathBuf,
    pub(crate) os: Option<Arc<Namespace>>,
    /// Sorted by [`GatewayRank`].
    pub(crate) endpoints: Vec<SandboxEndpoint>,
    pub(crate) populated: HashSet<String>,
    pub(crate) in_delete: bool,
    pub(crate) ext_dns: Vec<ExtDns>,
    pub(crate) ndots_set: bool,
    pub(crate) db_index: u64,
    pub(crate) db_exists: bool,
}

impl SandboxState {
    fn sort(&mut self) {
        self.endpoints.sort_by_cached_key(SandboxEndpoint::rank);
    }

    fn find(&self, eid: &str) -> Option<&SandboxEndpoint> {
        self.endpoints.iter().find(|e| e.ep.id == eid)
    }

    /// The endpoint that provides the default gateway.
    fn gateway(&self) -> Option<&SandboxEndpoint> {
        self.endpoints
            .iter()
            .find(|e| !e.special() && e.ep.join_info.has_gateway_or_default_route())
    }
}

#[derive(Debug)]
pub(crate) struct SandboxInner {
    pub(crate) id: String,
    pub(crate) container_id: String,
    pub(crate) ctrl: Weak<ControllerInner>,
    pub(crate) config: RwLock<SandboxOptions>,
    pub(crate) state: Mutex<SandboxState>,
    /// Held for the whole of a join or leave.
    pub(crate) gate: Mutex<()>,
    pub(crate) resolver: Mutex<Option<Resolver>>,
}

/// The network stack of one container.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub(crate) inner: Arc<SandboxInner>,
}

impl Sandbox {
    pub(crate) fn new(
        ctrl: &Arc<ControllerInner>,
        id: String,
        container_id: &str,
        options: SandboxOptions,
        key: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                id,
                container_id: container_id.to_string(),
                ctrl: Arc::downgrade(ctrl),
                config: RwLock::new(options),
                state: Mutex::new(SandboxState {
                    key,
                    ..SandboxState::default()
                }),
                gate: Mutex::new(()),
                resolver: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn controller(&self) -> NetResult<Arc<ControllerInner>> {
        self.inner
            .ctrl
            .upgrade()
            .ok_or_else(|| NetError::internal("controller is gone"))
    }

    /// Sandbox ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// ID of the container the sandbox belongs to.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    /// Path of the namespace.
    #[must_use]
    pub fn key(&self) -> String {
        self.inner.state.lock().key.display().to_string()
    }

    /// Labels handed to drivers on join.
    #[must_use]
    pub fn labels(&self) -> GenericOptions {
        self.inner.config.read().generic.clone()
    }

    /// Location of the container's `/etc/hosts`.
    #[must_use]
    pub fn hosts_path(&self) -> PathBuf {
        self.inner.config.read().hosts_path.clone().unwrap_or_default()
    }

    /// Location of the container's `resolv.conf`.
    #[must_use]
    pub fn resolv_conf_path(&self) -> PathBuf {
        self.inner
            .config
            .read()
            .resolv_conf_path
            .clone()
            .unwrap_or_default()
    }

    pub(crate) fn is_ingress(&self) -> bool {
        self.inner.config.read().ingress
    }

    pub(crate) fn in_delete(&self) -> bool {
        self.inner.state.lock().in_delete
    }

    /// Joined endpoints, best gateway candidate first.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .state
            .lock()
            .endpoints
            .iter()
            .map(|e| e.ep.clone())
            .collect()
    }

    pub(crate) fn has_endpoint(&self, eid: &str) -> bool {
        self.inner.state.lock().find(eid).is_some()
    }

    /// Names the sandbox's endpoints on network `nid` answer to.
    pub(crate) fn endpoint_names_on(&self, nid: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .endpoints
            .iter()
            .filter(|e| e.ep.network_id == nid)
            .flat_map(|e| std::iter::once(e.ep.name.clone()).chain(e.ep.my_aliases.iter().cloned()))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<SandboxEndpoint> {
        self.inner.state.lock().endpoints.clone()
    }

    /// The endpoint providing the default route.
    pub(crate) fn gateway_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().gateway().map(|e| e.ep.clone())
    }

    pub(crate) fn add_endpoint(&self, ep: &Endpoint, n: &Network, priority: i32, multihost: bool) {
        let mut state = self.inner.state.lock();
        state.endpoints.retain(|e| e.ep.id != ep.id);
        state
            .endpoints
            .push(SandboxEndpoint::new(ep, n, priority, multihost));
        state.sort();
    }

    /// Replace the cached copy of `ep` after it changed in the store.
    pub(crate) fn refresh_endpoint(&self, ep: &Endpoint) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.endpoints.iter_mut().find(|e| e.ep.id == ep.id) {
            entry.ep = ep.clone();
        }
        state.sort();
    }

    fn namespace(&self) -> Option<Arc<Namespace>> {
        self.inner.state.lock().os.clone()
    }

    /// Move the interface of endpoint `eid` into the namespace and program
    /// its routes. A sandbox still waiting for its namespace is left alone.
    pub(crate) fn populate_network_resources(&self, eid: &str) -> NetResult<()> {
        let (os, entry, in_delete) = {
            let state = self.inner.state.lock();
            let Some(os) = state.os.clone() else {
                return Ok(());
            };
            let Some(entry) = state.find(eid).cloned() else {
                return Ok(());
            };
            (os, entry, state.in_delete)
        };
        let ep = &entry.ep;

        if ep.need_resolver() {
            self.start_resolver();
        }

        let mut dst_name = None;
        if !ep.iface.src_name.is_empty() {
            let options = interface_options(ep);
            let name = os
                .add_interface(&ep.iface.src_name, &ep.iface.dst_prefix, options)
                .map_err(|e| {
                    NetError::internal(format!(
                        "failed to add interface {} to sandbox: {e}",
                        ep.iface.src_name
                    ))
                })?;
            dst_name = Some(name);
        }

        for route in &ep.join_info.static_routes {
            if let Err(e) = os.add_static_route(route, None) {
                self.release_interface(&os, dst_name.as_deref(), &[]);
                return Err(NetError::internal(format!(
                    "failed to add static route {}: {e}",
                    route.destination
                )));
            }
        }

        let is_gateway = {
            let mut state = self.inner.state.lock();
            if let Some(e) = state.endpoints.iter_mut().find(|e| e.ep.id == eid) {
                e.dst_name = dst_name;
            }
            state.populated.insert(eid.to_string());
            state.gateway().is_some_and(|g| g.ep.id == eid)
        };
        if is_gateway {
            self.update_gateway(&os, Some(ep))?;
        }

        if !in_delete {
            self.store_update();
        }
        Ok(())
    }

    fn release_interface(&self, os: &Namespace, dst_name: Option<&str>, routes: &[netplane_common::StaticRoute]) {
        if let Some(dst) = dst_name {
            if let Err(e) = os.remove_interface(dst) {
                tracing::debug!(sandbox = %self.id(), interface = dst, error = %e, "Remove interface failed");
            }
        }
        for route in routes {
            if let Err(e) = os.remove_static_route(route, None) {
                tracing::debug!(sandbox = %self.id(), error = %e, "Remove static route failed");
            }
        }
    }

    /// Take endpoint `eid` out of the sandbox and release what it
    /// programmed in the namespace.
    pub(crate) fn clear_network_resources(&self, eid: &str) {
        let (os, removed, was_populated, old_gw, new_gw, in_delete) = {
            let mut state = self.inner.state.lock();
            let old_gw = state.gateway().map(|g| g.ep.id.clone());
            let Some(pos) = state.endpoints.iter().position(|e| e.ep.id == eid) else {
                return;
            };
            let removed = state.endpoints.remove(pos);
            let was_populated = state.populated.remove(eid);
            let new_gw = state.gateway().cloned();
            (state.os.clone(), removed, was_populated, old_gw, new_gw, state.in_delete)
        };

        if let Some(os) = &os {
            if was_populated {
                self.release_interface(os, removed.dst_name.as_deref(), &removed.ep.join_info.static_routes);
            }
            let new_id = new_gw.as_ref().map(|g| g.ep.id.clone());
            if new_id != old_gw {
                if let Some(gw) = &new_gw {
                    if let Err(e) = self.update_gateway(os, Some(&gw.ep)) {
                        tracing::warn!(sandbox = %self.id(), error = %e, "Failed to update gateway");
                    }
                }
            }
        }

        if !in_delete {
            self.store_update();
        }
    }

    fn update_gateway(&self, os: &Namespace, ep: Option<&Endpoint>) -> NetResult<()> {
        let _ = os.unset_gateway();
        let _ = os.unset_gateway_v6();
        let Some(ep) = ep else {
            return Ok(());
        };
        if let Some(gw) = ep.join_info.gw {
            os.set_gateway(gw)
                .map_err(|e| NetError::internal(format!("failed to set gateway while updating gateway: {e}")))?;
        }
        if let Some(gw6) = ep.join_info.gw6 {
            os.set_gateway_v6(gw6).map_err(|e| {
                NetError::internal(format!("failed to set IPv6 gateway while updating gateway: {e}"))
            })?;
        }
        Ok(())
    }

    /// Interface counters inside the namespace.
    pub fn statistics(&self) -> NetResult<BTreeMap<String, InterfaceStatistics>> {
        match self.namespace() {
            Some(os) => os.statistics(),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Adopt the namespace bound at `base_path` as the sandbox's own and
    /// populate it with the joined endpoints.
    ///
    /// # Errors
    ///
    /// [`NetError::BadRequest`] for an empty path; namespace errors
    /// otherwise.
    pub fn set_key(&self, base_path: &str) -> NetResult<()> {
        tracing::debug!(sandbox = %self.id(), path = base_path, "Setting sandbox key");
        if base_path.is_empty() {
            return Err(NetError::bad_request("invalid sandbox key"));
        }

        let (old, key) = {
            let mut state = self.inner.state.lock();
            (state.os.take(), state.key.clone())
        };
        if let Some(old) = &old {
            self.release_os(old);
        }

        let os = Arc::new(Namespace::for_external_key(Path::new(base_path), &key)?);
        let eids: Vec<String> = {
            let mut state = self.inner.state.lock();
            state.os = Some(Arc::clone(&os));
            state.populated.clear();
            state.endpoints.iter().map(|e| e.ep.id.clone()).collect()
        };

        if old.is_some() {
            let had_resolver = self.inner.resolver.lock().take().is_some();
            if had_resolver {
                self.start_resolver();
            }
        }

        for eid in eids {
            if let Err(e) = self.populate_network_resources(&eid) {
                self.inner.state.lock().os = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Undo what the endpoints programmed in `os` and destroy it.
    fn release_os(&self, os: &Namespace) {
        let entries = self.snapshot();
        for entry in &entries {
            self.release_interface(os, entry.dst_name.as_deref(), &entry.ep.join_info.static_routes);
        }
        if let Err(e) = os.destroy() {
            tracing::warn!(sandbox = %self.id(), error = %e, "Failed to destroy namespace");
        }
    }

    /// Rename every endpoint of the sandbox. Already renamed endpoints get
    /// their old names back when one fails.
    pub fn rename(&self, name: &str) -> NetResult<()> {
        let _gate = self.inner.gate.lock();
        let mut undo: Vec<(Endpoint, String)> = Vec::new();
        for entry in self.snapshot() {
            if entry.in_gw_network() {
                continue;
            }
            let old_name = entry.ep.name.clone();
            if let Err(e) = entry.ep.rename(name) {
                for (ep, old) in undo.into_iter().rev() {
                    if let Err(re) = ep.rename(&old) {
                        tracing::warn!(endpoint = %ep.id, error = %re, "Failed to restore endpoint name");
                    }
                }
                return Err(e);
            }
            undo.push((entry.ep, old_name));
        }
        Ok(())
    }

    /// Apply new options: leave every network, rebuild the resolution files
    /// and join again with the same priorities.
    pub fn refresh(&self, mut options: SandboxOptions) -> NetResult<()> {
        let ctrl = self.controller()?;
        let entries = self.snapshot();
        for entry in &entries {
            if let Err(e) = entry.ep.leave(self) {
                tracing::warn!(sandbox = %self.id(), endpoint = %entry.ep.name, error = %e, "Failed to leave during refresh");
            }
        }

        options.resolve_paths(&ctrl, self.id());
        *self.inner.config.write() = options;
        self.setup_resolution_files()?;

        for entry in entries {
            if entry.in_gw_network() {
                continue;
            }
            let opts = JoinOptions::new().with_priority(entry.priority);
            if let Err(e) = entry.ep.join(self, opts) {
                tracing::warn!(sandbox = %self.id(), endpoint = %entry.ep.name, error = %e, "Failed to rejoin during refresh");
            }
        }
        Ok(())
    }

    /// Leave and delete every endpoint, then release the sandbox.
    ///
    /// # Errors
    ///
    /// [`NetError::Forbidden`] while another delete runs. When endpoints on
    /// unreadable networks remain, the sandbox is kept on distributed
    /// control hosts and removed elsewhere, and an error reports it either
    /// way.
    pub fn delete(&self) -> NetResult<()> {
        self.delete_with(false)
    }

    pub(crate) fn delete_with(&self, force: bool) -> NetResult<()> {
        let ctrl = self.controller()?;
        {
            let mut state = self.inner.state.lock();
            if state.in_delete {
                return Err(NetError::forbidden("another sandbox delete in progress"));
            }
            state.in_delete = true;
        }

        let mut retain = false;
        for entry in self.snapshot() {
            if entry.in_gw_network() {
                continue;
            }
            let ep = &entry.ep;
            if let Err(e) = ctrl.network_from_store(&ep.network_id) {
                tracing::warn!(sandbox = %self.id(), endpoint = %ep.id, error = %e, "Network of endpoint unreadable during sandbox delete");
                retain = true;
                continue;
            }
            if !force {
                if let Err(e) = ep.leave(self) {
                    tracing::warn!(sandbox = %self.id(), endpoint = %ep.name, error = %e, "Failed detaching endpoint during sandbox delete");
                }
            }
            if let Err(e) = ep.delete(force) {
                tracing::warn!(sandbox = %self.id(), endpoint = %ep.name, error = %e, "Failed deleting endpoint during sandbox delete");
            }
        }

        let leftover = NetError::internal(format!(
            "could not cleanup all the endpoints in container {} / sandbox {}",
            self.container_id(),
            self.id()
        ));
        if retain && ctrl.config.distributed_control {
            self.inner.state.lock().in_delete = false;
            self.store_update();
            return Err(leftover);
        }

        etchosts::drop_lock(&self.hosts_path());
        self.stop_resolver();

        let os = self.inner.state.lock().os.take();
        if let Some(os) = os {
            if !self.inner.config.read().use_default_sandbox {
                if let Err(e) = os.destroy() {
                    tracing::warn!(sandbox = %self.id(), error = %e, "Failed to destroy namespace");
                }
            }
        }

        self.store_delete();
        ctrl.forget_sandbox(self);
        tracing::info!(sandbox = %self.id(), container = %self.container_id(), "Sandbox deleted");

        if retain { Err(leftover) } else { Ok(()) }
    }
}

fn interface_options(ep: &Endpoint) -> InterfaceOptions {
    let mut options = InterfaceOptions::default()
        .with_link_local(ep.iface.ll_addrs.clone())
        .with_routes(ep.iface.routes.clone());
    if let Some(addr) = ep.iface.addr {
        options = options.with_address(IpNetwork::V4(addr));
    }
    if let Some(addr) = ep.iface.addrv6 {
        options = options.with_address_v6(IpNetwork::V6(addr));
    }
    if let Some(mac) = ep.iface.mac {
        options = options.with_mac(mac);
    }
    options
}

/// Labels for programming external connectivity through `ep`: the
/// sandbox's, topped up with the endpoint's own port settings.
pub(crate) fn external_options(sb: &Sandbox, ep: &Endpoint) -> GenericOptions {
    let mut opts = sb.labels();
    for key in [netlabel::PORT_MAP, netlabel::EXPOSED_PORTS] {
        if !opts.contains_key(key) {
            if let Some(value) = ep.generic.get(key) {
                opts.insert(key.to_string(), value.clone());
            }
        }
    }
    opts
}

/// Whether joining `n` writes service records into the hosts file.
pub(crate) fn updates_hosts(n: &Network) -> bool {
    !n.ingress && !default_gw::is_gw_network(n)
}

/// The sandbox of `container_id` among `sandboxes`.
pub(crate) fn by_container(sandboxes: &HashMap<String, Sandbox>, container_id: &str) -> Option<Sandbox> {
    sandboxes
        .values()
        .find(|sb| sb.container_id() == container_id)
        .cloned()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;

    use super::*;
    use crate::endpoint_info::EndpointJoinInfo;

    fn entry(net: &str, ep: &str, priority: i32, internal: bool, gw: bool) -> SandboxEndpoint {
        let mut endpoint: Endpoint = serde_json::from_value(serde_json::json!({
            "id": format!("{net}-{ep}"),
            "name": ep,
        }))
        .unwrap();
        endpoint.join_info = EndpointJoinInfo {
            gw: gw.then_some(Ipv4Addr::new(10, 0, 0, 1)),
            ..EndpointJoinInfo::default()
        };
        SandboxEndpoint {
            ep: endpoint,
            network_name: net.to_string(),
            network_type: "bridge".to_string(),
            internal,
            ingress: false,
            ipv6: false,
            multihost: false,
            priority,
            dst_name: None,
        }
    }

    fn sorted(mut list: Vec<SandboxEndpoint>) -> Vec<String> {
        list.sort_by_cached_key(SandboxEndpoint::rank);
        list.into_iter().map(|e| e.network_name).collect()
    }

    #[test]
    fn higher_priority_wins() {
        let order = sorted(vec![entry("a", "x", 0, false, true), entry("b", "x", 10, false, true)]);
        assert_eq!(order, ["b", "a"]);
    }

    #[test]
    fn equal_priority_falls_back_to_network_name() {
        let order = sorted(vec![entry("zeta", "x", 0, false, true), entry("alpha", "x", 0, false, true)]);
        assert_eq!(order, ["alpha", "zeta"]);
    }

    #[test]
    fn internal_and_gateway_network_sink() {
        let mut gw = entry(GW_NETWORK, "gateway_abc", 0, false, true);
        gw.network_type = "bridge".to_string();
        let order = sorted(vec![
            gw,
            entry("internal", "x", 0, true, true),
            entry("plain", "x", 0, false, true),
        ]);
        assert_eq!(order, ["plain", "internal", GW_NETWORK]);
    }

    #[test]
    fn gateway_skips_routeless_and_special_endpoints() {
        let mut null = entry("none", "x", 100, false, true);
        null.network_type = "null".to_string();
        let mut state = SandboxState::default();
        state.endpoints = vec![null, entry("a", "x", 50, false, false), entry("b", "x", 0, false, true)];
        state.sort();
        assert_eq!(state.gateway().map(|g| g.network_name.as_str()), Some("b"));
    }

    proptest! {
        #[test]
        fn gateway_is_the_best_routable_endpoint(
            specs in prop::collection::vec((0i32..4, any::<bool>(), any::<bool>()), 1..8)
        ) {
            let list: Vec<SandboxEndpoint> = specs
                .iter()
                .enumerate()
                .map(|(i, (prio, internal, gw))| entry(&format!("net{i}"), "ep", *prio, *internal, *gw))
                .collect();
            let mut state = SandboxState::default();
            state.endpoints = list.clone();
            state.sort();

            let best = list
                .iter()
                .filter(|e| e.ep.join_info.has_gateway_or_default_route())
                .min_by_key(|e| e.rank());
            prop_assert_eq!(
                state.gateway().map(|g| g.network_name.clone()),
                best.map(|b| b.network_name.clone())
            );
            for pair in state.endpoints.windows(2) {
                prop_assert!(pair[0].priority >= pair[1].priority);
            }
        }
    }
}
