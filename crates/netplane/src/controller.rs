//! The controller: registry of drivers, networks and sandboxes.
//!
//! A [`Controller`] owns the stores and the registries. Networks and
//! endpoints live in the store and are read back on every operation;
//! sandboxes live in memory and are mirrored to the local store so they can
//! be restored or cleaned up after a restart.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use tokio::runtime::Runtime;

use netplane_common::id::{validate_id, validate_name};
use netplane_common::{NetError, NetResult, generate_id};
use netplane_network::osl::Namespace;

use crate::config::{ControllerConfig, LocalStoreKind};
use crate::datastore::{self, DataScope, DataStore, FileStore, KvObject, MemoryStore};
use crate::driverapi::{Capability, DiscoveryType, Driver, DriverRegistry};
use crate::drivers;
use crate::endpoint::{ENDPOINT_KEY, Endpoint};
use crate::endpoint_cnt::EndpointCnt;
use crate::external_key::ExternalKeyListener;
use crate::ipamapi::{self, Ipam, IpamRegistry};
use crate::ipams::{BuiltinIpam, NullIpam};
use crate::network::{self, NETWORK_KEY, Network, NetworkOptions};
use crate::sandbox::{self, GW_NETWORK, INGRESS_SANDBOX_ID, SANDBOX_KEY, Sandbox, SandboxOptions, SandboxRecord};
use crate::service::SvcInfo;
use crate::watch::NetWatchMap;

/// Name of the bind mount of the host namespace, shared by sandboxes using
/// the default namespace.
const DEFAULT_SANDBOX_KEY: &str = "default";

/// Worker threads serving embedded resolvers.
const RESOLVER_WORKERS: usize = 2;

/// Shared state behind a [`Controller`].
pub(crate) struct ControllerInner {
    pub(crate) id: String,
    pub(crate) config: ControllerConfig,
    pub(crate) drivers: DriverRegistry,
    pub(crate) ipams: IpamRegistry,
    local: DataStore,
    global: Option<DataStore>,
    swarm: Option<DataStore>,
    /// Service records by network ID.
    pub(crate) svc_records: Mutex<HashMap<String, SvcInfo>>,
    pub(crate) nmap: Mutex<NetWatchMap>,
    /// Sandboxes by sandbox ID.
    pub(crate) sandboxes: RwLock<HashMap<String, Sandbox>>,
    /// Networks that are never persisted.
    transient: DashMap<String, Network>,
    /// Joined endpoints: endpoint ID to sandbox ID.
    claims: DashMap<String, String>,
    network_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes network creation so names stay unique.
    create_lock: Mutex<()>,
    /// Serializes sandbox creation so container IDs stay unique.
    sandbox_lock: Mutex<()>,
    gw_network_lock: Mutex<()>,
    resolver_rt: OnceCell<Runtime>,
    default_os: OnceCell<Arc<Namespace>>,
    ext_key: Mutex<Option<ExternalKeyListener>>,
    pub(crate) self_ref: Weak<ControllerInner>,
}

impl fmt::Debug for ControllerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerInner")
            .field("id", &self.id)
            .field("drivers", &self.drivers.names())
            .field("sandboxes", &self.sandboxes.read().len())
            .finish_non_exhaustive()
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(rt) = self.resolver_rt.take() {
            rt.shutdown_background();
        }
    }
}

impl ControllerInner {
    fn handle(&self) -> NetResult<Arc<Self>> {
        self.self_ref.upgrade().ok_or_else(|| NetError::NoService {
            message: "controller is stopped".to_string(),
        })
    }

    /// Store holding objects of `scope`.
    pub(crate) fn store_for(&self, scope: DataScope) -> NetResult<&DataStore> {
        let store = match scope {
            DataScope::Local => Some(&self.local),
            DataScope::Global => self.global.as_ref(),
            DataScope::Swarm => self.swarm.as_ref(),
        };
        store.ok_or_else(|| NetError::NoService {
            message: format!("no datastore configured for scope {scope}"),
        })
    }

    fn stores(&self) -> impl Iterator<Item = &DataStore> {
        std::iter::once(&self.local)
            .chain(self.global.as_ref())
            .chain(self.swarm.as_ref())
    }

    /// Fresh copy of network `nid`.
    pub(crate) fn network_from_store(&self, nid: &str) -> NetResult<Network> {
        let ctrl = self.handle()?;
        if let Some(n) = self.transient.get(nid) {
            return Ok(n.clone().attach(&ctrl));
        }
        for store in self.stores() {
            match store.get_object::<Network>(&[NETWORK_KEY, nid]) {
                Ok(n) => return Ok(n.attach(&ctrl)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Err(NetError::not_found("network", nid))
    }

    /// Every network in every store.
    pub(crate) fn networks_from_store(&self) -> NetResult<Vec<Network>> {
        let ctrl = self.handle()?;
        let mut networks: Vec<Network> = self
            .transient
            .iter()
            .map(|n| n.value().clone().attach(&ctrl))
            .collect();
        for store in self.stores() {
            for n in store.list::<Network>(&[NETWORK_KEY])? {
                networks.push(n.attach(&ctrl));
            }
        }
        Ok(networks)
    }

    /// Fresh copy of endpoint `eid` of network `n`.
    pub(crate) fn endpoint_from_store(&self, n: &Network, eid: &str) -> NetResult<Endpoint> {
        let ctrl = self.handle()?;
        let ep: Endpoint = self
            .store_for(n.scope)?
            .get_object(&[ENDPOINT_KEY, &n.id, eid])
            .map_err(|e| datastore::not_found_as(e, "endpoint", eid))?;
        Ok(ep.attach(&ctrl, n))
    }

    /// Endpoints of network `n`.
    pub(crate) fn endpoints_of(&self, n: &Network) -> NetResult<Vec<Endpoint>> {
        let ctrl = self.handle()?;
        Ok(self
            .store_for(n.scope)?
            .list::<Endpoint>(&[ENDPOINT_KEY, &n.id])?
            .into_iter()
            .map(|ep| ep.attach(&ctrl, n))
            .collect())
    }

    pub(crate) fn network_by_name(&self, name: &str) -> NetResult<Network> {
        self.networks_from_store()?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| NetError::not_found("network", name))
    }

    /// Config-only network named `name`.
    pub(crate) fn config_network(&self, name: &str) -> NetResult<Network> {
        self.networks_from_store()?
            .into_iter()
            .find(|n| n.name == name && n.config_only)
            .ok_or_else(|| NetError::not_found("configuration network", name))
    }

    /// Lock serializing endpoint creation and deletion on network `nid`.
    pub(crate) fn network_lock(&self, nid: &str) -> ArcMutexGuard<RawMutex, ()> {
        let lock = Arc::clone(self.network_locks.entry(nid.to_string()).or_default().value());
        lock.lock_arc()
    }

    pub(crate) fn forget_transient(&self, nid: &str) {
        self.transient.remove(nid);
        self.network_locks.remove(nid);
    }

    fn put_network(&self, n: &mut Network) -> NetResult<()> {
        if n.persist {
            self.store_for(n.scope)?.put_object_atomic(n)
        } else {
            self.transient.insert(n.id.clone(), n.clone());
            Ok(())
        }
    }

    /// Record that `sbid` joins endpoint `eid`. Only one sandbox may hold an
    /// endpoint at a time.
    pub(crate) fn claim_endpoint(&self, eid: &str, sbid: &str) -> NetResult<()> {
        match self.claims.entry(eid.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(NetError::forbidden(
                "another container is attached to the same network endpoint",
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(sbid.to_string());
                Ok(())
            }
        }
    }

    /// Drop the claim of `sbid` on `eid`, if it holds one.
    pub(crate) fn release_claim(&self, eid: &str, sbid: &str) {
        self.claims.remove_if(eid, |_, holder| holder == sbid);
    }

    pub(crate) fn release_claim_any(&self, eid: &str) {
        self.claims.remove(eid);
    }

    pub(crate) fn sandbox_by_id(&self, id: &str) -> Option<Sandbox> {
        self.sandboxes.read().get(id).cloned()
    }

    pub(crate) fn sandbox_by_container_id(&self, container_id: &str) -> Option<Sandbox> {
        sandbox::by_container(&self.sandboxes.read(), container_id)
    }

    /// Drop `sb` from the registry unless another sandbox took its ID.
    pub(crate) fn forget_sandbox(&self, sb: &Sandbox) {
        let mut sandboxes = self.sandboxes.write();
        if sandboxes
            .get(sb.id())
            .is_some_and(|known| Arc::ptr_eq(&known.inner, &sb.inner))
        {
            sandboxes.remove(sb.id());
        }
    }

    /// Runtime serving embedded resolvers, started on first use.
    pub(crate) fn resolver_runtime(&self) -> NetResult<&Runtime> {
        self.resolver_rt.get_or_try_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(RESOLVER_WORKERS)
                .thread_name("netplane-resolver")
                .enable_all()
                .build()
                .map_err(|e| NetError::internal(format!("failed to start resolver runtime: {e}")))
        })
    }

    fn default_sandbox_key(&self) -> PathBuf {
        self.config.paths.netns_dir().join(DEFAULT_SANDBOX_KEY)
    }

    /// The host namespace, bound once and shared.
    fn default_os(&self) -> NetResult<Arc<Namespace>> {
        self.default_os
            .get_or_try_init(|| {
                Namespace::for_external_key(Path::new("/proc/self/ns/net"), &self.default_sandbox_key())
                    .map(Arc::new)
            })
            .cloned()
    }

    /// The gateway bridge network, created on first need.
    pub(crate) fn default_gw_network(self: &Arc<Self>) -> NetResult<Network> {
        let _guard = self.gw_network_lock.lock();
        match self.network_by_name(GW_NETWORK) {
            Ok(n) => Ok(n),
            Err(e) if e.is_not_found() => {
                tracing::info!(network = GW_NETWORK, "Creating default gateway network");
                self.new_network(
                    drivers::bridge::NETWORK_TYPE,
                    GW_NETWORK,
                    None,
                    sandbox::gw_network_options(),
                )
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn new_network(
        self: &Arc<Self>,
        network_type: &str,
        name: &str,
        id: Option<&str>,
        options: NetworkOptions,
    ) -> NetResult<Network> {
        if name.trim().is_empty() {
            return Err(NetError::InvalidName {
                name: name.to_string(),
            });
        }
        validate_name(name)?;
        let network_type = if network_type.is_empty() {
            self.config.default_driver.as_str()
        } else {
            network_type
        };
        if let Some(id) = id {
            validate_id(id)?;
        }

        let _create = self.create_lock.lock();
        if let Some(id) = id {
            if self.network_from_store(id).is_ok() {
                return Err(NetError::NetworkNameExists { name: id.to_string() });
            }
        }
        if self.network_by_name(name).is_ok() {
            return Err(NetError::NetworkNameExists {
                name: name.to_string(),
            });
        }
        network::validate_options(network_type, &options)?;

        let nid = id.map_or_else(generate_id, str::to_string);
        let mut n = Network::from_options(self, network_type, name, nid, &options);

        if n.config_only {
            n.scope = DataScope::Local;
            n.network_type = "null".to_string();
            self.store_network(&mut n)?;
            tracing::info!(network = %n.name, id = %n.id, "Configuration network created");
            return Ok(n);
        }

        let (driver, cap) = self.drivers.get(network_type)?;
        if options.scope == Some(DataScope::Local) && cap.data_scope == DataScope::Global {
            return Err(NetError::forbidden(format!(
                "cannot downgrade network scope for {network_type} networks"
            )));
        }
        if n.ingress && cap.data_scope != DataScope::Global {
            return Err(NetError::forbidden(
                "ingress network can only be global scope network",
            ));
        }
        if options.scope.is_none() {
            n.scope = cap.data_scope;
        }
        self.store_for(n.scope)?;

        let mut cfg = None;
        if !n.config_from.is_empty() {
            let from = self.config_network(&n.config_from).map_err(|_| {
                NetError::not_found("configuration network", n.config_from.clone())
            })?;
            n.apply_configuration_from(&from);
            cfg = Some(from);
        }

        n.ipam_allocate(self)?;
        let (v4, v6) = n.ipam_data();
        if let Err(e) = driver.create_network(&n.id, &n.generic, &v4, &v6) {
            if !e.is_maskable() {
                n.ipam_release(self);
                return Err(e);
            }
            tracing::debug!(network = %n.name, error = %e, "Driver reported a maskable error creating network");
        }

        let stored = self.store_network(&mut n).and_then(|()| match &cfg {
            Some(from) => EndpointCnt::increment(self.store_for(from.scope)?, &from.id).map(|_| ()),
            None => Ok(()),
        });
        if let Err(e) = stored {
            self.unstore_network(&n);
            if let Err(de) = driver.delete_network(&n.id) {
                tracing::warn!(network = %n.name, error = %de, "Couldn't roll back driver network after creation failure");
            }
            n.ipam_release(self);
            return Err(e);
        }

        tracing::info!(network = %n.name, id = %n.id, driver = %n.network_type, "Network created");
        Ok(n)
    }

    /// Write the endpoint counter, then the network, so a crash never
    /// leaves a network without its counter.
    fn store_network(&self, n: &mut Network) -> NetResult<()> {
        let store = self.store_for(n.scope)?;
        let mut cnt = EndpointCnt::new(&n.id, n.scope);
        store.put_object_atomic(&mut cnt)?;
        if let Err(e) = self.put_network(n) {
            if let Err(de) = store.delete_object(&cnt) {
                tracing::warn!(network = %n.name, error = %de, "Could not roll back endpoint count");
            }
            return Err(e);
        }
        Ok(())
    }

    fn unstore_network(&self, n: &Network) {
        self.forget_transient(&n.id);
        let Ok(store) = self.store_for(n.scope) else {
            return;
        };
        if let Ok(cnt) = EndpointCnt::load(store, &n.id) {
            if let Err(e) = store.delete_object(&cnt) {
                tracing::warn!(network = %n.name, error = %e, "Could not roll back endpoint count");
            }
        }
        if let Err(e) = store.delete_object(n) {
            tracing::warn!(network = %n.name, error = %e, "Could not roll back network record");
        }
    }

    fn new_sandbox(self: &Arc<Self>, container_id: &str, mut options: SandboxOptions) -> NetResult<Sandbox> {
        if container_id.is_empty() {
            return Err(NetError::invalid_parameter("invalid container ID"));
        }
        let _create = self.sandbox_lock.lock();
        if let Some(sb) = self.sandbox_by_container_id(container_id) {
            return Ok(sb);
        }

        let sbid = if options.ingress {
            if self.sandbox_by_id(INGRESS_SANDBOX_ID).is_some() {
                return Err(NetError::forbidden("ingress sandbox already present"));
            }
            INGRESS_SANDBOX_ID.to_string()
        } else {
            generate_id()
        };
        options.resolve_paths(self, &sbid);
        let key = if options.use_default_sandbox {
            self.default_sandbox_key()
        } else {
            self.config.paths.sandbox_key(&sbid)
        };
        let use_default = options.use_default_sandbox;
        let external = options.use_external_key;

        let sb = Sandbox::new(self, sbid, container_id, options, key.clone());
        sb.setup_resolution_files()?;

        if !external {
            let os = if use_default {
                self.default_os()?
            } else {
                Arc::new(Namespace::create(&key)?)
            };
            sb.inner.state.lock().os = Some(os);
        }

        self.sandboxes
            .write()
            .insert(sb.id().to_string(), sb.clone());
        sb.store_update();
        tracing::info!(sandbox = %sb.id(), container = container_id, key = %key.display(), "Sandbox created");
        Ok(sb)
    }

    /// Bring drivers back in sync with the networks in the store.
    fn restore_networks(&self) {
        let networks = match self.networks_from_store() {
            Ok(networks) => networks,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read networks on start");
                return;
            }
        };
        for n in networks {
            if n.config_only || n.in_delete {
                continue;
            }
            let driver = match self.drivers.get(&n.network_type) {
                Ok((driver, _)) => driver,
                Err(e) => {
                    tracing::warn!(network = %n.name, error = %e, "Driver of stored network missing");
                    continue;
                }
            };
            let (v4, v6) = n.ipam_data();
            if let Err(e) = driver.create_network(&n.id, &n.generic, &v4, &v6) {
                if !e.is_maskable() {
                    tracing::warn!(network = %n.name, driver = %n.network_type, error = %e, "Failed to populate network");
                }
            }
        }
    }

    /// Re-register the sandboxes of running containers and remove the
    /// others.
    fn restore_sandboxes(self: &Arc<Self>) {
        let records = match self.local.list::<SandboxRecord>(&[SANDBOX_KEY]) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read sandboxes on start");
                return;
            }
        };

        for record in records {
            let active = self.config.active_sandboxes.get(&record.container_id).cloned();
            let is_active = active.is_some();
            let mut options = active.unwrap_or_default();
            options.resolve_paths(self, &record.id);
            let key = if options.use_default_sandbox {
                self.default_sandbox_key()
            } else {
                self.config.paths.sandbox_key(&record.id)
            };
            let os = if options.use_default_sandbox {
                self.default_os().ok()
            } else {
                Namespace::restore(&key).ok().map(Arc::new)
            };

            let sb = Sandbox::new(self, record.id.clone(), &record.container_id, options, key);
            sb.inner.state.lock().os = os;
            self.sandboxes
                .write()
                .insert(sb.id().to_string(), sb.clone());
            sb.restore_from(self, &record);

            if !is_active {
                tracing::info!(sandbox = %sb.id(), container = %sb.container_id(), "Removing stale sandbox");
                if let Err(e) = sb.delete_with(true) {
                    tracing::warn!(sandbox = %sb.id(), error = %e, "Failed to delete stale sandbox");
                }
            }
        }
    }

    /// Remove local endpoints whose sandbox is gone and fix the endpoint
    /// counts.
    fn cleanup_local_endpoints(&self) {
        let networks = match self.networks_from_store() {
            Ok(networks) => networks,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read networks for endpoint cleanup");
                return;
            }
        };
        for n in networks {
            if n.scope != DataScope::Local || n.config_only {
                continue;
            }
            let eps = match self.endpoints_of(&n) {
                Ok(eps) => eps,
                Err(e) => {
                    tracing::warn!(network = %n.name, error = %e, "Could not list endpoints for cleanup");
                    continue;
                }
            };
            let mut remaining = 0u64;
            for ep in eps {
                if ep.sandbox_id.is_empty() || self.sandbox_by_id(&ep.sandbox_id).is_some() {
                    remaining += 1;
                    continue;
                }
                tracing::info!(network = %n.name, endpoint = %ep.name, "Removing stale endpoint");
                if let Err(e) = ep.delete(true) {
                    tracing::warn!(endpoint = %ep.name, error = %e, "Failed to delete stale endpoint");
                    remaining += 1;
                }
            }
            if let Err(e) = EndpointCnt::set(&self.local, &n.id, remaining) {
                tracing::warn!(network = %n.name, error = %e, "Could not reconcile endpoint count");
            }
        }
    }

    /// Finish deleting networks a crash left half deleted.
    fn cleanup_networks(&self) {
        let Ok(networks) = self.networks_from_store() else {
            return;
        };
        for n in networks.into_iter().filter(|n| n.in_delete) {
            tracing::info!(network = %n.name, id = %n.id, "Removing network left in delete state");
            if let Err(e) = n.delete_with(true) {
                tracing::warn!(network = %n.name, error = %e, "Failed to remove network");
            }
        }
    }

    fn stop(&self) {
        if let Some(mut listener) = self.ext_key.lock().take() {
            listener.stop();
        }
        let sandboxes: Vec<Sandbox> = self.sandboxes.read().values().cloned().collect();
        for sb in sandboxes {
            sb.stop_resolver();
        }
        // Dropping the watches closes their stop channels.
        self.nmap.lock().clear();
        for store in self.stores() {
            store.close();
        }
        tracing::info!(controller = %self.id, "Controller stopped");
    }
}

/// Entry point of the networking control plane.
#[derive(Debug, Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Open the stores, register the built-in drivers and IPAMs and bring
    /// state left by a previous run back in line.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened, a driver cannot be registered
    /// or the external key listener cannot bind.
    pub fn new(config: ControllerConfig) -> NetResult<Self> {
        config.paths.create_dirs()?;
        let kv: Arc<dyn datastore::KvStore> = match config.local_store {
            LocalStoreKind::File => Arc::new(FileStore::open(config.paths.local_store())?),
            LocalStoreKind::Memory => Arc::new(MemoryStore::new()),
        };
        let local = DataStore::new(DataScope::Local, kv);
        let global = config
            .global_store
            .clone()
            .map(|kv| DataStore::new(DataScope::Global, kv));
        let swarm = config
            .global_store
            .clone()
            .map(|kv| DataStore::new(DataScope::Swarm, kv));

        let inner = Arc::new_cyclic(|self_ref| ControllerInner {
            id: generate_id(),
            config,
            drivers: DriverRegistry::new(),
            ipams: IpamRegistry::new(),
            local,
            global,
            swarm,
            svc_records: Mutex::new(HashMap::new()),
            nmap: Mutex::new(NetWatchMap::new()),
            sandboxes: RwLock::new(HashMap::new()),
            transient: DashMap::new(),
            claims: DashMap::new(),
            network_locks: DashMap::new(),
            create_lock: Mutex::new(()),
            sandbox_lock: Mutex::new(()),
            gw_network_lock: Mutex::new(()),
            resolver_rt: OnceCell::new(),
            default_os: OnceCell::new(),
            ext_key: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        drivers::register_builtin(&inner.drivers, &inner.config)?;
        let builtin = BuiltinIpam::new(inner.local.clone(), inner.global.clone());
        inner.ipams.register(ipamapi::DEFAULT_IPAM, Arc::new(builtin))?;
        inner.ipams.register(ipamapi::NULL_IPAM, Arc::new(NullIpam))?;

        inner.restore_networks();
        inner.restore_sandboxes();
        inner.cleanup_local_endpoints();
        inner.cleanup_networks();

        if inner.config.enable_external_key {
            let path = inner.config.paths.external_key_socket(&inner.id);
            let listener = ExternalKeyListener::start(Arc::downgrade(&inner), &path)?;
            *inner.ext_key.lock() = Some(listener);
        }

        tracing::info!(controller = %inner.id, root = %inner.config.paths.root.display(), "Controller started");
        Ok(Self { inner })
    }

    /// Controller ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Configuration the controller runs with.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Register a network driver.
    ///
    /// # Errors
    ///
    /// [`NetError::Forbidden`] when the name is taken.
    pub fn register_driver(&self, name: &str, driver: Arc<dyn Driver>, capability: Capability) -> NetResult<()> {
        self.inner.drivers.register(name, driver, capability)
    }

    /// Register an IPAM driver.
    ///
    /// # Errors
    ///
    /// [`NetError::Forbidden`] when the name is taken.
    pub fn register_ipam(&self, name: &str, ipam: Arc<dyn Ipam>) -> NetResult<()> {
        self.inner.ipams.register(name, ipam)
    }

    /// Names of the registered drivers.
    #[must_use]
    pub fn drivers(&self) -> Vec<String> {
        self.inner.drivers.names()
    }

    /// Create a network of `network_type` (the default driver when empty).
    ///
    /// # Errors
    ///
    /// [`NetError::InvalidName`] for an empty or malformed name,
    /// [`NetError::NetworkNameExists`] for a taken name or ID,
    /// [`NetError::NotFound`] for an unknown driver or configuration
    /// network and [`NetError::Forbidden`] for conflicting options. IPAM,
    /// driver and store errors are returned after everything done so far
    /// is undone.
    pub fn new_network(
        &self,
        network_type: &str,
        name: &str,
        id: Option<&str>,
        options: NetworkOptions,
    ) -> NetResult<Network> {
        self.inner.new_network(network_type, name, id, options)
    }

    /// All networks.
    pub fn networks(&self) -> NetResult<Vec<Network>> {
        self.inner.networks_from_store()
    }

    /// Call `f` on every network until it returns `true`.
    pub fn walk_networks(&self, mut f: impl FnMut(&Network) -> bool) -> NetResult<()> {
        for n in self.networks()? {
            if f(&n) {
                break;
            }
        }
        Ok(())
    }

    /// Network named `name`.
    pub fn network_by_name(&self, name: &str) -> NetResult<Network> {
        if name.is_empty() {
            return Err(NetError::InvalidName {
                name: String::new(),
            });
        }
        self.inner.network_by_name(name)
    }

    /// Network with ID `id`.
    pub fn network_by_id(&self, id: &str) -> NetResult<Network> {
        if id.is_empty() {
            return Err(NetError::InvalidId { id: String::new() });
        }
        self.inner.network_from_store(id)
    }

    /// Sandbox of container `container_id`, created when it has none.
    ///
    /// # Errors
    ///
    /// [`NetError::InvalidParameter`] for an empty container ID,
    /// [`NetError::Forbidden`] for a second ingress sandbox, and namespace
    /// or file errors.
    pub fn new_sandbox(&self, container_id: &str, options: SandboxOptions) -> NetResult<Sandbox> {
        self.inner.new_sandbox(container_id, options)
    }

    /// Sandbox with ID `id`.
    pub fn sandbox_by_id(&self, id: &str) -> NetResult<Sandbox> {
        if id.is_empty() {
            return Err(NetError::InvalidId { id: String::new() });
        }
        self.inner
            .sandbox_by_id(id)
            .ok_or_else(|| NetError::not_found("sandbox", id))
    }

    /// Sandbox of container `container_id`.
    pub fn sandbox_by_container_id(&self, container_id: &str) -> NetResult<Sandbox> {
        if container_id.is_empty() {
            return Err(NetError::invalid_parameter("invalid id: id is empty"));
        }
        self.inner
            .sandbox_by_container_id(container_id)
            .ok_or_else(|| NetError::not_found("sandbox for container", container_id))
    }

    /// All sandboxes.
    #[must_use]
    pub fn sandboxes(&self) -> Vec<Sandbox> {
        self.inner.sandboxes.read().values().cloned().collect()
    }

    /// Call `f` on every sandbox until it returns `true`.
    pub fn walk_sandboxes(&self, mut f: impl FnMut(&Sandbox) -> bool) {
        for sb in self.sandboxes() {
            if f(&sb) {
                break;
            }
        }
    }

    /// Delete the sandbox of `container_id`. A missing sandbox is not an
    /// error.
    pub fn sandbox_destroy(&self, container_id: &str) -> NetResult<()> {
        match self.inner.sandbox_by_container_id(container_id) {
            Some(sb) => sb.delete(),
            None => Ok(()),
        }
    }

    /// Tell every driver that a discovery event appeared.
    pub fn discover_new(&self, kind: DiscoveryType, data: &serde_json::Value) {
        self.inner.drivers.walk(|name, driver, _| {
            if let Err(e) = driver.discover_new(kind, data) {
                tracing::warn!(driver = name, error = %e, "Driver failed to process discovery event");
            }
            false
        });
    }

    /// Tell every driver that a discovery event went away.
    pub fn discover_delete(&self, kind: DiscoveryType, data: &serde_json::Value) {
        self.inner.drivers.walk(|name, driver, _| {
            if let Err(e) = driver.discover_delete(kind, data) {
                tracing::warn!(driver = name, error = %e, "Driver failed to process discovery removal");
            }
            false
        });
    }

    /// Path of the external key socket, when the listener runs.
    #[must_use]
    pub fn external_key_socket(&self) -> Option<PathBuf> {
        self.inner
            .config
            .enable_external_key
            .then(|| self.inner.config.paths.external_key_socket(&self.inner.id))
    }

    /// Stop the external key listener, the resolvers and the network
    /// watches, and close the stores.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &tempfile::TempDir) -> Controller {
        Controller::new(
            ControllerConfig::default()
                .with_root(dir.path())
                .with_memory_store()
                .with_external_key(false),
        )
        .unwrap()
    }

    #[test]
    fn builtins_registered() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        assert_eq!(c.drivers(), ["bridge", "host", "null"]);
        assert!(c.inner.ipams.get(ipamapi::DEFAULT_IPAM).is_ok());
        assert!(c.inner.ipams.get(ipamapi::NULL_IPAM).is_ok());
    }

    #[test]
    fn network_name_rules() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        let err = c.new_network("null", "", None, NetworkOptions::new()).unwrap_err();
        assert!(matches!(err, NetError::InvalidName { .. }));

        c.new_network("null", "none", None, NetworkOptions::new()).unwrap();
        let err = c.new_network("host", "none", None, NetworkOptions::new()).unwrap_err();
        assert!(err.is_forbidden());

        let err = c.new_network("nosuch", "other", None, NetworkOptions::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn caller_chosen_id_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        let n = c.new_network("null", "none", Some("abc123"), NetworkOptions::new()).unwrap();
        assert_eq!(n.id(), "abc123");
        assert_eq!(c.network_by_id("abc123").unwrap().name(), "none");
        let err = c.new_network("host", "host", Some("abc123"), NetworkOptions::new()).unwrap_err();
        assert!(err.is_forbidden());
    }

    #[test]
    fn conflicting_options_are_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        let opts = NetworkOptions::new().with_config_only().with_ingress(true);
        assert!(c.new_network("bridge", "cfg", None, opts).unwrap_err().is_forbidden());
    }

    #[test]
    fn claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        c.inner.claim_endpoint("ep", "sb1").unwrap();
        assert!(c.inner.claim_endpoint("ep", "sb2").unwrap_err().is_forbidden());
        c.inner.release_claim("ep", "sb2");
        assert!(c.inner.claim_endpoint("ep", "sb2").is_err());
        c.inner.release_claim("ep", "sb1");
        c.inner.claim_endpoint("ep", "sb2").unwrap();
    }

    #[test]
    fn sandbox_per_container() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        assert!(c.new_sandbox("", SandboxOptions::new()).is_err());

        let sb = c
            .new_sandbox("c1", SandboxOptions::new().use_external_key())
            .unwrap();
        let again = c
            .new_sandbox("c1", SandboxOptions::new().use_external_key())
            .unwrap();
        assert_eq!(sb.id(), again.id());
        assert_eq!(c.sandbox_by_container_id("c1").unwrap().id(), sb.id());
        assert!(sb.hosts_path().exists());
        assert!(sb.resolv_conf_path().exists());

        c.sandbox_destroy("c1").unwrap();
        assert!(c.sandbox_by_id(sb.id()).unwrap_err().is_not_found());
        c.sandbox_destroy("c1").unwrap();
    }
}
