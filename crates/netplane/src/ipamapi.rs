//! Contract between the controller and address managers.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;

use netplane_common::{NetError, NetResult};

/// Name of the builtin IPAM.
pub const DEFAULT_IPAM: &str = "default";

/// Name of the IPAM that hands out nothing.
pub const NULL_IPAM: &str = "null";

/// Option key telling the IPAM what a requested address is for.
pub const REQUEST_ADDRESS_TYPE: &str = "RequestAddressType";

/// Meta and option maps exchanged with an IPAM.
pub type IpamOptions = BTreeMap<String, String>;

/// A pool reservation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolRequest {
    /// Address space to allocate from.
    pub address_space: String,
    /// Preferred master pool. `None` lets the IPAM pick.
    pub pool: Option<IpNetwork>,
    /// Range inside the pool that container addresses come from.
    pub sub_pool: Option<IpNetwork>,
    /// Driver-specific options.
    pub options: IpamOptions,
    /// Whether an IPv6 pool is wanted.
    pub v6: bool,
}

/// A reserved pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedPool {
    /// Opaque ID used for later calls.
    pub id: String,
    /// The master pool.
    pub pool: IpNetwork,
    /// Hints such as a preferred gateway.
    pub meta: IpamOptions,
}

/// An address manager.
pub trait Ipam: Send + Sync + fmt::Debug {
    /// Names of the local and the global default address spaces.
    fn default_address_spaces(&self) -> NetResult<(String, String)>;

    /// Reserve a pool.
    fn request_pool(&self, request: &PoolRequest) -> NetResult<AllocatedPool>;

    /// Release a pool reserved by [`Ipam::request_pool`].
    fn release_pool(&self, pool_id: &str) -> NetResult<()>;

    /// Reserve an address, the given one if any. Returns the address with
    /// the pool's prefix length, or `None` when the IPAM does not manage
    /// addresses.
    fn request_address(
        &self,
        pool_id: &str,
        ip: Option<IpAddr>,
        options: &IpamOptions,
    ) -> NetResult<(Option<IpNetwork>, IpamOptions)>;

    /// Return an address to its pool.
    fn release_address(&self, pool_id: &str, ip: IpAddr) -> NetResult<()>;

    /// Whether the IPAM ships with netplane.
    fn is_built_in(&self) -> bool {
        true
    }
}

/// IPAMs by name.
#[derive(Debug, Default)]
pub struct IpamRegistry {
    ipams: RwLock<BTreeMap<String, Arc<dyn Ipam>>>,
}

impl IpamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ipam` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Forbidden`] if the name is taken.
    pub fn register(&self, name: &str, ipam: Arc<dyn Ipam>) -> NetResult<()> {
        if name.is_empty() {
            return Err(NetError::invalid_parameter("ipam name must not be empty"));
        }
        let mut ipams = self.ipams.write();
        if ipams.contains_key(name) {
            return Err(NetError::forbidden(format!("ipam {name} already registered")));
        }
        tracing::debug!(ipam = name, "Registered IPAM");
        ipams.insert(name.to_string(), ipam);
        Ok(())
    }

    /// IPAM registered under `name`.
    pub fn get(&self, name: &str) -> NetResult<Arc<dyn Ipam>> {
        self.ipams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NetError::not_found("ipam", name))
    }
}
