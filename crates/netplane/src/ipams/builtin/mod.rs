//! Builtin address manager.
//!
//! Pools live in two address spaces, `LocalDefault` and `GlobalDefault`.
//! The per-space pool table and one allocation bitmap per master pool are
//! stored in the datastore and updated with compare-and-swap, so several
//! controllers sharing a global store agree on what is taken.

mod bitmap;
mod pools;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use netplane_common::types::{canonical, overlaps};
use netplane_common::{NetError, NetResult, netlabel};

use crate::datastore::{DataScope, DataStore, KvObject, MAX_RETRIES};
use crate::ipamapi::{AllocatedPool, Ipam, IpamOptions, PoolRequest, REQUEST_ADDRESS_TYPE};

pub use bitmap::Bitmap;

/// Address space for single-host networks.
pub const LOCAL_DEFAULT: &str = "LocalDefault";

/// Address space for multi-host networks.
pub const GLOBAL_DEFAULT: &str = "GlobalDefault";

/// Parsed form of a pool ID: `space/master[/sub]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolId {
    /// Address space.
    pub space: String,
    /// Master pool.
    pub master: IpNetwork,
    /// Container sub-pool, if any.
    pub sub: Option<IpNetwork>,
}

impl PoolId {
    fn master_key(&self) -> String {
        self.master.to_string()
    }

    fn key(&self) -> String {
        match self.sub {
            Some(sub) => format!("{}/{sub}", self.master),
            None => self.master_key(),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.space, self.key())
    }
}

impl FromStr for PoolId {
    type Err = NetError;

    fn from_str(s: &str) -> NetResult<Self> {
        let invalid = || NetError::InvalidPool { pool: s.to_string() };
        let parts: Vec<&str> = s.split('/').collect();
        let (space, master, sub) = match parts.as_slice() {
            [space, addr, len] => (*space, format!("{addr}/{len}"), None),
            [space, addr, len, sub_addr, sub_len] => {
                (*space, format!("{addr}/{len}"), Some(format!("{sub_addr}/{sub_len}")))
            }
            _ => return Err(invalid()),
        };
        if space.is_empty() {
            return Err(invalid());
        }
        let master = master.parse::<IpNetwork>().map_err(|_| invalid())?;
        let sub = sub
            .map(|s| s.parse::<IpNetwork>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self {
            space: space.to_string(),
            master,
            sub,
        })
    }
}

/// Ordinal bounds of a sub-pool inside its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct AddrRange {
    sub: IpNetwork,
    start: u64,
    end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    pool: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<AddrRange>,
    ref_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddrSpace {
    name: String,
    subnets: BTreeMap<String, PoolData>,
    #[serde(skip)]
    scope: DataScope,
    #[serde(skip)]
    db_index: u64,
    #[serde(skip)]
    db_exists: bool,
}

impl AddrSpace {
    fn new(name: &str, scope: DataScope) -> Self {
        Self {
            name: name.to_string(),
            subnets: BTreeMap::new(),
            scope,
            db_index: 0,
            db_exists: false,
        }
    }

    fn overlapping_master(&self, pool: &IpNetwork) -> Option<&PoolData> {
        self.subnets
            .values()
            .filter(|p| p.parent.is_none())
            .find(|p| overlaps(&p.pool, pool))
    }
}

impl KvObject for AddrSpace {
    fn key(&self) -> Vec<String> {
        vec!["ipam".into(), "builtin".into(), "config".into(), self.name.clone()]
    }
    fn key_prefix(&self) -> Vec<String> {
        vec!["ipam".into(), "builtin".into(), "config".into()]
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolBitmap {
    subnet: String,
    bitmap: Bitmap,
    #[serde(skip)]
    scope: DataScope,
    #[serde(skip)]
    db_index: u64,
    #[serde(skip)]
    db_exists: bool,
}

fn bitmap_key(subnet: &str) -> String {
    subnet.replace('/', "-")
}

impl KvObject for PoolBitmap {
    fn key(&self) -> Vec<String> {
        vec!["ipam".into(), "builtin".into(), "data".into(), bitmap_key(&self.subnet)]
    }
    fn key_prefix(&self) -> Vec<String> {
        vec!["ipam".into(), "builtin".into(), "data".into()]
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

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn ordinal(pool: &IpNetwork, ip: IpAddr) -> Option<u64> {
    if !pool.contains(ip) {
        return None;
    }
    u64::try_from(to_u128(ip) - to_u128(pool.network())).ok()
}

fn address_at(pool: &IpNetwork, ord: u64) -> Option<IpAddr> {
    let value = to_u128(pool.network()).checked_add(u128::from(ord))?;
    let ip = match pool {
        IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(u32::try_from(value).ok()?)),
        IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    };
    pool.contains(ip).then_some(ip)
}

fn host_bits(pool: &IpNetwork) -> u32 {
    let width: u32 = if pool.is_ipv4() { 32 } else { 128 };
    width - u32::from(pool.prefix())
}

fn new_bitmap(pool: &IpNetwork) -> Bitmap {
    let bits = host_bits(pool);
    let mut bm = Bitmap::new(bits);
    if pool.is_ipv6() || bits > 1 {
        bm.set(0);
    }
    if pool.is_ipv4() && bits > 1 {
        bm.set(bm.max_ordinal());
    }
    bm
}

fn sub_range(master: &IpNetwork, sub: &IpNetwork) -> NetResult<AddrRange> {
    let invalid = || NetError::InvalidPool {
        pool: format!("{sub} in {master}"),
    };
    if sub.is_ipv4() != master.is_ipv4() || sub.prefix() < master.prefix() || !master.contains(sub.network()) {
        return Err(invalid());
    }
    let start = ordinal(master, sub.network()).ok_or_else(invalid)?;
    let span = 1u128 << host_bits(sub).min(127);
    let last = u128::from(start) + span - 1;
    let end = u64::try_from(last).unwrap_or(u64::MAX);
    Ok(AddrRange {
        sub: *sub,
        start,
        end,
    })
}

/// The builtin IPAM.
#[derive(Debug)]
pub struct BuiltinIpam {
    local: DataStore,
    global: Option<DataStore>,
}

impl BuiltinIpam {
    /// Create an allocator persisting into `local` and, for the global
    /// space, into `global` when there is one.
    #[must_use]
    pub fn new(local: DataStore, global: Option<DataStore>) -> Self {
        Self { local, global }
    }

    fn store_for(&self, space: &str) -> NetResult<&DataStore> {
        match space {
            LOCAL_DEFAULT => Ok(&self.local),
            GLOBAL_DEFAULT => Ok(self.global.as_ref().unwrap_or(&self.local)),
            other => Err(NetError::not_found("address space", other)),
        }
    }

    fn read_space(&self, space: &str) -> NetResult<AddrSpace> {
        let ds = self.store_for(space)?;
        match ds.get_object::<AddrSpace>(&["ipam", "builtin", "config", space]) {
            Ok(mut aspace) => {
                aspace.scope = ds.scope();
                Ok(aspace)
            }
            Err(e) if e.is_not_found() => Ok(AddrSpace::new(space, ds.scope())),
            Err(e) => Err(e),
        }
    }

    fn update_space<R>(
        &self,
        space: &str,
        mut f: impl FnMut(&mut AddrSpace) -> NetResult<R>,
    ) -> NetResult<R> {
        let ds = self.store_for(space)?;
        for _ in 0..MAX_RETRIES {
            let mut aspace = self.read_space(space)?;
            let out = f(&mut aspace)?;
            match ds.put_object_atomic(&mut aspace) {
                Ok(()) => return Ok(out),
                Err(e) if e.is_retry() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(NetError::Retry {
            message: format!("address space {space} kept changing"),
        })
    }

    fn update_bitmap<R>(
        &self,
        space: &str,
        subnet: &str,
        mut f: impl FnMut(&mut Bitmap) -> NetResult<R>,
    ) -> NetResult<R> {
        let ds = self.store_for(space)?;
        let key = bitmap_key(subnet);
        for _ in 0..MAX_RETRIES {
            let mut stored: PoolBitmap = ds
                .get_object(&["ipam", "builtin", "data", &key])
                .map_err(|e| match e {
                    NetError::KeyNotFound { .. } => NetError::not_found("pool", subnet),
                    other => other,
                })?;
            let out = f(&mut stored.bitmap)?;
            match ds.put_object_atomic(&mut stored) {
                Ok(()) => return Ok(out),
                Err(e) if e.is_retry() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(NetError::Retry {
            message: format!("bitmap of {subnet} kept changing"),
        })
    }

    fn create_bitmap(&self, space: &str, pool: &IpNetwork) -> NetResult<()> {
        let ds = self.store_for(space)?;
        let subnet = pool.to_string();
        if ds.exists(&["ipam", "builtin", "data", &bitmap_key(&subnet)])? {
            return Ok(());
        }
        let mut stored = PoolBitmap {
            subnet,
            bitmap: new_bitmap(pool),
            scope: ds.scope(),
            db_index: 0,
            db_exists: false,
        };
        match ds.put_object_atomic(&mut stored) {
            // Someone else created it in between.
            Err(e) if e.is_retry() => Ok(()),
            other => other,
        }
    }

    fn delete_bitmap(&self, space: &str, pool: &IpNetwork) {
        let Ok(ds) = self.store_for(space) else {
            return;
        };
        let key = bitmap_key(&pool.to_string());
        if let Err(e) = ds.kv().delete(&crate::datastore::build_key(
            ds.scope(),
            &["ipam", "builtin", "data", &key],
        )) {
            if !e.is_not_found() {
                tracing::warn!(pool = %pool, error = %e, "Failed to delete pool bitmap");
            }
        }
    }

    fn predefined(space: &str) -> Box<dyn Iterator<Item = IpNetwork>> {
        if space == GLOBAL_DEFAULT {
            Box::new(pools::global().map(IpNetwork::V4))
        } else {
            Box::new(pools::local().map(IpNetwork::V4))
        }
    }
}

impl Ipam for BuiltinIpam {
    fn default_address_spaces(&self) -> NetResult<(String, String)> {
        Ok((LOCAL_DEFAULT.to_string(), GLOBAL_DEFAULT.to_string()))
    }

    fn request_pool(&self, request: &PoolRequest) -> NetResult<AllocatedPool> {
        let space = request.address_space.as_str();
        self.store_for(space)?;

        let Some(pool) = request.pool else {
            if request.sub_pool.is_some() {
                return Err(NetError::invalid_parameter("sub-pool requires a master pool"));
            }
            if request.v6 {
                return Err(NetError::NoAvailablePool { version: 6 });
            }
            let chosen = self.update_space(space, |aspace| {
                let candidate = Self::predefined(space)
                    .find(|candidate| aspace.overlapping_master(candidate).is_none())
                    .ok_or(NetError::NoAvailablePool { version: 4 })?;
                aspace.subnets.insert(
                    candidate.to_string(),
                    PoolData {
                        parent: None,
                        pool: candidate,
                        range: None,
                        ref_count: 1,
                    },
                );
                Ok(candidate)
            })?;
            self.create_bitmap(space, &chosen)?;
            let id = PoolId {
                space: space.to_string(),
                master: chosen,
                sub: None,
            };
            tracing::debug!(pool = %id, "Allocated predefined pool");
            return Ok(AllocatedPool {
                id: id.to_string(),
                pool: chosen,
                meta: IpamOptions::new(),
            });
        };

        let pool = canonical(pool);
        if pool.is_ipv6() != request.v6 {
            return Err(NetError::invalid_parameter(format!(
                "pool {pool} does not match the requested IP version"
            )));
        }
        let sub = request.sub_pool.map(canonical);
        let range = sub.map(|s| sub_range(&pool, &s)).transpose()?;
        let id = PoolId {
            space: space.to_string(),
            master: pool,
            sub,
        };

        let new_master = self.update_space(space, |aspace| {
            let master_key = id.master_key();
            let new_master = match aspace.subnets.get_mut(&master_key) {
                Some(master) => {
                    if sub.is_none() {
                        return Err(NetError::PoolOverlap {
                            pool: pool.to_string(),
                        });
                    }
                    master.ref_count += 1;
                    false
                }
                None => {
                    if let Some(other) = aspace.overlapping_master(&pool) {
                        tracing::debug!(pool = %pool, existing = %other.pool, "Pool overlaps");
                        return Err(NetError::PoolOverlap {
                            pool: pool.to_string(),
                        });
                    }
                    aspace.subnets.insert(
                        master_key.clone(),
                        PoolData {
                            parent: None,
                            pool,
                            range: None,
                            ref_count: 1,
                        },
                    );
                    true
                }
            };
            if sub.is_some() {
                aspace
                    .subnets
                    .entry(id.key())
                    .or_insert_with(|| PoolData {
                        parent: Some(master_key),
                        pool,
                        range,
                        ref_count: 0,
                    })
                    .ref_count += 1;
            }
            Ok(new_master)
        })?;

        if new_master {
            self.create_bitmap(space, &pool)?;
        }
        tracing::debug!(pool = %id, "Allocated pool");
        Ok(AllocatedPool {
            id: id.to_string(),
            pool,
            meta: IpamOptions::new(),
        })
    }

    fn release_pool(&self, pool_id: &str) -> NetResult<()> {
        let id: PoolId = pool_id.parse()?;
        let master_gone = self.update_space(&id.space, |aspace| {
            if id.sub.is_some() {
                let key = id.key();
                let child = aspace
                    .subnets
                    .get_mut(&key)
                    .ok_or_else(|| NetError::not_found("pool", pool_id))?;
                child.ref_count = child.ref_count.saturating_sub(1);
                if child.ref_count == 0 {
                    aspace.subnets.remove(&key);
                }
            }
            let master_key = id.master_key();
            let master = aspace
                .subnets
                .get_mut(&master_key)
                .ok_or_else(|| NetError::not_found("pool", pool_id))?;
            master.ref_count = master.ref_count.saturating_sub(1);
            if master.ref_count == 0 {
                aspace.subnets.remove(&master_key);
                return Ok(true);
            }
            Ok(false)
        })?;
        if master_gone {
            self.delete_bitmap(&id.space, &id.master);
        }
        tracing::debug!(pool = %pool_id, "Released pool");
        Ok(())
    }

    fn request_address(
        &self,
        pool_id: &str,
        ip: Option<IpAddr>,
        options: &IpamOptions,
    ) -> NetResult<(Option<IpNetwork>, IpamOptions)> {
        let id: PoolId = pool_id.parse()?;
        let aspace = self.read_space(&id.space)?;
        let data = aspace
            .subnets
            .get(&id.key())
            .ok_or_else(|| NetError::not_found("pool", pool_id))?;
        let master = data.pool;
        let is_gateway =
            options.get(REQUEST_ADDRESS_TYPE).map(String::as_str) == Some(netlabel::GATEWAY);

        let ord = self.update_bitmap(&id.space, &id.master_key(), |bm| {
            let (start, end) = data
                .range
                .map_or((0, bm.max_ordinal()), |r| (r.start, r.end));
            match ip {
                Some(ip) => {
                    let out_of_range = || NetError::IpOutOfRange { ip: ip.to_string() };
                    let ord = ordinal(&master, ip)
                        .filter(|o| *o <= bm.max_ordinal())
                        .ok_or_else(out_of_range)?;
                    if !is_gateway && (ord < start || ord > end) {
                        return Err(out_of_range());
                    }
                    if !bm.set(ord) {
                        return Err(NetError::IpAlreadyAllocated { ip: ip.to_string() });
                    }
                    Ok(ord)
                }
                None => {
                    let ord = bm.first_free(start, end).ok_or_else(|| NetError::NoAvailableIps {
                        pool: pool_id.to_string(),
                    })?;
                    bm.set(ord);
                    Ok(ord)
                }
            }
        })?;

        let addr = address_at(&master, ord)
            .ok_or_else(|| NetError::internal(format!("ordinal {ord} outside {master}")))?;
        let net = IpNetwork::new(addr, master.prefix())?;
        tracing::trace!(pool = %pool_id, address = %net, "Allocated address");
        Ok((Some(net), IpamOptions::new()))
    }

    fn release_address(&self, pool_id: &str, ip: IpAddr) -> NetResult<()> {
        let id: PoolId = pool_id.parse()?;
        let ord = ordinal(&id.master, ip).ok_or_else(|| NetError::IpOutOfRange {
            ip: ip.to_string(),
        })?;
        self.update_bitmap(&id.space, &id.master_key(), |bm| {
            bm.unset(ord);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryStore;

    fn ipam() -> BuiltinIpam {
        BuiltinIpam::new(DataStore::new(DataScope::Local, Arc::new(MemoryStore::new())), None)
    }

    fn request(pool: Option<&str>, sub: Option<&str>) -> PoolRequest {
        PoolRequest {
            address_space: LOCAL_DEFAULT.to_string(),
            pool: pool.map(|p| p.parse().unwrap()),
            sub_pool: sub.map(|s| s.parse().unwrap()),
            v6: pool.is_some_and(|p| p.contains(':')),
            ..PoolRequest::default()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn pool_ids() {
        let id: PoolId = "LocalDefault/10.0.0.0/16/10.0.1.0/24".parse().unwrap();
        assert_eq!(id.master.to_string(), "10.0.0.0/16");
        assert_eq!(id.sub.unwrap().to_string(), "10.0.1.0/24");
        assert_eq!(id.to_string(), "LocalDefault/10.0.0.0/16/10.0.1.0/24");
        assert!("LocalDefault/10.0.0.0".parse::<PoolId>().is_err());
        assert!("/10.0.0.0/8".parse::<PoolId>().is_err());
    }

    #[test]
    fn predefined_pools_in_order() {
        let ipam = ipam();
        let a = ipam.request_pool(&request(None, None)).unwrap();
        let b = ipam.request_pool(&request(None, None)).unwrap();
        assert_eq!(a.pool.to_string(), "172.17.0.0/16");
        assert_eq!(b.pool.to_string(), "172.18.0.0/16");
        assert_eq!(a.id, "LocalDefault/172.17.0.0/16");

        ipam.release_pool(&a.id).unwrap();
        let c = ipam.request_pool(&request(None, None)).unwrap();
        assert_eq!(c.pool, a.pool);
    }

    #[test]
    fn predefined_skips_user_pools() {
        let ipam = ipam();
        ipam.request_pool(&request(Some("172.17.5.0/24"), None)).unwrap();
        let auto = ipam.request_pool(&request(None, None)).unwrap();
        assert_eq!(auto.pool.to_string(), "172.18.0.0/16");
    }

    #[test]
    fn v6_needs_explicit_pool() {
        let ipam = ipam();
        let req = PoolRequest {
            address_space: LOCAL_DEFAULT.to_string(),
            v6: true,
            ..PoolRequest::default()
        };
        assert!(matches!(
            ipam.request_pool(&req).unwrap_err(),
            NetError::NoAvailablePool { version: 6 }
        ));
    }

    #[test]
    fn overlap_rules() {
        let ipam = ipam();
        ipam.request_pool(&request(Some("10.10.0.0/16"), None)).unwrap();
        assert!(matches!(
            ipam.request_pool(&request(Some("10.10.0.0/16"), None)).unwrap_err(),
            NetError::PoolOverlap { .. }
        ));
        assert!(matches!(
            ipam.request_pool(&request(Some("10.10.4.0/24"), None)).unwrap_err(),
            NetError::PoolOverlap { .. }
        ));
        // A sub-pool of an existing master is fine.
        ipam.request_pool(&request(Some("10.10.0.0/16"), Some("10.10.1.0/24")))
            .unwrap();
        let err = ipam
            .request_pool(&request(Some("10.20.0.0/16"), Some("10.30.0.0/24")))
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidPool { .. }));
    }

    #[test]
    fn reserves_network_and_broadcast() {
        let ipam = ipam();
        let pool = ipam.request_pool(&request(Some("192.168.100.0/30"), None)).unwrap();
        let opts = IpamOptions::new();
        let (a, _) = ipam.request_address(&pool.id, None, &opts).unwrap();
        let (b, _) = ipam.request_address(&pool.id, None, &opts).unwrap();
        assert_eq!(a.unwrap().to_string(), "192.168.100.1/30");
        assert_eq!(b.unwrap().to_string(), "192.168.100.2/30");
        assert!(matches!(
            ipam.request_address(&pool.id, None, &opts).unwrap_err(),
            NetError::NoAvailableIps { .. }
        ));
        assert!(matches!(
            ipam.request_address(&pool.id, Some(ip("192.168.100.3")), &opts).unwrap_err(),
            NetError::IpAlreadyAllocated { .. }
        ));

        ipam.release_address(&pool.id, ip("192.168.100.1")).unwrap();
        let (again, _) = ipam.request_address(&pool.id, None, &opts).unwrap();
        assert_eq!(again.unwrap().ip(), ip("192.168.100.1"));
    }

    #[test]
    fn sub_pool_confines_allocation() {
        let ipam = ipam();
        let pool = ipam
            .request_pool(&request(Some("172.28.0.0/16"), Some("172.28.5.0/24")))
            .unwrap();
        assert_eq!(pool.id, "LocalDefault/172.28.0.0/16/172.28.5.0/24");
        let opts = IpamOptions::new();

        let (first, _) = ipam.request_address(&pool.id, None, &opts).unwrap();
        assert_eq!(first.unwrap().to_string(), "172.28.5.0/16");

        let err = ipam
            .request_address(&pool.id, Some(ip("172.28.9.9")), &opts)
            .unwrap_err();
        assert!(matches!(err, NetError::IpOutOfRange { .. }));

        let mut gw = IpamOptions::new();
        gw.insert(REQUEST_ADDRESS_TYPE.to_string(), netlabel::GATEWAY.to_string());
        let (gateway, _) = ipam
            .request_address(&pool.id, Some(ip("172.28.0.1")), &gw)
            .unwrap();
        assert_eq!(gateway.unwrap().to_string(), "172.28.0.1/16");

        let err = ipam
            .request_address(&pool.id, Some(ip("10.0.0.1")), &gw)
            .unwrap_err();
        assert!(matches!(err, NetError::IpOutOfRange { .. }));
    }

    #[test]
    fn release_drops_bitmap_with_last_reference() {
        let store = DataStore::new(DataScope::Local, Arc::new(MemoryStore::new()));
        let ipam = BuiltinIpam::new(store.clone(), None);
        let master = ipam.request_pool(&request(Some("10.1.0.0/16"), None)).unwrap();
        let child = ipam
            .request_pool(&request(Some("10.1.0.0/16"), Some("10.1.1.0/24")))
            .unwrap();
        ipam.release_pool(&master.id).unwrap();
        assert!(store.exists(&["ipam", "builtin", "data", "10.1.0.0-16"]).unwrap());
        ipam.release_pool(&child.id).unwrap();
        assert!(!store.exists(&["ipam", "builtin", "data", "10.1.0.0-16"]).unwrap());
        assert!(ipam.release_pool(&child.id).unwrap_err().is_not_found());
    }

    #[test]
    fn v6_pool_addresses() {
        let ipam = ipam();
        let pool = ipam.request_pool(&request(Some("fe90::/64"), None)).unwrap();
        let (a, _) = ipam.request_address(&pool.id, None, &IpamOptions::new()).unwrap();
        assert_eq!(a.unwrap().to_string(), "fe90::1/64");
        let (b, _) = ipam
            .request_address(&pool.id, Some(ip("fe90::aabb:ccdd:eeff")), &IpamOptions::new())
            .unwrap();
        assert_eq!(b.unwrap().prefix(), 64);
    }

    #[test]
    fn unknown_space() {
        let ipam = ipam();
        let req = PoolRequest {
            address_space: "Nowhere".to_string(),
            ..PoolRequest::default()
        };
        assert!(ipam.request_pool(&req).unwrap_err().is_not_found());
    }
}
