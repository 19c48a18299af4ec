//! Per-network endpoint counter, stored apart from the network record so
//! count updates never collide with network edits.

use serde::{Deserialize, Serialize};

use netplane_common::{NetError, NetResult};

use crate::datastore::{DataScope, DataStore, KvObject, MAX_RETRIES};

/// Store collection of endpoint counters.
pub const ENDPOINT_COUNT_KEY: &str = "endpoint_count";

/// Number of endpoints a network has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCnt {
    /// Owning network.
    pub network_id: String,
    /// Endpoint count.
    pub count: u64,
    #[serde(skip)]
    scope: DataScope,
    #[serde(skip)]
    db_index: u64,
    #[serde(skip)]
    db_exists: bool,
}

impl EndpointCnt {
    /// A fresh zero counter for network `nid`.
    #[must_use]
    pub fn new(nid: &str, scope: DataScope) -> Self {
        Self {
            network_id: nid.to_string(),
            count: 0,
            scope,
            db_index: 0,
            db_exists: false,
        }
    }

    /// Read the counter of `nid`.
    pub fn load(store: &DataStore, nid: &str) -> NetResult<Self> {
        let mut cnt: Self = store
            .get_object(&[ENDPOINT_COUNT_KEY, nid])
            .map_err(|e| crate::datastore::not_found_as(e, "endpoint count", nid))?;
        cnt.scope = store.scope();
        Ok(cnt)
    }

    /// Add one endpoint.
    pub fn increment(store: &DataStore, nid: &str) -> NetResult<u64> {
        Self::update(store, nid, |cnt| {
            cnt.count += 1;
            Ok(())
        })
    }

    /// Remove one endpoint. The count never goes below zero.
    pub fn decrement(store: &DataStore, nid: &str) -> NetResult<u64> {
        Self::update(store, nid, |cnt| {
            cnt.count = cnt.count.saturating_sub(1);
            Ok(())
        })
    }

    /// Force the count, used when reconciling with the endpoints in the
    /// store.
    pub fn set(store: &DataStore, nid: &str, count: u64) -> NetResult<u64> {
        Self::update(store, nid, |cnt| {
            cnt.count = count;
            Ok(())
        })
    }

    fn update(
        store: &DataStore,
        nid: &str,
        mut f: impl FnMut(&mut Self) -> NetResult<()>,
    ) -> NetResult<u64> {
        for _ in 0..MAX_RETRIES {
            let mut cnt = Self::load(store, nid)?;
            f(&mut cnt)?;
            match store.put_object_atomic(&mut cnt) {
                Ok(()) => {
                    tracing::trace!(network = nid, count = cnt.count, "Endpoint count updated");
                    return Ok(cnt.count);
                }
                Err(e) if e.is_retry() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(NetError::Retry {
            message: format!("endpoint count of network {nid} kept changing"),
        })
    }
}

impl KvObject for EndpointCnt {
    fn key(&self) -> Vec<String> {
        vec![ENDPOINT_COUNT_KEY.to_string(), self.network_id.clone()]
    }
    fn key_prefix(&self) -> Vec<String> {
        vec![ENDPOINT_COUNT_KEY.to_string()]
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryStore;

    fn store() -> DataStore {
        DataStore::new(DataScope::Local, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn counts_up_and_down() {
        let ds = store();
        ds.put_object_atomic(&mut EndpointCnt::new("n1", DataScope::Local))
            .unwrap();
        assert_eq!(EndpointCnt::increment(&ds, "n1").unwrap(), 1);
        assert_eq!(EndpointCnt::increment(&ds, "n1").unwrap(), 2);
        assert_eq!(EndpointCnt::decrement(&ds, "n1").unwrap(), 1);
        assert_eq!(EndpointCnt::decrement(&ds, "n1").unwrap(), 0);
        assert_eq!(EndpointCnt::decrement(&ds, "n1").unwrap(), 0);
        assert_eq!(EndpointCnt::set(&ds, "n1", 4).unwrap(), 4);
        assert_eq!(EndpointCnt::load(&ds, "n1").unwrap().count, 4);
    }

    #[test]
    fn missing_counter() {
        let err = EndpointCnt::increment(&store(), "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let ds = store();
        ds.put_object_atomic(&mut EndpointCnt::new("n1", DataScope::Local))
            .unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ds = ds.clone();
                std::thread::spawn(move || {
                    let mut done = 0;
                    while done < 5 {
                        match EndpointCnt::increment(&ds, "n1") {
                            Ok(_) => done += 1,
                            Err(e) if e.is_retry() => {}
                            Err(e) => panic!("{e}"),
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(EndpointCnt::load(&ds, "n1").unwrap().count, 20);
    }

    #[test]
    fn record_format() {
        let cnt = EndpointCnt::new("n1", DataScope::Local);
        let json = serde_json::to_string(&cnt).unwrap();
        assert_eq!(json, r#"{"network_id":"n1","count":0}"#);
    }
}
