//! Scoped key-value persistence with optimistic concurrency.
//!
//! Objects are stored as JSON under `/netplane/<scope>/<kind>/<ids...>`.
//! Every write bumps a store-wide index; [`DataStore::put_object_atomic`]
//! only succeeds when the object's index still matches the stored one.

mod file;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use netplane_common::{NetError, NetResult};

pub use file::FileStore;
pub use memory::MemoryStore;

/// First component of every key.
pub const ROOT_PREFIX: &str = "netplane";

/// How many times read-modify-write loops retry a CAS collision.
pub const MAX_RETRIES: usize = 8;

/// Visibility of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataScope {
    /// This host only.
    #[default]
    Local,
    /// Shared by every host of a cluster.
    Global,
    /// Managed by an orchestrator.
    Swarm,
}

impl DataScope {
    /// Lowercase name used in keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::Swarm => "swarm",
        }
    }
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value and the index of its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Full key.
    pub key: String,
    /// Raw value.
    pub value: Vec<u8>,
    /// Store index of the last write.
    pub last_index: u64,
}

/// Engine contract for a key-value back-end.
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Read one key.
    fn get(&self, key: &str) -> NetResult<KvPair>;

    /// Write one key unconditionally.
    fn put(&self, key: &str, value: &[u8]) -> NetResult<u64>;

    /// Whether a key exists.
    fn exists(&self, key: &str) -> NetResult<bool>;

    /// Every pair whose key lives under `prefix`.
    fn list(&self, prefix: &str) -> NetResult<Vec<KvPair>>;

    /// Remove one key. Missing keys yield [`NetError::KeyNotFound`].
    fn delete(&self, key: &str) -> NetResult<()>;

    /// Compare-and-swap write. `previous == None` requires the key to be
    /// absent; otherwise the stored index must equal `previous`. Returns the
    /// new index.
    fn atomic_put(&self, key: &str, value: &[u8], previous: Option<u64>) -> NetResult<u64>;

    /// Compare-and-swap delete.
    fn atomic_delete(&self, key: &str, previous: u64) -> NetResult<()>;

    /// Stream the full content under `prefix`: once right away, then after
    /// every change, until `stop` fires or is dropped.
    fn watch_tree(&self, prefix: &str, stop: Receiver<()>) -> NetResult<Receiver<Vec<KvPair>>>;

    /// Release resources.
    fn close(&self);
}

/// An object that can be persisted in a [`DataStore`].
pub trait KvObject: Serialize + DeserializeOwned + Send {
    /// Key components, kind first.
    fn key(&self) -> Vec<String>;

    /// Key components of the collection this object belongs to.
    fn key_prefix(&self) -> Vec<String>;

    /// Index of the stored version this object was read from.
    fn index(&self) -> u64;

    /// Record the stored index.
    fn set_index(&mut self, index: u64);

    /// Whether the object was read from, or written to, the store.
    fn exists(&self) -> bool;

    /// Mark the object as stored.
    fn set_exists(&mut self);

    /// Objects that must never be written.
    fn skip(&self) -> bool {
        false
    }

    /// Scope of the store the object lives in.
    fn data_scope(&self) -> DataScope;
}

/// Build a full key from components.
#[must_use]
pub fn build_key(scope: DataScope, parts: &[&str]) -> String {
    let mut key = format!("/{ROOT_PREFIX}/{scope}");
    for part in parts {
        key.push('/');
        key.push_str(part);
    }
    key
}

/// A scoped view on a [`KvStore`].
#[derive(Debug, Clone)]
pub struct DataStore {
    scope: DataScope,
    store: Arc<dyn KvStore>,
}

impl DataStore {
    /// Wrap a back-end.
    #[must_use]
    pub fn new(scope: DataScope, store: Arc<dyn KvStore>) -> Self {
        Self { scope, store }
    }

    /// Scope of this store.
    #[must_use]
    pub const fn scope(&self) -> DataScope {
        self.scope
    }

    /// The underlying back-end.
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn key_of(&self, parts: &[String]) -> String {
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        build_key(self.scope, &parts)
    }

    /// Read and decode the object stored under `parts`.
    pub fn get_object<T: KvObject>(&self, parts: &[&str]) -> NetResult<T> {
        let pair = self.store.get(&build_key(self.scope, parts))?;
        decode(&pair)
    }

    /// CAS write of `obj`, updating its index on success.
    pub fn put_object_atomic<T: KvObject>(&self, obj: &mut T) -> NetResult<()> {
        if obj.skip() {
            return Ok(());
        }
        let key = self.key_of(&obj.key());
        let value = serde_json::to_vec(obj)?;
        let previous = obj.exists().then(|| obj.index());
        let index = self.store.atomic_put(&key, &value, previous)?;
        obj.set_index(index);
        obj.set_exists();
        Ok(())
    }

    /// Unconditional write of `obj`.
    pub fn put_object<T: KvObject>(&self, obj: &mut T) -> NetResult<()> {
        if obj.skip() {
            return Ok(());
        }
        let key = self.key_of(&obj.key());
        let index = self.store.put(&key, &serde_json::to_vec(obj)?)?;
        obj.set_index(index);
        obj.set_exists();
        Ok(())
    }

    /// CAS delete of `obj`. An object never read from the store is deleted
    /// unconditionally.
    pub fn delete_object_atomic<T: KvObject>(&self, obj: &T) -> NetResult<()> {
        if obj.skip() {
            return Ok(());
        }
        let key = self.key_of(&obj.key());
        if obj.exists() {
            self.store.atomic_delete(&key, obj.index())
        } else {
            self.store.delete(&key)
        }
    }

    /// Unconditional delete of `obj`.
    pub fn delete_object<T: KvObject>(&self, obj: &T) -> NetResult<()> {
        if obj.skip() {
            return Ok(());
        }
        self.store.delete(&self.key_of(&obj.key()))
    }

    /// Decode every object under `prefix`. An empty collection is not an
    /// error.
    pub fn list<T: KvObject>(&self, prefix: &[&str]) -> NetResult<Vec<T>> {
        let prefix = build_key(self.scope, prefix);
        self.store.list(&prefix)?.iter().map(decode).collect()
    }

    /// Like [`DataStore::list`], keyed by full key.
    pub fn map<T: KvObject>(&self, prefix: &[&str]) -> NetResult<BTreeMap<String, T>> {
        let prefix = build_key(self.scope, prefix);
        self.store
            .list(&prefix)?
            .iter()
            .map(|pair| Ok((pair.key.clone(), decode(pair)?)))
            .collect()
    }

    /// Whether an object exists under `parts`.
    pub fn exists(&self, parts: &[&str]) -> NetResult<bool> {
        self.store.exists(&build_key(self.scope, parts))
    }

    /// Watch the collection under `prefix`, decoding each snapshot.
    pub fn watch<T: KvObject + 'static>(
        &self,
        prefix: &[&str],
        stop: Receiver<()>,
    ) -> NetResult<Receiver<Vec<T>>> {
        let raw = self.store.watch_tree(&build_key(self.scope, prefix), stop)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::Builder::new()
            .name("netplane-watch".to_string())
            .spawn(move || {
                for pairs in raw {
                    let objects: Vec<T> = pairs
                        .iter()
                        .filter_map(|pair| match decode(pair) {
                            Ok(obj) => Some(obj),
                            Err(e) => {
                                tracing::warn!(key = %pair.key, error = %e, "Skipping undecodable object");
                                None
                            }
                        })
                        .collect();
                    if tx.send(objects).is_err() {
                        break;
                    }
                }
            })?;
        Ok(rx)
    }

    /// Close the back-end.
    pub fn close(&self) {
        self.store.close();
    }
}

fn decode<T: KvObject>(pair: &KvPair) -> NetResult<T> {
    let mut obj: T = serde_json::from_slice(&pair.value)?;
    obj.set_index(pair.last_index);
    obj.set_exists();
    Ok(obj)
}

/// Whether `key` is `prefix` itself or lives under it.
pub(crate) fn under(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Turn a missing key into a typed not-found error for `what`.
pub(crate) fn not_found_as(err: NetError, what: &'static str, id: &str) -> NetError {
    match err {
        NetError::KeyNotFound { .. } => NetError::not_found(what, id),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        count: u64,
        #[serde(skip)]
        index: u64,
        #[serde(skip)]
        exists: bool,
    }

    impl Counter {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                count: 0,
                index: 0,
                exists: false,
            }
        }
    }

    impl KvObject for Counter {
        fn key(&self) -> Vec<String> {
            vec!["counter".to_string(), self.id.clone()]
        }
        fn key_prefix(&self) -> Vec<String> {
            vec!["counter".to_string()]
        }
        fn index(&self) -> u64 {
            self.index
        }
        fn set_index(&mut self, index: u64) {
            self.index = index;
        }
        fn exists(&self) -> bool {
            self.exists
        }
        fn set_exists(&mut self) {
            self.exists = true;
        }
        fn data_scope(&self) -> DataScope {
            DataScope::Local
        }
    }

    fn store() -> DataStore {
        DataStore::new(DataScope::Local, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn keys() {
        assert_eq!(
            build_key(DataScope::Global, &["endpoint", "n1", "e1"]),
            "/netplane/global/endpoint/n1/e1"
        );
        assert!(under("/netplane/local/endpoint", "/netplane/local/endpoint/n1/e1"));
        assert!(!under("/netplane/local/endpoint", "/netplane/local/endpoint_count/n1"));
        assert!(under("/netplane/local/endpoint_count/n1", "/netplane/local/endpoint_count/n1"));
    }

    #[test]
    fn cas_round() {
        let ds = store();
        let mut c = Counter::new("a");
        ds.put_object_atomic(&mut c).unwrap();
        assert!(c.exists);

        // Creating again from a fresh object collides.
        let mut dup = Counter::new("a");
        assert!(ds.put_object_atomic(&mut dup).unwrap_err().is_retry());

        let mut stale: Counter = ds.get_object(&["counter", "a"]).unwrap();
        c.count = 1;
        ds.put_object_atomic(&mut c).unwrap();

        stale.count = 5;
        let err = ds.put_object_atomic(&mut stale).unwrap_err();
        assert!(matches!(err, NetError::KeyModified { .. }));

        let fresh: Counter = ds.get_object(&["counter", "a"]).unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.index, c.index);
    }

    #[test]
    fn atomic_delete_checks_index() {
        let ds = store();
        let mut c = Counter::new("a");
        ds.put_object_atomic(&mut c).unwrap();
        let stale = c.clone();
        ds.put_object_atomic(&mut c).unwrap();

        assert!(ds.delete_object_atomic(&stale).unwrap_err().is_retry());
        ds.delete_object_atomic(&c).unwrap();
        let err = ds.get_object::<Counter>(&["counter", "a"]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_and_map() {
        let ds = store();
        assert!(ds.list::<Counter>(&["counter"]).unwrap().is_empty());
        for id in ["a", "b"] {
            ds.put_object_atomic(&mut Counter::new(id)).unwrap();
        }
        let all: Vec<Counter> = ds.list(&["counter"]).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.exists));

        let map: BTreeMap<String, Counter> = ds.map(&["counter"]).unwrap();
        assert!(map.contains_key("/netplane/local/counter/b"));
        assert!(ds.exists(&["counter", "a"]).unwrap());
    }

    #[test]
    fn watch_decodes_snapshots() {
        let ds = store();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let rx = ds.watch::<Counter>(&["counter"], stop_rx).unwrap();

        let initial = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(initial.is_empty());

        ds.put_object_atomic(&mut Counter::new("a")).unwrap();
        let next = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(next.len(), 1);
        drop(stop_tx);
    }
}
