//! In-process key-value engine.

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use netplane_common::{NetError, NetResult};

use super::{KvPair, KvStore, under};

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: Sender<Vec<KvPair>>,
    stop: Receiver<()>,
}

impl Watcher {
    fn stopped(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }
}

/// Makes a candidate state durable before it is applied.
pub(crate) type Commit<'a> = &'a dyn Fn(&[KvPair]) -> NetResult<()>;

#[derive(Debug, Default, Clone)]
struct Inner {
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    index: u64,
}

/// Thread-safe ordered map with a store-wide write index.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    watchers: Mutex<Vec<Watcher>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load entries, keeping their recorded indexes.
    pub(crate) fn load(&self, entries: impl IntoIterator<Item = KvPair>) {
        let mut inner = self.inner.write();
        for pair in entries {
            inner.index = inner.index.max(pair.last_index);
            inner.entries.insert(pair.key, (pair.value, pair.last_index));
        }
    }

    /// Every entry, in key order.
    pub(crate) fn dump(&self) -> Vec<KvPair> {
        Self::pairs(&self.inner.read())
    }

    fn pairs(inner: &Inner) -> Vec<KvPair> {
        inner
            .entries
            .iter()
            .map(|(key, (value, index))| KvPair {
                key: key.clone(),
                value: value.clone(),
                last_index: *index,
            })
            .collect()
    }

    fn collect(inner: &Inner, prefix: &str) -> Vec<KvPair> {
        inner
            .entries
            .iter()
            .filter(|(key, _)| under(prefix, key))
            .map(|(key, (value, index))| KvPair {
                key: key.clone(),
                value: value.clone(),
                last_index: *index,
            })
            .collect()
    }

    fn write(inner: &mut Inner, key: &str, value: &[u8]) -> u64 {
        inner.index += 1;
        let index = inner.index;
        inner.entries.insert(key.to_string(), (value.to_vec(), index));
        index
    }

    /// Run `change` under the write lock. With a `commit` hook the change is
    /// made on a copy, the hook sees the resulting entries, and the copy
    /// replaces the live map only when the hook succeeds. Watchers hear
    /// about applied changes only.
    fn apply<R>(
        &self,
        key: &str,
        commit: Option<Commit<'_>>,
        change: impl FnOnce(&mut Inner) -> NetResult<R>,
    ) -> NetResult<R> {
        let out = {
            let mut inner = self.inner.write();
            match commit {
                None => change(&mut *inner)?,
                Some(commit) => {
                    let mut candidate = inner.clone();
                    let out = change(&mut candidate)?;
                    commit(&Self::pairs(&candidate))?;
                    *inner = candidate;
                    out
                }
            }
        };
        self.notify(key);
        Ok(out)
    }

    pub(crate) fn put_committed(&self, key: &str, value: &[u8], commit: Option<Commit<'_>>) -> NetResult<u64> {
        self.apply(key, commit, |inner| Ok(Self::write(inner, key, value)))
    }

    pub(crate) fn delete_committed(&self, key: &str, commit: Option<Commit<'_>>) -> NetResult<()> {
        self.apply(key, commit, |inner| {
            inner
                .entries
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| NetError::KeyNotFound {
                    key: key.to_string(),
                })
        })
    }

    pub(crate) fn atomic_put_committed(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<u64>,
        commit: Option<Commit<'_>>,
    ) -> NetResult<u64> {
        self.apply(key, commit, |inner| {
            let current = inner.entries.get(key).map(|(_, index)| *index);
            if current != previous {
                return Err(NetError::KeyModified {
                    key: key.to_string(),
                });
            }
            Ok(Self::write(inner, key, value))
        })
    }

    pub(crate) fn atomic_delete_committed(
        &self,
        key: &str,
        previous: u64,
        commit: Option<Commit<'_>>,
    ) -> NetResult<()> {
        self.apply(key, commit, |inner| match inner.entries.get(key) {
            None => Err(NetError::KeyNotFound {
                key: key.to_string(),
            }),
            Some((_, index)) if *index != previous => Err(NetError::KeyModified {
                key: key.to_string(),
            }),
            Some(_) => {
                inner.entries.remove(key);
                Ok(())
            }
        })
    }

    fn notify(&self, key: &str) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.stopped());
        if watchers.is_empty() {
            return;
        }
        let inner = self.inner.read();
        watchers.retain(|w| {
            if !under(&w.prefix, key) {
                return true;
            }
            w.tx.send(Self::collect(&inner, &w.prefix)).is_ok()
        });
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> NetResult<KvPair> {
        let inner = self.inner.read();
        let (value, index) = inner.entries.get(key).ok_or_else(|| NetError::KeyNotFound {
            key: key.to_string(),
        })?;
        Ok(KvPair {
            key: key.to_string(),
            value: value.clone(),
            last_index: *index,
        })
    }

    fn put(&self, key: &str, value: &[u8]) -> NetResult<u64> {
        self.put_committed(key, value, None)
    }

    fn exists(&self, key: &str) -> NetResult<bool> {
        Ok(self.inner.read().entries.contains_key(key))
    }

    fn list(&self, prefix: &str) -> NetResult<Vec<KvPair>> {
        Ok(Self::collect(&self.inner.read(), prefix))
    }

    fn delete(&self, key: &str) -> NetResult<()> {
        self.delete_committed(key, None)
    }

    fn atomic_put(&self, key: &str, value: &[u8], previous: Option<u64>) -> NetResult<u64> {
        self.atomic_put_committed(key, value, previous, None)
    }

    fn atomic_delete(&self, key: &str, previous: u64) -> NetResult<()> {
        self.atomic_delete_committed(key, previous, None)
    }

    fn watch_tree(&self, prefix: &str, stop: Receiver<()>) -> NetResult<Receiver<Vec<KvPair>>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let prefix = prefix.trim_end_matches('/').to_string();
        // Registered under the watcher lock so no write slips between the
        // initial snapshot and the first notification.
        let mut watchers = self.watchers.lock();
        let _ = tx.send(Self::collect(&self.inner.read(), &prefix));
        watchers.push(Watcher { prefix, tx, stop });
        Ok(rx)
    }

    fn close(&self) {
        self.watchers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn index_grows() {
        let store = MemoryStore::new();
        let a = store.put("/x/a", b"1").unwrap();
        let b = store.put("/x/b", b"2").unwrap();
        assert!(b > a);
        assert_eq!(store.get("/x/a").unwrap().last_index, a);
    }

    #[test]
    fn create_only_when_absent() {
        let store = MemoryStore::new();
        let idx = store.atomic_put("/x/a", b"1", None).unwrap();
        assert!(store.atomic_put("/x/a", b"2", None).unwrap_err().is_retry());
        let idx2 = store.atomic_put("/x/a", b"2", Some(idx)).unwrap();
        assert!(store.atomic_put("/x/a", b"3", Some(idx)).unwrap_err().is_retry());
        assert!(store.atomic_put("/x/missing", b"3", Some(idx2)).unwrap_err().is_retry());
    }

    #[test]
    fn delete_missing() {
        let store = MemoryStore::new();
        assert!(store.delete("/x/a").unwrap_err().is_not_found());
        assert!(store.atomic_delete("/x/a", 1).unwrap_err().is_not_found());
    }

    #[test]
    fn list_respects_component_boundary() {
        let store = MemoryStore::new();
        store.put("/n/endpoint/1/a", b"").unwrap();
        store.put("/n/endpoint_count/1", b"").unwrap();
        assert_eq!(store.list("/n/endpoint").unwrap().len(), 1);
        assert_eq!(store.list("/n/endpoint/").unwrap().len(), 1);
    }

    #[test]
    fn concurrent_cas_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let idx = store.put("/c", b"0").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .atomic_put("/c", format!("{i}").as_bytes(), Some(idx))
                        .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn watch_stops() {
        let store = MemoryStore::new();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let rx = store.watch_tree("/w", stop_rx).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_empty());

        store.put("/w/a", b"1").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap().len(), 1);

        store.put("/other", b"1").unwrap();
        assert!(rx.try_recv().is_err());

        stop_tx.send(()).unwrap();
        store.put("/w/b", b"1").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
