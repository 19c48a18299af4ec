//! Single-file key-value engine for the local scope.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use netplane_common::{NetError, NetResult};

use super::{KvPair, KvStore, MemoryStore};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    value: String,
    index: u64,
}

/// A [`MemoryStore`] mirrored to a JSON file on every write.
///
/// The file is replaced atomically through a temporary file in the same
/// directory. A write becomes visible only once the file holds it.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    mem: MemoryStore,
    flush: Mutex<()>,
}

impl FileStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> NetResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mem = MemoryStore::new();
        if path.exists() {
            let content = std::fs::read(&path)?;
            if !content.is_empty() {
                let records: Vec<Record> = serde_json::from_slice(&content)?;
                tracing::debug!(path = %path.display(), entries = records.len(), "Loaded local store");
                mem.load(records.into_iter().map(|r| KvPair {
                    key: r.key,
                    value: r.value.into_bytes(),
                    last_index: r.index,
                }));
            }
        }
        Ok(Self {
            path,
            mem,
            flush: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, pairs: &[KvPair]) -> NetResult<()> {
        let _guard = self.flush.lock();
        let records = pairs
            .iter()
            .map(|pair| {
                let value = String::from_utf8(pair.value.clone())
                    .map_err(|e| NetError::Serialization(e.to_string()))?;
                Ok(Record {
                    key: pair.key.clone(),
                    value,
                    index: pair.last_index,
                })
            })
            .collect::<NetResult<Vec<_>>>()?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&records)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| NetError::Io(e.error))?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> NetResult<KvPair> {
        self.mem.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> NetResult<u64> {
        self.mem.put_committed(key, value, Some(&|pairs: &[KvPair]| self.persist(pairs)))
    }

    fn exists(&self, key: &str) -> NetResult<bool> {
        self.mem.exists(key)
    }

    fn list(&self, prefix: &str) -> NetResult<Vec<KvPair>> {
        self.mem.list(prefix)
    }

    fn delete(&self, key: &str) -> NetResult<()> {
        self.mem.delete_committed(key, Some(&|pairs: &[KvPair]| self.persist(pairs)))
    }

    fn atomic_put(&self, key: &str, value: &[u8], previous: Option<u64>) -> NetResult<u64> {
        self.mem
            .atomic_put_committed(key, value, previous, Some(&|pairs: &[KvPair]| self.persist(pairs)))
    }

    fn atomic_delete(&self, key: &str, previous: u64) -> NetResult<()> {
        self.mem
            .atomic_delete_committed(key, previous, Some(&|pairs: &[KvPair]| self.persist(pairs)))
    }

    fn watch_tree(&self, prefix: &str, stop: Receiver<()>) -> NetResult<Receiver<Vec<KvPair>>> {
        self.mem.watch_tree(prefix, stop)
    }

    fn close(&self) {
        if let Err(e) = self.persist(&self.mem.dump()) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush local store");
        }
        self.mem.close();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store").join("local-kv.json");

        let idx = {
            let store = FileStore::open(&path).unwrap();
            store.put("/netplane/local/network/a", br#"{"id":"a"}"#).unwrap();
            let idx = store
                .atomic_put("/netplane/local/network/b", br#"{"id":"b"}"#, None)
                .unwrap();
            store.delete("/netplane/local/network/a").unwrap();
            idx
        };

        let store = FileStore::open(&path).unwrap();
        assert!(!store.exists("/netplane/local/network/a").unwrap());
        let pair = store.get("/netplane/local/network/b").unwrap();
        assert_eq!(pair.value, br#"{"id":"b"}"#);
        assert_eq!(pair.last_index, idx);

        // Indexes keep growing after a reload.
        let next = store.put("/netplane/local/network/c", b"{}").unwrap();
        assert!(next > idx);
    }

    #[cfg(unix)]
    #[test_log::test]
    fn failed_flush_leaves_store_unchanged() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let path = dir.path().join("kv.json");
        let store = FileStore::open(&path)?;
        let idx = store.atomic_put("/k", b"1", None)?;
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();
        let updates = store.watch_tree("/", stop_rx)?;
        assert_eq!(updates.recv()?.len(), 1);

        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555))?;
        // Root ignores directory permissions.
        if NamedTempFile::new_in(dir.path()).is_ok() {
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        assert!(store.put("/new", b"x").is_err());
        assert!(store.get("/new").unwrap_err().is_not_found());
        assert!(store.atomic_put("/k", b"2", Some(idx)).is_err());
        assert_eq!(store.get("/k")?.value, b"1");
        assert!(store.atomic_delete("/k", idx).is_err());
        assert!(store.delete("/k").is_err());
        assert!(store.exists("/k")?);
        assert!(updates.try_recv().is_err());

        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;
        store.atomic_put("/k", b"2", Some(idx))?;
        assert_eq!(updates.recv()?[0].value, b"2");
        drop(stop_tx);
        Ok(())
    }

    #[test]
    fn cas_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.json");
        let idx = FileStore::open(&path)
            .unwrap()
            .atomic_put("/k", b"1", None)
            .unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.atomic_put("/k", b"2", Some(idx + 1)).unwrap_err().is_retry());
        store.atomic_put("/k", b"2", Some(idx)).unwrap();
    }
}
