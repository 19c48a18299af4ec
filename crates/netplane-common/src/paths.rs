//! Standard filesystem paths for netplane.

use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::id::short_id;

/// Default root directory for netplane data.
pub static NETPLANE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("NETPLANE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/netplane"))
});

/// Default execution root (sockets, namespace bind mounts).
pub static NETPLANE_EXEC_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("NETPLANE_EXEC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/netplane"))
});

/// Standard paths used by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetplanePaths {
    /// Root data directory (default: /var/lib/netplane).
    pub root: PathBuf,
    /// Execution root (default: /run/netplane).
    pub exec_root: PathBuf,
}

impl NetplanePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let exec_root = root.join("run");
        Self { root, exec_root }
    }

    /// Directory for the local datastore and sandbox files.
    #[must_use]
    pub fn network_files(&self) -> PathBuf {
        self.root.join("network").join("files")
    }

    /// Single-file local-scope store.
    #[must_use]
    pub fn local_store(&self) -> PathBuf {
        self.network_files().join("local-kv.json")
    }

    /// Directory holding a sandbox's resolution files.
    #[must_use]
    pub fn sandbox_files(&self, sandbox_id: &str) -> PathBuf {
        self.network_files().join(sandbox_id)
    }

    /// Default `/etc/hosts` for a sandbox.
    #[must_use]
    pub fn hosts_file(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_files(sandbox_id).join("hosts")
    }

    /// Default `/etc/resolv.conf` for a sandbox.
    #[must_use]
    pub fn resolv_conf(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_files(sandbox_id).join("resolv.conf")
    }

    /// Directory where namespace bind mounts live.
    #[must_use]
    pub fn netns_dir(&self) -> PathBuf {
        self.exec_root.join("netns")
    }

    /// Namespace key path for a sandbox.
    #[must_use]
    pub fn sandbox_key(&self, sandbox_id: &str) -> PathBuf {
        self.netns_dir().join(short_id(sandbox_id))
    }

    /// External-key listener socket for a controller.
    #[must_use]
    pub fn external_key_socket(&self, controller_id: &str) -> PathBuf {
        self.exec_root
            .join("netplane")
            .join(format!("{}.sock", short_id(controller_id)))
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.exec_root)?;
        std::fs::create_dir_all(self.network_files())?;
        std::fs::create_dir_all(self.netns_dir())?;
        std::fs::create_dir_all(self.exec_root.join("netplane"))?;
        Ok(())
    }
}

impl Default for NetplanePaths {
    fn default() -> Self {
        Self {
            root: NETPLANE_ROOT.clone(),
            exec_root: NETPLANE_EXEC_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = NetplanePaths::with_root("/tmp/netplane-test");
        assert_eq!(
            paths.local_store(),
            PathBuf::from("/tmp/netplane-test/network/files/local-kv.json")
        );
        assert_eq!(paths.exec_root, PathBuf::from("/tmp/netplane-test/run"));
    }

    #[test]
    fn sandbox_files() {
        let paths = NetplanePaths::with_root("/tmp/np");
        assert_eq!(
            paths.hosts_file("sb1"),
            PathBuf::from("/tmp/np/network/files/sb1/hosts")
        );
        assert_eq!(
            paths.resolv_conf("sb1"),
            PathBuf::from("/tmp/np/network/files/sb1/resolv.conf")
        );
    }

    #[test]
    fn socket_uses_short_id() {
        let paths = NetplanePaths::with_root("/tmp/np");
        let id = "0123456789abcdef0123456789abcdef";
        assert_eq!(
            paths.external_key_socket(id),
            PathBuf::from("/tmp/np/run/netplane/0123456789ab.sock")
        );
        assert_eq!(
            paths.sandbox_key(id),
            PathBuf::from("/tmp/np/run/netns/0123456789ab")
        );
    }
}
