//! Controller configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use netplane_common::{GenericOptions, NetError, NetResult, NetplanePaths};
use netplane_network::resolvconf;

use crate::datastore::KvStore;
use crate::sandbox::SandboxOptions;

/// Back-end of the local-scope store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalStoreKind {
    /// Single JSON file under the data root.
    #[default]
    File,
    /// In memory, gone with the process.
    Memory,
}

/// Controller configuration options.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Data and exec roots.
    pub paths: NetplanePaths,
    /// Local store back-end.
    pub local_store: LocalStoreKind,
    /// Cluster-wide store for global and swarm scoped objects.
    pub global_store: Option<Arc<dyn KvStore>>,
    /// Host `resolv.conf` sandboxes derive theirs from.
    pub origin_resolv_conf: PathBuf,
    /// Driver used when a network names none.
    pub default_driver: String,
    /// Options handed to each driver at registration.
    pub driver_options: BTreeMap<String, GenericOptions>,
    /// Whether to listen for external namespace keys.
    pub enable_external_key: bool,
    /// Per-query timeout of the embedded resolver's upstream forwarding.
    pub resolver_timeout: Duration,
    /// Sandboxes of running containers to restore on start, by container ID.
    pub active_sandboxes: HashMap<String, SandboxOptions>,
    /// Where sandbox resolution files go instead of the data root.
    pub hosts_dir: Option<PathBuf>,
    /// Keep sandboxes whose networks cannot be read while deleting them.
    pub distributed_control: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            paths: NetplanePaths::new(),
            local_store: LocalStoreKind::File,
            global_store: None,
            origin_resolv_conf: PathBuf::from(resolvconf::DEFAULT_PATH),
            default_driver: "bridge".to_string(),
            driver_options: BTreeMap::new(),
            enable_external_key: cfg!(target_os = "linux"),
            resolver_timeout: Duration::from_secs(5),
            active_sandboxes: HashMap::new(),
            hosts_dir: None,
            distributed_control: false,
        }
    }
}

impl ControllerConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = NetplanePaths::with_root(root);
        self
    }

    /// Keep the local store in memory.
    #[must_use]
    pub const fn with_memory_store(mut self) -> Self {
        self.local_store = LocalStoreKind::Memory;
        self
    }

    /// Use `store` for global and swarm scoped objects.
    #[must_use]
    pub fn with_global_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.global_store = Some(store);
        self
    }

    /// Derive sandbox `resolv.conf` files from `path`.
    #[must_use]
    pub fn with_origin_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.origin_resolv_conf = path.into();
        self
    }

    /// Set the default driver.
    #[must_use]
    pub fn with_default_driver(mut self, driver: &str) -> Self {
        self.default_driver = driver.to_string();
        self
    }

    /// Options for driver `name`.
    #[must_use]
    pub fn with_driver_options(mut self, name: &str, options: GenericOptions) -> Self {
        self.driver_options.insert(name.to_string(), options);
        self
    }

    /// Turn the external-key listener on or off.
    #[must_use]
    pub const fn with_external_key(mut self, enable: bool) -> Self {
        self.enable_external_key = enable;
        self
    }

    /// Set the resolver's upstream timeout.
    #[must_use]
    pub const fn with_resolver_timeout(mut self, timeout: Duration) -> Self {
        self.resolver_timeout = timeout;
        self
    }

    /// Restore the sandbox of `container_id` on start.
    #[must_use]
    pub fn with_active_sandbox(mut self, container_id: &str, options: SandboxOptions) -> Self {
        self.active_sandboxes.insert(container_id.to_string(), options);
        self
    }

    /// Put sandbox resolution files under `dir`.
    #[must_use]
    pub fn with_hosts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hosts_dir = Some(dir.into());
        self
    }

    /// Mark this host as part of a distributed control plane.
    #[must_use]
    pub const fn with_distributed_control(mut self, enable: bool) -> Self {
        self.distributed_control = enable;
        self
    }

    /// Directory holding the resolution files of sandbox `id`.
    #[must_use]
    pub fn sandbox_files(&self, id: &str) -> PathBuf {
        match &self.hosts_dir {
            Some(dir) => dir.join(id),
            None => self.paths.sandbox_files(id),
        }
    }

    /// Options of driver `name`, empty when none were configured.
    #[must_use]
    pub fn driver_config(&self, name: &str) -> GenericOptions {
        self.driver_options.get(name).cloned().unwrap_or_default()
    }

    /// Load a TOML configuration file.
    pub fn from_toml_file(path: &Path) -> NetResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML configuration.
    ///
    /// ```toml
    /// [daemon]
    /// root = "/var/lib/netplane"
    /// default_driver = "bridge"
    ///
    /// [datastore]
    /// local = "file"
    ///
    /// [driver.bridge]
    /// "io.netplane.bridge.enable_icc" = true
    /// ```
    pub fn from_toml_str(content: &str) -> NetResult<Self> {
        let file: TomlConfig = toml::from_str(content)
            .map_err(|e| NetError::invalid_parameter(format!("invalid configuration: {e}")))?;

        let mut config = Self::default();
        let daemon = file.daemon;
        if let Some(root) = daemon.root {
            config.paths = NetplanePaths::with_root(root);
        }
        if let Some(exec_root) = daemon.exec_root {
            config.paths.exec_root = exec_root;
        }
        if let Some(path) = daemon.origin_resolv_conf {
            config.origin_resolv_conf = path;
        }
        if let Some(driver) = daemon.default_driver {
            config.default_driver = driver;
        }
        if let Some(enable) = daemon.external_key {
            config.enable_external_key = enable;
        }
        if let Some(secs) = daemon.resolver_timeout_secs {
            config.resolver_timeout = Duration::from_secs(secs);
        }
        config.hosts_dir = daemon.hosts_dir;
        config.distributed_control = daemon.distributed_control.unwrap_or(false);
        config.local_store = file.datastore.local;

        for (name, table) in file.driver {
            let options = table
                .into_iter()
                .map(|(k, v)| Ok((k, serde_json::to_value(v)?)))
                .collect::<NetResult<GenericOptions>>()?;
            config.driver_options.insert(name, options);
        }
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(default)]
    daemon: DaemonSection,
    #[serde(default)]
    datastore: DatastoreSection,
    #[serde(default)]
    driver: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonSection {
    root: Option<PathBuf>,
    exec_root: Option<PathBuf>,
    origin_resolv_conf: Option<PathBuf>,
    default_driver: Option<String>,
    external_key: Option<bool>,
    resolver_timeout_secs: Option<u64>,
    hosts_dir: Option<PathBuf>,
    distributed_control: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatastoreSection {
    #[serde(default)]
    local: LocalStoreKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.default_driver, "bridge");
        assert_eq!(config.local_store, LocalStoreKind::File);
        assert_eq!(config.resolver_timeout, Duration::from_secs(5));
        assert_eq!(config.origin_resolv_conf, PathBuf::from("/etc/resolv.conf"));
        assert!(config.global_store.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = ControllerConfig::default()
            .with_root("/custom/root")
            .with_memory_store()
            .with_external_key(false)
            .with_default_driver("null")
            .with_hosts_dir("/custom/hosts");

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.local_store, LocalStoreKind::Memory);
        assert!(!config.enable_external_key);
        assert_eq!(config.default_driver, "null");
        assert_eq!(config.sandbox_files("sb1"), PathBuf::from("/custom/hosts/sb1"));
    }

    #[test]
    fn toml_sections() {
        let config = ControllerConfig::from_toml_str(
            r#"
            [daemon]
            root = "/srv/netplane"
            default_driver = "null"
            resolver_timeout_secs = 2

            [datastore]
            local = "memory"

            [driver.bridge]
            "io.netplane.bridge.enable_icc" = false
            mtu = 1400
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.root, PathBuf::from("/srv/netplane"));
        assert_eq!(config.paths.exec_root, PathBuf::from("/srv/netplane/run"));
        assert_eq!(config.default_driver, "null");
        assert_eq!(config.resolver_timeout, Duration::from_secs(2));
        assert_eq!(config.local_store, LocalStoreKind::Memory);

        let bridge = config.driver_config("bridge");
        assert_eq!(bridge["io.netplane.bridge.enable_icc"], serde_json::json!(false));
        assert_eq!(bridge["mtu"], serde_json::json!(1400));
        assert!(config.driver_config("host").is_empty());
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = ControllerConfig::from_toml_str("[daemon]\nbogus = 1\n").unwrap_err();
        assert_eq!(err.kind(), netplane_common::ErrorKind::InvalidParameter);
    }

    #[test]
    fn empty_toml_is_default() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config.default_driver, "bridge");
        assert_eq!(config.local_store, LocalStoreKind::File);
    }
}
