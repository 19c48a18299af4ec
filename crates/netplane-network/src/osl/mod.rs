//! OS sandbox: a network namespace pinned by a bind mount at a key path.
//!
//! All kernel changes are made by `ip` commands run from a thread that has
//! joined the namespace (see [`Namespace::invoke`]). Invocations on one
//! namespace are serialized.

pub mod interface;
pub mod namespace;
pub mod stats;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;

use netplane_common::{NetError, NetResult, RouteType, StaticRoute};

pub use interface::{Interface, InterfaceOptions};
pub use stats::InterfaceStatistics;

use crate::{cmd, veth};

#[derive(Debug, Default)]
struct NamespaceState {
    interfaces: Vec<Interface>,
    gateway: Option<Ipv4Addr>,
    gateway_v6: Option<Ipv6Addr>,
    static_routes: Vec<StaticRoute>,
}

/// Handle on a sandbox network namespace.
#[derive(Debug)]
pub struct Namespace {
    key: PathBuf,
    state: Mutex<NamespaceState>,
    invoke_lock: Mutex<()>,
}

impl Namespace {
    fn at(key: &Path) -> Self {
        Self {
            key: key.to_path_buf(),
            state: Mutex::new(NamespaceState::default()),
            invoke_lock: Mutex::new(()),
        }
    }

    /// Create a new namespace bound at `key` with `lo` up.
    pub fn create(key: &Path) -> NetResult<Self> {
        namespace::create(key)?;
        let ns = Self::at(key);
        if let Err(e) = ns.invoke(|| cmd::ip(&["link", "set", "lo", "up"])) {
            let _ = namespace::unmount(key);
            return Err(e);
        }
        tracing::info!(key = %key.display(), "Sandbox namespace created");
        Ok(ns)
    }

    /// Reattach to a namespace that is already bound at `key`, for example
    /// after a restart.
    pub fn restore(key: &Path) -> NetResult<Self> {
        if !key.exists() {
            return Err(NetError::not_found("namespace", key.display().to_string()));
        }
        Ok(Self::at(key))
    }

    /// Bind an externally created namespace at `source` to `key`.
    pub fn for_external_key(source: &Path, key: &Path) -> NetResult<Self> {
        namespace::bind(source, key)?;
        tracing::debug!(
            source = %source.display(),
            key = %key.display(),
            "Bound external namespace"
        );
        Ok(Self::at(key))
    }

    /// Path the namespace is bound at.
    #[must_use]
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Run `f` on a thread inside the namespace.
    pub fn invoke<T, F>(&self, f: F) -> NetResult<T>
    where
        F: FnOnce() -> NetResult<T> + Send,
        T: Send,
    {
        let _guard = self.invoke_lock.lock();
        namespace::run_in(&self.key, f)
    }

    /// Move host link `src_name` into the namespace, name it `dst_prefix`
    /// followed by the lowest free index, and configure it. Returns the name
    /// inside the namespace.
    pub fn add_interface(
        &self,
        src_name: &str,
        dst_prefix: &str,
        options: InterfaceOptions,
    ) -> NetResult<String> {
        let mut state = self.state.lock();
        let dst_name = next_name(&state.interfaces, dst_prefix);

        veth::move_link_to_netns(src_name, &self.key)?;

        let commands = interface::setup_commands(&dst_name, &options);
        let result = self.invoke(|| {
            cmd::ip(&["link", "set", "dev", src_name, "name", &dst_name])?;
            for args in &commands {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                cmd::ip(&args)?;
            }
            Ok(())
        });

        if let Err(e) = result {
            let _ = self.invoke(|| {
                if !cmd::succeeds("ip", &["link", "delete", &dst_name]) {
                    let _ = cmd::ip(&["link", "delete", src_name]);
                }
                Ok(())
            });
            return Err(e);
        }

        tracing::debug!(src_name, dst_name = %dst_name, "Interface added to sandbox");
        state.interfaces.push(Interface {
            src_name: src_name.to_string(),
            dst_name: dst_name.clone(),
            options,
        });
        Ok(dst_name)
    }

    /// Move an interface back to the host namespace under its original
    /// name. Falls back to deleting it.
    pub fn remove_interface(&self, dst_name: &str) -> NetResult<()> {
        let mut state = self.state.lock();
        let Some(pos) = state.interfaces.iter().position(|i| i.dst_name == dst_name) else {
            return Err(NetError::not_found("interface", dst_name));
        };
        let iface = state.interfaces.remove(pos);
        let host_pid = std::process::id().to_string();

        self.invoke(|| {
            let moved = cmd::ip(&["link", "set", "dev", &iface.dst_name, "down"])
                .and_then(|()| {
                    cmd::ip(&["link", "set", "dev", &iface.dst_name, "name", &iface.src_name])
                })
                .and_then(|()| cmd::ip(&["link", "set", "dev", &iface.src_name, "netns", &host_pid]));
            if let Err(e) = moved {
                tracing::warn!(interface = %iface.dst_name, error = %e, "Could not move interface out, deleting it");
                let name = if cmd::succeeds("ip", &["link", "show", &iface.src_name]) {
                    &iface.src_name
                } else {
                    &iface.dst_name
                };
                let _ = cmd::ip(&["link", "delete", name]);
            }
            Ok(())
        })
    }

    /// Interfaces currently in the namespace.
    #[must_use]
    pub fn interfaces(&self) -> Vec<Interface> {
        self.state.lock().interfaces.clone()
    }

    /// Record an interface that is already configured inside a restored
    /// namespace. Returns the name it was given.
    pub fn restore_interface(&self, src_name: &str, dst_prefix: &str, options: InterfaceOptions) -> String {
        let mut state = self.state.lock();
        let dst_name = next_name(&state.interfaces, dst_prefix);
        state.interfaces.push(Interface {
            src_name: src_name.to_string(),
            dst_name: dst_name.clone(),
            options,
        });
        dst_name
    }

    /// Record default gateways and static routes that are already installed
    /// inside a restored namespace.
    pub fn restore_routes(
        &self,
        gateway: Option<Ipv4Addr>,
        gateway_v6: Option<Ipv6Addr>,
        routes: Vec<StaticRoute>,
    ) {
        let mut state = self.state.lock();
        state.gateway = gateway.or(state.gateway);
        state.gateway_v6 = gateway_v6.or(state.gateway_v6);
        state.static_routes.extend(routes);
    }

    /// Install the IPv4 default route.
    pub fn set_gateway(&self, gw: Ipv4Addr) -> NetResult<()> {
        let via = gw.to_string();
        self.invoke(|| cmd::ip(&["-4", "route", "replace", "default", "via", &via]))?;
        self.state.lock().gateway = Some(gw);
        Ok(())
    }

    /// Install the IPv6 default route.
    pub fn set_gateway_v6(&self, gw: Ipv6Addr) -> NetResult<()> {
        let via = gw.to_string();
        self.invoke(|| cmd::ip(&["-6", "route", "replace", "default", "via", &via]))?;
        self.state.lock().gateway_v6 = Some(gw);
        Ok(())
    }

    /// Remove the IPv4 default route if one was set.
    pub fn unset_gateway(&self) -> NetResult<()> {
        if self.state.lock().gateway.take().is_some() {
            self.invoke(|| {
                if let Err(e) = cmd::ip(&["-4", "route", "del", "default"]) {
                    tracing::debug!(error = %e, "No IPv4 default route to remove");
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Remove the IPv6 default route if one was set.
    pub fn unset_gateway_v6(&self) -> NetResult<()> {
        if self.state.lock().gateway_v6.take().is_some() {
            self.invoke(|| {
                if let Err(e) = cmd::ip(&["-6", "route", "del", "default"]) {
                    tracing::debug!(error = %e, "No IPv6 default route to remove");
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Current default gateways.
    #[must_use]
    pub fn gateways(&self) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
        let state = self.state.lock();
        (state.gateway, state.gateway_v6)
    }

    /// Install a static route, optionally bound to interface `dev`.
    pub fn add_static_route(&self, route: &StaticRoute, dev: Option<&str>) -> NetResult<()> {
        let args = route_args("add", route, dev);
        self.invoke(|| {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            cmd::ip(&args)
        })?;
        self.state.lock().static_routes.push(route.clone());
        Ok(())
    }

    /// Remove a static route.
    pub fn remove_static_route(&self, route: &StaticRoute, dev: Option<&str>) -> NetResult<()> {
        let args = route_args("del", route, dev);
        self.invoke(|| {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            cmd::ip(&args)
        })?;
        self.state.lock().static_routes.retain(|r| r != route);
        Ok(())
    }

    /// Static routes installed through this handle.
    #[must_use]
    pub fn static_routes(&self) -> Vec<StaticRoute> {
        self.state.lock().static_routes.clone()
    }

    /// Add a secondary address to `dev`.
    pub fn add_alias_ip(&self, dev: &str, addr: &IpNetwork) -> NetResult<()> {
        let cidr = addr.to_string();
        self.invoke(|| cmd::ip(&["addr", "add", &cidr, "dev", dev]))
    }

    /// Remove a secondary address from `dev`.
    pub fn remove_alias_ip(&self, dev: &str, addr: &IpNetwork) -> NetResult<()> {
        let cidr = addr.to_string();
        self.invoke(|| cmd::ip(&["addr", "del", &cidr, "dev", dev]))
    }

    /// Stop `dev` from answering ARP for addresses it does not own.
    pub fn disable_arp_for_vip(&self, dev: &str) -> NetResult<()> {
        self.invoke(|| {
            let base = format!("/proc/sys/net/ipv4/conf/{dev}");
            std::fs::write(format!("{base}/arp_ignore"), "1")?;
            std::fs::write(format!("{base}/arp_announce"), "2")?;
            Ok(())
        })
    }

    /// Traffic counters of the sandbox interfaces.
    pub fn statistics(&self) -> NetResult<BTreeMap<String, InterfaceStatistics>> {
        let names: Vec<String> = self
            .state
            .lock()
            .interfaces
            .iter()
            .map(|i| i.dst_name.clone())
            .collect();
        let all = self.invoke(|| Ok(std::fs::read_to_string(stats::NET_DEV)?))?;
        Ok(stats::parse_net_dev(&all)
            .into_iter()
            .filter(|(name, _)| names.contains(name))
            .collect())
    }

    /// Release the bind mount. Interfaces still inside disappear with the
    /// namespace.
    pub fn destroy(&self) -> NetResult<()> {
        tracing::debug!(key = %self.key.display(), "Destroying sandbox namespace");
        namespace::unmount(&self.key)
    }
}

fn next_name(interfaces: &[Interface], prefix: &str) -> String {
    (0..)
        .map(|i| format!("{prefix}{i}"))
        .find(|name| interfaces.iter().all(|iface| &iface.dst_name != name))
        .unwrap_or_else(|| prefix.to_string())
}

fn route_args(op: &str, route: &StaticRoute, dev: Option<&str>) -> Vec<String> {
    let family = if route.destination.is_ipv6() { "-6" } else { "-4" };
    let mut args = vec![
        family.to_string(),
        "route".to_string(),
        op.to_string(),
        route.destination.to_string(),
    ];
    if let (RouteType::NextHop, Some(nh)) = (route.route_type, route.next_hop) {
        args.extend(["via".to_string(), nh.to_string()]);
    }
    if let Some(dev) = dev {
        args.extend(["dev".to_string(), dev.to_string()]);
    }
    if route.route_type == RouteType::Connected {
        args.extend(["scope".to_string(), "link".to_string()]);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(dst: &str) -> Interface {
        Interface {
            src_name: format!("veth-{dst}"),
            dst_name: dst.to_string(),
            options: InterfaceOptions::default(),
        }
    }

    #[test]
    fn lowest_free_index() {
        assert_eq!(next_name(&[], "eth"), "eth0");
        assert_eq!(next_name(&[iface("eth0"), iface("eth1")], "eth"), "eth2");
        assert_eq!(next_name(&[iface("eth1")], "eth"), "eth0");
        assert_eq!(next_name(&[iface("eth0")], "vxlan"), "vxlan0");
    }

    #[test]
    fn route_commands() {
        let via = StaticRoute {
            destination: "10.20.0.0/16".parse().unwrap(),
            route_type: RouteType::NextHop,
            next_hop: Some("10.0.0.1".parse().unwrap()),
        };
        assert_eq!(
            route_args("add", &via, None).join(" "),
            "-4 route add 10.20.0.0/16 via 10.0.0.1"
        );

        let connected = StaticRoute {
            destination: "fd00::/64".parse().unwrap(),
            route_type: RouteType::Connected,
            next_hop: None,
        };
        assert_eq!(
            route_args("del", &connected, Some("eth1")).join(" "),
            "-6 route del fd00::/64 dev eth1 scope link"
        );
    }

    #[test]
    fn restore_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let err = Namespace::restore(&dir.path().join("absent")).unwrap_err();
        assert!(err.is_not_found());
    }
}
