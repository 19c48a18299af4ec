//! Names the embedded resolver answers for a sandbox.
//!
//! A query `a.b.c` may mean container `a.b.c` on any joined network,
//! `a.b` on network `c`, or `a` on network `b.c`; every split is tried,
//! aliases first.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::{Arc, Weak};
use std::time::Duration;

use netplane_common::NetResult;
use netplane_network::osl::Namespace;

use super::{SandboxEndpoint, SandboxInner};
use crate::controller::ControllerInner;
use crate::resolver::{self, ResolverBackend};
use crate::service::ServiceTarget;

/// What name lookups need to know about a joined endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Lookup {
    pub(crate) network_id: String,
    pub(crate) network_name: String,
    pub(crate) ipv6: bool,
    pub(crate) aliases: BTreeMap<String, String>,
}

impl From<&SandboxEndpoint> for Lookup {
    fn from(e: &SandboxEndpoint) -> Self {
        Self {
            network_id: e.ep.network_id.clone(),
            network_name: e.network_name.clone(),
            ipv6: e.ipv6,
            aliases: e.ep.aliases.clone(),
        }
    }
}

/// Order endpoints for lookups: multi-host networks, then ingress, then
/// local ones.
pub(crate) fn lookup_order(entries: &[SandboxEndpoint], reorder: bool) -> Vec<Lookup> {
    if !reorder {
        return entries.iter().map(Lookup::from).collect();
    }
    let dynamic = entries.iter().filter(|e| e.multihost && !e.ingress);
    let ingress = entries.iter().filter(|e| e.ingress).take(1);
    let local = entries.iter().filter(|e| !e.multihost && !e.ingress);
    dynamic.chain(ingress).chain(local).map(Lookup::from).collect()
}

/// Candidate `(name, network)` pairs for a query, the whole name first.
pub(crate) fn name_splits(name: &str) -> Vec<(String, String)> {
    let name = name.trim_end_matches('.');
    let mut splits = vec![(name.to_string(), String::new())];
    let mut rest = name;
    while let Some(i) = rest.rfind('.') {
        splits.push((name[..i].to_string(), name[i + 1..].to_string()));
        rest = &rest[..i];
    }
    splits
}

type NameLookup<'a> = dyn Fn(&str, bool, &str) -> (Option<Vec<IpAddr>>, bool) + 'a;

/// Resolve `name` across `eps`. `lookup(nid, network_ipv6, name)` does the
/// per-network search.
pub(crate) fn resolve_name(eps: &[Lookup], name: &str, lookup: &NameLookup<'_>) -> (Option<Vec<IpAddr>>, bool) {
    for (req, network) in name_splits(name) {
        for alias in [true, false] {
            let (ips, ipv6_miss) = resolve_in(eps, &req, &network, alias, lookup);
            if ips.is_some() {
                return (ips, false);
            }
            if ipv6_miss {
                return (None, true);
            }
        }
    }
    (None, false)
}

fn resolve_in(
    eps: &[Lookup],
    req: &str,
    network: &str,
    alias: bool,
    lookup: &NameLookup<'_>,
) -> (Option<Vec<IpAddr>>, bool) {
    let mut ipv6_miss = false;
    for ep in eps {
        if !network.is_empty() && network != ep.network_name {
            continue;
        }
        let name = if alias {
            match ep.aliases.get(req) {
                Some(canonical) => canonical.as_str(),
                None => continue,
            }
        } else {
            // The name is an alias here; the alias pass owns it.
            if ep.aliases.contains_key(req) {
                continue;
            }
            req
        };
        let (ips, miss) = lookup(&ep.network_id, ep.ipv6, name);
        if ips.is_some() {
            return (ips, false);
        }
        ipv6_miss |= miss;
    }
    (None, ipv6_miss)
}

/// [`ResolverBackend`] of a sandbox. Holds the sandbox weakly so a
/// running resolver never keeps it alive.
pub(crate) struct SandboxBackend {
    sb: Weak<SandboxInner>,
}

impl SandboxBackend {
    pub(crate) fn new(sb: &Arc<SandboxInner>) -> Self {
        Self {
            sb: Arc::downgrade(sb),
        }
    }

    fn parts(&self) -> Option<(Arc<SandboxInner>, Arc<ControllerInner>)> {
        let sb = self.sb.upgrade()?;
        let ctrl = sb.ctrl.upgrade()?;
        Some((sb, ctrl))
    }

    fn namespace(&self) -> Option<Arc<Namespace>> {
        self.sb.upgrade()?.state.lock().os.clone()
    }
}

impl ResolverBackend for SandboxBackend {
    fn resolve_name(&self, name: &str, v6: bool) -> (Option<Vec<IpAddr>>, bool) {
        let Some((sb, ctrl)) = self.parts() else {
            return (None, false);
        };
        let entries = sb.state.lock().endpoints.clone();
        let eps = lookup_order(&entries, !ctrl.config.distributed_control);
        resolve_name(&eps, name, &|nid, net_v6, req| ctrl.resolve_name_in(nid, net_v6, req, v6))
    }

    fn resolve_ip(&self, ip: IpAddr) -> Option<String> {
        let (sb, ctrl) = self.parts()?;
        let entries = sb.state.lock().endpoints.clone();
        entries.iter().find_map(|e| {
            ctrl.resolve_ip_in(&e.ep.network_id, ip)
                .map(|host| format!("{host}.{}", e.network_name))
        })
    }

    fn resolve_service(&self, name: &str) -> Vec<ServiceTarget> {
        if name.trim_end_matches('.').split('.').count() < 3 {
            return Vec::new();
        }
        let Some((sb, ctrl)) = self.parts() else {
            return Vec::new();
        };
        let entries = sb.state.lock().endpoints.clone();
        entries
            .iter()
            .map(|e| ctrl.resolve_service_in(&e.ep.network_id, name))
            .find(|targets| !targets.is_empty())
            .unwrap_or_default()
    }

    fn ndots_set(&self) -> bool {
        self.sb
            .upgrade()
            .is_some_and(|sb| sb.state.lock().ndots_set)
    }

    fn connect_udp(&self, server: SocketAddr) -> NetResult<UdpSocket> {
        match self.namespace() {
            Some(os) => os.invoke(|| resolver::connect_udp(server)),
            None => resolver::connect_udp(server),
        }
    }

    fn connect_tcp(&self, server: SocketAddr, timeout: Duration) -> NetResult<TcpStream> {
        let connect = || -> NetResult<TcpStream> { Ok(TcpStream::connect_timeout(&server, timeout)?) };
        match self.namespace() {
            Some(os) => os.invoke(connect),
            None => connect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn lookup_ep(nid: &str, name: &str, aliases: &[(&str, &str)]) -> Lookup {
        Lookup {
            network_id: nid.to_string(),
            network_name: name.to_string(),
            ipv6: false,
            aliases: aliases
                .iter()
                .map(|(a, c)| ((*a).to_string(), (*c).to_string()))
                .collect(),
        }
    }

    fn table(nid: &str, _v6: bool, name: &str) -> (Option<Vec<IpAddr>>, bool) {
        let ip = match (nid, name) {
            ("n1", "web") => Ipv4Addr::new(10, 0, 0, 2),
            ("n2", "web") => Ipv4Addr::new(10, 1, 0, 2),
            ("n2", "db") => Ipv4Addr::new(10, 1, 0, 3),
            ("n1", "v4only") => return (None, true),
            _ => return (None, false),
        };
        (Some(vec![IpAddr::V4(ip)]), false)
    }

    #[test]
    fn splits_try_every_dot() {
        assert_eq!(
            name_splits("a.b.c."),
            [
                ("a.b.c".to_string(), String::new()),
                ("a.b".to_string(), "c".to_string()),
                ("a".to_string(), "b.c".to_string()),
            ]
        );
    }

    #[test]
    fn network_suffix_picks_the_network() {
        let eps = [lookup_ep("n1", "front", &[]), lookup_ep("n2", "back", &[])];
        let (ips, _) = resolve_name(&eps, "web", &table);
        assert_eq!(ips.unwrap(), [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]);
        let (ips, _) = resolve_name(&eps, "web.back", &table);
        assert_eq!(ips.unwrap(), [IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2))]);
    }

    #[test]
    fn aliases_resolve_to_their_target() {
        let eps = [lookup_ep("n1", "front", &[("web", "db")]), lookup_ep("n2", "back", &[])];
        // "web" is an alias on n1 whose target n1 lacks, so n2 answers.
        let (ips, _) = resolve_name(&eps, "web", &table);
        assert_eq!(ips.unwrap(), [IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2))]);
    }

    #[test]
    fn ipv6_miss_is_reported() {
        let eps = [lookup_ep("n1", "front", &[])];
        assert_eq!(resolve_name(&eps, "v4only", &table), (None, true));
        assert_eq!(resolve_name(&eps, "nothing", &table), (None, false));
    }
}
