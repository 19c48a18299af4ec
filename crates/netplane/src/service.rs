//! Service discovery records.
//!
//! The controller keeps, per network, the names its endpoints answer to.
//! The embedded resolver reads them and every change is pushed to the
//! `/etc/hosts` files of the sandboxes attached to that network.

use std::collections::BTreeMap;
use std::net::IpAddr;

use netplane_network::etchosts::Record;

use crate::controller::ControllerInner;
use crate::endpoint::Endpoint;
use crate::network::Network;
use crate::sandbox::Sandbox;

/// One SRV answer: a backend of a service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    /// Target host name.
    pub name: String,
    /// Target address, returned as additional record.
    pub ip: IpAddr,
    /// Target port.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServicePort {
    port_name: String,
    proto: String,
    target: ServiceTarget,
}

/// Names of one network.
#[derive(Debug, Default)]
pub(crate) struct SvcInfo {
    svc_map: BTreeMap<String, Vec<IpAddr>>,
    svc_ipv6_map: BTreeMap<String, Vec<IpAddr>>,
    /// Names per address, in registration order. The first one answers
    /// reverse lookups.
    ip_map: BTreeMap<IpAddr, Vec<String>>,
    service: BTreeMap<String, Vec<ServicePort>>,
}

/// `/etc/hosts` lines to add and remove after a record change.
#[derive(Debug, Default)]
struct HostsPatch {
    add: Vec<Record<'static>>,
    delete: Vec<Record<'static>>,
}

impl HostsPatch {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty()
    }
}

impl SvcInfo {
    fn add(&mut self, name: &str, ip: IpAddr, ipv6: Option<IpAddr>, update_ip_map: bool, patch: &mut HostsPatch) {
        if update_ip_map {
            for addr in std::iter::once(ip).chain(ipv6) {
                let names = self.ip_map.entry(addr).or_default();
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        let ips = self.svc_map.entry(name.to_string()).or_default();
        if !ips.contains(&ip) {
            ips.push(ip);
            if ips.len() == 1 {
                patch.add.push(Record::owned(name.to_string(), ip.to_string()));
            }
        }
        if let Some(v6) = ipv6 {
            let ips = self.svc_ipv6_map.entry(name.to_string()).or_default();
            if !ips.contains(&v6) {
                ips.push(v6);
            }
        }
    }

    fn delete(&mut self, name: &str, ip: IpAddr, ipv6: Option<IpAddr>, update_ip_map: bool, patch: &mut HostsPatch) {
        if update_ip_map {
            for addr in std::iter::once(ip).chain(ipv6) {
                if let Some(names) = self.ip_map.get_mut(&addr) {
                    names.retain(|n| n != name);
                    if names.is_empty() {
                        self.ip_map.remove(&addr);
                    }
                }
            }
        }
        if let Some(ips) = self.svc_map.get_mut(name) {
            if let Some(pos) = ips.iter().position(|i| *i == ip) {
                ips.remove(pos);
                if pos == 0 {
                    patch.delete.push(Record::owned(name.to_string(), ip.to_string()));
                    if let Some(next) = ips.first() {
                        patch.add.push(Record::owned(name.to_string(), next.to_string()));
                    }
                }
            }
            if ips.is_empty() {
                self.svc_map.remove(name);
            }
        }
        if let Some(v6) = ipv6 {
            if let Some(ips) = self.svc_ipv6_map.get_mut(name) {
                ips.retain(|i| *i != v6);
                if ips.is_empty() {
                    self.svc_ipv6_map.remove(name);
                }
            }
        }
    }

    fn set_service(&mut self, svc_name: &str, port: ServicePort, add: bool) {
        let ports = self.service.entry(svc_name.to_string()).or_default();
        if add {
            if !ports.contains(&port) {
                ports.push(port);
            }
        } else {
            ports.retain(|p| *p != port);
        }
        if ports.is_empty() {
            self.service.remove(svc_name);
        }
    }

    fn host_records(&self, exclude: &str) -> Vec<Record<'static>> {
        self.svc_map
            .iter()
            .filter(|(name, _)| name.split('.').next() != Some(exclude))
            .filter_map(|(name, ips)| {
                ips.first()
                    .map(|ip| Record::owned(name.clone(), ip.to_string()))
            })
            .collect()
    }
}

/// Names an endpoint publishes: `(name, owns the reverse mapping)`.
fn published_names(n: &Network, ep: &Endpoint) -> Vec<(String, bool)> {
    let mut names = Vec::new();
    let primary = if ep.anonymous {
        ep.my_aliases.first().cloned()
    } else {
        Some(ep.name.clone())
    };
    if let Some(primary) = primary {
        names.push((format!("{primary}.{}", n.name), false));
        names.push((primary, true));
    }
    names.extend(ep.my_aliases.iter().map(|alias| (alias.clone(), false)));
    names
}

fn service_ports(ep: &Endpoint, ip: IpAddr) -> Vec<ServicePort> {
    if ep.svc_name.is_empty() {
        return Vec::new();
    }
    ep.ingress_ports
        .iter()
        .map(|port| ServicePort {
            port_name: format!("_{}", port.name),
            proto: format!("_{}", port.protocol),
            target: ServiceTarget {
                name: ep.name.clone(),
                ip,
                port: port.target_port,
            },
        })
        .collect()
}

impl ControllerInner {
    /// Add or remove the records of `ep` in network `n` and patch the hosts
    /// files of the sandboxes attached to `n`.
    pub(crate) fn update_svc_record(&self, n: &Network, ep: &Endpoint, add: bool) {
        // Ingress is a routing-only network.
        if n.ingress {
            return;
        }
        let Some(addr) = ep.iface.addr else {
            return;
        };
        let ip = IpAddr::V4(addr.ip());
        let ipv6 = ep.iface.addrv6.map(|a| IpAddr::V6(a.ip()));

        let mut patch = HostsPatch::default();
        {
            let mut records = self.svc_records.lock();
            let sr = records.entry(n.id.clone()).or_default();
            for (name, owns_reverse) in published_names(n, ep) {
                if add {
                    sr.add(&name, ip, ipv6, owns_reverse, &mut patch);
                } else {
                    sr.delete(&name, ip, ipv6, owns_reverse, &mut patch);
                }
            }
            for port in service_ports(ep, ip) {
                let svc_name = ep.svc_name.clone();
                sr.set_service(&svc_name, port, add);
            }
        }

        if !patch.is_empty() {
            self.push_hosts_patch(n, ep, &patch);
        }
    }

    fn push_hosts_patch(&self, n: &Network, ep: &Endpoint, patch: &HostsPatch) {
        let targets: Vec<Sandbox> = self
            .sandboxes
            .read()
            .values()
            .filter(|sb| !sb.has_endpoint(&ep.id))
            .cloned()
            .collect();
        for sb in targets {
            let local_names = sb.endpoint_names_on(&n.id);
            if local_names.is_empty() {
                continue;
            }
            let keep = |r: &&Record<'static>| {
                let first = r.hosts.split('.').next().unwrap_or_default();
                !local_names.iter().any(|name| name == first)
            };
            let delete: Vec<_> = patch.delete.iter().filter(keep).cloned().collect();
            let add: Vec<_> = patch.add.iter().filter(keep).cloned().collect();
            sb.delete_hosts_entries(&delete);
            sb.add_hosts_entries(&add);
        }
    }

    /// Host records of network `n` for a sandbox joining with `ep`, leaving
    /// out the names `ep` itself answers to.
    pub(crate) fn svc_host_records(&self, n: &Network, ep: &Endpoint) -> Vec<Record<'static>> {
        self.svc_records
            .lock()
            .get(&n.id)
            .map(|sr| sr.host_records(&ep.name))
            .unwrap_or_default()
    }

    /// Look `name` up in network `nid`. The flag reports an IPv6 query for
    /// a name that only exists as IPv4 on a network without IPv6, which must
    /// not be forwarded upstream.
    pub(crate) fn resolve_name_in(
        &self,
        nid: &str,
        network_ipv6: bool,
        name: &str,
        v6: bool,
    ) -> (Option<Vec<IpAddr>>, bool) {
        let records = self.svc_records.lock();
        let Some(sr) = records.get(nid) else {
            return (None, false);
        };
        let name = name.trim_end_matches('.');
        if v6 {
            let ipv6_miss = sr.svc_map.contains_key(name) && !network_ipv6;
            return match sr.svc_ipv6_map.get(name) {
                Some(ips) if !ips.is_empty() => (Some(ips.clone()), false),
                _ => (None, ipv6_miss),
            };
        }
        match sr.svc_map.get(name) {
            Some(ips) if !ips.is_empty() => (Some(ips.clone()), false),
            _ => (None, false),
        }
    }

    /// Name `ip` was registered under in network `nid`.
    pub(crate) fn resolve_ip_in(&self, nid: &str, ip: IpAddr) -> Option<String> {
        self.svc_records
            .lock()
            .get(nid)
            .and_then(|sr| sr.ip_map.get(&ip)?.first().cloned())
    }

    /// SRV targets of `_port._proto.service` in network `nid`.
    pub(crate) fn resolve_service_in(&self, nid: &str, name: &str) -> Vec<ServiceTarget> {
        let mut parts = name.trim_end_matches('.').splitn(3, '.');
        let (Some(port_name), Some(proto), Some(svc_name)) = (parts.next(), parts.next(), parts.next()) else {
            return Vec::new();
        };
        let records = self.svc_records.lock();
        let Some(ports) = records.get(nid).and_then(|sr| sr.service.get(svc_name)) else {
            return Vec::new();
        };
        ports
            .iter()
            .filter(|p| p.port_name == port_name && p.proto == proto)
            .map(|p| p.target.clone())
            .collect()
    }

    /// Forget every record of network `nid`.
    pub(crate) fn cleanup_service_discovery(&self, nid: &str) {
        self.svc_records.lock().remove(nid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_address_drives_hosts_patch() {
        let mut sr = SvcInfo::default();
        let mut patch = HostsPatch::default();
        sr.add("web", v4("10.0.0.2"), None, true, &mut patch);
        sr.add("web", v4("10.0.0.3"), None, true, &mut patch);
        sr.add("web", v4("10.0.0.3"), None, true, &mut patch);
        assert_eq!(patch.add.len(), 1);
        assert_eq!(sr.svc_map["web"], vec![v4("10.0.0.2"), v4("10.0.0.3")]);

        let mut patch = HostsPatch::default();
        sr.delete("web", v4("10.0.0.2"), None, true, &mut patch);
        assert_eq!(patch.delete[0].ip, "10.0.0.2");
        assert_eq!(patch.add[0].ip, "10.0.0.3");

        let mut patch = HostsPatch::default();
        sr.delete("web", v4("10.0.0.3"), None, true, &mut patch);
        assert!(patch.add.is_empty());
        assert!(!sr.svc_map.contains_key("web"));
    }

    #[test]
    fn reverse_map_keeps_first_owner() {
        let mut sr = SvcInfo::default();
        let mut patch = HostsPatch::default();
        sr.add("a", v4("10.0.0.2"), None, true, &mut patch);
        sr.add("b", v4("10.0.0.2"), None, true, &mut patch);
        assert_eq!(sr.ip_map[&v4("10.0.0.2")], ["a", "b"]);
        sr.delete("b", v4("10.0.0.2"), None, true, &mut patch);
        assert_eq!(sr.ip_map[&v4("10.0.0.2")], ["a"]);
    }

    #[test]
    fn reverse_map_falls_back_to_remaining_owner() {
        let mut sr = SvcInfo::default();
        let mut patch = HostsPatch::default();
        let v6: IpAddr = "fd00::2".parse().unwrap();
        sr.add("a", v4("10.0.0.2"), Some(v6), true, &mut patch);
        sr.add("b", v4("10.0.0.2"), None, true, &mut patch);

        sr.delete("a", v4("10.0.0.2"), Some(v6), true, &mut patch);
        assert_eq!(sr.ip_map[&v4("10.0.0.2")], ["b"]);
        assert!(!sr.ip_map.contains_key(&v6));

        sr.delete("b", v4("10.0.0.2"), None, true, &mut patch);
        assert!(sr.ip_map.is_empty());
    }

    #[test]
    fn host_records_skip_own_names() {
        let mut sr = SvcInfo::default();
        let mut patch = HostsPatch::default();
        sr.add("web", v4("10.0.0.2"), None, true, &mut patch);
        sr.add("web.front", v4("10.0.0.2"), None, false, &mut patch);
        sr.add("db", v4("10.0.0.3"), None, true, &mut patch);

        let recs = sr.host_records("web");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].hosts, "db");
    }

    #[test]
    fn services_dedup() {
        let mut sr = SvcInfo::default();
        let port = ServicePort {
            port_name: "_http".into(),
            proto: "_tcp".into(),
            target: ServiceTarget {
                name: "web1".into(),
                ip: v4("10.0.0.2"),
                port: 80,
            },
        };
        sr.set_service("web", port.clone(), true);
        sr.set_service("web", port.clone(), true);
        assert_eq!(sr.service["web"].len(), 1);
        sr.set_service("web", port, false);
        assert!(sr.service.is_empty());
    }
}
