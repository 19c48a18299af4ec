//! `/etc/hosts` and `resolv.conf` of a sandbox, and its embedded resolver.

use std::net::{IpAddr, TcpListener, UdpSocket};
use std::path::Path;
use std::sync::Arc;

use netplane_common::{IpFamily, NetError, NetResult};
use netplane_network::etchosts::{self, Record};
use netplane_network::resolvconf::{self, EMBEDDED_DNS, ResolvConf};

use super::Sandbox;
use super::resolve::SandboxBackend;
use crate::endpoint::Endpoint;
use crate::resolver::{ExtDns, MAX_EXT_DNS, Resolver, iptables};

/// Inputs of a generated `resolv.conf`.
#[derive(Debug, Clone, Default)]
pub(crate) struct DnsInputs<'a> {
    /// The host file everything derives from.
    pub(crate) base: ResolvConf,
    pub(crate) dns: &'a [String],
    pub(crate) search: &'a [String],
    pub(crate) options: &'a [String],
    /// Whether any joined network carries IPv6.
    pub(crate) ipv6: bool,
    /// Whether the embedded server answers for the container.
    pub(crate) embedded: bool,
}

/// A generated file and what the resolver needs to know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DnsOutput {
    pub(crate) content: String,
    pub(crate) ext_dns: Vec<ExtDns>,
    pub(crate) ndots_set: bool,
}

/// Build the content of a sandbox `resolv.conf`.
pub(crate) fn render(inputs: &DnsInputs<'_>) -> DnsOutput {
    let upstreams: Vec<String> = if inputs.dns.is_empty() {
        resolvconf::usable_upstreams(&inputs.base, inputs.ipv6)
    } else {
        inputs.dns.to_vec()
    };
    let search = if inputs.search.is_empty() {
        inputs.base.search.clone()
    } else {
        inputs.search.to_vec()
    };
    let mut options = if inputs.options.is_empty() {
        inputs.base.options.clone()
    } else {
        inputs.options.to_vec()
    };

    if !inputs.embedded {
        let conf = ResolvConf {
            nameservers: upstreams,
            search,
            options,
        };
        return DnsOutput {
            content: conf.render(),
            ext_dns: Vec::new(),
            ndots_set: false,
        };
    }

    let mut nameservers = vec![EMBEDDED_DNS.to_string()];
    if inputs.ipv6 {
        let generated = ResolvConf {
            nameservers: upstreams,
            ..ResolvConf::default()
        };
        nameservers.extend(generated.nameservers_of(IpFamily::V6));
    }

    let ndots_set = options.iter().any(|o| {
        o.strip_prefix("ndots:")
            .and_then(|n| n.parse::<u32>().ok())
            .is_some_and(|n| n > 0)
    });
    if !options.iter().any(|o| o.starts_with("ndots:")) {
        options.push("ndots:0".to_string());
    }

    let ext_dns: Vec<ExtDns> = if inputs.dns.is_empty() {
        inputs
            .base
            .nameservers_of(IpFamily::V4)
            .iter()
            .filter_map(|ns| ns.parse::<IpAddr>().ok())
            .map(|ip| ExtDns {
                ip,
                host_loopback: ip.is_loopback(),
            })
            .take(MAX_EXT_DNS)
            .collect()
    } else {
        inputs
            .dns
            .iter()
            .filter_map(|ns| ns.parse::<IpAddr>().ok())
            .map(|ip| ExtDns {
                ip,
                host_loopback: false,
            })
            .take(MAX_EXT_DNS)
            .collect()
    };

    let conf = ResolvConf {
        nameservers,
        search,
        options,
    };
    DnsOutput {
        content: conf.render(),
        ext_dns,
        ndots_set,
    }
}

fn copy_or_empty(from: &Path, to: &Path) -> NetResult<()> {
    match std::fs::copy(from, to) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %from.display(), "Origin file missing, creating an empty one");
            std::fs::write(to, b"")?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

impl Sandbox {
    /// Write the initial hosts and `resolv.conf` files.
    pub(crate) fn setup_resolution_files(&self) -> NetResult<()> {
        self.build_hosts_file()?;
        self.setup_dns()
    }

    fn build_hosts_file(&self) -> NetResult<()> {
        let cfg = self.inner.config.read().clone();
        let path = self.hosts_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        if let Some(origin) = &cfg.origin_hosts_path {
            return copy_or_empty(origin, &path).map_err(|e| {
                NetError::internal(format!(
                    "could not copy source hosts file {} to {}: {e}",
                    origin.display(),
                    path.display()
                ))
            });
        }

        let extra: Vec<Record<'static>> = cfg
            .extra_hosts
            .iter()
            .map(|h| Record::owned(h.name.clone(), h.ip.clone()))
            .collect();
        etchosts::build(&path, "", &cfg.hostname, &cfg.domainname, &extra)
    }

    fn setup_dns(&self) -> NetResult<()> {
        let path = self.resolv_conf_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let origin = self.inner.config.read().origin_resolv_conf_path.clone();
        if let Some(origin) = origin {
            return copy_or_empty(&origin, &path);
        }
        self.update_dns()
    }

    /// Append records to the hosts file.
    pub(crate) fn add_hosts_entries(&self, records: &[Record<'_>]) {
        if let Err(e) = etchosts::add(&self.hosts_path(), records) {
            tracing::warn!(sandbox = %self.id(), error = %e, "Failed adding service host entries");
        }
    }

    /// Remove records from the hosts file.
    pub(crate) fn delete_hosts_entries(&self, records: &[Record<'_>]) {
        if let Err(e) = etchosts::delete(&self.hosts_path(), records) {
            tracing::warn!(sandbox = %self.id(), error = %e, "Failed deleting service host entries");
        }
    }

    /// The container's own entries for `ep`'s addresses.
    fn own_records(&self, ep: &Endpoint) -> Vec<Record<'static>> {
        let cfg = self.inner.config.read();
        if cfg.origin_hosts_path.is_some() || cfg.hostname.is_empty() {
            return Vec::new();
        }
        let fqdn = if cfg.domainname.is_empty() {
            cfg.hostname.clone()
        } else {
            format!("{}.{}", cfg.hostname, cfg.domainname)
        };
        let hosts = match fqdn.split_once('.') {
            Some((short, _)) => format!("{fqdn} {short}"),
            None => fqdn,
        };

        let mut ips: Vec<String> = Vec::new();
        if let Some(a) = ep.iface.addr {
            ips.push(a.ip().to_string());
        }
        if let Some(a) = ep.iface.addrv6 {
            ips.push(a.ip().to_string());
        }
        ips.into_iter().map(|ip| Record::owned(hosts.clone(), ip)).collect()
    }

    pub(crate) fn add_own_hosts_entry(&self, ep: &Endpoint) {
        let records = self.own_records(ep);
        if records.is_empty() {
            return;
        }
        self.add_hosts_entries(&records);
        self.update_parent_hosts();
    }

    pub(crate) fn delete_own_hosts_entry(&self, ep: &Endpoint) {
        self.delete_hosts_entries(&self.own_records(ep));
    }

    /// Repoint names in the hosts files of the containers this one asked
    /// to patch.
    fn update_parent_hosts(&self) {
        let updates = self.inner.config.read().parent_updates.clone();
        if updates.is_empty() {
            return;
        }
        let Ok(ctrl) = self.controller() else {
            return;
        };
        for update in updates {
            let Some(parent) = ctrl.sandbox_by_container_id(&update.container_id) else {
                continue;
            };
            if let Err(e) = etchosts::update(&parent.hosts_path(), &update.ip, &update.name) {
                tracing::warn!(container = %update.container_id, error = %e, "Failed to update parent hosts file");
            }
        }
    }

    /// Regenerate `resolv.conf` from the host file, the user's settings and
    /// the joined networks. A file the user edited is left untouched.
    pub(crate) fn update_dns(&self) -> NetResult<()> {
        let cfg = self.inner.config.read().clone();
        if cfg.origin_resolv_conf_path.is_some() {
            return Ok(());
        }
        let ctrl = self.controller()?;
        let base = match std::fs::read_to_string(&ctrl.config.origin_resolv_conf) {
            Ok(content) => ResolvConf::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ResolvConf::default(),
            Err(e) => return Err(e.into()),
        };

        let entries = self.snapshot();
        let ipv6 = entries.is_empty() || entries.iter().any(|e| e.ipv6);
        let running = self
            .inner
            .resolver
            .lock()
            .as_ref()
            .is_some_and(Resolver::is_running);
        let embedded = running && entries.iter().any(|e| e.ep.need_resolver());

        let out = render(&DnsInputs {
            base,
            dns: &cfg.dns,
            search: &cfg.dns_search,
            options: &cfg.dns_options,
            ipv6,
            embedded,
        });

        {
            let mut state = self.inner.state.lock();
            state.ext_dns.clone_from(&out.ext_dns);
            state.ndots_set = out.ndots_set;
        }
        if embedded {
            if let Some(resolver) = self.inner.resolver.lock().as_ref() {
                resolver.set_ext_servers(&out.ext_dns);
            }
        }

        let path = self.resolv_conf_path();
        if !resolvconf::is_unmodified(&path)? {
            tracing::debug!(sandbox = %self.id(), path = %path.display(), "resolv.conf edited by the user, leaving it alone");
            return Ok(());
        }
        resolvconf::write(&path, &out.content)
    }

    /// Start the embedded resolver inside the namespace. Failures are
    /// logged; the container then keeps its upstream servers.
    pub(crate) fn start_resolver(&self) {
        let mut slot = self.inner.resolver.lock();
        if slot.is_some() {
            return;
        }
        let Some(os) = self.inner.state.lock().os.clone() else {
            return;
        };
        let ctrl = match self.controller() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(sandbox = %self.id(), error = %e, "Resolver setup failed");
                return;
            }
        };

        let backend = Arc::new(SandboxBackend::new(&self.inner));
        let mut resolver = Resolver::new(backend, ctrl.config.resolver_timeout);
        let started = ctrl.resolver_runtime().and_then(|rt| {
            let (udp, tcp) = os.invoke(|| {
                let udp = UdpSocket::bind((EMBEDDED_DNS, 0))?;
                let tcp = TcpListener::bind((EMBEDDED_DNS, 0))?;
                iptables::setup(udp.local_addr()?, tcp.local_addr()?)?;
                Ok((udp, tcp))
            })?;
            resolver.start(rt, udp, tcp)
        });
        if let Err(e) = started {
            tracing::error!(sandbox = %self.id(), error = %e, "Resolver setup and start failed");
            return;
        }
        *slot = Some(resolver);
        drop(slot);

        tracing::debug!(sandbox = %self.id(), "Embedded resolver started");
        if let Err(e) = self.update_dns() {
            tracing::warn!(sandbox = %self.id(), error = %e, "Failed to point resolv.conf at the embedded resolver");
        }
    }

    pub(crate) fn stop_resolver(&self) {
        let resolver = self.inner.resolver.lock().take();
        if let Some(mut resolver) = resolver {
            resolver.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ResolvConf {
        ResolvConf::parse(
            "nameserver 127.0.0.53\nnameserver 10.0.0.2\nnameserver 2001:db8::1\nsearch example.com\noptions edns0\n",
        )
    }

    #[test]
    fn plain_file_drops_loopback_upstreams() {
        let out = render(&DnsInputs {
            base: base(),
            ipv6: false,
            ..DnsInputs::default()
        });
        insta::assert_snapshot!(out.content, @r"
        # Generated by netplane. Edits are kept until the next network change.
        nameserver 10.0.0.2
        search example.com
        options edns0
        ");
        assert!(out.ext_dns.is_empty());
    }

    #[test]
    fn embedded_file_points_at_the_resolver() {
        let out = render(&DnsInputs {
            base: base(),
            ipv6: true,
            embedded: true,
            ..DnsInputs::default()
        });
        let conf = ResolvConf::parse(&out.content);
        assert_eq!(conf.nameservers, ["127.0.0.11", "2001:db8::1"]);
        assert_eq!(conf.options, ["edns0", "ndots:0"]);
        assert!(!out.ndots_set);
        assert_eq!(
            out.ext_dns,
            [
                ExtDns {
                    ip: "127.0.0.53".parse().unwrap(),
                    host_loopback: true
                },
                ExtDns {
                    ip: "10.0.0.2".parse().unwrap(),
                    host_loopback: false
                },
            ]
        );
    }

    #[test]
    fn user_settings_win() {
        let dns = vec!["1.1.1.1".to_string()];
        let options = vec!["ndots:3".to_string()];
        let out = render(&DnsInputs {
            base: base(),
            dns: &dns,
            options: &options,
            embedded: true,
            ..DnsInputs::default()
        });
        let conf = ResolvConf::parse(&out.content);
        assert_eq!(conf.nameservers, ["127.0.0.11"]);
        assert_eq!(conf.options, ["ndots:3"]);
        assert!(out.ndots_set);
        assert_eq!(out.ext_dns.len(), 1);
        assert!(!out.ext_dns[0].host_loopback);
    }

    #[test]
    fn upstreams_are_capped() {
        let conf = ResolvConf::parse(
            "nameserver 10.0.0.1\nnameserver 10.0.0.2\nnameserver 10.0.0.3\nnameserver 10.0.0.4\n",
        );
        let out = render(&DnsInputs {
            base: conf,
            embedded: true,
            ..DnsInputs::default()
        });
        assert_eq!(out.ext_dns.len(), MAX_EXT_DNS);
    }
}
