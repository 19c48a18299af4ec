//! NAT rules that steer `127.0.0.11:53` to the resolver's real ports.
//!
//! Must run inside the sandbox namespace.

use std::net::SocketAddr;

use netplane_common::NetResult;
use netplane_network::iptables::{IpTables, NAT};
use netplane_network::resolvconf::EMBEDDED_DNS;

/// Chain reached from `OUTPUT`.
pub const OUTPUT_CHAIN: &str = "DOCKER_OUTPUT";
/// Chain reached from `POSTROUTING`.
pub const POSTROUTING_CHAIN: &str = "DOCKER_POSTROUTING";

/// A rule: the chain it lives in and its arguments.
pub type Rule = (&'static str, Vec<String>);

/// Jumps from the built-in chains into ours.
#[must_use]
pub fn jump_rules() -> Vec<Rule> {
    vec![
        ("OUTPUT", args(&["-d", EMBEDDED_DNS, "-j", OUTPUT_CHAIN])),
        ("POSTROUTING", args(&["-d", EMBEDDED_DNS, "-j", POSTROUTING_CHAIN])),
    ]
}

/// DNAT of queries to the listeners and SNAT of the replies back to port
/// 53, for both protocols.
#[must_use]
pub fn nat_rules(udp: SocketAddr, tcp: SocketAddr) -> Vec<Rule> {
    let mut rules = Vec::new();
    for (proto, addr) in [("udp", udp), ("tcp", tcp)] {
        rules.push((
            OUTPUT_CHAIN,
            args(&[
                "-d", EMBEDDED_DNS, "-p", proto, "--dport", "53", "-j", "DNAT",
                "--to-destination", &addr.to_string(),
            ]),
        ));
        rules.push((
            POSTROUTING_CHAIN,
            args(&[
                "-s", EMBEDDED_DNS, "-p", proto, "--sport", &addr.port().to_string(), "-j", "SNAT",
                "--to-source", ":53",
            ]),
        ));
    }
    rules
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn refs(rule: &[String]) -> Vec<&str> {
    rule.iter().map(String::as_str).collect()
}

/// Install the chains and rules.
pub fn setup(udp: SocketAddr, tcp: SocketAddr) -> NetResult<()> {
    let ipt = IpTables::v4();
    ipt.ensure_chain(NAT, OUTPUT_CHAIN)?;
    ipt.ensure_chain(NAT, POSTROUTING_CHAIN)?;
    // Old rules point at ports of a previous listener.
    ipt.raw(&["-t", NAT, "-F", OUTPUT_CHAIN])?;
    ipt.raw(&["-t", NAT, "-F", POSTROUTING_CHAIN])?;

    for (chain, rule) in jump_rules() {
        ipt.append_unique(NAT, chain, &refs(&rule))?;
    }
    for (chain, rule) in nat_rules(udp, tcp) {
        ipt.insert_unique(NAT, chain, &refs(&rule))?;
    }
    tracing::debug!(udp = %udp, tcp = %tcp, "Resolver NAT rules installed");
    Ok(())
}

/// Remove the jumps and the chains.
pub fn teardown() -> NetResult<()> {
    let ipt = IpTables::v4();
    for (chain, rule) in jump_rules() {
        ipt.delete(NAT, chain, &refs(&rule))?;
    }
    ipt.remove_chain(NAT, OUTPUT_CHAIN)?;
    ipt.remove_chain(NAT, POSTROUTING_CHAIN)
}
