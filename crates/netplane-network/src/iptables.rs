//! Thin iptables/ip6tables wrapper with idempotent rule helpers.

use once_cell::sync::Lazy;

use netplane_common::{IpFamily, NetResult};

use crate::cmd;

/// Table holding address translation rules.
pub const NAT: &str = "nat";

/// Table holding filtering rules.
pub const FILTER: &str = "filter";

static IP6TABLES_USABLE: Lazy<bool> = Lazy::new(|| IpTables::new(IpFamily::V6).probe());

/// iptables front-end for one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpTables {
    family: IpFamily,
}

impl IpTables {
    /// Front-end for `family`.
    #[must_use]
    pub const fn new(family: IpFamily) -> Self {
        Self { family }
    }

    /// The IPv4 front-end.
    #[must_use]
    pub const fn v4() -> Self {
        Self::new(IpFamily::V4)
    }

    /// Whether `ip6tables` works on this host. Probed once.
    #[must_use]
    pub fn ipv6_usable() -> bool {
        *IP6TABLES_USABLE
    }

    const fn program(self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn probe(self) -> bool {
        cmd::succeeds(self.program(), &["-w", "-t", NAT, "-L", "-n"])
    }

    /// Address family of this front-end.
    #[must_use]
    pub const fn family(self) -> IpFamily {
        self.family
    }

    /// Run an arbitrary command.
    pub fn raw(self, args: &[&str]) -> NetResult<()> {
        let mut full = vec!["-w"];
        full.extend_from_slice(args);
        cmd::run(self.program(), &full)
    }

    /// Whether `rule` is present in `table`/`chain`.
    #[must_use]
    pub fn exists(self, table: &str, chain: &str, rule: &[&str]) -> bool {
        let mut args = vec!["-w", "-t", table, "-C", chain];
        args.extend_from_slice(rule);
        cmd::succeeds(self.program(), &args)
    }

    /// Whether `chain` exists in `table`.
    #[must_use]
    pub fn chain_exists(self, table: &str, chain: &str) -> bool {
        cmd::succeeds(self.program(), &["-w", "-t", table, "-n", "-L", chain])
    }

    /// Create `chain` in `table` unless it exists.
    pub fn ensure_chain(self, table: &str, chain: &str) -> NetResult<()> {
        if self.chain_exists(table, chain) {
            return Ok(());
        }
        tracing::debug!(program = self.program(), table, chain, "Creating chain");
        self.raw(&["-t", table, "-N", chain])
    }

    /// Append `rule` unless already present.
    pub fn append_unique(self, table: &str, chain: &str, rule: &[&str]) -> NetResult<()> {
        if self.exists(table, chain, rule) {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-A", chain];
        args.extend_from_slice(rule);
        self.raw(&args)
    }

    /// Insert `rule` at the head of `chain` unless already present.
    pub fn insert_unique(self, table: &str, chain: &str, rule: &[&str]) -> NetResult<()> {
        if self.exists(table, chain, rule) {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-I", chain];
        args.extend_from_slice(rule);
        self.raw(&args)
    }

    /// Delete `rule` if present.
    pub fn delete(self, table: &str, chain: &str, rule: &[&str]) -> NetResult<()> {
        if !self.exists(table, chain, rule) {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(rule);
        self.raw(&args)
    }

    /// Flush and remove `chain`. A missing chain is not an error.
    pub fn remove_chain(self, table: &str, chain: &str) -> NetResult<()> {
        if !self.chain_exists(table, chain) {
            return Ok(());
        }
        self.raw(&["-t", table, "-F", chain])?;
        self.raw(&["-t", table, "-X", chain])
    }
}

/// Enable IPv4 forwarding on the host.
pub fn enable_ip_forwarding() -> NetResult<()> {
    let path = "/proc/sys/net/ipv4/ip_forward";
    if std::fs::read_to_string(path).is_ok_and(|v| v.trim() == "1") {
        return Ok(());
    }
    std::fs::write(path, "1")?;
    tracing::info!("IP forwarding enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programs() {
        assert_eq!(IpTables::v4().program(), "iptables");
        assert_eq!(IpTables::new(IpFamily::V6).program(), "ip6tables");
    }
}
