//! `resolv.conf` parsing and generation.
//!
//! Generated files are paired with a `<file>.hash` companion holding the
//! SHA-256 of the content last written, so later updates can tell whether
//! the user edited the file in the meantime.

use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use netplane_common::{IpFamily, NetError, NetResult};

/// Address of the embedded DNS server inside every sandbox.
pub const EMBEDDED_DNS: &str = "127.0.0.11";

/// First line of every generated file.
pub const HEADER: &str = "# Generated by netplane. Edits are kept until the next network change.";

/// Default IPv4 upstreams when the origin file has none usable.
pub const DEFAULT_IPV4_DNS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// Default IPv6 upstreams when the origin file has none usable.
pub const DEFAULT_IPV6_DNS: &[&str] = &["2001:4860:4860::8888", "2001:4860:4860::8844"];

/// Default location of the host file.
pub const DEFAULT_PATH: &str = "/etc/resolv.conf";

/// Parsed view of a `resolv.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    /// `nameserver` entries in file order.
    pub nameservers: Vec<String>,
    /// Domains of the last `search` line.
    pub search: Vec<String>,
    /// Options of the last `options` line.
    pub options: Vec<String>,
}

impl ResolvConf {
    /// Parse file content. Comments and unknown directives are ignored.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();
        for line in content.lines() {
            let line = line.split(['#', ';']).next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(ns) = fields.next() {
                        conf.nameservers.push(ns.to_string());
                    }
                }
                Some("search") => conf.search = fields.map(str::to_string).collect(),
                Some("options") => conf.options = fields.map(str::to_string).collect(),
                _ => {}
            }
        }
        conf
    }

    /// Nameservers of one address family.
    #[must_use]
    pub fn nameservers_of(&self, family: IpFamily) -> Vec<String> {
        self.nameservers
            .iter()
            .filter(|ns| {
                ns.parse::<IpAddr>()
                    .is_ok_and(|ip| IpFamily::of(&ip) == family)
            })
            .cloned()
            .collect()
    }

    /// Whether an `ndots` option is present.
    #[must_use]
    pub fn has_ndots(&self) -> bool {
        self.options.iter().any(|o| o.starts_with("ndots:"))
    }

    /// Render the file, header first.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        out.push('\n');
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {ns}\n"));
        }
        if !self.search.is_empty() {
            out.push_str(&format!("search {}\n", self.search.join(" ")));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

/// Upstream servers usable from inside a sandbox: loopback servers are
/// dropped (they point at the host), as are IPv6 servers when `ipv6` is
/// off. Falls back to public defaults when nothing is left.
#[must_use]
pub fn usable_upstreams(conf: &ResolvConf, ipv6: bool) -> Vec<String> {
    let mut servers: Vec<String> = conf
        .nameservers
        .iter()
        .filter(|ns| match ns.parse::<IpAddr>() {
            Ok(ip) => !ip.is_loopback() && (ipv6 || ip.is_ipv4()),
            Err(_) => false,
        })
        .cloned()
        .collect();

    if servers.is_empty() {
        tracing::info!("No non-localhost DNS nameservers are left, using default external servers");
        servers.extend(DEFAULT_IPV4_DNS.iter().map(|s| (*s).to_string()));
        if ipv6 {
            servers.extend(DEFAULT_IPV6_DNS.iter().map(|s| (*s).to_string()));
        }
    }
    servers
}

/// SHA-256 of `content`, hex encoded.
#[must_use]
pub fn hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Path of the companion hash file.
#[must_use]
pub fn hash_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".hash");
    PathBuf::from(name)
}

/// Whether the file at `path` still holds what netplane last wrote. A
/// missing file or hash counts as unmodified.
pub fn is_unmodified(path: &Path) -> NetResult<bool> {
    let stored = match std::fs::read_to_string(hash_path(path)) {
        Ok(h) => h,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    let current = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    Ok(hash(&current) == stored.trim())
}

/// Write `content` and its hash file, each replaced atomically.
pub fn write(path: &Path, content: &str) -> NetResult<()> {
    write_atomic(path, content.as_bytes())?;
    write_atomic(&hash_path(path), hash(content).as_bytes())
}

/// Replace `path` with `data` through a temp file in the same directory.
/// The result has mode 0644.
pub fn write_atomic(path: &Path, data: &[u8]) -> NetResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| NetError::invalid_parameter(format!("no parent for {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| NetError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "\
# host file
nameserver 127.0.0.53
nameserver 10.0.0.1 # office
nameserver 2001:db8::1
search example.com corp.example.com
options edns0 ndots:2
";

    #[test]
    fn parse() {
        let conf = ResolvConf::parse(HOST);
        assert_eq!(conf.nameservers, ["127.0.0.53", "10.0.0.1", "2001:db8::1"]);
        assert_eq!(conf.search, ["example.com", "corp.example.com"]);
        assert_eq!(conf.options, ["edns0", "ndots:2"]);
        assert!(conf.has_ndots());
        assert_eq!(conf.nameservers_of(IpFamily::V6), ["2001:db8::1"]);
    }

    #[test]
    fn upstreams_skip_loopback() {
        let conf = ResolvConf::parse(HOST);
        assert_eq!(usable_upstreams(&conf, false), ["10.0.0.1"]);
        assert_eq!(usable_upstreams(&conf, true), ["10.0.0.1", "2001:db8::1"]);

        let local_only = ResolvConf::parse("nameserver 127.0.0.1\n");
        assert_eq!(usable_upstreams(&local_only, false), DEFAULT_IPV4_DNS);
    }

    proptest::proptest! {
        #[test]
        fn upstreams_never_loop_back(octets in proptest::collection::vec(proptest::array::uniform4(0u8..), 0..6)) {
            let content: String = octets
                .iter()
                .map(|[a, b, c, d]| format!("nameserver {a}.{b}.{c}.{d}\n"))
                .collect();
            let servers = usable_upstreams(&ResolvConf::parse(&content), false);
            proptest::prop_assert!(!servers.is_empty());
            for s in &servers {
                let ip: IpAddr = s.parse().unwrap();
                proptest::prop_assert!(ip.is_ipv4() && !ip.is_loopback());
            }
        }
    }

    #[test]
    fn render() {
        let conf = ResolvConf {
            nameservers: vec![EMBEDDED_DNS.to_string()],
            search: vec!["example.com".to_string()],
            options: vec!["ndots:0".to_string()],
        };
        insta::assert_snapshot!(conf.render(), @r"
        # Generated by netplane. Edits are kept until the next network change.
        nameserver 127.0.0.11
        search example.com
        options ndots:0
        ");
    }

    #[test]
    fn hash_tracks_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        assert!(is_unmodified(&path).unwrap());

        write(&path, "nameserver 127.0.0.11\n").unwrap();
        assert!(is_unmodified(&path).unwrap());
        assert!(hash_path(&path).exists());

        std::fs::write(&path, "nameserver 1.1.1.1\n").unwrap();
        assert!(!is_unmodified(&path).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        write(&path, "nameserver 127.0.0.11\n").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
