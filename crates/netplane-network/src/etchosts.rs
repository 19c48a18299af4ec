//! `/etc/hosts` generation and in-place editing.
//!
//! Edits on one file are serialized through a per-path lock.

use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use netplane_common::NetResult;

/// Entries every generated hosts file starts with.
pub const DEFAULT_CONTENT: &[Record<'static>] = &[
    Record::new("localhost", "127.0.0.1"),
    Record::new("localhost ip6-localhost ip6-loopback", "::1"),
    Record::new("ip6-localnet", "fe00::0"),
    Record::new("ip6-mcastprefix", "ff00::0"),
    Record::new("ip6-allnodes", "ff02::1"),
    Record::new("ip6-allrouters", "ff02::2"),
];

static PATH_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    PATH_LOCKS
        .lock()
        .entry(path.to_path_buf())
        .or_default()
        .clone()
}

/// Forget the lock of a hosts file that is going away.
pub fn drop_lock(path: &Path) {
    PATH_LOCKS.lock().remove(path);
}

/// One hosts file line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record<'a> {
    /// Space separated host names.
    pub hosts: std::borrow::Cow<'a, str>,
    /// Address.
    pub ip: std::borrow::Cow<'a, str>,
}

impl<'a> Record<'a> {
    /// A record borrowing its fields.
    #[must_use]
    pub const fn new(hosts: &'a str, ip: &'a str) -> Self {
        Self {
            hosts: std::borrow::Cow::Borrowed(hosts),
            ip: std::borrow::Cow::Borrowed(ip),
        }
    }

    /// A record owning its fields.
    #[must_use]
    pub fn owned(hosts: impl Into<String>, ip: impl Into<String>) -> Record<'static> {
        Record {
            hosts: std::borrow::Cow::Owned(hosts.into()),
            ip: std::borrow::Cow::Owned(ip.into()),
        }
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}\t{}", self.ip, self.hosts)
    }
}

/// Render a fresh hosts file. `ip` and `hostname` produce the container's
/// own entry when both are non-empty.
#[must_use]
pub fn render(ip: &str, hostname: &str, domainname: &str, extra: &[Record<'_>]) -> String {
    let mut content = String::new();

    if !ip.is_empty() && !hostname.is_empty() {
        let fqdn = if domainname.is_empty() {
            hostname.to_string()
        } else {
            format!("{hostname}.{domainname}")
        };
        let hosts = match fqdn.split_once('.') {
            Some((short, _)) => format!("{fqdn} {short}"),
            None => fqdn,
        };
        content.push_str(&Record::new(&hosts, ip).to_string());
    }

    for record in DEFAULT_CONTENT.iter().chain(extra) {
        content.push_str(&record.to_string());
    }
    content
}

/// Write a fresh hosts file at `path`.
pub fn build(
    path: &Path,
    ip: &str,
    hostname: &str,
    domainname: &str,
    extra: &[Record<'_>],
) -> NetResult<()> {
    let lock = path_lock(path);
    let _guard = lock.lock();
    std::fs::write(path, render(ip, hostname, domainname, extra))?;
    Ok(())
}

/// Append `records` to the file.
pub fn add(path: &Path, records: &[Record<'_>]) -> NetResult<()> {
    if records.is_empty() {
        return Ok(());
    }
    let lock = path_lock(path);
    let _guard = lock.lock();

    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    let mut buf = String::new();
    for record in records {
        buf.push_str(&record.to_string());
    }
    file.write_all(buf.as_bytes())?;
    Ok(())
}

/// Remove lines that exactly match one of `records`.
pub fn delete(path: &Path, records: &[Record<'_>]) -> NetResult<()> {
    if records.is_empty() {
        return Ok(());
    }
    let lock = path_lock(path);
    let _guard = lock.lock();

    let content = std::fs::read_to_string(path)?;
    let doomed: Vec<String> = records
        .iter()
        .map(|r| format!("{}\t{}", r.ip, r.hosts))
        .collect();

    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if doomed.iter().any(|d| d == line) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Point every entry whose first host name is `hostname` (or a name under
/// it) at `ip`.
pub fn update(path: &Path, ip: &str, hostname: &str) -> NetResult<()> {
    let lock = path_lock(path);
    let _guard = lock.lock();

    let content = std::fs::read_to_string(path)?;
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        match line.split_once('\t') {
            Some((_, hosts)) if names_host(hosts, hostname) => {
                out.push_str(&format!("{ip}\t{hosts}"));
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn names_host(hosts: &str, hostname: &str) -> bool {
    hosts.split_whitespace().next().is_some_and(|first| {
        first == hostname
            || first
                .strip_prefix(hostname)
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_default() {
        insta::assert_snapshot!(render("", "", "", &[]), @r"
        127.0.0.1	localhost
        ::1	localhost ip6-localhost ip6-loopback
        fe00::0	ip6-localnet
        ff00::0	ip6-mcastprefix
        ff02::1	ip6-allnodes
        ff02::2	ip6-allrouters
        ");
    }

    #[test]
    fn render_with_hostname() {
        let content = render("10.11.12.13", "testhostname", "testdomainname", &[]);
        assert!(content.starts_with("10.11.12.13\ttesthostname.testdomainname testhostname\n"));

        let content = render("10.11.12.13", "testhostname", "", &[]);
        assert!(content.starts_with("10.11.12.13\ttesthostname\n"));
    }

    #[test]
    fn build_with_extra() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let extra = [Record::new("extra", "1.2.3.4")];
        build(&path, "", "", "", &extra).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("1.2.3.4\textra\n"));
    }

    #[test]
    fn add_then_delete_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        build(&path, "10.0.0.2", "web", "", &[]).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let records = [
            Record::new("db", "10.0.0.3"),
            Record::new("db.backend", "10.0.0.3"),
        ];
        add(&path, &records).unwrap();
        let during = std::fs::read_to_string(&path).unwrap();
        assert!(during.contains("10.0.0.3\tdb\n"));
        assert!(during.contains("10.0.0.3\tdb.backend\n"));

        delete(&path, &records).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        drop_lock(&path);
    }

    #[test]
    fn update_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        build(&path, "", "", "", &[Record::new("parent", "1.1.1.1")]).unwrap();

        update(&path, "2.2.2.2", "parent").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("2.2.2.2\tparent\n"));
        assert!(!content.contains("1.1.1.1"));

        // A name sharing only a prefix is left alone.
        update(&path, "3.3.3.3", "par").unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("2.2.2.2\tparent\n"));
    }
}
