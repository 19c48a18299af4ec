#![allow(unsafe_code)]
//! Network namespace syscalls.
//!
//! Every entry into a namespace happens on a short-lived scoped thread, so
//! no caller thread ever observes a foreign namespace.

use std::path::Path;

use netplane_common::{NetError, NetResult};

/// Path of the calling thread's network namespace.
pub const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Run `f` on a fresh thread that has joined the namespace at `path`.
#[cfg(target_os = "linux")]
pub fn run_in<T, F>(path: &Path, f: F) -> NetResult<T>
where
    F: FnOnce() -> NetResult<T> + Send,
    T: Send,
{
    let target = std::fs::File::open(path).map_err(|e| NetError::Internal {
        message: format!("cannot open namespace '{}': {e}", path.display()),
    })?;

    std::thread::scope(|scope| {
        scope
            .spawn(move || {
                let _guard = NamespaceGuard::enter(&target)?;
                f()
            })
            .join()
            .map_err(|_| NetError::internal("namespace worker panicked"))?
    })
}

#[cfg(not(target_os = "linux"))]
pub fn run_in<T, F>(_path: &Path, _f: F) -> NetResult<T>
where
    F: FnOnce() -> NetResult<T> + Send,
    T: Send,
{
    Err(NetError::NotImplemented {
        feature: "network namespaces".to_string(),
    })
}

/// Create a network namespace and bind-mount it at `key`.
#[cfg(target_os = "linux")]
pub fn create(key: &Path) -> NetResult<()> {
    if let Some(parent) = key.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(key)?;

    let result = std::thread::scope(|scope| {
        scope
            .spawn(|| {
                // Safety: the unshare only affects this worker thread, which
                // exits right after the new namespace is pinned by the mount.
                unsafe {
                    rustix::thread::unshare_unsafe(rustix::thread::UnshareFlags::NEWNET).map_err(
                        |e| NetError::Internal {
                            message: format!("Failed to unshare network namespace: {e}"),
                        },
                    )?;
                }
                rustix::mount::mount_bind(THREAD_NETNS, key).map_err(|e| NetError::Internal {
                    message: format!("Failed to bind namespace at {}: {e}", key.display()),
                })
            })
            .join()
            .map_err(|_| NetError::internal("namespace worker panicked"))?
    });

    if result.is_err() {
        let _ = std::fs::remove_file(key);
    }
    result?;
    tracing::debug!(key = %key.display(), "Created network namespace");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn create(_key: &Path) -> NetResult<()> {
    Err(NetError::NotImplemented {
        feature: "network namespaces".to_string(),
    })
}

/// Bind-mount an existing namespace file at `key`.
#[cfg(target_os = "linux")]
pub fn bind(source: &Path, key: &Path) -> NetResult<()> {
    if let Some(parent) = key.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(key)?;
    rustix::mount::mount_bind(source, key).map_err(|e| NetError::Internal {
        message: format!(
            "Failed to bind {} at {}: {e}",
            source.display(),
            key.display()
        ),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn bind(_source: &Path, _key: &Path) -> NetResult<()> {
    Err(NetError::NotImplemented {
        feature: "network namespaces".to_string(),
    })
}

/// Detach the bind mount at `key` and remove the file.
#[cfg(target_os = "linux")]
pub fn unmount(key: &Path) -> NetResult<()> {
    if let Err(e) = rustix::mount::unmount(key, rustix::mount::UnmountFlags::DETACH) {
        tracing::warn!(key = %key.display(), error = %e, "Failed to unmount namespace");
    }
    match std::fs::remove_file(key) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_key: &Path) -> NetResult<()> {
    Ok(())
}

/// Joins a namespace and moves the thread back when dropped.
#[cfg(target_os = "linux")]
struct NamespaceGuard {
    original: std::fs::File,
}

#[cfg(target_os = "linux")]
impl NamespaceGuard {
    fn enter(target: &std::fs::File) -> NetResult<Self> {
        use std::os::fd::AsRawFd;

        let original = std::fs::File::open(THREAD_NETNS)?;
        // Safety: both descriptors are open namespace files and CLONE_NEWNET
        // restricts the switch to the network namespace of this thread.
        let ret = unsafe { libc::setns(target.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(NetError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { original })
    }
}

#[cfg(target_os = "linux")]
impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;

        // Safety: `original` was opened from this thread's own namespace link.
        let ret = unsafe { libc::setns(self.original.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret < 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "Failed to restore network namespace"
            );
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn missing_namespace() {
        let err = run_in(Path::new("/nonexistent/netns"), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("cannot open namespace"));
    }

    #[test]
    fn unmount_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unmount(&dir.path().join("gone")).is_ok());
    }
}
