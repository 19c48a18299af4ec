//! Hand-off of externally created namespaces.
//!
//! A container runtime that creates the network namespace itself reports
//! it over a Unix socket: one JSON message naming the container and the
//! namespace path, answered by `success` or the error text.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use netplane_common::{NetError, NetResult, NetplanePaths};

use crate::controller::ControllerInner;

/// Reply of a successful hand-off.
pub const SUCCESS: &str = "success";

const MAX_MESSAGE: usize = 1280;

/// The hand-off message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetKeyData {
    /// Container whose sandbox gets the namespace.
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    /// Path of the namespace.
    #[serde(rename = "Key")]
    pub key: String,
}

/// Listener thread accepting hand-offs for one controller.
#[derive(Debug)]
pub(crate) struct ExternalKeyListener {
    path: PathBuf,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ExternalKeyListener {
    /// Listen at `path` on behalf of `ctrl`.
    pub(crate) fn start(ctrl: Weak<ControllerInner>, path: &Path) -> NetResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| NetError::internal(format!("failed to bind external key socket: {e}")))?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopping);
        let thread = std::thread::Builder::new()
            .name("netplane-extkey".to_string())
            .spawn(move || accept_loop(&listener, &ctrl, &flag))?;

        tracing::info!(path = %path.display(), "External key listener started");
        Ok(Self {
            path: path.to_path_buf(),
            stopping,
            thread: Some(thread),
        })
    }

    /// Stop accepting and remove the socket.
    pub(crate) fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the blocked accept.
        let _ = UnixStream::connect(&self.path);
        let _ = thread.join();
        let _ = std::fs::remove_file(&self.path);
        tracing::debug!(path = %self.path.display(), "External key listener stopped");
    }
}

impl Drop for ExternalKeyListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &UnixListener, ctrl: &Weak<ControllerInner>, stopping: &AtomicBool) {
    for conn in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let stream = match conn {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Error accepting external key connection");
                continue;
            }
        };
        let ctrl = ctrl.clone();
        let spawned = std::thread::Builder::new()
            .name("netplane-extkey-conn".to_string())
            .spawn(move || serve(stream, &ctrl));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Could not serve external key connection");
        }
    }
}

fn serve(mut stream: UnixStream, ctrl: &Weak<ControllerInner>) {
    let reply = match process(&mut stream, ctrl) {
        Ok(()) => SUCCESS.to_string(),
        Err(e) => e.to_string(),
    };
    if let Err(e) = stream.write_all(reply.as_bytes()) {
        tracing::error!(error = %e, "Failed to reply to external key request");
    }
}

fn process(stream: &mut UnixStream, ctrl: &Weak<ControllerInner>) -> NetResult<()> {
    let mut buf = vec![0u8; MAX_MESSAGE];
    let n = stream.read(&mut buf)?;
    let data: SetKeyData = serde_json::from_slice(&buf[..n])?;

    let ctrl = ctrl
        .upgrade()
        .ok_or_else(|| NetError::internal("controller is gone"))?;
    let sb = ctrl.sandbox_by_container_id(&data.container_id).ok_or_else(|| {
        NetError::bad_request(format!("no sandbox present for {}", data.container_id))
    })?;
    sb.set_key(&data.key)
}

/// Tell controller `controller_id`, running with exec root `exec_root`,
/// that the namespace of `container_id` is bound at `key`.
///
/// # Errors
///
/// Connection failures, or the controller's error text.
pub fn set_external_key(controller_id: &str, container_id: &str, key: &str, exec_root: &Path) -> NetResult<()> {
    let paths = NetplanePaths {
        root: NetplanePaths::new().root,
        exec_root: exec_root.to_path_buf(),
    };
    set_external_key_at(&paths.external_key_socket(controller_id), container_id, key)
}

/// Like [`set_external_key`], dialing `socket` directly.
pub fn set_external_key_at(socket: &Path, container_id: &str, key: &str) -> NetResult<()> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|e| NetError::internal(format!("failed to reach {}: {e}", socket.display())))?;
    let data = SetKeyData {
        container_id: container_id.to_string(),
        key: key.to_string(),
    };
    stream
        .write_all(&serde_json::to_vec(&data)?)
        .map_err(|e| NetError::internal(format!("failed to send key: {e}")))?;

    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf)?;
    let reply = String::from_utf8_lossy(&buf[..n]);
    if reply != SUCCESS {
        return Err(NetError::internal(reply.into_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_uses_wire_names() {
        let json = serde_json::to_string(&SetKeyData {
            container_id: "c1".into(),
            key: "/proc/42/ns/net".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"ContainerID":"c1","Key":"/proc/42/ns/net"}"#);
    }
}
