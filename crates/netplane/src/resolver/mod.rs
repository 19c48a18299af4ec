//! Embedded DNS server of a sandbox.
//!
//! Each sandbox that needs name resolution gets a [`Resolver`] listening on
//! `127.0.0.11` inside its namespace. Names of containers on the sandbox's
//! networks are answered locally; everything else is forwarded to the
//! upstream servers the sandbox inherited from the host. The sockets are
//! bound inside the namespace, while serving runs on the controller's
//! tokio runtime.

mod forward;
mod handler;
pub mod iptables;

use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use netplane_common::{NetError, NetResult};

use crate::service::ServiceTarget;

pub use handler::LOCAL_TTL;

/// Upstream servers tried per query.
pub const MAX_EXT_DNS: usize = 3;

/// Forwarded queries allowed in flight at once.
pub const MAX_CONCURRENT: usize = 1024;

/// An upstream nameserver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtDns {
    /// Server address; queries go to port 53.
    #[serde(rename = "IPStr")]
    pub ip: IpAddr,
    /// Whether the server must be reached from the host namespace.
    #[serde(rename = "HostLoopback")]
    pub host_loopback: bool,
}

/// Name data and sockets a [`Resolver`] works with.
pub trait ResolverBackend: Send + Sync + 'static {
    /// Addresses of `name`. The flag reports a name that exists but has no
    /// address of the requested family.
    fn resolve_name(&self, name: &str, v6: bool) -> (Option<Vec<IpAddr>>, bool);

    /// Name that owns `ip`.
    fn resolve_ip(&self, ip: IpAddr) -> Option<String>;

    /// Targets of an SRV name.
    fn resolve_service(&self, name: &str) -> Vec<ServiceTarget>;

    /// Whether the user pinned the `ndots` option.
    fn ndots_set(&self) -> bool;

    /// A UDP socket connected to upstream `server`.
    fn connect_udp(&self, server: SocketAddr) -> NetResult<UdpSocket> {
        connect_udp(server)
    }

    /// A TCP connection to upstream `server`.
    fn connect_tcp(&self, server: SocketAddr, timeout: Duration) -> NetResult<TcpStream> {
        Ok(TcpStream::connect_timeout(&server, timeout)?)
    }
}

/// A UDP socket bound to the wildcard address of `server`'s family and
/// connected to it.
pub(crate) fn connect_udp(server: SocketAddr) -> NetResult<UdpSocket> {
    let local: SocketAddr = if server.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(server)?;
    Ok(socket)
}

/// The embedded DNS server.
pub struct Resolver {
    shared: Arc<forward::Shared>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("udp_addr", &self.udp_addr)
            .field("tcp_addr", &self.tcp_addr)
            .field("running", &self.shutdown.is_some())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// A stopped resolver answering from `backend`. Upstream exchanges give
    /// up after `timeout`.
    #[must_use]
    pub fn new(backend: Arc<dyn ResolverBackend>, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(forward::Shared::new(backend, timeout)),
            shutdown: None,
            tasks: Vec::new(),
            udp_addr: None,
            tcp_addr: None,
        }
    }

    /// Replace the upstream servers. Only the first [`MAX_EXT_DNS`] are
    /// used.
    pub fn set_ext_servers(&self, servers: &[ExtDns]) {
        let servers: Vec<ExtDns> = servers.iter().take(MAX_EXT_DNS).copied().collect();
        tracing::debug!(servers = ?servers, "Resolver upstream servers set");
        *self.shared.ext_dns.write() = servers;
    }

    /// Upstream servers in use.
    #[must_use]
    pub fn ext_servers(&self) -> Vec<ExtDns> {
        self.shared.ext_dns.read().clone()
    }

    /// Address of the UDP listener.
    #[must_use]
    pub const fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Address of the TCP listener.
    #[must_use]
    pub const fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Whether the resolver is serving.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Serve queries arriving on the given sockets, which may have been
    /// bound in another namespace.
    ///
    /// # Errors
    ///
    /// Fails if the resolver already runs or the sockets cannot be handed
    /// to the runtime.
    pub fn start(&mut self, rt: &Runtime, udp: UdpSocket, tcp: TcpListener) -> NetResult<()> {
        if self.shutdown.is_some() {
            return Err(NetError::forbidden("resolver is already running"));
        }
        udp.set_nonblocking(true)?;
        tcp.set_nonblocking(true)?;
        self.udp_addr = Some(udp.local_addr()?);
        self.tcp_addr = Some(tcp.local_addr()?);

        let (udp, tcp) = {
            let _enter = rt.enter();
            (
                tokio::net::UdpSocket::from_std(udp)?,
                tokio::net::TcpListener::from_std(tcp)?,
            )
        };

        let (tx, rx) = watch::channel(false);
        self.tasks.push(rt.spawn(forward::serve_udp(
            Arc::clone(&self.shared),
            Arc::new(udp),
            rx.clone(),
        )));
        self.tasks
            .push(rt.spawn(forward::serve_tcp(Arc::clone(&self.shared), tcp, rx)));
        self.shutdown = Some(tx);

        tracing::debug!(udp = ?self.udp_addr, tcp = ?self.tcp_addr, "Resolver started");
        Ok(())
    }

    /// Stop serving. The listeners close once their tasks see the signal.
    pub fn stop(&mut self) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.inflight.lock().clear();
        tracing::debug!(udp = ?self.udp_addr, "Resolver stopped");
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.stop();
    }
}
