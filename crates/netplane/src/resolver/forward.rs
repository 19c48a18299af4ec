//! Listener loops and upstream forwarding.

use std::collections::HashMap;
use std::future::Future;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Semaphore, oneshot, watch};
use trust_dns_proto::error::ProtoError;
use trust_dns_proto::op::{Message, ResponseCode};
use trust_dns_proto::rr::RecordType;

use netplane_common::{NetError, NetResult};

use super::handler::{self, Outcome};
use super::{ExtDns, MAX_CONCURRENT, ResolverBackend};

const TCP_MAX: usize = 65535;
const DNS_PORT: u16 = 53;

type InflightKey = (u16, String, RecordType);

/// State the listener tasks share.
pub(super) struct Shared {
    backend: Arc<dyn ResolverBackend>,
    pub(super) ext_dns: RwLock<Vec<ExtDns>>,
    timeout: Duration,
    pub(super) inflight: Mutex<HashMap<InflightKey, Vec<oneshot::Sender<Message>>>>,
    permits: Semaphore,
}

impl Shared {
    pub(super) fn new(backend: Arc<dyn ResolverBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            ext_dns: RwLock::new(Vec::new()),
            timeout,
            inflight: Mutex::new(HashMap::new()),
            permits: Semaphore::new(MAX_CONCURRENT),
        }
    }

    /// Reply bytes for the query in `bytes`, if it deserves one.
    async fn serve(&self, bytes: &[u8], tcp: bool) -> Option<Vec<u8>> {
        let query = match Message::from_vec(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed DNS query");
                return None;
            }
        };
        let max_size = if tcp { TCP_MAX } else { handler::udp_size(&query) };

        let resp = match handler::answer(self.backend.as_ref(), &query) {
            Outcome::Reply(resp) => resp,
            Outcome::Drop => return None,
            Outcome::Forward => self.forward_coalesced(&query, bytes, tcp).await,
        };
        handler::encode(resp, max_size, tcp)
    }

    /// Forward, sharing the upstream answer with identical queries that
    /// arrive meanwhile.
    async fn forward_coalesced(&self, query: &Message, bytes: &[u8], tcp: bool) -> Message {
        let Some(q) = query.queries().first() else {
            return handler::nxdomain(query);
        };
        let key: InflightKey = (query.id(), q.name().to_ascii().to_ascii_lowercase(), q.query_type());

        let waiter = {
            let mut inflight = self.inflight.lock();
            if let Some(waiters) = inflight.get_mut(&key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                inflight.insert(key.clone(), Vec::new());
                None
            }
        };
        if let Some(rx) = waiter {
            tracing::trace!(name = %key.1, "Joining in-flight upstream query");
            return rx.await.unwrap_or_else(|_| handler::nxdomain(query));
        }

        let resp = self
            .forward(query, bytes, tcp)
            .await
            .unwrap_or_else(|| handler::nxdomain(query));

        let waiters = self.inflight.lock().remove(&key).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(resp.clone());
        }
        resp
    }

    async fn forward(&self, query: &Message, bytes: &[u8], tcp: bool) -> Option<Message> {
        let Ok(_permit) = self.permits.try_acquire() else {
            tracing::warn!("More than {MAX_CONCURRENT} concurrent queries, dropping one");
            return None;
        };

        let servers = self.ext_dns.read().clone();
        for server in servers {
            let addr = SocketAddr::new(server.ip, DNS_PORT);
            match self.exchange(server, addr, bytes, tcp).await {
                Ok(resp) if resp.id() != query.id() => {
                    tracing::debug!(server = %addr, "Upstream reply ID mismatch");
                }
                Ok(resp) if resp.response_code() == ResponseCode::ServFail => {
                    tracing::debug!(server = %addr, "Upstream server failure, trying next");
                }
                Ok(resp) => return Some(resp),
                Err(e) => {
                    tracing::debug!(server = %addr, error = %e, "Upstream exchange failed");
                }
            }
        }
        None
    }

    async fn exchange(&self, server: ExtDns, addr: SocketAddr, bytes: &[u8], tcp: bool) -> NetResult<Message> {
        if !tcp {
            let resp = self.exchange_udp(server, addr, bytes).await?;
            if !resp.truncated() {
                return Ok(resp);
            }
            tracing::debug!(server = %addr, "Truncated upstream reply, retrying over TCP");
        }
        self.exchange_tcp(server, addr, bytes).await
    }

    async fn exchange_udp(&self, server: ExtDns, addr: SocketAddr, bytes: &[u8]) -> NetResult<Message> {
        let socket = if server.host_loopback {
            super::connect_udp(addr)?
        } else {
            let backend = Arc::clone(&self.backend);
            tokio::task::spawn_blocking(move || backend.connect_udp(addr))
                .await
                .map_err(|e| NetError::internal(format!("upstream dial task failed: {e}")))??
        };
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        let raw = self
            .timed(async {
                socket.send(bytes).await?;
                let mut buf = vec![0u8; TCP_MAX];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok::<_, std::io::Error>(buf)
            })
            .await?;
        Message::from_vec(&raw).map_err(malformed)
    }

    async fn exchange_tcp(&self, server: ExtDns, addr: SocketAddr, bytes: &[u8]) -> NetResult<Message> {
        let timeout = self.timeout;
        let stream = if server.host_loopback {
            TcpStream::connect_timeout(&addr, timeout)?
        } else {
            let backend = Arc::clone(&self.backend);
            tokio::task::spawn_blocking(move || backend.connect_tcp(addr, timeout))
                .await
                .map_err(|e| NetError::internal(format!("upstream dial task failed: {e}")))??
        };
        stream.set_nonblocking(true)?;
        let mut stream = tokio::net::TcpStream::from_std(stream)?;

        let raw = self
            .timed(async {
                write_frame(&mut stream, bytes).await?;
                read_frame(&mut stream).await
            })
            .await?;
        Message::from_vec(&raw).map_err(malformed)
    }

    async fn timed<T>(&self, io: impl Future<Output = std::io::Result<T>>) -> NetResult<T> {
        match tokio::time::timeout(self.timeout, io).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(NetError::Timeout {
                message: format!("no upstream reply within {:?}", self.timeout),
            }),
        }
    }
}

fn malformed(e: ProtoError) -> NetError {
    NetError::bad_request(format!("malformed DNS message: {e}"))
}

async fn read_frame<S: AsyncReadExt + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u16().await?;
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<S: AsyncWriteExt + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "DNS message too long"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

pub(super) async fn serve_udp(shared: Arc<Shared>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; TCP_MAX];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "DNS UDP receive failed");
                continue;
            }
        };
        let query = buf[..len].to_vec();
        let shared = Arc::clone(&shared);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(reply) = shared.serve(&query, false).await {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    tracing::debug!(peer = %peer, error = %e, "DNS UDP reply failed");
                }
            }
        });
    }
    tracing::trace!("DNS UDP listener ended");
}

pub(super) async fn serve_tcp(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::debug!(error = %e, "DNS TCP accept failed");
                continue;
            }
        };
        tokio::spawn(serve_conn(Arc::clone(&shared), stream, shutdown.clone()));
    }
    tracing::trace!("DNS TCP listener ended");
}

async fn serve_conn(shared: Arc<Shared>, mut stream: tokio::net::TcpStream, mut shutdown: watch::Receiver<bool>) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut stream) => frame,
        };
        let Ok(query) = frame else {
            break;
        };
        let Some(reply) = shared.serve(&query, true).await else {
            continue;
        };
        if write_frame(&mut stream, &reply).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;

    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::{Name, RData, Record, rdata};

    use super::*;
    use crate::service::ServiceTarget;

    struct Nothing;

    impl ResolverBackend for Nothing {
        fn resolve_name(&self, _: &str, _: bool) -> (Option<Vec<IpAddr>>, bool) {
            (None, false)
        }
        fn resolve_ip(&self, _: IpAddr) -> Option<String> {
            None
        }
        fn resolve_service(&self, _: &str) -> Vec<ServiceTarget> {
            Vec::new()
        }
        fn ndots_set(&self) -> bool {
            false
        }
    }

    fn query_bytes(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    #[tokio::test]
    async fn no_upstream_means_nxdomain() {
        let shared = Shared::new(Arc::new(Nothing), Duration::from_millis(200));
        let reply = shared.serve(&query_bytes("example.com."), false).await.unwrap();
        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);
        assert!(shared.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        let shared = Shared::new(Arc::new(Nothing), Duration::from_millis(200));
        assert!(shared.serve(&[1, 2, 3], false).await.is_none());
    }

    #[tokio::test]
    async fn forwards_to_upstream_over_udp() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let mut resp = handler::reply_to(&query);
            resp.add_answer(Record::from_rdata(
                query.queries()[0].name().clone(),
                60,
                RData::A(rdata::A(Ipv4Addr::new(93, 184, 216, 34))),
            ));
            upstream.send_to(&resp.to_vec().unwrap(), peer).await.unwrap();
        });

        // Point the loopback "port 53" at the test server through a backend
        // that rewrites the destination port.
        struct Redirect(u16);
        impl ResolverBackend for Redirect {
            fn resolve_name(&self, _: &str, _: bool) -> (Option<Vec<IpAddr>>, bool) {
                (None, false)
            }
            fn resolve_ip(&self, _: IpAddr) -> Option<String> {
                None
            }
            fn resolve_service(&self, _: &str) -> Vec<ServiceTarget> {
                Vec::new()
            }
            fn ndots_set(&self) -> bool {
                false
            }
            fn connect_udp(&self, server: SocketAddr) -> NetResult<std::net::UdpSocket> {
                super::super::connect_udp(SocketAddr::new(server.ip(), self.0))
            }
        }

        let shared = Shared::new(Arc::new(Redirect(port)), Duration::from_secs(2));
        *shared.ext_dns.write() = vec![ExtDns {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host_loopback: false,
        }];
        let reply = shared.serve(&query_bytes("example.com."), false).await.unwrap();
        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
    }
}
