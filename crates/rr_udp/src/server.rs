use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use flume::{Receiver, Sender};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rr_metrics::TransportMetrics;

use crate::addr::{addr_equal, port};
use crate::config::Config;
use crate::packet::{checked_rad_length, RAD_HDR_PREFIX_LEN, RAD_MAX_LEN};
use crate::peer::{
    now_unix_secs, parse_source, ClientEntry, ListenerId, PeerConfigs, UpstreamServer,
};
use crate::queue::{ReplyQueue, Request};

/// A reply read from an upstream server, on its way to the reply handler.
#[derive(Debug)]
pub struct ServerReply {
    pub server: Arc<UpstreamServer>,
    pub buf: Vec<u8>,
}

/// The running transport: configured peers, the shared reply queue (when
/// client confs exist), and the channels carrying received requests and
/// upstream replies out to the dispatcher.
pub struct Transport {
    pub peers: Arc<PeerConfigs>,
    pub replyq: Option<Arc<ReplyQueue>>,
    pub requests: Receiver<Request>,
    pub server_replies: Receiver<ServerReply>,
    // keep one sender of each channel alive so the dispatcher side never
    // observes a spurious disconnect while worker tasks come and go
    pub(crate) requests_tx: Sender<Request>,
    pub(crate) replies_tx: Sender<ServerReply>,
}

/// Peeks the 4-byte RADIUS prefix, validates the declared length, receives
/// the datagram, and identifies the peer via `lookup`. Anything that fails
/// drains the offending datagram and the loop keeps going; only a valid
/// framed payload from a configured peer gets out.
async fn recv_framed<T>(
    sock: &UdpSocket,
    scratch: &mut [u8],
    metrics: &TransportMetrics,
    lookup: impl Fn(&SocketAddr) -> Option<T>,
) -> (Vec<u8>, SocketAddr, T) {
    loop {
        let mut hdr = [0u8; RAD_HDR_PREFIX_LEN];
        let (peeked, from) = match sock.peek_from(&mut hdr).await {
            Ok(got) => got,
            Err(err) => {
                warn!(%err, "recv failed");
                continue;
            }
        };

        let Some(peer) = lookup(&from) else {
            warn!(peer = %from, "got packet from wrong or unknown UDP peer, ignoring");
            metrics.record_drop("unknown_peer");
            drain(sock).await;
            continue;
        };

        let len = match checked_rad_length(&hdr[..peeked]) {
            Ok(len) => len,
            Err(err) => {
                warn!(peer = %from, ?err, "invalid message length");
                metrics.record_drop(err.reason());
                drain(sock).await;
                continue;
            }
        };

        // the scratch buffer holds one byte more than the ceiling, so a
        // longer wire datagram still shows up as cnt > len
        let (cnt, _) = match sock.recv_from(scratch).await {
            Ok(got) => got,
            Err(err) => {
                warn!(%err, "recv failed");
                continue;
            }
        };
        debug!(bytes = cnt, peer = %from, "got datagram");

        if cnt < len {
            warn!(peer = %from, "packet smaller than length field in radius header");
            metrics.record_drop("short_datagram");
            continue;
        }
        if cnt > len {
            debug!(padding = cnt - len, "packet was padded");
        }

        metrics.record_packet_in();
        return (scratch[..len].to_vec(), from, peer);
    }
}

async fn drain(sock: &UdpSocket) {
    let mut sink = [0u8; RAD_HDR_PREFIX_LEN];
    if let Err(err) = sock.recv_from(&mut sink).await {
        warn!(%err, "recv failed");
    }
}

async fn rad_recv_client(
    sock: &UdpSocket,
    listener: ListenerId,
    scratch: &mut [u8],
    peers: &PeerConfigs,
    replyq: &Arc<ReplyQueue>,
    idle_timeout: u64,
    metrics: &TransportMetrics,
) -> (Vec<u8>, Arc<ClientEntry>) {
    let (buf, from, conf) =
        recv_framed(sock, scratch, metrics, |sa| peers.find_client_conf(sa)).await;
    let client = conf.match_or_insert(
        listener,
        from,
        now_unix_secs(),
        idle_timeout,
        replyq,
        metrics,
    );
    (buf, client)
}

async fn rad_recv_server(
    sock: &UdpSocket,
    scratch: &mut [u8],
    peers: &PeerConfigs,
    metrics: &TransportMetrics,
) -> (Vec<u8>, Arc<UpstreamServer>) {
    let (buf, _, server) =
        recv_framed(sock, scratch, metrics, |sa| peers.find_server_conf(sa)).await;
    (buf, server)
}

#[allow(clippy::too_many_arguments)]
async fn run_listener(
    listener: ListenerId,
    sock: Arc<UdpSocket>,
    peers: Arc<PeerConfigs>,
    replyq: Arc<ReplyQueue>,
    idle_timeout: u64,
    requests_tx: Sender<Request>,
    metrics: TransportMetrics,
    shutdown: CancellationToken,
) {
    let mut scratch = vec![0u8; RAD_MAX_LEN + 1];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            got = rad_recv_client(
                &sock,
                listener,
                &mut scratch,
                &peers,
                &replyq,
                idle_timeout,
                &metrics,
            ) => {
                let (buf, client) = got;
                let rq = Request {
                    buf,
                    from: Some(client),
                    udpsock: Arc::clone(&sock),
                    listener,
                    created: Instant::now(),
                    reply: None,
                };
                metrics.record_request();
                if requests_tx.send_async(rq).await.is_err() {
                    warn!("request dispatcher is gone, stopping listener");
                    break;
                }
            }
        }
    }
}

async fn run_upstream_reader(
    sock: Arc<UdpSocket>,
    peers: Arc<PeerConfigs>,
    replies_tx: Sender<ServerReply>,
    metrics: TransportMetrics,
    shutdown: CancellationToken,
) {
    let mut scratch = vec![0u8; RAD_MAX_LEN + 1];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            got = rad_recv_server(&sock, &mut scratch, &peers, &metrics) => {
                let (buf, server) = got;
                metrics.record_upstream_reply();
                if replies_tx.send_async(ServerReply { server, buf }).await.is_err() {
                    warn!("reply handler is gone, stopping upstream reader");
                    break;
                }
            }
        }
    }
}

async fn run_reply_writer(
    replyq: Arc<ReplyQueue>,
    metrics: TransportMetrics,
    shutdown: CancellationToken,
) {
    loop {
        // shift and destination snapshot happen under the queue lock; the
        // receiver clears `from` there when the client expires
        while let Some((reply, dest)) = replyq.pop_with_dest() {
            metrics.set_reply_queue_depth(replyq.len() as i64);
            match (dest, reply.reply.as_deref()) {
                (Some(to), Some(buf)) => {
                    if let Err(err) = reply.udpsock.send_to(buf, to).await {
                        warn!(%err, peer = %to, "reply send failed");
                        metrics.record_reply_send_error();
                    } else {
                        metrics.record_reply_sent();
                    }
                }
                (None, _) => debug!("dropping reply whose client expired"),
                (_, None) => debug!("dropping request without a reply buffer"),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = replyq.notified() => {}
        }
    }
}

struct ClientSock {
    source: SocketAddr,
    socket: Arc<UdpSocket>,
}

/// Outbound UDP sockets deduplicated by local source bind address. Built
/// once during configuration, append-only, never reclaimed.
pub(crate) struct SockPool {
    entries: Vec<ClientSock>,
}

impl SockPool {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn assign(
        &mut self,
        server: &UpstreamServer,
        default_sources: &[SocketAddr],
    ) -> Result<Arc<UdpSocket>> {
        let dest = server
            .addrs
            .first()
            .with_context(|| format!("server {:?} resolved no hostports", server.name))?;

        let candidates: Vec<SocketAddr> = match server.source {
            Some(source) => vec![source],
            None => default_sources.to_vec(),
        };

        for candidate in candidates {
            if candidate.is_ipv4() != dest.is_ipv4() {
                continue;
            }
            if let Some(existing) = self
                .entries
                .iter()
                .find(|entry| addr_equal(&entry.source, &candidate))
            {
                debug!(source = %candidate, server = %server.name, "reusing existing socket");
                return Ok(Arc::clone(&existing.socket));
            }

            let socket = Arc::new(bind_to_source(candidate)?);
            debug!(source = %candidate, server = %server.name, "creating new socket");
            self.entries.push(ClientSock {
                source: candidate,
                socket: Arc::clone(&socket),
            });
            return Ok(socket);
        }

        bail!("failed to create client socket for server {}", server.name)
    }

    fn sockets(&self) -> impl Iterator<Item = &Arc<UdpSocket>> {
        self.entries.iter().map(|entry| &entry.socket)
    }
}

fn bind_to_source(source: SocketAddr) -> Result<UdpSocket> {
    let domain = if source.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("failed creating UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed setting SO_REUSEADDR")?;
    socket
        .bind(&source.into())
        .with_context(|| format!("failed binding UDP socket to {source}"))?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed converting socket into tokio UdpSocket")
}

/// The default outbound bind candidates used by servers without their own
/// `source`: the configured transport source, or both wildcards.
fn resolve_default_sources(spec: Option<&str>) -> Result<Vec<SocketAddr>> {
    match spec {
        Some(raw) => Ok(vec![parse_source(raw).context("transport.source")?]),
        None => Ok(vec![
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        ]),
    }
}

/// Sends one pre-encoded RADIUS buffer to the server's first hostport.
/// No retry at this layer; retry policy lives in the proxy core.
pub async fn put_udp(server: &UpstreamServer, rad: &[u8], metrics: &TransportMetrics) -> bool {
    if rad.is_empty() {
        error!("invalid buffer (length)");
        return false;
    }
    let Some(sock) = server.sock() else {
        error!(server = %server.name, "no outbound socket assigned");
        return false;
    };
    let Some(dest) = server.addrs.first() else {
        error!(server = %server.name, "no hostport resolved");
        return false;
    };

    match sock.send_to(rad, *dest).await {
        Ok(_) => {
            debug!(len = rad.len(), peer = %dest, port = port(dest), "sent UDP request");
            metrics.record_upstream_sent();
            true
        }
        Err(err) => {
            warn!(%err, server = %server.name, "send failed");
            false
        }
    }
}

/// Bootstraps the transport: resolves sources, builds the outbound pool,
/// spawns one upstream reader per pool socket, and, when client confs
/// exist, the shared reply queue with its writer plus one listener task per
/// bound address. Configuration failures abort startup.
pub async fn spawn_transport(
    config: &Config,
    metrics: TransportMetrics,
    shutdown: CancellationToken,
) -> Result<Transport> {
    let peers = Arc::new(PeerConfigs::from_config(config)?);
    let default_sources = resolve_default_sources(config.transport.source.as_deref())?;

    let mut pool = SockPool::new();
    for server in &peers.servers {
        let sock = pool.assign(server, &default_sources)?;
        server.set_sock(sock);
    }

    let (requests_tx, requests_rx) = flume::unbounded();
    let (replies_tx, replies_rx) = flume::unbounded();

    for sock in pool.sockets() {
        debug!(
            source = %sock.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "spinning up upstream reader"
        );
        tokio::spawn(run_upstream_reader(
            Arc::clone(sock),
            Arc::clone(&peers),
            replies_tx.clone(),
            metrics.clone(),
            shutdown.child_token(),
        ));
    }

    let mut replyq = None;
    if peers.clients.is_empty() {
        if !config.transport.listen_addrs.is_empty() {
            warn!("no UDP clients configured, listeners not started");
        }
    } else {
        let q = ReplyQueue::new();
        tokio::spawn(run_reply_writer(
            Arc::clone(&q),
            metrics.clone(),
            shutdown.child_token(),
        ));

        for (listener, addr) in config.transport.listen_addrs.iter().enumerate() {
            let sock = Arc::new(
                UdpSocket::bind(*addr)
                    .await
                    .with_context(|| format!("failed binding listener to {addr}"))?,
            );
            info!(listen = %addr, "udp listener up");
            tokio::spawn(run_listener(
                listener,
                sock,
                Arc::clone(&peers),
                Arc::clone(&q),
                config.transport.idle_timeout_secs,
                requests_tx.clone(),
                metrics.clone(),
                shutdown.child_token(),
            ));
        }
        replyq = Some(q);
    }

    Ok(Transport {
        peers,
        replyq,
        requests: requests_rx,
        server_replies: replies_rx,
        requests_tx,
        replies_tx,
    })
}
