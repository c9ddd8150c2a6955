use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::debug;

use rr_metrics::TransportMetrics;

use crate::addr::{addr_equal, HostMatcher};
use crate::config::{ClientSection, Config, ServerSection};
use crate::queue::ReplyQueue;

pub type ListenerId = usize;

const DEFAULT_RADIUS_PORT: u16 = 1812;

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An implicit per-source-address client record. Created on the first
/// datagram matching a client conf, refreshed on every further match,
/// evicted lazily once its expiry passes.
#[derive(Debug)]
pub struct ClientEntry {
    pub addr: SocketAddr,
    pub listener: ListenerId,
    expiry: AtomicU64,
    pub replyq: Arc<ReplyQueue>,
}

impl ClientEntry {
    pub fn expiry(&self) -> u64 {
        self.expiry.load(Ordering::Relaxed)
    }

    fn refresh(&self, until: u64) {
        self.expiry.store(until, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        addr: SocketAddr,
        listener: ListenerId,
        expiry: u64,
        replyq: &Arc<ReplyQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            listener,
            expiry: AtomicU64::new(expiry),
            replyq: Arc::clone(replyq),
        })
    }
}

/// A configured client block: the source addresses it authorizes and the
/// live client records that have shown up under it.
#[derive(Debug)]
pub struct ClientConf {
    pub name: String,
    matcher: HostMatcher,
    clients: Mutex<Vec<Arc<ClientEntry>>>,
}

impl ClientConf {
    fn from_section(section: &ClientSection) -> Result<Self> {
        let matcher = HostMatcher::parse(&section.host)
            .with_context(|| format!("client {:?} host", section.name))?;
        Ok(Self {
            name: section.name.clone(),
            matcher,
            clients: Mutex::new(Vec::new()),
        })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        self.matcher.matches(ip)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// One pass over this conf's client table: refresh and return the entry
    /// matching `from` (creating it when absent), and evict every other
    /// entry on this listener whose expiry has passed. Evicted clients get
    /// their queued replies scrubbed before the table lock is released.
    pub fn match_or_insert(
        &self,
        listener: ListenerId,
        from: SocketAddr,
        now: u64,
        idle_timeout: u64,
        replyq: &Arc<ReplyQueue>,
        metrics: &TransportMetrics,
    ) -> Arc<ClientEntry> {
        let mut clients = self.clients.lock();
        let mut found: Option<Arc<ClientEntry>> = None;

        clients.retain(|client| {
            if client.listener != listener {
                return true;
            }
            if found.is_none() && addr_equal(&from, &client.addr) {
                // a match refreshes even when the previous expiry already passed
                client.refresh(now + idle_timeout);
                found = Some(Arc::clone(client));
                return true;
            }
            if client.expiry() >= now {
                return true;
            }

            debug!(peer = %client.addr, "removing expired client");
            client.replyq.scrub(client);
            metrics.record_client_expired();
            false
        });

        found.unwrap_or_else(|| {
            let entry = Arc::new(ClientEntry {
                addr: from,
                listener,
                expiry: AtomicU64::new(now + idle_timeout),
                replyq: Arc::clone(replyq),
            });
            clients.push(Arc::clone(&entry));
            metrics.record_client_created();
            entry
        })
    }
}

/// A configured upstream server with its resolved hostports, desired source
/// bind, and the pool socket assigned at bootstrap.
#[derive(Debug)]
pub struct UpstreamServer {
    pub name: String,
    pub index: usize,
    pub addrs: Vec<SocketAddr>,
    pub source: Option<SocketAddr>,
    sock: OnceLock<Arc<UdpSocket>>,
}

impl UpstreamServer {
    pub(crate) fn resolve(section: &ServerSection, index: usize) -> Result<Self> {
        let addrs = resolve_hostport(&section.host)
            .with_context(|| format!("server {:?} host", section.name))?;
        let source = section
            .source
            .as_deref()
            .map(parse_source)
            .transpose()
            .with_context(|| format!("server {:?} source", section.name))?;
        Ok(Self {
            name: section.name.clone(),
            index,
            addrs,
            source,
            sock: OnceLock::new(),
        })
    }

    pub fn sock(&self) -> Option<&Arc<UdpSocket>> {
        self.sock.get()
    }

    pub(crate) fn set_sock(&self, sock: Arc<UdpSocket>) {
        if self.sock.set(sock).is_err() {
            debug!(server = %self.name, "outbound socket already assigned");
        }
    }
}

/// A bind-address spec: `ip` or `ip:port`. A bare IP binds an ephemeral port.
pub(crate) fn parse_source(raw: &str) -> Result<SocketAddr> {
    if let Ok(sa) = raw.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 0));
    }
    bail!("invalid source address {raw:?}")
}

fn resolve_hostport(raw: &str) -> Result<Vec<SocketAddr>> {
    // full socket address ("10.0.0.7:1812", "[2001:db8::1]:1812")
    if let Ok(sa) = raw.parse::<SocketAddr>() {
        return Ok(vec![sa]);
    }
    // bare IP gets the protocol default port
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, DEFAULT_RADIUS_PORT)]);
    }
    let addrs: Vec<SocketAddr> = if raw.contains(':') {
        raw.to_socket_addrs()
    } else {
        (raw, DEFAULT_RADIUS_PORT).to_socket_addrs()
    }
    .with_context(|| format!("failed to resolve {raw:?}"))?
    .collect();
    if addrs.is_empty() {
        bail!("no addresses resolved for {raw:?}");
    }
    Ok(addrs)
}

/// All configured peers for this transport handle.
#[derive(Debug)]
pub struct PeerConfigs {
    pub clients: Vec<Arc<ClientConf>>,
    pub servers: Vec<Arc<UpstreamServer>>,
}

impl PeerConfigs {
    pub fn from_config(config: &Config) -> Result<Self> {
        let clients = config
            .clients
            .iter()
            .map(|section| ClientConf::from_section(section).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let servers = config
            .servers
            .iter()
            .enumerate()
            .map(|(index, section)| UpstreamServer::resolve(section, index).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { clients, servers })
    }

    pub fn find_client_conf(&self, from: &SocketAddr) -> Option<Arc<ClientConf>> {
        self.clients
            .iter()
            .find(|conf| conf.matches(from.ip()))
            .cloned()
    }

    pub fn find_server_conf(&self, from: &SocketAddr) -> Option<Arc<UpstreamServer>> {
        self.servers
            .iter()
            .find(|server| server.addrs.iter().any(|addr| addr_equal(addr, from)))
            .cloned()
    }
}
