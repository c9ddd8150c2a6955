use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tiny_http::{Method, Response, Server, StatusCode};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus registration failed: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("unable to bind metrics endpoint: {0}")]
    Bind(String),
}

#[derive(Clone)]
pub struct TransportMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    pkts_in_total: IntCounter,
    dropped_total: IntCounterVec,
    requests_total: IntCounter,
    replies_sent_total: IntCounter,
    reply_send_errors_total: IntCounter,
    clients_created_total: IntCounter,
    clients_expired_total: IntCounter,
    upstream_sent_total: IntCounter,
    upstream_replies_total: IntCounter,
    reply_queue_depth: IntGauge,
}

impl TransportMetrics {
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let pkts_in_total = IntCounter::with_opts(
            Opts::new("udp_pkts_in_total", "Total UDP datagrams accepted").namespace(namespace),
        )?;
        let dropped_total = IntCounterVec::new(
            Opts::new("udp_dropped_total", "Total UDP datagrams dropped").namespace(namespace),
            &["reason"],
        )?;
        let requests_total = IntCounter::with_opts(
            Opts::new("requests_total", "Total requests handed to the dispatcher")
                .namespace(namespace),
        )?;
        let replies_sent_total = IntCounter::with_opts(
            Opts::new("replies_sent_total", "Total replies sent back to clients")
                .namespace(namespace),
        )?;
        let reply_send_errors_total = IntCounter::with_opts(
            Opts::new("reply_send_errors_total", "Total reply send failures").namespace(namespace),
        )?;
        let clients_created_total = IntCounter::with_opts(
            Opts::new("clients_created_total", "Total client records created").namespace(namespace),
        )?;
        let clients_expired_total = IntCounter::with_opts(
            Opts::new("clients_expired_total", "Total client records evicted on expiry")
                .namespace(namespace),
        )?;
        let upstream_sent_total = IntCounter::with_opts(
            Opts::new("upstream_sent_total", "Total requests sent to upstream servers")
                .namespace(namespace),
        )?;
        let upstream_replies_total = IntCounter::with_opts(
            Opts::new("upstream_replies_total", "Total replies read from upstream servers")
                .namespace(namespace),
        )?;
        let reply_queue_depth = IntGauge::with_opts(
            Opts::new("reply_queue_depth", "Current depth of the shared reply queue")
                .namespace(namespace),
        )?;

        registry.register(Box::new(pkts_in_total.clone()))?;
        registry.register(Box::new(dropped_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(replies_sent_total.clone()))?;
        registry.register(Box::new(reply_send_errors_total.clone()))?;
        registry.register(Box::new(clients_created_total.clone()))?;
        registry.register(Box::new(clients_expired_total.clone()))?;
        registry.register(Box::new(upstream_sent_total.clone()))?;
        registry.register(Box::new(upstream_replies_total.clone()))?;
        registry.register(Box::new(reply_queue_depth.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                pkts_in_total,
                dropped_total,
                requests_total,
                replies_sent_total,
                reply_send_errors_total,
                clients_created_total,
                clients_expired_total,
                upstream_sent_total,
                upstream_replies_total,
                reply_queue_depth,
            }),
        })
    }

    pub fn record_packet_in(&self) {
        self.inner.pkts_in_total.inc();
    }

    pub fn record_drop(&self, reason: &'static str) {
        self.inner.dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn record_request(&self) {
        self.inner.requests_total.inc();
    }

    pub fn record_reply_sent(&self) {
        self.inner.replies_sent_total.inc();
    }

    pub fn record_reply_send_error(&self) {
        self.inner.reply_send_errors_total.inc();
    }

    pub fn record_client_created(&self) {
        self.inner.clients_created_total.inc();
    }

    pub fn record_client_expired(&self) {
        self.inner.clients_expired_total.inc();
    }

    pub fn record_upstream_sent(&self) {
        self.inner.upstream_sent_total.inc();
    }

    pub fn record_upstream_reply(&self) {
        self.inner.upstream_replies_total.inc();
    }

    pub fn set_reply_queue_depth(&self, depth: i64) {
        self.inner.reply_queue_depth.set(depth);
    }

    pub fn snapshot(&self) -> Result<String, MetricsError> {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Serves `/metrics` scrapes on a dedicated thread. Rendering goes
    /// through [`TransportMetrics::snapshot`], so a scrape sees exactly what
    /// the in-process tests assert against.
    pub fn spawn_exporter(
        &self,
        listen_addr: SocketAddr,
    ) -> Result<thread::JoinHandle<()>, MetricsError> {
        let server =
            Server::http(listen_addr).map_err(|err| MetricsError::Bind(err.to_string()))?;
        let metrics = self.clone();
        Ok(thread::spawn(move || metrics.serve_scrapes(server)))
    }

    fn serve_scrapes(&self, server: Server) {
        for scrape in server.incoming_requests() {
            if scrape.method() != &Method::Get || scrape.url() != "/metrics" {
                let _ = scrape.respond(Response::empty(StatusCode(404)));
                continue;
            }
            let _ = match self.snapshot() {
                Ok(body) => scrape.respond(Response::from_string(body)),
                Err(err) => scrape.respond(
                    Response::from_string(err.to_string()).with_status_code(StatusCode(500)),
                ),
            };
        }
    }
}
