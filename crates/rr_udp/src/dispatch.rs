use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rr_metrics::TransportMetrics;

use crate::queue::Request;
use crate::server::{put_udp, ServerReply, Transport};

const MAX_PENDING: usize = 4096;
const PENDING_TTL: Duration = Duration::from_secs(30);

/// Minimal relay glue for the standalone binary: forward each request to
/// the first configured upstream, match upstream replies by RADIUS
/// identifier, and queue them back toward the originating client. Retry
/// and duplicate suppression belong to a full proxy core, not here.
pub async fn run_relay(
    transport: Transport,
    metrics: TransportMetrics,
    shutdown: CancellationToken,
) {
    let Transport {
        peers,
        requests,
        server_replies,
        requests_tx: _requests_tx,
        replies_tx: _replies_tx,
        ..
    } = transport;
    let mut pending: HashMap<(usize, u8), Request> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            rq = requests.recv_async() => {
                let Ok(rq) = rq else { break };
                let Some(server) = peers.servers.first() else {
                    debug!("no upstream servers configured, dropping request");
                    continue;
                };
                let Some(id) = rq.buf.get(1).copied() else { continue };

                if pending.len() >= MAX_PENDING {
                    pending.retain(|_, stale| stale.created.elapsed() < PENDING_TTL);
                    if pending.len() >= MAX_PENDING {
                        warn!("pending request table full, dropping request");
                        continue;
                    }
                }

                if put_udp(server, &rq.buf, &metrics).await {
                    pending.insert((server.index, id), rq);
                }
            }
            reply = server_replies.recv_async() => {
                let Ok(ServerReply { server, buf }) = reply else { break };
                let Some(id) = buf.get(1).copied() else { continue };
                let Some(mut rq) = pending.remove(&(server.index, id)) else {
                    debug!(server = %server.name, id, "unmatched upstream reply");
                    continue;
                };

                rq.reply = Some(buf);
                let Some(q) = rq.from.as_ref().map(|client| Arc::clone(&client.replyq)) else {
                    continue;
                };
                q.push(rq);
                metrics.set_reply_queue_depth(q.len() as i64);
            }
        }
    }
}
