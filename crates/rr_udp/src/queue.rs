use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::peer::{ClientEntry, ListenerId};

/// One received datagram on its way through the proxy: the raw buffer, the
/// originating client, the socket it arrived on, and eventually the reply.
#[derive(Debug)]
pub struct Request {
    pub buf: Vec<u8>,
    pub from: Option<Arc<ClientEntry>>,
    pub udpsock: Arc<UdpSocket>,
    pub listener: ListenerId,
    pub created: Instant,
    pub reply: Option<Vec<u8>>,
}

/// The shared per-listener reply FIFO. All UDP clients point at one queue;
/// a single writer task drains it. The receiver scrubs queued entries in
/// place when their client expires, which is why this stays an explicit
/// mutex-guarded deque rather than a channel.
pub struct ReplyQueue {
    entries: Mutex<VecDeque<Request>>,
    notify: Notify,
}

impl ReplyQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub fn push(&self, rq: Request) {
        self.entries.lock().push_back(rq);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Clears `from` on every queued reply bound for `client`. Called with
    /// the peer table lock held; the lock order is always table, then queue.
    pub fn scrub(&self, client: &Arc<ClientEntry>) {
        let mut entries = self.entries.lock();
        for rq in entries.iter_mut() {
            if rq
                .from
                .as_ref()
                .is_some_and(|from| Arc::ptr_eq(from, client))
            {
                rq.from = None;
            }
        }
    }

    /// Shifts the next reply and snapshots its destination under one lock
    /// acquisition. The receiver may clear `from` right up until the shift;
    /// the snapshot is what the writer is allowed to send to.
    pub(crate) fn pop_with_dest(&self) -> Option<(Request, Option<SocketAddr>)> {
        let mut entries = self.entries.lock();
        let rq = entries.pop_front()?;
        let dest = rq.from.as_ref().map(|client| client.addr);
        Some((rq, dest))
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl fmt::Debug for ReplyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyQueue")
            .field("depth", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ClientEntry;

    async fn test_sock() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind test socket"))
    }

    fn request(from: Option<Arc<ClientEntry>>, sock: &Arc<UdpSocket>, tag: u8) -> Request {
        Request {
            buf: vec![tag],
            from,
            udpsock: Arc::clone(sock),
            listener: 0,
            created: Instant::now(),
            reply: Some(vec![tag]),
        }
    }

    #[tokio::test]
    async fn drains_fifo() {
        let q = ReplyQueue::new();
        let sock = test_sock().await;
        q.push(request(None, &sock, 1));
        q.push(request(None, &sock, 2));
        q.push(request(None, &sock, 3));

        let mut order = Vec::new();
        while let Some((rq, _)) = q.pop_with_dest() {
            order.push(rq.buf[0]);
        }
        assert_eq!(order, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn scrub_clears_from_for_the_evicted_client_only() {
        let q = ReplyQueue::new();
        let sock = test_sock().await;
        let evicted = ClientEntry::for_tests("10.0.0.5:4000".parse().unwrap(), 0, 0, &q);
        let kept = ClientEntry::for_tests("10.0.0.6:4000".parse().unwrap(), 0, 0, &q);

        q.push(request(Some(Arc::clone(&evicted)), &sock, 1));
        q.push(request(Some(Arc::clone(&kept)), &sock, 2));
        q.push(request(Some(Arc::clone(&evicted)), &sock, 3));

        q.scrub(&evicted);

        let (first, dest) = q.pop_with_dest().expect("first entry");
        assert_eq!(first.buf[0], 1);
        assert_eq!(dest, None);

        let (_, dest) = q.pop_with_dest().expect("second entry");
        assert_eq!(dest, Some("10.0.0.6:4000".parse().unwrap()));

        let (_, dest) = q.pop_with_dest().expect("third entry");
        assert_eq!(dest, None);
    }

    #[tokio::test]
    async fn snapshot_survives_scrub_after_pop() {
        let q = ReplyQueue::new();
        let sock = test_sock().await;
        let client = ClientEntry::for_tests("10.0.0.5:4000".parse().unwrap(), 0, 0, &q);
        q.push(request(Some(Arc::clone(&client)), &sock, 1));

        let (rq, dest) = q.pop_with_dest().expect("entry");
        // a scrub arriving after the shift cannot touch the popped entry
        q.scrub(&client);
        assert_eq!(dest, Some(client.addr));
        assert!(rq.from.is_some());
    }
}
