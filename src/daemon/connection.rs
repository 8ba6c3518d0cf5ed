//! One client association and its in-flight accounting.
//!
//! Requests hold an [`InflightGuard`] from admission until their reply is
//! sent. Teardown closes the channel, waits for the count to drain and only
//! then hands the DRC back to the registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::ConnectionId;
use crate::daemon::drc::Drc;
use crate::daemon::flush::FlushRegistry;
use crate::daemon::transport::{Channel, TransportError, TransportKind};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    ConnectionId::new(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

pub struct Connection {
    id: ConnectionId,
    kind: TransportKind,
    peer: SocketAddr,
    max_message_bytes: usize,
    born: Instant,
    sequence: AtomicU64,
    channel: Box<dyn Channel>,
    inflight: Mutex<usize>,
    drained: Condvar,
    closing: AtomicBool,
    drc: Mutex<Option<Arc<Drc>>>,
    flush: Option<FlushRegistry>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl Connection {
    pub fn new(channel: Box<dyn Channel>, drc: Option<Arc<Drc>>, flush_buckets: usize) -> Self {
        Self::with_id(next_connection_id(), channel, drc, flush_buckets)
    }

    pub fn with_id(
        id: ConnectionId,
        channel: Box<dyn Channel>,
        drc: Option<Arc<Drc>>,
        flush_buckets: usize,
    ) -> Self {
        let kind = channel.kind();
        Self {
            id,
            kind,
            peer: channel.peer_address(),
            max_message_bytes: channel.max_message_bytes(),
            born: Instant::now(),
            sequence: AtomicU64::new(0),
            channel,
            inflight: Mutex::new(0),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
            drc: Mutex::new(drc),
            flush: kind.is_ninep().then(|| FlushRegistry::new(flush_buckets)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    pub fn age(&self) -> Duration {
        self.born.elapsed()
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    /// Per-connection request sequence; strictly increasing from 1.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn flush_registry(&self) -> Option<&FlushRegistry> {
        self.flush.as_ref()
    }

    pub fn drc(&self) -> Option<Arc<Drc>> {
        self.drc.lock().expect("connection drc lock poisoned").clone()
    }

    pub(crate) fn take_drc(&self) -> Option<Arc<Drc>> {
        self.drc.lock().expect("connection drc lock poisoned").take()
    }

    pub fn send(&self, peer: SocketAddr, reply: &[u8]) -> Result<(), TransportError> {
        self.channel.send(peer, reply)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Stop the reader. Returns true for the first caller.
    pub fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.channel.close();
        true
    }

    pub fn inflight(&self) -> usize {
        *self.inflight.lock().expect("connection inflight lock poisoned")
    }

    pub fn begin_request(self: &Arc<Self>) -> InflightGuard {
        *self.inflight.lock().expect("connection inflight lock poisoned") += 1;
        InflightGuard { conn: self.clone() }
    }

    /// Wait until no request is in flight. Returns false on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let guard = self.inflight.lock().expect("connection inflight lock poisoned");
        let (guard, _) = self
            .drained
            .wait_timeout_while(guard, timeout, |inflight| *inflight > 0)
            .expect("connection inflight lock poisoned");
        *guard == 0
    }
}

/// Holds a connection open for one request.
#[must_use = "dropping the guard ends the request"]
pub struct InflightGuard {
    conn: Arc<Connection>,
}

impl InflightGuard {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut inflight = self.conn.inflight.lock().expect("connection inflight lock poisoned");
        *inflight = inflight.saturating_sub(1);
        if *inflight == 0 {
            self.conn.drained.notify_all();
        }
    }
}
