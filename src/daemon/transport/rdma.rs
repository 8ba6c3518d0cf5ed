//! RDMA-style message channel with fixed registered buffer pools.
//!
//! Verbs plumbing is not modelled; [`RdmaChannel::pair`] connects two
//! endpoints in memory. What is modelled is the buffer discipline: every send
//! occupies one outbound buffer until the peer has copied it into one of its
//! inbound buffers (the send completion), and a sender facing an exhausted
//! outbound pool blocks for at most `send_timeout`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use super::{Channel, Inbound, Received, TransportError, TransportKind};
use crate::daemon::metrics;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RdmaParams {
    pub inbound_buffers: usize,
    pub outbound_buffers: usize,
    pub buffer_bytes: usize,
    pub send_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RdmaParams {
    fn default() -> Self {
        Self {
            inbound_buffers: 64,
            outbound_buffers: 64,
            buffer_bytes: 1024 * 1024 + 64 * 1024,
            send_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

struct PoolShared {
    name: &'static str,
    capacity: usize,
    buffer_bytes: usize,
    free: Mutex<Vec<Vec<u8>>>,
    returned: Condvar,
}

#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(name: &'static str, count: usize, buffer_bytes: usize) -> Self {
        let free = (0..count).map(|_| vec![0u8; buffer_bytes]).collect();
        Self {
            shared: Arc::new(PoolShared {
                name,
                capacity: count,
                buffer_bytes,
                free: Mutex::new(free),
                returned: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn buffer_bytes(&self) -> usize {
        self.shared.buffer_bytes
    }

    pub fn available(&self) -> usize {
        self.shared
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .len()
    }

    /// Take a buffer, waiting up to `timeout` for one to be returned.
    pub fn acquire(&self, timeout: Duration) -> Result<PooledBuffer, TransportError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut waited = false;
        let mut free = self.shared.free.lock().expect("buffer pool lock poisoned");
        loop {
            if let Some(data) = free.pop() {
                if waited {
                    metrics::rdma_backpressure_wait(started.elapsed());
                }
                return Ok(PooledBuffer {
                    data,
                    len: 0,
                    pool: self.shared.clone(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                let waited = started.elapsed();
                metrics::rdma_backpressure_wait(waited);
                tracing::warn!(pool = self.shared.name, ?waited, "buffer pool exhausted");
                return Err(TransportError::BufferExhausted {
                    pool: self.shared.name.to_string(),
                    waited,
                });
            }
            waited = true;
            let (guard, _) = self
                .shared
                .returned
                .wait_timeout(free, deadline - now)
                .expect("buffer pool lock poisoned");
            free = guard;
        }
    }
}

/// A pool buffer; returns to its pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl PooledBuffer {
    pub fn fill(&mut self, src: &[u8]) -> Result<(), TransportError> {
        if src.len() > self.data.len() {
            return Err(TransportError::TooLarge {
                len: src.len(),
                max: self.data.len(),
            });
        }
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if let Ok(mut free) = self.pool.free.lock() {
            free.push(data);
            self.pool.returned.notify_one();
        }
    }
}

pub struct RdmaChannel {
    kind: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    params: RdmaParams,
    inbound: BufferPool,
    outbound: BufferPool,
    tx: Sender<PooledBuffer>,
    rx: Receiver<PooledBuffer>,
    closed: Arc<AtomicBool>,
}

impl RdmaChannel {
    /// Two connected endpoints. `a` sees `b_addr` as its peer and vice versa.
    pub fn pair(
        kind: TransportKind,
        params: RdmaParams,
        a_addr: SocketAddr,
        b_addr: SocketAddr,
    ) -> (RdmaChannel, RdmaChannel) {
        let (a_tx, b_rx) = crossbeam::channel::unbounded();
        let (b_tx, a_rx) = crossbeam::channel::unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let endpoint = |local, peer, tx, rx| RdmaChannel {
            kind,
            local,
            peer,
            inbound: BufferPool::new("rdma_inbound", params.inbound_buffers, params.buffer_bytes),
            outbound: BufferPool::new(
                "rdma_outbound",
                params.outbound_buffers,
                params.buffer_bytes,
            ),
            params: params.clone(),
            tx,
            rx,
            closed: closed.clone(),
        };
        let a = endpoint(a_addr, b_addr, a_tx, a_rx);
        let b = endpoint(b_addr, a_addr, b_tx, b_rx);
        (a, b)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn outbound_available(&self) -> usize {
        self.outbound.available()
    }

    pub fn inbound_available(&self) -> usize {
        self.inbound.available()
    }
}

impl Channel for RdmaChannel {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn receive(&self) -> Result<Received, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(Received::Closed);
        }
        let wire = match self.rx.recv_timeout(self.params.poll_interval) {
            Ok(wire) => wire,
            Err(RecvTimeoutError::Timeout) => {
                return if self.closed.load(Ordering::Acquire) {
                    Ok(Received::Closed)
                } else {
                    Ok(Received::WouldBlock)
                };
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(Received::Closed),
        };
        let mut local = self.inbound.acquire(self.params.send_timeout)?;
        local.fill(wire.as_ref())?;
        // Dropping the wire buffer completes the peer's send.
        drop(wire);
        Ok(Received::Message(Inbound {
            bytes: Bytes::from_owner(local),
            peer: self.peer,
        }))
    }

    fn send(&self, _peer: SocketAddr, reply: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if reply.len() > self.params.buffer_bytes {
            return Err(TransportError::TooLarge {
                len: reply.len(),
                max: self.params.buffer_bytes,
            });
        }
        let mut buffer = self.outbound.acquire(self.params.send_timeout)?;
        buffer.fill(reply)?;
        self.tx.send(buffer).map_err(|_| TransportError::Closed)
    }

    fn peer_address(&self) -> SocketAddr {
        self.peer
    }

    fn max_message_bytes(&self) -> usize {
        self.params.buffer_bytes
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(peer = %self.peer, kind = %self.kind, "rdma channel closed");
        }
    }
}
