//! Listener and reader threads.
//!
//! One accept thread per stream listener, one reader thread per connection and
//! one for the shared datagram socket. Readers parse nothing; they hand every
//! message to the [`Dispatcher`] and own connection teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::connection::{Connection, next_connection_id};
use super::dispatch::Dispatcher;
use super::drc::DrcRegistry;
use super::fridge::{Fridge, FridgeCommand};
use super::metrics;
use super::transport::{Channel, Received, StreamListener, UdpChannel};
use crate::core::{ConnectionId, Limits};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Live connections by id. Reader threads are not joined; a connection
/// leaves this table when its reader finishes teardown.
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    emptied: Condvar,
}

impl ConnectionTable {
    fn insert(&self, conn: Arc<Connection>) -> usize {
        let mut inner = self.inner.lock().expect("connection table lock poisoned");
        inner.insert(conn.id(), conn);
        inner.len()
    }

    fn remove(&self, id: ConnectionId) -> usize {
        let mut inner = self.inner.lock().expect("connection table lock poisoned");
        inner.remove(&id);
        if inner.is_empty() {
            self.emptied.notify_all();
        }
        inner.len()
    }

    /// Wait until every reader has torn its connection down.
    fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("connection table lock poisoned");
        while !inner.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            inner = self
                .emptied
                .wait_timeout(inner, remaining)
                .expect("connection table lock poisoned")
                .0;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("connection table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .expect("connection table lock poisoned")
            .get(&id)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .expect("connection table lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

pub struct Server {
    dispatcher: Arc<Dispatcher>,
    drc: Arc<DrcRegistry>,
    limits: Limits,
    connections: ConnectionTable,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Server {
    pub fn new(dispatcher: Arc<Dispatcher>, drc: Arc<DrcRegistry>, limits: Limits) -> Self {
        Self {
            dispatcher,
            drc,
            limits,
            connections: ConnectionTable::default(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn drc(&self) -> &Arc<DrcRegistry> {
        &self.drc
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Serve a stream listener on its own accept thread.
    pub fn listen(self: &Arc<Self>, listener: StreamListener) -> std::io::Result<SocketAddr> {
        let addr = listener.local_addr();
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("accept-{}", listener.kind()))
            .spawn(move || this.accept_loop(listener))?;
        self.track(handle);
        Ok(addr)
    }

    /// Serve the shared datagram socket.
    pub fn serve_udp(self: &Arc<Self>, channel: UdpChannel) -> std::io::Result<Arc<Connection>> {
        let drc = self.drc.settings().enabled.then(|| self.drc.udp().clone());
        let conn = Arc::new(Connection::new(Box::new(channel), drc, self.limits.flush_buckets));
        self.spawn_reader(conn.clone())?;
        Ok(conn)
    }

    /// Adopt an already-established channel (RDMA endpoints, tests).
    pub fn attach(self: &Arc<Self>, channel: Box<dyn Channel>) -> std::io::Result<Arc<Connection>> {
        let id = next_connection_id();
        let drc = self.drc.for_connection(channel.kind(), id, channel.peer_address());
        let conn = Arc::new(Connection::with_id(id, channel, drc, self.limits.flush_buckets));
        self.spawn_reader(conn.clone())?;
        Ok(conn)
    }

    /// Tick the grace period whenever shared recovery state changes.
    pub fn watch_recovery(self: &Arc<Self>, general: Arc<Fridge>) -> std::io::Result<()> {
        let Some(changes) = self.dispatcher.grace().backend().watch() else {
            return Ok(());
        };
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("grace-watch".into())
            .spawn(move || {
                while !this.is_shutting_down() {
                    match changes.recv_timeout(Duration::from_millis(250)) {
                        Ok(()) => {
                            let grace = this.dispatcher.grace().clone();
                            let submitted = general.submit(move |_| {
                                if let Err(err) = grace.tick() {
                                    tracing::warn!(error = %err, "grace tick after recovery change failed");
                                }
                            });
                            if let Err(err) = submitted {
                                tracing::warn!(error = %err, "dropping recovery change notification");
                            }
                        }
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;
        self.track(handle);
        Ok(())
    }

    /// Keep a long-lived thread (listener, watcher) for `shutdown` to join.
    fn track(&self, handle: JoinHandle<()>) {
        let mut threads = self.threads.lock().expect("server threads lock poisoned");
        threads.retain(|handle| !handle.is_finished());
        threads.push(handle);
    }

    fn accept_loop(self: Arc<Self>, listener: StreamListener) {
        while !self.is_shutting_down() {
            match listener.accept() {
                Ok(Some(channel)) => {
                    if let Err(err) = self.attach(Box::new(channel)) {
                        tracing::error!(error = %err, "failed to start connection reader");
                    }
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(err) => {
                    tracing::warn!(addr = %listener.local_addr(), error = %err, "accept failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        tracing::debug!(addr = %listener.local_addr(), "accept loop stopped");
    }

    fn spawn_reader(self: &Arc<Self>, conn: Arc<Connection>) -> std::io::Result<()> {
        let live = self.connections.insert(conn.clone());
        metrics::set_connections(live);
        tracing::info!(conn = %conn.id(), kind = %conn.kind(), peer = %conn.peer(), "connection opened");
        let this = self.clone();
        let reader = conn.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("reader-{}", conn.id()))
            .spawn(move || {
                this.read_loop(&reader);
                this.teardown(&reader);
            });
        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                self.teardown(&conn);
                Err(err)
            }
        }
    }

    fn read_loop(&self, conn: &Arc<Connection>) {
        let datagram = !conn.kind().is_connection_oriented();
        while !self.is_shutting_down() && !conn.is_closing() {
            match conn.channel().receive() {
                Ok(Received::Message(inbound)) => self.dispatcher.dispatch(conn, inbound),
                Ok(Received::WouldBlock) => {}
                Ok(Received::Closed) => break,
                // One bad datagram says nothing about the socket.
                Err(err) if datagram => {
                    tracing::debug!(conn = %conn.id(), error = %err, "dropping datagram");
                }
                Err(err) => {
                    tracing::warn!(conn = %conn.id(), error = %err, "closing connection");
                    break;
                }
            }
        }
    }

    /// Close `conn`, let in-flight requests finish, then return its DRC.
    fn teardown(&self, conn: &Arc<Connection>) {
        conn.close();
        if !conn.wait_drained(self.drain_timeout) {
            tracing::warn!(conn = %conn.id(), inflight = conn.inflight(), "requests still in flight at teardown");
        }
        if let Some(drc) = conn.take_drc() {
            self.drc.release(conn.kind(), conn.peer(), drc);
        }
        if conn.kind().is_ninep() {
            self.dispatcher.ops().connection_closed(conn);
        }
        let live = self.connections.remove(conn.id());
        metrics::set_connections(live);
        tracing::info!(conn = %conn.id(), peer = %conn.peer(), age_ms = conn.age().as_millis() as u64, "connection closed");
    }

    /// Stop accepting, close every connection and stop the workers.
    pub fn shutdown(&self, timeout: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(connections = self.connections.len(), "server shutting down");
        for conn in self.connections.snapshot() {
            conn.close();
        }
        let threads = std::mem::take(&mut *self.threads.lock().expect("server threads lock poisoned"));
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("server thread panicked");
            }
        }
        if !self.connections.wait_empty(self.drain_timeout) {
            tracing::warn!(connections = self.connections.len(), "connections still open after drain timeout");
        }
        if let Err(err) = self.dispatcher.workers().sync_command(FridgeCommand::Stop, timeout) {
            tracing::warn!(error = %err, "worker pool did not stop cleanly");
        }
    }
}
