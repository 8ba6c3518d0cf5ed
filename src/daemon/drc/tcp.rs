//! DRC ownership per transport, and recycling of connection-scoped tables.
//!
//! A TCP client that reconnects (new port, same address) retransmits its
//! outstanding calls on the new connection. Released connection tables are
//! parked by peer address for `recycle_expire` so those retransmissions still
//! hit. A parked table can reach any later connection from that address, so
//! TCP fingerprints always carry a payload checksum.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::key::DrcScope;
use super::table::Drc;
use super::DrcParams;
use crate::core::{ConnectionId, SharedClock};
use crate::daemon::transport::TransportKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrcSettings {
    pub enabled: bool,
    /// Connection-scoped tables (TCP and RDMA).
    pub tcp: DrcParams,
    /// The shared datagram table.
    pub udp: DrcParams,
    pub recycle_expire: Duration,
}

impl Default for DrcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tcp: DrcParams::tcp_default(),
            udp: DrcParams::udp_default(),
            recycle_expire: Duration::from_secs(600),
        }
    }
}

struct Recycled {
    drc: Arc<Drc>,
    released_at: Instant,
}

pub struct DrcRegistry {
    settings: RwLock<DrcSettings>,
    udp: Arc<Drc>,
    recycle: Mutex<HashMap<IpAddr, Recycled>>,
    clock: SharedClock,
}

impl DrcRegistry {
    pub fn new(settings: DrcSettings, clock: SharedClock) -> Self {
        let udp = Arc::new(Drc::new(
            "udp",
            DrcScope::Datagram,
            ConnectionId::new(0),
            settings.udp,
            clock.clone(),
        ));
        Self {
            settings: RwLock::new(settings),
            udp,
            recycle: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn settings(&self) -> DrcSettings {
        *self.settings.read().expect("drc settings lock poisoned")
    }

    pub fn udp(&self) -> &Arc<Drc> {
        &self.udp
    }

    /// The table a new connection should use; `None` when caching is off or
    /// the protocol never caches (9P).
    pub fn for_connection(
        &self,
        kind: TransportKind,
        conn: ConnectionId,
        peer: SocketAddr,
    ) -> Option<Arc<Drc>> {
        let settings = self.settings();
        if !settings.enabled {
            return None;
        }
        match kind {
            TransportKind::Udp => Some(self.udp.clone()),
            TransportKind::Tcp => {
                let params = settings.tcp.checksummed();
                let parked = self
                    .recycle
                    .lock()
                    .expect("drc recycle lock poisoned")
                    .remove(&peer.ip());
                if let Some(parked) = parked {
                    tracing::debug!(
                        conn = %conn,
                        %peer,
                        origin = %parked.drc.origin(),
                        entries = parked.drc.len(),
                        "reusing recycled drc"
                    );
                    parked.drc.retune(params);
                    return Some(parked.drc);
                }
                Some(Arc::new(Drc::new(
                    "tcp",
                    DrcScope::Connection,
                    conn,
                    params,
                    self.clock.clone(),
                )))
            }
            TransportKind::Rdma => Some(Arc::new(Drc::new(
                "rdma",
                DrcScope::Checksummed,
                conn,
                settings.tcp,
                self.clock.clone(),
            ))),
            TransportKind::NinePTcp | TransportKind::NinePRdma => None,
        }
    }

    /// Hand back a connection's table at teardown.
    pub fn release(&self, kind: TransportKind, peer: SocketAddr, drc: Arc<Drc>) {
        if kind != TransportKind::Tcp || drc.is_empty() {
            return;
        }
        let replaced = self
            .recycle
            .lock()
            .expect("drc recycle lock poisoned")
            .insert(
                peer.ip(),
                Recycled {
                    drc,
                    released_at: self.clock.now(),
                },
            );
        if replaced.is_some() {
            tracing::debug!(peer = %peer.ip(), "replaced parked drc");
        }
    }

    /// Free parked tables older than `recycle_expire`.
    pub fn expire_recycled(&self) -> usize {
        let expire = self.settings().recycle_expire;
        let now = self.clock.now();
        let mut recycle = self.recycle.lock().expect("drc recycle lock poisoned");
        let before = recycle.len();
        recycle.retain(|_, parked| now.saturating_duration_since(parked.released_at) < expire);
        before - recycle.len()
    }

    pub fn recycled_len(&self) -> usize {
        self.recycle.lock().expect("drc recycle lock poisoned").len()
    }

    /// Periodic upkeep: aged datagram entries and parked tables.
    pub fn sweep(&self) -> (usize, usize) {
        (self.udp.expire_aged(), self.expire_recycled())
    }

    /// New connections pick up `settings`; the shared datagram table is
    /// retuned in place.
    pub fn reconfigure(&self, settings: DrcSettings) {
        self.udp.retune(settings.udp);
        *self.settings.write().expect("drc settings lock poisoned") = settings;
        tracing::info!(
            enabled = settings.enabled,
            tcp_size = settings.tcp.maxsize,
            udp_size = settings.udp.maxsize,
            "drc reconfigured"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::core::ManualClock;
    use crate::daemon::drc::{RequestIdentity, StartOutcome};

    fn registry() -> (DrcRegistry, ManualClock) {
        let clock = ManualClock::new();
        (
            DrcRegistry::new(DrcSettings::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    fn id(xid: u32) -> RequestIdentity {
        RequestIdentity {
            xid,
            prog: 100003,
            vers: 3,
            proc_num: 7,
        }
    }

    #[test]
    fn reconnecting_peer_reuses_parked_table() {
        let (registry, _) = registry();
        let first: SocketAddr = "10.0.0.5:801".parse().unwrap();
        let drc = registry
            .for_connection(TransportKind::Tcp, ConnectionId::new(1), first)
            .unwrap();
        match drc.start(drc.fingerprint(first, id(42), b"x")).unwrap() {
            StartOutcome::Execute(token) => drc.finish(token, 0, Bytes::from_static(b"r")),
            other => panic!("unexpected {other:?}"),
        }
        registry.release(TransportKind::Tcp, first, drc);
        assert_eq!(registry.recycled_len(), 1);

        let second: SocketAddr = "10.0.0.5:802".parse().unwrap();
        let drc = registry
            .for_connection(TransportKind::Tcp, ConnectionId::new(2), second)
            .unwrap();
        assert_eq!(drc.origin(), ConnectionId::new(1));
        assert!(matches!(
            drc.start(drc.fingerprint(second, id(42), b"x")).unwrap(),
            StartOutcome::ReplayCompleted { .. }
        ));
        assert_eq!(registry.recycled_len(), 0);
    }

    #[test]
    fn recycled_table_keeps_different_calls_apart() {
        let (registry, _) = registry();
        registry.reconfigure(DrcSettings {
            tcp: DrcParams {
                checksum: false,
                ..DrcParams::tcp_default()
            },
            ..DrcSettings::default()
        });
        let first: SocketAddr = "10.0.0.5:801".parse().unwrap();
        let drc = registry
            .for_connection(TransportKind::Tcp, ConnectionId::new(1), first)
            .unwrap();
        match drc.start(drc.fingerprint(first, id(42), b"WRITE file A")).unwrap() {
            StartOutcome::Execute(token) => {
                drc.finish(token, 0, Bytes::from_static(b"reply-for-A"))
            }
            other => panic!("unexpected {other:?}"),
        }
        registry.release(TransportKind::Tcp, first, drc);

        // A different client behind the same address reuses the xid.
        let second: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let drc = registry
            .for_connection(TransportKind::Tcp, ConnectionId::new(2), second)
            .unwrap();
        assert!(drc.params().checksum);
        assert!(matches!(
            drc.start(drc.fingerprint(second, id(42), b"REMOVE file B")).unwrap(),
            StartOutcome::Execute(_)
        ));
        assert!(matches!(
            drc.start(drc.fingerprint(second, id(42), b"WRITE file A")).unwrap(),
            StartOutcome::ReplayCompleted { .. }
        ));
    }

    #[test]
    fn parked_tables_expire() {
        let (registry, clock) = registry();
        let peer: SocketAddr = "10.0.0.9:900".parse().unwrap();
        let drc = registry
            .for_connection(TransportKind::Tcp, ConnectionId::new(1), peer)
            .unwrap();
        if let StartOutcome::Execute(token) = drc.start(drc.fingerprint(peer, id(1), b"")).unwrap()
        {
            drc.finish(token, 0, Bytes::new());
        }
        registry.release(TransportKind::Tcp, peer, drc);
        clock.advance(Duration::from_secs(599));
        assert_eq!(registry.expire_recycled(), 0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(registry.expire_recycled(), 1);
    }

    #[test]
    fn ninep_and_disabled_get_no_table() {
        let (registry, _) = registry();
        let peer: SocketAddr = "10.0.0.1:564".parse().unwrap();
        assert!(
            registry
                .for_connection(TransportKind::NinePTcp, ConnectionId::new(1), peer)
                .is_none()
        );
        registry.reconfigure(DrcSettings {
            enabled: false,
            ..DrcSettings::default()
        });
        assert!(
            registry
                .for_connection(TransportKind::Udp, ConnectionId::new(1), peer)
                .is_none()
        );
    }
}
