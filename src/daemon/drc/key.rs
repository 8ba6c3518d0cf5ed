//! Request fingerprints.

use std::net::SocketAddr;

use crate::core::ConnectionId;
use crate::daemon::proto::rpc::CallHeader;
use crate::daemon::transport::TransportKind;

/// The RPC identity of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc_num: u32,
}

impl From<&CallHeader> for RequestIdentity {
    fn from(header: &CallHeader) -> Self {
        Self {
            xid: header.xid,
            prog: header.prog,
            vers: header.vers,
            proc_num: header.proc_num,
        }
    }
}

/// How a transport's requests are keyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrcScope {
    /// Ordered, connection-bound delivery.
    Connection,
    /// Multiplexed delivery where a payload can be replayed under a reused xid.
    Checksummed,
    /// Connectionless; keyed by sender.
    Datagram,
}

impl DrcScope {
    pub fn for_transport(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Tcp | TransportKind::NinePTcp => DrcScope::Connection,
            TransportKind::Rdma | TransportKind::NinePRdma => DrcScope::Checksummed,
            TransportKind::Udp => DrcScope::Datagram,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Connection {
        conn: ConnectionId,
        id: RequestIdentity,
        checksum: Option<u64>,
    },
    Checksummed {
        conn: ConnectionId,
        peer: SocketAddr,
        id: RequestIdentity,
        checksum: u64,
    },
    Datagram {
        peer: SocketAddr,
        id: RequestIdentity,
        checksum: Option<u64>,
    },
}

impl Fingerprint {
    /// Build the fingerprint for `scope`. `strengthen` adds a payload checksum
    /// to the variants where it is optional.
    pub fn build(
        scope: DrcScope,
        conn: ConnectionId,
        peer: SocketAddr,
        id: RequestIdentity,
        args: &[u8],
        strengthen: bool,
        prefix_bytes: usize,
    ) -> Self {
        let optional = || strengthen.then(|| payload_checksum(args, prefix_bytes));
        match scope {
            DrcScope::Connection => Fingerprint::Connection {
                conn,
                id,
                checksum: optional(),
            },
            DrcScope::Checksummed => Fingerprint::Checksummed {
                conn,
                peer,
                id,
                checksum: payload_checksum(args, prefix_bytes),
            },
            DrcScope::Datagram => Fingerprint::Datagram {
                peer,
                id,
                checksum: optional(),
            },
        }
    }

    pub fn identity(&self) -> &RequestIdentity {
        match self {
            Fingerprint::Connection { id, .. }
            | Fingerprint::Checksummed { id, .. }
            | Fingerprint::Datagram { id, .. } => id,
        }
    }

    pub fn xid(&self) -> u32 {
        self.identity().xid
    }
}

/// crc32c over the leading `prefix_bytes` of the call body, combined with the
/// body length.
pub fn payload_checksum(args: &[u8], prefix_bytes: usize) -> u64 {
    let prefix = &args[..args.len().min(prefix_bytes)];
    let crc = crc32c::crc32c(prefix);
    ((args.len() as u64) << 32) | u64::from(crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(xid: u32) -> RequestIdentity {
        RequestIdentity {
            xid,
            prog: 100003,
            vers: 3,
            proc_num: 7,
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.5:801".parse().unwrap()
    }

    #[test]
    fn checksum_covers_prefix_and_length() {
        let mut a = vec![1u8; 300];
        let b = a.clone();
        a[299] = 9;
        assert_eq!(payload_checksum(&a, 256), payload_checksum(&b, 256));
        a[10] = 9;
        assert_ne!(payload_checksum(&a, 256), payload_checksum(&b, 256));
        assert_ne!(payload_checksum(&b[..299], 256), payload_checksum(&b, 256));
    }

    #[test]
    fn datagram_checksum_is_optional() {
        let plain = Fingerprint::build(
            DrcScope::Datagram,
            ConnectionId::new(1),
            peer(),
            id(42),
            b"args",
            false,
            256,
        );
        assert!(matches!(plain, Fingerprint::Datagram { checksum: None, .. }));
        let strong = Fingerprint::build(
            DrcScope::Datagram,
            ConnectionId::new(1),
            peer(),
            id(42),
            b"args",
            true,
            256,
        );
        assert!(matches!(strong, Fingerprint::Datagram { checksum: Some(_), .. }));
        assert_ne!(plain, strong);
    }

    #[test]
    fn checksummed_scope_always_hashes_payload() {
        let a = Fingerprint::build(
            DrcScope::Checksummed,
            ConnectionId::new(3),
            peer(),
            id(1),
            b"one",
            false,
            256,
        );
        let b = Fingerprint::build(
            DrcScope::Checksummed,
            ConnectionId::new(3),
            peer(),
            id(1),
            b"two",
            false,
            256,
        );
        assert_ne!(a, b);
        assert_eq!(a.xid(), 1);
    }
}
