//! Transport channels: the byte-buffer seam between sockets and dispatch.
//!
//! A [`Channel`] delivers whole request messages and accepts whole replies.
//! Framing (record marking, 9P size headers) is handled below this seam so
//! dispatch only ever sees complete messages.

pub mod frame;
pub mod rdma;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Effect, Transience};

pub use frame::{FrameError, FrameReader, FrameWriter, Framing, ReadOutcome};
pub use rdma::{BufferPool, PooledBuffer, RdmaChannel, RdmaParams};
pub use tcp::{StreamChannel, StreamListener};
pub use udp::UdpChannel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Udp,
    Rdma,
    NinePTcp,
    NinePRdma,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Rdma => "rdma",
            TransportKind::NinePTcp => "9p_tcp",
            TransportKind::NinePRdma => "9p_rdma",
        }
    }

    pub fn is_ninep(self) -> bool {
        matches!(self, TransportKind::NinePTcp | TransportKind::NinePRdma)
    }

    /// One reader thread per connection, as opposed to a shared datagram socket.
    pub fn is_connection_oriented(self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn framing(self) -> Framing {
        if self.is_ninep() {
            Framing::NineP
        } else {
            Framing::RecordMarking
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One complete request as delivered by a channel.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub bytes: Bytes,
    /// Sender of this message. For stream channels this is the connection's peer.
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub enum Received {
    Message(Inbound),
    /// Nothing arrived within the channel's poll interval.
    WouldBlock,
    Closed,
}

pub trait Channel: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn receive(&self) -> Result<Received, TransportError>;

    /// Send one reply. `peer` selects the destination on datagram channels and
    /// is ignored by connected ones.
    fn send(&self, peer: SocketAddr, reply: &[u8]) -> Result<(), TransportError>;

    fn peer_address(&self) -> SocketAddr;

    /// Largest message this channel will carry in either direction.
    fn max_message_bytes(&self) -> usize;

    /// Stop delivering messages. Idempotent; a blocked `receive` returns
    /// `Closed` within one poll interval.
    fn close(&self);
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed")]
    Closed,
    #[error("message of {len} bytes exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("{pool} buffer pool exhausted after {waited:?}")]
    BufferExhausted { pool: String, waited: Duration },
    #[error("framing error: {reason}")]
    Framing { reason: String },
}

impl TransportError {
    pub fn transience(&self) -> Transience {
        match self {
            TransportError::Io(_) => Transience::Unknown,
            TransportError::Closed => Transience::Permanent,
            TransportError::TooLarge { .. } => Transience::Permanent,
            TransportError::BufferExhausted { .. } => Transience::Retryable,
            TransportError::Framing { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            TransportError::Io(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => TransportError::Io(err),
            FrameError::FrameTooLarge {
                max_frame_bytes,
                got_bytes,
            } => TransportError::TooLarge {
                len: got_bytes,
                max: max_frame_bytes,
            },
            FrameError::FrameLengthInvalid { reason } => TransportError::Framing { reason },
            FrameError::Aborted => TransportError::Closed,
        }
    }
}
