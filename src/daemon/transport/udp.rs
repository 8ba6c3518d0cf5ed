//! Datagram channel: one bound socket shared by every UDP peer.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;

use super::frame::is_timeout;
use super::tcp::DEFAULT_POLL_INTERVAL;
use super::{Channel, Inbound, Received, TransportError, TransportKind};

pub struct UdpChannel {
    socket: UdpSocket,
    local: SocketAddr,
    max_message_bytes: usize,
    closed: AtomicBool,
}

impl UdpChannel {
    pub fn bind(addr: SocketAddr, max_message_bytes: usize) -> Result<Self, TransportError> {
        Self::bind_with_poll(addr, max_message_bytes, DEFAULT_POLL_INTERVAL)
    }

    pub fn bind_with_poll(
        addr: SocketAddr,
        max_message_bytes: usize,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(poll_interval))?;
        let local = socket.local_addr()?;
        tracing::info!(addr = %local, kind = "udp", "listening");
        Ok(Self {
            socket,
            local,
            max_message_bytes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Channel for UdpChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn receive(&self) -> Result<Received, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(Received::Closed);
        }
        // One spare byte detects truncation of oversized datagrams.
        let mut buf = vec![0u8; self.max_message_bytes + 1];
        match self.socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                if len > self.max_message_bytes {
                    tracing::warn!(%peer, max = self.max_message_bytes, "dropping oversized datagram");
                    return Ok(Received::WouldBlock);
                }
                buf.truncate(len);
                Ok(Received::Message(Inbound {
                    bytes: Bytes::from(buf),
                    peer,
                }))
            }
            Err(err) if is_timeout(&err) || err.kind() == io::ErrorKind::Interrupted => {
                if self.closed.load(Ordering::Acquire) {
                    Ok(Received::Closed)
                } else {
                    Ok(Received::WouldBlock)
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send(&self, peer: SocketAddr, reply: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if reply.len() > self.max_message_bytes {
            return Err(TransportError::TooLarge {
                len: reply.len(),
                max: self.max_message_bytes,
            });
        }
        let sent = self.socket.send_to(reply, peer)?;
        if sent != reply.len() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram send: {sent} of {}", reply.len()),
            )));
        }
        Ok(())
    }

    /// The bound address; datagram channels have no single peer.
    fn peer_address(&self) -> SocketAddr {
        self.local
    }

    fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
