//! Stream channels over TCP (RPC record marking or 9P framing).

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::frame::{FrameReader, FrameWriter, ReadOutcome, is_timeout};
use super::{Channel, Inbound, Received, TransportError, TransportKind};

/// Read timeout on an idle connection; bounds how long `close` takes to be seen.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct StreamChannel {
    kind: TransportKind,
    peer: SocketAddr,
    max_message_bytes: usize,
    reader: Mutex<FrameReader<TcpStream>>,
    writer: Mutex<FrameWriter<TcpStream>>,
    closed: Arc<AtomicBool>,
}

impl StreamChannel {
    pub fn new(
        stream: TcpStream,
        kind: TransportKind,
        max_message_bytes: usize,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(poll_interval))?;
        stream.set_nodelay(true)?;
        let write_half = stream.try_clone()?;
        let closed = Arc::new(AtomicBool::new(false));
        let framing = kind.framing();
        Ok(Self {
            kind,
            peer,
            max_message_bytes,
            reader: Mutex::new(
                FrameReader::new(stream, framing, max_message_bytes).with_abort(closed.clone()),
            ),
            writer: Mutex::new(FrameWriter::new(write_half, framing, max_message_bytes)),
            closed,
        })
    }

    /// Connect to a listener; used by tests and tooling.
    pub fn connect(
        addr: SocketAddr,
        kind: TransportKind,
        max_message_bytes: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        Self::new(stream, kind, max_message_bytes, DEFAULT_POLL_INTERVAL)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Channel for StreamChannel {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn receive(&self) -> Result<Received, TransportError> {
        if self.is_closed() {
            return Ok(Received::Closed);
        }
        let mut reader = self.reader.lock().expect("stream reader lock poisoned");
        match reader.read_next() {
            Ok(ReadOutcome::Frame(bytes)) => Ok(Received::Message(Inbound {
                bytes: Bytes::from(bytes),
                peer: self.peer,
            })),
            Ok(ReadOutcome::Idle) => {
                if self.is_closed() {
                    Ok(Received::Closed)
                } else {
                    Ok(Received::WouldBlock)
                }
            }
            Ok(ReadOutcome::Eof) => {
                self.closed.store(true, Ordering::Release);
                Ok(Received::Closed)
            }
            Err(err) => {
                // A framing error leaves the stream unsynchronized.
                self.closed.store(true, Ordering::Release);
                match TransportError::from(err) {
                    TransportError::Closed => Ok(Received::Closed),
                    other => Err(other),
                }
            }
        }
    }

    fn send(&self, _peer: SocketAddr, reply: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().expect("stream writer lock poisoned");
        writer.write_frame(reply)?;
        Ok(())
    }

    fn peer_address(&self) -> SocketAddr {
        self.peer
    }

    fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let writer = self.writer.lock().expect("stream writer lock poisoned");
        let _ = writer.get_ref().shutdown(Shutdown::Both);
        tracing::debug!(peer = %self.peer, kind = %self.kind, "stream channel closed");
    }
}

/// Nonblocking listener polled by an accept thread.
pub struct StreamListener {
    listener: TcpListener,
    kind: TransportKind,
    local: SocketAddr,
    max_message_bytes: usize,
    poll_interval: Duration,
}

impl StreamListener {
    pub fn bind(
        addr: SocketAddr,
        kind: TransportKind,
        max_message_bytes: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, kind = %kind, "listening");
        Ok(Self {
            listener,
            kind,
            local,
            max_message_bytes,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept one pending connection; `Ok(None)` when none is waiting.
    pub fn accept(&self) -> Result<Option<StreamChannel>, TransportError> {
        match self.listener.accept() {
            Ok((stream, _)) => StreamChannel::new(
                stream,
                self.kind,
                self.max_message_bytes,
                self.poll_interval,
            )
            .map(Some),
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Instant;

    fn accept_blocking(listener: &StreamListener) -> StreamChannel {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(channel) = listener.accept().unwrap() {
                return channel;
            }
            assert!(Instant::now() < deadline, "accept timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn receive_message(channel: &StreamChannel) -> Inbound {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match channel.receive().unwrap() {
                Received::Message(inbound) => return inbound,
                Received::WouldBlock => assert!(Instant::now() < deadline, "receive timed out"),
                Received::Closed => panic!("channel closed"),
            }
        }
    }

    #[test]
    fn record_marked_round_trip() {
        let listener =
            StreamListener::bind("127.0.0.1:0".parse().unwrap(), TransportKind::Tcp, 4096)
                .unwrap()
                .with_poll_interval(Duration::from_millis(20));
        let client = StreamChannel::connect(listener.local_addr(), TransportKind::Tcp, 4096)
            .unwrap();
        let server = accept_blocking(&listener);

        client.send(client.peer_address(), b"call").unwrap();
        let inbound = receive_message(&server);
        assert_eq!(&inbound.bytes[..], b"call");
        assert_eq!(inbound.peer, server.peer_address());

        server.send(inbound.peer, b"reply").unwrap();
        assert_eq!(&receive_message(&client).bytes[..], b"reply");
    }

    #[test]
    fn idle_connection_reports_would_block_then_closed() {
        let listener =
            StreamListener::bind("127.0.0.1:0".parse().unwrap(), TransportKind::Tcp, 4096)
                .unwrap()
                .with_poll_interval(Duration::from_millis(20));
        let client = StreamChannel::connect(listener.local_addr(), TransportKind::Tcp, 4096)
            .unwrap();
        let server = accept_blocking(&listener);

        assert!(matches!(server.receive().unwrap(), Received::WouldBlock));
        drop(client);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match server.receive().unwrap() {
                Received::Closed => break,
                Received::WouldBlock => assert!(Instant::now() < deadline),
                Received::Message(_) => panic!("unexpected message"),
            }
        }
    }

    #[test]
    fn close_is_observed_by_receive_and_send() {
        let listener =
            StreamListener::bind("127.0.0.1:0".parse().unwrap(), TransportKind::NinePTcp, 4096)
                .unwrap();
        let _client =
            StreamChannel::connect(listener.local_addr(), TransportKind::NinePTcp, 4096).unwrap();
        let server = accept_blocking(&listener);
        server.close();
        server.close();
        assert!(matches!(server.receive().unwrap(), Received::Closed));
        assert!(matches!(
            server.send(server.peer_address(), &[7, 0, 0, 0, 7, 0, 0]),
            Err(TransportError::Closed)
        ));
    }
}
