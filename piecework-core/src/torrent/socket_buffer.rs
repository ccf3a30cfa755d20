//! Per-connection duplex byte buffer over a non-blocking transport

use std::io;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use tokio::io::Interest;
use tracing::{debug, info, warn};

use crate::torrent::Rate;

/// Cap on each direction's queued bytes.
pub const SOCKET_BUFFER_CAPACITY: usize = 262_144;

/// Largest single read issued to the transport.
const READ_CHUNK: usize = 65_536;

/// Non-blocking byte stream a [`SocketBuffer`] drives.
///
/// `try_read` and `try_write` follow `std::io` semantics: `WouldBlock`
/// means "nothing now", `Ok(0)` from a read means end of stream.
pub trait Transport: Send {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Releases the underlying descriptor.
    fn close(&mut self);

    /// Future resolving once the transport may make progress on `interest`.
    ///
    /// Transports that cannot report readiness return `None` and are polled
    /// on every reactor tick instead.
    fn readiness(&self, _interest: Interest) -> Option<BoxFuture<'_, ()>> {
        None
    }
}

/// Inbound and outbound queues for one connection.
///
/// Closing is monotonic: once the transport is dropped the buffer never
/// reopens, and every further read or write is a no-op.
pub struct SocketBuffer {
    transport: Option<Box<dyn Transport>>,
    inbound: BytesMut,
    outbound: BytesMut,
    rate: Rate,
}

impl SocketBuffer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            rate: Rate::new(),
        }
    }

    /// Reads whatever the transport has, up to the inbound cap.
    pub fn try_read(&mut self, now: Instant) {
        while self.inbound.len() < SOCKET_BUFFER_CAPACITY {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };

            let start = self.inbound.len();
            let want = READ_CHUNK.min(SOCKET_BUFFER_CAPACITY - start);
            self.inbound.resize(start + want, 0);
            let result = transport.try_read(&mut self.inbound[start..]);

            match result {
                Ok(0) => {
                    self.inbound.truncate(start);
                    debug!("Remote closed the connection");
                    self.close();
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    self.rate.register_download(n, now);
                }
                Err(e) => {
                    self.inbound.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return,
                        io::ErrorKind::Interrupted => continue,
                        kind if is_disconnect(kind) => {
                            info!(error = %e, "Connection lost");
                            self.close();
                        }
                        _ => {
                            warn!(error = %e, "Read failed");
                            self.close();
                        }
                    }
                }
            }
        }
    }

    /// Writes as much of the outbound queue as the transport accepts.
    pub fn try_write(&mut self, now: Instant) {
        while !self.outbound.is_empty() {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };

            match transport.try_write(&self.outbound) {
                Ok(0) => {
                    debug!("Transport accepted no bytes");
                    self.close();
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    self.rate.register_upload(n, now);
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::BrokenPipe => {
                        info!(error = %e, "Broken pipe");
                        self.close();
                    }
                    kind if is_disconnect(kind) => {
                        info!(error = %e, "Connection lost");
                        self.close();
                    }
                    _ => {
                        warn!(error = %e, "Write failed");
                        self.close();
                    }
                },
            }
        }
    }

    /// Bytes received and not yet consumed.
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Drops `n` consumed bytes from the inbound front.
    ///
    /// # Panics
    /// Panics if `n` exceeds the buffered length.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.inbound.len(),
            "advance past end of inbound buffer"
        );
        self.inbound.advance(n);
    }

    /// Queues bytes for sending.
    pub fn concat(&mut self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.outbound.extend_from_slice(bytes);
    }

    pub fn out_full(&self) -> bool {
        self.outbound.len() >= SOCKET_BUFFER_CAPACITY
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn ready_to_read(&self) -> bool {
        !self.is_closed() && self.inbound.len() < SOCKET_BUFFER_CAPACITY
    }

    pub fn ready_to_write(&self) -> bool {
        !self.is_closed() && !self.outbound.is_empty()
    }

    /// Readiness future covering whatever this buffer currently wants.
    pub fn readiness(&self) -> Option<BoxFuture<'_, ()>> {
        let transport = self.transport.as_ref()?;
        let interest = match (self.ready_to_read(), self.ready_to_write()) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return None,
        };
        transport.readiness(interest)
    }

    pub fn rate(&self) -> &Rate {
        &self.rate
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Closes the transport. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            self.outbound.clear();
        }
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::test_support::MemoryTransport;

    #[test]
    fn test_read_appends_and_advance_consumes() {
        let (local, remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        remote.push(b"hello world");
        buffer.try_read(Instant::now());
        assert_eq!(buffer.inbound(), b"hello world");

        buffer.advance(6);
        assert_eq!(buffer.inbound(), b"world");
    }

    #[test]
    #[should_panic]
    fn test_advance_past_end_panics() {
        let (local, _remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));
        buffer.advance(1);
    }

    #[test]
    fn test_write_drains_outbound() {
        let (local, remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        buffer.concat(b"abc");
        assert!(buffer.ready_to_write());
        buffer.try_write(Instant::now());

        assert_eq!(remote.take_written(), b"abc");
        assert!(!buffer.ready_to_write());
    }

    #[test]
    fn test_partial_write_keeps_remainder() {
        let (local, remote) = MemoryTransport::pair();
        local.set_write_limit(Some(2));
        let mut buffer = SocketBuffer::new(Box::new(local));

        buffer.concat(b"abcde");
        buffer.try_write(Instant::now());

        assert_eq!(remote.take_written(), b"ab");
        assert_eq!(buffer.outbound_len(), 3);
    }

    #[test]
    fn test_eof_closes() {
        let (local, remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        remote.shutdown();
        buffer.try_read(Instant::now());

        assert!(buffer.is_closed());
        assert!(!buffer.ready_to_read());
    }

    #[test]
    fn test_broken_pipe_closes() {
        let (local, remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        remote.fail_peer_writes(io::ErrorKind::BrokenPipe);
        buffer.concat(b"x");
        buffer.try_write(Instant::now());

        assert!(buffer.is_closed());
        assert!(remote.peer_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (local, remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        buffer.close();
        buffer.close();
        assert!(buffer.is_closed());
        assert!(remote.peer_closed());

        buffer.concat(b"ignored");
        assert_eq!(buffer.outbound_len(), 0);
    }

    #[test]
    fn test_out_full_at_capacity() {
        let (local, _remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        buffer.concat(&vec![0u8; SOCKET_BUFFER_CAPACITY - 1]);
        assert!(!buffer.out_full());
        buffer.concat(&[0u8]);
        assert!(buffer.out_full());
    }

    #[test]
    fn test_inbound_capped() {
        let (local, remote) = MemoryTransport::pair();
        let mut buffer = SocketBuffer::new(Box::new(local));

        remote.push(&vec![1u8; SOCKET_BUFFER_CAPACITY + 10]);
        buffer.try_read(Instant::now());

        assert_eq!(buffer.inbound().len(), SOCKET_BUFFER_CAPACITY);
        assert!(!buffer.ready_to_read());

        buffer.advance(SOCKET_BUFFER_CAPACITY);
        buffer.try_read(Instant::now());
        assert_eq!(buffer.inbound().len(), 10);
    }
}
