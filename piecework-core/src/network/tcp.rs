//! TCP transport and dialer

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::{Notify, oneshot};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use super::Dialer;
use crate::torrent::Transport;

enum Connection {
    Connecting(oneshot::Receiver<io::Result<TcpStream>>),
    Connected(TcpStream),
    Closed,
}

/// Non-blocking TCP stream, possibly still connecting.
pub struct TcpTransport {
    connection: Connection,
}

impl TcpTransport {
    /// Wraps an accepted or already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Self {
            connection: Connection::Connected(stream),
        }
    }

    /// Transport whose stream arrives through `pending`.
    pub fn connecting(pending: oneshot::Receiver<io::Result<TcpStream>>) -> Self {
        Self {
            connection: Connection::Connecting(pending),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, Connection::Connected(_))
    }

    /// Promotes a finished connect and returns the usable stream.
    fn stream(&mut self) -> io::Result<&TcpStream> {
        if let Connection::Connecting(pending) = &mut self.connection {
            let next = match pending.try_recv() {
                Err(TryRecvError::Empty) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(TryRecvError::Closed) => {
                    self.connection = Connection::Closed;
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connect task dropped",
                    ));
                }
                Ok(Err(e)) => {
                    self.connection = Connection::Closed;
                    return Err(e);
                }
                Ok(Ok(stream)) => stream,
            };
            *self = Self::from_stream(next);
        }

        match &self.connection {
            Connection::Connected(stream) => Ok(stream),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Transport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.try_write(buf)
    }

    fn close(&mut self) {
        self.connection = Connection::Closed;
    }

    fn readiness(&self, interest: Interest) -> Option<BoxFuture<'_, ()>> {
        match &self.connection {
            Connection::Connected(stream) => Some(Box::pin(async move {
                // errors surface on the next try_read/try_write
                let _ = stream.ready(interest).await;
            })),
            _ => None,
        }
    }
}

/// Dials on a spawned task and wakes the reactor when the attempt ends.
pub struct TcpDialer {
    connect_timeout: Duration,
    wake: Arc<Notify>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, wake: Arc<Notify>) -> Self {
        Self {
            connect_timeout,
            wake,
        }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, address: SocketAddr) -> Box<dyn Transport> {
        let (sender, receiver) = oneshot::channel();
        let wake = self.wake.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(connect_timeout, TcpStream::connect(address))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                )),
            };
            if let Err(e) = &result {
                debug!(%address, error = %e, "Connect failed");
            }
            // receiver gone means the peer was already dropped
            let _ = sender.send(result);
            wake.notify_one();
        });

        Box::new(TcpTransport::connecting(receiver))
    }
}
