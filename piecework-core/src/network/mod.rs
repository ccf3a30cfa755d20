//! Connection establishment for the reactor
//!
//! Peers only ever see a [`Transport`]; how the bytes move is decided here.
//! Production uses TCP, tests plug in in-memory dialers.

pub mod tcp;

use std::net::SocketAddr;

pub use tcp::{TcpDialer, TcpTransport};

use crate::torrent::Transport;

/// Opens outbound connections without blocking the caller.
///
/// The returned transport may still be connecting; it reports
/// `WouldBlock` until the connection is usable and an I/O error if it
/// never becomes so.
pub trait Dialer: Send + Sync {
    fn dial(&self, address: SocketAddr) -> Box<dyn Transport>;
}
