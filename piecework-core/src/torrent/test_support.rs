//! In-memory transports and fixtures for peer and swarm tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Transport;
use crate::config::TorrentConfig;
use crate::network::Dialer;
use crate::storage::TorrentIO;
use crate::storage::test_fixtures::single_file_metainfo;
use crate::torrent::{InfoHash, Metainfo, PeerSource, PieceBook, TorrentStats};

#[derive(Default)]
struct Link {
    /// `queues[i]` holds bytes readable by side `i`.
    queues: [VecDeque<u8>; 2],
    closed: [bool; 2],
    write_limit: [Option<usize>; 2],
    write_error: [Option<io::ErrorKind>; 2],
}

/// One end of an in-memory duplex pipe.
///
/// Both ends share the same link, so a test keeps the remote end and
/// drives it by hand while the local end sits inside a `SocketBuffer`.
#[derive(Clone)]
pub struct MemoryTransport {
    link: Arc<Mutex<Link>>,
    side: usize,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let link = Arc::new(Mutex::new(Link::default()));
        (
            MemoryTransport {
                link: link.clone(),
                side: 0,
            },
            MemoryTransport { link, side: 1 },
        )
    }

    fn other(&self) -> usize {
        1 - self.side
    }

    /// Makes `bytes` readable on the other end.
    pub fn push(&self, bytes: &[u8]) {
        let other = self.other();
        self.link.lock().queues[other].extend(bytes);
    }

    /// Drains everything the other end has written.
    pub fn take_written(&self) -> Vec<u8> {
        let side = self.side;
        self.link.lock().queues[side].drain(..).collect()
    }

    /// Caps the bytes accepted by each write on this end.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        let side = self.side;
        self.link.lock().write_limit[side] = limit;
    }

    /// Closes this end; the other end reads EOF once drained.
    pub fn shutdown(&self) {
        let side = self.side;
        self.link.lock().closed[side] = true;
    }

    /// Makes every write on the other end fail with `kind`.
    pub fn fail_peer_writes(&self, kind: io::ErrorKind) {
        let other = self.other();
        self.link.lock().write_error[other] = Some(kind);
    }

    /// True once the other end has been closed.
    pub fn peer_closed(&self) -> bool {
        let other = self.other();
        self.link.lock().closed[other]
    }
}

impl Transport for MemoryTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (side, other) = (self.side, self.other());
        let mut guard = self.link.lock();
        let link = &mut *guard;
        if link.closed[side] {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let queue = &mut link.queues[side];
        if queue.is_empty() {
            if link.closed[other] {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (side, other) = (self.side, self.other());
        let mut link = self.link.lock();
        if let Some(kind) = link.write_error[side] {
            return Err(kind.into());
        }
        if link.closed[side] {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if link.closed[other] {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = link.write_limit[side].map_or(buf.len(), |limit| limit.min(buf.len()));
        link.queues[other].extend(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        let side = self.side;
        self.link.lock().closed[side] = true;
    }
}

/// Hands out queued addresses to any torrent.
#[derive(Default)]
pub struct ListSource {
    pub addrs: VecDeque<SocketAddr>,
    pub announced: Vec<InfoHash>,
}

impl PeerSource for ListSource {
    fn get_peer(&mut self, _info_hash: &InfoHash) -> Option<SocketAddr> {
        self.addrs.pop_front()
    }

    fn start_announce(&mut self, info_hash: InfoHash, _: Arc<TorrentStats>, _: &[String]) {
        self.announced.push(info_hash);
    }

    fn stop_announce(&mut self, info_hash: &InfoHash) {
        self.announced.retain(|hash| hash != info_hash);
    }

    fn update(&mut self) {}
}

/// Dials into in-memory pipes and keeps the far ends for the test.
#[derive(Default, Clone)]
pub struct MemoryDialer {
    remotes: Arc<Mutex<Vec<(SocketAddr, MemoryTransport)>>>,
}

impl MemoryDialer {
    /// Far end of the most recent dial to `address`.
    pub fn remote(&self, address: SocketAddr) -> MemoryTransport {
        self.remotes
            .lock()
            .iter()
            .rev()
            .find(|(a, _)| *a == address)
            .map(|(_, t)| t.clone())
            .expect("address was dialed")
    }

    /// Takes every far end dialed so far.
    pub fn take_remotes(&self) -> Vec<(SocketAddr, MemoryTransport)> {
        std::mem::take(&mut *self.remotes.lock())
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, address: SocketAddr) -> Box<dyn Transport> {
        let (local, remote) = MemoryTransport::pair();
        self.remotes.lock().push((address, remote));
        Box::new(local)
    }
}

pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Book over a fresh tempdir holding none of the content.
pub fn empty_book(
    length: u64,
    piece_length: u32,
) -> (PieceBook, Metainfo, Vec<u8>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (metainfo, content) = single_file_metainfo("data.bin", length, piece_length);
    let io = TorrentIO::new(&metainfo, dir.path());
    let book = PieceBook::new(metainfo.info_hash, io, &TorrentConfig::default());
    (book, metainfo, content, dir)
}

/// Book over a tempdir already holding the full content.
pub fn seeded_book(
    length: u64,
    piece_length: u32,
) -> (PieceBook, Metainfo, Vec<u8>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (metainfo, content) = single_file_metainfo("data.bin", length, piece_length);
    std::fs::write(dir.path().join("data.bin"), &content).expect("seed content");
    let io = TorrentIO::new(&metainfo, dir.path());
    let book = PieceBook::new(metainfo.info_hash, io, &TorrentConfig::default());
    (book, metainfo, content, dir)
}
