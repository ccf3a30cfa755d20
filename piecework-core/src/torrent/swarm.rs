//! One torrent's swarm: its piece book, peers and choker.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TorrentConfig;
use crate::network::Dialer;
use crate::storage::TorrentIO;
use crate::torrent::{
    Announcement, Choker, InfoHash, Metainfo, Peer, PeerId, PeerKey, PeerSource, PieceBook,
    TorrentState, TorrentStats,
};

/// Snapshot of one torrent for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    pub pieces_have: u32,
    pub piece_count: u32,
    pub peers: usize,
    pub established: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    /// Bytes per second, summed over peers
    pub download_rate: f64,
    pub upload_rate: f64,
}

impl TorrentStatus {
    pub fn is_done(&self) -> bool {
        self.state == TorrentState::Done
    }
}

/// What a torrent needs from the engine to open new connections.
pub struct ConnectContext<'a> {
    pub source: &'a mut dyn PeerSource,
    pub dialer: &'a dyn Dialer,
    pub next_key: &'a mut PeerKey,
}

impl ConnectContext<'_> {
    fn allocate_key(&mut self) -> PeerKey {
        let key = *self.next_key;
        *self.next_key += 1;
        key
    }
}

/// A torrent being downloaded or seeded.
pub struct Torrent {
    name: String,
    announce_urls: Vec<String>,
    book: PieceBook,
    peers: Vec<Peer>,
    choker: Choker,
    local_id: PeerId,
    max_peers: usize,
    keepalive_interval: Duration,
}

impl Torrent {
    /// Opens storage below `download_dir` and verifies existing data.
    pub fn new(
        metainfo: &Metainfo,
        download_dir: &Path,
        local_id: PeerId,
        config: &TorrentConfig,
    ) -> Self {
        let io = TorrentIO::new(metainfo, download_dir);
        Self {
            name: metainfo.name.clone(),
            announce_urls: metainfo.announce_urls.clone(),
            book: PieceBook::new(metainfo.info_hash, io, config),
            peers: Vec::new(),
            choker: Choker::new(config),
            local_id,
            max_peers: config.max_peers,
            keepalive_interval: config.keepalive_interval,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.book.info_hash()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn announce_urls(&self) -> &[String] {
        &self.announce_urls
    }

    pub fn state(&self) -> TorrentState {
        self.book.state()
    }

    pub fn stats(&self) -> Arc<TorrentStats> {
        self.book.stats().clone()
    }

    pub fn book(&self) -> &PieceBook {
        &self.book
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    /// Takes over an identified inbound peer.
    ///
    /// Returns the peer back if the torrent is at its peer limit.
    pub fn attach(&mut self, peer: Peer) -> Result<(), Peer> {
        if self.is_full() {
            return Err(peer);
        }
        debug!(info_hash = %self.info_hash(), peer = %peer.address(), "Attached inbound peer");
        self.peers.push(peer);
        Ok(())
    }

    pub fn try_read(&mut self, now: Instant) {
        for peer in &mut self.peers {
            peer.try_read(now);
        }
    }

    pub fn try_write(&mut self, now: Instant) {
        for peer in &mut self.peers {
            peer.try_write(now);
        }
    }

    /// Readiness futures of every peer that can report one.
    pub fn readiness(&self) -> Vec<BoxFuture<'_, ()>> {
        self.peers.iter().filter_map(Peer::readiness).collect()
    }

    /// One reactor tick for this torrent.
    ///
    /// Drops stopped peers, advances the live ones, delivers scheduler
    /// announcements, dials new peers while below the limit and runs the
    /// choker.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        connect: &mut ConnectContext<'_>,
        rng: &mut R,
    ) {
        self.reap();

        for index in 0..self.peers.len() {
            self.peers[index].update(&mut self.book, now);
            for announcement in self.book.take_announcements() {
                self.announce(announcement);
            }
        }

        self.connect(connect);
        self.choker.tick(self.peers.as_mut_slice(), now, rng);
    }

    fn reap(&mut self) {
        let book = &mut self.book;
        self.peers.retain_mut(|peer| {
            if !peer.is_stopped() {
                return true;
            }
            book.return_blocks(peer.take_requested());
            debug!(peer = %peer.address(), key = peer.key(), "Removed stopped peer");
            false
        });
    }

    fn announce(&mut self, announcement: Announcement) {
        for peer in &mut self.peers {
            match announcement {
                Announcement::Cancel(block) => peer.cancel(block),
                Announcement::Have(piece) => peer.have(piece),
            }
        }
    }

    fn connect(&mut self, ctx: &mut ConnectContext<'_>) {
        if self.book.state() == TorrentState::Done {
            return;
        }
        let info_hash = self.info_hash();
        while !self.is_full() {
            let Some(address) = ctx.source.get_peer(&info_hash) else {
                break;
            };
            if self.is_connected_to(address) {
                continue;
            }
            let key = ctx.allocate_key();
            let transport = ctx.dialer.dial(address);
            self.peers.push(Peer::outbound(
                key,
                address,
                transport,
                info_hash,
                self.local_id,
                self.keepalive_interval,
            ));
            debug!(%info_hash, %address, key, "Dialing peer");
        }
    }

    fn is_connected_to(&self, address: SocketAddr) -> bool {
        self.peers.iter().any(|peer| peer.address() == address)
    }

    /// Closes every connection and releases storage.
    pub fn stop(&mut self) {
        for peer in &mut self.peers {
            peer.close();
        }
        self.reap();
        self.book.close();
        info!(info_hash = %self.info_hash(), name = %self.name, "Torrent stopped");
    }

    pub fn status(&self, now: Instant) -> TorrentStatus {
        let stats = self.book.stats();
        TorrentStatus {
            info_hash: self.info_hash(),
            name: self.name.clone(),
            state: self.book.state(),
            pieces_have: self.book.bitfield().count_set(),
            piece_count: self.book.piece_count(),
            peers: self.peers.len(),
            established: self.peers.iter().filter(|p| p.is_established()).count(),
            downloaded: stats.downloaded(),
            uploaded: stats.uploaded(),
            left: stats.left(),
            download_rate: self.peers.iter().map(|p| p.download_rate(now)).sum(),
            upload_rate: self.peers.iter().map(|p| p.upload_rate(now)).sum(),
        }
    }
}
