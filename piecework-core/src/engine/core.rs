//! Synchronous engine state driven by the reactor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::config::PieceworkConfig;
use crate::network::Dialer;
use crate::torrent::{
    ConnectContext, InfoHash, Metainfo, Peer, PeerId, PeerKey, PeerSource, Torrent, TorrentError,
    TorrentStatus, Transport,
};

/// Every torrent plus the inbound connections not yet matched to one.
///
/// Never blocks on the network: the reactor feeds it accepted transports
/// and calls [`Engine::tick`] whenever something may have changed.
pub struct Engine {
    config: PieceworkConfig,
    local_id: PeerId,
    torrents: HashMap<InfoHash, Torrent>,
    /// Inbound peers still waiting for their handshake header
    pending: Vec<Peer>,
    source: Box<dyn PeerSource>,
    dialer: Box<dyn Dialer>,
    next_key: PeerKey,
    rng: StdRng,
}

impl Engine {
    pub fn new(
        config: PieceworkConfig,
        source: Box<dyn PeerSource>,
        dialer: Box<dyn Dialer>,
    ) -> Self {
        let local_id = PeerId::generate();
        info!(peer_id = %local_id, "Engine created");
        Self {
            config,
            local_id,
            torrents: HashMap::new(),
            pending: Vec::new(),
            source,
            dialer,
            next_key: 1,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn poll_timeout(&self) -> Duration {
        self.config.network.poll_timeout
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers a torrent and starts peer discovery for it.
    ///
    /// # Errors
    /// - `TorrentError::DuplicateTorrent` - Info hash already running
    pub fn add_torrent(
        &mut self,
        metainfo: &Metainfo,
        download_dir: &Path,
    ) -> Result<InfoHash, TorrentError> {
        let info_hash = metainfo.info_hash;
        if self.torrents.contains_key(&info_hash) {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }

        let torrent = Torrent::new(metainfo, download_dir, self.local_id, &self.config.torrent);
        self.source
            .start_announce(info_hash, torrent.stats(), torrent.announce_urls());
        info!(
            %info_hash,
            name = %torrent.name(),
            state = %torrent.state(),
            dir = %download_dir.display(),
            "Torrent added"
        );
        self.torrents.insert(info_hash, torrent);
        Ok(info_hash)
    }

    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not running
    pub fn remove_torrent(&mut self, info_hash: &InfoHash) -> Result<(), TorrentError> {
        let mut torrent = self
            .torrents
            .remove(info_hash)
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: *info_hash,
            })?;
        torrent.stop();
        self.source.stop_announce(info_hash);
        Ok(())
    }

    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not running
    pub fn status(&self, info_hash: &InfoHash, now: Instant) -> Result<TorrentStatus, TorrentError> {
        self.torrents
            .get(info_hash)
            .map(|torrent| torrent.status(now))
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: *info_hash,
            })
    }

    /// Status of every torrent, ordered by name.
    pub fn statuses(&self, now: Instant) -> Vec<TorrentStatus> {
        let mut statuses: Vec<TorrentStatus> =
            self.torrents.values().map(|t| t.status(now)).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Takes an accepted connection. Its torrent is picked once the
    /// handshake header arrives.
    pub fn accept(&mut self, transport: Box<dyn Transport>, address: SocketAddr) {
        let key = self.next_key;
        self.next_key += 1;
        debug!(%address, key, "Accepted inbound connection");
        self.pending.push(Peer::inbound(
            key,
            address,
            transport,
            self.local_id,
            self.config.torrent.keepalive_interval,
        ));
    }

    /// One pass over every connection: read, advance, write.
    pub fn tick(&mut self, now: Instant) {
        for peer in &mut self.pending {
            peer.try_read(now);
        }
        for torrent in self.torrents.values_mut() {
            torrent.try_read(now);
        }

        self.identify_pending();

        for torrent in self.torrents.values_mut() {
            let mut connect = ConnectContext {
                source: self.source.as_mut(),
                dialer: self.dialer.as_ref(),
                next_key: &mut self.next_key,
            };
            torrent.update(now, &mut connect, &mut self.rng);
        }
        self.source.update();

        for torrent in self.torrents.values_mut() {
            torrent.try_write(now);
        }
    }

    /// Hands inbound peers whose header has arrived to their torrent.
    fn identify_pending(&mut self) {
        let torrents = &mut self.torrents;
        let mut waiting = Vec::with_capacity(self.pending.len());

        for mut peer in self.pending.drain(..) {
            let Some(info_hash) = peer.identify(|hash| torrents.contains_key(hash)) else {
                if peer.is_stopped() {
                    debug!(peer = %peer.address(), "Dropped unidentified inbound peer");
                } else {
                    waiting.push(peer);
                }
                continue;
            };
            let Some(torrent) = torrents.get_mut(&info_hash) else {
                continue;
            };
            if let Err(mut rejected) = torrent.attach(peer) {
                info!(%info_hash, peer = %rejected.address(), "Torrent full, refusing peer");
                rejected.close();
            }
        }

        self.pending = waiting;
    }

    /// Readiness futures of every connection that can report one.
    pub fn readiness(&self) -> Vec<BoxFuture<'_, ()>> {
        self.pending
            .iter()
            .filter_map(Peer::readiness)
            .chain(self.torrents.values().flat_map(Torrent::readiness))
            .collect()
    }

    /// Stops every torrent and closes every connection.
    pub fn shutdown(&mut self) {
        for peer in &mut self.pending {
            peer.close();
        }
        self.pending.clear();

        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for info_hash in hashes {
            if let Some(mut torrent) = self.torrents.remove(&info_hash) {
                torrent.stop();
                self.source.stop_announce(&info_hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::storage::test_fixtures::single_file_metainfo;
    use crate::torrent::protocol::HandshakeCodec;
    use crate::torrent::test_support::{ListSource, MemoryDialer, MemoryTransport, test_addr};
    use crate::torrent::{HandshakeHeader, TorrentState};

    fn engine(source: ListSource, dialer: MemoryDialer) -> Engine {
        Engine::new(
            PieceworkConfig::for_testing(),
            Box::new(source),
            Box::new(dialer),
        )
    }

    #[test]
    fn test_add_and_remove_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, _) = single_file_metainfo("a.bin", 4 * 16_384, 16_384);
        let mut engine = engine(ListSource::default(), MemoryDialer::default());

        let info_hash = engine.add_torrent(&metainfo, dir.path()).unwrap();
        assert_eq!(info_hash, metainfo.info_hash);
        assert!(matches!(
            engine.add_torrent(&metainfo, dir.path()),
            Err(TorrentError::DuplicateTorrent { .. })
        ));

        let status = engine.status(&info_hash, Instant::now()).unwrap();
        assert_eq!(status.state, TorrentState::Downloading);
        assert_eq!(engine.statuses(Instant::now()).len(), 1);

        engine.remove_torrent(&info_hash).unwrap();
        assert_eq!(engine.torrent_count(), 0);
        assert!(matches!(
            engine.remove_torrent(&info_hash),
            Err(TorrentError::TorrentNotFound { .. })
        ));
        assert!(engine.status(&info_hash, Instant::now()).is_err());
    }

    #[test]
    fn test_statuses_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(ListSource::default(), MemoryDialer::default());
        for name in ["b.bin", "c.bin", "a.bin"] {
            let (metainfo, _) = single_file_metainfo(name, 16_384, 16_384);
            engine.add_torrent(&metainfo, dir.path()).unwrap();
        }

        let names: Vec<String> = engine
            .statuses(Instant::now())
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a.bin", "b.bin", "c.bin"]);
    }

    #[test]
    fn test_inbound_peer_matched_by_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, _) = single_file_metainfo("a.bin", 4 * 16_384, 16_384);
        let mut engine = engine(ListSource::default(), MemoryDialer::default());
        let info_hash = engine.add_torrent(&metainfo, dir.path()).unwrap();

        let (known_local, known_remote) = MemoryTransport::pair();
        let (unknown_local, unknown_remote) = MemoryTransport::pair();
        engine.accept(Box::new(known_local), test_addr(1));
        engine.accept(Box::new(unknown_local), test_addr(2));
        engine.tick(Instant::now());
        assert_eq!(engine.pending_count(), 2);

        let header = |hash| HandshakeCodec::encode_header(&HandshakeHeader::new(hash));
        known_remote.push(&header(info_hash));
        unknown_remote.push(&header(InfoHash::new([0xee; 20])));
        engine.tick(Instant::now());

        assert_eq!(engine.pending_count(), 0);
        assert!(unknown_remote.peer_closed());
        assert!(!known_remote.peer_closed());
        assert_eq!(engine.status(&info_hash, Instant::now()).unwrap().peers, 1);

        // our side answered with a full handshake
        let reply = known_remote.take_written();
        assert_eq!(&reply[..48], &header(info_hash)[..]);
        assert_eq!(&reply[48..68], engine.local_id().as_bytes());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, _) = single_file_metainfo("a.bin", 16_384, 16_384);
        let mut engine = engine(ListSource::default(), MemoryDialer::default());

        engine.add_torrent(&metainfo, dir.path()).unwrap();
        engine.shutdown();
        assert_eq!(engine.torrent_count(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_in_memory_swarm_transfers_torrent() {
        let seed_dir = tempfile::tempdir().unwrap();
        let leech_dir = tempfile::tempdir().unwrap();
        let (metainfo, content) = single_file_metainfo("movie.bin", 10 * 32_768 + 1000, 32_768);
        std::fs::write(seed_dir.path().join("movie.bin"), &content).unwrap();

        let seeder_addr = test_addr(6881);
        let mut seeder = engine(ListSource::default(), MemoryDialer::default());
        let dialer = MemoryDialer::default();
        let source = ListSource {
            addrs: VecDeque::from(vec![seeder_addr]),
            ..ListSource::default()
        };
        let mut leecher = engine(source, dialer.clone());

        let info_hash = seeder.add_torrent(&metainfo, seed_dir.path()).unwrap();
        assert_eq!(
            seeder.status(&info_hash, Instant::now()).unwrap().state,
            TorrentState::Done
        );
        leecher.add_torrent(&metainfo, leech_dir.path()).unwrap();

        let mut done = false;
        for _ in 0..2_000 {
            leecher.tick(Instant::now());
            for (address, remote) in dialer.take_remotes() {
                assert_eq!(address, seeder_addr);
                seeder.accept(Box::new(remote), test_addr(50_000));
            }
            seeder.tick(Instant::now());

            if leecher.status(&info_hash, Instant::now()).unwrap().is_done() {
                done = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(done, "leecher never completed");

        let status = leecher.status(&info_hash, Instant::now()).unwrap();
        assert_eq!(status.pieces_have, status.piece_count);
        assert_eq!(status.left, 0);
        assert_eq!(
            std::fs::read(leech_dir.path().join("movie.bin")).unwrap(),
            content
        );
        assert!(seeder.status(&info_hash, Instant::now()).unwrap().uploaded >= content.len() as u64);
    }
}
