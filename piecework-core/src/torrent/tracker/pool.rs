//! Peer pool fed by bootstrap addresses and explicit additions

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::resolver::{Resolution, Resolver};
use super::{PeerSource, TorrentStats};
use crate::config::NetworkConfig;
use crate::torrent::InfoHash;

/// Per-torrent discovery state.
struct Swarm {
    stats: Arc<TorrentStats>,
    candidates: VecDeque<SocketAddr>,
    queued: HashSet<SocketAddr>,
    next_refresh: Instant,
}

impl Swarm {
    fn offer(&mut self, addr: SocketAddr) {
        if self.queued.insert(addr) {
            self.candidates.push_back(addr);
        }
    }
}

/// The shipped [`PeerSource`].
///
/// Bootstrap entries are `ip:port` or `host:port`. Host names go through a
/// [`Resolver`]; every resolved address is offered to every announced
/// torrent. Bootstrap addresses are re-offered each refresh interval so a
/// peer that dropped can be dialed again.
pub struct PeerPool {
    bootstrap: Vec<SocketAddr>,
    resolved: HashMap<String, Vec<SocketAddr>>,
    swarms: HashMap<InfoHash, Swarm>,
    resolver: Option<Resolver>,
    refresh_interval: Duration,
}

impl PeerPool {
    /// Creates a pool from bootstrap peers.
    ///
    /// A resolver worker is spawned only when some entry needs a lookup,
    /// which requires a running tokio runtime.
    pub fn new(bootstrap: &[String], config: &NetworkConfig) -> Self {
        let mut addrs = Vec::new();
        let mut hosts = Vec::new();
        for entry in bootstrap {
            match entry.parse::<SocketAddr>() {
                Ok(addr) => addrs.push(addr),
                Err(_) => hosts.push(entry.clone()),
            }
        }

        let resolver = if hosts.is_empty() {
            None
        } else {
            let mut resolver = Resolver::spawn(
                config.resolver_queue_size,
                config.resolver_timeout,
                config.resolver_retry_interval,
            );
            for host in hosts {
                resolver.submit(host);
            }
            Some(resolver)
        };

        Self {
            bootstrap: addrs,
            resolved: HashMap::new(),
            swarms: HashMap::new(),
            resolver,
            refresh_interval: config.peer_refresh_interval,
        }
    }

    /// Offers `addr` for `info_hash`. Ignored for torrents not announced.
    pub fn add_peer(&mut self, info_hash: &InfoHash, addr: SocketAddr) {
        match self.swarms.get_mut(info_hash) {
            Some(swarm) => swarm.offer(addr),
            None => debug!(%info_hash, %addr, "Peer offered for unannounced torrent"),
        }
    }

    /// Candidates currently queued for `info_hash`.
    pub fn candidate_count(&self, info_hash: &InfoHash) -> usize {
        self.swarms
            .get(info_hash)
            .map_or(0, |swarm| swarm.candidates.len())
    }

    fn known_addrs(&self) -> Vec<SocketAddr> {
        self.bootstrap
            .iter()
            .chain(self.resolved.values().flatten())
            .copied()
            .collect()
    }

    fn refresh(&mut self, now: Instant) {
        let known = self.known_addrs();
        for (info_hash, swarm) in &mut self.swarms {
            if swarm.next_refresh > now {
                continue;
            }
            swarm.next_refresh = now + self.refresh_interval;
            for addr in &known {
                swarm.offer(*addr);
            }
            debug!(
                %info_hash,
                candidates = swarm.candidates.len(),
                left = swarm.stats.left(),
                "Refreshed peer candidates"
            );
        }
    }
}

impl PeerSource for PeerPool {
    fn get_peer(&mut self, info_hash: &InfoHash) -> Option<SocketAddr> {
        let swarm = self.swarms.get_mut(info_hash)?;
        let addr = swarm.candidates.pop_front()?;
        swarm.queued.remove(&addr);
        Some(addr)
    }

    fn start_announce(
        &mut self,
        info_hash: InfoHash,
        stats: Arc<TorrentStats>,
        announce_urls: &[String],
    ) {
        if self.swarms.contains_key(&info_hash) {
            warn!(%info_hash, "Torrent already announced");
            return;
        }
        for url in announce_urls {
            debug!(%info_hash, %url, "Tracker announce not supported, using peer pool");
        }
        info!(%info_hash, bootstrap = self.bootstrap.len(), "Started peer discovery");

        let mut swarm = Swarm {
            stats,
            candidates: VecDeque::new(),
            queued: HashSet::new(),
            next_refresh: Instant::now() + self.refresh_interval,
        };
        for addr in self.known_addrs() {
            swarm.offer(addr);
        }
        self.swarms.insert(info_hash, swarm);
    }

    fn stop_announce(&mut self, info_hash: &InfoHash) {
        match self.swarms.remove(info_hash) {
            Some(swarm) => info!(
                %info_hash,
                uploaded = swarm.stats.uploaded(),
                downloaded = swarm.stats.downloaded(),
                "Stopped peer discovery"
            ),
            None => warn!(%info_hash, "Stopping discovery for unknown torrent"),
        }
    }

    fn update(&mut self) {
        let now = Instant::now();
        let resolutions = match self.resolver.as_mut() {
            Some(resolver) => resolver.poll(now),
            None => Vec::new(),
        };

        for resolution in resolutions {
            if let Resolution::Resolved { host, addrs } = resolution {
                info!(%host, count = addrs.len(), "Resolved bootstrap peer");
                for swarm in self.swarms.values_mut() {
                    for addr in &addrs {
                        swarm.offer(*addr);
                    }
                }
                self.resolved.insert(host, addrs);
            }
        }

        self.refresh(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pool(bootstrap: &[&str]) -> PeerPool {
        let bootstrap: Vec<String> = bootstrap.iter().map(|s| s.to_string()).collect();
        PeerPool::new(&bootstrap, &NetworkConfig::default())
    }

    #[test]
    fn test_empty_pool_returns_nothing() {
        let mut pool = pool(&[]);
        let hash = InfoHash::new([1u8; 20]);
        assert_eq!(pool.get_peer(&hash), None);

        pool.start_announce(hash, Arc::new(TorrentStats::new(0)), &[]);
        assert_eq!(pool.get_peer(&hash), None);
    }

    #[test]
    fn test_bootstrap_peers_are_handed_out_once() {
        let mut pool = pool(&["127.0.0.1:7001", "127.0.0.1:7002"]);
        let hash = InfoHash::new([1u8; 20]);
        pool.start_announce(hash, Arc::new(TorrentStats::new(0)), &[]);

        assert_eq!(pool.get_peer(&hash), Some(addr(7001)));
        assert_eq!(pool.get_peer(&hash), Some(addr(7002)));
        assert_eq!(pool.get_peer(&hash), None);
    }

    #[test]
    fn test_add_peer_deduplicates() {
        let mut pool = pool(&[]);
        let hash = InfoHash::new([2u8; 20]);
        pool.start_announce(hash, Arc::new(TorrentStats::new(0)), &[]);

        pool.add_peer(&hash, addr(8000));
        pool.add_peer(&hash, addr(8000));
        assert_eq!(pool.candidate_count(&hash), 1);

        pool.add_peer(&InfoHash::new([3u8; 20]), addr(8001));
        assert_eq!(pool.candidate_count(&InfoHash::new([3u8; 20])), 0);
    }

    #[test]
    fn test_stop_announce_forgets_torrent() {
        let mut pool = pool(&["127.0.0.1:7001"]);
        let hash = InfoHash::new([4u8; 20]);
        pool.start_announce(hash, Arc::new(TorrentStats::new(0)), &[]);
        pool.stop_announce(&hash);
        pool.stop_announce(&hash);

        assert_eq!(pool.get_peer(&hash), None);
    }

    #[tokio::test]
    async fn test_host_names_are_resolved_in_background() {
        let mut pool = pool(&["localhost:7003"]);
        let hash = InfoHash::new([5u8; 20]);
        pool.start_announce(hash, Arc::new(TorrentStats::new(0)), &[]);
        assert_eq!(pool.get_peer(&hash), None);

        let mut found = None;
        for _ in 0..400 {
            pool.update();
            found = pool.get_peer(&hash);
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(found.map(|a| a.port()), Some(7003));
    }
}
