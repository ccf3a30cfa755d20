//! Tit-for-tat upload slot allocation with an optimistic slot

use std::time::{Duration, Instant};

use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::debug;

use crate::config::TorrentConfig;
use crate::torrent::{Peer, PeerKey};

/// What the choker needs to see and control on a peer.
pub trait ChokeTarget {
    fn key(&self) -> PeerKey;

    /// True once the peer can exchange messages.
    fn is_ready(&self) -> bool;

    fn download_rate(&self, now: Instant) -> f64;

    fn peer_interested(&self) -> bool;

    /// True while we refuse the peer's requests.
    fn is_choked(&self) -> bool;

    fn choke(&mut self);

    fn unchoke(&mut self);
}

impl ChokeTarget for Peer {
    fn key(&self) -> PeerKey {
        Peer::key(self)
    }

    fn is_ready(&self) -> bool {
        self.is_established()
    }

    fn download_rate(&self, now: Instant) -> f64 {
        Peer::download_rate(self, now)
    }

    fn peer_interested(&self) -> bool {
        Peer::peer_interested(self)
    }

    fn is_choked(&self) -> bool {
        self.am_choking()
    }

    fn choke(&mut self) {
        Peer::choke(self);
    }

    fn unchoke(&mut self) {
        Peer::unchoke(self);
    }
}

/// Per-torrent unchoke rounds.
///
/// The regular round unchokes the fastest uploaders to us. The optimistic
/// round unchokes one random peer regardless of rate so newcomers get a
/// chance to prove themselves. Both timers fire on the first tick.
pub struct Choker {
    regular_interval: Duration,
    optimistic_interval: Duration,
    slots: usize,
    next_regular: Option<Instant>,
    next_optimistic: Option<Instant>,
    optimistic: Option<PeerKey>,
}

impl Choker {
    pub fn new(config: &TorrentConfig) -> Self {
        Self {
            regular_interval: config.unchoke_interval,
            optimistic_interval: config.optimistic_unchoke_interval,
            slots: config.unchoke_slots,
            next_regular: None,
            next_optimistic: None,
            optimistic: None,
        }
    }

    /// Peer currently holding the optimistic slot.
    pub fn optimistic(&self) -> Option<PeerKey> {
        self.optimistic
    }

    /// Runs whichever rounds are due.
    pub fn tick<P, R>(&mut self, peers: &mut [P], now: Instant, rng: &mut R)
    where
        P: ChokeTarget,
        R: Rng + ?Sized,
    {
        if self.next_optimistic.is_none_or(|at| now >= at) {
            self.next_optimistic = Some(now + self.optimistic_interval);
            self.optimistic_round(peers, now, rng);
            self.regular_round(peers, now);
        } else if self.next_regular.is_none_or(|at| now >= at) {
            self.regular_round(peers, now);
        }
    }

    fn optimistic_round<P, R>(&mut self, peers: &mut [P], now: Instant, rng: &mut R)
    where
        P: ChokeTarget,
        R: Rng + ?Sized,
    {
        let ready: Vec<usize> = (0..peers.len()).filter(|i| peers[*i].is_ready()).collect();
        let Some(&index) = ready.choose(rng) else {
            self.optimistic = None;
            return;
        };

        let peer = &mut peers[index];
        self.optimistic = Some(peer.key());
        if peer.is_choked() {
            peer.unchoke();
        }
        debug!(
            peer = peer.key(),
            rate = peer.download_rate(now),
            "Optimistic unchoke"
        );
    }

    fn regular_round<P: ChokeTarget>(&mut self, peers: &mut [P], now: Instant) {
        self.next_regular = Some(now + self.regular_interval);

        let optimistic = self
            .optimistic
            .and_then(|key| peers.iter().find(|p| p.key() == key && p.is_ready()));
        let slots = match optimistic {
            Some(peer) if peer.peer_interested() => self.slots.saturating_sub(1),
            _ => self.slots,
        };
        let optimistic_key = optimistic.map(|p| p.key());

        let mut ranked: Vec<(usize, f64)> = peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_ready() && Some(p.key()) != optimistic_key)
            .map(|(i, p)| (i, p.download_rate(now)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut unchoked = 0;
        for (index, _) in ranked {
            let peer = &mut peers[index];
            if unchoked < slots {
                if peer.is_choked() {
                    peer.unchoke();
                }
                if peer.peer_interested() {
                    unchoked += 1;
                }
            } else if !peer.is_choked() {
                peer.choke();
            }
        }
        debug!(slots, unchoked, "Regular unchoke round");
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    struct FakePeer {
        key: PeerKey,
        ready: bool,
        rate: f64,
        interested: bool,
        choked: bool,
    }

    impl FakePeer {
        fn new(key: PeerKey, rate: f64, interested: bool) -> Self {
            Self {
                key,
                ready: true,
                rate,
                interested,
                choked: true,
            }
        }
    }

    impl ChokeTarget for FakePeer {
        fn key(&self) -> PeerKey {
            self.key
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
        fn download_rate(&self, _now: Instant) -> f64 {
            self.rate
        }
        fn peer_interested(&self) -> bool {
            self.interested
        }
        fn is_choked(&self) -> bool {
            self.choked
        }
        fn choke(&mut self) {
            self.choked = true;
        }
        fn unchoke(&mut self) {
            self.choked = false;
        }
    }

    fn unchoked(peers: &[FakePeer]) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = peers.iter().filter(|p| !p.choked).map(|p| p.key).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_fastest_interested_peers_win_slots() {
        let mut choker = Choker::new(&TorrentConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let now = Instant::now();
        let mut peers: Vec<FakePeer> = (0..6)
            .map(|i| FakePeer::new(i, (i * 100) as f64, true))
            .collect();

        // regular round only; the optimistic timer is pushed out
        choker.next_optimistic = Some(now + Duration::from_secs(30));
        choker.tick(&mut peers, now, &mut rng);

        assert_eq!(unchoked(&peers), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_interested_optimistic_peer_takes_a_slot() {
        let mut choker = Choker::new(&TorrentConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let now = Instant::now();
        let mut peers: Vec<FakePeer> = (0..6)
            .map(|i| FakePeer::new(i, (i * 100) as f64, true))
            .collect();

        choker.tick(&mut peers, now, &mut rng);

        let optimistic = choker.optimistic().unwrap();
        let unchoked_keys = unchoked(&peers);
        assert!(unchoked_keys.contains(&optimistic));

        let mut fastest: Vec<PeerKey> = (0..6u64).rev().filter(|k| *k != optimistic).take(3).collect();
        fastest.push(optimistic);
        fastest.sort();
        assert_eq!(unchoked_keys, fastest);
    }

    #[test]
    fn test_uninterested_peers_do_not_use_slots() {
        let mut choker = Choker::new(&TorrentConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let now = Instant::now();
        let mut peers = vec![
            FakePeer::new(0, 900.0, false),
            FakePeer::new(1, 800.0, false),
            FakePeer::new(2, 500.0, true),
            FakePeer::new(3, 400.0, true),
            FakePeer::new(4, 300.0, true),
            FakePeer::new(5, 200.0, true),
            FakePeer::new(6, 100.0, true),
        ];

        choker.next_optimistic = Some(now + Duration::from_secs(30));
        choker.tick(&mut peers, now, &mut rng);

        assert_eq!(unchoked(&peers), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rounds_follow_their_timers() {
        let config = TorrentConfig::default();
        let mut choker = Choker::new(&config);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let start = Instant::now();
        let mut peers: Vec<FakePeer> = (0..6)
            .map(|i| FakePeer::new(i, (i * 100) as f64, true))
            .collect();

        choker.tick(&mut peers, start, &mut rng);
        let first_optimistic = choker.optimistic();

        // a newly fast peer waits for the next regular round
        peers[0].rate = 10_000.0;
        choker.tick(&mut peers, start + Duration::from_secs(1), &mut rng);
        if first_optimistic != Some(0) {
            assert!(peers[0].choked);
        }

        choker.tick(&mut peers, start + config.unchoke_interval, &mut rng);
        assert!(!peers[0].choked);
        assert_eq!(choker.optimistic(), first_optimistic);
    }

    #[test]
    fn test_peers_not_ready_are_left_alone() {
        let mut choker = Choker::new(&TorrentConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut peers = vec![FakePeer::new(0, 100.0, true)];
        peers[0].ready = false;

        choker.tick(&mut peers, Instant::now(), &mut rng);

        assert!(peers[0].choked);
        assert_eq!(choker.optimistic(), None);
    }
}
