//! Peer discovery collaborator.
//!
//! The engine asks a [`PeerSource`] for candidate addresses and reports
//! transfer counters through [`TorrentStats`]. Tracker protocols are not
//! spoken here; [`PeerPool`] serves configured and explicitly added peers,
//! resolving host names on a background [`Resolver`].

pub mod pool;
pub mod resolver;
pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

pub use pool::PeerPool;
pub use resolver::{Resolution, Resolver};
pub use stats::TorrentStats;

use crate::torrent::InfoHash;

/// Source of candidate peers for the torrents the engine runs.
///
/// Every method is called from the reactor task and must not block.
pub trait PeerSource: Send {
    /// Hands out one candidate address for `info_hash`, removing it from the source.
    fn get_peer(&mut self, info_hash: &InfoHash) -> Option<SocketAddr>;

    /// Starts discovering peers for a torrent.
    fn start_announce(
        &mut self,
        info_hash: InfoHash,
        stats: Arc<TorrentStats>,
        announce_urls: &[String],
    );

    /// Stops discovering peers for a torrent.
    fn stop_announce(&mut self, info_hash: &InfoHash);

    /// Polled once per reactor tick for background progress.
    fn update(&mut self);
}
