//! Command definitions for the engine reactor.

use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::torrent::{InfoHash, Metainfo, TorrentError, TorrentStatus};

/// Requests sent from an [`EngineHandle`](super::EngineHandle) to the reactor.
///
/// Each command carries the channel its answer goes back on. The reactor
/// owns every torrent and peer, so nothing here is shared or locked.
pub enum EngineCommand {
    /// Start downloading or seeding a torrent below `download_dir`.
    AddTorrent {
        metainfo: Box<Metainfo>,
        download_dir: PathBuf,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Close every connection of a torrent and forget it.
    RemoveTorrent {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Snapshot of one torrent.
    GetStatus {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<TorrentStatus, TorrentError>>,
    },
    /// Snapshots of every torrent.
    GetAllStatus {
        responder: oneshot::Sender<Vec<TorrentStatus>>,
    },
    /// Stop every torrent and end the reactor.
    Shutdown { responder: oneshot::Sender<()> },
}
