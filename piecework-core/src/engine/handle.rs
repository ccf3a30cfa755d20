//! Handle for communicating with the engine reactor.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use super::commands::EngineCommand;
use crate::torrent::{InfoHash, Metainfo, TorrentError, TorrentStatus};

/// Cloneable async front end of a running engine.
///
/// Every call is a message to the reactor task. Once the reactor has
/// stopped, calls fail with `TorrentError::EngineShutdown`.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    local_addr: SocketAddr,
}

impl EngineHandle {
    pub fn new(sender: mpsc::Sender<EngineCommand>, local_addr: SocketAddr) -> Self {
        Self { sender, local_addr }
    }

    /// Address the peer listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Adds a torrent; data lives below `download_dir`.
    ///
    /// Existing data is verified before the call returns, so a complete
    /// torrent starts out seeding.
    ///
    /// # Errors
    /// - `TorrentError::DuplicateTorrent` - Info hash already running
    /// - `TorrentError::EngineShutdown` - Reactor has stopped
    pub async fn add_torrent(
        &self,
        metainfo: Metainfo,
        download_dir: impl Into<PathBuf>,
    ) -> Result<InfoHash, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::AddTorrent {
            metainfo: Box::new(metainfo),
            download_dir: download_dir.into(),
            responder,
        })
        .await?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)?
    }

    /// Stops a torrent and closes its connections.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not running
    /// - `TorrentError::EngineShutdown` - Reactor has stopped
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::RemoveTorrent {
            info_hash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)?
    }

    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not running
    /// - `TorrentError::EngineShutdown` - Reactor has stopped
    pub async fn status(&self, info_hash: InfoHash) -> Result<TorrentStatus, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::GetStatus {
            info_hash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)?
    }

    /// Status of every torrent, ordered by name.
    pub async fn statuses(&self) -> Result<Vec<TorrentStatus>, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::GetAllStatus { responder }).await?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }

    /// Stops every torrent and waits for the reactor to acknowledge.
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, command: EngineCommand) -> Result<(), TorrentError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| TorrentError::EngineShutdown)
    }
}
