//! Engine reactor and its handle
//!
//! A single tokio task owns every torrent and peer. Handles talk to it
//! through commands; sockets, dialers and the listener wake it up.

pub mod actor;
pub mod commands;
pub mod core;
pub mod handle;

pub use actor::spawn_engine;
pub use commands::EngineCommand;
pub use core::Engine;
pub use handle::EngineHandle;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::config::PieceworkConfig;
    use crate::storage::test_fixtures::single_file_metainfo;
    use crate::torrent::test_support::ListSource;
    use crate::torrent::{InfoHash, TorrentError, TorrentState};

    #[tokio::test]
    async fn test_handle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, content) = single_file_metainfo("a.bin", 3 * 16_384, 16_384);
        std::fs::write(dir.path().join("a.bin"), &content).unwrap();

        let handle = spawn_engine(PieceworkConfig::for_testing(), Box::new(ListSource::default()))
            .await
            .unwrap();
        assert!(handle.local_addr().ip().is_loopback());
        assert_ne!(handle.local_addr().port(), 0);

        let info_hash = assert_ok!(handle.add_torrent(metainfo.clone(), dir.path()).await);
        assert!(matches!(
            handle.add_torrent(metainfo, dir.path()).await,
            Err(TorrentError::DuplicateTorrent { .. })
        ));

        let status = handle.status(info_hash).await.unwrap();
        assert_eq!(status.state, TorrentState::Done);
        assert_eq!(handle.statuses().await.unwrap().len(), 1);
        assert!(matches!(
            handle.status(InfoHash::new([1u8; 20])).await,
            Err(TorrentError::TorrentNotFound { .. })
        ));

        assert_ok!(handle.remove_torrent(info_hash).await);
        assert!(handle.statuses().await.unwrap().is_empty());

        assert_ok!(handle.shutdown().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_running());
        assert!(matches!(
            handle.statuses().await,
            Err(TorrentError::EngineShutdown)
        ));
    }
}
