//! Piecework Core - BitTorrent piece exchange
//!
//! This crate provides the building blocks of a BitTorrent peer: metainfo
//! parsing and creation, the peer wire protocol as synchronous state
//! machines, piece scheduling with endgame, tit-for-tat choking, on-disk
//! storage and the tokio reactor that drives them.

pub mod config;
pub mod engine;
pub mod network;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

pub use config::PieceworkConfig;
pub use engine::{EngineHandle, spawn_engine};
pub use storage::StorageError;
pub use torrent::{InfoHash, Metainfo, MetainfoParser, TorrentCreator, TorrentError};

/// Errors surfaced to applications embedding the engine.
#[derive(Debug, thiserror::Error)]
pub enum PieceworkError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PieceworkError {
    /// Short message suitable for a terminal.
    pub fn user_message(&self) -> String {
        match self {
            PieceworkError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::DuplicateTorrent { info_hash } => {
                    format!("Torrent {info_hash} is already running")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::EngineShutdown => "Engine is not running".to_string(),
                _ => "Download error occurred".to_string(),
            },
            PieceworkError::Storage(_) => "Storage error occurred".to_string(),
            PieceworkError::Configuration { reason } => format!("Configuration error: {reason}"),
            PieceworkError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// True if the failure was caused by user input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PieceworkError::Configuration { .. }
                | PieceworkError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PieceworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let invalid = PieceworkError::from(TorrentError::InvalidTorrentFile {
            reason: "missing info".to_string(),
        });
        assert!(invalid.is_user_error());
        assert_eq!(invalid.user_message(), "Invalid torrent file: missing info");

        let shutdown = PieceworkError::from(TorrentError::EngineShutdown);
        assert!(!shutdown.is_user_error());
        assert_eq!(shutdown.user_message(), "Engine is not running");
    }
}
