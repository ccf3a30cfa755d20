//! Piece-exchange protocol: wire codec, peer state machine and scheduler.

pub mod bitfield;
pub mod block;
pub mod choke;
pub mod creation;
pub mod parsing;
pub mod peer;
pub mod protocol;
pub mod rate;
pub mod scheduler;
pub mod socket_buffer;
pub mod swarm;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tracker;

use std::fmt;
use std::str::FromStr;

pub use bitfield::Bitfield;
pub use block::Block;
pub use choke::{ChokeTarget, Choker};
pub use creation::TorrentCreator;
pub use parsing::{FileLayout, Metainfo, MetainfoParser, TorrentFile};
pub use peer::{Direction, Peer, PeerKey, PeerState};
pub use protocol::{HandshakeHeader, PeerId, PeerMessage};
pub use rate::Rate;
pub use scheduler::{Announcement, PieceBook, TorrentState};
pub use socket_buffer::{SocketBuffer, Transport};
pub use swarm::{ConnectContext, Torrent, TorrentStatus};
pub use tracker::{PeerPool, PeerSource, Resolution, Resolver, TorrentStats};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to match incoming handshakes to the torrent they ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl serde::Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(s, &mut hash).map_err(|e| TorrentError::InvalidTorrentFile {
            reason: format!("invalid info hash {s:?}: {e}"),
        })?;
        Ok(Self(hash))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Bitfield and protocol errors are peer-local: they close the offending
/// connection and never propagate past the peer that raised them.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Piece index {index} out of range for {size} pieces")]
    PieceIndexOutOfRange { index: u32, size: u32 },

    #[error("Malformed bitfield: {reason}")]
    MalformedBitfield { reason: String },

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Info hash mismatch: expected {expected}, got {actual}")]
    InfoHashMismatch {
        expected: InfoHash,
        actual: InfoHash,
    },

    #[error("Unknown torrent {info_hash}")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("Peer state invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// Shorthand for the most common peer-local failure.
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
        }
    }
}
