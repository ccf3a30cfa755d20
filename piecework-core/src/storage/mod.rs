//! Storage layer for torrent data.
//!
//! Maps block addresses onto the files of a torrent's layout and verifies
//! piece hashes against the metainfo.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
pub mod torrent_io;

pub use torrent_io::{TorrentIO, sanitize_component};

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Fewer bytes on disk than the block covers
    #[error("Short read for piece {piece} at offset {offset}, length {length}")]
    ShortRead {
        /// Piece the read started in
        piece: u32,
        /// Offset within the piece
        offset: u32,
        /// Bytes requested
        length: u32,
    },

    /// Block addresses bytes outside the torrent
    #[error("Block {piece}:{offset}+{length} lies outside the torrent")]
    OutOfBounds {
        /// Piece the block claims to belong to
        piece: u32,
        /// Offset within the piece
        offset: u32,
        /// Length of the block
        length: u32,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
