//! `.torrent` metainfo parsing.
//!
//! Metadata extraction using bencode-rs, with the info hash taken over the
//! exact encoded bytes of the `info` dictionary.

pub mod bencode;
pub mod types;

use std::path::Path;

pub use bencode::{BencodeParser, BencodeWriter};
pub use types::{FileLayout, Metainfo, TorrentFile};

use crate::torrent::TorrentError;

/// Entry point for loading torrent metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetainfoParser;

impl MetainfoParser {
    /// Parses metainfo from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    pub fn parse_bytes(data: &[u8]) -> Result<Metainfo, TorrentError> {
        BencodeParser::parse_metainfo(data)
    }

    /// Reads and parses a `.torrent` file.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    pub async fn parse_file(path: &Path) -> Result<Metainfo, TorrentError> {
        let contents = tokio::fs::read(path).await?;
        Self::parse_bytes(&contents)
    }
}
