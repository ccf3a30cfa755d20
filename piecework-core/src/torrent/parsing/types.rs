//! Torrent metadata types

use crate::torrent::InfoHash;

/// Immutable description of a torrent's content.
///
/// Produced by [`super::MetainfoParser`] from a `.torrent` file or by
/// [`crate::torrent::creation::TorrentCreator`] from local content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub layout: FileLayout,
    pub announce_urls: Vec<String>,
}

/// How content bytes map onto files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLayout {
    /// One file named after the torrent.
    Single { length: u64 },
    /// Files under a directory named after the torrent, concatenated in order.
    Multi { files: Vec<TorrentFile> },
}

/// Individual file within a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

impl Metainfo {
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of `piece` in bytes; the last piece may be short.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = u64::from(piece) * u64::from(self.piece_length);
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Expected SHA-1 of `piece`, if the index exists.
    pub fn piece_hash(&self, piece: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(piece as usize)
    }
}
