//! Test fixtures for storage testing.
//!
//! Builds metainfo with real piece hashes over deterministic content so
//! storage, scheduler and engine tests can verify what lands on disk.

use sha1::{Digest, Sha1};

use crate::torrent::parsing::{FileLayout, Metainfo, TorrentFile};
use crate::torrent::InfoHash;

/// Deterministic non-repeating-per-piece content of `length` bytes.
pub fn content(length: usize) -> Vec<u8> {
    (0..length).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

/// Single-file metainfo plus the content it describes.
pub fn single_file_metainfo(name: &str, length: u64, piece_length: u32) -> (Metainfo, Vec<u8>) {
    let data = content(length as usize);
    let metainfo = build(name, FileLayout::Single { length }, &data, piece_length);
    (metainfo, data)
}

/// Multi-file metainfo plus the concatenated content it describes.
pub fn multi_file_metainfo(
    name: &str,
    files: &[(&str, u64)],
    piece_length: u32,
) -> (Metainfo, Vec<u8>) {
    let total: u64 = files.iter().map(|(_, length)| length).sum();
    let data = content(total as usize);
    let layout = FileLayout::Multi {
        files: files
            .iter()
            .map(|(path, length)| TorrentFile {
                path: path.split('/').map(str::to_string).collect(),
                length: *length,
            })
            .collect(),
    };
    let metainfo = build(name, layout, &data, piece_length);
    (metainfo, data)
}

fn build(name: &str, layout: FileLayout, data: &[u8], piece_length: u32) -> Metainfo {
    let piece_hashes: Vec<[u8; 20]> = data
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect();

    let mut id = Sha1::new();
    id.update(name.as_bytes());
    id.update(data.len().to_be_bytes());
    id.update(piece_hashes.concat());
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&id.finalize());

    Metainfo {
        info_hash: InfoHash::new(info_hash),
        name: name.to_string(),
        piece_length,
        piece_hashes,
        total_length: data.len() as u64,
        layout,
        announce_urls: Vec::new(),
    }
}
