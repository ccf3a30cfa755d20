//! Torrent creation from local content with piece splitting and hashing
//!
//! Produces [`Metainfo`] for files or directories already on disk, and
//! encodes it back into `.torrent` bytes so it can be handed to other
//! clients.

use std::path::Path;

use sha1::{Digest, Sha1};

use super::parsing::{BencodeWriter, FileLayout, Metainfo, TorrentFile};
use super::{InfoHash, TorrentError};

/// Default piece length (256 KiB).
pub const DEFAULT_PIECE_LENGTH: u32 = 262_144;

/// Builds metainfo for local content.
#[derive(Debug, Clone)]
pub struct TorrentCreator {
    piece_length: u32,
    announce_urls: Vec<String>,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    pub fn new() -> Self {
        Self {
            piece_length: DEFAULT_PIECE_LENGTH,
            announce_urls: Vec::new(),
        }
    }

    pub fn with_piece_length(mut self, piece_length: u32) -> Self {
        self.piece_length = piece_length;
        self
    }

    pub fn with_announce_urls(mut self, announce_urls: Vec<String>) -> Self {
        self.announce_urls = announce_urls;
        self
    }

    /// Creates single-file metainfo for in-memory content.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Empty content or zero piece length
    pub fn create_from_bytes(&self, name: &str, data: &[u8]) -> Result<Metainfo, TorrentError> {
        self.validate(data.len() as u64)?;
        let mut hasher = PieceHasher::new(self.piece_length);
        hasher.update(data);
        Ok(self.finish(
            name.to_string(),
            FileLayout::Single {
                length: data.len() as u64,
            },
            hasher.finish(),
        ))
    }

    /// Creates metainfo for a file or a directory tree.
    ///
    /// Directory entries are sorted by path; hidden files are skipped.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Content could not be read
    /// - `TorrentError::InvalidTorrentFile` - Empty content or unusable name
    pub async fn create_from_path(&self, path: &Path) -> Result<Metainfo, TorrentError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: format!("no usable name for {}", path.display()),
            })?
            .to_string();

        if !tokio::fs::metadata(path).await?.is_dir() {
            let data = tokio::fs::read(path).await?;
            return self.create_from_bytes(&name, &data);
        }

        let files = collect_files(path).await?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        self.validate(total_length)?;

        let mut hasher = PieceHasher::new(self.piece_length);
        for file in &files {
            let file_path = file
                .path
                .iter()
                .fold(path.to_path_buf(), |acc, component| acc.join(component));
            let data = tokio::fs::read(&file_path).await?;
            if data.len() as u64 != file.length {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: format!("{} changed while hashing", file_path.display()),
                });
            }
            hasher.update(&data);
        }

        Ok(self.finish(name, FileLayout::Multi { files }, hasher.finish()))
    }

    /// Encodes metainfo as `.torrent` bytes.
    pub fn encode(metainfo: &Metainfo) -> Vec<u8> {
        let mut writer = BencodeWriter::new();
        writer.begin_dict();
        if let Some((first, rest)) = metainfo.announce_urls.split_first() {
            writer.bytes(b"announce").bytes(first.as_bytes());
            if !rest.is_empty() {
                writer.bytes(b"announce-list").begin_list();
                for url in &metainfo.announce_urls {
                    writer.begin_list().bytes(url.as_bytes()).end();
                }
                writer.end();
            }
        }
        writer.bytes(b"info").raw(&encode_info(metainfo)).end();
        writer.finish()
    }

    fn validate(&self, total_length: u64) -> Result<(), TorrentError> {
        if self.piece_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "piece length must be positive".to_string(),
            });
        }
        if total_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "cannot create torrent from empty content".to_string(),
            });
        }
        Ok(())
    }

    fn finish(&self, name: String, layout: FileLayout, piece_hashes: Vec<[u8; 20]>) -> Metainfo {
        let total_length = match &layout {
            FileLayout::Single { length } => *length,
            FileLayout::Multi { files } => files.iter().map(|f| f.length).sum(),
        };
        let mut metainfo = Metainfo {
            info_hash: InfoHash::new([0u8; 20]),
            name,
            piece_length: self.piece_length,
            piece_hashes,
            total_length,
            layout,
            announce_urls: self.announce_urls.clone(),
        };
        metainfo.info_hash = InfoHash::new(sha1_of(&encode_info(&metainfo)));
        metainfo
    }
}

/// Canonical bencode of the info dictionary, keys in sorted order.
fn encode_info(metainfo: &Metainfo) -> Vec<u8> {
    let mut writer = BencodeWriter::new();
    writer.begin_dict();
    match &metainfo.layout {
        FileLayout::Single { length } => {
            writer.bytes(b"length").integer(*length as i64);
        }
        FileLayout::Multi { files } => {
            writer.bytes(b"files").begin_list();
            for file in files {
                writer
                    .begin_dict()
                    .bytes(b"length")
                    .integer(file.length as i64)
                    .bytes(b"path")
                    .begin_list();
                for component in &file.path {
                    writer.bytes(component.as_bytes());
                }
                writer.end().end();
            }
            writer.end();
        }
    }
    writer
        .bytes(b"name")
        .bytes(metainfo.name.as_bytes())
        .bytes(b"piece length")
        .integer(i64::from(metainfo.piece_length))
        .bytes(b"pieces")
        .bytes(&metainfo.piece_hashes.concat())
        .end();
    writer.finish()
}

/// Collects regular files below `root` using iterative depth-first traversal.
async fn collect_files(root: &Path) -> Result<Vec<TorrentFile>, TorrentError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;

            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n.starts_with('.'));
            if !metadata.is_file() || hidden {
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .map_err(|_| TorrentError::InvalidTorrentFile {
                    reason: format!("{} escapes {}", path.display(), root.display()),
                })?;
            files.push(TorrentFile {
                path: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect(),
                length: metadata.len(),
            });
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Hashes a byte stream in piece-sized chunks across file boundaries.
struct PieceHasher {
    piece_length: usize,
    current: Sha1,
    filled: usize,
    hashes: Vec<[u8; 20]>,
}

impl PieceHasher {
    fn new(piece_length: u32) -> Self {
        Self {
            piece_length: piece_length as usize,
            current: Sha1::new(),
            filled: 0,
            hashes: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_length - self.filled).min(data.len());
            self.current.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == self.piece_length {
                self.flush();
            }
        }
    }

    fn finish(mut self) -> Vec<[u8; 20]> {
        if self.filled > 0 {
            self.flush();
        }
        self.hashes
    }

    fn flush(&mut self) {
        let digest = std::mem::replace(&mut self.current, Sha1::new()).finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        self.hashes.push(hash);
        self.filled = 0;
    }
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}
