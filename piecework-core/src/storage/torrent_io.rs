//! Block-addressed file I/O across a torrent's file layout

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use super::StorageError;
use crate::torrent::parsing::{FileLayout, Metainfo};
use crate::torrent::Block;

/// One on-disk file and the absolute byte range it holds.
#[derive(Debug)]
struct StorageFile {
    path: PathBuf,
    start: u64,
    length: u64,
    handle: Option<File>,
}

/// A contiguous piece of one file touched by a block.
#[derive(Debug, Clone, Copy)]
struct Segment {
    file: usize,
    file_offset: u64,
    length: usize,
}

/// Reads, writes and verifies blocks of one torrent.
///
/// Files are concatenated in declared order; a block may straddle several.
/// Handles are opened lazily and directories created on first write.
#[derive(Debug)]
pub struct TorrentIO {
    files: Vec<StorageFile>,
    piece_length: u32,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
}

impl TorrentIO {
    /// Lays out the torrent's files below `root`.
    pub fn new(metainfo: &Metainfo, root: &Path) -> Self {
        let base = root.join(sanitize_component(&metainfo.name));
        let files = match &metainfo.layout {
            FileLayout::Single { length } => vec![StorageFile {
                path: base,
                start: 0,
                length: *length,
                handle: None,
            }],
            FileLayout::Multi { files } => {
                let mut start = 0;
                files
                    .iter()
                    .map(|file| {
                        let path = file
                            .path
                            .iter()
                            .fold(base.clone(), |acc, c| acc.join(sanitize_component(c)));
                        let entry = StorageFile {
                            path,
                            start,
                            length: file.length,
                            handle: None,
                        };
                        start += file.length;
                        entry
                    })
                    .collect()
            }
        };

        Self {
            files,
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
            piece_hashes: metainfo.piece_hashes.clone(),
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of `piece`; the final piece may be short.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = u64::from(piece) * u64::from(self.piece_length);
        self.total_length
            .saturating_sub(start)
            .min(u64::from(self.piece_length)) as u32
    }

    /// Splits `piece` into standard-size blocks.
    pub fn blocks(&self, piece: u32) -> Vec<Block> {
        Block::split_piece(piece, self.piece_size(piece))
    }

    /// True if `block` lies entirely inside its piece.
    pub fn block_fits(&self, block: &Block) -> bool {
        block.piece < self.piece_count()
            && block.length > 0
            && block.end() <= u64::from(self.piece_size(block.piece))
    }

    /// Paths of every file, in layout order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    /// Reads the bytes of `block`.
    ///
    /// # Errors
    ///
    /// - `StorageError::ShortRead` - Some covered bytes are not on disk yet
    /// - `StorageError::OutOfBounds` - Block outside the torrent
    /// - `StorageError::Io` - File system operation failed
    pub fn read(&mut self, block: &Block) -> Result<Bytes, StorageError> {
        let segments = self.segments(block)?;
        let mut data = vec![0u8; block.length as usize];
        let mut filled = 0;

        for segment in segments {
            let short_read = StorageError::ShortRead {
                piece: block.piece,
                offset: block.offset,
                length: block.length,
            };
            let Some(file) = self.open(segment.file, false)? else {
                return Err(short_read);
            };
            file.seek(SeekFrom::Start(segment.file_offset))?;
            match file.read_exact(&mut data[filled..filled + segment.length]) {
                Ok(()) => filled += segment.length,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(short_read),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Bytes::from(data))
    }

    /// Writes `data` at the position of `block`.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfBounds` - Block outside the torrent or data length mismatch
    /// - `StorageError::Io` - File system operation failed
    pub fn write(&mut self, block: &Block, data: &[u8]) -> Result<(), StorageError> {
        if data.len() != block.length as usize {
            return Err(out_of_bounds(block));
        }
        let segments = self.segments(block)?;
        let mut written = 0;

        for segment in segments {
            let Some(file) = self.open(segment.file, true)? else {
                return Err(out_of_bounds(block));
            };
            file.seek(SeekFrom::Start(segment.file_offset))?;
            file.write_all(&data[written..written + segment.length])?;
            written += segment.length;
        }

        Ok(())
    }

    /// Recomputes the hash of `piece` from disk and compares it.
    ///
    /// Any read failure counts as a mismatch.
    pub fn check_piece(&mut self, piece: u32) -> bool {
        let Some(expected) = self.piece_hashes.get(piece as usize).copied() else {
            return false;
        };
        let size = self.piece_size(piece);
        match self.read(&Block::new(piece, 0, size)) {
            Ok(data) => Sha1::digest(&data).as_slice() == expected,
            Err(e) => {
                debug!(piece, error = %e, "Piece not verifiable");
                false
            }
        }
    }

    /// Indices of every piece whose on-disk bytes verify.
    pub fn check_all_pieces(&mut self) -> Vec<u32> {
        let verified: Vec<u32> = (0..self.piece_count())
            .filter(|piece| self.check_piece(*piece))
            .collect();
        if !verified.is_empty() {
            info!(
                verified = verified.len(),
                total = self.piece_count(),
                "Found existing pieces on disk"
            );
        }
        verified
    }

    /// Drops every open handle. Files reopen on next access.
    pub fn close(&mut self) {
        for file in &mut self.files {
            if let Some(handle) = file.handle.take()
                && let Err(e) = handle.sync_all()
            {
                debug!(path = %file.path.display(), error = %e, "Sync on close failed");
            }
        }
    }

    fn segments(&self, block: &Block) -> Result<Vec<Segment>, StorageError> {
        if !self.block_fits(block) {
            return Err(out_of_bounds(block));
        }
        let start = u64::from(block.piece) * u64::from(self.piece_length) + u64::from(block.offset);
        let end = start + u64::from(block.length);

        Ok(self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.start < end && f.start + f.length > start)
            .map(|(index, f)| {
                let seg_start = start.max(f.start);
                let seg_end = end.min(f.start + f.length);
                Segment {
                    file: index,
                    file_offset: seg_start - f.start,
                    length: (seg_end - seg_start) as usize,
                }
            })
            .collect())
    }

    /// Opens file `index`, creating it when `create` is set.
    ///
    /// Returns `None` for a missing file when not creating.
    fn open(&mut self, index: usize, create: bool) -> Result<Option<&mut File>, StorageError> {
        let file = &mut self.files[index];
        if file.handle.is_none() {
            if create && let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(&file.path);
            match opened {
                Ok(handle) => file.handle = Some(handle),
                Err(e) if !create && e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(file.handle.as_mut())
    }
}

/// Makes a metainfo path component safe to join onto a local path.
///
/// Collapses dot runs and drops characters outside a conservative set, so
/// `..` and separators can never escape the download directory.
pub fn sanitize_component(component: &str) -> String {
    let mut cleaned = String::with_capacity(component.len());
    for c in component.chars() {
        if c == '.' && cleaned.ends_with('.') {
            continue;
        }
        if c.is_ascii_alphanumeric() || "-_ []()&.,".contains(c) {
            cleaned.push(c);
        }
    }
    if cleaned.is_empty() || cleaned == "." {
        "_".to_string()
    } else {
        cleaned
    }
}

fn out_of_bounds(block: &Block) -> StorageError {
    StorageError::OutOfBounds {
        piece: block.piece,
        offset: block.offset,
        length: block.length,
    }
}
