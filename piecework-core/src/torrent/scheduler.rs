//! Piece and block scheduling for one torrent.
//!
//! [`PieceBook`] is the single owner of the local bitfield and of the
//! per-piece `left`/`requested` block sets. Peers borrow it mutably for
//! the length of their update and funnel every change through its methods,
//! so a block is never in both sets of a piece at once.
//!
//! Effects on other peers (endgame cancels, have broadcasts) are queued as
//! [`Announcement`]s and delivered by the owning torrent after each peer
//! update.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::TorrentConfig;
use crate::storage::{StorageError, TorrentIO};
use crate::torrent::{Bitfield, Block, InfoHash, TorrentStats};

/// Torrent-wide download phase. Moves only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum TorrentState {
    Downloading,
    Endgame,
    Done,
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TorrentState::Downloading => "downloading",
            TorrentState::Endgame => "endgame",
            TorrentState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Effect the scheduler needs applied to every established peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// A raced endgame block arrived; withdraw duplicate requests.
    Cancel(Block),
    /// A piece verified; tell everyone we have it.
    Have(u32),
}

/// Outstanding work for one incomplete piece.
#[derive(Debug, Default)]
struct PieceBlocks {
    left: BTreeSet<Block>,
    requested: BTreeSet<Block>,
}

impl PieceBlocks {
    fn is_empty(&self) -> bool {
        self.left.is_empty() && self.requested.is_empty()
    }
}

/// Local piece ownership plus block bookkeeping for one torrent.
pub struct PieceBook {
    info_hash: InfoHash,
    bitfield: Bitfield,
    state: TorrentState,
    pieces: Vec<PieceBlocks>,
    io: TorrentIO,
    stats: Arc<TorrentStats>,
    announcements: Vec<Announcement>,
    downloading_threshold: usize,
    endgame_threshold: usize,
}

impl PieceBook {
    /// Verifies what is already on disk and schedules the rest.
    pub fn new(info_hash: InfoHash, mut io: TorrentIO, config: &TorrentConfig) -> Self {
        let piece_count = io.piece_count();
        let mut bitfield = Bitfield::new(piece_count);
        for piece in io.check_all_pieces() {
            // indices come from the same piece count
            let _ = bitfield.set(piece);
        }

        let left_bytes: u64 = bitfield
            .missing_pieces()
            .iter()
            .map(|piece| u64::from(io.piece_size(*piece)))
            .sum();
        let stats = Arc::new(TorrentStats::new(left_bytes));

        let (state, pieces) = if bitfield.all_pieces_set() {
            info!(%info_hash, "Torrent complete on disk");
            (TorrentState::Done, Vec::new())
        } else {
            let mut pieces: Vec<PieceBlocks> =
                (0..piece_count).map(|_| PieceBlocks::default()).collect();
            for piece in bitfield.missing_pieces() {
                pieces[piece as usize].left.extend(io.blocks(piece));
            }
            info!(
                %info_hash,
                have = bitfield.count_set(),
                total = piece_count,
                "Torrent incomplete"
            );
            (TorrentState::Downloading, pieces)
        };

        Self {
            info_hash,
            bitfield,
            state,
            pieces,
            io,
            stats,
            announcements: Vec::new(),
            downloading_threshold: config.request_threshold_downloading,
            endgame_threshold: config.request_threshold_endgame,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    pub fn piece_count(&self) -> u32 {
        self.bitfield.size()
    }

    /// Pieces we hold and have verified.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.bitfield.is_set(piece).unwrap_or(false)
    }

    pub fn stats(&self) -> &Arc<TorrentStats> {
        &self.stats
    }

    /// Hands out new blocks for a peer with `pending` outstanding requests.
    pub fn request_blocks(&mut self, pending: usize, remote: &Bitfield) -> Vec<Block> {
        if self.state == TorrentState::Downloading
            && self.pieces.iter().all(|p| p.left.is_empty())
        {
            info!(info_hash = %self.info_hash, "Entering endgame");
            self.state = TorrentState::Endgame;
        }

        match self.state {
            TorrentState::Done => Vec::new(),
            TorrentState::Downloading => {
                let mut budget = self.downloading_threshold.saturating_sub(pending);
                let mut blocks = Vec::new();
                for piece in remote.difference(&self.bitfield).existing_pieces() {
                    if budget == 0 {
                        break;
                    }
                    let entry = &mut self.pieces[piece as usize];
                    while budget > 0 {
                        let Some(block) = entry.left.pop_first() else {
                            break;
                        };
                        entry.requested.insert(block);
                        blocks.push(block);
                        budget -= 1;
                    }
                }
                blocks
            }
            TorrentState::Endgame => {
                let mut budget = self.endgame_threshold.saturating_sub(pending);
                let mut candidates = remote.difference(&self.bitfield).existing_pieces();
                candidates.shuffle(&mut rand::rng());

                let mut blocks = Vec::new();
                for piece in candidates {
                    if budget == 0 {
                        break;
                    }
                    let taken: Vec<Block> = self.pieces[piece as usize]
                        .requested
                        .iter()
                        .take(budget)
                        .copied()
                        .collect();
                    budget -= taken.len();
                    blocks.extend(taken);
                }
                blocks
            }
        }
    }

    /// Puts blocks a peer will no longer deliver back into `left`.
    ///
    /// Only meaningful while downloading; endgame keeps racing them.
    pub fn return_blocks(&mut self, blocks: impl IntoIterator<Item = Block>) {
        if self.state != TorrentState::Downloading {
            return;
        }
        for block in blocks {
            let Some(entry) = self.pieces.get_mut(block.piece as usize) else {
                continue;
            };
            if entry.requested.remove(&block) {
                entry.left.insert(block);
            }
        }
    }

    /// Accepts a delivered block, writing it and completing its piece.
    ///
    /// Late duplicates are ignored. A failed write puts the block back in
    /// the set it came from so it is requested again.
    pub fn block_done(&mut self, block: Block, data: &[u8]) {
        if self.state == TorrentState::Done {
            return;
        }
        let state = self.state;
        let Some(entry) = self.pieces.get_mut(block.piece as usize) else {
            return;
        };

        if state == TorrentState::Endgame && entry.requested.contains(&block) {
            self.announcements.push(Announcement::Cancel(block));
        }

        let was_left = entry.left.remove(&block);
        let was_requested = entry.requested.remove(&block);
        if !was_left && !was_requested {
            debug!(%block, "Ignoring late duplicate block");
            return;
        }

        if let Err(e) = self.io.write(&block, data) {
            warn!(info_hash = %self.info_hash, %block, error = %e, "Block write failed");
            let entry = &mut self.pieces[block.piece as usize];
            match state {
                TorrentState::Endgame => entry.requested.insert(block),
                _ => entry.left.insert(block),
            };
            return;
        }
        self.stats.add_downloaded(data.len() as u64);

        if self.pieces[block.piece as usize].is_empty() {
            self.complete_piece(block.piece);
            if self.pieces.iter().all(PieceBlocks::is_empty) {
                self.finish();
            }
        }
    }

    /// True if `remote` holds a piece we lack that still has unserved work.
    pub fn peer_interesting(&self, remote: &Bitfield) -> bool {
        let requestable = remote.difference(&self.bitfield);
        match self.state {
            TorrentState::Done => false,
            TorrentState::Downloading => requestable
                .existing_pieces()
                .iter()
                .any(|piece| !self.pieces[*piece as usize].left.is_empty()),
            TorrentState::Endgame => requestable
                .existing_pieces()
                .iter()
                .any(|piece| !self.pieces[*piece as usize].requested.is_empty()),
        }
    }

    /// Reads a block we hold for upload.
    ///
    /// # Errors
    ///
    /// - `StorageError::ShortRead` - Data not on disk
    /// - `StorageError::OutOfBounds` - Block outside the torrent
    /// - `StorageError::Io` - File system operation failed
    pub fn read_block(&mut self, block: &Block) -> Result<Bytes, StorageError> {
        self.io.read(block)
    }

    /// True if `block` lies inside its piece.
    pub fn block_fits(&self, block: &Block) -> bool {
        self.io.block_fits(block)
    }

    pub fn record_upload(&self, bytes: usize) {
        self.stats.add_uploaded(bytes as u64);
    }

    /// Drains effects queued for delivery to every peer.
    pub fn take_announcements(&mut self) -> Vec<Announcement> {
        std::mem::take(&mut self.announcements)
    }

    /// Blocks not yet handed to any peer.
    pub fn blocks_left(&self) -> usize {
        self.pieces.iter().map(|p| p.left.len()).sum()
    }

    /// Blocks handed out and not yet delivered.
    pub fn blocks_requested(&self) -> usize {
        self.pieces.iter().map(|p| p.requested.len()).sum()
    }

    /// Releases file handles.
    pub fn close(&mut self) {
        self.io.close();
    }

    fn complete_piece(&mut self, piece: u32) {
        if !self.io.check_piece(piece) {
            warn!(info_hash = %self.info_hash, piece, "Piece hash mismatch");
            return;
        }
        debug!(info_hash = %self.info_hash, piece, "Piece verified");
        if self.bitfield.set(piece).is_ok() {
            self.stats.complete(u64::from(self.io.piece_size(piece)));
            self.announcements.push(Announcement::Have(piece));
        }
    }

    fn finish(&mut self) {
        self.state = TorrentState::Done;
        self.pieces = Vec::new();
        if self.bitfield.all_pieces_set() {
            info!(info_hash = %self.info_hash, "Download complete");
        } else {
            warn!(
                info_hash = %self.info_hash,
                missing = self.bitfield.missing_pieces().len(),
                "Download finished with unverified pieces"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_fixtures::single_file_metainfo;
    use crate::torrent::Metainfo;

    fn all_ones(size: u32) -> Bitfield {
        let mut bitfield = Bitfield::new(size);
        for i in 0..size {
            bitfield.set(i).unwrap();
        }
        bitfield
    }

    fn book(dir: &std::path::Path, length: u64, piece_length: u32) -> (PieceBook, Metainfo, Vec<u8>) {
        let (metainfo, content) = single_file_metainfo("data.bin", length, piece_length);
        let io = TorrentIO::new(&metainfo, dir);
        let book = PieceBook::new(metainfo.info_hash, io, &TorrentConfig::default());
        (book, metainfo, content)
    }

    fn data_for<'a>(content: &'a [u8], block: &Block, piece_length: u32) -> &'a [u8] {
        let start = (block.piece * piece_length + block.offset) as usize;
        &content[start..start + block.length as usize]
    }

    #[test]
    fn test_four_single_block_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, _) = book(dir.path(), 4 * 16_384, 16_384);
        assert_eq!(book.state(), TorrentState::Downloading);
        assert_eq!(book.blocks_left(), 4);

        let blocks = book.request_blocks(0, &all_ones(4));
        assert_eq!(blocks.len(), 4);
        assert_eq!(book.blocks_requested(), 4);
        assert_eq!(book.blocks_left(), 0);

        // Every block is requested; the next call enters endgame and may
        // only hand out duplicates within the endgame budget.
        assert!(book.request_blocks(4, &all_ones(4)).is_empty());
        assert_eq!(book.state(), TorrentState::Endgame);
    }

    #[test]
    fn test_downloading_budget_and_order() {
        let dir = tempfile::tempdir().unwrap();
        // 3 pieces of 8 blocks each
        let (mut book, _, _) = book(dir.path(), 3 * 8 * 16_384, 8 * 16_384);

        let blocks = book.request_blocks(5, &all_ones(3));
        assert_eq!(blocks.len(), 15);
        assert!(blocks[..8].iter().all(|b| b.piece == 0));
        assert!(blocks[8..].iter().all(|b| b.piece == 1));
        assert_eq!(blocks[0], Block::new(0, 0, 16_384));

        assert!(book.request_blocks(20, &all_ones(3)).is_empty());
        assert!(book.request_blocks(25, &all_ones(3)).is_empty());
    }

    #[test]
    fn test_only_pieces_the_remote_has() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, _) = book(dir.path(), 4 * 16_384, 16_384);

        let mut remote = Bitfield::new(4);
        remote.set(2).unwrap();
        assert!(book.peer_interesting(&remote));

        let blocks = book.request_blocks(0, &remote);
        assert_eq!(blocks, vec![Block::new(2, 0, 16_384)]);
        assert!(!book.peer_interesting(&remote));
        assert!(book.peer_interesting(&all_ones(4)));
        assert!(!book.peer_interesting(&Bitfield::new(4)));
    }

    #[test]
    fn test_return_blocks_restores_left() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, _) = book(dir.path(), 4 * 16_384, 16_384);

        let blocks = book.request_blocks(0, &all_ones(4));
        book.return_blocks(blocks[..2].iter().copied());
        assert_eq!(book.blocks_left(), 2);
        assert_eq!(book.blocks_requested(), 2);

        // unknown blocks are ignored
        book.return_blocks([Block::new(0, 1, 1), Block::new(99, 0, 1)]);
        assert_eq!(book.blocks_left(), 2);
    }

    #[test]
    fn test_completion_broadcasts_have_once_per_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, content) = book(dir.path(), 4 * 16_384, 16_384);

        let blocks = book.request_blocks(0, &all_ones(4));
        for block in &blocks {
            book.block_done(*block, data_for(&content, block, 16_384));
        }

        assert_eq!(book.state(), TorrentState::Done);
        assert!(book.bitfield().all_pieces_set());
        assert_eq!(
            book.take_announcements(),
            vec![
                Announcement::Have(0),
                Announcement::Have(1),
                Announcement::Have(2),
                Announcement::Have(3)
            ]
        );
        assert_eq!(book.stats().downloaded(), 4 * 16_384);
        assert_eq!(book.stats().left(), 0);
        assert!(!book.peer_interesting(&all_ones(4)));
        assert!(book.request_blocks(0, &all_ones(4)).is_empty());
    }

    #[test]
    fn test_late_duplicate_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, content) = book(dir.path(), 2 * 16_384, 16_384);

        let blocks = book.request_blocks(0, &all_ones(2));
        book.block_done(blocks[0], data_for(&content, &blocks[0], 16_384));
        book.block_done(blocks[0], data_for(&content, &blocks[0], 16_384));

        assert_eq!(book.take_announcements(), vec![Announcement::Have(0)]);
        assert_eq!(book.stats().downloaded(), 16_384);
    }

    #[test]
    fn test_endgame_duplicates_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, content) = book(dir.path(), 2 * 16_384, 16_384);

        let first = book.request_blocks(0, &all_ones(2));
        assert_eq!(first.len(), 2);

        // A second peer gets the same blocks again in endgame.
        let mut duplicates = book.request_blocks(0, &all_ones(2));
        duplicates.sort();
        assert_eq!(duplicates, first);
        assert_eq!(book.state(), TorrentState::Endgame);
        assert_eq!(book.blocks_requested(), 2);

        // returning is a no-op during endgame
        book.return_blocks(first.clone());
        assert_eq!(book.blocks_requested(), 2);

        book.block_done(first[0], data_for(&content, &first[0], 16_384));
        assert_eq!(
            book.take_announcements(),
            vec![Announcement::Cancel(first[0]), Announcement::Have(0)]
        );
    }

    #[test]
    fn test_hash_mismatch_does_not_set_bit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, _) = book(dir.path(), 2 * 16_384, 16_384);

        let blocks = book.request_blocks(0, &all_ones(2));
        book.block_done(blocks[0], &[0u8; 16_384]);

        assert!(!book.has_piece(0));
        assert!(book.take_announcements().is_empty());
        assert_eq!(book.stats().left(), 2 * 16_384);
    }

    #[test]
    fn test_write_failure_requeues_block() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, _) = book(dir.path(), 2 * 16_384, 16_384);

        let blocks = book.request_blocks(0, &all_ones(2));
        // wrong payload length is rejected by storage
        book.block_done(blocks[0], &[0u8; 10]);

        assert_eq!(book.blocks_left(), 1);
        assert_eq!(book.blocks_requested(), 1);
        assert_eq!(book.stats().downloaded(), 0);
    }

    #[test]
    fn test_endgame_write_failure_keeps_block_requested() {
        let dir = tempfile::tempdir().unwrap();
        let (mut book, _, content) = book(dir.path(), 2 * 16_384, 16_384);

        let mut first = book.request_blocks(0, &all_ones(2));
        first.sort();
        book.request_blocks(0, &all_ones(2));
        assert_eq!(book.state(), TorrentState::Endgame);

        book.block_done(first[0], &[0u8; 10]);

        // the cancel goes out before the write is attempted
        assert_eq!(
            book.take_announcements(),
            vec![Announcement::Cancel(first[0])]
        );
        assert_eq!(book.state(), TorrentState::Endgame);
        assert_eq!(book.blocks_left(), 0);
        assert_eq!(book.blocks_requested(), 2);
        assert_eq!(book.stats().downloaded(), 0);

        let mut again = book.request_blocks(0, &all_ones(2));
        again.sort();
        assert_eq!(again, first);

        book.block_done(first[0], data_for(&content, &first[0], 16_384));
        assert_eq!(
            book.take_announcements(),
            vec![Announcement::Cancel(first[0]), Announcement::Have(0)]
        );
        assert_eq!(book.blocks_requested(), 1);
    }

    #[test]
    fn test_existing_pieces_are_premarked() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, content) = single_file_metainfo("data.bin", 3 * 16_384, 16_384);
        std::fs::write(dir.path().join("data.bin"), &content).unwrap();

        let io = TorrentIO::new(&metainfo, dir.path());
        let book = PieceBook::new(metainfo.info_hash, io, &TorrentConfig::default());

        assert_eq!(book.state(), TorrentState::Done);
        assert!(book.bitfield().all_pieces_set());
        assert_eq!(book.blocks_left(), 0);
        assert_eq!(book.stats().left(), 0);
    }
}
