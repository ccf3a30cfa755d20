//! Per-connection peer state machine.
//!
//! A [`Peer`] owns its [`SocketBuffer`] and is driven by its torrent once
//! per reactor tick. It never touches other peers; anything that concerns
//! the whole torrent goes through the [`PieceBook`] it is handed.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, info, trace, warn};

use crate::torrent::block::BLOCK_SIZE;
use crate::torrent::protocol::{HEADER_LEN, HandshakeCodec, MessageCodec, PEER_ID_LEN};
use crate::torrent::{
    Bitfield, Block, HandshakeHeader, InfoHash, PeerId, PeerMessage, PieceBook, PieceIndex,
    SocketBuffer, TorrentError, Transport,
};

/// Engine-unique identifier of a connection.
pub type PeerKey = u64;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection phase. `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the 48-byte header carrying the info hash
    WaitHandshakeHeader,
    /// Waiting for the remote's 20-byte peer id
    WaitPeerId,
    /// Handshake complete; framed messages flow
    Established,
    /// Protocol or I/O failure; the socket is closed
    Error,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::WaitHandshakeHeader => "wait-handshake-header",
            PeerState::WaitPeerId => "wait-peer-id",
            PeerState::Established => "established",
            PeerState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One remote peer of one torrent.
///
/// Choke and interest flags follow the wire meaning: `am_choking` means
/// we refuse the remote's requests, `peer_choking` means the remote
/// refuses ours. Both start choked and uninterested.
pub struct Peer {
    key: PeerKey,
    direction: Direction,
    address: SocketAddr,
    state: PeerState,
    info_hash: Option<InfoHash>,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    socket: SocketBuffer,
    remote_bitfield: Option<Bitfield>,
    am_interested: bool,
    peer_interested: bool,
    am_choking: bool,
    peer_choking: bool,
    /// Blocks we asked the remote for
    self_requested: HashSet<Block>,
    /// Blocks the remote asked us for, in arrival order
    peer_requested: VecDeque<Block>,
    messages_received: u64,
    last_keepalive_sent: Instant,
    keepalive_interval: Duration,
}

impl Peer {
    /// Connection we dialed. Our full handshake is queued immediately.
    pub fn outbound(
        key: PeerKey,
        address: SocketAddr,
        transport: Box<dyn Transport>,
        info_hash: InfoHash,
        local_id: PeerId,
        keepalive_interval: Duration,
    ) -> Self {
        let mut peer = Self::new(
            key,
            Direction::Outbound,
            address,
            transport,
            Some(info_hash),
            local_id,
            keepalive_interval,
        );
        peer.write_handshake(info_hash);
        peer
    }

    /// Accepted connection. The torrent is unknown until [`Peer::identify`].
    pub fn inbound(
        key: PeerKey,
        address: SocketAddr,
        transport: Box<dyn Transport>,
        local_id: PeerId,
        keepalive_interval: Duration,
    ) -> Self {
        Self::new(
            key,
            Direction::Inbound,
            address,
            transport,
            None,
            local_id,
            keepalive_interval,
        )
    }

    fn new(
        key: PeerKey,
        direction: Direction,
        address: SocketAddr,
        transport: Box<dyn Transport>,
        info_hash: Option<InfoHash>,
        local_id: PeerId,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            key,
            direction,
            address,
            state: PeerState::WaitHandshakeHeader,
            info_hash,
            local_id,
            remote_id: None,
            socket: SocketBuffer::new(transport),
            remote_bitfield: None,
            am_interested: false,
            peer_interested: false,
            am_choking: true,
            peer_choking: true,
            self_requested: HashSet::new(),
            peer_requested: VecDeque::new(),
            messages_received: 0,
            last_keepalive_sent: Instant::now(),
            keepalive_interval,
        }
    }

    /// Reads the header of an inbound handshake and picks its torrent.
    ///
    /// Returns the info hash once the header has arrived and `is_known`
    /// accepted it; our own handshake is queued in reply. An unknown info
    /// hash or malformed header moves the peer to `Error`.
    pub fn identify(&mut self, is_known: impl Fn(&InfoHash) -> bool) -> Option<InfoHash> {
        if self.direction != Direction::Inbound
            || self.state != PeerState::WaitHandshakeHeader
            || self.info_hash.is_some()
        {
            return None;
        }

        let header = match HandshakeCodec::decode_header(self.socket.inbound()) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(e) => {
                self.fail(e);
                return None;
            }
        };

        if !is_known(&header.info_hash) {
            self.fail(TorrentError::UnknownTorrent {
                info_hash: header.info_hash,
            });
            return None;
        }

        self.socket.advance(HEADER_LEN);
        self.info_hash = Some(header.info_hash);
        self.write_handshake(header.info_hash);
        self.state = PeerState::WaitPeerId;
        debug!(peer = %self.address, info_hash = %header.info_hash, "Inbound peer identified");
        Some(header.info_hash)
    }

    /// Advances the state machine as far as buffered input allows.
    ///
    /// Errors are local to this peer: they are logged, the socket is
    /// closed and the peer ends in `Error`.
    pub fn update(&mut self, book: &mut PieceBook, now: Instant) {
        if self.is_stopped() {
            return;
        }
        loop {
            match self.step(book, now) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
    }

    /// Runs one state. Returns true if the state changed.
    fn step(&mut self, book: &mut PieceBook, now: Instant) -> Result<bool, TorrentError> {
        match self.state {
            PeerState::WaitHandshakeHeader => {
                // inbound peers are advanced by `identify`
                let Some(expected) = self.info_hash else {
                    return Ok(false);
                };
                let Some(header) = HandshakeCodec::decode_header(self.socket.inbound())? else {
                    return Ok(false);
                };
                if header.info_hash != expected {
                    return Err(TorrentError::InfoHashMismatch {
                        expected,
                        actual: header.info_hash,
                    });
                }
                self.socket.advance(HEADER_LEN);
                self.state = PeerState::WaitPeerId;
                Ok(true)
            }
            PeerState::WaitPeerId => {
                let Some(remote_id) = HandshakeCodec::decode_peer_id(self.socket.inbound()) else {
                    return Ok(false);
                };
                self.socket.advance(PEER_ID_LEN);
                self.remote_id = Some(remote_id);
                self.remote_bitfield = Some(Bitfield::new(book.piece_count()));
                if !book.bitfield().no_piece_set() {
                    self.send(&PeerMessage::Bitfield {
                        bitfield: Bytes::from(book.bitfield().to_bytes()),
                    });
                }
                self.state = PeerState::Established;
                self.last_keepalive_sent = now;
                info!(
                    peer = %self.address,
                    remote_id = %remote_id,
                    direction = ?self.direction,
                    "Peer established"
                );
                Ok(true)
            }
            PeerState::Established => {
                self.read_messages(book)?;
                self.request_blocks(book);
                self.write_blocks(book);
                self.write_keepalive(now);
                self.update_interest(book)?;
                Ok(false)
            }
            PeerState::Error => Ok(false),
        }
    }

    fn read_messages(&mut self, book: &mut PieceBook) -> Result<(), TorrentError> {
        while let Some(message) = MessageCodec::decode(self.socket.inbound())? {
            self.socket.advance(MessageCodec::size(&message));
            self.messages_received += 1;
            trace!(peer = %self.address, %message, "Received");
            self.handle_message(message, book)?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        message: PeerMessage,
        book: &mut PieceBook,
    ) -> Result<(), TorrentError> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.peer_choking = true;
                book.return_blocks(self.self_requested.drain());
            }
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => {
                self.peer_interested = false;
                self.peer_requested.clear();
            }
            PeerMessage::Have { piece_index } => {
                self.remote_bitfield_mut()?.set(piece_index.as_u32())?;
            }
            PeerMessage::Bitfield { bitfield } => {
                if self.messages_received != 1 {
                    return Err(TorrentError::violation(
                        "bitfield must be the first message after the handshake",
                    ));
                }
                self.remote_bitfield_mut()?.load_bytes(&bitfield)?;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                let block = Block::new(piece_index.as_u32(), offset, length);
                if !book.has_piece(block.piece) {
                    return Err(TorrentError::violation(format!(
                        "request for piece {} we do not have",
                        block.piece
                    )));
                }
                if !self.peer_interested {
                    return Err(TorrentError::violation("request while not interested"));
                }
                if block.length > BLOCK_SIZE {
                    return Err(TorrentError::violation(format!(
                        "request {block} larger than {BLOCK_SIZE} bytes"
                    )));
                }
                if !book.block_fits(&block) {
                    return Err(TorrentError::violation(format!(
                        "request {block} outside its piece"
                    )));
                }
                // requests that crossed our choke are dropped
                if !self.am_choking && !self.peer_requested.contains(&block) {
                    self.peer_requested.push_back(block);
                }
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = Block::new(piece_index.as_u32(), offset, data.len() as u32);
                self.self_requested.remove(&block);
                book.block_done(block, &data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                let block = Block::new(piece_index.as_u32(), offset, length);
                self.peer_requested.retain(|queued| *queued != block);
            }
            PeerMessage::Port { port } => {
                debug!(peer = %self.address, port, "Ignoring port message");
            }
            PeerMessage::Unknown { id, payload } => {
                debug!(peer = %self.address, id, len = payload.len(), "Skipping unknown message");
            }
        }
        Ok(())
    }

    fn request_blocks(&mut self, book: &mut PieceBook) {
        if !self.am_interested || self.peer_choking {
            return;
        }
        let Some(remote) = self.remote_bitfield.as_ref() else {
            return;
        };
        let blocks = book.request_blocks(self.self_requested.len(), remote);
        for block in blocks {
            if self.self_requested.insert(block) {
                self.send(&PeerMessage::Request {
                    piece_index: PieceIndex::new(block.piece),
                    offset: block.offset,
                    length: block.length,
                });
            }
        }
    }

    fn write_blocks(&mut self, book: &mut PieceBook) {
        // choking or losing interest empties the queue
        debug_assert!(
            self.peer_requested.is_empty() || (!self.am_choking && self.peer_interested)
        );
        while !self.socket.out_full() {
            let Some(block) = self.peer_requested.pop_front() else {
                break;
            };
            match book.read_block(&block) {
                Ok(data) => {
                    book.record_upload(data.len());
                    self.send(&PeerMessage::Piece {
                        piece_index: PieceIndex::new(block.piece),
                        offset: block.offset,
                        data,
                    });
                }
                Err(e) => warn!(peer = %self.address, %block, error = %e, "Dropping request"),
            }
        }
    }

    fn write_keepalive(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_keepalive_sent) >= self.keepalive_interval {
            self.send(&PeerMessage::KeepAlive);
            self.last_keepalive_sent = now;
        }
    }

    fn update_interest(&mut self, book: &PieceBook) -> Result<(), TorrentError> {
        if !self.self_requested.is_empty() {
            if !self.am_interested {
                return Err(TorrentError::InvariantViolation {
                    message: "outstanding requests while not interested".to_string(),
                });
            }
            return Ok(());
        }

        let interesting = self
            .remote_bitfield
            .as_ref()
            .is_some_and(|remote| book.peer_interesting(remote));
        if interesting && !self.am_interested {
            self.am_interested = true;
            self.send(&PeerMessage::Interested);
        } else if !interesting && self.am_interested {
            self.am_interested = false;
            self.send(&PeerMessage::NotInterested);
        }
        Ok(())
    }

    /// Stops serving the remote and drops its queued requests.
    pub fn choke(&mut self) {
        if self.state != PeerState::Established {
            return;
        }
        self.am_choking = true;
        self.peer_requested.clear();
        self.send(&PeerMessage::Choke);
    }

    pub fn unchoke(&mut self) {
        if self.state != PeerState::Established {
            return;
        }
        self.am_choking = false;
        self.send(&PeerMessage::Unchoke);
    }

    /// Announces a newly verified piece.
    pub fn have(&mut self, piece: u32) {
        if self.state != PeerState::Established {
            return;
        }
        self.send(&PeerMessage::Have {
            piece_index: PieceIndex::new(piece),
        });
    }

    /// Withdraws our request for `block` if we still have one out.
    pub fn cancel(&mut self, block: Block) {
        if self.state != PeerState::Established || !self.self_requested.remove(&block) {
            return;
        }
        self.send(&PeerMessage::Cancel {
            piece_index: PieceIndex::new(block.piece),
            offset: block.offset,
            length: block.length,
        });
    }

    /// Takes back every block this peer was asked for.
    pub fn take_requested(&mut self) -> Vec<Block> {
        self.self_requested.drain().collect()
    }

    pub fn try_read(&mut self, now: Instant) {
        self.socket.try_read(now);
    }

    pub fn try_write(&mut self, now: Instant) {
        self.socket.try_write(now);
    }

    /// Readiness future for whatever the socket currently wants.
    pub fn readiness(&self) -> Option<BoxFuture<'_, ()>> {
        self.socket.readiness()
    }

    /// Closes the connection. The peer is stopped afterwards.
    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.socket.is_closed() || self.state == PeerState::Error
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn info_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    pub fn remote_bitfield(&self) -> Option<&Bitfield> {
        self.remote_bitfield.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn requested_count(&self) -> usize {
        self.self_requested.len()
    }

    pub fn queued_uploads(&self) -> usize {
        self.peer_requested.len()
    }

    /// Bytes per second received over the recent window.
    pub fn download_rate(&self, now: Instant) -> f64 {
        self.socket.rate().download(now)
    }

    pub fn upload_rate(&self, now: Instant) -> f64 {
        self.socket.rate().upload(now)
    }

    fn write_handshake(&mut self, info_hash: InfoHash) {
        let header = HandshakeCodec::encode_header(&HandshakeHeader::new(info_hash));
        let peer_id = HandshakeCodec::encode_peer_id(&self.local_id);
        self.socket.concat(&header);
        self.socket.concat(&peer_id);
    }

    fn send(&mut self, message: &PeerMessage) {
        trace!(peer = %self.address, %message, "Queued");
        self.socket.concat(&MessageCodec::encode(message));
    }

    fn remote_bitfield_mut(&mut self) -> Result<&mut Bitfield, TorrentError> {
        self.remote_bitfield
            .as_mut()
            .ok_or_else(|| TorrentError::InvariantViolation {
                message: "established peer without a bitfield".to_string(),
            })
    }

    fn fail(&mut self, error: TorrentError) {
        warn!(peer = %self.address, state = %self.state, error = %error, "Closing peer");
        self.socket.close();
        self.state = PeerState::Error;
    }
}
