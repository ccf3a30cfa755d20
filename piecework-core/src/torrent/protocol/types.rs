//! Core types and enumerations for the peer wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Client identifier prefix placed at the start of generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-PW0001-";

/// Peer identifier.
///
/// 20-byte identifier exchanged as the second part of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// First part of the handshake: everything up to and including the info hash.
///
/// Split from the peer id so a listening side can pick the torrent before
/// it has to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
}

impl HandshakeHeader {
    /// Header with no extension bits set.
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
        }
    }
}

/// Framed peer wire messages.
///
/// Every message after the handshake is one of these. Unknown message ids
/// are kept as `Unknown` so the stream can skip them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame
    KeepAlive,
    /// Sender will not serve requests
    Choke,
    /// Sender will serve requests again
    Unchoke,
    /// Sender wants pieces the receiver has
    Interested,
    /// Sender wants nothing from the receiver
    NotInterested,
    /// Sender completed a piece
    Have {
        /// Index of the piece the sender now has
        piece_index: PieceIndex,
    },
    /// Complete piece availability bitmap, raw wire bytes
    Bitfield {
        /// MSB-first bitmap
        bitfield: Bytes,
    },
    /// Request for a block
    Request {
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        length: u32,
    },
    /// Block payload
    Piece {
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        data: Bytes,
    },
    /// Withdraw an earlier request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT listening port of the sender
    Port { port: u16 },
    /// Message id this client does not implement
    Unknown { id: u8, payload: Bytes },
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { piece_index } => write!(f, "Have({piece_index})"),
            PeerMessage::Bitfield { bitfield } => write!(f, "Bitfield({} bytes)", bitfield.len()),
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => write!(f, "Request({piece_index}, {offset}, {length})"),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => write!(f, "Piece({piece_index}, {offset}, {} bytes)", data.len()),
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => write!(f, "Cancel({piece_index}, {offset}, {length})"),
            PeerMessage::Port { port } => write!(f, "Port({port})"),
            PeerMessage::Unknown { id, payload } => {
                write!(f, "Unknown(id={id}, {} bytes)", payload.len())
            }
        }
    }
}
