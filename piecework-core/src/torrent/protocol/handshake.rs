//! Two-phase handshake serialization

use super::types::{HandshakeHeader, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Protocol identifier string sent after its length byte.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Length byte + protocol string + reserved + info hash.
pub const HEADER_LEN: usize = 1 + 19 + 8 + 20;

/// Length of the trailing peer id.
pub const PEER_ID_LEN: usize = 20;

/// Handshake serialization utilities.
pub struct HandshakeCodec;

impl HandshakeCodec {
    pub fn encode_header(header: &HandshakeHeader) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.push(PROTOCOL.len() as u8);
        buf.extend_from_slice(PROTOCOL);
        buf.extend_from_slice(&header.reserved);
        buf.extend_from_slice(header.info_hash.as_bytes());
        buf
    }

    pub fn encode_peer_id(peer_id: &PeerId) -> Vec<u8> {
        peer_id.as_bytes().to_vec()
    }

    /// Decodes the handshake header at the front of `data`.
    ///
    /// Returns `Ok(None)` until [`HEADER_LEN`] bytes are available. The
    /// protocol prefix is checked as soon as its bytes arrive.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Not a BitTorrent protocol header
    pub fn decode_header(data: &[u8]) -> Result<Option<HandshakeHeader>, TorrentError> {
        let mut expected = Vec::with_capacity(1 + PROTOCOL.len());
        expected.push(PROTOCOL.len() as u8);
        expected.extend_from_slice(PROTOCOL);

        let available = data.len().min(expected.len());
        if data[..available] != expected[..available] {
            return Err(TorrentError::violation("not a bittorrent handshake header"));
        }
        if data.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..HEADER_LEN]);

        Ok(Some(HandshakeHeader {
            reserved,
            info_hash: InfoHash::new(info_hash),
        }))
    }

    /// Decodes the peer id at the front of `data`, if fully buffered.
    pub fn decode_peer_id(data: &[u8]) -> Option<PeerId> {
        let bytes: [u8; PEER_ID_LEN] = data.get(..PEER_ID_LEN)?.try_into().ok()?;
        Some(PeerId::new(bytes))
    }
}
