//! Peer wire message framing: encode, decode and exact sizes

use bytes::{Buf, BufMut, Bytes};

use super::types::PeerMessage;
use crate::torrent::socket_buffer::SOCKET_BUFFER_CAPACITY;
use crate::torrent::{PieceIndex, TorrentError};

/// Length prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

/// Largest frame body accepted; anything longer could never be buffered whole.
pub const MAX_FRAME_LENGTH: u32 = (SOCKET_BUFFER_CAPACITY - LENGTH_PREFIX) as u32;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

/// Message serialization utilities for the peer wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message with its 4-byte big-endian length prefix.
    pub fn encode(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::size(message));
        buf.put_u32((Self::size(message) - LENGTH_PREFIX) as u32);

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => buf.put_u8(ID_CHOKE),
            PeerMessage::Unchoke => buf.put_u8(ID_UNCHOKE),
            PeerMessage::Interested => buf.put_u8(ID_INTERESTED),
            PeerMessage::NotInterested => buf.put_u8(ID_NOT_INTERESTED),
            PeerMessage::Have { piece_index } => {
                buf.put_u8(ID_HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u8(ID_BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u8(ID_REQUEST);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u8(ID_PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u8(ID_CANCEL);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u8(ID_PORT);
                buf.put_u16(*port);
            }
            PeerMessage::Unknown { id, payload } => {
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Exact number of bytes `encode` produces for `message`.
    pub fn size(message: &PeerMessage) -> usize {
        LENGTH_PREFIX
            + match message {
                PeerMessage::KeepAlive => 0,
                PeerMessage::Choke
                | PeerMessage::Unchoke
                | PeerMessage::Interested
                | PeerMessage::NotInterested => 1,
                PeerMessage::Have { .. } => 5,
                PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
                PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
                PeerMessage::Piece { data, .. } => 9 + data.len(),
                PeerMessage::Port { .. } => 3,
                PeerMessage::Unknown { payload, .. } => 1 + payload.len(),
            }
    }

    /// Decodes the frame at the front of `data` without consuming it.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. The caller
    /// advances its buffer by [`MessageCodec::size`] of the result.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Oversized frame or fixed-size message with wrong length
    pub fn decode(data: &[u8]) -> Result<Option<PeerMessage>, TorrentError> {
        if data.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut buf = data;
        let length = buf.get_u32();
        if length == 0 {
            return Ok(Some(PeerMessage::KeepAlive));
        }
        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::violation(format!(
                "frame of {length} bytes exceeds limit of {MAX_FRAME_LENGTH}"
            )));
        }
        if buf.len() < length as usize {
            return Ok(None);
        }

        let message_id = buf.get_u8();
        let mut payload = &buf[..length as usize - 1];

        let message = match message_id {
            ID_CHOKE => {
                expect_length(message_id, length, 1)?;
                PeerMessage::Choke
            }
            ID_UNCHOKE => {
                expect_length(message_id, length, 1)?;
                PeerMessage::Unchoke
            }
            ID_INTERESTED => {
                expect_length(message_id, length, 1)?;
                PeerMessage::Interested
            }
            ID_NOT_INTERESTED => {
                expect_length(message_id, length, 1)?;
                PeerMessage::NotInterested
            }
            ID_HAVE => {
                expect_length(message_id, length, 5)?;
                PeerMessage::Have {
                    piece_index: PieceIndex::new(payload.get_u32()),
                }
            }
            ID_BITFIELD => PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(payload),
            },
            ID_REQUEST | ID_CANCEL => {
                expect_length(message_id, length, 13)?;
                let piece_index = PieceIndex::new(payload.get_u32());
                let offset = payload.get_u32();
                let length = payload.get_u32();
                if message_id == ID_REQUEST {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                }
            }
            ID_PIECE => {
                if length < 9 {
                    return Err(TorrentError::violation(format!(
                        "piece message of {length} bytes is shorter than its header"
                    )));
                }
                let piece_index = PieceIndex::new(payload.get_u32());
                let offset = payload.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(payload),
                }
            }
            ID_PORT => {
                expect_length(message_id, length, 3)?;
                PeerMessage::Port {
                    port: payload.get_u16(),
                }
            }
            id => PeerMessage::Unknown {
                id,
                payload: Bytes::copy_from_slice(payload),
            },
        };

        Ok(Some(message))
    }
}

fn expect_length(message_id: u8, actual: u32, expected: u32) -> Result<(), TorrentError> {
    if actual != expected {
        return Err(TorrentError::violation(format!(
            "message id {message_id} has length {actual}, expected {expected}"
        )));
    }
    Ok(())
}
