//! Piece ownership bitmap with set algebra

use crate::torrent::TorrentError;

/// Fixed-size bitmap of which pieces a peer holds.
///
/// Bits are stored MSB-first, exactly as they travel on the wire, so
/// serialization is a copy. Padding bits past `size` are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    size: u32,
}

impl Bitfield {
    /// Creates an all-absent bitfield for `size` pieces.
    pub fn new(size: u32) -> Self {
        Self {
            bits: vec![0u8; size.div_ceil(8) as usize],
            size,
        }
    }

    /// Parses a wire bitfield for `size` pieces.
    ///
    /// # Errors
    /// - `TorrentError::MalformedBitfield` - Wrong byte length or a padding bit is set
    pub fn from_bytes(bytes: &[u8], size: u32) -> Result<Self, TorrentError> {
        let expected = size.div_ceil(8) as usize;
        if bytes.len() != expected {
            return Err(TorrentError::MalformedBitfield {
                reason: format!(
                    "expected {expected} bytes for {size} pieces, got {}",
                    bytes.len()
                ),
            });
        }

        let spare = (expected * 8) as u32 - size;
        if spare > 0 {
            let padding_mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & padding_mask != 0 {
                return Err(TorrentError::MalformedBitfield {
                    reason: format!("bit set beyond piece count {size}"),
                });
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            size,
        })
    }

    /// Replaces the contents with a wire bitfield of the same size.
    ///
    /// # Errors
    /// - `TorrentError::MalformedBitfield` - See [`Bitfield::from_bytes`]
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), TorrentError> {
        *self = Self::from_bytes(bytes, self.size)?;
        Ok(())
    }

    /// Serializes to the wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pieces tracked.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// # Errors
    /// - `TorrentError::PieceIndexOutOfRange` - Index not in `[0, size)`
    pub fn set(&mut self, index: u32) -> Result<(), TorrentError> {
        let (byte, mask) = self.locate(index)?;
        self.bits[byte] |= mask;
        Ok(())
    }

    /// # Errors
    /// - `TorrentError::PieceIndexOutOfRange` - Index not in `[0, size)`
    pub fn clear(&mut self, index: u32) -> Result<(), TorrentError> {
        let (byte, mask) = self.locate(index)?;
        self.bits[byte] &= !mask;
        Ok(())
    }

    /// # Errors
    /// - `TorrentError::PieceIndexOutOfRange` - Index not in `[0, size)`
    pub fn is_set(&self, index: u32) -> Result<bool, TorrentError> {
        let (byte, mask) = self.locate(index)?;
        Ok(self.bits[byte] & mask != 0)
    }

    /// Pieces set here and absent in `other`.
    ///
    /// Used as "what the remote has that we lack". Both sides describe the
    /// same torrent; bits beyond the shorter field count as absent in `other`.
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        let bits = self
            .bits
            .iter()
            .enumerate()
            .map(|(i, byte)| byte & !other.bits.get(i).copied().unwrap_or(0))
            .collect();
        Bitfield {
            bits,
            size: self.size,
        }
    }

    pub fn no_piece_set(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }

    pub fn all_pieces_set(&self) -> bool {
        self.count_set() == self.size
    }

    /// Number of pieces present.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Indices of absent pieces, ascending.
    pub fn missing_pieces(&self) -> Vec<u32> {
        (0..self.size).filter(|i| !self.bit(*i)).collect()
    }

    /// Indices of present pieces, ascending.
    pub fn existing_pieces(&self) -> Vec<u32> {
        (0..self.size).filter(|i| self.bit(*i)).collect()
    }

    fn bit(&self, index: u32) -> bool {
        self.bits[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    fn locate(&self, index: u32) -> Result<(usize, u8), TorrentError> {
        if index >= self.size {
            return Err(TorrentError::PieceIndexOutOfRange {
                index,
                size: self.size,
            });
        }
        Ok(((index / 8) as usize, 0x80 >> (index % 8)))
    }
}
