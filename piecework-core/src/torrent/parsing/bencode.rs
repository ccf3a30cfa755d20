//! Bencode decoding of metainfo and info hash calculation

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use super::types::{FileLayout, Metainfo, TorrentFile};
use crate::torrent::{InfoHash, TorrentError};

pub(super) type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(super) type ParseResult<T> = Result<T, TorrentError>;

/// Bencode parsing utilities for metainfo extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Decodes a complete `.torrent` document.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing fields or inconsistent sizes
    pub fn parse_metainfo(torrent_bytes: &[u8]) -> ParseResult<Metainfo> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("bencode parsing failed: {e:?}")))?;

        let Some(bencode_rs::Value::Dictionary(root)) = parsed.first() else {
            return Err(invalid("root element must be a dictionary"));
        };
        let Some(bencode_rs::Value::Dictionary(info)) = root.get(b"info".as_slice()) else {
            return Err(invalid("missing or invalid 'info' dictionary"));
        };

        let info_hash = Self::calculate_info_hash(torrent_bytes)?;
        let name = Self::extract_string(info, b"name")?;
        let piece_length = Self::extract_length(info, b"piece length")?;
        if piece_length == 0 || piece_length > u64::from(u32::MAX) {
            return Err(invalid(format!("unusable piece length {piece_length}")));
        }
        let piece_length = piece_length as u32;

        let pieces = Self::extract_bytes(info, b"pieces")?;
        if !pieces.len().is_multiple_of(20) {
            return Err(invalid("pieces blob is not a multiple of 20 bytes"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (layout, total_length) = if info.contains_key(b"length".as_slice()) {
            let length = Self::extract_length(info, b"length")?;
            (FileLayout::Single { length }, length)
        } else {
            match info.get(b"files".as_slice()) {
                Some(bencode_rs::Value::List(entries)) => {
                    let files = Self::extract_files(entries)?;
                    let total = files.iter().map(|f| f.length).sum();
                    (FileLayout::Multi { files }, total)
                }
                _ => return Err(invalid("missing 'length' or 'files' field")),
            }
        };

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if total_length == 0 || expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "{} piece hashes for {total_length} bytes at piece length {piece_length}",
                piece_hashes.len()
            )));
        }

        Ok(Metainfo {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            layout,
            announce_urls: Self::extract_announce_urls(root),
        })
    }

    /// SHA-1 over the exact bytes of the top-level `info` value.
    fn calculate_info_hash(data: &[u8]) -> ParseResult<InfoHash> {
        let (start, end) = Self::find_info_span(data)?;
        let digest = Sha1::digest(&data[start..end]);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Ok(InfoHash::new(hash))
    }

    /// Locates the raw `info` value by walking the root dictionary's keys.
    fn find_info_span(data: &[u8]) -> ParseResult<(usize, usize)> {
        if data.first() != Some(&b'd') {
            return Err(invalid("expected dictionary start"));
        }
        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_end = Self::find_value_end(data, pos)?;
            let key_start = data[pos..key_end]
                .iter()
                .position(|b| *b == b':')
                .map(|i| pos + i + 1)
                .ok_or_else(|| invalid("dictionary key is not a string"))?;
            let value_end = Self::find_value_end(data, key_end)?;
            if &data[key_start..key_end] == b"info" {
                return Ok((key_end, value_end));
            }
            pos = value_end;
        }
        Err(invalid("could not find info dictionary in data"))
    }

    /// Returns the offset just past the bencode value starting at `pos`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Truncated or malformed value
    pub fn find_value_end(data: &[u8], pos: usize) -> ParseResult<usize> {
        let mut pos = pos;
        let mut depth = 0usize;

        loop {
            let Some(byte) = data.get(pos) else {
                return Err(invalid("incomplete bencode value"));
            };
            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let end = data[pos..]
                        .iter()
                        .position(|b| *b == b'e')
                        .ok_or_else(|| invalid("unterminated integer"))?;
                    pos += end + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|b| *b == b':')
                        .ok_or_else(|| invalid("invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| invalid("invalid string length"))?;
                    pos += colon + 1 + length;
                    if pos > data.len() {
                        return Err(invalid("string runs past end of data"));
                    }
                }
                _ => return Err(invalid("invalid bencode character")),
            }
            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "invalid UTF-8 in field {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "missing or invalid field {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Non-negative integer field.
    fn extract_length(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<u64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) if *value >= 0 => Ok(*value as u64),
            _ => Err(invalid(format!(
                "missing or invalid integer field {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_files(entries: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<TorrentFile>> {
        let mut files = Vec::with_capacity(entries.len());

        for entry in entries {
            let bencode_rs::Value::Dictionary(file) = entry else {
                return Err(invalid("invalid file entry type"));
            };
            let length = Self::extract_length(file, b"length")?;
            let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice()) else {
                return Err(invalid("missing or invalid path in file entry"));
            };

            let path = components
                .iter()
                .map(|component| match component {
                    bencode_rs::Value::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                        .map_err(|_| invalid("invalid UTF-8 in file path")),
                    _ => Err(invalid("invalid path component type")),
                })
                .collect::<ParseResult<Vec<String>>>()?;
            if path.is_empty() {
                return Err(invalid("empty file path"));
            }

            files.push(TorrentFile { path, length });
        }

        if files.is_empty() {
            return Err(invalid("multi-file torrent lists no files"));
        }
        Ok(files)
    }

    /// `announce` followed by every `announce-list` tier, without duplicates.
    fn extract_announce_urls(root: &BencodeDict<'_>) -> Vec<String> {
        let mut urls = Vec::new();

        if let Ok(announce) = Self::extract_string(root, b"announce") {
            urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
            for tier in tiers {
                let bencode_rs::Value::List(tier_urls) = tier else {
                    continue;
                };
                for value in tier_urls {
                    if let bencode_rs::Value::Bytes(bytes) = value
                        && let Ok(url) = String::from_utf8(bytes.to_vec())
                        && !urls.contains(&url)
                    {
                        urls.push(url);
                    }
                }
            }
        }

        urls
    }
}

/// Minimal bencode encoder.
///
/// Callers emit dictionary keys in sorted order themselves.
#[derive(Debug, Default)]
pub struct BencodeWriter {
    buf: Vec<u8>,
}

impl BencodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value.len().to_string().as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(value);
        self
    }

    pub fn integer(&mut self, value: i64) -> &mut Self {
        self.buf.push(b'i');
        self.buf.extend_from_slice(value.to_string().as_bytes());
        self.buf.push(b'e');
        self
    }

    pub fn begin_dict(&mut self) -> &mut Self {
        self.buf.push(b'd');
        self
    }

    pub fn begin_list(&mut self) -> &mut Self {
        self.buf.push(b'l');
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.push(b'e');
        self
    }

    /// Appends an already-encoded value.
    pub fn raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(encoded);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}
