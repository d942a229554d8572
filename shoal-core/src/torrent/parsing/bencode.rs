//! Metainfo decoding on top of bencode-rs, plus info hash extraction

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use super::types::{TorrentFile, TorrentMetadata};
use crate::torrent::{InfoHash, TorrentError};

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Decodes a `.torrent` file into [`TorrentMetadata`].
pub struct MetainfoDecoder;

impl MetainfoDecoder {
    /// Decodes metainfo bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Bad bencode or missing fields
    pub fn decode(torrent_bytes: &[u8]) -> ParseResult<TorrentMetadata> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;

        let Some(bencode_rs::Value::Dictionary(root)) = parsed.first() else {
            return Err(invalid("Root element must be dictionary"));
        };
        let Some(bencode_rs::Value::Dictionary(info)) = root.get(b"info".as_slice()) else {
            return Err(invalid("Missing 'info' dictionary"));
        };

        let info_hash = Self::info_hash(torrent_bytes)?;
        let name = Self::string(info, b"name")?;

        let piece_length = Self::integer(info, b"piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|length| *length > 0)
            .ok_or_else(|| invalid(format!("Invalid piece length {piece_length}")))?;

        let pieces = Self::bytes(info, b"pieces")?;
        if !pieces.len().is_multiple_of(20) {
            return Err(invalid("Invalid pieces length"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, multi_file) = match info.get(b"files".as_slice()) {
            Some(bencode_rs::Value::List(entries)) => (Self::files(entries)?, true),
            Some(_) => return Err(invalid("Invalid 'files' field")),
            None => {
                let length = Self::length(info)?;
                let file = TorrentFile {
                    path: vec![name.clone()],
                    length,
                };
                (vec![file], false)
            }
        };
        let total_length = files.iter().map(|file| file.length).sum();

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            multi_file,
            announce_urls: Self::announce_urls(root)?,
        })
    }

    /// SHA-1 of the exact bytes of the top-level `info` value.
    fn info_hash(torrent_bytes: &[u8]) -> ParseResult<InfoHash> {
        let (start, end) = Self::info_span(torrent_bytes)?;
        let digest = Sha1::digest(&torrent_bytes[start..end]);

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Ok(InfoHash::new(hash))
    }

    /// Locates the `info` value by walking the top-level dictionary's keys.
    pub(super) fn info_span(data: &[u8]) -> ParseResult<(usize, usize)> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let (key_start, key_end) = Self::string_span(data, pos)?;
            let value_start = key_end;
            let value_end = Self::skip_value(data, value_start)?;
            if &data[key_start..key_end] == b"info" {
                return Ok((value_start, value_end));
            }
            pos = value_end;
        }

        Err(invalid("Missing 'info' dictionary"))
    }

    /// Returns the content span of the string starting at `pos`; its end is
    /// also where the next value starts.
    fn string_span(data: &[u8], pos: usize) -> ParseResult<(usize, usize)> {
        let colon = data[pos..]
            .iter()
            .position(|byte| *byte == b':')
            .map(|offset| pos + offset)
            .ok_or_else(|| invalid("Invalid string format"))?;

        let length: usize = std::str::from_utf8(&data[pos..colon])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| invalid("Invalid string length"))?;

        let end = colon + 1 + length;
        if end > data.len() {
            return Err(invalid("String runs past end of data"));
        }
        Ok((colon + 1, end))
    }

    /// Returns the position just past the value starting at `pos`.
    fn skip_value(data: &[u8], pos: usize) -> ParseResult<usize> {
        let mut pos = pos;
        let mut depth = 0usize;

        loop {
            match data.get(pos) {
                Some(b'd' | b'l') => {
                    depth += 1;
                    pos += 1;
                }
                Some(b'e') if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                Some(b'i') => {
                    let end = data[pos..]
                        .iter()
                        .position(|byte| *byte == b'e')
                        .ok_or_else(|| invalid("Unterminated integer"))?;
                    pos += end + 1;
                }
                Some(b'0'..=b'9') => pos = Self::string_span(data, pos)?.1,
                Some(_) => return Err(invalid("Invalid bencode character")),
                None => return Err(invalid("Incomplete bencode value")),
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    fn files(entries: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<TorrentFile>> {
        if entries.is_empty() {
            return Err(invalid("Empty 'files' list"));
        }

        entries
            .iter()
            .map(|entry| {
                let bencode_rs::Value::Dictionary(file) = entry else {
                    return Err(invalid("Invalid file entry type"));
                };
                let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice())
                else {
                    return Err(invalid("Missing or invalid path in file"));
                };

                let path = components
                    .iter()
                    .map(|component| match component {
                        bencode_rs::Value::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                            .map_err(|_| invalid("Invalid UTF-8 in file path")),
                        _ => Err(invalid("Invalid path component type")),
                    })
                    .collect::<ParseResult<Vec<_>>>()?;
                if path.is_empty() || path.iter().any(|part| part.is_empty() || part == "..") {
                    return Err(invalid("Unsafe file path"));
                }

                Ok(TorrentFile {
                    path,
                    length: Self::length(file)?,
                })
            })
            .collect()
    }

    fn announce_urls(root: &BencodeDict<'_>) -> ParseResult<Vec<String>> {
        let mut urls = Vec::new();
        if let Ok(announce) = Self::string(root, b"announce") {
            urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
            for tier in tiers {
                let bencode_rs::Value::List(tier_urls) = tier else {
                    continue;
                };
                for url in tier_urls {
                    if let bencode_rs::Value::Bytes(bytes) = url
                        && let Ok(url) = String::from_utf8(bytes.to_vec())
                        && !urls.contains(&url)
                    {
                        urls.push(url);
                    }
                }
            }
        }

        if urls.is_empty() {
            return Err(invalid("No announce URLs found"));
        }
        Ok(urls)
    }

    fn length(dict: &BencodeDict<'_>) -> ParseResult<u64> {
        let length = Self::integer(dict, b"length")?;
        u64::try_from(length).map_err(|_| invalid(format!("Negative length {length}")))
    }

    fn string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }
}
