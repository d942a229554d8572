//! Torrent metadata types and the parser interface

use std::path::Path;

use async_trait::async_trait;

use super::super::{InfoHash, TorrentError};

/// Complete metadata extracted from a torrent file.
///
/// Contains all information needed to download a torrent including
/// piece hashes, file structure, and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    /// Whether the info dictionary used the `files` list form
    pub multi_file: bool,
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    /// Number of pieces, one per SHA-1 hash.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }
}

/// Individual file within a torrent.
///
/// Path components are relative to the torrent's root directory in
/// multi-file torrents.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Abstract torrent parsing interface.
///
/// Lets the session load metadata without depending on a concrete decoder.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError>;

    /// Parses torrent file from filesystem path.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError>;
}
