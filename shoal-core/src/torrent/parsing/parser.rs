//! Torrent parser backed by bencode-rs

use std::path::Path;

use async_trait::async_trait;

use super::super::TorrentError;
use super::bencode::MetainfoDecoder;
use super::types::{TorrentMetadata, TorrentParser};

/// Parses `.torrent` files with bencode-rs and hashes the info dictionary
/// with SHA-1.
#[derive(Default)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    /// Creates new bencode parser instance.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TorrentParser for BencodeTorrentParser {
    async fn parse_torrent_data(
        &self,
        torrent_bytes: &[u8],
    ) -> Result<TorrentMetadata, TorrentError> {
        MetainfoDecoder::decode(torrent_bytes)
    }

    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let file_contents = tokio::fs::read(path).await?;
        tracing::debug!("Read {} bytes from {}", file_contents.len(), path.display());

        self.parse_torrent_data(&file_contents).await
    }
}
