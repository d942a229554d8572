//! Core types for BitTorrent tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Tracker announce request.
///
/// Contains client statistics and torrent information sent to the tracker
/// to report progress and request a peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Torrent being announced
    pub info_hash: InfoHash,
    /// Our peer id
    pub peer_id: PeerId,
    /// TCP port we listen on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    /// Current client state for this torrent
    pub event: AnnounceEvent,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
    /// Client completed downloading this torrent
    Completed,
}

impl AnnounceEvent {
    /// Tracker protocol spelling of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds until next announce request should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Number of seeders in the swarm
    pub complete: u32,
    /// Number of leechers in the swarm
    pub incomplete: u32,
    /// Peer addresses for connection attempts, in tracker order
    pub peers: Vec<SocketAddr>,
}

/// Tracker communication interface.
///
/// The session depends on this trait so tests and alternative transports can
/// stand in for HTTP.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces to `announce_url` and returns the peer list.
    ///
    /// # Errors
    /// - `TorrentError::TrackerConnectionFailed` - Network or HTTP error
    /// - `TorrentError::TrackerTimeout` - Tracker did not answer in time
    /// - `TorrentError::ProtocolError` - Invalid tracker response format
    async fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError>;
}
