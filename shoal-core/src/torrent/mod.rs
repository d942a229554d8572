//! BitTorrent peer wire exchange and block acquisition.

pub mod bitfield;
pub mod parsing;
pub mod peer_connection;
pub mod peer_registry;
pub mod peer_state;
pub mod piece_manager;
pub mod piece_progress;
pub mod protocol;
pub mod session;
#[cfg(test)]
pub mod test_data;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

pub use bitfield::Bitfield;
pub use parsing::{BencodeTorrentParser, TorrentFile, TorrentMetadata, TorrentParser};
pub use peer_connection::{OutgoingMessage, PeerConnection, PeerContext, PieceBlock};
pub use peer_registry::{LocalPeer, PeerRegistry};
pub use peer_state::{PeerState, PeerStatus};
pub use piece_manager::{PieceManager, rare_pieces};
pub use piece_progress::PieceProgress;
pub use protocol::{PeerHandshake, PeerId, PeerMessage};
pub use session::{Session, SessionProgress};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Peers must agree on it during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
///
/// The same index is used as the bit position in every [`Bitfield`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a bit position.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers metadata parsing, tracker communication, the peer wire state
/// machine and block persistence.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker request timed out: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker {url} returned server error {status}")]
    TrackerServerError { url: String, status: u16 },

    #[error("Torrent not found on tracker: {url}")]
    TorrentNotFoundOnTracker { url: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Info hash mismatch in handshake from {address}")]
    InfoHashMismatch { address: SocketAddr },

    #[error("{message} not sent: {reason}")]
    MessageRejected {
        message: &'static str,
        reason: &'static str,
    },

    #[error("Peer {address} is not connected")]
    NotConnected { address: SocketAddr },

    #[error("Peer {address} is already connected")]
    AlreadyConnected { address: SocketAddr },

    #[error("No peers available for torrent")]
    NoPeersAvailable,

    #[error("Invalid session state: {reason}")]
    InvalidSessionState { reason: &'static str },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Whether the error means the peer connection is no longer usable.
    ///
    /// Gating rejections and "not connected" are not connection errors: the
    /// first leaves the connection intact, the second has nothing left to
    /// tear down.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TorrentError::PeerConnectionError { .. }
                | TorrentError::ProtocolError { .. }
                | TorrentError::InfoHashMismatch { .. }
                | TorrentError::Io(_)
        )
    }
}
