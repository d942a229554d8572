//! Core types for the BitTorrent wire protocol

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker announces.
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

    /// Generate a random peer ID carrying the client identifier prefix.
    ///
    /// Prefixes longer than 20 bytes are cut off.
    pub fn generate(client_id: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = &client_id.as_bytes()[..client_id.len().min(20)];
        id[..prefix.len()].copy_from_slice(prefix);
        for byte in &mut id[prefix.len()..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// BitTorrent wire protocol messages.
///
/// Complete set of message types defined in BEP 3 for peer communication.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Sender is choking the receiver
    Choke,
    /// Sender is no longer choking the receiver
    Unchoke,
    /// Sender wants pieces from the receiver
    Interested,
    /// Sender no longer wants pieces from the receiver
    NotInterested,
    /// Sender has acquired a specific piece
    Have {
        /// Index of the piece now available
        piece_index: PieceIndex,
    },
    /// Sender's complete piece availability bitmap
    Bitfield {
        /// MSB-first bitmap, bit `i` is piece `i`
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The actual block data
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// Sender's DHT port
    Port {
        /// UDP port for DHT communication
        port: u16,
    },
}

impl PeerMessage {
    /// Short message name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and agree on the torrent being shared.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
