//! BitTorrent handshake serialization and deserialization

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Size of a BEP 3 handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LENGTH: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LENGTH);

        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong length or unknown protocol name
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() != HANDSHAKE_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Invalid handshake length: expected {HANDSHAKE_LENGTH}, got {}",
                    data.len()
                ),
            });
        }

        let protocol_len = data[0] as usize;
        if protocol_len != PROTOCOL_NAME.len() || &data[1..20] != PROTOCOL_NAME.as_bytes() {
            return Err(TorrentError::ProtocolError {
                message: "Unknown protocol in handshake".to_string(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[28..48]);

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        })
    }
}
