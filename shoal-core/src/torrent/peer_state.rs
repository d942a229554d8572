//! Per-peer flow-control state and remote piece availability

use super::bitfield::Bitfield;
use super::protocol::PeerId;

/// Our flow-control relationship toward one remote peer.
///
/// Normal progression is `Choked → WaitingForUnchoke → Unchoked →
/// WaitingForPiece → Unchoked → …`. A choke from the peer returns to
/// `Choked` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Peer is choking us; requests are not allowed
    #[default]
    Choked,
    /// We sent Interested and wait for Unchoke
    WaitingForUnchoke,
    /// Peer accepts requests
    Unchoked,
    /// A block request is outstanding
    WaitingForPiece,
}

/// Mutable record of one remote peer.
///
/// Written by the peer's receive loop (and by `send` for our own state
/// transitions), read by the piece requester. Always accessed through the
/// owning connection's lock.
#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    /// Local flow-control state toward this peer
    pub state: PeerState,
    /// Whether the remote peer told us it is interested
    pub remote_interested: bool,
    /// Identifier from the remote handshake
    pub remote_peer_id: Option<PeerId>,
    /// Pieces the remote peer advertised
    pub bitfield: Bitfield,
}

impl PeerStatus {
    /// Initial record for a torrent with `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bitfield: Bitfield::new(piece_count),
            ..Self::default()
        }
    }

    /// Whether the handshake completed on the current connection.
    pub fn handshake_done(&self) -> bool {
        self.remote_peer_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    #[test]
    fn test_initial_status() {
        let status = PeerStatus::new(12);

        assert_eq!(status.state, PeerState::Choked);
        assert!(!status.remote_interested);
        assert!(!status.handshake_done());
        assert_eq!(status.bitfield.len(), 12);
        assert!(!status.bitfield.has(PieceIndex::new(0)));
    }
}
