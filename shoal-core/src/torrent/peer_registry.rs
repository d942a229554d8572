//! Registry of remote peer connections plus our own synthetic peer record.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;

use super::peer_connection::{OutgoingMessage, PeerConnection, PeerContext};
use super::peer_state::PeerState;
use super::{Bitfield, PieceIndex};

/// Our own peer record: the pieces we hold. Never connected.
#[derive(Debug)]
pub struct LocalPeer {
    state: PeerState,
    bitfield: RwLock<Bitfield>,
}

impl LocalPeer {
    /// Creates a record with no pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            state: PeerState::default(),
            bitfield: RwLock::new(Bitfield::new(piece_count)),
        }
    }

    /// Placeholder state; the local record never takes part in flow control.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Snapshot of our bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        self.bitfield.read().has(piece_index)
    }

    /// Marks a piece complete. Returns true only the first time a piece is set.
    pub fn mark_complete(&self, piece_index: PieceIndex) -> bool {
        let mut bitfield = self.bitfield.write();
        if bitfield.has(piece_index) {
            return false;
        }
        bitfield.set(piece_index)
    }

    pub fn completed_pieces(&self) -> usize {
        self.bitfield.read().count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.read().is_complete()
    }
}

/// Ordered set of peer connections for one torrent.
///
/// Insertion order is preserved: it decides which peer the requester asks
/// first for a piece.
pub struct PeerRegistry {
    context: PeerContext,
    max_peers: usize,
    peers: RwLock<Vec<Arc<PeerConnection>>>,
}

impl PeerRegistry {
    /// Creates an empty registry accepting up to `max_peers` addresses.
    pub fn new(context: PeerContext, max_peers: usize) -> Self {
        Self {
            context,
            max_peers,
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a peer address.
    ///
    /// Returns false for duplicates and when the registry is full.
    pub fn add_peer(&self, address: SocketAddr) -> bool {
        let mut peers = self.peers.write();
        if peers.iter().any(|peer| peer.address() == address) {
            tracing::debug!("Ignoring duplicate peer {}", address);
            return false;
        }
        if peers.len() >= self.max_peers {
            tracing::debug!("Peer limit {} reached, ignoring {}", self.max_peers, address);
            return false;
        }

        peers.push(Arc::new(PeerConnection::new(address, self.context.clone())));
        true
    }

    /// Connects every registered peer concurrently.
    ///
    /// Returns the number of peers connected by this call. Individual
    /// failures are logged and do not fail the batch.
    pub async fn connect_all(&self, timeout: Duration) -> usize {
        let pending: Vec<_> = self
            .peers()
            .into_iter()
            .filter(|peer| !peer.is_connected())
            .collect();

        let attempts = pending.iter().map(|peer| async move {
            match peer.connect(timeout).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", peer.address(), e);
                    false
                }
            }
        });

        let connected = join_all(attempts)
            .await
            .into_iter()
            .filter(|connected| *connected)
            .count();
        tracing::info!("Connected to {}/{} peers", connected, pending.len());
        connected
    }

    /// Disconnects every peer.
    pub async fn disconnect_all(&self) {
        let peers = self.peers();
        join_all(peers.iter().map(|peer| peer.disconnect())).await;
    }

    /// Sends a message to every peer that completed its handshake.
    ///
    /// Best-effort: failures are logged and the peer is left alone. Returns the
    /// number of peers the message reached.
    pub async fn broadcast(&self, message: OutgoingMessage) -> usize {
        let mut delivered = 0;
        for peer in self.connected_peers() {
            match peer.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Broadcast to {} failed: {}", peer.address(), e),
            }
        }
        delivered
    }

    /// Snapshot of all peers in insertion order.
    pub fn peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().clone()
    }

    /// Peers with a live, handshaken connection, in insertion order.
    pub fn connected_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .read()
            .iter()
            .filter(|peer| peer.is_ready())
            .cloned()
            .collect()
    }

    pub fn local(&self) -> Arc<LocalPeer> {
        Arc::clone(&self.context.local)
    }

    pub fn context(&self) -> &PeerContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::torrent::protocol::{MessageCodec, PeerMessage};
    use crate::torrent::test_data::{create_test_context, handshake_peer, wait_until};

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_local_peer_marks_once() {
        let local = LocalPeer::new(3);

        assert!(local.mark_complete(PieceIndex::new(1)));
        assert!(!local.mark_complete(PieceIndex::new(1)));
        assert!(!local.mark_complete(PieceIndex::new(3)));
        assert_eq!(local.completed_pieces(), 1);
        assert!(!local.is_complete());
        assert_eq!(local.state(), PeerState::Choked);
    }

    #[test]
    fn test_add_peer_dedups_and_keeps_order() {
        let (context, _receiver) = create_test_context(4);
        let registry = PeerRegistry::new(context, 10);

        assert!(registry.add_peer(address(3)));
        assert!(registry.add_peer(address(1)));
        assert!(!registry.add_peer(address(3)));
        assert!(registry.add_peer(address(2)));

        let order: Vec<u16> = registry.peers().iter().map(|p| p.address().port()).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_add_peer_respects_limit() {
        let (context, _receiver) = create_test_context(4);
        let registry = PeerRegistry::new(context, 2);

        assert!(registry.add_peer(address(1)));
        assert!(registry.add_peer(address(2)));
        assert!(!registry.add_peer(address(3)));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_all_counts_successes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (context, _receiver) = create_test_context(4);
        let registry = PeerRegistry::new(context, 10);
        registry.add_peer(live);
        registry.add_peer(closed);

        let connected = registry.connect_all(Duration::from_secs(2)).await;
        assert_eq!(connected, 1);

        let peers = registry.peers();
        assert!(peers[0].is_connected());
        assert!(!peers[1].is_connected());

        registry.disconnect_all().await;
        assert!(registry.peers().iter().all(|peer| !peer.is_connected()));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_handshaken_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (context, _receiver) = create_test_context(4);
        let info_hash = context.info_hash;
        let registry = PeerRegistry::new(context, 10);
        registry.add_peer(listener.local_addr().unwrap());

        assert_eq!(registry.connect_all(Duration::from_secs(2)).await, 1);
        let (mut remote, _) = listener.accept().await.unwrap();
        handshake_peer(&mut remote, info_hash).await;

        let peer = Arc::clone(&registry.peers()[0]);
        assert!(wait_until(|| peer.is_ready()).await);

        let delivered = registry
            .broadcast(OutgoingMessage::Have {
                piece_index: PieceIndex::new(2),
            })
            .await;
        assert_eq!(delivered, 1);

        let mut frame = [0u8; 9];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(
            MessageCodec::deserialize_message(&frame).unwrap(),
            PeerMessage::Have {
                piece_index: PieceIndex::new(2)
            }
        );
    }
}
