//! Connection to one remote peer and its protocol state machine

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use super::peer_registry::LocalPeer;
use super::peer_state::{PeerState, PeerStatus};
use super::protocol::{MessageReader, MessageWriter, PeerHandshake, PeerId, PeerMessage};
use super::{InfoHash, PieceIndex, TorrentError};

type BoxedWriter = MessageWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Block of piece data received from a peer, on its way to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceBlock {
    /// Peer that sent the block
    pub peer: SocketAddr,
    pub piece_index: PieceIndex,
    /// Byte offset within the piece
    pub offset: u32,
    pub data: Bytes,
}

/// Messages we originate, each with its own typed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingMessage {
    Handshake,
    /// Our current bitfield, taken from the local peer record
    Bitfield,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Request {
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    },
}

impl OutgoingMessage {
    fn name(&self) -> &'static str {
        match self {
            OutgoingMessage::Handshake => "handshake",
            OutgoingMessage::Bitfield => "bitfield",
            OutgoingMessage::Interested => "interested",
            OutgoingMessage::NotInterested => "not-interested",
            OutgoingMessage::Have { .. } => "have",
            OutgoingMessage::Request { .. } => "request",
        }
    }
}

/// Session-wide values every connection needs.
#[derive(Clone)]
pub struct PeerContext {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub piece_count: usize,
    /// Our own piece record, announced in the bitfield message
    pub local: Arc<LocalPeer>,
    /// Incoming block queue drained by the piece manager writer
    pub block_sender: mpsc::Sender<PieceBlock>,
    /// Signalled whenever peer state relevant to scheduling changes
    pub activity: Arc<Notify>,
    /// Longest inbound frame accepted, see [`super::protocol::frame_limit`]
    pub max_frame_length: u32,
}

/// Connection to a BitTorrent peer.
///
/// Owns the write half of the stream; the read half lives in the spawned
/// receive loop. Peer status is guarded by a lock because the requester reads
/// it from another task.
pub struct PeerConnection {
    address: SocketAddr,
    context: PeerContext,
    status: RwLock<PeerStatus>,
    writer: Mutex<Option<BoxedWriter>>,
    connected: AtomicBool,
    receive_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Creates a disconnected peer record for `address`.
    pub fn new(address: SocketAddr, context: PeerContext) -> Self {
        let status = PeerStatus::new(context.piece_count);
        Self {
            address,
            context,
            status: RwLock::new(status),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            receive_task: parking_lot::Mutex::new(None),
        }
    }

    /// Returns the socket address of the peer.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether a stream is currently attached.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the peer completed the handshake on the current connection.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.status.read().handshake_done()
    }

    /// Current flow-control state toward this peer.
    pub fn state(&self) -> PeerState {
        self.status.read().state
    }

    /// Snapshot of the peer record.
    pub fn status(&self) -> PeerStatus {
        self.status.read().clone()
    }

    /// Whether the peer advertised the piece.
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        self.status.read().bitfield.has(piece_index)
    }

    /// Dials the peer and starts the receive loop.
    ///
    /// # Errors
    /// - `TorrentError::AlreadyConnected` - A stream is already attached
    /// - `TorrentError::PeerConnectionError` - Dial failed or timed out
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<(), TorrentError> {
        if self.is_connected() {
            return Err(TorrentError::AlreadyConnected {
                address: self.address,
            });
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(self.address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Failed to connect to {}: {e}", self.address),
                });
            }
            Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Timed out connecting to {}", self.address),
                });
            }
        };

        self.attach(stream).await
    }

    /// Runs the peer protocol over an already established stream.
    ///
    /// # Errors
    /// - `TorrentError::AlreadyConnected` - A stream is already attached
    pub async fn attach<S>(self: &Arc<Self>, stream: S) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Err(TorrentError::AlreadyConnected {
                address: self.address,
            });
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        *writer = Some(MessageWriter::new(write_half));
        *self.status.write() = PeerStatus::new(self.context.piece_count);
        self.connected.store(true, Ordering::Release);

        let connection = Arc::clone(self);
        let task = tokio::spawn(async move {
            let max_frame_length = connection.context.max_frame_length;
            connection
                .run(MessageReader::with_frame_limit(read_half, max_frame_length))
                .await;
        });
        *self.receive_task.lock() = Some(task);

        tracing::info!("Connected to peer {}", self.address);
        Ok(())
    }

    /// Closes the connection and resets all per-peer state. Idempotent.
    pub async fn disconnect(&self) {
        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.teardown().await;
    }

    /// Encodes and writes one of our messages.
    ///
    /// `Interested` is only sent while `Choked` and moves to
    /// `WaitingForUnchoke`. `Request` is only sent while `Unchoked`, for a
    /// piece the peer has and we lack, and moves to `WaitingForPiece`.
    /// `Bitfield` is skipped while we have no pieces.
    ///
    /// # Errors
    /// - `TorrentError::MessageRejected` - Gating refused the message
    /// - `TorrentError::NotConnected` - No stream attached
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), TorrentError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TorrentError::NotConnected {
                address: self.address,
            });
        };

        let previous = self.gate(message)?;

        tracing::debug!("Sending {} to peer {}", message.name(), self.address);
        let result = match self.wire_message(message) {
            Some(wire) => writer.write_message(&wire).await,
            None => {
                let handshake =
                    PeerHandshake::new(self.context.info_hash, self.context.local_peer_id);
                writer.write_handshake(&handshake).await
            }
        };

        if let Err(e) = result {
            if let Some((from, to)) = previous {
                let mut status = self.status.write();
                if status.state == to {
                    status.state = from;
                }
            }
            tracing::warn!("Failed to send {} to {}: {}", message.name(), self.address, e);
            return Err(e);
        }

        Ok(())
    }

    /// Validates the peer handshake against our torrent.
    ///
    /// # Errors
    /// - `TorrentError::InfoHashMismatch` - Peer is serving another torrent
    pub fn process_handshake(&self, handshake: &PeerHandshake) -> Result<(), TorrentError> {
        if handshake.info_hash != self.context.info_hash {
            tracing::warn!(
                "Info hash mismatch from {}: expected {}, got {}",
                self.address,
                self.context.info_hash,
                handshake.info_hash
            );
            return Err(TorrentError::InfoHashMismatch {
                address: self.address,
            });
        }

        self.status.write().remote_peer_id = Some(handshake.peer_id);
        self.context.activity.notify_one();
        Ok(())
    }

    /// Applies one decoded post-handshake message to the peer state.
    ///
    /// Returns the block to persist for `Piece` messages.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Empty bitfield or out-of-range Have
    pub fn process_incoming(
        &self,
        message: PeerMessage,
    ) -> Result<Option<PieceBlock>, TorrentError> {
        tracing::debug!("Received {} from peer {}", message.kind(), self.address);

        let block = match message {
            PeerMessage::KeepAlive => return Ok(None),
            PeerMessage::Choke => {
                self.status.write().state = PeerState::Choked;
                None
            }
            PeerMessage::Unchoke => {
                self.status.write().state = PeerState::Unchoked;
                None
            }
            PeerMessage::Interested => {
                self.status.write().remote_interested = true;
                return Ok(None);
            }
            PeerMessage::NotInterested => {
                self.status.write().remote_interested = false;
                return Ok(None);
            }
            PeerMessage::Have { piece_index } => {
                if piece_index.as_usize() >= self.context.piece_count {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Have for unknown piece {piece_index}"),
                    });
                }
                let mut status = self.status.write();
                if !status.bitfield.has(piece_index) {
                    status.bitfield.set(piece_index);
                }
                None
            }
            PeerMessage::Bitfield { bitfield } => {
                if bitfield.is_empty() {
                    return Err(TorrentError::ProtocolError {
                        message: "Empty bitfield".to_string(),
                    });
                }
                self.status.write().bitfield =
                    super::Bitfield::from_bytes(&bitfield, self.context.piece_count);
                None
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            }
            | PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                tracing::debug!(
                    "Peer {} asked for piece {} offset {} length {}; uploads are not served",
                    self.address,
                    piece_index,
                    offset,
                    length
                );
                return Ok(None);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let mut status = self.status.write();
                if status.state == PeerState::WaitingForPiece {
                    status.state = PeerState::Unchoked;
                }
                Some(PieceBlock {
                    peer: self.address,
                    piece_index,
                    offset,
                    data,
                })
            }
            PeerMessage::Port { port } => {
                tracing::debug!("Peer {} DHT port {}", self.address, port);
                return Ok(None);
            }
        };

        self.context.activity.notify_one();
        Ok(block)
    }

    /// Checks gating rules and applies the optimistic state transition.
    ///
    /// The transition happens before the write so a fast reply cannot be
    /// overwritten; the returned pair lets a failed write roll it back.
    fn gate(
        &self,
        message: OutgoingMessage,
    ) -> Result<Option<(PeerState, PeerState)>, TorrentError> {
        let reject = |reason| TorrentError::MessageRejected {
            message: message.name(),
            reason,
        };

        match message {
            OutgoingMessage::Interested => {
                let mut status = self.status.write();
                if status.state != PeerState::Choked {
                    return Err(reject("peer is not choking us"));
                }
                status.state = PeerState::WaitingForUnchoke;
                Ok(Some((PeerState::Choked, PeerState::WaitingForUnchoke)))
            }
            OutgoingMessage::Request { piece_index, .. } => {
                let mut status = self.status.write();
                if status.state != PeerState::Unchoked {
                    return Err(reject("peer is not ready for a request"));
                }
                if !status.bitfield.has(piece_index) {
                    return Err(reject("peer does not have the piece"));
                }
                if self.context.local.has_piece(piece_index) {
                    return Err(reject("piece already downloaded"));
                }
                status.state = PeerState::WaitingForPiece;
                Ok(Some((PeerState::Unchoked, PeerState::WaitingForPiece)))
            }
            OutgoingMessage::Bitfield => {
                if self.context.local.completed_pieces() == 0 {
                    return Err(reject("no pieces to announce"));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Length-prefixed form of the message; `None` for the handshake.
    fn wire_message(&self, message: OutgoingMessage) -> Option<PeerMessage> {
        let wire = match message {
            OutgoingMessage::Handshake => return None,
            OutgoingMessage::Bitfield => PeerMessage::Bitfield {
                bitfield: Bytes::from(self.context.local.bitfield().to_bytes()),
            },
            OutgoingMessage::Interested => PeerMessage::Interested,
            OutgoingMessage::NotInterested => PeerMessage::NotInterested,
            OutgoingMessage::Have { piece_index } => PeerMessage::Have { piece_index },
            OutgoingMessage::Request {
                piece_index,
                begin,
                length,
            } => PeerMessage::Request {
                piece_index,
                offset: begin,
                length,
            },
        };
        Some(wire)
    }

    /// Receive loop body; tears the connection down when the exchange ends.
    async fn run<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: MessageReader<R>) {
        match self.exchange(&mut reader).await {
            Ok(()) => tracing::debug!("Receive loop for {} finished", self.address),
            Err(e) => tracing::warn!("Dropping peer {}: {}", self.address, e),
        }
        self.teardown().await;
    }

    async fn exchange<R: AsyncRead + Unpin>(
        &self,
        reader: &mut MessageReader<R>,
    ) -> Result<(), TorrentError> {
        self.send(OutgoingMessage::Handshake).await?;
        if let Err(e) = self.send(OutgoingMessage::Bitfield).await
            && e.is_connection_error()
        {
            return Err(e);
        }

        let handshake = reader.read_handshake().await?;
        self.process_handshake(&handshake)?;
        tracing::info!("Handshake complete with peer {}", self.address);

        loop {
            let message = reader.read_message().await?;
            if let Some(block) = self.process_incoming(message)?
                && self.context.block_sender.send(block).await.is_err()
            {
                tracing::debug!("Block queue closed, stopping receive loop");
                return Ok(());
            }
        }
    }

    async fn teardown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await;
            tracing::info!("Disconnected from peer {}", self.address);
        }
        self.connected.store(false, Ordering::Release);
        *self.status.write() = PeerStatus::new(self.context.piece_count);
        self.context.activity.notify_one();
    }
}
