//! Piece scheduling and block persistence.
//!
//! The requester walks the pieces we lack, drives each holder through
//! Interested and Request. The writer drains received blocks into the output
//! files and marks pieces complete. Both loops stop on the session shutdown
//! signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::peer_connection::{OutgoingMessage, PieceBlock};
use super::peer_registry::{LocalPeer, PeerRegistry};
use super::peer_state::PeerState;
use super::piece_progress::PieceProgress;
use super::{Bitfield, PieceIndex, TorrentError, TorrentMetadata};
use crate::config::ShoalConfig;
use crate::storage::{FileLayout, FileSet, StorageError};

/// Pieces we lack that at least one peer has, in ascending index order.
///
/// A best-effort availability filter, not a strict rarest-first ranking:
/// callers ask the first peer holding each piece.
pub fn rare_pieces(ours: &Bitfield, peers: &[Bitfield]) -> Vec<PieceIndex> {
    (0..ours.len())
        .map(|index| PieceIndex::new(index as u32))
        .filter(|piece| !ours.has(*piece))
        .filter(|piece| peers.iter().any(|bitfield| bitfield.has(*piece)))
        .collect()
}

/// Owns piece completion bookkeeping for one torrent.
pub struct PieceManager {
    piece_length: u32,
    total_length: u64,
    piece_count: usize,
    block_length: u32,
    requester_interval: Duration,
    drain_limit: usize,
    registry: Arc<PeerRegistry>,
    local: Arc<LocalPeer>,
    activity: Arc<Notify>,
    progress: RwLock<HashMap<PieceIndex, PieceProgress>>,
    completion: watch::Sender<bool>,
}

impl PieceManager {
    /// Opens the output files and scans them for partial pieces.
    ///
    /// Each piece's next offset is one past its last non-zero byte on disk.
    /// The scan never marks pieces complete.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Piece geometry is inconsistent
    /// - `TorrentError::Storage` - A file could not be opened or read
    pub async fn open(
        metadata: &TorrentMetadata,
        config: &ShoalConfig,
        registry: Arc<PeerRegistry>,
    ) -> Result<(Self, FileSet), TorrentError> {
        let piece_count = metadata.piece_count();
        if metadata.piece_length == 0
            || metadata.total_length.div_ceil(metadata.piece_length as u64) != piece_count as u64
        {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "{} pieces of {} bytes cannot hold {} bytes",
                    piece_count, metadata.piece_length, metadata.total_length
                ),
            });
        }

        let layout = FileLayout::from_metadata(metadata, &config.storage.download_dir)?;
        let mut files = FileSet::open(layout).await?;

        let local = registry.local();
        let activity = Arc::clone(&registry.context().activity);
        let (completion, _) = watch::channel(local.is_complete());
        let manager = Self {
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
            piece_count,
            block_length: config.torrent.block_length,
            requester_interval: config.torrent.requester_interval,
            drain_limit: config.storage.block_queue_capacity,
            registry,
            local,
            activity,
            progress: RwLock::new(HashMap::new()),
            completion,
        };

        manager.scan(&mut files).await?;
        Ok((manager, files))
    }

    /// Size of a piece; the last one may be short.
    pub fn piece_size(&self, piece_index: PieceIndex) -> u32 {
        let start = self.piece_start(piece_index);
        (self.total_length.saturating_sub(start)).min(self.piece_length as u64) as u32
    }

    /// Offset of the first byte not yet received for a piece.
    pub fn next_offset(&self, piece_index: PieceIndex) -> u32 {
        self.progress
            .read()
            .get(&piece_index)
            .map(PieceProgress::next_offset)
            .unwrap_or(0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn completed_pieces(&self) -> usize {
        self.local.completed_pieces()
    }

    pub fn is_complete(&self) -> bool {
        self.local.is_complete()
    }

    /// Receiver that flips to `true` once every piece is complete.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion.subscribe()
    }

    /// Starts the requester and writer loops.
    pub fn spawn(
        self: &Arc<Self>,
        files: FileSet,
        blocks: mpsc::Receiver<PieceBlock>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let requester = tokio::spawn(Arc::clone(self).run_requester(shutdown.clone()));
        let writer = tokio::spawn(Arc::clone(self).run_writer(files, blocks, shutdown));
        vec![requester, writer]
    }

    /// One requester pass over every piece we still need.
    ///
    /// Returns the number of messages sent.
    pub async fn request_pieces(&self) -> usize {
        let peers = self.registry.connected_peers();
        let bitfields: Vec<Bitfield> = peers.iter().map(|peer| peer.status().bitfield).collect();
        let wanted = rare_pieces(&self.local.bitfield(), &bitfields);

        let mut sent = 0;
        for piece_index in wanted {
            let Some(position) = bitfields.iter().position(|bitfield| bitfield.has(piece_index))
            else {
                continue;
            };
            let peer = &peers[position];

            let message = match peer.state() {
                PeerState::Choked => OutgoingMessage::Interested,
                PeerState::Unchoked => {
                    let (begin, length) = self.next_block(piece_index);
                    OutgoingMessage::Request {
                        piece_index,
                        begin,
                        length,
                    }
                }
                PeerState::WaitingForUnchoke | PeerState::WaitingForPiece => continue,
            };

            match peer.send(message).await {
                Ok(()) => sent += 1,
                Err(e) if e.is_connection_error() => {
                    tracing::warn!("Request to {} failed, disconnecting: {}", peer.address(), e);
                    peer.disconnect().await;
                }
                Err(e) => tracing::debug!("Skipped {}: {}", peer.address(), e),
            }

            tokio::task::yield_now().await;
        }
        sent
    }

    /// Persists one received block and updates completion state.
    ///
    /// Returns true when this block completed its piece.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Block for a piece the torrent lacks
    /// - `TorrentError::Storage` - Block exceeds the piece or the write failed
    pub async fn write_block(
        &self,
        files: &mut FileSet,
        block: &PieceBlock,
    ) -> Result<bool, TorrentError> {
        let piece_index = block.piece_index;
        if piece_index.as_usize() >= self.piece_count {
            return Err(TorrentError::ProtocolError {
                message: format!("Block for unknown piece {piece_index}"),
            });
        }

        let piece_size = self.piece_size(piece_index);
        let length = block.data.len();
        if block.offset as u64 + length as u64 > piece_size as u64 {
            return Err(StorageError::OutOfBounds {
                offset: self.piece_start(piece_index) + block.offset as u64,
                length,
                total: self.piece_start(piece_index) + piece_size as u64,
            }
            .into());
        }

        if self.local.has_piece(piece_index) {
            tracing::debug!("Dropping block for completed piece {}", piece_index);
            return Ok(false);
        }

        let absolute = self.piece_start(piece_index) + block.offset as u64;
        files.write_at(absolute, &block.data).await?;
        files.flush().await?;
        tracing::debug!(
            "Wrote {} bytes of piece {} at offset {}",
            length,
            piece_index,
            absolute
        );

        let piece_done = {
            let mut progress = self.progress.write();
            let entry = progress
                .entry(piece_index)
                .or_insert_with(|| PieceProgress::new(piece_size));
            entry.record(block.offset, length as u32);
            entry.is_complete()
        };
        self.activity.notify_one();

        if !piece_done || !self.local.mark_complete(piece_index) {
            return Ok(false);
        }

        self.progress.write().remove(&piece_index);
        tracing::info!(
            "Piece {} complete ({}/{})",
            piece_index,
            self.local.completed_pieces(),
            self.piece_count
        );

        let all_done = self.local.is_complete();
        if all_done {
            tracing::info!("All {} pieces downloaded", self.piece_count);
            self.completion.send_replace(true);
        }
        self.announce(piece_index, all_done);
        Ok(true)
    }

    /// Broadcasts `Have` for a completed piece, then `NotInterested` once
    /// the torrent is done.
    ///
    /// Runs on its own task so a peer that stops reading cannot stall the
    /// writer.
    fn announce(&self, piece_index: PieceIndex, all_done: bool) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            registry
                .broadcast(OutgoingMessage::Have { piece_index })
                .await;
            if all_done {
                registry.broadcast(OutgoingMessage::NotInterested).await;
            }
        });
    }

    fn piece_start(&self, piece_index: PieceIndex) -> u64 {
        self.piece_length as u64 * piece_index.as_u32() as u64
    }

    /// Block to request next for a piece.
    ///
    /// A piece whose bytes are all on disk but not yet marked complete asks
    /// for its final block again, which completes it on arrival.
    fn next_block(&self, piece_index: PieceIndex) -> (u32, u32) {
        let piece_size = self.piece_size(piece_index);
        let mut begin = self.next_offset(piece_index);
        if begin >= piece_size {
            begin = piece_size - self.block_length.min(piece_size);
        }
        (begin, self.block_length.min(piece_size - begin))
    }

    async fn scan(&self, files: &mut FileSet) -> Result<(), TorrentError> {
        let mut progress = HashMap::new();
        for index in 0..self.piece_count {
            let piece_index = PieceIndex::new(index as u32);
            let piece_size = self.piece_size(piece_index);
            let data = files
                .read_at(self.piece_start(piece_index), piece_size as usize)
                .await?;

            if let Some(last) = data.iter().rposition(|byte| *byte != 0) {
                progress.insert(piece_index, PieceProgress::resume(piece_size, last as u32 + 1));
            }
        }

        if !progress.is_empty() {
            tracing::info!("Found partial data for {} pieces on disk", progress.len());
        }
        *self.progress.write() = progress;
        Ok(())
    }

    async fn run_requester(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.requester_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() || self.local.is_complete() {
                break;
            }

            self.request_pieces().await;

            tokio::select! {
                _ = self.activity.notified() => {}
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("Requester stopped");
    }

    async fn run_writer(
        self: Arc<Self>,
        mut files: FileSet,
        mut blocks: mpsc::Receiver<PieceBlock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                block = blocks.recv() => match block {
                    Some(block) => self.persist(&mut files, block).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.drain(&mut files, &mut blocks).await;
                    break;
                }
            }
        }

        if let Err(e) = files.close().await {
            tracing::warn!("Failed to close output files: {}", e);
        }
        tracing::debug!("Writer stopped");
    }

    async fn drain(&self, files: &mut FileSet, blocks: &mut mpsc::Receiver<PieceBlock>) {
        let mut drained = 0;
        while drained < self.drain_limit {
            let Ok(block) = blocks.try_recv() else {
                break;
            };
            self.persist(files, block).await;
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!("Drained {} queued blocks on shutdown", drained);
        }
    }

    async fn persist(&self, files: &mut FileSet, block: PieceBlock) {
        if let Err(e) = self.write_block(files, &block).await {
            tracing::warn!(
                "Dropping block for piece {} offset {} from {}: {}",
                block.piece_index,
                block.offset,
                block.peer,
                e
            );
        }
    }
}
