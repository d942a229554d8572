//! Download session: wires the peer registry to the piece manager.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use super::parsing::{TorrentMetadata, TorrentParser};
use super::peer_connection::{PeerContext, PieceBlock};
use super::peer_registry::{LocalPeer, PeerRegistry};
use super::piece_manager::PieceManager;
use super::protocol::frame_limit;
use super::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient};
use super::TorrentError;
use crate::config::ShoalConfig;

/// Snapshot of download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProgress {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub connected_peers: usize,
}

impl SessionProgress {
    /// Completion as a fraction in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.total_pieces == 0 {
            return 1.0;
        }
        self.completed_pieces as f64 / self.total_pieces as f64
    }
}

/// One torrent download.
///
/// Created from metadata and a peer list, then started once and stopped
/// once. Stopping signals every loop, disconnects all peers and waits for
/// the writer to flush.
pub struct Session {
    config: ShoalConfig,
    metadata: Arc<TorrentMetadata>,
    registry: Arc<PeerRegistry>,
    blocks: Mutex<Option<mpsc::Receiver<PieceBlock>>>,
    piece_manager: Mutex<Option<Arc<PieceManager>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Creates a session for `metadata` that will contact `peers`.
    pub fn new(config: ShoalConfig, metadata: TorrentMetadata, peers: Vec<SocketAddr>) -> Self {
        let piece_count = metadata.piece_count();
        let (block_sender, blocks) = mpsc::channel(config.storage.block_queue_capacity.max(1));
        let context = PeerContext {
            info_hash: metadata.info_hash,
            local_peer_id: config.torrent.peer_id,
            piece_count,
            local: Arc::new(LocalPeer::new(piece_count)),
            block_sender,
            activity: Arc::new(Notify::new()),
            max_frame_length: frame_limit(config.torrent.block_length, piece_count),
        };

        let registry = Arc::new(PeerRegistry::new(
            context,
            config.network.max_peer_connections,
        ));
        for peer in peers {
            registry.add_peer(peer);
        }
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            metadata: Arc::new(metadata),
            registry,
            blocks: Mutex::new(Some(blocks)),
            piece_manager: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Loads a torrent file and announces to its trackers for peers.
    ///
    /// Trackers are tried in announce-list order until one answers.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Torrent file could not be parsed
    /// - `TorrentError::NoPeersAvailable` - Tracker returned no peers
    /// - Last tracker error when every tracker failed
    pub async fn prepare(
        config: ShoalConfig,
        path: &Path,
        parser: &dyn TorrentParser,
        tracker: &dyn TrackerClient,
    ) -> Result<Self, TorrentError> {
        let metadata = parser.parse_torrent_file(path).await?;
        tracing::info!(
            "Loaded torrent {} ({}, {} pieces of {} bytes)",
            metadata.name,
            metadata.info_hash,
            metadata.piece_count(),
            metadata.piece_length
        );

        let request = AnnounceRequest {
            info_hash: metadata.info_hash,
            peer_id: config.torrent.peer_id,
            port: config.network.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: metadata.total_length,
            event: AnnounceEvent::Started,
        };

        let mut last_error = TorrentError::NoPeersAvailable;
        for url in &metadata.announce_urls {
            match tracker.announce(url, &request).await {
                Ok(response) if response.peers.is_empty() => {
                    tracing::warn!("Tracker {} returned no peers", url);
                    last_error = TorrentError::NoPeersAvailable;
                }
                Ok(response) => return Ok(Self::new(config, metadata, response.peers)),
                Err(e) => {
                    tracing::warn!("Announce to {} failed: {}", url, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Opens the output files, connects to all peers and starts the
    /// requester and writer loops.
    ///
    /// # Errors
    /// - `TorrentError::InvalidSessionState` - Session was already started
    /// - `TorrentError::Storage` - Output files could not be opened
    pub async fn start(&self) -> Result<(), TorrentError> {
        let Some(blocks) = self.blocks.lock().take() else {
            return Err(TorrentError::InvalidSessionState {
                reason: "session already started",
            });
        };

        let (manager, files) =
            match PieceManager::open(&self.metadata, &self.config, Arc::clone(&self.registry))
                .await
            {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::error!("Failed to open output files: {}", e);
                    return Err(e);
                }
            };
        let manager = Arc::new(manager);
        *self.piece_manager.lock() = Some(Arc::clone(&manager));

        let connected = self
            .registry
            .connect_all(self.config.network.connect_timeout)
            .await;
        if connected == 0 {
            tracing::warn!("No peer accepted a connection");
        }

        let tasks = manager.spawn(files, blocks, self.shutdown.subscribe());
        self.tasks.lock().extend(tasks);
        tracing::info!("Session started for {}", self.metadata.name);
        Ok(())
    }

    /// Signals shutdown, disconnects every peer and waits for the loops.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.registry.disconnect_all().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Session task ended abnormally: {}", e);
            }
        }
        tracing::info!("Session stopped for {}", self.metadata.name);
    }

    /// Resolves once every piece is on disk.
    ///
    /// # Errors
    /// - `TorrentError::InvalidSessionState` - Session was never started
    pub async fn wait_for_completion(&self) -> Result<(), TorrentError> {
        let manager = self.piece_manager.lock().clone();
        let Some(manager) = manager else {
            return Err(TorrentError::InvalidSessionState {
                reason: "session not started",
            });
        };

        let mut completion = manager.completion();
        completion
            .wait_for(|complete| *complete)
            .await
            .map_err(|_| TorrentError::InvalidSessionState {
                reason: "piece manager stopped",
            })?;
        Ok(())
    }

    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            completed_pieces: self.registry.local().completed_pieces(),
            total_pieces: self.metadata.piece_count(),
            connected_peers: self.registry.connected_peers().len(),
        }
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }
}
