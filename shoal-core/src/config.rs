//! Centralized configuration for Shoal.
//!
//! Built once at startup and handed to the session, which passes the
//! relevant sections down to the peer registry and piece manager.

use std::path::PathBuf;
use std::time::Duration;

use crate::torrent::PeerId;

/// Central configuration for all Shoal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Azureus-style client prefix of our peer id
    pub client_id: &'static str,
    /// Our peer id, generated once per process
    pub peer_id: PeerId,
    /// Maximum bytes asked for in one request
    pub block_length: u32,
    /// Period of the requester's fallback tick
    pub requester_interval: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        let client_id = "-SH0001-";
        Self {
            client_id,
            peer_id: PeerId::generate(client_id),
            block_length: 16384, // 16 KiB
            requester_interval: Duration::from_millis(100),
        }
    }
}

/// Network communication and tracker configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port we listen on and report to the tracker
    pub listen_port: u16,
    /// Per-peer dial timeout
    pub connect_timeout: Duration,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Maximum peer addresses kept per torrent
    pub max_peer_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6882,
            connect_timeout: Duration::from_secs(2),
            tracker_timeout: Duration::from_secs(30),
            user_agent: "shoal/0.1.0",
            max_peer_connections: 50,
        }
    }
}

/// File storage and disk I/O configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory the torrent's files are written under
    pub download_dir: PathBuf,
    /// Capacity of the received-block queue between peers and the writer
    pub block_queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            block_queue_capacity: 64,
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_value::<u16>("SHOAL_LISTEN_PORT") {
            config.network.listen_port = port;
        }

        if let Some(millis) = env_value::<u64>("SHOAL_CONNECT_TIMEOUT_MS") {
            config.network.connect_timeout = Duration::from_millis(millis);
        }

        if let Some(max_peers) = env_value::<usize>("SHOAL_MAX_PEERS") {
            config.network.max_peer_connections = max_peers;
        }

        if let Some(block_length) = env_value::<u32>("SHOAL_BLOCK_LENGTH")
            && block_length > 0
        {
            config.torrent.block_length = block_length;
        }

        if let Ok(dir) = std::env::var("SHOAL_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration for tests: fast ticks, short timeouts.
    pub fn for_testing(download_dir: PathBuf) -> Self {
        let mut config = Self::default();
        config.network.connect_timeout = Duration::from_millis(500);
        config.torrent.requester_interval = Duration::from_millis(10);
        config.storage.download_dir = download_dir;
        config
    }
}

fn env_value<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
