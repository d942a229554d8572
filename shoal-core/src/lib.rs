//! Shoal Core - BitTorrent peer wire exchange and block acquisition
//!
//! This crate provides the building blocks of a BEP 3 download client: the
//! per-peer protocol state machine, the piece manager that schedules
//! requests and persists blocks, metainfo parsing, tracker announce and
//! configuration.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

pub use config::ShoalConfig;
pub use storage::StorageError;
pub use torrent::{Session, SessionProgress, TorrentError};

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Logging setup failed: {reason}")]
    Logging { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url }
                | TorrentError::TrackerTimeout { url } => {
                    format!("Could not reach tracker: {url}")
                }
                TorrentError::NoPeersAvailable => "No peers available for download".to_string(),
                TorrentError::Io(e) => format!("Could not read torrent: {e}"),
                _ => "Download error occurred".to_string(),
            },
            ShoalError::Storage(_) => "Could not write downloaded data".to_string(),
            ShoalError::Configuration { reason } => format!("Configuration error: {reason}"),
            ShoalError::Logging { reason } => format!("Logging setup failed: {reason}"),
            ShoalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let error = ShoalError::from(TorrentError::InvalidTorrentFile {
            reason: "Missing 'info' dictionary".to_string(),
        });
        assert_eq!(
            error.user_message(),
            "Invalid torrent file: Missing 'info' dictionary"
        );
        assert!(error.is_user_error());

        let error = ShoalError::from(TorrentError::NoPeersAvailable);
        assert_eq!(error.user_message(), "No peers available for download");
        assert!(!error.is_user_error());
    }

    #[test]
    fn test_storage_error_conversion() {
        let error = ShoalError::from(StorageError::NoFiles);
        assert!(matches!(error, ShoalError::Storage(StorageError::NoFiles)));
    }
}
