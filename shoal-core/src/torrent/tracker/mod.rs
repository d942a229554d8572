//! BitTorrent tracker communication.
//!
//! HTTP tracker client following BEP 3 announce. Supports compact and
//! dictionary peer lists.

pub mod client;
pub mod types;

pub use client::HttpTrackerClient;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
