//! BitTorrent metainfo (`.torrent`) parsing.
//!
//! Metadata extraction uses bencode-rs for decoding and sha1 for the info
//! hash. Consumers depend on the [`TorrentParser`] trait.

pub mod bencode;
pub mod parser;
pub mod types;

pub use parser::BencodeTorrentParser;
pub use types::{TorrentFile, TorrentMetadata, TorrentParser};
