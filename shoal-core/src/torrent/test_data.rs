//! Test data creation for torrent testing.
//!
//! Provides standardized torrent metadata, peer contexts and a scripted
//! remote handshake for tests across torrent-related modules.

use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, mpsc};

use super::parsing::TorrentFile;
use super::peer_connection::{PeerConnection, PeerContext, PieceBlock};
use super::peer_registry::LocalPeer;
use super::protocol::{HANDSHAKE_LENGTH, HandshakeCodec, MAX_FRAME_LENGTH, PeerHandshake, PeerId};
use super::{InfoHash, TorrentMetadata};

pub const TEST_INFO_HASH: InfoHash = InfoHash([1u8; 20]);

/// Creates single-file metadata where piece `i` is filled with byte `i + 1`.
pub fn create_metadata(piece_length: u32, total_length: u64) -> TorrentMetadata {
    let content = create_test_content(piece_length, total_length);
    let piece_hashes = content
        .chunks(piece_length as usize)
        .map(|piece| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(piece));
            hash
        })
        .collect();

    TorrentMetadata {
        info_hash: TEST_INFO_HASH,
        name: "test.txt".to_string(),
        piece_length,
        piece_hashes,
        total_length,
        files: vec![TorrentFile {
            path: vec!["test.txt".to_string()],
            length: total_length,
        }],
        multi_file: false,
        announce_urls: vec!["http://tracker.example.com/announce".to_string()],
    }
}

/// Content matching [`create_metadata`]; bytes are non-zero everywhere.
pub fn create_test_content(piece_length: u32, total_length: u64) -> Vec<u8> {
    (0..total_length)
        .map(|offset| (offset / piece_length as u64) as u8 + 1)
        .collect()
}

/// Creates a 3-piece torrent with 32 KiB pieces.
pub fn create_test_torrent_metadata() -> TorrentMetadata {
    create_metadata(32768, 3 * 32768)
}

/// Two files, 20 and 12 bytes, with 16-byte pieces: piece 1 spans both.
pub fn create_multi_file_metadata() -> TorrentMetadata {
    TorrentMetadata {
        info_hash: TEST_INFO_HASH,
        name: "album".to_string(),
        piece_length: 16,
        piece_hashes: vec![[0u8; 20]; 2],
        total_length: 32,
        files: vec![
            TorrentFile {
                path: vec!["a.bin".to_string()],
                length: 20,
            },
            TorrentFile {
                path: vec!["disc".to_string(), "b.bin".to_string()],
                length: 12,
            },
        ],
        multi_file: true,
        announce_urls: Vec::new(),
    }
}

/// Creates a peer context for [`TEST_INFO_HASH`] and the receiving end of
/// its block queue.
pub fn create_test_context(piece_count: usize) -> (PeerContext, mpsc::Receiver<PieceBlock>) {
    let (block_sender, receiver) = mpsc::channel(16);
    let local_peer_id = PeerId::generate("-SH0001-");
    let context = PeerContext {
        info_hash: TEST_INFO_HASH,
        local_peer_id,
        piece_count,
        local: Arc::new(LocalPeer::new(piece_count)),
        block_sender,
        activity: Arc::new(Notify::new()),
        max_frame_length: MAX_FRAME_LENGTH,
    };
    (context, receiver)
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Plays the remote side of the handshake: reads ours, answers with a
/// matching one.
pub async fn handshake_peer<S>(stream: &mut S, info_hash: InfoHash)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    stream.read_exact(&mut buf).await.unwrap();
    let reply = PeerHandshake::new(info_hash, PeerId::new([9u8; 20]));
    stream
        .write_all(&HandshakeCodec::serialize_handshake(&reply))
        .await
        .unwrap();
}

/// Attaches an in-memory stream to `peer` and completes the handshake.
///
/// Returns the remote end, positioned after our handshake.
pub async fn attach_ready_peer(peer: &Arc<PeerConnection>) -> DuplexStream {
    let (local, mut remote) = tokio::io::duplex(256 * 1024);
    peer.attach(local).await.unwrap();
    handshake_peer(&mut remote, TEST_INFO_HASH).await;
    assert!(wait_until(|| peer.is_ready()).await);
    remote
}
