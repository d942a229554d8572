//! End-to-end downloads against scripted seeding peers on loopback.

use std::net::SocketAddr;
use std::time::Duration;

use sha1::{Digest, Sha1};
use shoal_core::config::ShoalConfig;
use shoal_core::torrent::{InfoHash, Session, TorrentFile, TorrentMetadata};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PIECE_LENGTH: u32 = 32768;
const INFO_HASH: [u8; 20] = [7u8; 20];

/// Non-zero bytes, distinct per piece.
fn payload(total_length: usize) -> Vec<u8> {
    (0..total_length)
        .map(|i| ((i / PIECE_LENGTH as usize) * 7 + i % 251) as u8 | 1)
        .collect()
}

fn metadata_for(content: &[u8]) -> TorrentMetadata {
    let piece_hashes = content
        .chunks(PIECE_LENGTH as usize)
        .map(|piece| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(piece));
            hash
        })
        .collect();

    TorrentMetadata {
        info_hash: InfoHash::new(INFO_HASH),
        name: "payload.bin".to_string(),
        piece_length: PIECE_LENGTH,
        piece_hashes,
        total_length: content.len() as u64,
        files: vec![TorrentFile {
            path: vec!["payload.bin".to_string()],
            length: content.len() as u64,
        }],
        multi_file: false,
        announce_urls: vec!["http://tracker.invalid/announce".to_string()],
    }
}

/// Spawns a peer that serves `pieces` of `content` to every connection.
///
/// Unchokes after Interested and answers each Request with a Piece.
async fn spawn_seeder(content: Vec<u8>, pieces: Vec<u32>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let content = content.clone();
            let pieces = pieces.clone();
            tokio::spawn(async move {
                let _ = serve(stream, &content, &pieces).await;
            });
        }
    });
    address
}

async fn serve(mut stream: TcpStream, content: &[u8], pieces: &[u32]) -> std::io::Result<()> {
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await?;
    assert_eq!(&handshake[..20], b"\x13BitTorrent protocol");
    assert_eq!(&handshake[28..48], &INFO_HASH);

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&INFO_HASH);
    reply.extend_from_slice(b"-XX0001-seeder000000");
    stream.write_all(&reply).await?;

    let piece_count = content.len().div_ceil(PIECE_LENGTH as usize);
    let mut bits = vec![0u8; piece_count.div_ceil(8)];
    for &piece in pieces {
        bits[piece as usize / 8] |= 0x80 >> (piece % 8);
    }
    write_frame(&mut stream, 5, &bits).await?;

    loop {
        let length = stream.read_u32().await? as usize;
        if length == 0 {
            continue;
        }
        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame).await?;

        match frame[0] {
            // Interested
            2 => write_frame(&mut stream, 1, &[]).await?,
            // Request
            6 => {
                let field = |at: usize| u32::from_be_bytes(frame[at..at + 4].try_into().unwrap());
                let (index, begin, block_length) = (field(1), field(5), field(9));
                assert!(pieces.contains(&index), "asked for piece {index} we never had");

                let start = (index * PIECE_LENGTH + begin) as usize;
                let end = (start + block_length as usize).min(content.len());
                let mut body = Vec::with_capacity(8 + end - start);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&content[start..end]);
                write_frame(&mut stream, 7, &body).await?;
            }
            _ => {}
        }
    }
}

async fn write_frame(stream: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    stream.write_u32(payload.len() as u32 + 1).await?;
    stream.write_u8(id).await?;
    stream.write_all(payload).await
}

#[tokio::test]
async fn test_download_from_single_seeder() {
    let temp_dir = tempfile::tempdir().unwrap();
    let content = payload(PIECE_LENGTH as usize * 2 + 1000);
    let seeder = spawn_seeder(content.clone(), vec![0, 1, 2]).await;

    let config = ShoalConfig::for_testing(temp_dir.path().to_path_buf());
    let session = Session::new(config, metadata_for(&content), vec![seeder]);
    session.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), session.wait_for_completion())
        .await
        .expect("download did not finish")
        .unwrap();
    session.stop().await;

    let progress = session.progress();
    assert_eq!(progress.completed_pieces, 3);
    assert_eq!(progress.ratio(), 1.0);

    let written = std::fs::read(temp_dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn test_download_split_across_seeders() {
    let temp_dir = tempfile::tempdir().unwrap();
    let content = payload(PIECE_LENGTH as usize * 3);
    let first = spawn_seeder(content.clone(), vec![0, 2]).await;
    let second = spawn_seeder(content.clone(), vec![1]).await;

    let config = ShoalConfig::for_testing(temp_dir.path().to_path_buf());
    let session = Session::new(config, metadata_for(&content), vec![first, second]);
    session.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), session.wait_for_completion())
        .await
        .expect("download did not finish")
        .unwrap();
    session.stop().await;

    let written = std::fs::read(temp_dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn test_unreachable_peer_does_not_block_start() {
    let temp_dir = tempfile::tempdir().unwrap();
    let content = payload(PIECE_LENGTH as usize);

    // Bind then drop to get a port nobody listens on
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let seeder = spawn_seeder(content.clone(), vec![0]).await;

    let config = ShoalConfig::for_testing(temp_dir.path().to_path_buf());
    let session = Session::new(config, metadata_for(&content), vec![closed, seeder]);
    session.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), session.wait_for_completion())
        .await
        .expect("download did not finish")
        .unwrap();
    assert_eq!(session.progress().connected_peers, 1);
    session.stop().await;
}
