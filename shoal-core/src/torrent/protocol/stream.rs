//! Framed reading and writing of wire messages over an async byte stream

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
use super::messages::MessageCodec;
use super::types::{PeerHandshake, PeerMessage};
use crate::torrent::TorrentError;

/// Default frame limit: a 128 KiB block plus the Piece header.
pub const MAX_FRAME_LENGTH: u32 = 128 * 1024 + 9;

/// Frame limit for a session requesting `block_length` byte blocks.
///
/// Never below [`MAX_FRAME_LENGTH`]; grows to fit a full requested block or
/// the bitfield of a `piece_count` piece torrent.
pub fn frame_limit(block_length: u32, piece_count: usize) -> u32 {
    let piece_frame = block_length.saturating_add(9);
    let bitfield_frame = u32::try_from(piece_count.div_ceil(8))
        .unwrap_or(u32::MAX)
        .saturating_add(1);
    MAX_FRAME_LENGTH.max(piece_frame).max(bitfield_frame)
}

/// Reads handshakes and length-prefixed messages from a peer stream.
pub struct MessageReader<R> {
    inner: R,
    max_frame_length: u32,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wraps the read side of a peer stream with the default frame limit.
    pub fn new(inner: R) -> Self {
        Self::with_frame_limit(inner, MAX_FRAME_LENGTH)
    }

    /// Wraps the read side of a peer stream, rejecting frames longer than
    /// `max_frame_length`.
    pub fn with_frame_limit(inner: R, max_frame_length: u32) -> Self {
        Self {
            inner,
            max_frame_length,
        }
    }

    /// Reads and decodes the fixed-size handshake.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Stream closed or read failed
    /// - `TorrentError::ProtocolError` - Malformed handshake
    pub async fn read_handshake(&mut self) -> Result<PeerHandshake, TorrentError> {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read handshake: {e}"),
            })?;

        HandshakeCodec::deserialize_handshake(&buf)
    }

    /// Reads and decodes the next message frame.
    ///
    /// Keep-alive frames are returned as [`PeerMessage::KeepAlive`].
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Stream closed or read failed
    /// - `TorrentError::ProtocolError` - Oversized or malformed frame
    pub async fn read_message(&mut self) -> Result<PeerMessage, TorrentError> {
        let mut length_buf = [0u8; 4];
        self.inner
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message length: {e}"),
            })?;

        let length = u32::from_be_bytes(length_buf);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if length > self.max_frame_length {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Frame of {length} bytes exceeds limit of {}",
                    self.max_frame_length
                ),
            });
        }

        let mut frame = vec![0u8; 4 + length as usize];
        frame[..4].copy_from_slice(&length_buf);
        self.inner
            .read_exact(&mut frame[4..])
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message payload: {e}"),
            })?;

        MessageCodec::deserialize_message(&frame)
    }
}

/// Encodes and writes handshakes and messages to a peer stream.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wraps the write side of a peer stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes our handshake.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn write_handshake(&mut self, handshake: &PeerHandshake) -> Result<(), TorrentError> {
        self.write_frame(&HandshakeCodec::serialize_handshake(handshake))
            .await
    }

    /// Writes one message frame.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn write_message(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.write_frame(&MessageCodec::serialize_message(message))
            .await
    }

    /// Closes the write side of the stream.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!("Error shutting down peer stream: {}", e);
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TorrentError> {
        self.inner
            .write_all(frame)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to send message: {e}"),
            })
    }
}
