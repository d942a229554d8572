//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Message serialization utilities for BitTorrent wire protocol.
///
/// Every frame is a 4-byte big-endian length covering the rest of the frame,
/// a 1-byte message id and the id-specific payload.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
        }

        buf
    }

    /// Deserializes a complete frame (length prefix included) following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame, wrong payload size
    ///   for the message id, or unknown message id
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(TorrentError::ProtocolError {
                message: "Message too short".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if buf.len() < length {
            return Err(TorrentError::ProtocolError {
                message: "Incomplete message".to_string(),
            });
        }

        let message_id = buf.get_u8();
        let payload_len = length - 1;

        let expect_len = |expected: usize, name: &str| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(TorrentError::ProtocolError {
                    message: format!("Invalid {name} message length"),
                })
            }
        };

        match message_id {
            0 => expect_len(0, "Choke").map(|_| PeerMessage::Choke),
            1 => expect_len(0, "Unchoke").map(|_| PeerMessage::Unchoke),
            2 => expect_len(0, "Interested").map(|_| PeerMessage::Interested),
            3 => expect_len(0, "NotInterested").map(|_| PeerMessage::NotInterested),
            4 => {
                expect_len(4, "Have")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            5 => {
                let bitfield = Bytes::copy_from_slice(&buf[..payload_len]);
                Ok(PeerMessage::Bitfield { bitfield })
            }
            6 => {
                expect_len(12, "Request")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                })
            }
            7 => {
                if payload_len < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data = Bytes::copy_from_slice(&buf[..payload_len - 8]);
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                })
            }
            8 => {
                expect_len(12, "Cancel")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Cancel {
                    piece_index,
                    offset,
                    length,
                })
            }
            9 => {
                expect_len(2, "Port")?;
                let port = buf.get_u16();
                Ok(PeerMessage::Port { port })
            }
            _ => Err(TorrentError::ProtocolError {
                message: format!("Unknown message ID: {message_id}"),
            }),
        }
    }
}
