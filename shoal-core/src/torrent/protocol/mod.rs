//! BitTorrent wire protocol types, codecs and framing.
//!
//! Message types and handshake layout follow BEP 3. The codecs are pure
//! byte transforms; [`MessageReader`] and [`MessageWriter`] apply them to
//! any async byte stream.

pub mod handshake;
pub mod messages;
pub mod stream;
pub mod types;

pub use handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
pub use messages::MessageCodec;
pub use stream::{MAX_FRAME_LENGTH, MessageReader, MessageWriter, frame_limit};
pub use types::{PROTOCOL_NAME, PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_test::io::Builder;

    use super::*;
    use crate::torrent::{InfoHash, PieceIndex, TorrentError};

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-SH0001-");
        assert_eq!(&peer_id.as_bytes()[..8], b"-SH0001-");

        let peer_id2 = PeerId::generate("-SH0001-");
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        let serialized = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(serialized.len(), HANDSHAKE_LENGTH);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], PROTOCOL_NAME.as_bytes());
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &[1u8; 20]);
        assert_eq!(&serialized[48..68], &[2u8; 20]);

        let deserialized = HandshakeCodec::deserialize_handshake(&serialized).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_handshake_rejects_unknown_protocol() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        let mut serialized = HandshakeCodec::serialize_handshake(&handshake);
        serialized[1] = b'X';

        assert!(matches!(
            HandshakeCodec::deserialize_handshake(&serialized),
            Err(TorrentError::ProtocolError { .. })
        ));
        assert!(HandshakeCodec::deserialize_handshake(&serialized[..67]).is_err());
    }

    #[test]
    fn test_message_serialization() {
        let test_cases = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(42),
            },
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000]),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(10),
                offset: 16384,
                length: 16384,
            },
            PeerMessage::Piece {
                piece_index: PieceIndex::new(2),
                offset: 0,
                data: Bytes::from_static(&[1, 2, 3, 4, 5]),
            },
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(10),
                offset: 0,
                length: 16384,
            },
            PeerMessage::Port { port: 6881 },
        ];

        for original_message in test_cases {
            let serialized = MessageCodec::serialize_message(&original_message);
            let deserialized = MessageCodec::deserialize_message(&serialized).unwrap();
            assert_eq!(original_message, deserialized);
        }
    }

    #[test]
    fn test_request_wire_bytes() {
        let message = PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 0,
            length: 16384,
        };

        assert_eq!(
            MessageCodec::serialize_message(&message),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_malformed_messages_rejected() {
        // Have with a 3-byte payload
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 4, 4, 0, 0, 1]).is_err());
        // Unknown id
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 1, 20]).is_err());
        // Length prefix longer than the data
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0]).is_err());
        // Choke with trailing payload
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 2, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_reader_decodes_stream() {
        let handshake = PeerHandshake::new(InfoHash::new([7u8; 20]), PeerId::new([8u8; 20]));
        let unchoke = MessageCodec::serialize_message(&PeerMessage::Unchoke);
        let have = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(3),
        });

        let mock = Builder::new()
            .read(&HandshakeCodec::serialize_handshake(&handshake))
            .read(&[0, 0, 0, 0])
            .read(&unchoke)
            .read(&have)
            .build();
        let mut reader = MessageReader::new(mock);

        assert_eq!(reader.read_handshake().await.unwrap(), handshake);
        assert_eq!(reader.read_message().await.unwrap(), PeerMessage::KeepAlive);
        assert_eq!(reader.read_message().await.unwrap(), PeerMessage::Unchoke);
        assert_eq!(
            reader.read_message().await.unwrap(),
            PeerMessage::Have {
                piece_index: PieceIndex::new(3)
            }
        );
        assert!(matches!(
            reader.read_message().await,
            Err(TorrentError::PeerConnectionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_reader_rejects_oversized_frame() {
        let length = (MAX_FRAME_LENGTH + 1).to_be_bytes();
        let mock = Builder::new().read(&length).build();
        let mut reader = MessageReader::new(mock);

        assert!(matches!(
            reader.read_message().await,
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_frame_limit_follows_block_length() {
        assert_eq!(frame_limit(16384, 100), MAX_FRAME_LENGTH);
        assert_eq!(frame_limit(262_144, 100), 262_153);
        assert_eq!(frame_limit(16384, 8 * 200_000), 200_001);
        assert_eq!(frame_limit(u32::MAX, 1), u32::MAX);
    }

    #[tokio::test]
    async fn test_reader_accepts_configured_block_length() {
        let block_length = 262_144u32;
        let piece = MessageCodec::serialize_message(&PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: Bytes::from(vec![5u8; block_length as usize]),
        });
        assert_eq!(piece.len(), 4 + block_length as usize + 9);

        let mock = Builder::new().read(&piece).build();
        let mut reader = MessageReader::with_frame_limit(mock, frame_limit(block_length, 1));
        match reader.read_message().await.unwrap() {
            PeerMessage::Piece { data, .. } => assert_eq!(data.len(), block_length as usize),
            other => panic!("unexpected message {other:?}"),
        }

        // The default limit would have torn the connection down
        let mock = Builder::new().read(&piece[..4]).build();
        let mut reader = MessageReader::new(mock);
        assert!(matches!(
            reader.read_message().await,
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_frames_messages() {
        let message = PeerMessage::Interested;
        let mock = Builder::new()
            .write(&MessageCodec::serialize_message(&message))
            .build();
        let mut writer = MessageWriter::new(mock);

        writer.write_message(&message).await.unwrap();
    }
}
