//! HTTP tracker client implementation with URL building and response parsing

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use url::Url;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;

/// HTTP tracker client.
pub struct HttpTrackerClient {
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates a client using the network timeout and user agent.
    ///
    /// # Errors
    /// - `TorrentError::Http` - HTTP client could not be built
    pub fn new(config: &NetworkConfig) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self { client })
    }

    /// Builds the announce URL with BEP 3 query parameters.
    ///
    /// Binary fields are percent-encoded byte by byte; an existing query on
    /// the announce URL is kept.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - Announce URL is malformed
    /// - `TorrentError::TrackerConnectionFailed` - Scheme is not HTTP(S)
    pub fn build_announce_url(
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> Result<Url, TorrentError> {
        let mut url = Url::parse(announce_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TorrentError::TrackerConnectionFailed {
                url: format!("Unsupported tracker scheme: {announce_url}"),
            });
        }

        let params = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event={}",
            Self::url_encode_bytes(request.info_hash.as_bytes()),
            Self::url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.event.as_str()
        );
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{params}"),
            _ => params,
        };
        url.set_query(Some(&query));
        Ok(url)
    }

    /// URL encode bytes for tracker communication per RFC 3986.
    pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| format!("%{b:02X}")).collect()
    }

    /// Parse compact peer list: 4 address bytes then 2 port bytes per peer.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Length is not a multiple of 6
    pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
        if !peer_bytes.len().is_multiple_of(6) {
            return Err(TorrentError::ProtocolError {
                message: "Invalid compact peer data length".to_string(),
            });
        }

        Ok(peer_bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect())
    }

    /// Parse the original dictionary-form peer list; unparseable entries are
    /// skipped.
    fn parse_peer_dicts(entries: &[bencode_rs::Value<'_>]) -> Vec<SocketAddr> {
        entries
            .iter()
            .filter_map(|entry| {
                let bencode_rs::Value::Dictionary(peer) = entry else {
                    return None;
                };
                let Some(bencode_rs::Value::Bytes(ip)) = peer.get(b"ip".as_slice()) else {
                    return None;
                };
                let Some(bencode_rs::Value::Integer(port)) = peer.get(b"port".as_slice()) else {
                    return None;
                };
                let ip = std::str::from_utf8(ip).ok()?.parse().ok()?;
                Some(SocketAddr::new(ip, u16::try_from(*port).ok()?))
            })
            .collect()
    }

    /// Parse tracker response from bencode data.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFoundOnTracker` - Tracker sent a failure reason
    /// - `TorrentError::ProtocolError` - Malformed response
    pub fn parse_announce_response(
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed =
            bencode_rs::Value::parse(response_bytes).map_err(|e| TorrentError::ProtocolError {
                message: format!("Failed to parse tracker response: {e:?}"),
            })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::ProtocolError {
                message: "Invalid tracker response format".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(failure_reason)) =
            dict.get(b"failure reason".as_slice())
        {
            let reason = String::from_utf8_lossy(failure_reason);
            return Err(TorrentError::TorrentNotFoundOnTracker {
                url: format!("Tracker error: {reason}"),
            });
        }

        let interval =
            Self::integer(dict, b"interval").ok_or_else(|| TorrentError::ProtocolError {
                message: "Missing interval in tracker response".to_string(),
            })?;

        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => Self::parse_compact_peers(peer_data)?,
            Some(bencode_rs::Value::List(entries)) => Self::parse_peer_dicts(entries),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            min_interval: Self::integer(dict, b"min interval"),
            complete: Self::integer(dict, b"complete").unwrap_or(0),
            incomplete: Self::integer(dict, b"incomplete").unwrap_or(0),
            peers,
        })
    }

    fn integer(dict: &BencodeDict<'_>, key: &[u8]) -> Option<u32> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => u32::try_from(*value).ok(),
            _ => None,
        }
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let url = Self::build_announce_url(announce_url, request)?;
        tracing::debug!("Announcing to tracker: {}", announce_url);

        let response = self.client.get(url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", announce_url, e);
            if e.is_timeout() {
                TorrentError::TrackerTimeout {
                    url: announce_url.to_string(),
                }
            } else {
                TorrentError::TrackerConnectionFailed {
                    url: announce_url.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Tracker {} returned error status: {}", announce_url, status);
            return Err(match status.as_u16() {
                404 => TorrentError::TorrentNotFoundOnTracker {
                    url: announce_url.to_string(),
                },
                500..=599 => TorrentError::TrackerServerError {
                    url: announce_url.to_string(),
                    status: status.as_u16(),
                },
                _ => TorrentError::TrackerConnectionFailed {
                    url: announce_url.to_string(),
                },
            });
        }

        let response_bytes = response.bytes().await.map_err(|e| {
            tracing::warn!("Failed to read response body from {}: {}", announce_url, e);
            TorrentError::TrackerConnectionFailed {
                url: announce_url.to_string(),
            }
        })?;

        let announce = Self::parse_announce_response(&response_bytes)?;
        tracing::info!(
            "Tracker {} returned {} peers, interval {}s",
            announce_url,
            announce.peers.len(),
            announce.interval
        );
        Ok(announce)
    }
}
