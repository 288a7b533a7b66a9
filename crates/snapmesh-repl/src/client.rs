//! HTTP client for talking to another node or cluster.

use std::io;
use std::time::Duration;

use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use snapmesh_zfs::{ByteReader, FromSnapshot};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::ReplError;
use crate::wire::{RpcRequest, RpcResponse};

/// Port nodes listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 6969;

/// Authenticated client for one peer.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    api_key: String,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl PeerClient {
    /// Client for `peer`, which is a host, `host:port`, or a full URL.
    pub fn new(
        peer: &str,
        user: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ReplError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: Self::base_url(peer),
            user: user.into(),
            api_key: api_key.into(),
        })
    }

    /// Normalises a peer address into a base URL.
    pub fn base_url(peer: &str) -> String {
        let peer = peer.trim_end_matches('/');
        if peer.starts_with("http://") || peer.starts_with("https://") {
            peer.to_string()
        } else if peer.contains(':') {
            format!("http://{peer}")
        } else {
            format!("http://{peer}:{DEFAULT_PORT}")
        }
    }

    fn stream_url(&self, filesystem_id: &str, from: &FromSnapshot, to_snapshot: &str) -> String {
        format!(
            "{}/filesystems/{}/{}/{}",
            self.base_url, filesystem_id, from, to_snapshot
        )
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ReplError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        Err(ReplError::PeerStatus {
            url,
            status: status.as_u16(),
            body,
        })
    }

    /// Calls an RPC method and decodes its result.
    pub async fn call<T: DeserializeOwned>(&self, request: &RpcRequest) -> Result<T, ReplError> {
        debug!(peer = %self.base_url, method = request.method(), "rpc call");
        let resp = self
            .http
            .post(format!("{}/rpc", self.base_url))
            .basic_auth(&self.user, Some(&self.api_key))
            .json(request)
            .send()
            .await?;
        let resp: RpcResponse = Self::check(resp).await?.json().await?;
        resp.into_result()
    }

    /// Opens a send stream served by the peer. The body starts with a prelude.
    pub async fn get_stream(
        &self,
        filesystem_id: &str,
        from: &FromSnapshot,
        to_snapshot: &str,
    ) -> Result<ByteReader, ReplError> {
        let url = self.stream_url(filesystem_id, from, to_snapshot);
        debug!(%url, "fetching stream");
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.api_key))
            .send()
            .await?;
        let stream = Self::check(resp)
            .await?
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    /// Uploads a framed stream (prelude followed by send bytes) to the peer.
    pub async fn post_stream(
        &self,
        filesystem_id: &str,
        from: &FromSnapshot,
        to_snapshot: &str,
        body: reqwest::Body,
    ) -> Result<(), ReplError> {
        let url = self.stream_url(filesystem_id, from, to_snapshot);
        debug!(%url, "posting stream");
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.api_key))
            .body(body)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapmesh_zfs::Origin;

    #[test]
    fn test_base_url_forms() {
        assert_eq!(PeerClient::base_url("hub"), "http://hub:6969");
        assert_eq!(PeerClient::base_url("hub:8080"), "http://hub:8080");
        assert_eq!(PeerClient::base_url("https://hub/"), "https://hub");
    }

    #[test]
    fn test_stream_url_uses_wire_from() {
        let client = PeerClient::new("127.0.0.1:7000", "admin", "k").unwrap();
        let from = FromSnapshot::CloneOrigin(Origin::new("fs1", "s1"));
        assert_eq!(
            client.stream_url("clone1", &from, "c1"),
            "http://127.0.0.1:7000/filesystems/clone1/fs1@s1/c1"
        );
    }

    #[test]
    fn test_debug_hides_api_key() {
        let client = PeerClient::new("hub", "admin", "topsecret").unwrap();
        assert!(!format!("{client:?}").contains("topsecret"));
    }
}
