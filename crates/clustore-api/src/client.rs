//! Reqwest-based control-plane client.

use std::time::Duration;

use async_trait::async_trait;
use clustore_cluster::{
    Beat, BeatAck, ControlPlane, JoinReq, MetaSyncAck, MetaSyncMsg, SmapVoteMsg, VoteReply,
    VoteRequest,
};
use clustore_core::{Error, ErrorEnvelope, Result, Snode};
use clustore_meta::Smap;
use serde::de::DeserializeOwned;

/// HTTP client for the control-plane protocol.
///
/// Requests go to the peer's intra-control endpoint with a per-request
/// timeout of `cplane_operation`. A 503 is a retry signal and surfaces as
/// `Error::Transient`; any other non-2xx is fatal for the probe.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
}

impl ControlClient {
    /// Creates a client with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the underlying client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.map_err(|e| Error::Transient(format!("decoding: {e}")));
        }
        let message = match resp.json::<ErrorEnvelope>().await {
            Ok(envelope) => envelope.message,
            Err(_) => status.to_string(),
        };
        if status.as_u16() == 503 {
            Err(Error::Transient(message))
        } else {
            Err(Error::InvalidRequest(message))
        }
    }

    fn transport(e: reqwest::Error) -> Error {
        Error::Transient(e.to_string())
    }
}

#[async_trait]
impl ControlPlane for ControlClient {
    async fn probe_meta(&self, node: &Snode) -> Result<SmapVoteMsg> {
        let url = node.intra_control_net.url("/v1/daemon?what=smapvote");
        let resp = self.http.get(url).send().await.map_err(Self::transport)?;
        Self::decode(resp).await
    }

    async fn request_vote(&self, node: &Snode, req: &VoteRequest) -> Result<VoteReply> {
        let url = node.intra_control_net.url("/v1/vote");
        let resp = self.http.put(url).json(req).send().await.map_err(Self::transport)?;
        Self::decode(resp).await
    }

    async fn push_meta(&self, node: &Snode, msg: &MetaSyncMsg) -> Result<MetaSyncAck> {
        let url = node.intra_control_net.url("/v1/metasync");
        let resp = self.http.put(url).json(msg).send().await.map_err(Self::transport)?;
        Self::decode(resp).await
    }

    async fn send_beat(&self, node: &Snode, beat: &Beat) -> Result<BeatAck> {
        let url = node.intra_control_net.url("/v1/keepalive");
        let resp = self.http.post(url).json(beat).send().await.map_err(Self::transport)?;
        Self::decode(resp).await
    }

    async fn join(&self, node: &Snode, req: &JoinReq) -> Result<Smap> {
        let url = node.intra_control_net.url("/v1/cluster/join");
        let resp = self.http.post(url).json(req).send().await.map_err(Self::transport)?;
        Self::decode(resp).await
    }
}
