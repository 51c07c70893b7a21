// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Control-plane messages and the transport seam.

use async_trait::async_trait;
use clustore_core::{Result, Snode};
use clustore_meta::{Bmd, Smap};
use serde::{Deserialize, Serialize};

/// Discovery response: the responder's metadata plus the voting flag.
///
/// A responder that is mid-election sets `vote_in_progress`; callers must
/// not commit any metadata learned from such a reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmapVoteMsg {
    /// True while the responder participates in a primary election.
    pub vote_in_progress: bool,
    /// The responder's cluster map, when it has one.
    pub smap: Option<Smap>,
    /// The responder's bucket metadata, when it has one.
    pub bmd: Option<Bmd>,
}

/// Request-vote message sent by an election candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Smap version the election was called at.
    pub epoch: i64,
    /// Daemon ID of the proposed primary.
    pub candidate_id: String,
}

/// A voter's ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ballot {
    /// Vote for the candidate.
    Yes,
    /// Vote against: the voter holds a newer Smap or already voted for a
    /// different candidate at this epoch.
    No,
}

/// Response to a vote request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    /// The ballot.
    pub vote: Ballot,
    /// Smap version held by the voter; lets the candidate detect that its
    /// own view is stale.
    pub smap_version: i64,
}

impl VoteReply {
    /// True for a yes ballot.
    #[must_use]
    pub fn is_yes(&self) -> bool {
        self.vote == Ballot::Yes
    }
}

/// Metadata push from the primary. Either object may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaSyncMsg {
    /// Cluster map to install.
    pub smap: Option<Smap>,
    /// Bucket metadata to install.
    pub bmd: Option<Bmd>,
}

/// Versions held by a receiver after applying a metadata push.
///
/// A version higher than what was sent tells the sender to pull.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetaSyncAck {
    /// Smap version the receiver now holds.
    pub smap_version: i64,
    /// BMD version the receiver now holds.
    pub bmd_version: i64,
}

/// Heartbeat sent between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beat {
    /// Daemon ID of the sender.
    pub sender_id: String,
    /// Smap version held by the sender.
    pub smap_version: i64,
}

/// Heartbeat reply, carrying the responder's Smap version so stale peers
/// are re-synced on the next round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BeatAck {
    /// Smap version held by the responder.
    pub smap_version: i64,
}

/// Join request posted by a node entering the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReq {
    /// Descriptor of the joining node.
    pub node: Snode,
    /// Cluster UUID the joiner was configured with, if any; validated
    /// against the cluster's identity when present.
    pub cluster_uuid: Option<String>,
}

/// Transport used by every protocol in this crate.
///
/// The production implementation speaks JSON over the intra-control
/// endpoints; tests implement it with scripted in-process peers.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Discovery probe: fetch `{vote_in_progress, smap, bmd}` from a peer.
    async fn probe_meta(&self, node: &Snode) -> Result<SmapVoteMsg>;

    /// Ask a peer for its ballot.
    async fn request_vote(&self, node: &Snode, req: &VoteRequest) -> Result<VoteReply>;

    /// Push metadata to a peer; the reply carries the versions it holds.
    async fn push_meta(&self, node: &Snode, msg: &MetaSyncMsg) -> Result<MetaSyncAck>;

    /// Send a heartbeat.
    async fn send_beat(&self, node: &Snode, beat: &Beat) -> Result<BeatAck>;

    /// Post a join request to a proxy; returns the Smap the joiner
    /// appears in.
    async fn join(&self, node: &Snode, req: &JoinReq) -> Result<Smap>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ballot_wire_format() {
        let reply = VoteReply { vote: Ballot::Yes, smap_version: 7 };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"vote\":\"yes\""));

        let back: VoteReply = serde_json::from_str("{\"vote\":\"no\",\"smap_version\":3}").unwrap();
        assert!(!back.is_yes());
        assert_eq!(back.smap_version, 3);
    }

    #[test]
    fn test_smap_vote_msg_defaults() {
        let msg: SmapVoteMsg = serde_json::from_str("{\"vote_in_progress\":true}").unwrap();
        assert!(msg.vote_in_progress);
        assert!(msg.smap.is_none());
        assert!(msg.bmd.is_none());
    }
}
