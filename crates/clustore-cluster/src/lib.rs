// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Cluster membership and metadata convergence for Clustore.
//!
//! This crate provides:
//! - Keepalive tracker with bounded-latency peer-death detection
//! - Discovery ("uncover"): bootstrap to the best known Smap/BMD
//! - Primary election with proxy-quorum voting
//! - Primary-driven metadata propagation with pull-toward-max
//! - Join / maintenance / decommission cluster-map transitions
//!
//! # Architecture
//!
//! The design is monotonic + quorum-converging, not consensus-log based:
//! every node pulls metadata toward the maximum version it observes, the
//! primary is the only writer, and a new primary is chosen by a strict
//! majority of proxies when the old one stops answering heartbeats.
//!
//! All network traffic goes through the [`ControlPlane`] trait so tests
//! can drive every protocol with scripted in-process peers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod discovery;
pub mod keepalive;
pub mod membership;
pub mod msg;
pub mod propagate;
pub mod vote;

pub use discovery::{MetaSet, Uncover};
pub use keepalive::{KeepaliveEvent, KeepaliveTracker, PeerState, TrackerConfig};
pub use membership::Membership;
pub use msg::{
    Ballot, Beat, BeatAck, ControlPlane, JoinReq, MetaSyncAck, MetaSyncMsg, SmapVoteMsg,
    VoteReply, VoteRequest,
};
pub use propagate::{Propagator, SyncOutcome};
pub use vote::{Election, VoteConfig, VoteState};
