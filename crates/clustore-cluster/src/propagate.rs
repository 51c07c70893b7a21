// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Primary-driven metadata propagation.
//!
//! Only the primary sends. The snapshot is durable locally before the
//! first send (the owner persists on `modify`), so a partial broadcast is
//! never rolled back: nodes that missed the push are flagged lagging and
//! keepalive drives their catch-up, while any reply exposing a higher
//! version tells the sender that it is the one to pull.

use std::sync::Arc;
use std::time::Duration;

use clustore_core::Snode;
use clustore_meta::Smap;
use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::msg::{ControlPlane, MetaSyncAck, MetaSyncMsg};

/// Result of one broadcast.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Nodes that acknowledged the push.
    pub acked: Vec<String>,
    /// Nodes that exhausted their retries; keepalive re-sends on the
    /// next heartbeat reply.
    pub lagging: Vec<String>,
    /// Highest versions reported by any receiver above what was sent,
    /// if any; the sender must pull toward them.
    pub newer: Option<MetaSyncAck>,
}

/// Broadcasts metadata to the cluster on behalf of the primary.
pub struct Propagator {
    local_id: String,
    cp: Arc<dyn ControlPlane>,
    cplane_operation: Duration,
    retry_factor: u32,
}

impl Propagator {
    /// Creates a propagator. `cplane_operation` bounds each send attempt
    /// and caps the retry backoff; `retry_factor` is the number of extra
    /// attempts per node.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        cp: Arc<dyn ControlPlane>,
        cplane_operation: Duration,
        retry_factor: u32,
    ) -> Self {
        Self { local_id: local_id.into(), cp, cplane_operation, retry_factor }
    }

    /// Sends `msg` to every node of `smap` except the local one,
    /// concurrently, with per-node bounded retry.
    pub async fn sync(&self, smap: &Smap, msg: &MetaSyncMsg) -> SyncOutcome {
        let recipients: Vec<Snode> =
            smap.nodes_except(&self.local_id).into_iter().cloned().collect();
        self.sync_to(&recipients, msg).await
    }

    /// Sends `msg` to an explicit recipient list. Used by the broadcast
    /// path and by the keepalive-driven re-send to a single laggard.
    pub async fn sync_to(&self, recipients: &[Snode], msg: &MetaSyncMsg) -> SyncOutcome {
        let sent_smap = msg.smap.as_ref().map_or(0, |s| s.version);
        let sent_bmd = msg.bmd.as_ref().map_or(0, |b| b.version);

        let mut sends = JoinSet::new();
        for node in recipients {
            let cp = self.cp.clone();
            let node = node.clone();
            let msg = msg.clone();
            let attempts = self.retry_factor + 1;
            let op_deadline = self.cplane_operation;
            sends.spawn(async move {
                let mut backoff = Duration::from_millis(100);
                for attempt in 0..attempts {
                    let reply =
                        tokio::time::timeout(op_deadline, cp.push_meta(&node, &msg)).await;
                    match reply {
                        Ok(Ok(ack)) => return (node, Some(ack)),
                        Ok(Err(e)) if !e.is_transient() => {
                            warn!(peer = %node, error = %e, "metadata push rejected");
                            return (node, None);
                        }
                        Ok(Err(e)) => {
                            debug!(peer = %node, attempt, error = %e, "metadata push failed");
                        }
                        Err(_) => {
                            debug!(peer = %node, attempt, "metadata push timed out");
                        }
                    }
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(op_deadline);
                    }
                }
                (node, None)
            });
        }

        let mut outcome = SyncOutcome::default();
        while let Some(joined) = sends.join_next().await {
            let Ok((node, ack)) = joined else { continue };
            match ack {
                Some(ack) => {
                    counter!("clustore_metasync_acked", "to" => node.id.clone()).increment(1);
                    if ack.smap_version > sent_smap || ack.bmd_version > sent_bmd {
                        let newer = outcome.newer.get_or_insert(ack);
                        newer.smap_version = newer.smap_version.max(ack.smap_version);
                        newer.bmd_version = newer.bmd_version.max(ack.bmd_version);
                    }
                    outcome.acked.push(node.id);
                }
                None => {
                    counter!("clustore_metasync_lagging", "to" => node.id.clone()).increment(1);
                    warn!(peer = %node, "peer missed metadata push, flagging as lagging");
                    outcome.lagging.push(node.id);
                }
            }
        }
        debug!(
            smap_version = sent_smap,
            bmd_version = sent_bmd,
            acked = outcome.acked.len(),
            lagging = outcome.lagging.len(),
            "metadata broadcast finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use clustore_core::{Error, NetEndpoint, NodeRole, Result};
    use dashmap::DashMap;
    use parking_lot::RwLock;

    use super::*;
    use crate::msg::{Beat, BeatAck, JoinReq, SmapVoteMsg, VoteReply, VoteRequest};

    /// Records pushes; per-peer behavior: fail N times, or report a
    /// higher version.
    struct RecordingPlane {
        pushes: DashMap<String, u32>,
        fail_first: DashMap<String, AtomicU32>,
        report_version: RwLock<Option<(i64, i64)>>,
    }

    impl RecordingPlane {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pushes: DashMap::new(),
                fail_first: DashMap::new(),
                report_version: RwLock::new(None),
            })
        }
    }

    #[async_trait]
    impl ControlPlane for RecordingPlane {
        async fn probe_meta(&self, _: &Snode) -> Result<SmapVoteMsg> {
            unimplemented!()
        }

        async fn request_vote(&self, _: &Snode, _: &VoteRequest) -> Result<VoteReply> {
            unimplemented!()
        }

        async fn push_meta(&self, node: &Snode, msg: &MetaSyncMsg) -> Result<MetaSyncAck> {
            *self.pushes.entry(node.id.clone()).or_insert(0) += 1;
            if let Some(budget) = self.fail_first.get(&node.id) {
                if budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(Error::Transient("connection refused".into()));
                }
            }
            if let Some((sv, bv)) = *self.report_version.read() {
                return Ok(MetaSyncAck { smap_version: sv, bmd_version: bv });
            }
            Ok(MetaSyncAck {
                smap_version: msg.smap.as_ref().map_or(0, |s| s.version),
                bmd_version: msg.bmd.as_ref().map_or(0, |b| b.version),
            })
        }

        async fn send_beat(&self, _: &Snode, _: &Beat) -> Result<BeatAck> {
            unimplemented!()
        }

        async fn join(&self, _: &Snode, _: &JoinReq) -> Result<Smap> {
            unimplemented!()
        }
    }

    fn smap_with(ids: &[&str]) -> Smap {
        let mut smap =
            Smap { version: 3, uuid: "u-1".into(), primary_id: "p1".into(), ..Smap::new() };
        for id in ids {
            let role = if id.starts_with('p') { NodeRole::Proxy } else { NodeRole::Target };
            smap.put_node(Snode::new(*id, role, NetEndpoint::new("127.0.0.1", 8080))).unwrap();
        }
        smap
    }

    fn propagator(plane: Arc<RecordingPlane>) -> Propagator {
        Propagator::new("p1", plane, Duration::from_millis(200), 2)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_but_self() {
        let plane = RecordingPlane::new();
        let smap = smap_with(&["p1", "p2", "t1"]);
        let msg = MetaSyncMsg { smap: Some(smap.clone()), bmd: None };

        let outcome = propagator(plane.clone()).sync(&smap, &msg).await;
        assert_eq!(outcome.acked.len(), 2);
        assert!(outcome.lagging.is_empty());
        assert!(!plane.pushes.contains_key("p1"));
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let plane = RecordingPlane::new();
        plane.fail_first.insert("p2".into(), AtomicU32::new(2));
        let smap = smap_with(&["p1", "p2"]);
        let msg = MetaSyncMsg { smap: Some(smap.clone()), bmd: None };

        let outcome = propagator(plane.clone()).sync(&smap, &msg).await;
        assert_eq!(outcome.acked, vec!["p2".to_string()]);
        assert_eq!(*plane.pushes.get("p2").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_flag_laggard_without_rollback() {
        let plane = RecordingPlane::new();
        plane.fail_first.insert("p2".into(), AtomicU32::new(100));
        let smap = smap_with(&["p1", "p2", "t1"]);
        let msg = MetaSyncMsg { smap: Some(smap.clone()), bmd: None };

        let outcome = propagator(plane.clone()).sync(&smap, &msg).await;
        assert_eq!(outcome.lagging, vec!["p2".to_string()]);
        assert_eq!(outcome.acked, vec!["t1".to_string()]);
        // three attempts: initial + retry_factor
        assert_eq!(*plane.pushes.get("p2").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_newer_version_in_ack_reported() {
        let plane = RecordingPlane::new();
        *plane.report_version.write() = Some((9, 0));
        let smap = smap_with(&["p1", "p2"]);
        let msg = MetaSyncMsg { smap: Some(smap.clone()), bmd: None };

        let outcome = propagator(plane).sync(&smap, &msg).await;
        let newer = outcome.newer.expect("newer version visible");
        assert_eq!(newer.smap_version, 9);
    }

    #[tokio::test]
    async fn test_single_laggard_resend() {
        let plane = RecordingPlane::new();
        let smap = smap_with(&["p1", "p2", "p3"]);
        let msg = MetaSyncMsg { smap: Some(smap.clone()), bmd: None };
        let laggard = vec![smap.get_node("p3").unwrap().clone()];

        let outcome = propagator(plane.clone()).sync_to(&laggard, &msg).await;
        assert_eq!(outcome.acked, vec!["p3".to_string()]);
        assert!(!plane.pushes.contains_key("p2"));
    }
}
