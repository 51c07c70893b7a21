// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Discovery: converge to the best known cluster metadata.
//!
//! A joining or restarting node polls a candidate set concurrently and
//! keeps the highest-version Smap and BMD it can see. Three rules shape
//! the result:
//!
//! - a version-0 object is "none yet" and never selected;
//! - any candidate still voting at the deadline vetoes the whole result
//!   (bootstrap must not commit a map learned mid-election);
//! - candidate errors are retried until the outer deadline, and the best
//!   successful responses seen so far win when the deadline expires.

use std::sync::Arc;
use std::time::Duration;

use clustore_core::Snode;
use clustore_meta::{Bmd, Smap};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::msg::{ControlPlane, SmapVoteMsg};

/// The metadata selected by one discovery run. `None` means no candidate
/// advertised a committed (version > 0) object.
#[derive(Debug, Clone, Default)]
pub struct MetaSet {
    /// Best cluster map observed.
    pub smap: Option<Smap>,
    /// Best bucket metadata observed.
    pub bmd: Option<Bmd>,
}

impl MetaSet {
    /// Folds one non-voting reply into the running maximum.
    ///
    /// Smap ties on version break toward the lexicographically greatest
    /// primary ID so that every caller picks the same winner.
    fn absorb(&mut self, msg: SmapVoteMsg) {
        if let Some(smap) = msg.smap {
            if !smap.is_empty() {
                let better = match &self.smap {
                    None => true,
                    Some(cur) => {
                        smap.version > cur.version
                            || (smap.version == cur.version && smap.primary_id > cur.primary_id)
                    }
                };
                if better {
                    self.smap = Some(smap);
                }
            }
        }
        if let Some(bmd) = msg.bmd {
            if !bmd.is_empty() {
                let better = match &self.bmd {
                    None => true,
                    Some(cur) => bmd.version > cur.version,
                };
                if better {
                    self.bmd = Some(bmd);
                }
            }
        }
    }
}

/// Bootstrap discovery over a candidate set.
pub struct Uncover {
    cp: Arc<dyn ControlPlane>,
    probe_timeout: Duration,
    retry_interval: Duration,
}

impl Uncover {
    /// Creates a discovery runner. `probe_timeout` bounds each individual
    /// candidate request (typically `cplane_operation`).
    #[must_use]
    pub fn new(cp: Arc<dyn ControlPlane>, probe_timeout: Duration) -> Self {
        Self { cp, probe_timeout, retry_interval: Duration::from_millis(50) }
    }

    /// Overrides the pause between polling rounds.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Polls `candidates` until every one answers without a vote in
    /// progress, or until `budget` expires.
    ///
    /// Returns the highest-version Smap and BMD observed, or an empty
    /// [`MetaSet`] when the candidate set is empty, when every candidate
    /// kept failing, or when any candidate was still voting at the end.
    pub async fn uncover(&self, candidates: &[Snode], budget: Duration) -> MetaSet {
        if candidates.is_empty() {
            return MetaSet::default();
        }
        let deadline = Instant::now() + budget;
        let mut best = MetaSet::default();
        let mut any_voting = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let per_probe = self.probe_timeout.min(deadline - now);

            let mut probes = JoinSet::new();
            for node in candidates {
                let cp = self.cp.clone();
                let node = node.clone();
                probes.spawn(async move {
                    let reply =
                        tokio::time::timeout(per_probe, cp.probe_meta(&node)).await;
                    (node.id, reply)
                });
            }

            any_voting = false;
            let mut all_ok = true;
            while let Some(joined) = probes.join_next().await {
                let Ok((id, reply)) = joined else { continue };
                match reply {
                    Ok(Ok(msg)) => {
                        if msg.vote_in_progress {
                            trace!(candidate = %id, "vote in progress, holding off");
                            any_voting = true;
                        } else {
                            best.absorb(msg);
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(candidate = %id, error = %e, "discovery probe failed");
                        all_ok = false;
                    }
                    Err(_) => {
                        warn!(candidate = %id, "discovery probe timed out");
                        all_ok = false;
                    }
                }
            }

            if all_ok && !any_voting {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }

        if any_voting {
            // A partial view learned mid-election must not be committed;
            // the caller waits and retries.
            debug!("discovery ended with a vote in progress");
            return MetaSet::default();
        }
        debug!(
            smap_version = best.smap.as_ref().map_or(0, |s| s.version),
            bmd_version = best.bmd.as_ref().map_or(0, |b| b.version),
            "discovery selected metadata"
        );
        best
    }
}
