// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Primary election.
//!
//! Triggered when the primary is declared dead by keepalive on a quorum
//! of proxies, or when a joining node finds no primary during discovery.
//! Candidates are the electable, non-maintenance proxies ordered by
//! ascending daemon ID; the first runs at `epoch = Smap.Version`, each
//! later one waits out a randomized backoff and runs at `epoch + rank`.
//!
//! A voter says yes iff its Smap version does not exceed the epoch and it
//! has not already said yes to a different candidate at that epoch; a
//! strict majority of proxies commits. Targets are consulted but only so
//! their replies can expose a higher Smap version, which aborts the round.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clustore_core::{Error, Result, Snode};
use clustore_meta::{Smap, SmapOwner};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::msg::{Ballot, ControlPlane, VoteReply, VoteRequest};

/// Per-node election state machine.
#[derive(Debug, Clone)]
pub enum VoteState {
    /// No election in sight.
    Idle,
    /// Participating in (or running) an election.
    Voting {
        /// Epoch of the election.
        epoch: i64,
        /// Candidate voted for or campaigning.
        candidate: String,
        /// When this node entered the state; the flag self-expires after
        /// `startup_time` so a crashed candidate cannot wedge the cluster.
        since: Instant,
    },
    /// A new primary was committed; resets to `Idle` once the new Smap
    /// is installed.
    Committed {
        /// The elected primary.
        primary: String,
    },
    /// The last round failed; behaves as `Idle`.
    Aborted,
}

/// Election tuning.
#[derive(Debug, Clone)]
pub struct VoteConfig {
    /// Bound on one election round, and the vote-in-progress expiry.
    pub startup_time: Duration,
    /// Deadline for a single vote request.
    pub cplane_operation: Duration,
    /// Base of the randomized backoff between candidate ranks.
    pub backoff_base: Duration,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            startup_time: Duration::from_secs(60),
            cplane_operation: Duration::from_secs(2),
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// Voter and candidate logic for one node.
pub struct Election {
    local: Snode,
    smap: Arc<SmapOwner>,
    cp: Arc<dyn ControlPlane>,
    cfg: VoteConfig,
    state: RwLock<VoteState>,
    // (epoch, candidate) of the last yes ballot; at most one yes per epoch.
    ballot: Mutex<Option<(i64, String)>>,
}

impl Election {
    /// Creates the election handler for `local`.
    #[must_use]
    pub fn new(
        local: Snode,
        smap: Arc<SmapOwner>,
        cp: Arc<dyn ControlPlane>,
        cfg: VoteConfig,
    ) -> Self {
        Self {
            local,
            smap,
            cp,
            cfg,
            state: RwLock::new(VoteState::Idle),
            ballot: Mutex::new(None),
        }
    }

    /// Snapshot of the state machine.
    #[must_use]
    pub fn state(&self) -> VoteState {
        self.state.read().clone()
    }

    /// True while this node participates in an unexpired election.
    /// Discovery responses carry this flag, and metadata mutations are
    /// refused while it is set.
    #[must_use]
    pub fn vote_in_progress(&self) -> bool {
        matches!(
            &*self.state.read(),
            VoteState::Voting { since, .. } if since.elapsed() < self.cfg.startup_time
        )
    }

    /// Resets the state machine; wired as a listener on the Smap owner so
    /// installing any new map concludes the election from this node's
    /// point of view.
    pub fn on_smap_installed(&self) {
        let mut state = self.state.write();
        if !matches!(&*state, VoteState::Idle) {
            *state = VoteState::Idle;
        }
    }

    /// Voter side: answers a vote request.
    ///
    /// Yes iff the local Smap version does not exceed the request epoch
    /// and no yes ballot was already cast for a different candidate at
    /// this epoch.
    pub fn on_vote_request(&self, req: &VoteRequest) -> VoteReply {
        let smap = self.smap.get();
        let mut ballot = self.ballot.lock();

        let already_committed = matches!(
            &*ballot,
            Some((epoch, candidate)) if *epoch == req.epoch && candidate != &req.candidate_id
        );
        let yes = smap.version <= req.epoch && !already_committed;

        if yes {
            *ballot = Some((req.epoch, req.candidate_id.clone()));
            *self.state.write() = VoteState::Voting {
                epoch: req.epoch,
                candidate: req.candidate_id.clone(),
                since: Instant::now(),
            };
            info!(epoch = req.epoch, candidate = %req.candidate_id, "voted yes");
        } else {
            info!(
                epoch = req.epoch,
                candidate = %req.candidate_id,
                local_version = smap.version,
                "voted no"
            );
        }
        VoteReply { vote: if yes { Ballot::Yes } else { Ballot::No }, smap_version: smap.version }
    }

    /// Candidate side: runs this node's campaign for the primaryship.
    ///
    /// Waits out the backoff owed to higher-ranked candidates, then runs
    /// one voting round. On a proxy majority the local node installs a
    /// version-bumped Smap naming itself primary and returns it; the
    /// caller is responsible for broadcasting it.
    ///
    /// # Errors
    ///
    /// - `Error::NoElectableProxy` when no candidate exists.
    /// - `Error::InvalidRequest` when this node is not an eligible
    ///   candidate.
    /// - `Error::QuorumFailure` when the round times out short of a
    ///   majority.
    /// - `Error::StaleUpdate` when a reply exposes a higher Smap version;
    ///   the caller must re-discover before retrying.
    pub async fn campaign(&self) -> Result<Arc<Smap>> {
        let smap = self.smap.get();
        let candidates = smap.election_candidates();
        if candidates.is_empty() {
            return Err(Error::NoElectableProxy);
        }
        let Some(rank) = candidates.iter().position(|n| n.id == self.local.id) else {
            return Err(Error::InvalidRequest(format!(
                "{} is not an election candidate",
                self.local
            )));
        };

        if rank > 0 {
            // Let better-ranked candidates go first; jitter keeps two
            // same-rank restarts from colliding.
            let jitter = rand::thread_rng().gen_range(0..=self.cfg.backoff_base.as_millis() as u64);
            let wait = self.cfg.backoff_base * rank as u32 + Duration::from_millis(jitter);
            tokio::time::sleep(wait).await;

            let fresh = self.smap.get();
            if fresh.version > smap.version {
                // Someone else committed while we waited.
                return Ok(fresh);
            }
        }

        let epoch = smap.version + rank as i64;
        self.run_round(&smap, epoch).await
    }

    async fn run_round(&self, smap: &Arc<Smap>, epoch: i64) -> Result<Arc<Smap>> {
        counter!("clustore_vote_rounds").increment(1);
        info!(epoch, candidate = %self.local.id, "starting election round");

        *self.state.write() = VoteState::Voting {
            epoch,
            candidate: self.local.id.clone(),
            since: Instant::now(),
        };
        // Cast our own ballot first so a competing candidate at this
        // epoch gets a no from us. The candidate is bound by the same
        // one-yes-per-epoch rule as any voter.
        {
            let mut ballot = self.ballot.lock();
            if matches!(&*ballot, Some((e, c)) if *e == epoch && c != &self.local.id) {
                *self.state.write() = VoteState::Aborted;
                return Err(Error::QuorumFailure { epoch, yes: 0, needed: smap.quorum() });
            }
            *ballot = Some((epoch, self.local.id.clone()));
        }

        let req = VoteRequest { epoch, candidate_id: self.local.id.clone() };
        // Only candidate selection excludes the current primary; the
        // request fan-out does not. Every known proxy and target gets
        // asked, the presumed-dead primary included: if it is in fact
        // alive behind a one-way partition, its reply carries a
        // current-or-higher version and aborts this round below. If it
        // is truly dead, the request times out like any other.
        let voters: Vec<Snode> =
            smap.nodes_except(&self.local.id).into_iter().cloned().collect();

        let mut requests = JoinSet::new();
        for node in voters {
            let cp = self.cp.clone();
            let req = req.clone();
            let per_request = self.cfg.cplane_operation;
            requests.spawn(async move {
                let reply =
                    tokio::time::timeout(per_request, cp.request_vote(&node, &req)).await;
                (node, reply)
            });
        }

        let quorum = smap.quorum();
        let yes = AtomicUsize::new(1); // self
        let round = tokio::time::timeout(self.cfg.startup_time, async {
            while let Some(joined) = requests.join_next().await {
                let Ok((node, reply)) = joined else { continue };
                let reply = match reply {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        warn!(voter = %node, error = %e, "vote request failed");
                        continue;
                    }
                    Err(_) => {
                        warn!(voter = %node, "vote request timed out");
                        continue;
                    }
                };
                if reply.smap_version > epoch {
                    return Err(Error::StaleUpdate {
                        tag: "smap",
                        have: epoch,
                        got: reply.smap_version,
                    });
                }
                if node.is_proxy() && reply.is_yes() {
                    let count = yes.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= quorum {
                        return Ok(());
                    }
                }
            }
            if yes.load(Ordering::SeqCst) >= quorum {
                Ok(())
            } else {
                Err(Error::QuorumFailure {
                    epoch,
                    yes: yes.load(Ordering::SeqCst),
                    needed: quorum,
                })
            }
        })
        .await;

        let outcome = match round {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::QuorumFailure {
                epoch,
                yes: yes.load(Ordering::SeqCst),
                needed: quorum,
            }),
        };
        if let Err(e) = outcome {
            warn!(epoch, error = %e, "election round failed");
            counter!("clustore_vote_failures").increment(1);
            *self.state.write() = VoteState::Aborted;
            return Err(e);
        }

        let new = self.smap.modify(|cur| {
            if cur.version > epoch {
                return Err(Error::StaleUpdate { tag: "smap", have: cur.version, got: epoch });
            }
            let mut next = cur.clone();
            next.version += 1;
            next.primary_id = self.local.id.clone();
            Ok(next)
        })?;

        info!(epoch, version = new.version, primary = %self.local.id, "election won");
        counter!("clustore_vote_wins").increment(1);
        *self.state.write() = VoteState::Committed { primary: self.local.id.clone() };
        Ok(new)
    }
}
