// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Keepalive tracker: peer liveness with bounded detection latency.
//!
//! Each node runs one tracker per peer role (proxy-side and target-side
//! instances share this state machine). The tracker beats every
//! `interval`, and a peer that has not answered for `factor × interval`
//! becomes suspect and gets one extra probe; after
//! `timeout_factor × factor × interval` it is declared dead.
//!
//! Heartbeat replies carry the responder's Smap version, which is how
//! stale peers are caught: a reply below the local version means the peer
//! lags (the primary re-sends), a reply above it means *we* lag and must
//! pull.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clustore_core::Snode;
use clustore_meta::SmapOwner;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::msg::{Beat, BeatAck, ControlPlane};

/// Liveness state of a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Peer answers heartbeats.
    Alive,
    /// Peer missed `factor` beats; a probe is in flight.
    Suspect,
    /// Peer exceeded the full timeout window.
    Dead,
}

/// Events emitted by the tracker.
#[derive(Debug, Clone)]
pub enum KeepaliveEvent {
    /// Peer answered after being suspect or dead.
    PeerAlive {
        /// The peer's daemon ID.
        id: String,
    },
    /// Peer missed enough beats to be suspected.
    PeerSuspect {
        /// The peer's daemon ID.
        id: String,
    },
    /// Peer exceeded the timeout window.
    PeerDead {
        /// The peer's daemon ID.
        id: String,
    },
    /// Peer answered with a lower Smap version than ours; the primary
    /// re-sends metadata on this signal.
    PeerLagging {
        /// The peer's daemon ID.
        id: String,
        /// The stale version it reported.
        smap_version: i64,
    },
    /// Peer answered with a higher Smap version than ours; this node
    /// must pull.
    PeerAhead {
        /// The peer's daemon ID.
        id: String,
        /// The newer version it reported.
        smap_version: i64,
    },
}

/// Tracker tuning, resolved from the per-role config section.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Heartbeat period.
    pub interval: Duration,
    /// Missed beats before a peer is suspected.
    pub factor: u32,
    /// Extra multiplier past the suspect window before a peer is dead.
    pub timeout_factor: u32,
    /// Probe attempts for a suspected peer.
    pub retry_factor: u32,
    /// Upper bound on one probe exchange including retries.
    pub max_keepalive: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            factor: 3,
            timeout_factor: 3,
            retry_factor: 2,
            max_keepalive: Duration::from_secs(4),
        }
    }
}

impl TrackerConfig {
    fn suspect_window(&self) -> Duration {
        self.interval * self.factor
    }

    fn dead_window(&self) -> Duration {
        self.interval * self.factor * self.timeout_factor
    }
}

struct PeerRecord {
    last_ok: Instant,
    failures: u32,
    state: PeerState,
}

impl PeerRecord {
    fn fresh() -> Self {
        Self { last_ok: Instant::now(), failures: 0, state: PeerState::Alive }
    }
}

/// Per-node liveness monitor.
pub struct KeepaliveTracker {
    local_id: String,
    cfg: TrackerConfig,
    smap: Arc<SmapOwner>,
    cp: Arc<dyn ControlPlane>,
    peers: DashMap<String, PeerRecord>,
    event_tx: broadcast::Sender<KeepaliveEvent>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl KeepaliveTracker {
    /// Creates a tracker that monitors every node in the owner's Smap
    /// except the local one.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        cfg: TrackerConfig,
        smap: Arc<SmapOwner>,
        cp: Arc<dyn ControlPlane>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            local_id: local_id.into(),
            cfg,
            smap,
            cp,
            peers: DashMap::new(),
            event_tx,
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Subscribes to liveness events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<KeepaliveEvent> {
        self.event_tx.subscribe()
    }

    /// Current state of a tracked peer.
    #[must_use]
    pub fn peer_state(&self, id: &str) -> Option<PeerState> {
        self.peers.get(id).map(|r| r.state)
    }

    /// Handles an incoming heartbeat and replies with the local Smap
    /// version. The sender is marked alive; a sender ahead of us raises
    /// [`KeepaliveEvent::PeerAhead`].
    pub fn on_heartbeat(&self, beat: &Beat) -> BeatAck {
        let local_version = self.smap.get().version;
        self.mark_ok(&beat.sender_id);
        counter!("clustore_keepalive_received", "from" => beat.sender_id.clone()).increment(1);
        if beat.smap_version > local_version {
            let _ = self.event_tx.send(KeepaliveEvent::PeerAhead {
                id: beat.sender_id.clone(),
                smap_version: beat.smap_version,
            });
        }
        BeatAck { smap_version: local_version }
    }

    /// Runs one heartbeat round against every peer in the current Smap.
    pub async fn round(&self) {
        let smap = self.smap.get();
        let beat = Beat { sender_id: self.local_id.clone(), smap_version: smap.version };

        let peers: Vec<Snode> =
            smap.nodes_except(&self.local_id).into_iter().cloned().collect();
        self.prune(&peers);

        for node in &peers {
            self.peers.entry(node.id.clone()).or_insert_with(PeerRecord::fresh);
            match self.cp.send_beat(node, &beat).await {
                Ok(ack) => {
                    counter!("clustore_keepalive_sent", "to" => node.id.clone()).increment(1);
                    self.mark_ok(&node.id);
                    self.check_versions(&node.id, ack.smap_version, smap.version);
                }
                Err(e) => {
                    counter!("clustore_keepalive_errors", "to" => node.id.clone()).increment(1);
                    trace!(peer = %node.id, error = %e, "heartbeat failed");
                    if let Some(mut rec) = self.peers.get_mut(&node.id) {
                        rec.failures += 1;
                    }
                }
            }
        }
    }

    /// Applies the time-based transitions and probes newly suspected
    /// peers. Called after each round; split out so tests can drive it.
    pub async fn evaluate(&self) {
        let mut to_probe = Vec::new();
        let mut events = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let id = entry.key().clone();
            let rec = entry.value_mut();
            let elapsed = rec.last_ok.elapsed();
            let next = if elapsed >= self.cfg.dead_window() {
                PeerState::Dead
            } else if elapsed >= self.cfg.suspect_window() {
                PeerState::Suspect
            } else {
                PeerState::Alive
            };
            if next != rec.state {
                match next {
                    PeerState::Suspect => to_probe.push(id),
                    PeerState::Dead => events.push(KeepaliveEvent::PeerDead { id }),
                    PeerState::Alive => {}
                }
                if next != PeerState::Alive {
                    rec.state = next;
                }
            }
        }

        for event in events {
            if let KeepaliveEvent::PeerDead { id } = &event {
                warn!(peer = %id, "peer declared dead");
                gauge!("clustore_keepalive_peer_up", "peer" => id.clone()).set(0.0);
            }
            let _ = self.event_tx.send(event);
        }

        for id in to_probe {
            debug!(peer = %id, "peer suspected, probing");
            let _ = self.event_tx.send(KeepaliveEvent::PeerSuspect { id: id.clone() });
            if tokio::time::timeout(self.cfg.max_keepalive, self.probe(&id)).await.is_err() {
                warn!(peer = %id, "probe exceeded max_keepalive");
            }
        }
    }

    /// One extra exchange with a suspected peer, retried `retry_factor`
    /// times.
    async fn probe(&self, id: &str) {
        let smap = self.smap.get();
        let Some(node) = smap.get_node(id).cloned() else { return };
        let beat = Beat { sender_id: self.local_id.clone(), smap_version: smap.version };

        for _ in 0..self.cfg.retry_factor.max(1) {
            if let Ok(ack) = self.cp.send_beat(&node, &beat).await {
                self.mark_ok(id);
                self.check_versions(id, ack.smap_version, smap.version);
                return;
            }
        }
    }

    /// Starts the background heartbeat loop.
    pub fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.cfg.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.round().await;
                        tracker.evaluate().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("keepalive tracker shutting down");
                        break;
                    }
                }
            }
        });
        info!(
            local = %self.local_id,
            interval_ms = self.cfg.interval.as_millis(),
            "keepalive tracker started"
        );
    }

    /// Stops the background loop.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    fn mark_ok(&self, id: &str) {
        let mut rec = self.peers.entry(id.to_string()).or_insert_with(PeerRecord::fresh);
        let was = rec.state;
        rec.last_ok = Instant::now();
        rec.failures = 0;
        rec.state = PeerState::Alive;
        drop(rec);
        if was != PeerState::Alive {
            info!(peer = %id, "peer recovered");
            gauge!("clustore_keepalive_peer_up", "peer" => id.to_string()).set(1.0);
            let _ = self.event_tx.send(KeepaliveEvent::PeerAlive { id: id.to_string() });
        }
    }

    fn check_versions(&self, id: &str, theirs: i64, ours: i64) {
        if theirs < ours {
            let _ = self.event_tx.send(KeepaliveEvent::PeerLagging {
                id: id.to_string(),
                smap_version: theirs,
            });
        } else if theirs > ours {
            let _ = self.event_tx.send(KeepaliveEvent::PeerAhead {
                id: id.to_string(),
                smap_version: theirs,
            });
        }
    }

    /// Drops records for peers no longer in the Smap.
    fn prune(&self, peers: &[Snode]) {
        self.peers.retain(|id, _| peers.iter().any(|n| &n.id == id));
    }
}
