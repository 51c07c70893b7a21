// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Daemon wiring: identity, owners, startup sequence, and the background
//! event loop.
//!
//! Startup follows the order every node in the cluster observes: load
//! persisted metadata, uncover the best known Smap/BMD from the bootstrap
//! candidates, then either join the primary found there or, for a lone
//! electable proxy with nothing to join, declare itself the genesis
//! primary.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clustore_api::{control_router, ControlClient, ControlState};
use clustore_cluster::{
    ControlPlane, Election, JoinReq, KeepaliveEvent, KeepaliveTracker, Membership, MetaSyncMsg,
    Propagator, TrackerConfig, Uncover, VoteConfig,
};
use clustore_core::{Config, Error, NetEndpoint, NodeFlags, NodeRole, Result, Snode};
use clustore_meta::{Bmd, BmdOwner, MetaStore, Smap, SmapOwner};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One Clustore daemon.
pub struct Node {
    cfg: Config,
    state: ControlState,
}

impl Node {
    /// Builds the daemon: resolves the identity, loads persisted
    /// metadata, and wires the cluster components together. No network
    /// traffic happens here.
    pub fn init(cfg: Config) -> Result<Self> {
        let store = if cfg.node.mountpaths.is_empty() {
            None
        } else {
            Some(MetaStore::new(cfg.node.mountpaths.clone(), cfg.node.copies)?)
        };

        let id = resolve_daemon_id(&cfg, store.as_ref())?;
        let endpoint =
            NetEndpoint::new(cfg.server.bind.ip().to_string(), cfg.server.bind.port());
        let mut local = Snode::new(id.clone(), cfg.node.role, endpoint);
        if cfg.node.role == NodeRole::Proxy && cfg.proxy.non_electable {
            local.flags = local.flags.without(NodeFlags::ELECTABLE);
        }
        info!(node = %local, "daemon identity resolved");

        let smap_initial = match &store {
            Some(store) => store.load::<Smap>()?.unwrap_or_default(),
            None => Smap::new(),
        };
        let bmd_initial = match &store {
            Some(store) => store.load::<Bmd>()?.unwrap_or_default(),
            None => Bmd::new(),
        };
        if !smap_initial.is_empty() {
            info!(version = smap_initial.version, "loaded persisted cluster map");
        }
        let smap = Arc::new(match store.clone() {
            Some(store) => SmapOwner::with_store(smap_initial, store),
            None => SmapOwner::new(smap_initial),
        });
        let bmd = Arc::new(match store {
            Some(store) => BmdOwner::with_store(bmd_initial, store),
            None => BmdOwner::new(bmd_initial),
        });

        let client: Arc<dyn ControlPlane> =
            Arc::new(ControlClient::new(cfg.timeouts.cplane_operation)?);

        let election = Arc::new(Election::new(
            local.clone(),
            smap.clone(),
            client.clone(),
            VoteConfig {
                startup_time: cfg.timeouts.startup_time,
                cplane_operation: cfg.timeouts.cplane_operation,
                backoff_base: Duration::from_millis(500),
            },
        ));
        // installing any new map concludes an election on this node
        {
            let election = election.clone();
            smap.subscribe(Box::new(move |_, _| election.on_smap_installed()));
        }

        let propagator = Arc::new(Propagator::new(
            &id,
            client.clone(),
            cfg.timeouts.cplane_operation,
            cfg.keepalive.retry_factor,
        ));
        let membership =
            Arc::new(Membership::new(&id, smap.clone(), bmd.clone(), propagator));

        let ka = match cfg.node.role {
            NodeRole::Proxy => &cfg.keepalive.proxy,
            NodeRole::Target => &cfg.keepalive.target,
        };
        let keepalive = Arc::new(KeepaliveTracker::new(
            &id,
            TrackerConfig {
                interval: ka.interval,
                factor: ka.factor,
                timeout_factor: cfg.keepalive.timeout_factor,
                retry_factor: cfg.keepalive.retry_factor,
                max_keepalive: cfg.timeouts.max_keepalive,
            },
            smap.clone(),
            client.clone(),
        ));

        let state = ControlState {
            local,
            smap,
            bmd,
            election,
            membership,
            keepalive,
            client,
            started: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        Ok(Self { cfg, state })
    }

    /// The control-plane router for this daemon.
    #[must_use]
    pub fn router(&self) -> Router {
        control_router(self.state.clone())
    }

    /// This node's descriptor.
    #[must_use]
    pub fn local(&self) -> &Snode {
        &self.state.local
    }

    /// Runs the startup sequence, then starts keepalive and the event
    /// loop. The control-plane listener must already be serving so peers
    /// can push metadata back to us.
    ///
    /// # Errors
    ///
    /// Surfaces discovery, join, and genesis failures; all are fatal for
    /// the starting daemon.
    pub async fn start(&self) -> Result<()> {
        let candidates = self.bootstrap_candidates();
        if !candidates.is_empty() {
            info!(count = candidates.len(), "uncovering cluster metadata");
            let uncover =
                Uncover::new(self.state.client.clone(), self.cfg.timeouts.cplane_operation);
            let meta = uncover.uncover(&candidates, self.cfg.timeouts.startup_time).await;
            if let Some(found) = meta.smap {
                match self.state.smap.put(found) {
                    Ok(_) | Err(Error::StaleUpdate { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if let Some(found) = meta.bmd {
                match self.state.bmd.put(found) {
                    Ok(_) | Err(Error::StaleUpdate { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let smap = self.state.smap.get();
        if smap.is_empty() {
            self.genesis()?;
        } else if smap.get_node(&self.state.local.id).is_none() {
            self.join_cluster().await?;
        }

        self.state.started.store(true, Ordering::SeqCst);
        self.state.keepalive.start();
        self.spawn_event_loop();
        info!(
            version = self.state.smap.get().version,
            primary = %self.state.smap.get().primary_id,
            "node started"
        );
        Ok(())
    }

    /// Candidate set for discovery: every node in the persisted map plus
    /// the configured bootstrap URLs.
    fn bootstrap_candidates(&self) -> Vec<Snode> {
        let smap = self.state.smap.get();
        let mut candidates: Vec<Snode> =
            smap.nodes_except(&self.state.local.id).into_iter().cloned().collect();
        for (idx, url) in self.cfg.proxy.candidate_urls().iter().enumerate() {
            match url_to_snode(url, idx) {
                Ok(node) => {
                    if !candidates.contains(&node)
                        && node.intra_control_net != self.state.local.intra_control_net
                    {
                        candidates.push(node);
                    }
                }
                Err(e) => warn!(url, error = %e, "skipping malformed bootstrap URL"),
            }
        }
        candidates
    }

    /// Declares this node the genesis primary of a brand-new cluster.
    fn genesis(&self) -> Result<()> {
        if !self.state.local.is_electable() {
            return Err(Error::NoElectableProxy);
        }
        let cluster_uuid = Uuid::new_v4().simple().to_string();
        let mut smap = Smap {
            version: 1,
            uuid: cluster_uuid.clone(),
            primary_id: self.state.local.id.clone(),
            ..Smap::new()
        };
        smap.put_node(self.state.local.clone())?;
        self.state.smap.put(smap)?;

        let bmd =
            Bmd { version: 1, uuid: Uuid::new_v4().simple().to_string(), ..Bmd::new() };
        self.state.bmd.put(bmd)?;
        info!(cluster_uuid = %cluster_uuid, "bootstrapped as genesis primary");
        Ok(())
    }

    /// Joins the cluster through its primary and blocks until this node
    /// sees itself in a map it receives back.
    async fn join_cluster(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.cfg.timeouts.startup_time;
        loop {
            let smap = self.state.smap.get();
            let Some(primary) = smap.primary().cloned() else {
                return Err(Error::Transient("no primary in the uncovered map".into()));
            };
            let req = JoinReq {
                node: self.state.local.clone(),
                cluster_uuid: Some(smap.uuid.clone()),
            };
            match self.state.client.join(&primary, &req).await {
                Ok(new) => {
                    match self.state.smap.put(new) {
                        Ok(_) | Err(Error::StaleUpdate { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    if self.state.smap.get().get_node(&self.state.local.id).is_some() {
                        info!(primary = %primary, "joined cluster");
                        return Ok(());
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(primary = %primary, error = %e, "join attempt failed, retrying");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Transient("join did not complete in time".into()));
            }
            tokio::time::sleep(self.cfg.timeouts.cplane_operation).await;
        }
    }

    /// Reacts to keepalive events: elections on primary death, pulls when
    /// a peer is ahead, re-sends when a peer lags behind the primary.
    fn spawn_event_loop(&self) {
        let state = self.state.clone();
        let cplane = self.cfg.timeouts.cplane_operation;
        let retry_factor = self.cfg.keepalive.retry_factor;
        let mut events = self.state.keepalive.subscribe();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    KeepaliveEvent::PeerDead { id } => {
                        let smap = state.smap.get();
                        if smap.is_primary(&id) && state.local.is_electable() {
                            warn!(primary = %id, "primary dead, campaigning");
                            run_election(&state, cplane, retry_factor).await;
                        }
                    }
                    KeepaliveEvent::PeerAhead { id, smap_version } => {
                        info!(peer = %id, version = smap_version, "peer is ahead, pulling");
                        pull_from(&state, &id).await;
                    }
                    KeepaliveEvent::PeerLagging { id, smap_version } => {
                        let smap = state.smap.get();
                        if smap.is_primary(&state.local.id) {
                            info!(peer = %id, version = smap_version, "re-syncing laggard");
                            resend_to(&state, &id, cplane, retry_factor).await;
                        }
                    }
                    KeepaliveEvent::PeerAlive { .. } | KeepaliveEvent::PeerSuspect { .. } => {}
                }
            }
        });
    }
}

async fn run_election(state: &ControlState, cplane: Duration, retry_factor: u32) {
    match state.election.campaign().await {
        Ok(new) => {
            let propagator =
                Propagator::new(&state.local.id, state.client.clone(), cplane, retry_factor);
            let msg = MetaSyncMsg {
                smap: Some((*new).clone()),
                bmd: Some((*state.bmd.get()).clone()),
            };
            propagator.sync(&new, &msg).await;
        }
        Err(Error::QuorumFailure { epoch, yes, needed }) => {
            warn!(epoch, yes, needed, "election failed, waiting for the next candidate");
        }
        Err(e) => error!(error = %e, "election aborted"),
    }
}

/// Pulls a peer's metadata and applies it; versions only move forward,
/// so a racing update cannot regress us.
async fn pull_from(state: &ControlState, id: &str) {
    let smap = state.smap.get();
    let Some(node) = smap.get_node(id).cloned() else { return };
    match state.client.probe_meta(&node).await {
        Ok(msg) if !msg.vote_in_progress => {
            if let Some(new) = msg.smap {
                if !new.is_empty() {
                    if let Err(e) = state.smap.put(new) {
                        if !matches!(e, Error::StaleUpdate { .. }) {
                            error!(peer = %id, error = %e, "failed to apply pulled smap");
                        }
                    }
                }
            }
            if let Some(new) = msg.bmd {
                if !new.is_empty() {
                    if let Err(e) = state.bmd.put(new) {
                        if !matches!(e, Error::StaleUpdate { .. }) {
                            error!(peer = %id, error = %e, "failed to apply pulled bmd");
                        }
                    }
                }
            }
        }
        Ok(_) => info!(peer = %id, "peer is voting, deferring pull"),
        Err(e) => warn!(peer = %id, error = %e, "pull failed"),
    }
}

async fn resend_to(state: &ControlState, id: &str, cplane: Duration, retry_factor: u32) {
    let smap = state.smap.get();
    let Some(node) = smap.get_node(id).cloned() else { return };
    let propagator =
        Propagator::new(&state.local.id, state.client.clone(), cplane, retry_factor);
    let msg = MetaSyncMsg {
        smap: Some((*smap).clone()),
        bmd: Some((*state.bmd.get()).clone()),
    };
    propagator.sync_to(std::slice::from_ref(&node), &msg).await;
}

fn resolve_daemon_id(cfg: &Config, store: Option<&MetaStore>) -> Result<String> {
    if !cfg.node.id.is_empty() {
        if let Some(store) = store {
            store.save_daemon_id(&cfg.node.id)?;
        }
        return Ok(cfg.node.id.clone());
    }
    if let Some(store) = store {
        if let Some(id) = store.load_daemon_id()? {
            return Ok(id);
        }
    }
    let prefix = match cfg.node.role {
        NodeRole::Proxy => 'p',
        NodeRole::Target => 't',
    };
    let id = format!("{prefix}{}", &Uuid::new_v4().simple().to_string()[..8]);
    if let Some(store) = store {
        store.save_daemon_id(&id)?;
    }
    info!(daemon_id = %id, "generated daemon ID");
    Ok(id)
}

/// Turns a bootstrap URL (`http://host:port`) into a probe-only
/// descriptor.
fn url_to_snode(url: &str, idx: usize) -> Result<Snode> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url)
        .trim_end_matches('/');
    let endpoint = NetEndpoint::parse(rest)?;
    Ok(Snode::new(format!("bootstrap-{idx}"), NodeRole::Proxy, endpoint))
}

#[cfg(test)]
mod tests {
    use clustore_core::config::NodeConfig;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_url_to_snode() {
        let node = url_to_snode("http://10.0.0.1:8080", 0).unwrap();
        assert_eq!(node.intra_control_net.host, "10.0.0.1");
        assert_eq!(node.intra_control_net.port, 8080);
        assert_eq!(node.id, "bootstrap-0");

        let node = url_to_snode("10.0.0.2:9090/", 1).unwrap();
        assert_eq!(node.intra_control_net.port, 9090);

        assert!(url_to_snode("http://nohost", 0).is_err());
    }

    #[test]
    fn test_resolve_daemon_id_precedence() {
        let tmp = TempDir::new().unwrap();
        let store =
            MetaStore::new(vec![tmp.path().join("mp1"), tmp.path().join("mp2")], 2).unwrap();

        // explicit config wins and is persisted
        let cfg = Config {
            node: NodeConfig { id: "p-explicit".into(), ..NodeConfig::default() },
            ..Config::default()
        };
        assert_eq!(resolve_daemon_id(&cfg, Some(&store)).unwrap(), "p-explicit");

        // without config, the persisted marker wins
        let cfg = Config::default();
        assert_eq!(resolve_daemon_id(&cfg, Some(&store)).unwrap(), "p-explicit");

        // without either, a fresh ID is generated with the role prefix
        let generated = resolve_daemon_id(&cfg, None).unwrap();
        assert!(generated.starts_with('p'));
        assert_ne!(generated, "p-explicit");
    }

    #[test]
    fn test_init_without_mountpaths() {
        let cfg = Config::default();
        let node = Node::init(cfg).unwrap();
        assert!(node.state.smap.get().is_empty());
        assert!(node.local().is_electable());
    }

    #[test]
    fn test_init_non_electable() {
        let mut cfg = Config::default();
        cfg.proxy.non_electable = true;
        let node = Node::init(cfg).unwrap();
        assert!(!node.local().is_electable());
    }

    #[tokio::test]
    async fn test_genesis_without_candidates() {
        let mut cfg = Config::default();
        cfg.node.id = "p1".into();
        let node = Node::init(cfg).unwrap();
        node.start().await.unwrap();

        let smap = node.state.smap.get();
        assert_eq!(smap.version, 1);
        assert_eq!(smap.primary_id, "p1");
        assert!(!smap.uuid.is_empty());
        assert_eq!(node.state.bmd.get().version, 1);
    }

    #[tokio::test]
    async fn test_non_electable_cannot_bootstrap() {
        let mut cfg = Config::default();
        cfg.proxy.non_electable = true;
        let node = Node::init(cfg).unwrap();
        assert!(matches!(node.start().await.unwrap_err(), Error::NoElectableProxy));
    }

    #[tokio::test]
    async fn test_target_cannot_bootstrap() {
        let mut cfg = Config::default();
        cfg.node.role = NodeRole::Target;
        let node = Node::init(cfg).unwrap();
        assert!(node.start().await.is_err());
    }
}
