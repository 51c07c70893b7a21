//! The cluster map.
//!
//! An Smap is an immutable snapshot of cluster membership: every proxy,
//! every target, and the primary designation, tagged with a strictly
//! increasing version and the cluster UUID. Ordering across the cluster
//! relies entirely on the version number; there are no wall-clock
//! comparisons anywhere in the map.

use std::collections::HashMap;

use clustore_core::{Error, NodeRole, Result, Snode};
use serde::{Deserialize, Serialize};

use crate::VersionedMeta;

/// Versioned snapshot of cluster membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Smap {
    /// Monotonic version, strictly increasing on every committed change.
    pub version: i64,
    /// Cluster-lifetime identifier, fixed at cluster creation.
    pub uuid: String,
    /// Proxies by daemon ID.
    pub pmap: HashMap<String, Snode>,
    /// Targets by daemon ID.
    pub tmap: HashMap<String, Snode>,
    /// Daemon ID of the primary proxy; must be a key of `pmap`.
    pub primary_id: String,
}

impl Smap {
    /// The empty, version-0 map ("no cluster yet").
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the version-0 map, which is never merged or propagated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    /// Total node count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.pmap.len() + self.tmap.len()
    }

    /// Number of proxies.
    #[must_use]
    pub fn count_proxies(&self) -> usize {
        self.pmap.len()
    }

    /// Number of targets.
    #[must_use]
    pub fn count_targets(&self) -> usize {
        self.tmap.len()
    }

    /// Proxies not flagged maintenance or decommissioning.
    #[must_use]
    pub fn count_active_proxies(&self) -> usize {
        self.pmap.values().filter(|n| !n.in_maintenance()).count()
    }

    /// Looks a node up in either map.
    #[must_use]
    pub fn get_node(&self, id: &str) -> Option<&Snode> {
        self.pmap.get(id).or_else(|| self.tmap.get(id))
    }

    /// The primary's descriptor, when the map has one.
    #[must_use]
    pub fn primary(&self) -> Option<&Snode> {
        self.pmap.get(&self.primary_id)
    }

    /// True if `id` is the primary.
    #[must_use]
    pub fn is_primary(&self, id: &str) -> bool {
        !self.primary_id.is_empty() && self.primary_id == id
    }

    /// Ballots needed for a strict majority of proxies.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.count_proxies() / 2 + 1
    }

    /// Electable, non-maintenance proxies ordered for an election:
    /// ascending daemon ID, current primary excluded.
    ///
    /// This list answers "who may run for primary", nothing else. It is
    /// NOT the vote-request recipient list: requests fan out to every
    /// node in the map via [`Smap::nodes_except`], the current primary
    /// included.
    #[must_use]
    pub fn election_candidates(&self) -> Vec<&Snode> {
        let mut cands: Vec<&Snode> = self
            .pmap
            .values()
            .filter(|n| n.is_electable() && !n.in_maintenance() && n.id != self.primary_id)
            .collect();
        cands.sort_by(|a, b| a.id.cmp(&b.id));
        cands
    }

    /// Every node except `exclude`, for control-plane broadcasts.
    #[must_use]
    pub fn nodes_except(&self, exclude: &str) -> Vec<&Snode> {
        self.pmap
            .values()
            .chain(self.tmap.values())
            .filter(|n| n.id != exclude)
            .collect()
    }

    /// Inserts a node into the map it belongs to by role.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` if the ID is already present in the
    /// opposite map.
    pub fn put_node(&mut self, node: Snode) -> Result<()> {
        let (own, other) = match node.role {
            NodeRole::Proxy => (&mut self.pmap, &self.tmap),
            NodeRole::Target => (&mut self.tmap, &self.pmap),
        };
        if other.contains_key(&node.id) {
            return Err(Error::InvalidRequest(format!(
                "daemon ID {} already registered with the opposite role",
                node.id
            )));
        }
        own.insert(node.id.clone(), node);
        Ok(())
    }

    /// Removes a node from whichever map holds it.
    pub fn remove_node(&mut self, id: &str) -> Option<Snode> {
        self.pmap.remove(id).or_else(|| self.tmap.remove(id))
    }
}

impl VersionedMeta for Smap {
    const TAG: &'static str = "smap";

    fn version(&self) -> i64 {
        self.version
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.uuid.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "smap v{} committed without a cluster UUID",
                self.version
            )));
        }
        if !self.pmap.contains_key(&self.primary_id) {
            return Err(Error::InvalidRequest(format!(
                "smap v{}: primary '{}' not in the proxy map",
                self.version, self.primary_id
            )));
        }
        for id in self.pmap.keys() {
            if self.tmap.contains_key(id) {
                return Err(Error::InvalidRequest(format!(
                    "smap v{}: daemon ID {id} present in both maps",
                    self.version
                )));
            }
        }
        Ok(())
    }
}
