// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Join, maintenance, and decommission transitions.
//!
//! All three are Smap transitions with identical propagation semantics:
//! the primary validates, stamps `version + 1` through its owner (which
//! persists before the swap), then broadcasts the new map. Bucket
//! create/destroy rides the same path on the BMD side.

use std::sync::Arc;

use clustore_core::{Error, NodeFlags, Result, Snode};
use clustore_meta::{Bck, BmdOwner, BucketProps, Smap, SmapOwner};
use tracing::info;

use crate::msg::{JoinReq, MetaSyncMsg};
use crate::propagate::Propagator;

/// Primary-side cluster-map and bucket transitions.
pub struct Membership {
    local_id: String,
    smap: Arc<SmapOwner>,
    bmd: Arc<BmdOwner>,
    propagator: Arc<Propagator>,
}

impl Membership {
    /// Creates the transition handler for the node `local_id`.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        smap: Arc<SmapOwner>,
        bmd: Arc<BmdOwner>,
        propagator: Arc<Propagator>,
    ) -> Self {
        Self { local_id: local_id.into(), smap, bmd, propagator }
    }

    fn ensure_primary(&self) -> Result<Arc<Smap>> {
        let smap = self.smap.get();
        if !smap.is_primary(&self.local_id) {
            return Err(Error::InvalidRequest(format!(
                "{} is not the primary (primary is '{}')",
                self.local_id, smap.primary_id
            )));
        }
        Ok(smap)
    }

    /// Admits a node into the cluster and broadcasts the new map.
    ///
    /// Re-joining with an identical descriptor is idempotent and returns
    /// the current map without a version bump.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRequest` on a duplicate daemon ID with different
    ///   endpoints, a malformed descriptor, or when called off-primary.
    /// - `Error::ClusterIdentity` when the joiner carries a different
    ///   cluster UUID.
    pub async fn join(&self, req: JoinReq) -> Result<Arc<Smap>> {
        let cur = self.ensure_primary()?;
        req.node.validate()?;
        if let Some(uuid) = &req.cluster_uuid {
            if uuid != &cur.uuid {
                return Err(Error::ClusterIdentity {
                    expected: cur.uuid.clone(),
                    got: uuid.clone(),
                });
            }
        }
        if let Some(existing) = cur.get_node(&req.node.id) {
            if *existing == req.node {
                info!(node = %req.node, "already joined, returning current map");
                return Ok(cur);
            }
            return Err(Error::InvalidRequest(format!(
                "daemon ID {} already registered with different endpoints",
                req.node.id
            )));
        }

        let node = req.node.clone();
        let new = self.smap.modify(move |cur| {
            let mut next = cur.clone();
            next.version += 1;
            next.put_node(node)?;
            Ok(next)
        })?;
        info!(node = %req.node, version = new.version, "node joined");
        self.broadcast_smap(&new).await;
        Ok(new)
    }

    /// Flags a node under maintenance. It keeps its Smap entry but is
    /// skipped for new work.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` for an unknown daemon ID, the primary
    /// itself, or when called off-primary.
    pub async fn start_maintenance(&self, id: &str) -> Result<Arc<Smap>> {
        let cur = self.ensure_primary()?;
        if cur.is_primary(id) {
            return Err(Error::InvalidRequest(
                "cannot place the primary under maintenance; set a new primary first".into(),
            ));
        }
        let new = self.set_flags(id, |flags| flags.with(NodeFlags::MAINTENANCE)).await?;
        info!(daemon = id, version = new.version, "maintenance started");
        Ok(new)
    }

    /// Clears the maintenance flag.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` for an unknown daemon ID or off-primary.
    pub async fn stop_maintenance(&self, id: &str) -> Result<Arc<Smap>> {
        self.ensure_primary()?;
        let new = self.set_flags(id, |flags| flags.without(NodeFlags::MAINTENANCE)).await?;
        info!(daemon = id, version = new.version, "maintenance stopped");
        Ok(new)
    }

    /// Removes a node from the cluster map and broadcasts. The removed
    /// node receives the new map too, which is its signal to shut down
    /// its workers.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` for an unknown daemon ID, the primary
    /// itself, or off-primary.
    pub async fn decommission(&self, id: &str) -> Result<Arc<Smap>> {
        let cur = self.ensure_primary()?;
        if cur.is_primary(id) {
            return Err(Error::InvalidRequest(
                "cannot decommission the primary; set a new primary first".into(),
            ));
        }
        let Some(removed) = cur.get_node(id).cloned() else {
            return Err(Error::InvalidRequest(format!("unknown daemon ID '{id}'")));
        };

        let target = id.to_string();
        let new = self.smap.modify(move |cur| {
            let mut next = cur.clone();
            next.version += 1;
            next.remove_node(&target);
            Ok(next)
        })?;
        info!(daemon = id, version = new.version, "node decommissioned");

        self.broadcast_smap(&new).await;
        // best-effort farewell push so the removed node learns its fate
        let msg = MetaSyncMsg { smap: Some((*new).clone()), bmd: None };
        let _ = self.propagator.sync_to(std::slice::from_ref(&removed), &msg).await;
        Ok(new)
    }

    /// Designates `id` as the new primary without an election (operator
    /// override). The target must be an electable proxy not under
    /// maintenance.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` when the target is unknown, not electable,
    /// under maintenance, or when called off-primary.
    pub async fn set_primary(&self, id: &str) -> Result<Arc<Smap>> {
        let cur = self.ensure_primary()?;
        match cur.pmap.get(id) {
            None => {
                return Err(Error::InvalidRequest(format!("'{id}' is not a known proxy")));
            }
            Some(node) if !node.is_electable() => {
                return Err(Error::InvalidRequest(format!("proxy '{id}' is not electable")));
            }
            Some(node) if node.in_maintenance() => {
                return Err(Error::InvalidRequest(format!("proxy '{id}' is under maintenance")));
            }
            Some(_) => {}
        }

        let target = id.to_string();
        let new = self.smap.modify(move |cur| {
            let mut next = cur.clone();
            next.version += 1;
            next.primary_id = target;
            Ok(next)
        })?;
        info!(primary = id, version = new.version, "primary designated");
        self.broadcast_smap(&new).await;
        Ok(new)
    }

    /// Creates a bucket and broadcasts the new BMD.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` when the bucket exists or off-primary.
    pub async fn create_bucket(&self, bck: Bck, props: BucketProps) -> Result<()> {
        self.ensure_primary()?;
        let insert = bck.clone();
        let new = self.bmd.modify(move |cur| {
            let mut next = cur.clone();
            next.version += 1;
            next.add_bucket(insert, props)?;
            Ok(next)
        })?;
        info!(bucket = %bck, version = new.version, "bucket created");
        self.broadcast_bmd().await;
        Ok(())
    }

    /// Destroys a bucket and broadcasts the new BMD.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` when the bucket does not exist or
    /// off-primary.
    pub async fn destroy_bucket(&self, bck: &Bck) -> Result<()> {
        self.ensure_primary()?;
        let remove = bck.clone();
        let new = self.bmd.modify(move |cur| {
            let mut next = cur.clone();
            if next.del_bucket(&remove).is_none() {
                return Err(Error::InvalidRequest(format!("bucket {remove} does not exist")));
            }
            next.version += 1;
            Ok(next)
        })?;
        info!(bucket = %bck, version = new.version, "bucket destroyed");
        self.broadcast_bmd().await;
        Ok(())
    }

    async fn set_flags(
        &self,
        id: &str,
        apply: impl FnOnce(NodeFlags) -> NodeFlags + Send,
    ) -> Result<Arc<Smap>> {
        let target = id.to_string();
        let new = self.smap.modify(move |cur| {
            let mut next = cur.clone();
            let node = next
                .pmap
                .get_mut(&target)
                .or_else(|| next.tmap.get_mut(&target))
                .ok_or_else(|| Error::InvalidRequest(format!("unknown daemon ID '{target}'")))?;
            node.flags = apply(node.flags);
            next.version += 1;
            Ok(next)
        })?;
        self.broadcast_smap(&new).await;
        Ok(new)
    }

    async fn broadcast_smap(&self, new: &Smap) {
        let msg = MetaSyncMsg { smap: Some(new.clone()), bmd: None };
        self.propagator.sync(new, &msg).await;
    }

    async fn broadcast_bmd(&self) {
        let smap = self.smap.get();
        let msg = MetaSyncMsg { smap: None, bmd: Some((*self.bmd.get()).clone()) };
        self.propagator.sync(&smap, &msg).await;
    }
}
