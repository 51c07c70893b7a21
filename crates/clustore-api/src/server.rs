//! Control-plane router and handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use clustore_cluster::{
    Beat, ControlPlane, Election, JoinReq, KeepaliveTracker, Membership, MetaSyncAck,
    MetaSyncMsg, SmapVoteMsg, VoteReply, VoteRequest,
};
use clustore_core::{Error, Snode};
use clustore_meta::{Bck, BmdOwner, BucketProps, Smap, SmapOwner};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Shared state behind every control-plane handler.
#[derive(Clone)]
pub struct ControlState {
    /// This node's descriptor.
    pub local: Snode,
    /// Cluster-map owner.
    pub smap: Arc<SmapOwner>,
    /// Bucket-metadata owner.
    pub bmd: Arc<BmdOwner>,
    /// Election state machine.
    pub election: Arc<Election>,
    /// Primary-side cluster transitions.
    pub membership: Arc<Membership>,
    /// Liveness tracker answering heartbeats.
    pub keepalive: Arc<KeepaliveTracker>,
    /// Outbound transport, used to forward join requests to the primary.
    pub client: Arc<dyn ControlPlane>,
    /// Flips to true once startup (load + discovery) is done.
    pub started: Arc<AtomicBool>,
}

/// Error wrapper that renders the JSON envelope.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        (status, Json(self.0.envelope())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Builds the control-plane router.
pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/daemon", get(daemon))
        .route("/v1/vote", put(vote))
        .route("/v1/metasync", put(metasync))
        .route("/v1/keepalive", post(keepalive))
        .route("/v1/cluster/join", post(join))
        .route("/v1/cluster/maintenance/start", put(maintenance_start))
        .route("/v1/cluster/maintenance/stop", put(maintenance_stop))
        .route("/v1/cluster/decommission", put(decommission))
        .route("/v1/cluster/primary/:id", put(set_primary))
        .route("/v1/buckets", post(create_bucket))
        .route("/v1/buckets/:provider/:name", delete(destroy_bucket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn not_ready() -> ApiError {
    ApiError(Error::Transient("starting up".into()))
}

async fn health(State(state): State<ControlState>) -> ApiResult<StatusCode> {
    if !state.started.load(Ordering::SeqCst) {
        return Err(not_ready());
    }
    if state.election.vote_in_progress() {
        return Err(ApiError(Error::VoteInProgress));
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct WhatQuery {
    what: Option<String>,
}

async fn daemon(
    State(state): State<ControlState>,
    Query(query): Query<WhatQuery>,
) -> ApiResult<Response> {
    if !state.started.load(Ordering::SeqCst) {
        return Err(not_ready());
    }
    let what = query.what.as_deref().unwrap_or("smapvote");
    let resp = match what {
        "smap" => Json((*state.smap.get()).clone()).into_response(),
        "bmd" => Json((*state.bmd.get()).clone()).into_response(),
        "smapvote" => {
            let msg = SmapVoteMsg {
                vote_in_progress: state.election.vote_in_progress(),
                smap: Some((*state.smap.get()).clone()),
                bmd: Some((*state.bmd.get()).clone()),
            };
            Json(msg).into_response()
        }
        other => {
            return Err(ApiError(Error::InvalidRequest(format!("unknown what '{other}'"))));
        }
    };
    Ok(resp)
}

async fn vote(
    State(state): State<ControlState>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Json<VoteReply>> {
    if !state.started.load(Ordering::SeqCst) {
        return Err(not_ready());
    }
    Ok(Json(state.election.on_vote_request(&req)))
}

async fn metasync(
    State(state): State<ControlState>,
    Json(msg): Json<MetaSyncMsg>,
) -> ApiResult<Json<MetaSyncAck>> {
    if state.election.vote_in_progress() {
        // No metadata mutations for the lifetime of the voting flag.
        return Err(ApiError(Error::VoteInProgress));
    }
    if let Some(smap) = msg.smap {
        if !smap.is_empty() {
            match state.smap.put(smap) {
                // A stale push is answered with the versions we hold; the
                // sender pulls toward the maximum on its own.
                Ok(_) | Err(Error::StaleUpdate { .. }) => {}
                Err(e) => return Err(ApiError(e)),
            }
        }
    }
    if let Some(bmd) = msg.bmd {
        if !bmd.is_empty() {
            match state.bmd.put(bmd) {
                Ok(_) | Err(Error::StaleUpdate { .. }) => {}
                Err(e) => return Err(ApiError(e)),
            }
        }
    }
    Ok(Json(MetaSyncAck {
        smap_version: state.smap.get().version,
        bmd_version: state.bmd.get().version,
    }))
}

async fn keepalive(
    State(state): State<ControlState>,
    Json(beat): Json<Beat>,
) -> Json<clustore_cluster::BeatAck> {
    Json(state.keepalive.on_heartbeat(&beat))
}

async fn join(
    State(state): State<ControlState>,
    Json(req): Json<JoinReq>,
) -> ApiResult<Json<Smap>> {
    if !state.started.load(Ordering::SeqCst) {
        return Err(not_ready());
    }
    let smap = state.smap.get();
    if smap.is_primary(&state.local.id) {
        let new = state.membership.join(req).await?;
        return Ok(Json((*new).clone()));
    }
    // any proxy accepts a join and forwards it to the primary
    let Some(primary) = smap.primary().cloned() else {
        return Err(ApiError(Error::Transient("no primary known yet".into())));
    };
    debug!(primary = %primary, node = %req.node, "forwarding join to primary");
    let new = state.client.join(&primary, &req).await?;
    Ok(Json(new))
}

#[derive(Debug, Deserialize)]
struct DaemonIdReq {
    daemon_id: String,
}

async fn maintenance_start(
    State(state): State<ControlState>,
    Json(req): Json<DaemonIdReq>,
) -> ApiResult<Json<Smap>> {
    let new = state.membership.start_maintenance(&req.daemon_id).await?;
    Ok(Json((*new).clone()))
}

async fn maintenance_stop(
    State(state): State<ControlState>,
    Json(req): Json<DaemonIdReq>,
) -> ApiResult<Json<Smap>> {
    let new = state.membership.stop_maintenance(&req.daemon_id).await?;
    Ok(Json((*new).clone()))
}

async fn decommission(
    State(state): State<ControlState>,
    Json(req): Json<DaemonIdReq>,
) -> ApiResult<Json<Smap>> {
    let new = state.membership.decommission(&req.daemon_id).await?;
    Ok(Json((*new).clone()))
}

async fn set_primary(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Smap>> {
    let new = state.membership.set_primary(&id).await?;
    Ok(Json((*new).clone()))
}

#[derive(Debug, Deserialize)]
struct BucketReq {
    bucket: Bck,
    #[serde(default)]
    props: BucketProps,
}

async fn create_bucket(
    State(state): State<ControlState>,
    Json(req): Json<BucketReq>,
) -> ApiResult<StatusCode> {
    state.membership.create_bucket(req.bucket, req.props).await?;
    Ok(StatusCode::CREATED)
}

async fn destroy_bucket(
    State(state): State<ControlState>,
    Path((provider, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let bck: Bck = format!("{provider}/{name}").parse()?;
    state.membership.destroy_bucket(&bck).await?;
    Ok(StatusCode::NO_CONTENT)
}
