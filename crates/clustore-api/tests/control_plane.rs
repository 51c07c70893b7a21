//! Control-plane integration tests.
//!
//! Each "node" here is the real router served on an ephemeral port and
//! driven through the real reqwest client, so these cover the wire
//! formats, the handler-side owner rules, and join forwarding end to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustore_api::{control_router, ControlClient, ControlState};
use clustore_cluster::{
    Election, JoinReq, KeepaliveTracker, Membership, MetaSyncMsg, Propagator, TrackerConfig,
    Uncover, VoteConfig, VoteRequest,
};
use clustore_core::{NetEndpoint, NodeRole, Snode};
use clustore_meta::{Bmd, BmdOwner, Smap, SmapOwner};
use tokio::net::TcpListener;

const CLUSTER_UUID: &str = "itest-cluster";
const BMD_UUID: &str = "itest-bmd";

struct TestNode {
    local: Snode,
    state: ControlState,
}

/// Serves a full control plane for `id` on an ephemeral port. `smap` is
/// the node's starting map (empty for a fresh joiner).
async fn spawn_node(id: &str, role: NodeRole, smap: Smap) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let local = Snode::new(id, role, NetEndpoint::new("127.0.0.1", addr.port()));

    let smap_owner = Arc::new(SmapOwner::new(smap));
    let bmd_owner = Arc::new(BmdOwner::new(Bmd {
        version: 1,
        uuid: BMD_UUID.into(),
        ..Bmd::new()
    }));
    let client = Arc::new(ControlClient::new(Duration::from_millis(500)).unwrap());

    let vote_cfg = VoteConfig {
        startup_time: Duration::from_secs(2),
        cplane_operation: Duration::from_millis(500),
        backoff_base: Duration::from_millis(50),
    };
    let election = Arc::new(Election::new(
        local.clone(),
        smap_owner.clone(),
        client.clone(),
        vote_cfg,
    ));
    let propagator = Arc::new(Propagator::new(
        id,
        client.clone(),
        Duration::from_millis(500),
        1,
    ));
    let membership = Arc::new(Membership::new(
        id,
        smap_owner.clone(),
        bmd_owner.clone(),
        propagator,
    ));
    let keepalive = Arc::new(KeepaliveTracker::new(
        id,
        TrackerConfig::default(),
        smap_owner.clone(),
        client.clone(),
    ));

    let state = ControlState {
        local: local.clone(),
        smap: smap_owner,
        bmd: bmd_owner,
        election,
        membership,
        keepalive,
        client,
        started: Arc::new(AtomicBool::new(true)),
    };

    let router = control_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestNode { local, state }
}

/// A version-1 map whose only member (and primary) is `node`.
fn genesis_smap(node: &Snode) -> Smap {
    let mut smap = Smap {
        version: 1,
        uuid: CLUSTER_UUID.into(),
        primary_id: node.id.clone(),
        ..Smap::new()
    };
    smap.put_node(node.clone()).unwrap();
    smap
}

/// Spawns a primary proxy serving a genesis map with itself in it.
async fn spawn_primary(id: &str) -> TestNode {
    // bind first so the descriptor carries the right port, then install
    // the genesis map through the owner
    let node = spawn_node(id, NodeRole::Proxy, Smap::new()).await;
    node.state.smap.put(genesis_smap(&node.local)).unwrap();
    node
}

#[tokio::test]
async fn test_health_and_daemon_queries() {
    let primary = spawn_primary("p1").await;
    let client = reqwest::Client::new();
    let base = primary.local.intra_control_net.clone();

    let resp = client.get(base.url("/v1/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(base.url("/v1/daemon?what=smap")).send().await.unwrap();
    let smap: Smap = resp.json().await.unwrap();
    assert_eq!(smap.version, 1);
    assert_eq!(smap.primary_id, "p1");

    let resp = client.get(base.url("/v1/daemon?what=bogus")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_discovery_over_http() {
    let primary = spawn_primary("p1").await;
    // advance the primary's map a few versions
    for _ in 0..3 {
        primary
            .state
            .smap
            .modify(|cur| {
                let mut next = cur.clone();
                next.version += 1;
                Ok(next)
            })
            .unwrap();
    }

    let client = Arc::new(ControlClient::new(Duration::from_millis(500)).unwrap());
    let uncover = Uncover::new(client, Duration::from_millis(500));
    let meta = uncover
        .uncover(std::slice::from_ref(&primary.local), Duration::from_secs(2))
        .await;

    assert_eq!(meta.smap.unwrap().version, 4);
    assert_eq!(meta.bmd.unwrap().version, 1);
}

#[tokio::test]
async fn test_join_directly_at_primary() {
    let primary = spawn_primary("p1").await;
    let joiner = spawn_node("t1", NodeRole::Target, Smap::new()).await;

    let client = ControlClient::new(Duration::from_millis(500)).unwrap();
    let req = JoinReq { node: joiner.local.clone(), cluster_uuid: Some(CLUSTER_UUID.into()) };
    let smap = clustore_cluster::ControlPlane::join(&client, &primary.local, &req)
        .await
        .unwrap();

    assert_eq!(smap.version, 2);
    assert!(smap.get_node("t1").is_some());

    // the joiner received the broadcast and installed the map it is in
    assert_eq!(joiner.state.smap.get().version, 2);
    assert!(joiner.state.smap.get().get_node("t1").is_some());
}

#[tokio::test]
async fn test_join_forwarded_through_secondary() {
    let primary = spawn_primary("p1").await;

    // p2 joins, then serves with a map naming p1 as primary
    let p2 = spawn_node("p2", NodeRole::Proxy, Smap::new()).await;
    let client = ControlClient::new(Duration::from_millis(500)).unwrap();
    let req = JoinReq { node: p2.local.clone(), cluster_uuid: None };
    clustore_cluster::ControlPlane::join(&client, &primary.local, &req).await.unwrap();
    assert_eq!(p2.state.smap.get().primary_id, "p1");

    // t1 posts its join to p2; p2 forwards to p1
    let t1 = spawn_node("t1", NodeRole::Target, Smap::new()).await;
    let req = JoinReq { node: t1.local.clone(), cluster_uuid: None };
    let smap = clustore_cluster::ControlPlane::join(&client, &p2.local, &req).await.unwrap();

    assert!(smap.get_node("t1").is_some());
    assert_eq!(smap.primary_id, "p1");
    assert_eq!(primary.state.smap.get().version, smap.version);
}

#[tokio::test]
async fn test_metasync_enforces_owner_rules() {
    let primary = spawn_primary("p1").await;
    let client = ControlClient::new(Duration::from_millis(500)).unwrap();

    // newer map is accepted
    let mut newer = (*primary.state.smap.get()).clone();
    newer.version = 5;
    let ack = clustore_cluster::ControlPlane::push_meta(
        &client,
        &primary.local,
        &MetaSyncMsg { smap: Some(newer), bmd: None },
    )
    .await
    .unwrap();
    assert_eq!(ack.smap_version, 5);

    // a stale push is not an error; the ack reports the higher version
    let mut stale = (*primary.state.smap.get()).clone();
    stale.version = 2;
    let ack = clustore_cluster::ControlPlane::push_meta(
        &client,
        &primary.local,
        &MetaSyncMsg { smap: Some(stale), bmd: None },
    )
    .await
    .unwrap();
    assert_eq!(ack.smap_version, 5);

    // an alien cluster UUID is fatal
    let mut alien = (*primary.state.smap.get()).clone();
    alien.version = 9;
    alien.uuid = "other-cluster".into();
    let err = clustore_cluster::ControlPlane::push_meta(
        &client,
        &primary.local,
        &MetaSyncMsg { smap: Some(alien), bmd: None },
    )
    .await
    .unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_vote_endpoint() {
    let primary = spawn_primary("p1").await;
    let client = ControlClient::new(Duration::from_millis(500)).unwrap();

    let reply = clustore_cluster::ControlPlane::request_vote(
        &client,
        &primary.local,
        &VoteRequest { epoch: 1, candidate_id: "p2".into() },
    )
    .await
    .unwrap();
    assert!(reply.is_yes());
    assert_eq!(reply.smap_version, 1);

    // while voting, health reports 503 and discovery shows the flag
    let http = reqwest::Client::new();
    let resp =
        http.get(primary.local.intra_control_net.url("/v1/health")).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    let probe: clustore_cluster::SmapVoteMsg = http
        .get(primary.local.intra_control_net.url("/v1/daemon?what=smapvote"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(probe.vote_in_progress);

    // metadata mutations are refused mid-vote
    let mut newer = (*primary.state.smap.get()).clone();
    newer.version = 7;
    let err = clustore_cluster::ControlPlane::push_meta(
        &client,
        &primary.local,
        &MetaSyncMsg { smap: Some(newer), bmd: None },
    )
    .await
    .unwrap_err();
    assert!(err.is_transient());

    // installing a new map concludes the election on this node
    primary.state.election.on_smap_installed();
    let resp =
        http.get(primary.local.intra_control_net.url("/v1/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_maintenance_and_decommission_round_trip() {
    let primary = spawn_primary("p1").await;
    let t1 = spawn_node("t1", NodeRole::Target, Smap::new()).await;

    let client = ControlClient::new(Duration::from_millis(500)).unwrap();
    let req = JoinReq { node: t1.local.clone(), cluster_uuid: None };
    clustore_cluster::ControlPlane::join(&client, &primary.local, &req).await.unwrap();

    let http = reqwest::Client::new();
    let base = primary.local.intra_control_net.clone();

    let smap: Smap = http
        .put(base.url("/v1/cluster/maintenance/start"))
        .json(&serde_json::json!({"daemon_id": "t1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(smap.get_node("t1").unwrap().in_maintenance());

    let smap: Smap = http
        .put(base.url("/v1/cluster/maintenance/stop"))
        .json(&serde_json::json!({"daemon_id": "t1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!smap.get_node("t1").unwrap().in_maintenance());

    let smap: Smap = http
        .put(base.url("/v1/cluster/decommission"))
        .json(&serde_json::json!({"daemon_id": "t1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(smap.get_node("t1").is_none());

    // the decommissioned node saw the farewell map it is absent from
    assert!(t1.state.smap.get().get_node("t1").is_none());
}

#[tokio::test]
async fn test_bucket_endpoints() {
    let primary = spawn_primary("p1").await;
    let http = reqwest::Client::new();
    let base = primary.local.intra_control_net.clone();

    let resp = http
        .post(base.url("/v1/buckets"))
        .json(&serde_json::json!({"bucket": "ais/imagenet"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(primary.state.bmd.get().version, 2);

    // duplicate create is rejected
    let resp = http
        .post(base.url("/v1/buckets"))
        .json(&serde_json::json!({"bucket": "ais/imagenet"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp =
        http.delete(base.url("/v1/buckets/ais/imagenet")).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(primary.state.bmd.get().version, 3);
}
