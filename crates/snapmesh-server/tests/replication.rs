//! Push and pull between two clusters over HTTP on localhost.

mod common;

use std::sync::Arc;

use common::{fast_timing, volume, wait_until_async, TestNode, API_KEY, USER};
use snapmesh_repl::{
    PeerClient, ReplError, RpcRequest, TransferDirection, TransferPollResult, TransferRequest,
    TransferStatus,
};
use snapmesh_server::{dispatch, Command, FsmError, ServerError};
use snapmesh_store::MemoryStore;
use snapmesh_zfs::{DirtyInfo, FromSnapshot, Origin};

fn transfer(peer: &TestNode, direction: TransferDirection, clone_name: &str) -> TransferRequest {
    TransferRequest {
        peer: peer.peer(),
        user: USER.to_string(),
        api_key: API_KEY.to_string(),
        direction,
        local_namespace: "alice".to_string(),
        local_name: "db".to_string(),
        local_clone_name: clone_name.to_string(),
        remote_namespace: "alice".to_string(),
        remote_name: "db".to_string(),
        remote_clone_name: clone_name.to_string(),
        target_snapshot: String::new(),
    }
}

/// Starts a transfer on `node` and waits for it to end.
async fn run_transfer(node: &TestNode, request: TransferRequest) -> TransferPollResult {
    let transfer_id: String = node.call(RpcRequest::Transfer { request }).await;
    let ledger = Arc::clone(&node.ctx().ledger);
    wait_until_async("transfer to end", || {
        let ledger = Arc::clone(&ledger);
        let transfer_id = transfer_id.clone();
        async move {
            ledger
                .get(&transfer_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|poll| poll.status.is_terminal())
        }
    })
    .await;
    node.ctx().ledger.get(&transfer_id).await.unwrap().unwrap()
}

async fn two_clusters() -> (TestNode, TestNode) {
    let a = TestNode::start_http(&Arc::new(MemoryStore::new()), "hub-a").await;
    let b = TestNode::start_http(&Arc::new(MemoryStore::new()), "hub-b").await;
    (a, b)
}

#[tokio::test]
async fn test_push_new_volume_to_peer_cluster() {
    let (a, b) = two_clusters().await;
    let name = volume("db");
    let id = a.create(&name).await;
    a.snapshot(&name, "").await;
    a.snapshot(&name, "").await;

    let poll = run_transfer(&a, transfer(&b, TransferDirection::Push, "")).await;
    assert_eq!(poll.status, TransferStatus::Finished, "{}", poll.message);
    assert_eq!(poll.index, poll.total);

    assert_eq!(b.zfs.snapshot_ids(&id), a.zfs.snapshot_ids(&id));
    assert_eq!(b.ctx().registry.lookup(&name).as_deref(), Some(id.as_str()));
    assert_eq!(b.ctx().master_of(&id).as_deref(), Some("hub-b"));
    let b_zfs = b.zfs.clone();
    let b_id = id.clone();
    wait_until_async("pushed volume mounted on the peer", || {
        let mounted = b_zfs.is_mounted(&b_id);
        async move { mounted }
    })
    .await;

    // A second push only sends what is new.
    let third = a.snapshot(&name, "").await;
    let poll = run_transfer(&a, transfer(&b, TransferDirection::Push, "")).await;
    assert_eq!(poll.status, TransferStatus::Finished, "{}", poll.message);
    assert_eq!(b.zfs.snapshot_ids(&id).last(), Some(&third));
}

#[tokio::test]
async fn test_pull_new_volume_from_peer_cluster() {
    let (a, b) = two_clusters().await;
    let name = volume("db");
    let id = b.create(&name).await;
    b.snapshot(&name, "").await;

    let poll = run_transfer(&a, transfer(&b, TransferDirection::Pull, "")).await;
    assert_eq!(poll.status, TransferStatus::Finished, "{}", poll.message);

    assert_eq!(a.zfs.snapshot_ids(&id), b.zfs.snapshot_ids(&id));
    assert_eq!(a.ctx().registry.lookup(&name).as_deref(), Some(id.as_str()));
    assert_eq!(a.ctx().master_of(&id).as_deref(), Some("hub-a"));
}

#[tokio::test]
async fn test_pushing_a_clone_sends_its_parent_first() {
    let (a, b) = two_clusters().await;
    let name = volume("db");
    let root = a.create(&name).await;
    let origin = a.snapshot(&name, "").await;
    a.snapshot(&name, "").await;
    let clone_id: String = a
        .call(RpcRequest::Branch {
            name: name.clone(),
            source_clone_name: String::new(),
            snapshot_id: origin.clone(),
            new_clone_name: "feature".to_string(),
        })
        .await;
    a.snapshot(&name, "feature").await;

    let poll = run_transfer(&a, transfer(&b, TransferDirection::Push, "feature")).await;
    assert_eq!(poll.status, TransferStatus::Finished, "{}", poll.message);
    assert_eq!(poll.total, 2);

    // The parent travels only up to the clone's origin.
    assert_eq!(b.zfs.snapshot_ids(&root), vec![origin]);
    assert_eq!(b.zfs.snapshot_ids(&clone_id), a.zfs.snapshot_ids(&clone_id));
    assert_eq!(
        b.ctx()
            .registry
            .resolve(&name, "feature")
            .as_deref(),
        Some(clone_id.as_str())
    );
}

#[tokio::test]
async fn test_push_refused_with_uncommitted_changes() {
    let (a, b) = two_clusters().await;
    let name = volume("db");
    let id = a.create(&name).await;
    a.snapshot(&name, "").await;
    a.zfs.set_dirty(
        &id,
        DirtyInfo {
            dirty_bytes: 4096,
            size_bytes: 1 << 20,
        },
    );
    let ctx = Arc::clone(a.ctx());
    let dirty_id = id.clone();
    wait_until_async("dirty bytes published", || {
        let dirty = ctx.dirty.get(&dirty_id);
        async move { dirty.is_some_and(|d| d.dirty_bytes > 0) }
    })
    .await;

    let error = a
        .call_err(RpcRequest::Transfer {
            request: transfer(&b, TransferDirection::Push, ""),
        })
        .await;
    assert_eq!(error, "invalid-request");
}

#[tokio::test]
async fn test_pull_refused_while_containers_attached() {
    let (a, b) = two_clusters().await;
    let name = volume("db");
    let id = a.create(&name).await;
    a.snapshot(&name, "").await;
    b.call::<serde_json::Value>(RpcRequest::RegisterFilesystem {
        path: a.ctx().registry.deduce_path_to_top_level(&id).unwrap(),
        become_master_if_not_exists: true,
    })
    .await;
    a.containers.attach(&id, "web");

    let error = a
        .call_err(RpcRequest::Transfer {
            request: transfer(&b, TransferDirection::Pull, ""),
        })
        .await;
    assert_eq!(error, "cannot-pull-while-containers-running");
}

#[tokio::test]
async fn test_stream_with_missing_clone_origin_is_rejected() {
    let (_a, b) = two_clusters().await;
    let client = PeerClient::new(&b.peer(), USER, API_KEY).unwrap();
    let from = FromSnapshot::CloneOrigin(Origin::new("absent-parent", "s1"));

    let err = client
        .post_stream("clone-1", &from, "c1", reqwest::Body::from(Vec::<u8>::new()))
        .await
        .unwrap_err();
    match err {
        ReplError::PeerStatus { status, body, .. } => {
            assert_eq!(status, 409);
            let typed: FsmError = serde_json::from_str(&body).unwrap();
            assert_eq!(
                typed,
                FsmError::CloneOriginMissing {
                    filesystem_id: "absent-parent".to_string(),
                    snapshot_id: "s1".to_string(),
                }
            );
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(b.zfs.snapshot_ids("clone-1").is_empty());
}

#[tokio::test]
async fn test_wrong_credentials_are_refused() {
    let (_a, b) = two_clusters().await;
    let client = PeerClient::new(&b.peer(), USER, "wrong").unwrap();
    let err = client.call::<serde_json::Value>(&RpcRequest::List).await.unwrap_err();
    assert!(matches!(err, ReplError::PeerStatus { status: 401, .. }));
}

#[tokio::test]
async fn test_push_peer_gives_up_when_nothing_arrives() {
    let store = Arc::new(MemoryStore::new());
    let mut timing = fast_timing();
    timing.peer_push_timeout_ms = 200;
    let b = TestNode::start_with_timing(&store, "hub-b", timing).await;
    assert!(b.ctx().claim_master_if_absent("fs-pushed").await.unwrap());

    let request = TransferRequest {
        peer: "hub-a:6969".to_string(),
        user: USER.to_string(),
        api_key: API_KEY.to_string(),
        direction: TransferDirection::Push,
        local_namespace: "alice".to_string(),
        local_name: "db".to_string(),
        local_clone_name: String::new(),
        remote_namespace: "alice".to_string(),
        remote_name: "db".to_string(),
        remote_clone_name: String::new(),
        target_snapshot: "s1".to_string(),
    };
    let mut poll = TransferPollResult::new("t-idle", &request, "hub-a", 1);
    poll.filesystem_id = "fs-pushed".to_string();
    poll.target_snapshot = "s1".to_string();

    let err = dispatch(b.ctx(), "fs-pushed", Command::PeerTransfer { transfer: poll })
        .await
        .unwrap_err();
    match err {
        ServerError::Fsm(FsmError::TimedOutExternalSnaps { snapshot_id }) => {
            assert_eq!(snapshot_id, "s1")
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(b.zfs.snapshot_ids("fs-pushed").is_empty());
}
