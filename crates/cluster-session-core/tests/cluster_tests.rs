//! Integration tests for a coordinator serving several peers.
//!
//! Each test binds a real coordinator on a socket in a temp dir and talks to
//! it through independent peer connections, the way separate worker
//! processes would.

use cluster_session::ipc::protocol::read_frame;
use cluster_session::{
    BackoffConfig, ClusterStore, Coordinator, MemoryStore, PeerClient, Role, SessionConfig,
    SessionStore, Unavailable,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;

fn config_for(role: Role, socket: &Path) -> SessionConfig {
    SessionConfig::new(role)
        .with_socket_path(socket)
        .with_request_timeout(Duration::from_secs(2))
        .with_reconnect(
            BackoffConfig::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(20))
                .with_max_delay(Duration::from_millis(100))
                .with_jitter(false),
        )
}

async fn start_cluster(dir: &TempDir) -> (ClusterStore, PeerClient, PeerClient) {
    let socket = dir.path().join("sessions.sock");
    let coordinator = ClusterStore::start(config_for(Role::Coordinator, &socket))
        .await
        .expect("coordinator starts");
    let peer_a = PeerClient::connect(&config_for(Role::Peer, &socket))
        .await
        .expect("peer A connects");
    let peer_b = PeerClient::connect(&config_for(Role::Peer, &socket))
        .await
        .expect("peer B connects");
    (coordinator, peer_a, peer_b)
}

#[tokio::test]
async fn test_login_visible_across_peers() {
    let dir = TempDir::new().unwrap();
    let (coordinator, peer_a, peer_b) = start_cluster(&dir).await;

    peer_a
        .set("s1", json!({"user": "alice"}), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(
        peer_b.get("s1").await.unwrap(),
        Some(json!({"user": "alice"}))
    );

    peer_a.destroy("s1").await.unwrap();
    assert_eq!(peer_b.get("s1").await.unwrap(), None);
    assert_eq!(coordinator.coordinator().unwrap().active_connections(), 2);
}

#[tokio::test]
async fn test_missing_session_is_absent() {
    let dir = TempDir::new().unwrap();
    let (coordinator, peer_a, _peer_b) = start_cluster(&dir).await;

    assert_eq!(peer_a.get("missing").await.unwrap(), None);
    assert_eq!(coordinator.get("missing").await.unwrap(), None);
    peer_a.destroy("missing").await.unwrap();
}

#[tokio::test]
async fn test_coordinator_sees_peer_writes_directly() {
    let dir = TempDir::new().unwrap();
    let (coordinator, peer_a, _peer_b) = start_cluster(&dir).await;

    coordinator.set("own", json!("coord"), None).await.unwrap();
    peer_a.set("remote", json!("peer"), None).await.unwrap();

    assert_eq!(peer_a.get("own").await.unwrap(), Some(json!("coord")));
    assert_eq!(coordinator.get("remote").await.unwrap(), Some(json!("peer")));
    assert_eq!(coordinator.length().await.unwrap(), 2);
    assert_eq!(peer_a.length().await.unwrap(), 2);

    peer_a.clear().await.unwrap();
    assert_eq!(coordinator.length().await.unwrap(), 0);
}

#[tokio::test]
async fn test_session_expires_after_ttl() {
    let dir = TempDir::new().unwrap();
    let (coordinator, peer_a, peer_b) = start_cluster(&dir).await;

    peer_a
        .set("short", json!(1), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    peer_a.set("long", json!(2), None).await.unwrap();
    assert_eq!(peer_b.get("short").await.unwrap(), Some(json!(1)));

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(peer_b.get("short").await.unwrap(), None);
    assert_eq!(peer_b.get("long").await.unwrap(), Some(json!(2)));
    assert!(peer_b.touch("short", None).await.unwrap_err().is_not_found());

    let store = coordinator.local_store().unwrap();
    store.sweep_expired().unwrap();
    assert_eq!(store.length().unwrap(), 1);
}

#[tokio::test]
async fn test_touch_extends_expiry() {
    let dir = TempDir::new().unwrap();
    let (_coordinator, peer_a, peer_b) = start_cluster(&dir).await;

    peer_a
        .set("s1", json!("alice"), Some(Duration::from_millis(150)))
        .await
        .unwrap();
    peer_b
        .touch("s1", Some(Duration::from_secs(60)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(peer_a.get("s1").await.unwrap(), Some(json!("alice")));
}

#[tokio::test]
async fn test_concurrent_sets_leave_one_value() {
    let dir = TempDir::new().unwrap();
    let (coordinator, peer_a, peer_b) = start_cluster(&dir).await;

    for round in 0..20 {
        let first = json!({"writer": "a", "round": round});
        let second = json!({"writer": "b", "round": round});

        let (ra, rb) = tokio::join!(
            peer_a.set("shared", first.clone(), None),
            peer_b.set("shared", second.clone(), None),
        );
        ra.unwrap();
        rb.unwrap();

        let stored = coordinator.get("shared").await.unwrap().unwrap();
        assert!(stored == first || stored == second, "torn write: {}", stored);
    }
    assert_eq!(coordinator.length().await.unwrap(), 1);
}

#[tokio::test]
async fn test_many_peers_interleaved() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("sessions.sock");
    let coordinator = ClusterStore::start(config_for(Role::Coordinator, &socket))
        .await
        .unwrap();

    let mut workers = Vec::new();
    for worker in 0..8 {
        let config = config_for(Role::Peer, &socket);
        workers.push(tokio::spawn(async move {
            let peer = PeerClient::connect(&config).await.unwrap();
            for n in 0..25 {
                let id = format!("w{}-s{}", worker, n);
                peer.set(&id, json!({"worker": worker, "n": n}), None)
                    .await
                    .unwrap();
                assert_eq!(
                    peer.get(&id).await.unwrap(),
                    Some(json!({"worker": worker, "n": n}))
                );
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(coordinator.length().await.unwrap(), 8 * 25);
}

#[tokio::test]
async fn test_coordinator_stop_fails_outstanding_set() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("sessions.sock");

    // A coordinator that takes requests and never answers them.
    let listener = UnixListener::bind(&socket).unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(Some(_)) = read_frame(&mut stream).await {}
    });

    let config = config_for(Role::Peer, &socket).with_request_timeout(Duration::from_secs(3));
    let peer = Arc::new(PeerClient::connect(&config).await.unwrap());

    let outstanding = {
        let peer = peer.clone();
        tokio::spawn(async move { peer.set("s1", json!({"user": "alice"}), None).await })
    };
    while peer.pending_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = tokio::time::Instant::now();
    server.abort();

    let err = outstanding.await.unwrap().unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(err.unavailable_cause(), Some(&Unavailable::ConnectionLost));
    assert!(started.elapsed() < Duration::from_secs(3));

    // A restarted coordinator knows nothing of the failed write.
    let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
    let _restarted = Coordinator::start(&socket, store.clone()).await.unwrap();
    for _ in 0..200 {
        if peer.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(peer.is_connected());
    assert_eq!(peer.get("s1").await.unwrap(), None);
    assert_eq!(store.length().unwrap(), 0);
}

#[tokio::test]
async fn test_peer_degrades_to_anonymous_when_coordinator_gone() {
    let dir = TempDir::new().unwrap();
    let (mut coordinator, peer_a, _peer_b) = start_cluster(&dir).await;
    peer_a.set("s1", json!({"user": "alice"}), None).await.unwrap();
    assert_eq!(
        peer_a.load_or_anonymous("s1").await,
        Some(json!({"user": "alice"}))
    );

    coordinator.shutdown();

    for _ in 0..100 {
        if !peer_a.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(peer_a.load_or_anonymous("s1").await, None);
    let err = peer_a.get("s1").await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_standalone_mode_needs_no_socket() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("unused.sock");
    let store = ClusterStore::start(config_for(Role::Standalone, &socket))
        .await
        .unwrap();

    store.set("s1", json!({"user": "alice"}), None).await.unwrap();
    assert_eq!(store.get("s1").await.unwrap(), Some(json!({"user": "alice"})));
    store.destroy("s1").await.unwrap();
    assert_eq!(store.get("s1").await.unwrap(), None);
    assert!(!socket.exists());
}
