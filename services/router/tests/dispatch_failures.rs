//! Dispatch and session-loss failure paths.
use dx_protocol::{ErrorEnvelope, ResultUpload, SyncResponse};
use dx_test_utils::MockConnector;
use router::config::RouterConfig;
use router::AppState;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

async fn spawn_router(config: RouterConfig) -> SocketAddr {
    let state = AppState::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router::build_router(state)).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn request_for_absent_connector_fails_fast_with_503() {
    let addr = spawn_router(RouterConfig::default()).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let response = client
        .post(format!("http://{addr}/datasets/request-sync"))
        .json(&serde_json::json!({"mac": "de-ad-be-ef-00-00", "dataset": "d.json"}))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 503);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error, "no_such_connector");
    assert!(elapsed < Duration::from_secs(1), "must fail without waiting for the deadline");
}

#[tokio::test]
async fn session_replacement_fails_old_requests_and_routes_new_ones() {
    let addr = spawn_router(RouterConfig::default()).await;
    let mac = "ee-00-00-00-00-01";
    let mut first = MockConnector::connect(&addr.to_string(), mac).await.unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app_old = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            client
                .post(format!("{base}/datasets/request-sync"))
                .json(&serde_json::json!({"mac": "ee-00-00-00-00-01", "dataset": "old.bin"}))
                .send()
                .await
                .unwrap()
        }
    });
    let old_command = first.recv_command().await.unwrap();
    assert_eq!(old_command.dataset_name, "old.bin");

    // Same node dials in again: last writer wins.
    let mut second = MockConnector::connect(&addr.to_string(), mac).await.unwrap();
    assert!(first.wait_closed().await, "replaced session must be closed");

    let response = app_old.await.unwrap();
    assert_eq!(response.status(), 502);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error, "connector_disconnected");

    // A fresh request reaches the replacement session.
    let app_new = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            client
                .post(format!("{base}/datasets/request-sync"))
                .json(&serde_json::json!({"mac": "ee-00-00-00-00-01", "dataset": "new.bin"}))
                .send()
                .await
                .unwrap()
        }
    });
    let new_command = second.recv_command().await.unwrap();
    assert_eq!(new_command.dataset_name, "new.bin");
    client
        .post(format!("{base}/datasets/result"))
        .json(&ResultUpload {
            request_id: new_command.request_id,
            data: Some(b"fresh".to_vec()),
            ..ResultUpload::default()
        })
        .send()
        .await
        .unwrap();
    let body: SyncResponse = app_new.await.unwrap().json().await.unwrap();
    assert_eq!(body.data, b"fresh");
}

#[tokio::test]
async fn connector_disconnect_after_dispatch_fails_request() {
    let addr = spawn_router(RouterConfig::default()).await;
    let mut connector = MockConnector::connect(&addr.to_string(), "ee-00-00-00-00-02")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            client
                .post(format!("{base}/datasets/request-sync"))
                .json(&serde_json::json!({"mac": "ee-00-00-00-00-02", "dataset": "d.bin"}))
                .send()
                .await
                .unwrap()
        }
    });

    let _command = connector.recv_command().await.unwrap();
    connector.close().await.unwrap();
    drop(connector);

    let response = tokio::time::timeout(Duration::from_secs(5), app)
        .await
        .expect("disconnect must fail the request promptly")
        .unwrap();
    assert_eq!(response.status(), 502);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error, "connector_disconnected");
}

#[tokio::test]
async fn silent_connector_is_evicted_after_missed_keepalives() {
    let addr = spawn_router(RouterConfig {
        keepalive_interval: Duration::from_millis(300),
        ..RouterConfig::default()
    })
    .await;
    let mut connector = MockConnector::connect(&addr.to_string(), "ee-00-00-00-00-03")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            client
                .post(format!("{base}/datasets/request-sync"))
                .json(&serde_json::json!({"mac": "ee-00-00-00-00-03", "dataset": "d.bin"}))
                .send()
                .await
                .unwrap()
        }
    });

    // Take the command but never answer pings afterwards; the session
    // must be evicted and the in-flight request failed.
    let _command = connector.recv_command().await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(10), app)
        .await
        .expect("eviction must fail the request")
        .unwrap();
    assert_eq!(response.status(), 502);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error, "connector_disconnected");
}
