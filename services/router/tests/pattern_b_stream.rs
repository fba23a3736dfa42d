//! End-to-end tests for pattern B (chunked streaming).
use dx_protocol::{CommandKind, ErrorEnvelope, RequestState, StatusResponse, StreamChunk, StreamComplete, StreamInit};
use dx_test_utils::MockConnector;
use router::config::RouterConfig;
use router::AppState;
use std::net::SocketAddr;

async fn spawn_router(config: RouterConfig) -> SocketAddr {
    let state = AppState::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router::build_router(state)).await.unwrap();
    });
    addr
}

fn chunk_body(request_id: &str, seq: u64, data: Vec<u8>) -> StreamChunk {
    StreamChunk {
        request_id: request_id.to_owned(),
        seq,
        data,
    }
}

#[tokio::test]
async fn streamed_chunks_arrive_in_order_and_intact() {
    let addr = spawn_router(RouterConfig::default()).await;
    let mut connector = MockConnector::connect(&addr.to_string(), "bb-00-00-00-00-01")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            let response = client
                .post(format!("{base}/datasets/request-stream"))
                .json(&serde_json::json!({"mac": "bb-00-00-00-00-01", "dataset": "dataset_50mb.csv"}))
                .send()
                .await
                .unwrap();
            let status = response.status();
            let request_id = response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);
            let body = response.bytes().await;
            (status, request_id, body)
        }
    });

    let command = connector.recv_command().await.unwrap();
    assert_eq!(command.command, CommandKind::GetDatasetStream);

    client
        .post(format!("{base}/datasets/stream/init"))
        .json(&StreamInit {
            request_id: command.request_id.clone(),
            total_size: Some(50 * 1024),
            chunk_size: Some(1024),
        })
        .send()
        .await
        .unwrap();

    let mut expected = Vec::new();
    for seq in 0..50_u64 {
        let data = vec![(seq % 256) as u8; 1024];
        expected.extend_from_slice(&data);
        let ack = client
            .post(format!("{base}/datasets/stream/chunk"))
            .json(&chunk_body(&command.request_id, seq, data))
            .send()
            .await
            .unwrap();
        assert_eq!(ack.status(), 200, "chunk {seq} must be acked");
    }
    client
        .post(format!("{base}/datasets/stream/complete"))
        .json(&StreamComplete {
            request_id: command.request_id.clone(),
            total_chunks: 50,
        })
        .send()
        .await
        .unwrap();

    let (status, request_id, body) = app.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(request_id.as_deref(), Some(command.request_id.as_str()));
    let body = body.unwrap();
    assert_eq!(body.len(), 50 * 1024);
    assert_eq!(&body[..], &expected[..], "chunks must concatenate in order");

    // Terminal state is queryable afterwards.
    let status: StatusResponse = client
        .get(format!("{base}/datasets/status/{}", command.request_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.state, RequestState::Fulfilled);
}

#[tokio::test]
async fn empty_dataset_streams_one_empty_chunk() {
    let addr = spawn_router(RouterConfig::default()).await;
    let mut connector = MockConnector::connect(&addr.to_string(), "bb-00-00-00-00-02")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            let response = client
                .post(format!("{base}/datasets/request-stream"))
                .json(&serde_json::json!({"mac": "bb-00-00-00-00-02", "dataset": "empty.csv"}))
                .send()
                .await
                .unwrap();
            (response.status(), response.bytes().await)
        }
    });

    let command = connector.recv_command().await.unwrap();
    client
        .post(format!("{base}/datasets/stream/init"))
        .json(&StreamInit {
            request_id: command.request_id.clone(),
            total_size: Some(0),
            chunk_size: None,
        })
        .send()
        .await
        .unwrap();
    client
        .post(format!("{base}/datasets/stream/chunk"))
        .json(&chunk_body(&command.request_id, 0, Vec::new()))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{base}/datasets/stream/complete"))
        .json(&StreamComplete {
            request_id: command.request_id,
            total_chunks: 1,
        })
        .send()
        .await
        .unwrap();

    let (status, body) = app.await.unwrap();
    assert_eq!(status, 200);
    assert!(body.unwrap().is_empty());
}

#[tokio::test]
async fn sequence_gap_fails_request_and_aborts_stream() {
    let addr = spawn_router(RouterConfig::default()).await;
    let mut connector = MockConnector::connect(&addr.to_string(), "bb-00-00-00-00-03")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            let response = client
                .post(format!("{base}/datasets/request-stream"))
                .json(&serde_json::json!({"mac": "bb-00-00-00-00-03", "dataset": "gappy.csv"}))
                .send()
                .await
                .unwrap();
            response.bytes().await
        }
    });

    let command = connector.recv_command().await.unwrap();
    client
        .post(format!("{base}/datasets/stream/init"))
        .json(&StreamInit {
            request_id: command.request_id.clone(),
            total_size: None,
            chunk_size: None,
        })
        .send()
        .await
        .unwrap();
    client
        .post(format!("{base}/datasets/stream/chunk"))
        .json(&chunk_body(&command.request_id, 0, b"zero".to_vec()))
        .send()
        .await
        .unwrap();

    // Sequence 1 never sent: the gap is a protocol violation.
    let gap = client
        .post(format!("{base}/datasets/stream/chunk"))
        .json(&chunk_body(&command.request_id, 2, b"two".to_vec()))
        .send()
        .await
        .unwrap();
    assert_eq!(gap.status(), 400);
    let envelope: ErrorEnvelope = gap.json().await.unwrap();
    assert_eq!(envelope.error, "protocol_violation");

    // The application's chunked body is terminated abruptly.
    assert!(app.await.unwrap().is_err());

    let status: StatusResponse = client
        .get(format!("{base}/datasets/status/{}", command.request_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.state, RequestState::Failed);
}

#[tokio::test]
async fn chunk_for_unknown_request_is_404() {
    let addr = spawn_router(RouterConfig::default()).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let response = client
        .post(format!("{base}/datasets/stream/chunk"))
        .json(&chunk_body("not-a-request", 0, b"x".to_vec()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error, "unknown_request");
}

#[tokio::test]
async fn oversized_chunk_fails_request_with_413() {
    let addr = spawn_router(RouterConfig {
        max_chunk_size: 512,
        ..RouterConfig::default()
    })
    .await;
    let mut connector = MockConnector::connect(&addr.to_string(), "bb-00-00-00-00-04")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            let response = client
                .post(format!("{base}/datasets/request-stream"))
                .json(&serde_json::json!({"mac": "bb-00-00-00-00-04", "dataset": "fat.csv"}))
                .send()
                .await
                .unwrap();
            response.bytes().await
        }
    });

    let command = connector.recv_command().await.unwrap();
    client
        .post(format!("{base}/datasets/stream/init"))
        .json(&StreamInit {
            request_id: command.request_id.clone(),
            total_size: None,
            chunk_size: None,
        })
        .send()
        .await
        .unwrap();
    let fat = client
        .post(format!("{base}/datasets/stream/chunk"))
        .json(&chunk_body(&command.request_id, 0, vec![0_u8; 1024]))
        .send()
        .await
        .unwrap();
    assert_eq!(fat.status(), 413);
    assert!(app.await.unwrap().is_err());
}
