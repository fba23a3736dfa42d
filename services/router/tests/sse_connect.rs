//! Push-channel delivery over the SSE transport.
use dx_protocol::{CommandFrame, CommandKind, ResultUpload, SyncResponse};
use futures_util::StreamExt;
use router::config::RouterConfig;
use router::AppState;
use std::net::SocketAddr;
use std::time::Duration;

async fn spawn_router(config: RouterConfig) -> SocketAddr {
    let state = AppState::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router::build_router(state)).await.unwrap();
    });
    addr
}

/// Reads the SSE byte stream until one `data:` frame parses as a
/// command, skipping keep-alive comments.
async fn next_command<S>(stream: &mut S, buffer: &mut String) -> CommandFrame
where
    S: futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    loop {
        for line in buffer.clone().lines() {
            if let Some(json) = line.strip_prefix("data: ") {
                if let Ok(frame) = serde_json::from_str::<CommandFrame>(json) {
                    buffer.clear();
                    return frame;
                }
            }
        }
        let bytes = stream
            .next()
            .await
            .expect("sse stream must stay open")
            .expect("sse read must succeed");
        buffer.push_str(&String::from_utf8_lossy(&bytes));
    }
}

#[tokio::test]
async fn sse_transport_carries_command_frames() {
    let addr = spawn_router(RouterConfig::default()).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // Plain GET without an upgrade lands on the SSE transport.
    let channel = client
        .get(format!("{base}/connect?mac=dd-00-00-00-00-01"))
        .send()
        .await
        .unwrap();
    assert_eq!(channel.status(), 200);
    assert!(channel
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream")));
    let mut frames = channel.bytes_stream();
    let mut buffer = String::new();

    let app = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move {
            client
                .post(format!("{base}/datasets/request-sync"))
                .json(&serde_json::json!({"mac": "dd-00-00-00-00-01", "dataset": "via-sse.bin"}))
                .send()
                .await
                .unwrap()
        }
    });

    let command = next_command(&mut frames, &mut buffer).await;
    assert_eq!(command.command, CommandKind::GetDataset);
    assert_eq!(command.dataset_name, "via-sse.bin");

    client
        .post(format!("{base}/datasets/result"))
        .json(&ResultUpload {
            request_id: command.request_id,
            data: Some(b"sse payload".to_vec()),
            ..ResultUpload::default()
        })
        .send()
        .await
        .unwrap();

    let body: SyncResponse = app.await.unwrap().json().await.unwrap();
    assert_eq!(body.data, b"sse payload");

    // Dropping the SSE response tears the session down.
    drop(frames);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let listed: Vec<dx_protocol::ConnectorInfo> = client
        .get(format!("{base}/connectors"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn connect_without_mac_is_rejected() {
    let addr = spawn_router(RouterConfig::default()).await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/connect"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
