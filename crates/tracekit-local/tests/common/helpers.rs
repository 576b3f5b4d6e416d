// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

use tracekit_local::config::Config;
use tracekit_local::http_utils::body_from;
use tracekit_local::local_ui::LocalUiServer;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Starts a server on an ephemeral port and returns it with the port and serve task.
pub async fn start_test_server(config: Config) -> (Arc<LocalUiServer>, u16, JoinHandle<()>) {
    let server = Arc::new(LocalUiServer::new(config));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let port = listener.local_addr().unwrap().port();

    let serving = server.clone();
    let handle = tokio::spawn(async move {
        serving.serve(listener).await.expect("server failed");
    });
    (server, port, handle)
}

/// One OTLP resource span with the given service name and `(traceId, name)` spans.
pub fn create_test_resource_spans(service: &str, spans: &[(&str, &str)]) -> Value {
    let spans: Vec<Value> = spans
        .iter()
        .enumerate()
        .map(|(i, (trace_id, name))| {
            json!({
                "traceId": trace_id,
                "spanId": format!("span-{i}"),
                "name": name,
                "kind": 2,
                "startTimeUnixNano": "1000000000",
                "endTimeUnixNano": "1005000000",
                "attributes": [{ "key": "http.method", "value": { "stringValue": "POST" } }],
                "status": { "code": 1 }
            })
        })
        .collect();
    json!({
        "resource": {
            "attributes": [{ "key": "service.name", "value": { "stringValue": service } }]
        },
        "scopeSpans": [{ "scope": { "name": "test" }, "spans": spans }]
    })
}

/// Create a test OTLP export payload as JSON bytes
pub fn create_test_trace_payload(resource_spans: Vec<Value>) -> Vec<u8> {
    json!({ "resourceSpans": resource_spans }).to_string().into_bytes()
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", format!("127.0.0.1:{port}"))
        .header("Content-Type", "application/json");

    let response = if let Some(body_data) = body {
        let body_len = body_data.len();
        request_builder = request_builder.header("Content-Length", body_len.to_string());
        let request = request_builder.body(body_from(body_data))?;
        timeout(Duration::from_secs(2), sender.send_request(request)).await??
    } else {
        let request = request_builder.body(body_from(Vec::new()))?;
        timeout(Duration::from_secs(2), sender.send_request(request)).await??
    };

    Ok(response)
}

pub async fn response_json(response: Response<hyper::body::Incoming>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("response body is not JSON")
}

pub async fn connect_live_channel(port: u16) -> WsClient {
    let (client, _) = timeout(
        Duration::from_secs(2),
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws")),
    )
    .await
    .expect("WebSocket connect timed out")
    .expect("WebSocket connect failed");
    client
}

/// Next message from the live channel, decoded as JSON.
pub async fn next_live_event(client: &mut WsClient) -> Value {
    match next_live_message(client).await {
        WsMessage::Text(text) => serde_json::from_str(&text).expect("live event is not JSON"),
        other => panic!("expected a text message, got {other:?}"),
    }
}

pub async fn next_live_message(client: &mut WsClient) -> WsMessage {
    timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for live message")
        .expect("live channel ended")
        .expect("live channel error")
}
