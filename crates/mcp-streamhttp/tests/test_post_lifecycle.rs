//! POST handling: initialization, session validation, response routing in
//! SSE and JSON modes.

mod common;

use std::time::Duration;

use http::{Method, StatusCode};
use mcp_streamhttp::{
    JsonRpcMessage, StreamableHttpServerConfig, StreamableHttpServerTransport,
};
use serde_json::json;
use tokio::time::timeout;

use common::*;

// ─── Initialization ─────────────────────────────────────────────────────────

#[tokio::test]
async fn initialization_opens_sse_stream_and_assigns_session() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(fixed_session_config("S-1"));
    transport.start().await.unwrap();

    let mut response = dispatch(
        &transport,
        post_head(None),
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
    )
    .await;

    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.header("mcp-session-id"), Some("S-1"));
    assert_eq!(head.header("content-type"), Some("text/event-stream"));

    let request = inbound.recv().await.unwrap();
    assert!(request.is_initialize_request());

    transport
        .send(serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap())
        .await
        .unwrap();

    let frame = response.next_chunk().await.unwrap();
    assert_eq!(
        frame,
        "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n"
    );
    // All correlated responses are in; the stream closes.
    assert!(response.next_chunk().await.is_none());
    assert_eq!(transport.session_id().await.as_deref(), Some("S-1"));
}

#[tokio::test]
async fn non_init_request_before_initialization_is_rejected() {
    let (transport, _inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
    transport.start().await.unwrap();

    let mut response = dispatch(
        &transport,
        post_head(None),
        r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
    )
    .await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::BAD_REQUEST);
    assert!(response.body().await.contains("Server not initialized"));
}

#[tokio::test]
async fn reinitialization_is_rejected() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(fixed_session_config("S-1"));
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(&transport, post_head(Some("S-1")), INIT_BODY).await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::BAD_REQUEST);
    let body = response.body().await;
    assert!(body.contains("-32600"));
    assert!(body.contains("Server already initialized"));
}

#[tokio::test]
async fn batch_containing_initialize_is_rejected() {
    let (transport, _inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
    transport.start().await.unwrap();

    let mut response = dispatch(
        &transport,
        post_head(None),
        r#"[{"jsonrpc":"2.0","id":0,"method":"initialize","params":{}},{"jsonrpc":"2.0","id":1,"method":"ping"}]"#,
    )
    .await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::BAD_REQUEST);
    let body = response.body().await;
    assert!(body.contains("-32600"));
    assert!(body.contains("Only one initialization request is allowed"));
}

// ─── Session validation ─────────────────────────────────────────────────────

#[tokio::test]
async fn missing_session_header_is_bad_request() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(fixed_session_config("S-1"));
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(
        &transport,
        post_head(None),
        r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
    )
    .await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::BAD_REQUEST);
    let body = response.body().await;
    assert!(body.contains("\"code\":-32000"));
    assert!(body.contains("Bad Request: Mcp-Session-Id header is required"));
}

#[tokio::test]
async fn wrong_session_id_is_not_found() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(fixed_session_config("S-1"));
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(
        &transport,
        post_head(Some("WRONG")),
        r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
    )
    .await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::NOT_FOUND);
    assert!(response.body().await.contains("\"code\":-32001"));
}

#[tokio::test]
async fn stateless_mode_skips_session_validation() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::stateless());
    transport.start().await.unwrap();
    let session = initialize(&transport, &mut inbound).await;
    assert!(session.is_none());

    let mut response = dispatch(
        &transport,
        post_head(None),
        r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
    )
    .await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    let _ = inbound.recv().await.unwrap();
    transport
        .send(JsonRpcMessage::response(2, json!({})))
        .await
        .unwrap();
    assert!(response.next_chunk().await.is_some());
}

// ─── Header gates and method dispatch ───────────────────────────────────────

#[tokio::test]
async fn post_requires_accepting_both_mime_types() {
    let (transport, _inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
    transport.start().await.unwrap();

    let head = request_head(
        Method::POST,
        &[("accept", "application/json"), ("content-type", "application/json")],
    );
    let mut response = dispatch(&transport, head, INIT_BODY).await;
    assert_eq!(
        response.head().await.unwrap().status,
        StatusCode::NOT_ACCEPTABLE
    );
}

#[tokio::test]
async fn post_requires_json_content_type() {
    let (transport, _inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
    transport.start().await.unwrap();

    let head = request_head(
        Method::POST,
        &[("accept", ACCEPT_BOTH), ("content-type", "text/plain")],
    );
    let mut response = dispatch(&transport, head, INIT_BODY).await;
    assert_eq!(
        response.head().await.unwrap().status,
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    );
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let (transport, _inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
    transport.start().await.unwrap();

    let mut response = dispatch(&transport, post_head(None), "{not json").await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::BAD_REQUEST);
    assert!(response.body().await.contains("\"code\":-32700"));
}

#[tokio::test]
async fn other_methods_get_405_with_allow() {
    let (transport, _inbound) =
        StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
    transport.start().await.unwrap();

    let mut response = dispatch(&transport, request_head(Method::PUT, &[]), "").await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(head.header("allow"), Some("GET, POST, DELETE"));
    assert!(response.body().await.contains("Method not allowed."));
}

// ─── Acknowledged messages ──────────────────────────────────────────────────

#[tokio::test]
async fn notification_only_post_is_accepted_and_fanned_out() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(fixed_session_config("S-1"));
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(
        &transport,
        post_head(Some("S-1")),
        r#"[{"jsonrpc":"2.0","method":"notifications/initialized"},{"jsonrpc":"2.0","method":"notifications/progress"}]"#,
    )
    .await;
    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::ACCEPTED);
    assert_eq!(response.body().await, "");

    // Both messages were already delivered by the time the response closed.
    let first = timeout(Duration::from_millis(100), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_notification());
    let second = timeout(Duration::from_millis(100), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.is_notification());
}

// ─── Response routing ───────────────────────────────────────────────────────

#[tokio::test]
async fn sse_stream_stays_open_until_every_request_is_answered() {
    let (transport, mut inbound) =
        StreamableHttpServerTransport::new(fixed_session_config("S-1"));
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(
        &transport,
        post_head(Some("S-1")),
        r#"[{"jsonrpc":"2.0","id":10,"method":"a"},{"jsonrpc":"2.0","id":11,"method":"b"}]"#,
    )
    .await;
    assert_eq!(response.head().await.unwrap().status, StatusCode::OK);
    let _ = inbound.recv().await.unwrap();
    let _ = inbound.recv().await.unwrap();

    transport
        .send(JsonRpcMessage::response(10, json!({})))
        .await
        .unwrap();
    assert!(response.next_chunk().await.is_some());
    // One request still outstanding.
    assert!(
        timeout(Duration::from_millis(50), response.next_chunk())
            .await
            .is_err()
    );

    transport
        .send(JsonRpcMessage::response(11, json!({})))
        .await
        .unwrap();
    assert!(response.next_chunk().await.is_some());
    assert!(response.next_chunk().await.is_none());
}

#[tokio::test]
async fn json_mode_batch_preserves_input_order() {
    let config = StreamableHttpServerConfig {
        enable_json_response: true,
        ..fixed_session_config("S-1")
    };
    let (transport, mut inbound) = StreamableHttpServerTransport::new(config);
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(
        &transport,
        post_head(Some("S-1")),
        r#"[{"jsonrpc":"2.0","id":10,"method":"a"},{"jsonrpc":"2.0","id":11,"method":"b"}]"#,
    )
    .await;
    let _ = inbound.recv().await.unwrap();
    let _ = inbound.recv().await.unwrap();

    // Answer out of order; the body must come back in input order.
    transport
        .send(JsonRpcMessage::response(11, json!({"b":2})))
        .await
        .unwrap();
    transport
        .send(JsonRpcMessage::response(10, json!({"a":1})))
        .await
        .unwrap();

    let head = response.head().await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.header("content-type"), Some("application/json"));
    assert_eq!(head.header("mcp-session-id"), Some("S-1"));
    assert_eq!(
        response.body().await,
        r#"[{"jsonrpc":"2.0","id":10,"result":{"a":1}},{"jsonrpc":"2.0","id":11,"result":{"b":2}}]"#
    );
}

#[tokio::test]
async fn json_mode_single_request_returns_an_object() {
    let config = StreamableHttpServerConfig {
        enable_json_response: true,
        ..fixed_session_config("S-1")
    };
    let (transport, mut inbound) = StreamableHttpServerTransport::new(config);
    transport.start().await.unwrap();
    initialize(&transport, &mut inbound).await;

    let mut response = dispatch(
        &transport,
        post_head(Some("S-1")),
        r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#,
    )
    .await;
    let _ = inbound.recv().await.unwrap();
    transport
        .send(JsonRpcMessage::response(7, json!({"pong":true})))
        .await
        .unwrap();

    assert_eq!(response.head().await.unwrap().status, StatusCode::OK);
    assert_eq!(
        response.body().await,
        r#"{"jsonrpc":"2.0","id":7,"result":{"pong":true}}"#
    );
}
