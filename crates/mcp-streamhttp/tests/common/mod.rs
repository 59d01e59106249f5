#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use mcp_streamhttp::{
    JsonRpcMessage, StreamableHttpServerConfig, StreamableHttpServerTransport,
    http::{
        RequestHead,
        local::{LocalResponse, local_channel},
    },
};
use tokio::sync::mpsc;

pub const ACCEPT_BOTH: &str = "application/json, text/event-stream";
pub const ACCEPT_SSE: &str = "text/event-stream";

pub const INIT_BODY: &str = r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{}}"#;
pub const INIT_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":0,"result":{}}"#;

pub fn request_head(method: Method, pairs: &[(&str, &str)]) -> RequestHead {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(
            HeaderName::try_from(*name).unwrap(),
            HeaderValue::try_from(*value).unwrap(),
        );
    }
    RequestHead::new(method, headers)
}

pub fn post_head(session: Option<&str>) -> RequestHead {
    let mut pairs = vec![("accept", ACCEPT_BOTH), ("content-type", "application/json")];
    if let Some(session) = session {
        pairs.push(("mcp-session-id", session));
    }
    request_head(Method::POST, &pairs)
}

pub fn get_head(session: Option<&str>, last_event_id: Option<&str>) -> RequestHead {
    let mut pairs = vec![("accept", ACCEPT_SSE)];
    if let Some(session) = session {
        pairs.push(("mcp-session-id", session));
    }
    if let Some(last_event_id) = last_event_id {
        pairs.push(("last-event-id", last_event_id));
    }
    request_head(Method::GET, &pairs)
}

pub fn delete_head(session: Option<&str>) -> RequestHead {
    let mut pairs = Vec::new();
    if let Some(session) = session {
        pairs.push(("mcp-session-id", session));
    }
    request_head(Method::DELETE, &pairs)
}

/// Stateful config with a deterministic session id.
pub fn fixed_session_config(session: &str) -> StreamableHttpServerConfig {
    let session: Arc<str> = session.into();
    StreamableHttpServerConfig {
        session_id_generator: Some(Arc::new(move || session.clone())),
        ..Default::default()
    }
}

/// Run one request through the transport via the local adapter.
pub async fn dispatch(
    transport: &StreamableHttpServerTransport,
    head: RequestHead,
    body: &str,
) -> LocalResponse {
    let (sink, response) = local_channel();
    transport
        .handle_request(head, Bytes::from(body.to_owned()), Box::new(sink))
        .await
        .unwrap();
    response
}

/// Drive the initialization handshake to completion and return the session
/// id the transport assigned (if stateful).
pub async fn initialize(
    transport: &StreamableHttpServerTransport,
    inbound: &mut mpsc::Receiver<JsonRpcMessage>,
) -> Option<String> {
    let mut response = dispatch(transport, post_head(None), INIT_BODY).await;
    let request = inbound.recv().await.unwrap();
    assert!(request.is_initialize_request());
    transport
        .send(serde_json::from_str(INIT_RESPONSE).unwrap())
        .await
        .unwrap();
    let head = response.head().await.unwrap();
    let session = head.header("mcp-session-id").map(str::to_owned);
    // Drain until the response stream completes.
    while response.next_chunk().await.is_some() {}
    session
}

/// One parsed SSE event.
#[derive(Debug, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: Option<String>,
}

pub fn parse_sse_event(chunk: &str) -> SseEvent {
    let mut parsed = SseEvent::default();
    for line in chunk.lines() {
        if let Some(value) = line.strip_prefix("event: ") {
            parsed.event = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("id: ") {
            parsed.id = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("data: ") {
            parsed.data = Some(value.to_owned());
        }
    }
    parsed
}
