//! Abstract HTTP adapter consumed by the transport.
//!
//! The transport never touches a concrete HTTP stack. Bindings hand it a
//! [`RequestHead`] plus the collected body bytes and a [`ResponseSink`] it
//! owns until close. Two sink disciplines exist:
//!
//! * *buffered* — writes accumulate; status, headers and body go to the wire
//!   together when `close` is called (plain JSON responses);
//! * *streaming* — status and headers commit at the first `flush`; every
//!   later `write` pushes a chunk immediately (SSE).
//!
//! The transport signals which discipline it wants through the content type
//! it sets and by whether it flushes before closing.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, header};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "axum")]
pub mod axum;
pub mod local;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";

/// Method and headers of an inbound request, detached from any HTTP stack.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, headers: HeaderMap) -> Self {
        Self { method, headers }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Case-insensitive single-value header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// True when the Accept header contains `mime` as a substring, the
    /// matching rule the MCP spec prescribes for this transport.
    pub fn accepts(&self, mime: &str) -> bool {
        self.header(header::ACCEPT.as_str())
            .is_some_and(|accept| accept.to_ascii_lowercase().contains(mime))
    }

    /// MIME essence of the Content-Type header, lowercased, parameters
    /// (charset etc.) stripped.
    pub fn content_type(&self) -> Option<String> {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(|value| value.split(';').next())
            .map(|essence| essence.trim().to_ascii_lowercase())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.header(HEADER_SESSION_ID)
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.header(HEADER_LAST_EVENT_ID)
    }
}

/// Write side of one HTTP response, owned by the transport from registration
/// until close.
///
/// Write and flush failures mean the client is gone; the transport tears the
/// stream down and never retries.
#[async_trait]
pub trait ResponseSink: Send {
    fn set_status(&mut self, status: StatusCode);

    /// Invalid names or values are dropped; headers set after the response
    /// head is committed have no effect.
    fn set_header(&mut self, name: &str, value: &str);

    /// Buffering hint. Adapters may ignore it.
    fn buffer_output(&mut self, buffered: bool) {
        let _ = buffered;
    }

    async fn write(&mut self, text: &str) -> std::io::Result<()>;

    /// Best-effort push to the wire; commits status and headers on first use.
    async fn flush(&mut self) -> std::io::Result<()>;

    /// Terminal. In buffered mode this is what sends the response.
    async fn close(&mut self) -> std::io::Result<()>;

    /// Cancelled when the wire is closed, whether by the client or by
    /// `close`. Used to detect client disconnects.
    fn done(&self) -> CancellationToken;
}
