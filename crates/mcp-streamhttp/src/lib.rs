//! Server-side **Streamable HTTP** transport for the Model Context Protocol.
//!
//! The transport multiplexes JSON-RPC 2.0 over HTTP: a POST carrying
//! requests is answered either with an SSE stream or a single buffered JSON
//! body, a GET opens the standalone stream for server-initiated messages,
//! and a DELETE tears the session down. An optional [`EventStore`] assigns
//! resumable event ids so clients can reconnect with `Last-Event-ID`.
//!
//! ```rust,no_run
//! use mcp_streamhttp::{
//!     JsonRpcMessage, StreamableHttpServerConfig, StreamableHttpServerTransport,
//!     http::axum::StreamableHttpServer,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let (transport, mut inbound) =
//!     StreamableHttpServerTransport::new(StreamableHttpServerConfig::default());
//! transport.start().await?;
//!
//! let server =
//!     StreamableHttpServer::serve(transport.clone(), "127.0.0.1:8080".parse()?).await?;
//!
//! while let Some(message) = inbound.recv().await {
//!     if let JsonRpcMessage::Request(request) = message {
//!         let reply = JsonRpcMessage::response(request.id, serde_json::json!({}));
//!         transport.send(reply).await?;
//!     }
//! }
//! # drop(server);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

pub mod error;
pub mod event_store;
pub mod http;
pub mod model;
pub mod session;
mod sse;
pub mod transport;

/// Opaque server-assigned identifier scoping one client's interaction
/// lifetime.
pub type SessionId = Arc<str>;

/// Identifier of one HTTP response sink (SSE or buffered JSON).
pub type StreamId = Arc<str>;

pub use error::TransportError;
pub use event_store::{EventId, EventStore, InMemoryEventStore};
pub use model::{JsonRpcMessage, JsonRpcPayload, RequestId};
pub use session::{SessionIdGenerator, random_session_id};
pub use transport::{
    DEFAULT_KEEP_ALIVE_INTERVAL, STANDALONE_STREAM_ID, StreamableHttpServerConfig,
    StreamableHttpServerTransport,
};
