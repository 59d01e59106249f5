//! Transport error taxonomy.
//!
//! Protocol violations carry their HTTP status and JSON-RPC error code and
//! are rendered as error envelopes on the rejected response. Internal
//! variants never reach the wire; they are surfaced through the `on_error`
//! callback or returned to the caller of [`send`].
//!
//! [`send`]: crate::transport::StreamableHttpServerTransport::send

use http::StatusCode;

use crate::model::{ErrorCode, RequestId};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Bad Request: Server not initialized")]
    NotInitialized,
    #[error("Bad Request: Mcp-Session-Id header is required")]
    MissingSessionHeader,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Invalid Request: Server already initialized")]
    AlreadyInitialized,
    #[error("Invalid Request: Only one initialization request is allowed")]
    InitializationBatch,
    #[error("Not Acceptable: Client must accept both application/json and text/event-stream")]
    NotAcceptablePost,
    #[error("Not Acceptable: Client must accept text/event-stream")]
    NotAcceptableGet,
    #[error("Unsupported Media Type: Content-Type must be application/json")]
    UnsupportedMediaType,
    #[error("Conflict: Only one SSE stream is allowed per session")]
    DuplicateStandaloneStream,
    #[error("Method not allowed.")]
    MethodNotAllowed,
    #[error("Bad Request: Transport is closed")]
    Closed,

    /// A response or error was handed to `send` without a correlated
    /// request; such messages may never go to the standalone stream.
    #[error("responses must be correlated to a request id")]
    ResponseNotCorrelated,
    /// The upper layer produced a message for a request id with no open
    /// stream (never routed, or the client disconnected).
    #[error("no open connection for request id {0}")]
    NoConnection(RequestId),
    #[error("transport already started")]
    AlreadyStarted,
    #[error("event store error: {0}")]
    EventStore(BoxError),
    #[error("response sink error: {0}")]
    Sink(#[from] std::io::Error),
}

impl TransportError {
    /// HTTP status for the rejection response. Internal variants map to 500
    /// but are never written to the wire.
    pub fn http_status(&self) -> StatusCode {
        match self {
            TransportError::Parse(_)
            | TransportError::NotInitialized
            | TransportError::MissingSessionHeader
            | TransportError::AlreadyInitialized
            | TransportError::InitializationBatch
            | TransportError::Closed => StatusCode::BAD_REQUEST,
            TransportError::SessionNotFound => StatusCode::NOT_FOUND,
            TransportError::NotAcceptablePost | TransportError::NotAcceptableGet => {
                StatusCode::NOT_ACCEPTABLE
            }
            TransportError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TransportError::DuplicateStandaloneStream => StatusCode::CONFLICT,
            TransportError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn json_rpc_code(&self) -> ErrorCode {
        match self {
            TransportError::Parse(_) => ErrorCode::PARSE_ERROR,
            TransportError::AlreadyInitialized | TransportError::InitializationBatch => {
                ErrorCode::INVALID_REQUEST
            }
            TransportError::SessionNotFound => ErrorCode::SESSION_NOT_FOUND,
            _ => ErrorCode::TRANSPORT_ERROR,
        }
    }

    /// JSON-RPC error envelope written as the body of a rejection response.
    pub(crate) fn error_body(&self) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.json_rpc_code().0,
                "message": self.to_string(),
            },
            "id": null,
        })
        .to_string()
    }
}
