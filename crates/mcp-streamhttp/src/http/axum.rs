//! Axum binding for the transport.
//!
//! One route accepts every method and forwards it to the transport; the
//! transport drives an [`AxumResponseSink`] whose committed head and body
//! stream become the `axum` response. [`StreamableHttpServer::serve`] is the
//! batteries-included entry point used by the examples and tests.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::any,
};
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{RequestHead, ResponseSink};
use crate::transport::StreamableHttpServerTransport;

/// Largest accepted POST body, matching the MCP reference servers.
const MAXIMUM_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const BODY_CHANNEL_SIZE: usize = 64;

/// A bound-and-serving transport endpoint.
pub struct StreamableHttpServer {
    transport: StreamableHttpServerTransport,
    ct: CancellationToken,
    local_addr: SocketAddr,
}

impl StreamableHttpServer {
    /// Router exposing the transport at `/`. Nest it wherever the MCP
    /// endpoint should live.
    pub fn router(transport: StreamableHttpServerTransport) -> Router {
        Router::new()
            .route("/", any(handle_http))
            .with_state(transport)
    }

    /// Bind `addr` and serve the transport until
    /// [`cancel`](Self::cancel) is called.
    pub async fn serve(
        transport: StreamableHttpServerTransport,
        addr: SocketAddr,
    ) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let ct = CancellationToken::new();
        let router = Self::router(transport.clone());
        let child = ct.child_token();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            child.cancelled().await;
            tracing::info!("streamable http server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "streamable http server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("streamable-http-server", bind_address = %local_addr)),
        );
        Ok(Self {
            transport,
            ct,
            local_addr,
        })
    }

    pub fn transport(&self) -> &StreamableHttpServerTransport {
        &self.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Open streams are closed by
    /// [`StreamableHttpServerTransport::close`], not by this.
    pub fn cancel(&self) {
        self.ct.cancel();
    }
}

async fn handle_http(
    State(transport): State<StreamableHttpServerTransport>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAXIMUM_MESSAGE_SIZE).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(%error, "failed to read request body");
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "error": { "code": -32000, "message": "Request body too large" },
                "id": null,
            })
            .to_string();
            return (StatusCode::PAYLOAD_TOO_LARGE, body).into_response();
        }
    };
    let head = RequestHead::new(parts.method, parts.headers);
    let (sink, responded) = AxumResponseSink::new();
    tokio::spawn(async move {
        if let Err(error) = transport.handle_request(head, bytes, Box::new(sink)).await {
            tracing::debug!(%error, "request handling failed");
        }
    });
    match responded.await {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// [`ResponseSink`] backed by an `axum` response.
///
/// Until the first flush everything is buffered; flushing commits the status
/// and headers with a channel-backed streaming body, and later writes push
/// chunks into that channel. Closing an uncommitted sink sends the whole
/// response in one piece.
pub struct AxumResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    respond: Option<oneshot::Sender<Response>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
    pending: String,
    done: CancellationToken,
}

impl AxumResponseSink {
    pub fn new() -> (Self, oneshot::Receiver<Response>) {
        let (respond, responded) = oneshot::channel();
        (
            Self {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                respond: Some(respond),
                body_tx: None,
                pending: String::new(),
                done: CancellationToken::new(),
            },
            responded,
        )
    }

    fn committed(&self) -> bool {
        self.body_tx.is_some()
    }

    fn respond_with(&mut self, body: Body) -> std::io::Result<()> {
        let Some(respond) = self.respond.take() else {
            return Err(std::io::Error::other("response already sent"));
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        respond
            .send(response)
            .map_err(|_| std::io::Error::other("request handler dropped"))
    }
}

#[async_trait]
impl ResponseSink for AxumResponseSink {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn set_header(&mut self, name: &str, value: &str) {
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value))
        else {
            tracing::debug!(name, "dropping invalid response header");
            return;
        };
        self.headers.insert(name, value);
    }

    async fn write(&mut self, text: &str) -> std::io::Result<()> {
        match &self.body_tx {
            Some(body_tx) => body_tx
                .send(Bytes::copy_from_slice(text.as_bytes()))
                .await
                .map_err(|_| std::io::Error::other("client disconnected")),
            None => {
                self.pending.push_str(text);
                Ok(())
            }
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if self.committed() {
            // Chunks are pushed to the connection as they are written.
            return Ok(());
        }
        let (body_tx, body_rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_SIZE);
        let stream = ReceiverStream::new(body_rx).map(Ok::<_, std::convert::Infallible>);
        self.respond_with(Body::from_stream(stream))?;
        // The receiver side of the body channel lives inside the hyper
        // connection task; it dropping is the disconnect signal.
        let watched = body_tx.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            watched.closed().await;
            done.cancel();
        });
        if !self.pending.is_empty() {
            let first = Bytes::from(std::mem::take(&mut self.pending));
            body_tx
                .send(first)
                .await
                .map_err(|_| std::io::Error::other("client disconnected"))?;
        }
        self.body_tx = Some(body_tx);
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if self.committed() {
            // Dropping the sender ends the body stream.
            self.body_tx = None;
        } else {
            let body = Body::from(std::mem::take(&mut self.pending));
            self.respond_with(body)?;
        }
        self.done.cancel();
        Ok(())
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}
