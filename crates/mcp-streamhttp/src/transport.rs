//! The Streamable HTTP transport state machine.
//!
//! One [`StreamableHttpServerTransport`] serves one MCP session. Bindings
//! feed it HTTP requests; inbound JSON-RPC messages come out of the channel
//! returned by [`new`](StreamableHttpServerTransport::new), and the protocol
//! layer pushes outbound messages back through [`send`]. The transport
//! correlates each response to the HTTP response sink of the POST that
//! carried its request, either as an SSE stream or as a buffered JSON body.
//!
//! All shared state lives in one map set guarded by a single async mutex.
//! That lock is never held across sink I/O or upper-layer dispatch: routing
//! is resolved under the lock, writes go through the sink's own mutex (one
//! per registered stream, serializing its writers), and the state lock is
//! re-acquired afterwards for bookkeeping. A stalled client can therefore
//! slow down only its own stream, never the whole session.
//!
//! [`send`]: StreamableHttpServerTransport::send

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, header};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::event_store::{EventId, EventStore};
use crate::http::{
    EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE, RequestHead, ResponseSink,
};
use crate::model::{JsonRpcMessage, JsonRpcPayload, RequestId};
use crate::session::{SessionIdGenerator, SessionState, random_session_id};
use crate::sse;
use crate::{SessionId, StreamId};

/// Reserved id of the single server-initiated SSE stream opened by GET.
pub const STANDALONE_STREAM_ID: &str = "_GET_stream";

/// Keep-alive comment period used when the config does not override it.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(25);

const INBOUND_CHANNEL_SIZE: usize = 64;

/// Construction parameters for [`StreamableHttpServerTransport`].
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// Yields session ids for newly initialized sessions; `None` runs the
    /// transport stateless (no session header exchanged or validated).
    pub session_id_generator: Option<SessionIdGenerator>,
    /// Answer POSTs with a single buffered JSON body instead of SSE.
    pub enable_json_response: bool,
    /// Assigns resumable event ids to SSE frames and replays them on GET
    /// with `Last-Event-ID`.
    pub event_store: Option<Arc<dyn EventStore>>,
    /// Period of SSE keep-alive comments; `None` or zero disables them.
    pub sse_keep_alive: Option<Duration>,
    /// Invoked once a session id has been assigned.
    pub on_session_initialized: Option<Arc<dyn Fn(SessionId) + Send + Sync>>,
    /// Invoked on internal invariant breaches (never for client errors).
    pub on_error: Option<Arc<dyn Fn(TransportError) + Send + Sync>>,
    /// Invoked once when the transport closes.
    pub on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            session_id_generator: Some(Arc::new(random_session_id)),
            enable_json_response: false,
            event_store: None,
            sse_keep_alive: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            on_session_initialized: None,
            on_error: None,
            on_close: None,
        }
    }
}

impl StreamableHttpServerConfig {
    /// Config for a transport that never assigns session ids.
    pub fn stateless() -> Self {
        Self {
            session_id_generator: None,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("stateful", &self.session_id_generator.is_some())
            .field("enable_json_response", &self.enable_json_response)
            .field("event_store", &self.event_store.is_some())
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field(
                "on_session_initialized",
                &self.on_session_initialized.is_some(),
            )
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Server side of the MCP Streamable HTTP transport.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: StreamableHttpServerConfig,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    state: Mutex<TransportState>,
}

struct TransportState {
    started: bool,
    closed: bool,
    session: SessionState,
    /// Open response sinks by stream id.
    streams: HashMap<StreamId, StreamEntry>,
    /// Which stream carries the response for each inbound request id.
    request_to_stream: HashMap<RequestId, StreamId>,
    /// Responses accumulated until their stream is complete.
    request_responses: HashMap<RequestId, JsonRpcMessage>,
}

struct StreamEntry {
    channel: ResponseChannel,
    /// Request ids served by this stream, in input order. Empty for the
    /// standalone GET stream.
    request_ids: Vec<RequestId>,
    keep_alive: CancellationToken,
}

/// A registered sink. The per-sink mutex serializes its writers; the
/// session-wide state lock is never held across sink I/O.
type SharedSink = Arc<Mutex<Box<dyn ResponseSink>>>;

/// The two response disciplines a stream can be in. Keeping the sink inside
/// the variant makes `send` routing a total match.
enum ResponseChannel {
    SseStreaming(SharedSink),
    JsonBuffered(SharedSink),
}

impl ResponseChannel {
    fn sink(&self) -> SharedSink {
        match self {
            ResponseChannel::SseStreaming(sink) | ResponseChannel::JsonBuffered(sink) => {
                sink.clone()
            }
        }
    }

    fn into_sink(self) -> SharedSink {
        match self {
            ResponseChannel::SseStreaming(sink) | ResponseChannel::JsonBuffered(sink) => sink,
        }
    }
}

fn random_stream_id() -> StreamId {
    uuid::Uuid::new_v4().to_string().into()
}

impl TransportInner {
    /// Remove `stream_id` only while it is still backed by `sink`; a resumed
    /// connection may have replaced the entry since the caller looked it up.
    async fn drop_stream(&self, stream_id: &str, sink: &SharedSink) {
        let mut state = self.state.lock().await;
        let current = state
            .streams
            .get(stream_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.channel.sink(), sink));
        if current {
            if let Some(entry) = state.streams.remove(stream_id) {
                entry.keep_alive.cancel();
            }
        }
    }
}

impl StreamableHttpServerTransport {
    /// Create a transport and the channel its inbound messages arrive on.
    pub fn new(config: StreamableHttpServerConfig) -> (Self, mpsc::Receiver<JsonRpcMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let generator = config.session_id_generator.clone();
        let transport = Self {
            inner: Arc::new(TransportInner {
                config,
                inbound_tx,
                state: Mutex::new(TransportState {
                    started: false,
                    closed: false,
                    session: SessionState::new(generator),
                    streams: HashMap::new(),
                    request_to_stream: HashMap::new(),
                    request_responses: HashMap::new(),
                }),
            }),
        };
        (transport, inbound_rx)
    }

    /// Mark the transport started. Calling twice is a state error.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        if state.started {
            return Err(TransportError::AlreadyStarted);
        }
        state.started = true;
        Ok(())
    }

    /// The session id assigned at initialization, if any.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.state.lock().await.session.session_id()
    }

    /// Handle one HTTP request, writing the response into `sink`.
    ///
    /// Protocol violations are answered on the sink and are not errors from
    /// this method's point of view.
    pub async fn handle_request(
        &self,
        head: RequestHead,
        body: Bytes,
        sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        if head.method() == Method::POST {
            if let Some(error) = post_gate(&head) {
                return self.reject(sink, &error).await;
            }
            let payload: JsonRpcPayload = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(error) => return self.reject(sink, &TransportError::Parse(error)).await,
            };
            self.handle_post(head, payload, sink).await
        } else {
            self.handle_non_post(head, sink).await
        }
    }

    /// Like [`handle_request`](Self::handle_request) for bindings that have
    /// already parsed the POST body upstream.
    pub async fn handle_request_parsed(
        &self,
        head: RequestHead,
        payload: JsonRpcPayload,
        sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        if head.method() == Method::POST {
            if let Some(error) = post_gate(&head) {
                return self.reject(sink, &error).await;
            }
            self.handle_post(head, payload, sink).await
        } else {
            self.handle_non_post(head, sink).await
        }
    }

    async fn handle_non_post(
        &self,
        head: RequestHead,
        mut sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        if head.method() == Method::GET {
            self.handle_get(head, sink).await
        } else if head.method() == Method::DELETE {
            self.handle_delete(head, sink).await
        } else {
            tracing::debug!(method = %head.method(), "method not allowed");
            sink.set_status(StatusCode::METHOD_NOT_ALLOWED);
            sink.set_header(header::ALLOW.as_str(), "GET, POST, DELETE");
            sink.set_header(header::CONTENT_TYPE.as_str(), JSON_MIME_TYPE);
            let _ = sink
                .write(&TransportError::MethodNotAllowed.error_body())
                .await;
            let _ = sink.close().await;
            Ok(())
        }
    }

    async fn handle_post(
        &self,
        head: RequestHead,
        payload: JsonRpcPayload,
        mut sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        let messages = payload.into_messages();
        let contains_init = messages.iter().any(JsonRpcMessage::is_initialize_request);

        // Initialization gating and session validation under one lock.
        let gate = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                Err(TransportError::Closed)
            } else if contains_init {
                if messages.len() > 1 {
                    Err(TransportError::InitializationBatch)
                } else {
                    state.session.initialize().map(|assigned| (assigned, true))
                }
            } else {
                state
                    .session
                    .validate(head.session_id())
                    .map(|()| (state.session.session_id(), false))
            }
        };
        let session_id = match gate {
            Ok((session_id, newly_initialized)) => {
                if newly_initialized {
                    tracing::info!(session_id = ?session_id, "session initialized");
                    if let (Some(callback), Some(id)) =
                        (&self.inner.config.on_session_initialized, &session_id)
                    {
                        callback(id.clone());
                    }
                }
                session_id
            }
            Err(error) => return self.reject(sink, &error).await,
        };

        let has_requests = messages.iter().any(JsonRpcMessage::is_request);
        if !has_requests {
            // Notifications and client responses are acknowledged up front;
            // every message still reaches the upper layer before the
            // response completes.
            sink.set_status(StatusCode::ACCEPTED);
            self.fan_out(messages).await;
            let _ = sink.close().await;
            return Ok(());
        }

        let stream_id = random_stream_id();
        let request_ids: Vec<RequestId> = messages
            .iter()
            .filter_map(|message| match message {
                JsonRpcMessage::Request(request) => Some(request.id.clone()),
                _ => None,
            })
            .collect();
        tracing::debug!(%stream_id, requests = request_ids.len(), "opening response stream");

        sink.set_status(StatusCode::OK);
        if let Some(id) = &session_id {
            sink.set_header(HEADER_SESSION_ID, id);
        }
        let done = sink.done();
        let sse_mode = !self.inner.config.enable_json_response;
        let channel = if sse_mode {
            sink.set_header(header::CONTENT_TYPE.as_str(), EVENT_STREAM_MIME_TYPE);
            sink.set_header(header::CACHE_CONTROL.as_str(), "no-cache, no-transform");
            sink.set_header(header::CONNECTION.as_str(), "keep-alive");
            sink.buffer_output(false);
            if sink.flush().await.is_err() {
                tracing::debug!(%stream_id, "client gone before SSE headers were sent");
                return Ok(());
            }
            ResponseChannel::SseStreaming(Arc::new(Mutex::new(sink)))
        } else {
            sink.set_header(header::CONTENT_TYPE.as_str(), JSON_MIME_TYPE);
            sink.buffer_output(true);
            ResponseChannel::JsonBuffered(Arc::new(Mutex::new(sink)))
        };

        let sink_handle = channel.sink();
        let keep_alive = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(state);
                let sink = channel.into_sink();
                let _ = sink.lock().await.close().await;
                return Ok(());
            }
            for id in &request_ids {
                state.request_to_stream.insert(id.clone(), stream_id.clone());
            }
            state.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    channel,
                    request_ids,
                    keep_alive: keep_alive.clone(),
                },
            );
        }
        if sse_mode {
            self.spawn_keep_alive(stream_id.clone(), keep_alive);
        }
        self.spawn_disconnect_watcher(stream_id, done, sink_handle);

        self.fan_out(messages).await;
        Ok(())
    }

    async fn handle_get(
        &self,
        head: RequestHead,
        sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        if !head.accepts(EVENT_STREAM_MIME_TYPE) {
            return self.reject(sink, &TransportError::NotAcceptableGet).await;
        }

        let session_id = {
            let state = self.inner.state.lock().await;
            if state.closed {
                Err(TransportError::Closed)
            } else {
                state
                    .session
                    .validate(head.session_id())
                    .map(|()| state.session.session_id())
            }
        };
        let session_id = match session_id {
            Ok(id) => id,
            Err(error) => return self.reject(sink, &error).await,
        };

        if let (Some(last_event_id), Some(store)) = (
            head.last_event_id().map(str::to_owned),
            self.inner.config.event_store.clone(),
        ) {
            return self.resume_stream(last_event_id, store, session_id, sink).await;
        }

        let done = sink.done();
        let keep_alive = CancellationToken::new();
        let shared: SharedSink = Arc::new(Mutex::new(sink));
        // Holding the sink's own lock from registration through the header
        // flush keeps a concurrent `send` from writing a frame before the
        // headers; the state lock is released before any sink I/O.
        let mut sink_guard = shared.clone().lock_owned().await;
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(state);
                let _ = sink_guard.close().await;
                return Ok(());
            }
            if state.streams.contains_key(STANDALONE_STREAM_ID) {
                drop(state);
                self.write_rejection(
                    sink_guard.as_mut(),
                    &TransportError::DuplicateStandaloneStream,
                )
                .await;
                return Ok(());
            }
            state.streams.insert(
                Arc::from(STANDALONE_STREAM_ID),
                StreamEntry {
                    channel: ResponseChannel::SseStreaming(shared.clone()),
                    request_ids: Vec::new(),
                    keep_alive: keep_alive.clone(),
                },
            );
        }
        sink_guard.set_status(StatusCode::OK);
        sink_guard.set_header(header::CONTENT_TYPE.as_str(), EVENT_STREAM_MIME_TYPE);
        sink_guard.set_header(header::CACHE_CONTROL.as_str(), "no-cache, no-transform");
        sink_guard.set_header(header::CONNECTION.as_str(), "keep-alive");
        if let Some(id) = &session_id {
            sink_guard.set_header(HEADER_SESSION_ID, id);
        }
        sink_guard.buffer_output(false);
        let flushed = sink_guard.flush().await;
        drop(sink_guard);
        if flushed.is_err() {
            tracing::debug!("client gone before standalone SSE headers were sent");
            self.inner.drop_stream(STANDALONE_STREAM_ID, &shared).await;
            return Ok(());
        }
        tracing::debug!("standalone SSE stream opened");
        self.spawn_keep_alive(Arc::from(STANDALONE_STREAM_ID), keep_alive);
        self.spawn_disconnect_watcher(Arc::from(STANDALONE_STREAM_ID), done, shared);
        Ok(())
    }

    /// Resumption path: replay stored events after `last_event_id`, then
    /// adopt this connection as the live sink for the replayed stream.
    async fn resume_stream(
        &self,
        last_event_id: String,
        store: Arc<dyn EventStore>,
        session_id: Option<SessionId>,
        mut sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        tracing::debug!(%last_event_id, "resuming SSE stream");
        sink.set_status(StatusCode::OK);
        sink.set_header(header::CONTENT_TYPE.as_str(), EVENT_STREAM_MIME_TYPE);
        sink.set_header(header::CACHE_CONTROL.as_str(), "no-cache, no-transform");
        sink.set_header(header::CONNECTION.as_str(), "keep-alive");
        if let Some(id) = &session_id {
            sink.set_header(HEADER_SESSION_ID, id);
        }
        if sink.flush().await.is_err() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<(EventId, JsonRpcMessage)>(16);
        let replay = store.replay_events_after(&last_event_id, tx);
        let writer = async {
            while let Some((event_id, message)) = rx.recv().await {
                let frame = sse::message_event(&message, Some(&event_id))
                    .map_err(std::io::Error::other)?;
                sink.write(&frame).await?;
                sink.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (replayed, written) = tokio::join!(replay, writer);
        let stream_id = match replayed {
            Ok(stream_id) => stream_id,
            Err(error) => {
                self.report_error(TransportError::EventStore(error));
                let _ = sink.close().await;
                return Ok(());
            }
        };
        if written.is_err() {
            tracing::debug!(%stream_id, "client gone during replay");
            return Ok(());
        }

        let done = sink.done();
        let keep_alive = CancellationToken::new();
        let shared: SharedSink = Arc::new(Mutex::new(sink));
        let replaced = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(state);
                let _ = shared.lock().await.close().await;
                return Ok(());
            }
            let request_ids: Vec<RequestId> = state
                .request_to_stream
                .iter()
                .filter(|(_, mapped)| **mapped == stream_id)
                .map(|(id, _)| id.clone())
                .collect();
            state.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    channel: ResponseChannel::SseStreaming(shared.clone()),
                    request_ids,
                    keep_alive: keep_alive.clone(),
                },
            )
        };
        if let Some(previous) = replaced {
            // A connection that was still registered for this stream is
            // superseded by the resumed one; close it rather than leaking
            // the old response.
            previous.keep_alive.cancel();
            let sink = previous.channel.into_sink();
            let _ = sink.lock().await.close().await;
        }
        self.spawn_keep_alive(stream_id.clone(), keep_alive);
        self.spawn_disconnect_watcher(stream_id, done, shared);
        Ok(())
    }

    async fn handle_delete(
        &self,
        head: RequestHead,
        mut sink: Box<dyn ResponseSink>,
    ) -> Result<(), TransportError> {
        let validation = {
            let state = self.inner.state.lock().await;
            if state.closed {
                Err(TransportError::Closed)
            } else {
                state.session.validate(head.session_id())
            }
        };
        if let Err(error) = validation {
            return self.reject(sink, &error).await;
        }
        tracing::info!("session terminated by DELETE");
        self.close().await?;
        sink.set_status(StatusCode::OK);
        let _ = sink.close().await;
        Ok(())
    }

    /// Send a message to the client, routed by its correlated request id.
    ///
    /// Responses and errors route by their own id; everything else goes to
    /// the standalone GET stream. Use
    /// [`send_related`](Self::send_related) to tie a notification to a
    /// specific request's stream.
    pub async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.send_related(message, None).await
    }

    /// Send a message whose routing key is `related_request_id` when the
    /// message itself carries no response id.
    pub async fn send_related(
        &self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) -> Result<(), TransportError> {
        let key = message.response_id().cloned().or(related_request_id);
        match key {
            Some(request_id) => self.send_correlated(message, request_id).await,
            None => self.send_standalone(message).await,
        }
    }

    async fn send_standalone(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if message.is_response() || message.is_error() {
            return Err(TransportError::ResponseNotCorrelated);
        }
        let sink = {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            let Some(entry) = state.streams.get(STANDALONE_STREAM_ID) else {
                tracing::debug!("no standalone SSE subscriber, dropping message");
                return Ok(());
            };
            entry.channel.sink()
        };
        // The sink lock also covers the event-store call so assigned ids
        // match the order frames hit the wire.
        let mut guard = sink.lock().await;
        let event_id = match &self.inner.config.event_store {
            Some(store) => Some(
                store
                    .store_event(STANDALONE_STREAM_ID, &message)
                    .await
                    .map_err(TransportError::EventStore)?,
            ),
            None => None,
        };
        let frame = sse::message_event(&message, event_id.as_deref())?;
        let written = match guard.write(&frame).await {
            Ok(()) => guard.flush().await,
            Err(error) => Err(error),
        };
        drop(guard);
        if written.is_err() {
            tracing::debug!("standalone stream write failed, dropping stream");
            self.inner.drop_stream(STANDALONE_STREAM_ID, &sink).await;
        }
        Ok(())
    }

    async fn send_correlated(
        &self,
        message: JsonRpcMessage,
        request_id: RequestId,
    ) -> Result<(), TransportError> {
        // Resolve routing under the state lock; sink I/O happens after the
        // lock is released, serialized by the sink's own mutex.
        let (stream_id, sse_sink) = {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            let Some(stream_id) = state.request_to_stream.get(&request_id).cloned() else {
                let error = TransportError::NoConnection(request_id.clone());
                self.report_error(TransportError::NoConnection(request_id));
                return Err(error);
            };
            let Some(entry) = state.streams.get(&stream_id) else {
                // The client disconnected after the request was routed; the
                // message is dropped and the breach surfaced, but the
                // transport stays live.
                self.report_error(TransportError::NoConnection(request_id));
                return Ok(());
            };
            let sse_sink = match &entry.channel {
                ResponseChannel::SseStreaming(sink) => Some(sink.clone()),
                ResponseChannel::JsonBuffered(_) => None,
            };
            (stream_id, sse_sink)
        };
        let is_final = message.is_response() || message.is_error();

        if let Some(sink) = sse_sink {
            // The sink lock also covers the event-store call so assigned
            // ids match the order frames hit the wire.
            let mut guard = sink.lock().await;
            let event_id = match &self.inner.config.event_store {
                Some(store) => Some(
                    store
                        .store_event(&stream_id, &message)
                        .await
                        .map_err(TransportError::EventStore)?,
                ),
                None => None,
            };
            let frame = sse::message_event(&message, event_id.as_deref())?;
            let written = match guard.write(&frame).await {
                Ok(()) => guard.flush().await,
                Err(error) => Err(error),
            };
            drop(guard);
            if written.is_err() {
                tracing::debug!(%stream_id, "SSE write failed, dropping stream");
                self.inner.drop_stream(&stream_id, &sink).await;
                return Ok(());
            }
            if !is_final {
                return Ok(());
            }
            let completed = {
                let mut guard = self.inner.state.lock().await;
                let state = &mut *guard;
                state.request_responses.insert(request_id, message);
                let complete = state.streams.get(&stream_id).is_some_and(|entry| {
                    entry
                        .request_ids
                        .iter()
                        .all(|id| state.request_responses.contains_key(id))
                });
                if complete {
                    state.streams.remove(&stream_id).map(|entry| {
                        entry.keep_alive.cancel();
                        for id in &entry.request_ids {
                            state.request_to_stream.remove(id);
                            state.request_responses.remove(id);
                        }
                        entry
                    })
                } else {
                    None
                }
            };
            if let Some(entry) = completed {
                tracing::debug!(%stream_id, "all responses sent, closing stream");
                let sink = entry.channel.into_sink();
                let _ = sink.lock().await.close().await;
            }
        } else {
            if !is_final {
                tracing::debug!(%stream_id, "dropping non-response message in JSON mode");
                return Ok(());
            }
            let completed = {
                let mut guard = self.inner.state.lock().await;
                let state = &mut *guard;
                state.request_responses.insert(request_id, message);
                let complete = state.streams.get(&stream_id).is_some_and(|entry| {
                    entry
                        .request_ids
                        .iter()
                        .all(|id| state.request_responses.contains_key(id))
                });
                if complete {
                    state.streams.remove(&stream_id).map(|entry| {
                        entry.keep_alive.cancel();
                        let mut responses = Vec::with_capacity(entry.request_ids.len());
                        for id in &entry.request_ids {
                            state.request_to_stream.remove(id);
                            if let Some(response) = state.request_responses.remove(id) {
                                responses.push(response);
                            }
                        }
                        (entry, responses)
                    })
                } else {
                    None
                }
            };
            if let Some((entry, responses)) = completed {
                let body = if entry.request_ids.len() == 1 && responses.len() == 1 {
                    serde_json::to_string(&responses[0])
                } else {
                    serde_json::to_string(&responses)
                };
                tracing::debug!(%stream_id, "all responses ready, sending JSON body");
                let sink = entry.channel.into_sink();
                let mut guard = sink.lock().await;
                match body {
                    Ok(body) => {
                        let _ = guard.write(&body).await;
                    }
                    Err(error) => self.report_error(TransportError::Parse(error)),
                }
                let _ = guard.close().await;
            }
        }
        Ok(())
    }

    /// Close every open stream exactly once, clear all correlation state and
    /// fire `on_close`. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        let entries: Vec<StreamEntry> = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.request_to_stream.clear();
            state.request_responses.clear();
            state.streams.drain().map(|(_, entry)| entry).collect()
        };
        tracing::info!(streams = entries.len(), "transport closing");
        for entry in entries {
            entry.keep_alive.cancel();
            let sink = entry.channel.into_sink();
            let _ = sink.lock().await.close().await;
        }
        if let Some(callback) = &self.inner.config.on_close {
            callback();
        }
        Ok(())
    }

    async fn fan_out(&self, messages: Vec<JsonRpcMessage>) {
        for message in messages {
            if self.inner.inbound_tx.send(message).await.is_err() {
                tracing::warn!("inbound receiver dropped, discarding message");
            }
        }
    }

    async fn reject(
        &self,
        mut sink: Box<dyn ResponseSink>,
        error: &TransportError,
    ) -> Result<(), TransportError> {
        self.write_rejection(sink.as_mut(), error).await;
        Ok(())
    }

    async fn write_rejection(&self, sink: &mut dyn ResponseSink, error: &TransportError) {
        tracing::debug!(%error, status = %error.http_status(), "rejecting request");
        sink.set_status(error.http_status());
        sink.set_header(header::CONTENT_TYPE.as_str(), JSON_MIME_TYPE);
        let _ = sink.write(&error.error_body()).await;
        let _ = sink.close().await;
    }

    fn report_error(&self, error: TransportError) {
        tracing::error!(%error, "transport error");
        if let Some(callback) = &self.inner.config.on_error {
            callback(error);
        }
    }

    fn spawn_keep_alive(&self, stream_id: StreamId, token: CancellationToken) {
        let Some(period) = self.inner.config.sse_keep_alive else {
            return;
        };
        if period.is_zero() {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the stream just opened.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let sink = {
                    let state = inner.state.lock().await;
                    let Some(entry) = state.streams.get(&stream_id) else {
                        break;
                    };
                    entry.channel.sink()
                };
                let comment = sse::keep_alive_comment();
                let mut guard = sink.lock().await;
                let written = match guard.write(&comment).await {
                    Ok(()) => guard.flush().await,
                    Err(error) => Err(error),
                };
                drop(guard);
                if written.is_err() {
                    tracing::debug!(%stream_id, "keep-alive write failed, dropping stream");
                    inner.drop_stream(&stream_id, &sink).await;
                    break;
                }
            }
        });
    }

    fn spawn_disconnect_watcher(
        &self,
        stream_id: StreamId,
        done: CancellationToken,
        sink: SharedSink,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            done.cancelled().await;
            tracing::debug!(%stream_id, "stream connection closed");
            inner.drop_stream(&stream_id, &sink).await;
        });
    }
}

fn post_gate(head: &RequestHead) -> Option<TransportError> {
    if !(head.accepts(JSON_MIME_TYPE) && head.accepts(EVENT_STREAM_MIME_TYPE)) {
        return Some(TransportError::NotAcceptablePost);
    }
    if head.content_type().as_deref() != Some(JSON_MIME_TYPE) {
        return Some(TransportError::UnsupportedMediaType);
    }
    None
}
