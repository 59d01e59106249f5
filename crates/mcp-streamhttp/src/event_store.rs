//! Append-only event log enabling SSE resumption via `Last-Event-ID`.
//!
//! The transport consults the store in two places: before every SSE write,
//! to assign the frame its `id:` line, and on a GET carrying `Last-Event-ID`,
//! to replay what the client missed. Persistent backends implement
//! [`EventStore`]; the bundled [`InMemoryEventStore`] is sufficient for
//! testing and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::StreamId;
use crate::error::BoxError;
use crate::model::JsonRpcMessage;

/// Opaque, strictly ordered per stream, unique within the store.
pub type EventId = String;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `message` to the stream's log and return the assigned id.
    /// Ids must be monotonically increasing within a stream.
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, BoxError>;

    /// Push every event stored strictly after `last_event_id`, in order,
    /// into `tx`, then return the id of the stream those events belong to.
    async fn replay_events_after(
        &self,
        last_event_id: &str,
        tx: mpsc::Sender<(EventId, JsonRpcMessage)>,
    ) -> Result<StreamId, BoxError>;
}

/// In-memory [`EventStore`] keeping one vector of events per stream.
///
/// Event ids are `"<stream_id>/<seq>"` with a store-global sequence, so the
/// owning stream can be recovered from the id alone.
#[derive(Default)]
pub struct InMemoryEventStore {
    next_seq: AtomicU64,
    streams: Mutex<HashMap<String, Vec<StoredEvent>>>,
}

struct StoredEvent {
    seq: u64,
    message: JsonRpcMessage,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn format_event_id(stream_id: &str, seq: u64) -> EventId {
        format!("{stream_id}/{seq}")
    }

    fn parse_event_id(event_id: &str) -> Option<(&str, u64)> {
        let (stream_id, seq) = event_id.rsplit_once('/')?;
        Some((stream_id, seq.parse().ok()?))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, BoxError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream_id.to_owned())
            .or_default()
            .push(StoredEvent {
                seq,
                message: message.clone(),
            });
        Ok(Self::format_event_id(stream_id, seq))
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
        tx: mpsc::Sender<(EventId, JsonRpcMessage)>,
    ) -> Result<StreamId, BoxError> {
        let Some((stream_id, after)) = Self::parse_event_id(last_event_id) else {
            return Err(format!("malformed event id: {last_event_id}").into());
        };
        let pending: Vec<(EventId, JsonRpcMessage)> = {
            let streams = self.streams.lock().await;
            streams
                .get(stream_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| event.seq > after)
                        .map(|event| {
                            (
                                Self::format_event_id(stream_id, event.seq),
                                event.message.clone(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        for event in pending {
            // Receiver gone means the client disconnected mid-replay.
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(Arc::from(stream_id))
    }
}
