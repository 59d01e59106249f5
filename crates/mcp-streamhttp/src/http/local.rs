//! In-process adapter: a [`ResponseSink`] whose output is observed through
//! channels instead of a socket. Used by the integration tests and useful
//! for embedding the transport without an HTTP server.

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::ResponseSink;

/// Status and headers as committed by the sink.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Create a connected sink/observer pair.
pub fn local_channel() -> (LocalResponseSink, LocalResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let done = CancellationToken::new();
    (
        LocalResponseSink {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            chunk_tx: Some(chunk_tx),
            pending: String::new(),
            done: done.clone(),
        },
        LocalResponse {
            head_rx,
            chunks: chunk_rx,
            done,
        },
    )
}

pub struct LocalResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    chunk_tx: Option<mpsc::UnboundedSender<String>>,
    pending: String,
    done: CancellationToken,
}

impl LocalResponseSink {
    fn committed(&self) -> bool {
        self.head_tx.is_none()
    }

    fn commit(&mut self) -> std::io::Result<()> {
        if let Some(head_tx) = self.head_tx.take() {
            let head = ResponseHead {
                status: self.status,
                headers: self.headers.clone(),
            };
            head_tx
                .send(head)
                .map_err(|_| std::io::Error::other("response observer dropped"))?;
        }
        Ok(())
    }

    fn push_pending(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.pending);
        self.push_chunk(chunk)
    }

    fn push_chunk(&self, chunk: String) -> std::io::Result<()> {
        let Some(chunk_tx) = &self.chunk_tx else {
            return Err(std::io::Error::other("sink already closed"));
        };
        chunk_tx
            .send(chunk)
            .map_err(|_| std::io::Error::other("response observer dropped"))
    }
}

#[async_trait]
impl ResponseSink for LocalResponseSink {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn set_header(&mut self, name: &str, value: &str) {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) else {
            tracing::debug!(name, "dropping invalid response header");
            return;
        };
        self.headers.insert(name, value);
    }

    async fn write(&mut self, text: &str) -> std::io::Result<()> {
        if self.committed() {
            self.push_chunk(text.to_owned())
        } else {
            self.pending.push_str(text);
            Ok(())
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.commit()?;
        self.push_pending()
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.commit()?;
        self.push_pending()?;
        self.chunk_tx = None;
        self.done.cancel();
        Ok(())
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

/// Observer half of [`local_channel`].
pub struct LocalResponse {
    head_rx: oneshot::Receiver<ResponseHead>,
    chunks: mpsc::UnboundedReceiver<String>,
    done: CancellationToken,
}

impl LocalResponse {
    /// Status and headers, available once the sink commits (first flush for
    /// streaming responses, close for buffered ones).
    pub async fn head(&mut self) -> Option<ResponseHead> {
        (&mut self.head_rx).await.ok()
    }

    /// Next body chunk; `None` once the sink has closed.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Simulate the client going away.
    pub fn disconnect(&self) {
        self.done.cancel();
    }

    /// Drain the remaining body to a string.
    pub async fn body(mut self) -> String {
        let mut body = String::new();
        while let Some(chunk) = self.chunks.recv().await {
            body.push_str(&chunk);
        }
        body
    }
}
