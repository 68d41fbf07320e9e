use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::conversation::Capability;
use crate::models::stream_aggregator::ModelId;

/// Stream chunks emitted during responses.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    /// Fan-out endpoint chunk, tagged with the producing backend model.
    TaggedText { model: ModelId, text: String },
    Done,
    Error(String),
}

/// Type alias for response streams.
pub type ResponseStream = BoxStream<'static, Result<StreamChunk>>;

/// Cooperative cancellation for one open stream.
///
/// Idempotent: safe to invoke repeatedly and after the stream has already
/// terminated (a no-op in that case). Awaitable, so a stream adapter can
/// race it against a connection that has stalled and will never deliver
/// another byte.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation has been requested; immediately when it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value before awaiting a change, so
        // a cancel that raced the subscribe is not missed. The sender side
        // outlives this borrow, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Failure to establish a stream at all, before any byte arrived.
/// Distinct from a mid-stream failure: no partial content exists yet.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to reach endpoint: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint returned status {0}")]
    Status(u16),
}

/// Parameters for one (model, turn) stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    pub conversation_id: String,
    pub model: ModelId,
    pub prompt: String,
    pub capability: Option<Capability>,
}

/// Parameters for one multi-model comparison stream. The model list is an
/// explicit, required argument at the call site.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutRequest {
    pub conversation_id: String,
    pub models: Vec<ModelId>,
    pub prompt: String,
    pub capability: Option<Capability>,
}

/// An established stream plus its cancellation handle.
pub struct OpenedStream {
    pub chunks: ResponseStream,
    pub cancel: CancelHandle,
}

/// Opens exactly one network stream per request and delivers chunks in
/// arrival order, with at most one terminal chunk (`Done` or `Error`).
pub trait StreamSource: Send + Sync + 'static {
    /// Open a single-model response stream.
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<OpenedStream, OpenError>>;

    /// Open a multi-model fan-out stream whose chunks are tagged with the
    /// producing model.
    fn open_fanout(
        &self,
        request: FanoutRequest,
    ) -> BoxFuture<'static, Result<OpenedStream, OpenError>>;
}

/// Per-chunk envelope on the fan-out endpoint: one JSON object per line.
#[derive(Debug, Deserialize)]
struct FanoutEnvelope {
    model: ModelId,
    #[serde(default)]
    text: String,
}

/// HTTP implementation over the chat transport endpoints.
#[derive(Debug, Clone)]
pub struct HttpStreamSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStreamSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn open_response(
        client: reqwest::Client,
        url: String,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, OpenError> {
        let response = client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OpenError::Status(status.as_u16()));
        }
        debug!(url = %url, "stream opened");
        Ok(response)
    }
}

impl StreamSource for HttpStreamSource {
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<OpenedStream, OpenError>> {
        let client = self.client.clone();
        let url = format!("{}/chat/stream", self.base_url);

        Box::pin(async move {
            let body = serde_json::to_value(&request).unwrap_or_default();
            let response = Self::open_response(client, url, body).await?;

            let cancel = CancelHandle::new();
            let flag = cancel.clone();
            let mut bytes = response.bytes_stream();

            let chunks: ResponseStream = Box::pin(async_stream::stream! {
                loop {
                    // Cancellation must win even when the connection has
                    // stalled and no further byte ever arrives.
                    let item = tokio::select! {
                        _ = flag.cancelled() => return,
                        item = bytes.next() => item,
                    };
                    match item {
                        Some(Ok(chunk)) => {
                            let text = String::from_utf8_lossy(&chunk).into_owned();
                            if !text.is_empty() {
                                yield Ok(StreamChunk::Text(text));
                            }
                        }
                        Some(Err(e)) => {
                            yield Ok(StreamChunk::Error(e.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
                yield Ok(StreamChunk::Done);
            });

            Ok(OpenedStream { chunks, cancel })
        })
    }

    fn open_fanout(
        &self,
        request: FanoutRequest,
    ) -> BoxFuture<'static, Result<OpenedStream, OpenError>> {
        let client = self.client.clone();
        let url = format!("{}/chat/compare", self.base_url);

        Box::pin(async move {
            let body = serde_json::to_value(&request).unwrap_or_default();
            let response = Self::open_response(client, url, body).await?;

            let cancel = CancelHandle::new();
            let flag = cancel.clone();
            let mut bytes = response.bytes_stream();

            let chunks: ResponseStream = Box::pin(async_stream::stream! {
                // Envelopes are newline-delimited JSON; a chunk boundary may
                // split a line, so buffer until a full line arrives.
                let mut pending = String::new();
                loop {
                    let item = tokio::select! {
                        _ = flag.cancelled() => return,
                        item = bytes.next() => item,
                    };
                    match item {
                        Some(Ok(chunk)) => {
                            pending.push_str(&String::from_utf8_lossy(&chunk));
                            while let Some(newline) = pending.find('\n') {
                                let line: String = pending.drain(..=newline).collect();
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<FanoutEnvelope>(line) {
                                    Ok(envelope) => {
                                        yield Ok(StreamChunk::TaggedText {
                                            model: envelope.model,
                                            text: envelope.text,
                                        });
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "skipping malformed fan-out envelope");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            yield Ok(StreamChunk::Error(e.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
                if let Ok(envelope) = serde_json::from_str::<FanoutEnvelope>(pending.trim()) {
                    yield Ok(StreamChunk::TaggedText {
                        model: envelope.model,
                        text: envelope.text,
                    });
                }
                yield Ok(StreamChunk::Done);
            });

            Ok(OpenedStream { chunks, cancel })
        })
    }
}
