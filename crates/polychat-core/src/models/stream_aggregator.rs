use std::collections::HashMap;

use tracing::warn;

/// Identifies one in-flight request. One id per opened stream.
pub type RequestId = String;

/// Backend model name as sent to the transport endpoint.
pub type ModelId = String;

/// Key isolating one model's transcript within one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub request: RequestId,
    pub model: ModelId,
}

impl BufferKey {
    pub fn new(request: impl Into<RequestId>, model: impl Into<ModelId>) -> Self {
        Self {
            request: request.into(),
            model: model.into(),
        }
    }
}

/// Accumulating transcript for one (request, model) pair.
///
/// Seeded with the user prompt when the request starts, so the per-model
/// transcript reads as a proper turn even before any response arrives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelBuffer {
    pub prompt: String,
    /// Assistant text accumulated so far, in delivery order.
    pub content: String,
    /// Set when the stream could not be opened at all.
    pub open_error: Option<String>,
    pub started_at_ms: i64,
}

/// Events fed into the aggregator, in the order a caller may emit them
/// for a given request id.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Register a request as active for an explicit, non-empty model list.
    RequestStart {
        request: RequestId,
        models: Vec<ModelId>,
        prompt: String,
        started_at_ms: i64,
    },
    /// Append a content delta to the (request, model) buffer, creating it
    /// if absent. Always append, never replace.
    MessageUpdate {
        request: RequestId,
        model: ModelId,
        delta: String,
    },
    /// The request's stream closed. Buffers survive for final reconciliation.
    RequestEnd { request: RequestId },
    /// The stream could not be opened at all; no partial content exists.
    OpenError {
        request: RequestId,
        models: Vec<ModelId>,
        prompt: String,
        error: String,
        started_at_ms: i64,
    },
    /// A terminal error not tied to a specific request.
    Fault { error: String },
}

/// Transient per-conversation stream state: a monotonic accumulator,
/// not a multi-phase protocol.
///
/// Pure: every transition is `old state + event -> new state`, with no
/// clock and no I/O, so behavior is testable without a live runtime.
#[derive(Debug, Clone, Default)]
pub struct AggregatorState {
    active_requests: HashMap<RequestId, Vec<ModelId>>,
    buffers: HashMap<BufferKey, ModelBuffer>,
    last_fault: Option<String>,
}

impl AggregatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event, producing the successor state.
    pub fn apply(mut self, event: StreamEvent) -> Self {
        match event {
            StreamEvent::RequestStart {
                request,
                models,
                prompt,
                started_at_ms,
            } => {
                if models.is_empty() {
                    warn!(request = %request, "request started with no target models");
                }
                for model in &models {
                    self.buffers
                        .entry(BufferKey::new(request.clone(), model.clone()))
                        .or_insert_with(|| ModelBuffer {
                            prompt: prompt.clone(),
                            content: String::new(),
                            open_error: None,
                            started_at_ms,
                        });
                }
                self.active_requests.insert(request, models);
            }
            StreamEvent::MessageUpdate {
                request,
                model,
                delta,
            } => {
                self.buffers
                    .entry(BufferKey::new(request, model))
                    .or_default()
                    .content
                    .push_str(&delta);
            }
            StreamEvent::RequestEnd { request } => {
                // Buffers are intentionally retained here; the reconciler
                // drains them via `remove_request` once folded.
                self.active_requests.remove(&request);
            }
            StreamEvent::OpenError {
                request,
                models,
                prompt,
                error,
                started_at_ms,
            } => {
                for model in &models {
                    let buffer = self
                        .buffers
                        .entry(BufferKey::new(request.clone(), model.clone()))
                        .or_insert_with(|| ModelBuffer {
                            prompt: prompt.clone(),
                            content: String::new(),
                            open_error: None,
                            started_at_ms,
                        });
                    buffer.open_error = Some(error.clone());
                }
                self.last_fault = Some(error);
                self.active_requests.remove(&request);
            }
            StreamEvent::Fault { error } => {
                self.last_fault = Some(error);
            }
        }
        self
    }

    pub fn is_active(&self, request: &str) -> bool {
        self.active_requests.contains_key(request)
    }

    pub fn has_active_requests(&self) -> bool {
        !self.active_requests.is_empty()
    }

    pub fn active_models(&self, request: &str) -> Option<&[ModelId]> {
        self.active_requests.get(request).map(Vec::as_slice)
    }

    pub fn buffer(&self, request: &str, model: &str) -> Option<&ModelBuffer> {
        self.buffers.get(&BufferKey::new(request, model))
    }

    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    /// Drain every buffer belonging to a request, in the model order the
    /// request was started with (created-on-update buffers follow).
    pub fn remove_request(&mut self, request: &str) -> Vec<(ModelId, ModelBuffer)> {
        let ordered: Vec<ModelId> = self.active_requests.remove(request).unwrap_or_default();
        let mut drained = Vec::new();
        for model in ordered {
            if let Some(buffer) = self.buffers.remove(&BufferKey::new(request, model.clone())) {
                drained.push((model, buffer));
            }
        }
        // Buffers created by updates that raced the start event.
        let strays: Vec<BufferKey> = self
            .buffers
            .keys()
            .filter(|k| k.request == request)
            .cloned()
            .collect();
        for key in strays {
            if let Some(buffer) = self.buffers.remove(&key) {
                drained.push((key.model, buffer));
            }
        }
        drained
    }
}
