use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::models::conversation::{Capability, ConversationKind};
use crate::models::conversation_store::ConversationStore;
use crate::models::message::MessageId;
use crate::models::reconciler::{
    self, ReconcileError, UpdateThrottle,
};
use crate::models::stream_aggregator::{AggregatorState, ModelId, RequestId, StreamEvent};
use crate::persistence::{PersistenceHandle, PersistenceScheduler};
use crate::repositories::ConversationRepository;
use crate::services::stream_source::{
    CancelHandle, FanoutRequest, OpenedStream, StreamChunk, StreamRequest, StreamSource,
};
use crate::services::title::derive_title;

/// One in-flight request as seen by the engine.
struct ActiveRequest {
    conv_id: String,
    cancel: CancelHandle,
}

/// Wires stream source, aggregator, reconciler, store and persistence into
/// the per-turn control flow: user submits text, one stream opens per
/// request, chunks accumulate in the aggregator, and the reconciler folds
/// them into the conversation's durable message list.
///
/// Presentation code reads only the durable list through [`ChatEngine::store`];
/// the aggregator's transient state is never exposed.
pub struct ChatEngine {
    source: Arc<dyn StreamSource>,
    store: Arc<Mutex<ConversationStore>>,
    aggregator: Arc<Mutex<AggregatorState>>,
    persistence: PersistenceHandle,
    requests: Arc<Mutex<HashMap<RequestId, ActiveRequest>>>,
    config: EngineConfig,
}

impl ChatEngine {
    /// Load the persisted conversation collection and start the
    /// persistence task.
    pub async fn new(
        source: Arc<dyn StreamSource>,
        repo: Arc<dyn ConversationRepository>,
        config: EngineConfig,
    ) -> Result<Self> {
        let loaded = repo
            .load_all()
            .await
            .context("failed to load persisted conversations")?;
        debug!(count = loaded.len(), "conversations loaded");

        let store = Arc::new(Mutex::new(ConversationStore::from_loaded(loaded)));
        let persistence = PersistenceScheduler::spawn(repo, store.clone(), config.flush_debounce);

        Ok(Self {
            source,
            store,
            aggregator: Arc::new(Mutex::new(AggregatorState::new())),
            persistence,
            requests: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    /// Shared handle to the conversation collection; the only surface the
    /// presentation layer reads.
    pub fn store(&self) -> Arc<Mutex<ConversationStore>> {
        self.store.clone()
    }

    /// Submit a user turn. Creates a conversation when `conv_id` is absent
    /// or unknown. The model list is explicit and must be non-empty.
    ///
    /// Returns `(conversation id, request id)`, or `None` as the request id
    /// when the submission was a duplicate and was skipped.
    pub async fn send_message(
        &self,
        conv_id: Option<&str>,
        text: &str,
        models: &[ModelId],
    ) -> Result<(String, Option<RequestId>)> {
        self.submit(conv_id, text, now_ms(), models).await
    }

    /// [`ChatEngine::send_message`] with an explicit submission identity.
    /// Two dispatches carrying the same (content, issued_at) pair are the
    /// same logical submission; the second is skipped.
    pub async fn submit(
        &self,
        conv_id: Option<&str>,
        text: &str,
        issued_at_ms: i64,
        models: &[ModelId],
    ) -> Result<(String, Option<RequestId>)> {
        ensure!(!models.is_empty(), "at least one target model is required");

        let now = now_ms();
        let conv_id = {
            let mut store = self.store.lock();
            match conv_id.filter(|id| store.contains(id)) {
                Some(id) => id.to_string(),
                None => store.create(derive_title(text), ConversationKind::Chat, now),
            }
        };

        // Durably append the user message first, so it survives even if the
        // request fails. Duplicates are skipped before anything is sent.
        let begun = self
            .store
            .lock()
            .update_messages(&conv_id, |c| reconciler::begin_turn(c, text, issued_at_ms, now))
            .context("conversation vanished before submission")?;
        let user_id = match begun {
            Ok(id) => id,
            Err(ReconcileError::DuplicateSubmission { .. }) => {
                debug!(conv_id = %conv_id, "duplicate submission skipped");
                return Ok((conv_id, None));
            }
            Err(e) => return Err(e.into()),
        };
        self.persistence.notify_change();

        let request_id = self
            .dispatch(&conv_id, user_id, text, models)
            .await?;
        Ok((conv_id, Some(request_id)))
    }

    /// Discard the last turn and resend its user content as a new turn.
    ///
    /// Removal and re-append happen in one store update, and the resend
    /// bypasses the duplicate guard (its identity was recorded by the
    /// original submission), so the conversation never drops below one
    /// pending turn.
    pub async fn retry(&self, conv_id: &str, models: &[ModelId]) -> Result<RequestId> {
        ensure!(!models.is_empty(), "at least one target model is required");

        let now = now_ms();
        let resent = self
            .store
            .lock()
            .update_messages(conv_id, |c| {
                let content = reconciler::retry(c)?;
                let user_id = reconciler::resend_turn(c, &content, now);
                Ok::<_, ReconcileError>((content, user_id))
            })
            .context("unknown conversation")?;
        let (content, user_id) = resent?;
        self.persistence.notify_change();

        self.dispatch(conv_id, user_id, &content, models).await
    }

    /// Truncate history at the edited message, update its content in place,
    /// and regenerate. The response attaches to the original message id, so
    /// ordering is preserved.
    pub async fn edit_and_resend(
        &self,
        conv_id: &str,
        target: MessageId,
        new_text: &str,
        models: &[ModelId],
    ) -> Result<RequestId> {
        ensure!(!models.is_empty(), "at least one target model is required");

        let content = self
            .store
            .lock()
            .update_messages(conv_id, |c| {
                reconciler::edit_and_regenerate(c, target, new_text)
            })
            .context("unknown conversation")??;
        self.persistence.notify_change();

        self.dispatch(conv_id, target, &content, models).await
    }

    /// Open the stream(s) for one request and spawn its pump task.
    /// Open failures surface as durable error messages, never as faults
    /// propagating to the presentation layer.
    async fn dispatch(
        &self,
        conv_id: &str,
        user_id: MessageId,
        prompt: &str,
        models: &[ModelId],
    ) -> Result<RequestId> {
        let request_id: RequestId = uuid::Uuid::new_v4().to_string();
        let capability = self.store.lock().get(conv_id).and_then(|c| c.capability());
        let started_at = now_ms();

        apply_event(
            &self.aggregator,
            StreamEvent::RequestStart {
                request: request_id.clone(),
                models: models.to_vec(),
                prompt: prompt.to_string(),
                started_at_ms: started_at,
            },
        );

        let opened = if models.len() == 1 {
            self.source
                .open(StreamRequest {
                    conversation_id: conv_id.to_string(),
                    model: models[0].clone(),
                    prompt: prompt.to_string(),
                    capability,
                })
                .await
        } else {
            self.source
                .open_fanout(FanoutRequest {
                    conversation_id: conv_id.to_string(),
                    models: models.to_vec(),
                    prompt: prompt.to_string(),
                    capability,
                })
                .await
        };

        let OpenedStream { chunks, cancel } = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(conv_id = %conv_id, error = %e, "stream could not be opened");
                apply_event(
                    &self.aggregator,
                    StreamEvent::OpenError {
                        request: request_id.clone(),
                        models: models.to_vec(),
                        prompt: prompt.to_string(),
                        error: e.to_string(),
                        started_at_ms: started_at,
                    },
                );
                // Drop the transient buffers and surface the failure on the
                // durable list so the user turn is never silently lost.
                self.aggregator.lock().remove_request(&request_id);
                self.store.lock().update_messages(conv_id, |c| {
                    if let Err(err) = reconciler::fail_turn(c, user_id, &e.to_string(), now_ms()) {
                        error!(conv_id = %c.id(), error = %err, "failed to record open failure");
                    }
                });
                self.persistence.notify_change();
                return Ok(request_id);
            }
        };

        self.requests.lock().insert(
            request_id.clone(),
            ActiveRequest {
                conv_id: conv_id.to_string(),
                cancel,
            },
        );

        let pump = StreamPump {
            store: self.store.clone(),
            aggregator: self.aggregator.clone(),
            persistence: self.persistence_handle(),
            requests: self.requests.clone(),
            conv_id: conv_id.to_string(),
            request_id: request_id.clone(),
            user_id,
            primary_model: models[0].clone(),
            throttle: UpdateThrottle::new(self.config.throttle_interval),
        };
        tokio::spawn(pump.run(chunks));

        Ok(request_id)
    }

    /// Cancel every in-flight request of a conversation. Safe when nothing
    /// is streaming; already-delivered partial content is preserved by the
    /// pump's finalization.
    pub fn stop(&self, conv_id: &str) {
        let requests = self.requests.lock();
        for (request, active) in requests.iter() {
            if active.conv_id == conv_id {
                debug!(conv_id = %conv_id, request = %request, "cancelling stream");
                active.cancel.cancel();
            }
        }
    }

    /// Delete a conversation: cancel its streams, drop it from the
    /// collection, and return the surviving active choice.
    pub fn delete_conversation(&self, conv_id: &str) -> Option<String> {
        self.stop(conv_id);
        let next = self.store.lock().delete(conv_id);
        self.persistence.notify_change();
        next
    }

    pub fn set_active(&self, conv_id: &str) -> bool {
        self.store.lock().set_active(conv_id)
    }

    pub fn toggle_capability(&self, conv_id: &str, capability: Capability) -> bool {
        let changed = self.store.lock().toggle_capability(conv_id, capability);
        if changed {
            self.persistence.notify_change();
        }
        changed
    }

    /// Whether any request for this conversation is still awaiting a
    /// response.
    pub fn is_streaming(&self, conv_id: &str) -> bool {
        self.requests
            .lock()
            .values()
            .any(|r| r.conv_id == conv_id)
    }

    pub fn has_active_requests(&self) -> bool {
        !self.requests.lock().is_empty()
    }

    fn persistence_handle(&self) -> PersistenceHandle {
        self.persistence.clone()
    }
}

/// Apply one event to the shared aggregator state.
fn apply_event(aggregator: &Arc<Mutex<AggregatorState>>, event: StreamEvent) {
    let mut guard = aggregator.lock();
    let state = std::mem::take(&mut *guard);
    *guard = state.apply(event);
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Drives one opened stream to completion: chunks into the aggregator,
/// throttled folds into the durable list, then final reconciliation.
struct StreamPump {
    store: Arc<Mutex<ConversationStore>>,
    aggregator: Arc<Mutex<AggregatorState>>,
    persistence: PersistenceHandle,
    requests: Arc<Mutex<HashMap<RequestId, ActiveRequest>>>,
    conv_id: String,
    request_id: RequestId,
    user_id: MessageId,
    primary_model: ModelId,
    throttle: UpdateThrottle,
}

impl StreamPump {
    async fn run(mut self, mut chunks: crate::services::stream_source::ResponseStream) {
        let mut failure: Option<String> = None;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(StreamChunk::Text(text)) => {
                    self.feed(self.primary_model.clone(), text);
                    self.fold_throttled();
                }
                Ok(StreamChunk::TaggedText { model, text }) => {
                    self.feed(model, text);
                    self.fold_throttled();
                }
                Ok(StreamChunk::Done) => break,
                Ok(StreamChunk::Error(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        self.finalize(failure);
    }

    fn feed(&self, model: ModelId, delta: String) {
        apply_event(
            &self.aggregator,
            StreamEvent::MessageUpdate {
                request: self.request_id.clone(),
                model,
                delta,
            },
        );
    }

    /// Fold the primary model's buffer into the durable list, rate-limited.
    /// Deferred store update: the debounced flush is scheduled only by the
    /// final fold.
    fn fold_throttled(&mut self) {
        if !self.throttle.ready() {
            return;
        }
        let content = self
            .aggregator
            .lock()
            .buffer(&self.request_id, &self.primary_model)
            .map(|b| b.content.clone());
        let Some(content) = content else { return };

        let now = now_ms();
        let applied = self.store.lock().update_messages_deferred(&self.conv_id, |c| {
            reconciler::apply_stream_content(c, self.user_id, &content, now)
        });
        match applied {
            None => {
                // Conversation evicted mid-stream; updates are discarded.
                debug!(conv_id = %self.conv_id, "dropping update for deleted conversation");
            }
            Some(Err(e)) => {
                error!(conv_id = %self.conv_id, error = %e, "stream fold failed");
            }
            Some(Ok(_)) => {}
        }
    }

    /// Terminal reconciliation: drain the request's buffers and commit the
    /// complete content (or partial content plus an error marker) to the
    /// durable list, then schedule persistence.
    fn finalize(self, failure: Option<String>) {
        apply_event(
            &self.aggregator,
            StreamEvent::RequestEnd {
                request: self.request_id.clone(),
            },
        );
        let outputs = self.aggregator.lock().remove_request(&self.request_id);
        let now = now_ms();

        let folded = self.store.lock().update_messages(&self.conv_id, |c| {
            let kept: Vec<_> = outputs
                .iter()
                .filter(|(_, b)| !b.content.is_empty() || b.open_error.is_some())
                .cloned()
                .collect();
            if let Err(e) =
                reconciler::fold_model_outputs(c, self.user_id, &self.primary_model, &kept, now)
            {
                error!(conv_id = %c.id(), error = %e, "final fold failed");
            }
            if let Some(reason) = &failure {
                if let Err(e) = reconciler::fail_turn(c, self.user_id, reason, now) {
                    error!(conv_id = %c.id(), error = %e, "failed to record stream error");
                }
            }
        });
        if folded.is_none() {
            debug!(conv_id = %self.conv_id, "conversation deleted before finalization");
        }

        self.requests.lock().remove(&self.request_id);
        self.persistence.notify_change();
        debug!(conv_id = %self.conv_id, request = %self.request_id, "stream finished");
    }
}
