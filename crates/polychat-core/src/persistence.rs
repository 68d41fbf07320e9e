use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::conversation_store::ConversationStore;
use crate::repositories::ConversationRepository;

/// Quiet interval after the last change before a flush fires.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Encode attachment bytes into their storage-safe `data:` URL form.
pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// A queued attachment encoding, captured while the store lock was held.
struct EncodeJob {
    conv_id: String,
    attachment_id: String,
    mime: String,
    bytes: Vec<u8>,
}

/// Handle to the background persistence task. Dropping the last handle
/// performs a final flush and stops the task.
#[derive(Clone)]
pub struct PersistenceHandle {
    change_tx: mpsc::UnboundedSender<()>,
}

impl PersistenceHandle {
    /// Note that the conversation collection changed; the debounce timer
    /// restarts from now.
    pub fn notify_change(&self) {
        // Send only fails when the task has already stopped.
        let _ = self.change_tx.send(());
    }
}

/// Debounced, best-effort persistence of the conversation collection.
///
/// Contract: at most one flush in flight (flushes run sequentially on one
/// task), latest state wins (a flush is skipped unless the store's version
/// advanced past the last persisted one). Attachment encoding is an
/// explicit queue: bytes captured under the store lock are encoded off the
/// flush path and fed back through `ConversationStore::apply_encoded`, so
/// the durable form may lag by one flush cycle.
pub struct PersistenceScheduler;

impl PersistenceScheduler {
    pub fn spawn(
        repo: Arc<dyn ConversationRepository>,
        store: Arc<Mutex<ConversationStore>>,
        debounce: Duration,
    ) -> PersistenceHandle {
        let (change_tx, mut change_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let mut last_persisted: Option<u64> = None;

            loop {
                // Wait for the first change; channel closure means shutdown.
                if change_rx.recv().await.is_none() {
                    break;
                }

                // Absorb further changes until a quiet interval passes.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => break,
                        more = change_rx.recv() => {
                            if more.is_none() {
                                // Final flush on shutdown.
                                flush(&repo, &store, &mut last_persisted).await;
                                return;
                            }
                        }
                    }
                }

                flush(&repo, &store, &mut last_persisted).await;
            }

            flush(&repo, &store, &mut last_persisted).await;
        });

        PersistenceHandle { change_tx }
    }
}

async fn flush(
    repo: &Arc<dyn ConversationRepository>,
    store: &Arc<Mutex<ConversationStore>>,
    last_persisted: &mut Option<u64>,
) {
    // Runs until no encode completion advanced the store, so encoded forms
    // land in an immediate follow-up write rather than waiting for the next
    // user-driven change.
    loop {
        // Capture snapshot, version and pending encode work under one lock.
        let (version, snapshot, jobs) = {
            let guard = store.lock();
            let version = guard.version();
            if Some(version) <= *last_persisted {
                return;
            }

            let mut jobs = Vec::new();
            for conv in guard.list() {
                for msg in conv.messages() {
                    for att in &msg.attachments {
                        if att.needs_encoding() {
                            if let Some(bytes) = &att.bytes {
                                jobs.push(EncodeJob {
                                    conv_id: conv.id().to_string(),
                                    attachment_id: att.id.clone(),
                                    mime: att.mime.clone(),
                                    bytes: bytes.clone(),
                                });
                            }
                        }
                    }
                }
            }

            (version, guard.snapshot(), jobs)
        };

        match repo.save_all(snapshot).await {
            Ok(()) => {
                debug!(version, "conversation collection flushed");
                *last_persisted = Some(version);
            }
            Err(e) => {
                // Skip this flush; the next change retries.
                warn!(error = %e, "failed to persist conversations");
            }
        }

        if jobs.is_empty() {
            return;
        }

        // Encode off the flush path, then feed completions back into the
        // store as explicit events. A completion for a deleted conversation
        // or an already-encoded attachment is dropped.
        let mut applied = false;
        for job in jobs {
            let EncodeJob {
                conv_id,
                attachment_id,
                mime,
                bytes,
            } = job;
            let encoded =
                tokio::task::spawn_blocking(move || encode_data_url(&mime, &bytes)).await;
            match encoded {
                Ok(data_url) => {
                    if store.lock().apply_encoded(&conv_id, &attachment_id, data_url) {
                        applied = true;
                    }
                }
                Err(e) => warn!(error = %e, "attachment encode task failed"),
            }
        }

        if !applied {
            return;
        }
    }
}
