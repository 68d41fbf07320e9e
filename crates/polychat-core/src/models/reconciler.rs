use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::conversation::Conversation;
use super::message::{Message, MessageId, Role};
use super::stream_aggregator::{ModelBuffer, ModelId};

/// Errors at the reconciliation seam.
///
/// `MissingUserMessage` is a contract violation, not a transient fault:
/// callers abort the operation rather than guess a correlation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("submission already processed: {content:?}")]
    DuplicateSubmission { content: String },

    #[error("no user message found for id {0:?}")]
    MissingUserMessage(MessageId),

    #[error("conversation has no user turn to retry")]
    NothingToRetry,
}

/// Append a user message for a new turn, durably and immediately, so it
/// survives even if the subsequent request fails.
///
/// `issued_at_ms` identifies the logical submission; dispatching the same
/// submission twice (e.g. an automatic URL-triggered send racing a manual
/// resend) is rejected as a duplicate.
pub fn begin_turn(
    conv: &mut Conversation,
    text: &str,
    issued_at_ms: i64,
    now_ms: i64,
) -> Result<MessageId, ReconcileError> {
    if !conv.note_submission(text, issued_at_ms) {
        return Err(ReconcileError::DuplicateSubmission {
            content: text.to_string(),
        });
    }
    Ok(resend_turn(conv, text, now_ms))
}

/// Append a user turn without the duplicate guard. Used when resending
/// content whose identity was already recorded by its original submission
/// (retry): the guard would otherwise reject the legitimate resend and
/// leave the truncated conversation with nothing pending.
pub fn resend_turn(conv: &mut Conversation, text: &str, now_ms: i64) -> MessageId {
    let ts = conv.next_timestamp(now_ms);
    let id = conv.alloc_message_id();
    conv.push_message(Message::user(id, text, ts));
    debug!(conv_id = %conv.id(), message_id = id.0, "user turn appended");
    id
}

/// Index of the assistant reply slot for a user message: the first
/// non-error assistant message after it, stopping at the next user turn.
fn assistant_slot(conv: &Conversation, user_index: usize) -> Option<usize> {
    conv.messages()
        .iter()
        .enumerate()
        .skip(user_index + 1)
        .take_while(|(_, m)| m.role != Role::User)
        .find(|(_, m)| m.role == Role::Assistant && !m.is_error)
        .map(|(i, _)| i)
}

/// Create-or-update the assistant reply for the turn started by `user_id`,
/// replacing its content with the full accumulated buffer.
///
/// The durable list has no request-id concept; correlation is by message id.
pub fn apply_stream_content(
    conv: &mut Conversation,
    user_id: MessageId,
    content: &str,
    now_ms: i64,
) -> Result<MessageId, ReconcileError> {
    let user_index = conv
        .message_index(user_id)
        .ok_or(ReconcileError::MissingUserMessage(user_id))?;

    if let Some(slot) = assistant_slot(conv, user_index) {
        let msg = &mut conv.messages_mut()[slot];
        msg.content = content.to_string();
        let id = msg.id;
        conv.touch(now_ms);
        return Ok(id);
    }

    let ts = conv.next_timestamp(now_ms);
    let id = conv.alloc_message_id();
    conv.insert_message(user_index + 1, Message::assistant(id, content, ts));
    Ok(id)
}

/// Mark the turn failed: whatever partial content is already visible stays,
/// and a distinct error-flagged assistant message is appended after it.
/// The user's own message is never mutated or dropped.
pub fn fail_turn(
    conv: &mut Conversation,
    user_id: MessageId,
    reason: &str,
    now_ms: i64,
) -> Result<MessageId, ReconcileError> {
    let user_index = conv
        .message_index(user_id)
        .ok_or(ReconcileError::MissingUserMessage(user_id))?;

    let insert_at = match assistant_slot(conv, user_index) {
        Some(slot) => slot + 1,
        None => user_index + 1,
    };

    let ts = conv.next_timestamp(now_ms);
    let id = conv.alloc_message_id();
    conv.insert_message(insert_at, Message::error(id, reason, ts));
    debug!(conv_id = %conv.id(), reason = %reason, "turn marked failed");
    Ok(id)
}

/// Remove the trailing (user, assistant*) pair and return the user content
/// for resend. The removed user message is never duplicated: the caller
/// resends through [`begin_turn`] with a fresh submission identity.
pub fn retry(conv: &mut Conversation) -> Result<String, ReconcileError> {
    let user_index = conv.last_user_index().ok_or(ReconcileError::NothingToRetry)?;
    let content = conv.messages()[user_index].content.clone();
    conv.truncate_messages(user_index);
    Ok(content)
}

/// Truncate history to end at the edited message (content updated in
/// place, original id and timestamp kept so ordering is preserved), and
/// return the new text for resend.
pub fn edit_and_regenerate(
    conv: &mut Conversation,
    target: MessageId,
    new_text: &str,
) -> Result<String, ReconcileError> {
    let index = conv
        .message_index(target)
        .filter(|&i| conv.messages()[i].role == Role::User)
        .ok_or(ReconcileError::MissingUserMessage(target))?;

    conv.truncate_messages(index + 1);
    let msg = conv
        .message_mut(target)
        .ok_or(ReconcileError::MissingUserMessage(target))?;
    msg.content = new_text.to_string();
    Ok(new_text.to_string())
}

/// Fold the final per-model buffers of a multi-model request into the
/// durable list: the primary model's output lands in the turn's reply
/// slot, every other model follows as its own labeled assistant message.
/// A model whose stream never opened contributes an error-flagged message.
///
/// The primary model is named explicitly; when it produced nothing its
/// buffer may be absent from `outputs`, and no secondary output may be
/// promoted into the reply slot in its place.
pub fn fold_model_outputs(
    conv: &mut Conversation,
    user_id: MessageId,
    primary: &ModelId,
    outputs: &[(ModelId, ModelBuffer)],
    now_ms: i64,
) -> Result<(), ReconcileError> {
    for (model, buffer) in outputs {
        if let Some(error) = &buffer.open_error {
            fail_turn(conv, user_id, &format!("[{model}] {error}"), now_ms)?;
            continue;
        }
        if model == primary {
            apply_stream_content(conv, user_id, &buffer.content, now_ms)?;
        } else {
            let ts = conv.next_timestamp(now_ms);
            let id = conv.alloc_message_id();
            conv.push_message(Message::assistant(
                id,
                format!("[{model}]\n{}", buffer.content),
                ts,
            ));
        }
    }
    Ok(())
}

/// Minimum interval between durable updates while a stream is in flight.
/// The final update always goes through regardless.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(250);

/// Rate-limits durable message-list updates during streaming to avoid
/// excessive downstream writes, while guaranteeing the final update
/// reflects complete content (callers finish with [`UpdateThrottle::force`]).
#[derive(Debug)]
pub struct UpdateThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// True when enough time has passed since the last durable update.
    pub fn ready(&mut self) -> bool {
        let due = self
            .last_emit
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true);
        if due {
            self.last_emit = Some(Instant::now());
        }
        due
    }

    /// Unconditionally permit the next update (terminal flush).
    pub fn force(&mut self) {
        self.last_emit = None;
    }
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::ConversationKind;

    fn conv() -> Conversation {
        Conversation::new("c-1".into(), "New Chat".into(), ConversationKind::Chat, 1_000)
    }

    #[test]
    fn user_message_survives_open_failure() {
        let mut c = conv();
        let user_id = begin_turn(&mut c, "hello there", 1, 2_000).unwrap();
        fail_turn(&mut c, user_id, "connection refused", 2_001).unwrap();

        let msgs = c.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].content, "hello there");
        assert!(!msgs[0].is_error);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs[1].is_error);
        assert_eq!(msgs[1].content, "connection refused");
    }

    #[test]
    fn streaming_updates_grow_one_assistant_message() {
        let mut c = conv();
        let user_id = begin_turn(&mut c, "hi", 1, 2_000).unwrap();

        let a1 = apply_stream_content(&mut c, user_id, "He", 2_001).unwrap();
        let a2 = apply_stream_content(&mut c, user_id, "Hello", 2_002).unwrap();

        assert_eq!(a1, a2, "updates must target the same assistant message");
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[1].content, "Hello");
    }

    #[test]
    fn partial_content_is_kept_on_midstream_failure() {
        let mut c = conv();
        let user_id = begin_turn(&mut c, "hi", 1, 2_000).unwrap();
        apply_stream_content(&mut c, user_id, "partial answ", 2_001).unwrap();
        fail_turn(&mut c, user_id, "stream reset", 2_002).unwrap();

        let msgs = c.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].content, "partial answ");
        assert!(!msgs[1].is_error);
        assert!(msgs[2].is_error);
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut c = conv();
        begin_turn(&mut c, "hello", 7, 2_000).unwrap();
        let err = begin_turn(&mut c, "hello", 7, 2_500).unwrap_err();
        assert!(matches!(err, ReconcileError::DuplicateSubmission { .. }));
        assert_eq!(c.messages().len(), 1);
    }

    #[test]
    fn retry_removes_exactly_the_last_pair() {
        let mut c = conv();
        let u1 = begin_turn(&mut c, "first", 1, 2_000).unwrap();
        apply_stream_content(&mut c, u1, "answer one", 2_001).unwrap();
        let u2 = begin_turn(&mut c, "second", 2, 2_100).unwrap();
        apply_stream_content(&mut c, u2, "answer two", 2_101).unwrap();

        let resend = retry(&mut c).unwrap();
        assert_eq!(resend, "second");
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[0].content, "first");
        assert_eq!(c.messages()[1].content, "answer one");
    }

    #[test]
    fn repeated_retry_of_a_single_turn_never_grows_history() {
        // Retry N times on a one-turn conversation: each cycle removes the
        // pair and resends the identical content, landing back at one turn.
        let mut c = conv();
        let mut user_id = begin_turn(&mut c, "only turn", 0, 2_000).unwrap();
        apply_stream_content(&mut c, user_id, "reply", 2_001).unwrap();

        for i in 0..5 {
            let resend = retry(&mut c).unwrap();
            assert_eq!(resend, "only turn");

            user_id = resend_turn(&mut c, &resend, 3_000 + i);
            apply_stream_content(&mut c, user_id, "reply", 3_001 + i).unwrap();
            assert_eq!(c.messages().len(), 2);
        }
    }

    #[test]
    fn resend_with_a_colliding_identity_keeps_the_turn() {
        // A retry landing in the same instant as the original submission
        // must not be swallowed by the duplicate guard after the turn was
        // already removed.
        let mut c = conv();
        let original = begin_turn(&mut c, "question", 42, 2_000).unwrap();
        apply_stream_content(&mut c, original, "answer", 2_001).unwrap();

        let resend = retry(&mut c).unwrap();
        let resent = resend_turn(&mut c, &resend, 2_001);

        assert_ne!(resent, original);
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].content, "question");
    }

    #[test]
    fn retry_on_empty_conversation_fails() {
        let mut c = conv();
        assert!(matches!(retry(&mut c), Err(ReconcileError::NothingToRetry)));
    }

    #[test]
    fn edit_truncates_and_keeps_original_position() {
        let mut c = conv();
        let u1 = begin_turn(&mut c, "one", 1, 2_000).unwrap();
        apply_stream_content(&mut c, u1, "reply one", 2_001).unwrap();
        let u2 = begin_turn(&mut c, "two", 2, 2_100).unwrap();
        apply_stream_content(&mut c, u2, "reply two", 2_101).unwrap();
        let u3 = begin_turn(&mut c, "three", 3, 2_200).unwrap();
        apply_stream_content(&mut c, u3, "reply three", 2_201).unwrap();

        let original_ts = c.messages()[2].timestamp_ms;
        let resend = edit_and_regenerate(&mut c, u2, "two, edited").unwrap();
        assert_eq!(resend, "two, edited");

        // First turn intact, edited message last, everything after it gone.
        let msgs = c.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "one");
        assert_eq!(msgs[1].content, "reply one");
        assert_eq!(msgs[2].content, "two, edited");
        assert_eq!(msgs[2].id, u2);
        assert_eq!(msgs[2].timestamp_ms, original_ts);

        // The regenerated response attaches to the original message id.
        apply_stream_content(&mut c, u2, "new reply", 3_000).unwrap();
        assert_eq!(c.messages().len(), 4);
        assert_eq!(c.messages()[3].content, "new reply");
    }

    #[test]
    fn edit_of_unknown_message_is_a_hard_error() {
        let mut c = conv();
        begin_turn(&mut c, "one", 1, 2_000).unwrap();
        let err = edit_and_regenerate(&mut c, MessageId(99), "nope").unwrap_err();
        assert!(matches!(err, ReconcileError::MissingUserMessage(_)));
    }

    #[test]
    fn reconciling_into_missing_turn_is_a_hard_error() {
        let mut c = conv();
        let err = apply_stream_content(&mut c, MessageId(4), "text", 2_000).unwrap_err();
        assert!(matches!(err, ReconcileError::MissingUserMessage(_)));
    }

    #[test]
    fn fold_labels_secondary_models() {
        let mut c = conv();
        let user_id = begin_turn(&mut c, "compare", 1, 2_000).unwrap();

        let outputs = vec![
            (
                "alpha".to_string(),
                ModelBuffer {
                    prompt: "compare".into(),
                    content: "from alpha".into(),
                    open_error: None,
                    started_at_ms: 2_000,
                },
            ),
            (
                "beta".to_string(),
                ModelBuffer {
                    prompt: "compare".into(),
                    content: "from beta".into(),
                    open_error: None,
                    started_at_ms: 2_000,
                },
            ),
        ];
        fold_model_outputs(&mut c, user_id, &"alpha".to_string(), &outputs, 2_100).unwrap();

        let msgs = c.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].content, "from alpha");
        assert_eq!(msgs[2].content, "[beta]\nfrom beta");
    }

    #[test]
    fn secondary_output_is_not_promoted_when_primary_is_silent() {
        let mut c = conv();
        let user_id = begin_turn(&mut c, "compare", 1, 2_000).unwrap();

        // The primary model produced nothing, so only the secondary's
        // buffer survives; it must keep its label instead of landing in
        // the reply slot.
        let outputs = vec![(
            "beta".to_string(),
            ModelBuffer {
                prompt: "compare".into(),
                content: "from beta".into(),
                open_error: None,
                started_at_ms: 2_000,
            },
        )];
        fold_model_outputs(&mut c, user_id, &"alpha".to_string(), &outputs, 2_100).unwrap();

        let msgs = c.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "[beta]\nfrom beta");
    }

    #[test]
    fn throttle_admits_first_and_forced_updates() {
        let mut throttle = UpdateThrottle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        throttle.force();
        assert!(throttle.ready());
    }
}
