use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::message::{Message, MessageId, Role};

/// Which feature surface owns a conversation. Routing tag only; the
/// streaming engine behaves identically for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Chat,
    ImageGeneration,
    DocumentSummary,
    ToolCalling,
    Retrieval,
    ProtocolTool,
}

/// A conversation-scoped toggle altering how a turn is answered.
///
/// Modeled as a single selection rather than sibling booleans, so mutual
/// exclusivity holds structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    WebSearch,
    ExtendedReasoning,
}

/// A titled, ordered sequence of messages belonging to one feature surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    id: String,
    title: String,
    kind: ConversationKind,
    messages: Vec<Message>,
    capability: Option<Capability>,
    created_at_ms: i64,
    updated_at_ms: i64,
    /// Next value handed out by [`Conversation::alloc_message_id`].
    next_message_id: u64,
    /// Identities of already-processed submissions, guarding against the
    /// same logical send being dispatched twice. Transient.
    #[serde(skip)]
    seen_submissions: HashSet<(String, i64)>,
}

impl Conversation {
    pub fn new(id: String, title: String, kind: ConversationKind, now_ms: i64) -> Self {
        Self {
            id,
            title,
            kind,
            messages: Vec::new(),
            capability: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            next_message_id: 0,
            seen_submissions: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: String) {
        self.title = title;
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn capability(&self) -> Option<Capability> {
        self.capability
    }

    pub fn set_capability(&mut self, capability: Option<Capability>) {
        self.capability = capability;
    }

    /// Select a capability, or deselect it if it was already active.
    /// Selecting one always clears any sibling selection.
    pub fn toggle_capability(&mut self, capability: Capability) {
        self.capability = if self.capability == Some(capability) {
            None
        } else {
            Some(capability)
        };
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn updated_at_ms(&self) -> i64 {
        self.updated_at_ms
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
    }

    /// Hand out the next correlation id.
    pub fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    /// A display timestamp strictly greater than every existing message's,
    /// even when messages are generated within the same clock tick.
    pub fn next_timestamp(&self, now_ms: i64) -> i64 {
        match self.messages.last() {
            Some(last) if last.timestamp_ms >= now_ms => last.timestamp_ms + 1,
            _ => now_ms,
        }
    }

    /// Record a submission identity; returns false when it was seen before.
    pub fn note_submission(&mut self, content: &str, issued_at_ms: i64) -> bool {
        self.seen_submissions
            .insert((content.to_string(), issued_at_ms))
    }

    pub fn push_message(&mut self, message: Message) {
        self.updated_at_ms = self.updated_at_ms.max(message.timestamp_ms);
        self.messages.push(message);
    }

    pub fn message_index(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Index of the last user message, if any.
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    pub(crate) fn insert_message(&mut self, index: usize, message: Message) {
        self.updated_at_ms = self.updated_at_ms.max(message.timestamp_ms);
        self.messages.insert(index, message);
    }

    pub(crate) fn truncate_messages(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    pub(crate) fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }
}
