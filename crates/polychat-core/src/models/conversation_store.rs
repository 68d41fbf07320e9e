use std::collections::HashMap;

use tracing::debug;

use super::conversation::{Capability, Conversation, ConversationKind};

/// Owns the conversation collection and the active-conversation pointer.
///
/// The pointer is an id into the map, so the active conversation can never
/// drift from its counterpart in the collection: there is exactly one copy
/// of each conversation.
///
/// All mutation goes through this store; a snapshot `version` counter
/// advances on every persistence-relevant change so a stale flush can
/// never clobber a newer one.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Conversation>,
    active: Option<String>,
    version: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from persisted records (startup load path).
    pub fn from_loaded(conversations: Vec<Conversation>) -> Self {
        let mut store = Self::new();
        for conv in conversations {
            store.conversations.insert(conv.id().to_string(), conv);
        }
        store
    }

    /// Create a conversation, make it active, and inherit the capability
    /// selection of the previously active conversation.
    pub fn create(&mut self, title: String, kind: ConversationKind, now_ms: i64) -> String {
        let inherited = self
            .active
            .as_ref()
            .and_then(|id| self.conversations.get(id))
            .and_then(|c| c.capability());

        let id = uuid::Uuid::new_v4().to_string();
        let mut conv = Conversation::new(id.clone(), title, kind, now_ms);
        conv.set_capability(inherited);

        debug!(conv_id = %id, ?kind, "conversation created");
        self.conversations.insert(id.clone(), conv);
        self.active = Some(id.clone());
        self.version += 1;
        id
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conversations.contains_key(id)
    }

    /// Mutate a conversation's message list and schedule persistence
    /// (the snapshot version advances).
    pub fn update_messages<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<R> {
        let result = self.conversations.get_mut(id).map(f);
        if result.is_some() {
            self.version += 1;
        }
        result
    }

    /// Mutate a conversation's message list without advancing the snapshot
    /// version. Used to batch several updates before one persisted write.
    pub fn update_messages_deferred<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<R> {
        self.conversations.get_mut(id).map(f)
    }

    /// Delete a conversation. Clears the active pointer if it matched and
    /// returns the surviving choice (most recently updated), so the caller
    /// is never left with a dangling reference.
    pub fn delete(&mut self, id: &str) -> Option<String> {
        let removed = self.conversations.remove(id).is_some();
        if removed {
            self.version += 1;
            debug!(conv_id = %id, "conversation deleted");
        }

        if self.active.as_deref() == Some(id) {
            let next = self
                .conversations
                .values()
                .max_by_key(|c| c.updated_at_ms())
                .map(|c| c.id().to_string());
            self.active = next;
        }
        self.active.clone()
    }

    /// Point the active pointer at an existing conversation.
    pub fn set_active(&mut self, id: &str) -> bool {
        if self.conversations.contains_key(id) {
            self.active = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// All conversations, most recently updated first.
    pub fn list(&self) -> Vec<&Conversation> {
        let mut convs: Vec<&Conversation> = self.conversations.values().collect();
        convs.sort_by_key(|c| std::cmp::Reverse(c.updated_at_ms()));
        convs
    }

    pub fn count(&self) -> usize {
        self.conversations.len()
    }

    /// Flip a conversation's capability selection (structurally exclusive).
    pub fn toggle_capability(&mut self, id: &str, capability: Capability) -> bool {
        match self.conversations.get_mut(id) {
            Some(conv) => {
                conv.toggle_capability(capability);
                self.version += 1;
                true
            }
            None => false,
        }
    }

    /// Install a completed attachment encoding: sets the durable form,
    /// releases the binary payload, and advances the snapshot version so
    /// the next flush persists it. Returns false when the conversation or
    /// attachment no longer exists, or was already encoded (the completion
    /// is then simply dropped).
    pub fn apply_encoded(&mut self, conv_id: &str, attachment_id: &str, data_url: String) -> bool {
        let Some(conv) = self.conversations.get_mut(conv_id) else {
            return false;
        };
        let attachment = conv
            .messages_mut()
            .iter_mut()
            .flat_map(|m| m.attachments.iter_mut())
            .find(|a| a.id == attachment_id);
        match attachment {
            Some(att) if att.needs_encoding() => {
                att.apply_encoded(data_url);
                self.version += 1;
                true
            }
            _ => false,
        }
    }

    /// Monotonic snapshot version; advances on persistence-relevant change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Deep-copied, storage-safe snapshot: binary payloads and ephemeral
    /// handles are stripped, durable encoded forms are carried through.
    pub fn snapshot(&self) -> Vec<Conversation> {
        let mut snapshot: Vec<Conversation> = self.conversations.values().cloned().collect();
        for conv in &mut snapshot {
            for msg in conv.messages_mut() {
                for att in &mut msg.attachments {
                    att.bytes = None;
                    att.url = None;
                }
            }
        }
        snapshot.sort_by_key(|c| std::cmp::Reverse(c.updated_at_ms()));
        snapshot
    }
}
