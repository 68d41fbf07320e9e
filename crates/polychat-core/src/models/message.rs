use serde::{Deserialize, Serialize};

/// Stable identity of a message within one conversation.
///
/// A monotonic per-conversation counter, never reused. Retry, edit and
/// stream reconciliation all correlate through this id; the wall-clock
/// timestamp on [`Message`] is display-only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct MessageId(pub u64);

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A media item attached to a message (uploaded or generated).
///
/// The raw bytes and the ephemeral display handle never reach durable
/// storage; only `data_url` survives a reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    /// Ephemeral, revocable display handle. Rebuilt by the presentation
    /// layer after a reload; never serialized.
    #[serde(skip)]
    pub url: Option<String>,
    /// The prompt that produced this item (empty for uploads).
    pub prompt: String,
    /// Raw binary payload, owned until a durable `data_url` supersedes it.
    /// Never serialized.
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
    /// Storage-safe encoded form (`data:` URL). Required for the attachment
    /// to survive a reload.
    pub data_url: Option<String>,
    pub mime: String,
}

impl Attachment {
    pub fn from_bytes(
        id: impl Into<String>,
        prompt: impl Into<String>,
        mime: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            url: None,
            prompt: prompt.into(),
            bytes: Some(bytes),
            data_url: None,
            mime: mime.into(),
        }
    }

    /// True when the attachment still carries bytes without a durable form.
    pub fn needs_encoding(&self) -> bool {
        self.bytes.is_some() && self.data_url.is_none()
    }

    /// Install the durable encoded form and release the binary payload.
    pub fn apply_encoded(&mut self, data_url: String) {
        self.data_url = Some(data_url);
        self.bytes = None;
    }
}

/// One entry in a conversation's durable message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// Creation time in milliseconds since epoch. Display-only; strictly
    /// increasing within one conversation.
    pub timestamp_ms: i64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn user(id: MessageId, content: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.into(),
            timestamp_ms,
            is_error: false,
            attachments: Vec::new(),
        }
    }

    pub fn assistant(id: MessageId, content: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: content.into(),
            timestamp_ms,
            is_error: false,
            attachments: Vec::new(),
        }
    }

    /// An assistant message marking a failed turn, rendered distinctly.
    pub fn error(id: MessageId, reason: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: reason.into(),
            timestamp_ms,
            is_error: true,
            attachments: Vec::new(),
        }
    }
}
