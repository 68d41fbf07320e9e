use std::future::Future;
use std::pin::Pin;

use crate::models::conversation::Conversation;

use super::error::RepositoryResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Repository trait for the persisted conversation collection.
///
/// The persisted layout is a single JSON-serializable array of
/// conversations, attachments reduced to their durable encoded form.
pub trait ConversationRepository: Send + Sync + 'static {
    /// Load the persisted collection. An absent or corrupt store loads as
    /// an empty collection, never an error that crashes the caller.
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>>;

    /// Replace the persisted collection with the given snapshot.
    fn save_all(&self, snapshot: Vec<Conversation>) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Remove the persisted collection entirely.
    fn clear(&self) -> BoxFuture<'static, RepositoryResult<()>>;
}
