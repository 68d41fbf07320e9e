use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::conversation::Conversation;

use super::conversation_repository::{BoxFuture, ConversationRepository};
use super::error::RepositoryResult;

/// In-memory repository, useful for testing and development.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<InMemoryState>>,
}

#[derive(Default)]
struct InMemoryState {
    conversations: Vec<Conversation>,
    save_count: usize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed `save_all` calls (flush assertions in tests).
    pub fn save_count(&self) -> usize {
        self.state.lock().save_count
    }
}

impl ConversationRepository for InMemoryRepository {
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>> {
        let state = self.state.clone();
        Box::pin(async move { Ok(state.lock().conversations.clone()) })
    }

    fn save_all(&self, snapshot: Vec<Conversation>) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut guard = state.lock();
            guard.conversations = snapshot;
            guard.save_count += 1;
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            state.lock().conversations.clear();
            Ok(())
        })
    }
}
