mod conversation_repository;
mod error;
mod in_memory_repository;
mod json_repository;

pub use conversation_repository::{BoxFuture, ConversationRepository};
pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryRepository;
pub use json_repository::JsonFileRepository;
