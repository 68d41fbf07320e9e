//! Concurrent multi-model streaming conversation engine.
//!
//! A user turn opens one response stream (or a fan-out stream across
//! several models), chunks accumulate in a pure aggregator, and a
//! reconciler folds the accumulated content into the conversation's
//! durable message list. Persistence is debounced and best-effort;
//! the durable list is the only surface the presentation layer reads.

pub mod config;
pub mod engine;
pub mod models;
pub mod persistence;
pub mod repositories;
pub mod services;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::ChatEngine;
pub use models::conversation::{Capability, Conversation, ConversationKind};
pub use models::conversation_store::ConversationStore;
pub use models::message::{Attachment, Message, MessageId, Role};
pub use models::reconciler::ReconcileError;
pub use models::stream_aggregator::{AggregatorState, ModelBuffer, ModelId, RequestId, StreamEvent};
pub use repositories::{
    ConversationRepository, InMemoryRepository, JsonFileRepository, RepositoryError,
};
pub use services::{
    CancelHandle, FanoutRequest, HttpStreamSource, OpenError, OpenedStream, ResponseStream,
    StreamChunk, StreamRequest, StreamSource,
};
