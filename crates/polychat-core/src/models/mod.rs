pub mod conversation;
pub mod conversation_store;
pub mod message;
pub mod reconciler;
pub mod stream_aggregator;
