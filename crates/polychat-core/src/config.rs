use std::time::Duration;

use crate::models::reconciler::DEFAULT_THROTTLE_INTERVAL;
use crate::persistence::DEFAULT_FLUSH_DEBOUNCE;

/// Tuning knobs for the streaming engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum interval between durable message-list updates while a
    /// stream is in flight.
    pub throttle_interval: Duration,
    /// Quiet interval after the last change before persistence flushes.
    pub flush_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            flush_debounce: DEFAULT_FLUSH_DEBOUNCE,
        }
    }
}
