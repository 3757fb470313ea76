//! Per-event error taxonomy.

use thiserror::Error;

use crate::client::ApiError;
use crate::engine::EngineError;
use crate::normalize::NormalizeError;

/// Everything that can fail while handling one claimed event. The dispatch
/// loop's per-event boundary catches these, logs them with structured
/// context, and marks the event failed; it never aborts other events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("missing prompt text in event payload")]
    MissingPrompt,
}
