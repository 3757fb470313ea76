//! Narrow seam to the engine collaborator that actually executes prompts.
//!
//! The bridge never runs an engine itself: it resolves a runner through
//! [`EngineRouter`], streams the runner's output events, and collects one
//! [`RunOutcome`]. Cancellation is cooperative: the runner is handed a
//! [`CancellationToken`] and is expected to observe it and unwind; nothing
//! here force-terminates a run.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque continuation handle letting a new prompt continue a prior run's
/// context. Never shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Ambient project/branch hints attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub project: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub session_id: String,
    pub prompt: String,
    pub resume: Option<ResumeToken>,
    pub context: Option<RunContext>,
}

/// Incremental output emitted while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Engine output destined for the session channel.
    Output(String),
    /// Progress chatter, posted ephemerally.
    Thought(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Final answer (or failure description for [`RunStatus::Failed`]).
    pub answer: String,
    pub resume: Option<ResumeToken>,
}

/// The collaborator reported no usable runner. Contained: the orchestrator
/// sends one user-visible message and the event still completes.
#[derive(Debug, Error)]
#[error("no usable engine: {reason}")]
pub struct EngineUnavailableError {
    pub reason: String,
}

impl EngineUnavailableError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine run failed: {reason}")]
    Run { reason: String },
}

/// One resolved engine runner.
#[async_trait]
pub trait EngineRunner: Send + Sync {
    /// Engine identifier, for logging.
    fn engine(&self) -> &str;

    /// Whether an output line is the engine's raw resume/continuation marker.
    /// Such lines are suppressed from the session channel and captured
    /// instead.
    fn is_resume_line(&self, _line: &str) -> bool {
        false
    }

    /// Extract the continuation token from a resume line.
    fn extract_resume(&self, _line: &str) -> Option<ResumeToken> {
        None
    }

    /// Execute the prompt, emitting incremental [`RunEvent`]s on `events`.
    /// Observes `cancel` cooperatively and resolves with
    /// [`RunStatus::Canceled`] when it fires.
    async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError>;
}

/// Resolves a runner for a session turn, honoring the resume token and an
/// explicit or default engine override.
#[async_trait]
pub trait EngineRouter: Send + Sync {
    async fn resolve(
        &self,
        resume: Option<&ResumeToken>,
        engine_override: Option<&str>,
    ) -> Result<Arc<dyn EngineRunner>, EngineUnavailableError>;
}
