//! Shared in-memory doubles for component and end-to-end tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::ApiError;
use crate::client::RemoteApi;
use crate::engine::EngineError;
use crate::engine::EngineRouter;
use crate::engine::EngineRunner;
use crate::engine::EngineUnavailableError;
use crate::engine::ResumeToken;
use crate::engine::RunEvent;
use crate::engine::RunOutcome;
use crate::engine::RunRequest;
use crate::engine::RunStatus;
use crate::event::Activity;
use crate::event::GatewayEvent;
use crate::event::PlanStep;
use crate::queue::EventQueue;
use crate::queue::QueueError;

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`EventQueue`] honoring the claim-partitioning contract: a row
/// handed to one poller is never handed to another.
#[derive(Debug, Default)]
pub(crate) struct MemoryQueue {
    pending: StdMutex<VecDeque<GatewayEvent>>,
    batch_size: usize,
    done: StdMutex<Vec<String>>,
    failed: StdMutex<Vec<(String, String)>>,
}

impl MemoryQueue {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    pub(crate) fn push(&self, event: GatewayEvent) {
        lock_unpoisoned(&self.pending).push_back(event);
    }

    pub(crate) fn done_ids(&self) -> Vec<String> {
        lock_unpoisoned(&self.done).clone()
    }

    pub(crate) fn failures(&self) -> Vec<(String, String)> {
        lock_unpoisoned(&self.failed).clone()
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn poll(&self) -> Result<Vec<GatewayEvent>, QueueError> {
        let mut pending = lock_unpoisoned(&self.pending);
        let take = self.batch_size.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn mark_done(&self, event_id: &str) -> Result<(), QueueError> {
        lock_unpoisoned(&self.done).push(event_id.to_string());
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<(), QueueError> {
        lock_unpoisoned(&self.failed).push((event_id.to_string(), error.to_string()));
        Ok(())
    }
}

/// Recording [`RemoteApi`] double with configurable issue/activity lookups.
#[derive(Debug, Default)]
pub(crate) struct RecordingApi {
    activities: StdMutex<Vec<(String, Activity)>>,
    plans: StdMutex<Vec<(String, Vec<PlanStep>)>>,
    issues: StdMutex<HashMap<String, Value>>,
    remote_activities: StdMutex<HashMap<String, Value>>,
    fail_plans: AtomicBool,
    next_id: AtomicU64,
}

impl RecordingApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_issue(self, issue_id: &str, issue: Value) -> Self {
        lock_unpoisoned(&self.issues).insert(issue_id.to_string(), issue);
        self
    }

    pub(crate) fn with_remote_activity(self, activity_id: &str, activity: Value) -> Self {
        lock_unpoisoned(&self.remote_activities).insert(activity_id.to_string(), activity);
        self
    }

    pub(crate) fn fail_plans(&self) {
        self.fail_plans.store(true, Ordering::SeqCst);
    }

    pub(crate) fn activities(&self) -> Vec<(String, Activity)> {
        lock_unpoisoned(&self.activities).clone()
    }

    pub(crate) fn plans(&self) -> Vec<(String, Vec<PlanStep>)> {
        lock_unpoisoned(&self.plans).clone()
    }
}

#[async_trait]
impl RemoteApi for RecordingApi {
    async fn create_activity(
        &self,
        session_id: &str,
        activity: &Activity,
    ) -> Result<String, ApiError> {
        lock_unpoisoned(&self.activities).push((session_id.to_string(), activity.clone()));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("act_{id}"))
    }

    async fn set_plan(&self, session_id: &str, steps: &[PlanStep]) -> Result<(), ApiError> {
        if self.fail_plans.load(Ordering::SeqCst) {
            return Err(ApiError::MissingField {
                field: "agentSessionUpdate.success",
            });
        }
        lock_unpoisoned(&self.plans).push((session_id.to_string(), steps.to_vec()));
        Ok(())
    }

    async fn get_issue(&self, issue_id: &str) -> Result<Value, ApiError> {
        lock_unpoisoned(&self.issues)
            .get(issue_id)
            .cloned()
            .ok_or(ApiError::MissingField { field: "issue" })
    }

    async fn get_activity(&self, activity_id: &str) -> Result<Value, ApiError> {
        lock_unpoisoned(&self.remote_activities)
            .get(activity_id)
            .cloned()
            .ok_or(ApiError::MissingField {
                field: "agentActivity",
            })
    }
}

/// Scripted [`EngineRunner`]: emits fixed events, then either resolves with a
/// fixed outcome or blocks until cancelled. Appends `start:<prompt>` /
/// `end:<prompt>` markers to `log` for ordering assertions.
pub(crate) struct ScriptedRunner {
    pub(crate) events: Vec<RunEvent>,
    pub(crate) outcome: RunOutcome,
    pub(crate) resume_line_prefix: Option<String>,
    pub(crate) block_until_cancelled: bool,
    pub(crate) run_duration: Option<Duration>,
    pub(crate) fail_with: Option<String>,
    pub(crate) log: Arc<StdMutex<Vec<String>>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            outcome: RunOutcome {
                status: RunStatus::Completed,
                answer: "done".to_string(),
                resume: None,
            },
            resume_line_prefix: None,
            block_until_cancelled: false,
            run_duration: None,
            fail_with: None,
            log: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

impl ScriptedRunner {
    pub(crate) fn run_log(&self) -> Arc<StdMutex<Vec<String>>> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl EngineRunner for ScriptedRunner {
    fn engine(&self) -> &str {
        "scripted"
    }

    fn is_resume_line(&self, line: &str) -> bool {
        self.resume_line_prefix
            .as_deref()
            .is_some_and(|prefix| line.starts_with(prefix))
    }

    fn extract_resume(&self, line: &str) -> Option<ResumeToken> {
        let prefix = self.resume_line_prefix.as_deref()?;
        let token = line.strip_prefix(prefix)?.trim();
        (!token.is_empty()).then(|| ResumeToken(token.to_string()))
    }

    async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        lock_unpoisoned(&self.log).push(format!("start:{}", request.prompt));
        for event in &self.events {
            let _ = events.send(event.clone()).await;
        }
        if self.block_until_cancelled {
            cancel.cancelled().await;
            lock_unpoisoned(&self.log).push(format!("end:{}", request.prompt));
            return Ok(RunOutcome {
                status: RunStatus::Canceled,
                answer: String::new(),
                resume: None,
            });
        }
        if let Some(duration) = self.run_duration {
            tokio::time::sleep(duration).await;
        }
        lock_unpoisoned(&self.log).push(format!("end:{}", request.prompt));
        if let Some(reason) = &self.fail_with {
            return Err(EngineError::Run {
                reason: reason.clone(),
            });
        }
        Ok(self.outcome.clone())
    }
}

/// Router resolving to one fixed runner, recording every resolution request.
pub(crate) struct StaticRouter {
    runner: Arc<dyn EngineRunner>,
    resolutions: StdMutex<Vec<(Option<ResumeToken>, Option<String>)>>,
}

impl StaticRouter {
    pub(crate) fn new(runner: Arc<dyn EngineRunner>) -> Self {
        Self {
            runner,
            resolutions: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn resolutions(&self) -> Vec<(Option<ResumeToken>, Option<String>)> {
        lock_unpoisoned(&self.resolutions).clone()
    }
}

#[async_trait]
impl EngineRouter for StaticRouter {
    async fn resolve(
        &self,
        resume: Option<&ResumeToken>,
        engine_override: Option<&str>,
    ) -> Result<Arc<dyn EngineRunner>, EngineUnavailableError> {
        lock_unpoisoned(&self.resolutions)
            .push((resume.cloned(), engine_override.map(str::to_string)));
        Ok(Arc::clone(&self.runner))
    }
}

/// Router with no usable runner.
pub(crate) struct UnavailableRouter {
    pub(crate) reason: String,
}

#[async_trait]
impl EngineRouter for UnavailableRouter {
    async fn resolve(
        &self,
        _resume: Option<&ResumeToken>,
        _engine_override: Option<&str>,
    ) -> Result<Arc<dyn EngineRunner>, EngineUnavailableError> {
        Err(EngineUnavailableError::new(self.reason.clone()))
    }
}
