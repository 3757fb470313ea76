//! Drives one engine run for a session: resolve a runner, stream its events
//! to the remote channel, watch for stop requests, and record the outcome.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::RemoteApi;
use crate::engine::EngineRouter;
use crate::engine::EngineRunner;
use crate::engine::ResumeToken;
use crate::engine::RunEvent;
use crate::engine::RunRequest;
use crate::engine::RunStatus;
use crate::error::EventError;
use crate::event::Activity;
use crate::event::PlanStep;
use crate::event::PlanStepStatus;
use crate::session::SessionState;
use crate::session::lock_unpoisoned;

/// Cadence of the out-of-band stop watcher while a run is in flight.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

const PLAN_STEPS: [&str; 4] = [
    "Analyze request",
    "Implement changes",
    "Run tests",
    "Summarize results",
];

fn plan(active: usize, done_through: usize) -> Vec<PlanStep> {
    PLAN_STEPS
        .iter()
        .enumerate()
        .map(|(index, content)| {
            let status = if index < done_through {
                PlanStepStatus::Completed
            } else if index == active {
                PlanStepStatus::InProgress
            } else {
                PlanStepStatus::Pending
            };
            PlanStep::new(content, status)
        })
        .collect()
}

pub struct RunOrchestrator {
    api: Arc<dyn RemoteApi>,
    router: Arc<dyn EngineRouter>,
    default_engine: Option<String>,
}

impl RunOrchestrator {
    #[must_use]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        router: Arc<dyn EngineRouter>,
        default_engine: Option<String>,
    ) -> Self {
        Self {
            api,
            router,
            default_engine,
        }
    }

    /// Execute one prompt for the session. The caller holds the session's run
    /// lock for the whole call.
    ///
    /// A router with no usable engine is a contained failure: the user gets
    /// one error activity and the event completes normally. Incremental
    /// activity posts are best-effort; only the final response post is
    /// allowed to fail the event.
    pub async fn run_for_session(
        &self,
        session_id: &str,
        prompt: &str,
        state: &Arc<SessionState>,
        engine_override: Option<&str>,
        update_plan: bool,
    ) -> Result<(), EventError> {
        if update_plan {
            self.set_plan_best_effort(session_id, plan(0, 0)).await;
        }

        let resume = lock_unpoisoned(&state.resume).clone();
        let engine_override = engine_override.or(self.default_engine.as_deref());
        let runner = match self.router.resolve(resume.as_ref(), engine_override).await {
            Ok(runner) => runner,
            Err(err) => {
                info!(session_id, %err, "no engine available for session");
                self.post_error(session_id, &err.to_string()).await;
                return Ok(());
            }
        };
        info!(session_id, engine = runner.engine(), "starting engine run");

        let request = RunRequest {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            resume,
            context: lock_unpoisoned(&state.context).clone(),
        };

        let guard = state.register_task();
        let cancel = guard.token().clone();
        let run_done = CancellationToken::new();
        let watcher = tokio::spawn(watch_stop(
            Arc::clone(state),
            run_done.clone(),
            STOP_POLL_INTERVAL,
        ));

        let (events_tx, mut events_rx) = mpsc::channel::<RunEvent>(64);
        let mut captured_resume: Option<ResumeToken> = None;
        let run_result = {
            let mut run_fut = pin!(runner.run(request, events_tx, cancel));
            let mut events_open = true;
            loop {
                tokio::select! {
                    result = &mut run_fut => break result,
                    event = events_rx.recv(), if events_open => match event {
                        Some(event) => {
                            self.forward_event(session_id, runner.as_ref(), event, &mut captured_resume)
                                .await;
                        }
                        None => events_open = false,
                    },
                }
            }
        };

        run_done.cancel();
        if let Err(err) = watcher.await {
            warn!(session_id, %err, "stop watcher task failed");
        }
        drop(guard);
        while let Ok(event) = events_rx.try_recv() {
            self.forward_event(session_id, runner.as_ref(), event, &mut captured_resume)
                .await;
        }

        let outcome = match run_result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(session_id, %err, "engine run failed");
                self.post_error(session_id, &err.to_string()).await;
                return Err(err.into());
            }
        };

        let resume = outcome.resume.or(captured_resume);
        if resume.is_some() {
            *lock_unpoisoned(&state.resume) = resume;
        }

        match outcome.status {
            RunStatus::Completed => {
                info!(session_id, "engine run completed");
                if !outcome.answer.is_empty() {
                    self.api
                        .create_activity(session_id, &Activity::response(&outcome.answer))
                        .await?;
                }
            }
            RunStatus::Failed => {
                warn!(session_id, answer = %outcome.answer, "engine run reported failure");
                self.post_error(session_id, &outcome.answer).await;
            }
            RunStatus::Canceled => {
                info!(session_id, "engine run cancelled");
            }
        }

        if update_plan && outcome.status == RunStatus::Completed && !state.stop_requested() {
            self.set_plan_best_effort(session_id, plan(PLAN_STEPS.len(), PLAN_STEPS.len()))
                .await;
        }
        Ok(())
    }

    /// Relay one incremental engine event to the session channel. Resume
    /// marker lines are captured and suppressed instead of posted.
    async fn forward_event(
        &self,
        session_id: &str,
        runner: &dyn EngineRunner,
        event: RunEvent,
        captured_resume: &mut Option<ResumeToken>,
    ) {
        let activity = match event {
            RunEvent::Output(line) => {
                if runner.is_resume_line(&line) {
                    if let Some(token) = runner.extract_resume(&line) {
                        debug!(session_id, "captured resume token from engine output");
                        *captured_resume = Some(token);
                    }
                    return;
                }
                if line.trim().is_empty() {
                    return;
                }
                Activity::thought(&line)
            }
            RunEvent::Thought(text) => Activity::ephemeral_thought(&text),
        };
        if let Err(err) = self.api.create_activity(session_id, &activity).await {
            warn!(session_id, %err, "failed to post incremental activity");
        }
    }

    async fn post_error(&self, session_id: &str, message: &str) {
        let body = format!("error:\n{message}");
        if let Err(err) = self
            .api
            .create_activity(session_id, &Activity::error(&body))
            .await
        {
            warn!(session_id, %err, "failed to post error activity");
        }
    }

    async fn set_plan_best_effort(&self, session_id: &str, steps: Vec<PlanStep>) {
        if let Err(err) = self.api.set_plan(session_id, &steps).await {
            warn!(session_id, %err, "failed to update session plan");
        }
    }
}

/// Polls the session's stop flag while a run is in flight and cancels the
/// running-task handles when it fires. Catches stops that land through paths
/// that never touch this session's dispatch (another worker, a stale flag).
async fn watch_stop(state: Arc<SessionState>, run_done: CancellationToken, interval: Duration) {
    loop {
        if state.stop_requested() && state.cancel_running() > 0 {
            return;
        }
        tokio::select! {
            () = run_done.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
