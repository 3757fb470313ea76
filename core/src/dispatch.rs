//! Poll-claim-handle loop tying the queue, normalizer, session registry, and
//! orchestrator together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::client::RemoteApi;
use crate::engine::RunContext;
use crate::error::EventError;
use crate::event::Activity;
use crate::event::CanonicalEvent;
use crate::event::EventKind;
use crate::event::GatewayEvent;
use crate::normalize;
use crate::orchestrator::RunOrchestrator;
use crate::queue::EventQueue;
use crate::queue::QueueError;
use crate::session::SessionRegistry;
use crate::session::SessionState;
use crate::session::lock_unpoisoned;

pub struct DispatchLoop {
    queue: Arc<dyn EventQueue>,
    api: Arc<dyn RemoteApi>,
    registry: Arc<SessionRegistry>,
    orchestrator: Arc<RunOrchestrator>,
    poll_interval: Duration,
    /// Remote project id to local project name, for seeding run context.
    project_map: HashMap<String, String>,
}

impl DispatchLoop {
    #[must_use]
    pub fn new(
        queue: Arc<dyn EventQueue>,
        api: Arc<dyn RemoteApi>,
        registry: Arc<SessionRegistry>,
        orchestrator: Arc<RunOrchestrator>,
        poll_interval: Duration,
        project_map: HashMap<String, String>,
    ) -> Self {
        Self {
            queue,
            api,
            registry,
            orchestrator,
            poll_interval,
            project_map,
        }
    }

    /// Poll forever. Claimed events are handled concurrently, each behind its
    /// own error boundary; only queue storage errors escape.
    pub async fn run(self: Arc<Self>) -> Result<(), QueueError> {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "dispatch loop started");
        loop {
            let events = self.queue.poll().await?;
            if events.is_empty() {
                self.queue.idle(self.poll_interval).await;
                continue;
            }
            debug!(count = events.len(), "claimed events");
            for event in events {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.handle_and_mark(event).await });
            }
        }
    }

    /// Per-event error boundary: handle, then settle the row. Marking errors
    /// are logged and dropped so one bad row never wedges the loop.
    pub async fn handle_and_mark(&self, event: GatewayEvent) {
        let event_id = event.id.clone();
        match self.handle_event(event).await {
            Ok(()) => {
                if let Err(err) = self.queue.mark_done(&event_id).await {
                    error!(event_id, %err, "failed to mark event done");
                }
            }
            Err(err) => {
                warn!(event_id, %err, "event handling failed");
                if let Err(mark_err) = self.queue.mark_failed(&event_id, &err.to_string()).await {
                    error!(event_id, %mark_err, "failed to mark event failed");
                }
            }
        }
    }

    async fn handle_event(&self, event: GatewayEvent) -> Result<(), EventError> {
        let canonical = normalize::canonicalize(&event)?;
        match canonical.kind {
            EventKind::Ignored => {
                debug!(event_id = event.id, event_type = event.event_type, "ignoring event");
                Ok(())
            }
            EventKind::Stopped => self.handle_stop(&canonical).await,
            EventKind::Created | EventKind::Prompted => self.handle_run(canonical).await,
        }
    }

    /// Apply a stop immediately, outside the run lock: the whole point is to
    /// interrupt whatever currently holds it.
    async fn handle_stop(&self, canonical: &CanonicalEvent) -> Result<(), EventError> {
        let state = self.registry.get_or_create(&canonical.session_id);
        let report = state.request_stop();
        info!(
            session_id = canonical.session_id,
            cancelled = report.cancelled,
            run_in_flight = report.run_in_flight,
            "stop requested"
        );
        if report.should_acknowledge() {
            self.api
                .create_activity(
                    &canonical.session_id,
                    &Activity::ephemeral_thought("Stop requested. Cancelling the current run."),
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_run(&self, mut canonical: CanonicalEvent) -> Result<(), EventError> {
        let state = self.registry.get_or_create(&canonical.session_id);
        // Runs for one session are strictly serialized; later prompts queue
        // here until the current run releases the lock.
        let _run_permit = state.run_lock.lock().await;
        state.set_stop_requested(false);

        if canonical.kind == EventKind::Created {
            self.fill_from_issue(&mut canonical).await;
        }
        self.seed_context(&canonical, &state);

        let prompt = self.resolve_prompt(&canonical).await;
        let Some(prompt) = prompt else {
            self.api
                .create_activity(
                    &canonical.session_id,
                    &Activity::error("error:\nNo prompt text found in the session event."),
                )
                .await?;
            return Err(EventError::MissingPrompt);
        };

        // Immediate feedback while the engine spins up.
        if let Err(err) = self
            .api
            .create_activity(
                &canonical.session_id,
                &Activity::ephemeral_thought("Acknowledged. Starting to work on this."),
            )
            .await
        {
            warn!(session_id = canonical.session_id, %err, "failed to post acknowledgement");
        }

        // A stop that raced in between claim and lock acquisition aborts the
        // run before it starts.
        if state.stop_requested() {
            info!(session_id = canonical.session_id, "stop requested before run start");
            return Ok(());
        }

        self.orchestrator
            .run_for_session(
                &canonical.session_id,
                &prompt,
                &state,
                None,
                canonical.kind == EventKind::Created,
            )
            .await
    }

    /// Created events sometimes arrive before the webhook carries the issue
    /// snapshot; fetch it once to fill the title and project id.
    async fn fill_from_issue(&self, canonical: &mut CanonicalEvent) {
        let Some(issue_id) = canonical.issue_id.as_deref() else {
            return;
        };
        if canonical.project_id.is_some() && canonical.issue_title.is_some() {
            return;
        }
        match self.api.get_issue(issue_id).await {
            Ok(issue) => {
                if canonical.project_id.is_none() {
                    canonical.project_id = issue["project"]["id"].as_str().map(str::to_string);
                }
                if canonical.issue_title.is_none() {
                    canonical.issue_title = issue["title"]
                        .as_str()
                        .map(str::trim)
                        .filter(|title| !title.is_empty())
                        .map(str::to_string);
                }
            }
            Err(err) => {
                warn!(issue_id, %err, "issue lookup failed");
            }
        }
    }

    fn seed_context(&self, canonical: &CanonicalEvent, state: &Arc<SessionState>) {
        let mut context = lock_unpoisoned(&state.context);
        if context.is_some() {
            return;
        }
        if let Some(project) = canonical
            .project_id
            .as_deref()
            .and_then(|id| self.project_map.get(id))
        {
            *context = Some(RunContext {
                project: Some(project.clone()),
                branch: None,
            });
        }
    }

    /// Prompt precedence: issue title for created sessions, then the inline
    /// prompt text, then a remote fetch of the referenced activity.
    async fn resolve_prompt(&self, canonical: &CanonicalEvent) -> Option<String> {
        let inline = if canonical.kind == EventKind::Created {
            canonical
                .issue_title
                .clone()
                .or_else(|| canonical.prompt_text.clone())
        } else {
            canonical.prompt_text.clone()
        };
        if inline.is_some() {
            return inline;
        }
        let activity_id = canonical.activity_id.as_deref()?;
        match self.api.get_activity(activity_id).await {
            Ok(activity) => normalize::extract_activity_body(&activity["content"]),
            Err(err) => {
                warn!(activity_id, %err, "activity lookup failed");
                None
            }
        }
    }
}
