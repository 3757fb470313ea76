//! Engine runners backed by spawned subprocesses.
//!
//! Each configured engine is a command line. A run spawns it with the prompt
//! as the final argument (plus `--resume <token>` when continuing), streams
//! its stdout line by line, and kills it when the cancellation token fires.
//!
//! Output protocol: every stdout line is progress output, except lines of the
//! form `resume: <token>`, which carry the continuation handle for the next
//! turn and are never shown. The last content line is withheld from the
//! stream and becomes the run's final answer.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_core::engine::EngineError;
use bridge_core::engine::EngineRouter;
use bridge_core::engine::EngineRunner;
use bridge_core::engine::EngineUnavailableError;
use bridge_core::engine::ResumeToken;
use bridge_core::engine::RunEvent;
use bridge_core::engine::RunOutcome;
use bridge_core::engine::RunRequest;
use bridge_core::engine::RunStatus;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

const RESUME_PREFIX: &str = "resume: ";

pub struct ProcessEngineRunner {
    name: String,
    command: Vec<String>,
}

impl ProcessEngineRunner {
    #[must_use]
    pub fn new(name: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }

    fn build_command(&self, request: &RunRequest) -> Result<Command, EngineError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(EngineError::Run {
                reason: format!("engine {:?} has an empty command", self.name),
            });
        };
        let mut command = Command::new(program);
        command.args(args);
        if let Some(resume) = &request.resume {
            command.arg("--resume").arg(resume.as_str());
        }
        command.arg(&request.prompt);
        if let Some(context) = &request.context {
            if let Some(project) = &context.project {
                command.env("BRIDGE_PROJECT", project);
            }
            if let Some(branch) = &context.branch {
                command.env("BRIDGE_BRANCH", branch);
            }
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl EngineRunner for ProcessEngineRunner {
    fn engine(&self) -> &str {
        &self.name
    }

    fn is_resume_line(&self, line: &str) -> bool {
        line.starts_with(RESUME_PREFIX)
    }

    fn extract_resume(&self, line: &str) -> Option<ResumeToken> {
        let token = line.strip_prefix(RESUME_PREFIX)?.trim();
        (!token.is_empty()).then(|| ResumeToken(token.to_string()))
    }

    async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let mut child = self
            .build_command(&request)?
            .spawn()
            .map_err(|err| EngineError::Run {
                reason: format!("failed to spawn engine {:?}: {err}", self.name),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Run {
            reason: format!("engine {:?} has no stdout pipe", self.name),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let mut resume: Option<ResumeToken> = None;
        // Withhold the latest content line; at EOF it is the final answer.
        let mut held: Option<String> = None;
        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(engine = self.name, "cancelling engine process");
                    if let Err(err) = child.start_kill() {
                        warn!(engine = self.name, %err, "failed to kill engine process");
                    }
                    let _ = child.wait().await;
                    return Ok(RunOutcome {
                        status: RunStatus::Canceled,
                        answer: String::new(),
                        resume,
                    });
                }
                line = lines.next_line() => line.map_err(|err| EngineError::Run {
                    reason: format!("failed to read engine output: {err}"),
                })?,
            };
            let Some(line) = line else {
                break;
            };
            if self.is_resume_line(&line) {
                if let Some(token) = self.extract_resume(&line) {
                    resume = Some(token);
                }
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            if let Some(previous) = held.replace(line) {
                let _ = events.send(RunEvent::Output(previous)).await;
            }
        }

        let status = child.wait().await.map_err(|err| EngineError::Run {
            reason: format!("failed to wait for engine process: {err}"),
        })?;
        if !status.success() {
            // Whatever was streamed stays visible; the failure itself becomes
            // the outcome.
            if let Some(last) = held {
                let _ = events.send(RunEvent::Output(last)).await;
            }
            return Ok(RunOutcome {
                status: RunStatus::Failed,
                answer: format!("engine {:?} exited with {status}", self.name),
                resume,
            });
        }
        Ok(RunOutcome {
            status: RunStatus::Completed,
            answer: held.unwrap_or_default(),
            resume,
        })
    }
}

/// Routes to the configured engines by name. With no explicit choice and
/// exactly one engine configured, that engine is used.
pub struct ConfiguredEngineRouter {
    engines: HashMap<String, Arc<ProcessEngineRunner>>,
}

impl ConfiguredEngineRouter {
    #[must_use]
    pub fn new(engines: HashMap<String, Vec<String>>) -> Self {
        let engines = engines
            .into_iter()
            .map(|(name, command)| {
                let runner = Arc::new(ProcessEngineRunner::new(&name, command));
                (name, runner)
            })
            .collect();
        Self { engines }
    }
}

#[async_trait]
impl EngineRouter for ConfiguredEngineRouter {
    async fn resolve(
        &self,
        _resume: Option<&ResumeToken>,
        engine_override: Option<&str>,
    ) -> Result<Arc<dyn EngineRunner>, EngineUnavailableError> {
        if let Some(name) = engine_override {
            return self
                .engines
                .get(name)
                .map(|runner| Arc::clone(runner) as Arc<dyn EngineRunner>)
                .ok_or_else(|| {
                    EngineUnavailableError::new(format!("engine {name:?} is not configured"))
                });
        }
        if self.engines.len() == 1
            && let Some(runner) = self.engines.values().next()
        {
            return Ok(Arc::clone(runner) as Arc<dyn EngineRunner>);
        }
        if self.engines.is_empty() {
            return Err(EngineUnavailableError::new("no engines configured"));
        }
        Err(EngineUnavailableError::new(
            "multiple engines configured and none selected",
        ))
    }
}
