//! Per-session state and the registry that owns it.
//!
//! State is process-memory only and lost on restart. Sessions are created
//! lazily on first reference and never evicted: each entry is a handful of
//! fields keyed by the remote session id, and dropping one would discard the
//! resume token for a session that may prompt again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::ResumeToken;
use crate::engine::RunContext;

pub(crate) fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a stop request observed at the moment it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Running-task handles that were signaled.
    pub cancelled: usize,
    /// Whether the run lock was held when the stop landed.
    pub run_in_flight: bool,
}

impl StopReport {
    /// A stop acknowledgement is user-visible only when the stop had
    /// something to cancel.
    #[must_use]
    pub fn should_acknowledge(&self) -> bool {
        self.cancelled > 0 || self.run_in_flight
    }
}

/// State for one agent session.
///
/// `stop_requested` and task cancellation may be signaled from any task at
/// any time; `resume` and `context` are only written while the run lock is
/// held.
#[derive(Debug, Default)]
pub struct SessionState {
    pub resume: StdMutex<Option<ResumeToken>>,
    pub context: StdMutex<Option<RunContext>>,
    stop_requested: AtomicBool,
    /// At most one run-lock holder per session at any instant.
    pub run_lock: Mutex<()>,
    running: StdMutex<HashMap<u64, CancellationToken>>,
    next_task_id: AtomicU64,
}

impl SessionState {
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn set_stop_requested(&self, value: bool) {
        self.stop_requested.store(value, Ordering::SeqCst);
    }

    /// Register an in-flight run. The returned guard deregisters the handle
    /// on drop; the token is what stop events cancel.
    #[must_use]
    pub fn register_task(self: &Arc<Self>) -> TaskGuard {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        lock_unpoisoned(&self.running).insert(id, token.clone());
        TaskGuard {
            state: Arc::clone(self),
            id,
            token,
        }
    }

    /// Signal every registered running-task handle; returns how many there
    /// were.
    pub fn cancel_running(&self) -> usize {
        let running = lock_unpoisoned(&self.running);
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    /// Set the stop flag and cancel whatever is running.
    pub fn request_stop(&self) -> StopReport {
        self.set_stop_requested(true);
        let cancelled = self.cancel_running();
        let run_in_flight = self.run_lock.try_lock().is_err();
        StopReport {
            cancelled,
            run_in_flight,
        }
    }

    #[cfg(test)]
    fn running_count(&self) -> usize {
        lock_unpoisoned(&self.running).len()
    }
}

/// Deregisters its running-task handle when dropped, whatever the run's
/// outcome.
#[derive(Debug)]
pub struct TaskGuard {
    state: Arc<SessionState>,
    id: u64,
    token: CancellationToken,
}

impl TaskGuard {
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        lock_unpoisoned(&self.state.running).remove(&self.id);
    }
}

/// Session id → state map with concurrency-safe lazy creation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Arc<SessionState>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing state for the id, or a freshly inserted one. The single
    /// registry lock makes the first-touch race safe: two concurrent callers
    /// for a brand-new id always receive the same state.
    #[must_use]
    pub fn get_or_create(&self, session_id: &str) -> Arc<SessionState> {
        let mut sessions = lock_unpoisoned(&self.sessions);
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionState::default())),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.sessions).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
