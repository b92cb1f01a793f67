use crate::services::supervisor::{ProcessKiller, WorkerInvocation};
use serde::Serialize;
use std::time::Instant;

/// Monotonic job identifier, unique for the lifetime of the process
pub type JobId = u64;

/// Lifecycle of a generation job.
///
/// `Idle` is represented by the absence of a running job; every job moves
/// from `Running` to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// The single generation job tracked by the application
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub invocation: WorkerInvocation,

    /// Set once the worker is spawned, cleared when the job is terminal
    pub killer: Option<ProcessKiller>,

    pub state: JobState,
    pub cancel_requested: bool,

    /// A hard kill arrived before the worker was spawned
    pub kill_pending: bool,

    pub started_at: Instant,
}

impl Job {
    pub fn new(id: JobId, invocation: WorkerInvocation) -> Self {
        Self {
            id,
            invocation,
            killer: None,
            state: JobState::Running,
            cancel_requested: false,
            kill_pending: false,
            started_at: Instant::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// Mutable state of the bridge.
///
/// Wrapped by [`crate::state::StateManager`]; mutate it only through
/// [`update()`](crate::state::StateManager::update) so change events are emitted.
/// Only the job controller touches `job`.
#[derive(Clone, Debug, Default)]
pub struct AppState {
    /// Most recent job; `None` until the first generation request
    pub job: Option<Job>,
    pub last_job_id: JobId,

    pub window_maximized: bool,
    pub window_minimized: bool,

    /// Interpreter command resolved at startup
    pub interpreter: Option<String>,

    /// Reason code of the fatal error the bridge is shutting down for
    pub fatal_error: Option<String>,
}

impl AppState {
    pub fn is_job_running(&self) -> bool {
        self.job.as_ref().is_some_and(Job::is_running)
    }

    pub fn running_job_id(&self) -> Option<JobId> {
        self.job.as_ref().filter(|job| job.is_running()).map(|job| job.id)
    }

    /// The job with `id`, if it is still the tracked one
    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.job.as_mut().filter(|job| job.id == id)
    }
}
