use crate::metrics::Metrics;
use crate::models::{Job, JobId, JobState};
use crate::services::failure::{WorkerFailure, classify_exit};
use crate::services::progress::{ProgressEvent, ProgressParser, ProgressRelay};
use crate::services::settings_store::{SettingsWriter, SourcePaths};
use crate::services::supervisor::{ExitOutcome, ProcessHandle, ProcessSupervisor, WorkerInvocation};
use crate::state::{BridgeEvent, StateManager};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Environment variable carrying the cancel sentinel path to the worker
pub const CANCEL_FILE_ENV: &str = "OOTR_CANCEL_FILE";

/// Default grace between the cooperative cancel request and the hard kill
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Errors returned when a job cannot be started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Generation job {0} is already running")]
    AlreadyRunning(JobId),
}

/// A validated `generateSeed` request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub settings_file: Map<String, Value>,
    pub static_seed: String,
}

impl GenerateRequest {
    /// Build from a `{settingsFile, staticSeed}` payload.
    ///
    /// A non-string seed is treated as no seed.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;
        Some(Self {
            settings_file: object.get("settingsFile")?.as_object()?.clone(),
            static_seed: object
                .get("staticSeed")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(WorkerFailure),
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Succeeded(_) => JobState::Succeeded,
            Self::Failed(_) => JobState::Failed,
            Self::Cancelled => JobState::Cancelled,
        }
    }
}

/// Read-only view of the tracked job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub cancel_requested: bool,
}

/// Handed out for an accepted job; resolves once the job is terminal
#[derive(Debug)]
pub struct JobTicket {
    pub id: JobId,
    outcome_rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub async fn wait(self) -> JobOutcome {
        match self.outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("Job {} ended without reporting an outcome", self.id);
                JobOutcome::Failed(WorkerFailure::new(
                    crate::services::failure::FailureReason::WorkerFailed,
                    "Job driver stopped unexpectedly",
                    "",
                ))
            }
        }
    }
}

/// How generation jobs are run and cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub interpreter: String,

    /// Wait between writing the cancel sentinel and killing the worker;
    /// zero kills immediately
    pub cancel_grace: Duration,

    /// Write the cancel sentinel before killing
    pub cooperative_cancel: bool,
}

impl JobConfig {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            cooperative_cancel: true,
        }
    }
}

enum CancelStep {
    NotRunning,
    InFlight,
    Start(JobId),
}

/// Owns the single-job invariant.
///
/// At most one job is `Running`; the check and the transition happen under
/// the state lock, so concurrent start requests cannot both be accepted.
/// Every job reaches exactly one terminal state, and its terminal event is
/// published after all of its progress events.
#[derive(Clone)]
pub struct JobController {
    state: StateManager,
    supervisor: ProcessSupervisor,
    writer: Arc<dyn SettingsWriter>,
    paths: SourcePaths,
    config: JobConfig,
    metrics: Arc<Metrics>,
}

impl JobController {
    pub fn new(
        state: StateManager,
        supervisor: ProcessSupervisor,
        writer: Arc<dyn SettingsWriter>,
        paths: SourcePaths,
        config: JobConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            supervisor,
            writer,
            paths,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Start a generation job.
    ///
    /// Rejected with [`JobError::AlreadyRunning`] (nothing persisted, nothing
    /// spawned) while another job runs. Otherwise the settings are persisted,
    /// the worker is spawned and a background task drives the job to its
    /// terminal state. A spawn failure still yields a ticket; the job is then
    /// already `Failed`.
    pub fn start_job(&self, request: GenerateRequest) -> Result<JobTicket, JobError> {
        let invocation = self.build_invocation(&request);

        let (accepted, _) = self.state.update_with(|state| {
            if let Some(running) = state.running_job_id() {
                return Err(JobError::AlreadyRunning(running));
            }
            state.last_job_id += 1;
            let id = state.last_job_id;
            state.job = Some(Job::new(id, invocation.clone()));
            Ok(id)
        });

        let id = match accepted {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("{}", e);
                return Err(e);
            }
        };

        tracing::info!("Starting generation job {}", id);
        self.metrics.record_job_started();

        self.clear_cancel_file();
        if let Err(e) = self.writer.save_settings(&request.settings_file) {
            tracing::warn!("Failed to persist settings for job {}: {}", id, e);
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();

        match self.supervisor.spawn(&invocation) {
            Ok(mut handle) => {
                let killer = handle.killer();
                let (kill_now, _) = self.state.update_with(|state| match state.job_mut(id) {
                    Some(job) => {
                        job.killer = Some(killer.clone());
                        job.kill_pending
                    }
                    None => false,
                });
                if kill_now {
                    tracing::info!("Job {} was cancelled while starting, killing worker", id);
                    killer.kill();
                }

                let chunks = handle.take_stdout_chunks();
                tokio::spawn(self.clone().drive(id, handle, chunks, outcome_tx));
            }
            Err(e) => {
                tracing::error!("Failed to start worker for job {}: {}", id, e);
                self.finish(id, JobOutcome::Failed(WorkerFailure::spawn_failed(&e)), outcome_tx);
            }
        }

        Ok(JobTicket { id, outcome_rx })
    }

    /// Request cancellation of the running job.
    ///
    /// # Returns
    /// `false` when no job is running (nothing else happens). `true` when a
    /// cancellation was started or is already in flight.
    pub fn cancel_active_job(&self) -> bool {
        let (step, _) = self.state.update_with(|state| match state.job.as_mut() {
            Some(job) if job.is_running() => {
                if job.cancel_requested {
                    CancelStep::InFlight
                } else {
                    job.cancel_requested = true;
                    CancelStep::Start(job.id)
                }
            }
            _ => CancelStep::NotRunning,
        });

        let id = match step {
            CancelStep::NotRunning => return false,
            CancelStep::InFlight => {
                tracing::debug!("Cancellation already in flight");
                return true;
            }
            CancelStep::Start(id) => id,
        };

        tracing::info!("Cancelling generation job {}", id);

        let grace = if self.config.cooperative_cancel {
            self.request_cooperative_cancel(id);
            self.config.cancel_grace
        } else {
            Duration::ZERO
        };

        if grace.is_zero() {
            self.hard_kill(id);
        } else {
            let controller = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                controller.hard_kill(id);
            });
        }

        true
    }

    /// Kill the running job's worker tree without the cooperative grace.
    ///
    /// Used on shutdown. Returns `false` when no job is running.
    pub fn abort_active_job(&self) -> bool {
        let (running, _) = self.state.update_with(|state| match state.job.as_mut() {
            Some(job) if job.is_running() => {
                job.cancel_requested = true;
                Some(job.id)
            }
            _ => None,
        });

        match running {
            Some(id) => {
                tracing::info!("Aborting generation job {}", id);
                self.hard_kill(id);
                true
            }
            None => false,
        }
    }

    /// Current job, if any has been started
    pub fn status(&self) -> Option<JobSnapshot> {
        self.state.read(|state| {
            state.job.as_ref().map(|job| JobSnapshot {
                id: job.id,
                state: job.state,
                cancel_requested: job.cancel_requested,
            })
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.read(|state| state.is_job_running())
    }

    fn build_invocation(&self, request: &GenerateRequest) -> WorkerInvocation {
        let mut invocation = WorkerInvocation::new(&self.config.interpreter)
            .arg(self.paths.generator_script().as_str())
            .arg("--settings")
            .arg(self.paths.settings_file().as_str());

        let seed = request.static_seed.trim();
        if !seed.is_empty() {
            invocation = invocation.arg("--seed").arg(seed);
        }

        invocation
            .working_dir(self.paths.root())
            .env(CANCEL_FILE_ENV, self.paths.cancel_file().as_str())
    }

    async fn drive(
        self,
        id: JobId,
        handle: ProcessHandle,
        mut chunks: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
        outcome_tx: oneshot::Sender<JobOutcome>,
    ) {
        let mut relay = ProgressRelay::new();
        let wait = handle.wait();
        tokio::pin!(wait);

        // Chunks are polled first: every chunk is queued before the exit
        // outcome is produced, so all progress is relayed before the exit
        let exit = loop {
            tokio::select! {
                biased;
                chunk = next_chunk(&mut chunks) => match chunk {
                    Some(chunk) => self.relay_progress(relay.push_chunk(&chunk)),
                    None => chunks = None,
                },
                exit = &mut wait => break exit,
            }
        };

        if let Some(rx) = chunks.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                self.relay_progress(relay.push_chunk(&chunk));
            }
        }
        self.relay_progress(relay.finish());
        relay.close();

        let outcome = match exit {
            ExitOutcome::Killed { .. } => JobOutcome::Cancelled,
            ExitOutcome::Exited { code: Some(0), stdout, .. } => JobOutcome::Succeeded(parse_success_payload(&stdout)),
            ExitOutcome::Exited { code, stdout, stderr } => {
                let failure = classify_exit(code, &stdout, &stderr);
                if failure.is_cancellation() {
                    JobOutcome::Cancelled
                } else {
                    JobOutcome::Failed(failure)
                }
            }
        };

        self.finish(id, outcome, outcome_tx);
    }

    fn relay_progress(&self, events: Vec<ProgressEvent>) {
        for event in events {
            self.metrics.record_progress_event();
            self.state.publish(BridgeEvent::GenerateSeedProgress(event));
        }
    }

    /// Apply the single terminal transition and publish the terminal event
    fn finish(&self, id: JobId, outcome: JobOutcome, outcome_tx: oneshot::Sender<JobOutcome>) {
        let terminal = outcome.state();
        let (elapsed, _) = self.state.update_with(|state| match state.job_mut(id) {
            Some(job) if job.is_running() => {
                job.state = terminal;
                job.killer = None;
                Some(job.started_at.elapsed())
            }
            _ => None,
        });

        let Some(elapsed) = elapsed else {
            tracing::error!("Job {} reached {:?} after it was already terminal", id, terminal);
            return;
        };

        self.metrics.record_job_time(elapsed);
        self.clear_cancel_file();

        let event = match &outcome {
            JobOutcome::Succeeded(value) => {
                tracing::info!("Job {} succeeded in {:.1}s", id, elapsed.as_secs_f64());
                self.metrics.record_job_succeeded();
                BridgeEvent::GenerateSeedSuccess(value.clone())
            }
            JobOutcome::Failed(failure) => {
                tracing::error!("Job {} failed: {}", id, failure);
                self.metrics.record_job_failed();
                BridgeEvent::GenerateSeedError(failure.clone())
            }
            JobOutcome::Cancelled => {
                tracing::info!("Job {} cancelled", id);
                self.metrics.record_job_cancelled();
                BridgeEvent::GenerateSeedCancelled
            }
        };
        self.state.publish(event);

        if let JobOutcome::Failed(failure) = &outcome {
            if failure.is_missing_dependency() {
                self.state.publish(BridgeEvent::FatalError {
                    reason: failure.reason.code().to_string(),
                    message: failure.short.clone(),
                });
            }
        }

        let _ = outcome_tx.send(outcome);
    }

    fn request_cooperative_cancel(&self, id: JobId) {
        let path = self.paths.cancel_file();
        match fs::write(&path, id.to_string()) {
            Ok(()) => tracing::debug!("Wrote cancel sentinel {}", path),
            Err(e) => tracing::warn!("Failed to write cancel sentinel {}: {}", path, e),
        }
    }

    fn hard_kill(&self, id: JobId) {
        let (killer, _) = self.state.update_with(|state| match state.job_mut(id) {
            Some(job) if job.is_running() => match &job.killer {
                Some(killer) => Some(killer.clone()),
                None => {
                    job.kill_pending = true;
                    None
                }
            },
            _ => None,
        });

        if let Some(killer) = killer {
            tracing::info!("Killing worker of job {}", id);
            killer.kill();
        }
    }

    fn clear_cancel_file(&self) {
        let path = self.paths.cancel_file();
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed cancel sentinel {}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove cancel sentinel {}: {}", path, e),
        }
    }
}

async fn next_chunk(chunks: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match chunks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Result payload of a successful run: the last non-progress line as JSON if
/// it parses, otherwise the remaining text
pub fn parse_success_payload(stdout: &str) -> Value {
    let parser = ProgressParser::new();
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !parser.is_progress_line(line))
        .collect();

    if let Some(last) = lines.last() {
        if let Ok(value) = serde_json::from_str::<Value>(last) {
            return value;
        }
    }

    Value::String(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::platform::PlatformCapabilities;
    use crate::services::settings_store::MockSettingsWriter;
    use camino::Utf8PathBuf;
    use serde_json::json;
    use tempfile::TempDir;

    fn request() -> GenerateRequest {
        let mut settings = Map::new();
        settings.insert("world_count".to_string(), json!(1));
        GenerateRequest {
            settings_file: settings,
            static_seed: String::new(),
        }
    }

    fn controller(dir: &TempDir, config: JobConfig, writer: MockSettingsWriter) -> JobController {
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        JobController::new(
            StateManager::new(),
            ProcessSupervisor::new(PlatformCapabilities::detect()),
            Arc::new(writer),
            SourcePaths::new(root, "generate.sh", "settings_to_json.sh"),
            config,
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_request_from_payload() {
        let payload = json!({ "settingsFile": { "seed": "x" }, "staticSeed": "ABC" });
        let request = GenerateRequest::from_payload(&payload).unwrap();
        assert_eq!(request.static_seed, "ABC");

        let no_seed = json!({ "settingsFile": { "seed": "x" }, "staticSeed": null });
        assert_eq!(GenerateRequest::from_payload(&no_seed).unwrap().static_seed, "");

        assert!(GenerateRequest::from_payload(&json!({ "settingsFile": "nope" })).is_none());
    }

    #[test]
    fn test_success_payload_parsing() {
        assert_eq!(
            parse_success_payload("PROGRESS 10\nWorking\n{\"output\": \"seed.zpf\"}\n"),
            json!({ "output": "seed.zpf" })
        );
        assert_eq!(
            parse_success_payload("PROGRESS 99 Almost\nCreated seed ABC\n"),
            json!("Created seed ABC")
        );
        assert_eq!(parse_success_payload(""), json!(""));
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_job_after_persisting() {
        let dir = TempDir::new().unwrap();
        let mut writer = MockSettingsWriter::new();
        writer
            .expect_save_settings()
            .withf(|settings| settings.get("world_count") == Some(&json!(1)))
            .times(1)
            .returning(|_| Ok(()));

        let controller = controller(&dir, JobConfig::new("/definitely/not/an/interpreter"), writer);
        let ticket = controller.start_job(request()).unwrap();

        match ticket.wait().await {
            JobOutcome::Failed(failure) => {
                assert_eq!(failure.reason, crate::services::failure::FailureReason::SpawnFailed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(controller.status().unwrap().state, JobState::Failed);
        assert!(!controller.cancel_active_job());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_start_is_rejected_without_persisting() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("generate.sh"), "sleep 30\n").unwrap();

        let mut writer = MockSettingsWriter::new();
        writer.expect_save_settings().times(1).returning(|_| Ok(()));

        let config = JobConfig {
            cancel_grace: Duration::from_millis(100),
            ..JobConfig::new("sh")
        };
        let controller = controller(&dir, config, writer);
        let first = controller.start_job(request()).unwrap();

        assert_eq!(
            controller.start_job(request()).unwrap_err(),
            JobError::AlreadyRunning(first.id)
        );

        assert!(controller.cancel_active_job());
        assert_eq!(first.wait().await, JobOutcome::Cancelled);
    }
}
