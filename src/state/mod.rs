// State management module
//
// This module provides the StateManager which wraps AppState with thread-safe access
// using Arc<RwLock<T>> and broadcasts every change and push event to subscribers.
// Subscribers that must see every event (the UI transport, the fatal watcher)
// take an unbounded lossless stream instead of a broadcast receiver.

use crate::models::{AppState, JobId, JobState};
use crate::services::conversion::ConversionKind;
use crate::services::failure::WorkerFailure;
use crate::services::progress::ProgressEvent;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};

/// Capacity of the broadcast channel; a broadcast subscriber that falls
/// further behind loses the oldest events. Lossless subscribers are unbounded.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted on the push channel
///
/// Some are derived from state diffs (job state, window flags), the rest are
/// published explicitly by the component that produced them.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    /// The tracked job changed state
    JobStateChanged { job_id: JobId, state: JobState },

    GenerateSeedProgress(ProgressEvent),
    GenerateSeedSuccess(Value),
    GenerateSeedError(WorkerFailure),
    GenerateSeedCancelled,

    ConversionSucceeded { kind: ConversionKind, value: Value },
    ConversionFailed { kind: ConversionKind, failure: WorkerFailure },

    WindowMaximized(bool),
    WindowMinimized(bool),

    /// Result of opening a freshly created path; empty on success
    CreateAndOpenPathResult(String),

    /// The bridge cannot continue and is about to exit
    FatalError { reason: String, message: String },
}

impl BridgeEvent {
    /// Event name on the UI transport, `None` for internal events
    pub fn wire_name(&self) -> Option<&'static str> {
        match self {
            Self::JobStateChanged { .. } | Self::WindowMinimized(_) => None,
            Self::GenerateSeedProgress(_) => Some("generateSeedProgress"),
            Self::GenerateSeedSuccess(_) => Some("generateSeedSuccess"),
            Self::GenerateSeedError(_) => Some("generateSeedError"),
            Self::GenerateSeedCancelled => Some("generateSeedCancelled"),
            Self::ConversionSucceeded { kind, .. } => Some(kind.success_event()),
            Self::ConversionFailed { kind, .. } => Some(kind.error_event()),
            Self::WindowMaximized(_) => Some("window-maximized"),
            Self::CreateAndOpenPathResult(_) => Some("createAndOpenPathResult"),
            Self::FatalError { .. } => Some("fatalError"),
        }
    }

    /// Payload sent with the event on the UI transport
    pub fn payload(&self) -> Value {
        match self {
            Self::JobStateChanged { job_id, state } => json!({ "jobId": job_id, "state": state }),
            Self::GenerateSeedProgress(progress) => json!(progress),
            Self::GenerateSeedSuccess(value) | Self::ConversionSucceeded { value, .. } => value.clone(),
            Self::GenerateSeedError(failure) | Self::ConversionFailed { failure, .. } => json!(failure),
            Self::GenerateSeedCancelled => Value::Null,
            Self::WindowMaximized(maximized) | Self::WindowMinimized(maximized) => Value::Bool(*maximized),
            Self::CreateAndOpenPathResult(message) => Value::String(message.clone()),
            Self::FatalError { reason, message } => json!({ "reason": reason, "message": message }),
        }
    }

    /// Ends a job from the UI's point of view
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            Self::GenerateSeedSuccess(_) | Self::GenerateSeedError(_) | Self::GenerateSeedCancelled
        )
    }
}

/// Thread-safe state manager with event emission
///
/// - Provides thread-safe access to [`AppState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`BridgeEvent`]s
/// - Carries explicitly published push events on the same channels, so
///   subscribers see one ordered stream
/// - Offers lossless subscriptions for consumers that must not miss events
///
/// Cloning is cheap; clones share the state and the channel.
///
/// # Related Types
///
/// - [`crate::services::job::JobController`]: the only writer of the job slot
/// - [`crate::ui::bridge`]: forwards events with a wire name to the UI
#[derive(Clone, Debug)]
pub struct StateManager {
    state: Arc<RwLock<AppState>>,
    state_tx: broadcast::Sender<BridgeEvent>,
    sinks: Arc<Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>>,
}

impl StateManager {
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(AppState::default())),
            state_tx,
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get a read-only snapshot of the current state
    ///
    /// This clones the entire state, so it's safe to use without holding locks.
    pub fn snapshot(&self) -> AppState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let running = state_manager.read(|state| state.is_job_running());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AppState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// # Arguments
    /// * `update_fn` - A function that mutates the state
    ///
    /// # Returns
    /// The events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<BridgeEvent>
    where
        F: FnOnce(&mut AppState),
    {
        self.update_with(update_fn).1
    }

    /// Like [`update`](Self::update), but hands back the closure's result.
    ///
    /// The check and the mutation happen under one write lock, which is what
    /// makes check-then-set transitions (such as accepting a job) atomic.
    pub fn update_with<F, R>(&self, update_fn: F) -> (R, Vec<BridgeEvent>)
    where
        F: FnOnce(&mut AppState) -> R,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_state = state.clone();

        let result = update_fn(&mut state);

        let changes = detect_changes(&old_state, &state);
        for change in &changes {
            // It's OK if no one is listening
            self.emit(change.clone());
        }

        (result, changes)
    }

    /// Publish an event that is not derived from a state diff
    ///
    /// # Returns
    /// Whether at least one subscriber received it
    pub fn publish(&self, event: BridgeEvent) -> bool {
        tracing::trace!("Publishing {:?}", event.wire_name());
        self.emit(event)
    }

    /// Subscribe to all future events
    ///
    /// A receiver that falls more than [`EVENT_CHANNEL_CAPACITY`] events
    /// behind skips the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.state_tx.subscribe()
    }

    /// Subscribe to all future events without ever skipping one
    ///
    /// The stream is unbounded, so a slow consumer holds events in memory
    /// instead of losing them. Dropping the receiver ends the subscription.
    pub fn subscribe_lossless(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (sink, events) = mpsc::unbounded_channel();
        self.lock_sinks().push(sink);
        events
    }

    /// Send to every subscriber; the sink lock keeps all streams in one order
    fn emit(&self, event: BridgeEvent) -> bool {
        let mut sinks = self.lock_sinks();
        sinks.retain(|sink| !sink.is_closed());

        let mut delivered = false;
        for sink in sinks.iter() {
            delivered |= sink.send(event.clone()).is_ok();
        }
        self.state_tx.send(event).is_ok() || delivered
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<BridgeEvent>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_window_maximized(&self, maximized: bool) -> Vec<BridgeEvent> {
        self.update(|state| {
            state.window_maximized = maximized;
            if maximized {
                state.window_minimized = false;
            }
        })
    }

    pub fn set_window_minimized(&self, minimized: bool) -> Vec<BridgeEvent> {
        self.update(|state| state.window_minimized = minimized)
    }

    pub fn set_interpreter(&self, interpreter: impl Into<String>) -> Vec<BridgeEvent> {
        let interpreter = interpreter.into();
        self.update(|state| state.interpreter = Some(interpreter))
    }

    pub fn mark_fatal(&self, reason: impl Into<String>) -> Vec<BridgeEvent> {
        let reason = reason.into();
        self.update(|state| {
            state.fatal_error.get_or_insert(reason);
        })
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Detect what changed between two states and generate events
fn detect_changes(old: &AppState, new: &AppState) -> Vec<BridgeEvent> {
    let mut changes = Vec::new();

    let old_job = old.job.as_ref().map(|job| (job.id, job.state));
    let new_job = new.job.as_ref().map(|job| (job.id, job.state));
    if old_job != new_job {
        if let Some((job_id, state)) = new_job {
            changes.push(BridgeEvent::JobStateChanged { job_id, state });
        }
    }

    if old.window_maximized != new.window_maximized {
        changes.push(BridgeEvent::WindowMaximized(new.window_maximized));
    }

    if old.window_minimized != new.window_minimized {
        changes.push(BridgeEvent::WindowMinimized(new.window_minimized));
    }

    changes
}
