// Application context - the services shared by every request handler

use crate::metrics::Metrics;
use crate::services::{
    JobConfig, JobController, PlatformCapabilities, ProcessSupervisor, SettingsConverter, SettingsStore, SourcePaths,
};
use crate::state::{BridgeEvent, StateManager};
use crate::ui::desktop::{DesktopShell, HeadlessWindow, WindowControl};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Delay between announcing a fatal error and shutting down, so the UI can
/// render the error first
pub const FATAL_EXIT_DELAY: Duration = Duration::from_millis(500);

/// Everything needed to build an [`AppContext`]
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub paths: SourcePaths,
    pub interpreter: String,
    pub capabilities: PlatformCapabilities,
    pub cancel_grace: Duration,
    pub cooperative_cancel: bool,
    pub drain_grace: Duration,
}

impl ContextOptions {
    pub fn new(paths: SourcePaths, interpreter: impl Into<String>) -> Self {
        Self {
            paths,
            interpreter: interpreter.into(),
            capabilities: PlatformCapabilities::detect(),
            cancel_grace: crate::services::job::DEFAULT_CANCEL_GRACE,
            cooperative_cancel: true,
            drain_grace: crate::services::supervisor::DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Shared services handed to every request handler
pub struct AppContext {
    pub state: StateManager,
    pub jobs: JobController,
    pub converter: SettingsConverter,
    pub store: Arc<SettingsStore>,
    pub desktop: Arc<dyn DesktopShell>,
    pub window: Arc<dyn WindowControl>,
    pub metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl AppContext {
    pub fn new(options: ContextOptions, desktop: Arc<dyn DesktopShell>) -> Arc<Self> {
        let state = StateManager::new();
        state.set_interpreter(options.interpreter.clone());

        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, _) = watch::channel(false);
        let supervisor = ProcessSupervisor::new(options.capabilities).with_drain_grace(options.drain_grace);
        let store = Arc::new(SettingsStore::new(options.paths.clone()));

        let jobs = JobController::new(
            state.clone(),
            supervisor.clone(),
            store.clone(),
            options.paths.clone(),
            JobConfig {
                interpreter: options.interpreter.clone(),
                cancel_grace: options.cancel_grace,
                cooperative_cancel: options.cooperative_cancel,
            },
            Arc::clone(&metrics),
        );
        let converter = SettingsConverter::new(supervisor, store.clone(), options.paths, options.interpreter);
        let window = Arc::new(HeadlessWindow::new(state.clone(), shutdown_tx.clone()));

        Arc::new(Self {
            state,
            jobs,
            converter,
            store,
            desktop,
            window,
            metrics,
            shutdown_tx,
        })
    }

    pub fn paths(&self) -> &SourcePaths {
        self.store.paths()
    }

    /// Resolves to `true` once shutdown has been requested
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Announce an unrecoverable error; the fatal watcher shuts the bridge down
    pub fn fatal(&self, reason: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("Fatal error ({}): {}", reason, message);
        self.state.publish(BridgeEvent::FatalError {
            reason: reason.to_string(),
            message,
        });
    }

    /// Watch the push channel for fatal errors, whoever raised them, and shut
    /// down [`FATAL_EXIT_DELAY`] after the first one
    pub fn watch_fatal_errors(self: &Arc<Self>) -> JoinHandle<()> {
        let context = Arc::clone(self);
        let mut events = self.state.subscribe_lossless();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let BridgeEvent::FatalError { reason, .. } = event {
                    context.state.mark_fatal(reason);
                    tokio::time::sleep(FATAL_EXIT_DELAY).await;
                    context.request_shutdown();
                    break;
                }
            }
        })
    }
}
