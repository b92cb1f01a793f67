//! Data models for the bridge.
//!
//! - [`AppState`]: mutable runtime state, the single job slot and window flags
//! - [`Job`] / [`JobState`]: the generation job and its lifecycle
//! - [`BridgeConfig`]: settings loaded from `bridge.yaml`
//!
//! State updates go through [`StateManager`](crate::state::StateManager) so that
//! every change is broadcast.

pub mod app_state;
pub mod config;

pub use app_state::{AppState, Job, JobId, JobState};
pub use config::{BridgeConfig, LoggingConfig, WorkerConfig};
