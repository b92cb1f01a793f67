// ootr-bridge - process orchestration and IPC bridge for the OoT Randomizer GUI
//
// This is the library crate containing the worker orchestration, the message
// router and the transport. The binary crate (main.rs) wires them to stdio.

pub mod config;
pub mod context;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod ui;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use context::{AppContext, ContextOptions};
pub use metrics::Metrics;
pub use models::{AppState, BridgeConfig};
pub use state::{BridgeEvent, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
