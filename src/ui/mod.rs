// UI module - everything facing the UI host process
//
// This module contains:
// - Bridge: JSON-lines transport carrying requests, replies and push events
// - MessageRouter: request validation and dispatch
// - controller: the handler behind every request name
// - desktop: clipboard, dialogs, path opening and window control

pub mod bridge;
pub mod controller;
pub mod desktop;
pub mod router;

pub use bridge::{Bridge, Outbound};
pub use controller::register_handlers;
pub use desktop::{DesktopShell, FileFilter, HeadlessWindow, NativeDesktop, WindowControl};
pub use router::{MessageRouter, PayloadContract, Reply, RequestEnvelope, RequestKind, ValidationError};
