// Desktop integration - clipboard, native dialogs, path opening and window control
//
// Handlers only talk to these traits, so tests can swap in recording fakes and
// the bridge never needs a display to run.

use crate::state::StateManager;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;

/// Errors raised by desktop integrations
#[derive(Error, Debug)]
pub enum DesktopError {
    #[error("Clipboard unavailable: {0}")]
    Clipboard(String),

    #[error("Failed to open {path}: {message}")]
    Open { path: Utf8PathBuf, message: String },

    #[error("Desktop task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One file type filter of a file dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub name: String,
    pub extensions: Vec<String>,
}

impl FileFilter {
    /// Parse the `fileTypes` request field.
    ///
    /// Accepts the list form `[{"name": "ROM", "extensions": ["z64", "n64"]}]`
    /// as well as the map form `{"ROM": ["z64", "n64"]}`. Malformed entries
    /// are skipped.
    pub fn parse_list(file_types: &Value) -> Vec<FileFilter> {
        match file_types {
            Value::Array(entries) => entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?;
                    Some(FileFilter {
                        name: name.to_string(),
                        extensions: string_list(entry.get("extensions")?),
                    })
                })
                .collect(),
            Value::Object(map) => map
                .iter()
                .map(|(name, extensions)| FileFilter {
                    name: name.clone(),
                    extensions: string_list(extensions),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Clipboard, dialogs and the OS path opener
#[async_trait]
pub trait DesktopShell: Send + Sync {
    async fn copy_to_clipboard(&self, text: String) -> Result<(), DesktopError>;

    /// `None` when the user cancelled the dialog
    async fn browse_for_file(&self, filters: Vec<FileFilter>) -> Option<Vec<Utf8PathBuf>>;

    async fn browse_for_directory(&self) -> Option<Vec<Utf8PathBuf>>;

    async fn open_path(&self, path: &Utf8Path) -> Result<(), DesktopError>;
}

/// Window operations requested by the UI
pub trait WindowControl: Send + Sync {
    fn minimize(&self);

    /// Maximize, or restore when already maximized
    fn toggle_maximize(&self);

    fn is_maximized(&self) -> bool;

    fn close(&self);
}

/// Native desktop integration using `arboard` and `rfd`
#[derive(Debug, Clone, Default)]
pub struct NativeDesktop;

impl NativeDesktop {
    pub fn new() -> Self {
        Self
    }

    fn opener() -> &'static str {
        if cfg!(windows) {
            "explorer"
        } else if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        }
    }
}

#[async_trait]
impl DesktopShell for NativeDesktop {
    async fn copy_to_clipboard(&self, text: String) -> Result<(), DesktopError> {
        tokio::task::spawn_blocking(move || {
            let mut clipboard = arboard::Clipboard::new().map_err(|e| DesktopError::Clipboard(e.to_string()))?;
            clipboard
                .set_text(text)
                .map_err(|e| DesktopError::Clipboard(e.to_string()))
        })
        .await?
    }

    async fn browse_for_file(&self, filters: Vec<FileFilter>) -> Option<Vec<Utf8PathBuf>> {
        let picked = tokio::task::spawn_blocking(move || {
            let mut dialog = rfd::FileDialog::new();
            for filter in &filters {
                dialog = dialog.add_filter(filter.name.as_str(), filter.extensions.as_slice());
            }
            dialog.pick_files()
        })
        .await;

        utf8_paths(picked.ok().flatten()?)
    }

    async fn browse_for_directory(&self) -> Option<Vec<Utf8PathBuf>> {
        let picked = tokio::task::spawn_blocking(|| rfd::FileDialog::new().pick_folder()).await;
        utf8_paths(vec![picked.ok().flatten()?])
    }

    async fn open_path(&self, path: &Utf8Path) -> Result<(), DesktopError> {
        let output = Command::new(Self::opener())
            .arg(path.as_str())
            .output()
            .await
            .map_err(|e| DesktopError::Open {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        // explorer.exe reports a non-zero status even on success
        if output.status.success() || cfg!(windows) {
            Ok(())
        } else {
            Err(DesktopError::Open {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn utf8_paths(paths: Vec<std::path::PathBuf>) -> Option<Vec<Utf8PathBuf>> {
    let converted: Vec<Utf8PathBuf> = paths
        .into_iter()
        .filter_map(|path| {
            Utf8PathBuf::try_from(path)
                .map_err(|e| {
                    tracing::error!("Failed to convert path to UTF-8: {}", e);
                    e
                })
                .ok()
        })
        .collect();

    if converted.is_empty() { None } else { Some(converted) }
}

/// Window state kept in the bridge for a UI host that renders the window itself.
///
/// Maximize changes are broadcast (`window-maximized`), and closing the window
/// shuts the bridge down.
#[derive(Debug)]
pub struct HeadlessWindow {
    state: StateManager,
    shutdown_tx: watch::Sender<bool>,
}

impl HeadlessWindow {
    pub fn new(state: StateManager, shutdown_tx: watch::Sender<bool>) -> Self {
        Self { state, shutdown_tx }
    }
}

impl WindowControl for HeadlessWindow {
    fn minimize(&self) {
        self.state.set_window_minimized(true);
    }

    fn toggle_maximize(&self) {
        let maximized = self.state.read(|state| state.window_maximized);
        self.state.set_window_maximized(!maximized);
    }

    fn is_maximized(&self) -> bool {
        self.state.read(|state| state.window_maximized)
    }

    fn close(&self) {
        tracing::info!("Window close requested, shutting down");
        self.shutdown_tx.send_replace(true);
    }
}
