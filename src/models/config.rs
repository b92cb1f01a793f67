use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bridge configuration from `bridge.yaml`
///
/// Every field has a default, so a partial (or missing) file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

/// How the worker is located, started and stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter used verbatim, skipping resolution
    pub interpreter: Option<String>,

    /// Root of the worker source tree
    pub source_dir: Utf8PathBuf,

    pub generator_script: String,
    pub settings_to_json_script: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Grace between the cooperative cancel request and the hard kill
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Write the cancel sentinel before killing
    pub cooperative_cancel: bool,

    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl WorkerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Interpreter override, ignoring blank values
    pub fn explicit_interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref().filter(|i| !i.trim().is_empty())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            source_dir: Utf8PathBuf::from("."),
            generator_script: "OoTRandomizer.py".to_string(),
            settings_to_json_script: "SettingsToJson.py".to_string(),
            probe_timeout_ms: default_probe_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            cooperative_cancel: true,
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Utf8PathBuf,
    pub prefix: String,
    pub debug: bool,

    /// Mirror log output to stderr
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: Utf8PathBuf::from("logs"),
            prefix: "ootr-bridge".to_string(),
            debug: false,
            console: true,
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_cancel_grace_ms() -> u64 {
    5000
}

fn default_drain_grace_ms() -> u64 {
    2000
}
