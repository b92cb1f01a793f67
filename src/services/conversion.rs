use crate::services::failure::{FailureReason, WorkerFailure, classify_exit};
use crate::services::settings_store::{SettingsWriter, SourcePaths};
use crate::services::supervisor::{ExitOutcome, ProcessSupervisor, WorkerInvocation};
use serde_json::{Map, Value};
use std::sync::Arc;

/// The one-shot worker conversions offered to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionKind {
    SettingsToString,
    StringToSettings,
    UpdateDynamicSetting,
}

impl ConversionKind {
    pub fn success_event(self) -> &'static str {
        match self {
            Self::SettingsToString => "convertSettingsToStringSuccess",
            Self::StringToSettings => "convertStringToSettingsSuccess",
            Self::UpdateDynamicSetting => "updateDynamicSettingSuccess",
        }
    }

    pub fn error_event(self) -> &'static str {
        match self {
            Self::SettingsToString => "convertSettingsToStringError",
            Self::StringToSettings => "convertStringToSettingsError",
            Self::UpdateDynamicSetting => "updateDynamicSettingError",
        }
    }
}

/// Runs settings conversions through the worker.
///
/// These runs are independent of the generation job slot: they are short,
/// never cancelled and may overlap a running job.
#[derive(Clone)]
pub struct SettingsConverter {
    supervisor: ProcessSupervisor,
    writer: Arc<dyn SettingsWriter>,
    paths: SourcePaths,
    interpreter: String,
}

impl SettingsConverter {
    pub fn new(
        supervisor: ProcessSupervisor,
        writer: Arc<dyn SettingsWriter>,
        paths: SourcePaths,
        interpreter: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            writer,
            paths,
            interpreter: interpreter.into(),
        }
    }

    /// Dispatch a conversion with an already validated payload
    pub async fn convert(&self, kind: ConversionKind, payload: &Value) -> Result<Value, WorkerFailure> {
        match (kind, payload) {
            (ConversionKind::SettingsToString, Value::Object(settings)) => self.settings_to_string(settings).await,
            (ConversionKind::StringToSettings, Value::String(text)) => self.string_to_settings(text).await,
            (ConversionKind::UpdateDynamicSetting, Value::String(text)) => self.update_dynamic_setting(text).await,
            _ => Err(WorkerFailure::invalid_output(
                "Unexpected payload for conversion",
                payload.to_string(),
            )),
        }
    }

    /// Persist `settings` and ask the generator for the matching settings string
    pub async fn settings_to_string(&self, settings: &Map<String, Value>) -> Result<Value, WorkerFailure> {
        if let Err(e) = self.writer.save_settings(settings) {
            tracing::warn!("Failed to persist settings before conversion: {}", e);
        }

        let stdout = self
            .run(
                self.invocation(self.paths.generator_script().as_str())
                    .arg("--convert_settings")
                    .arg("--settings")
                    .arg(self.paths.settings_file().as_str()),
            )
            .await?;

        match last_line(&stdout) {
            Some(line) => Ok(Value::String(line.to_string())),
            None => Err(WorkerFailure::invalid_output("Worker printed no settings string", stdout)),
        }
    }

    /// Expand a settings string into the full settings object
    pub async fn string_to_settings(&self, settings_string: &str) -> Result<Value, WorkerFailure> {
        let stdout = self
            .run(
                self.invocation(self.paths.generator_script().as_str())
                    .arg("--convert_settings")
                    .arg("--settings_string")
                    .arg(settings_string),
            )
            .await?;

        parse_json_output(&stdout)
    }

    /// Ask the settings exporter for the current value of a dynamic setting
    pub async fn update_dynamic_setting(&self, setting: &str) -> Result<Value, WorkerFailure> {
        let stdout = self
            .run(
                self.invocation(self.paths.settings_to_json_script().as_str())
                    .arg("--dynamic_setting")
                    .arg(setting),
            )
            .await?;

        parse_json_output(&stdout)
    }

    fn invocation(&self, script: &str) -> WorkerInvocation {
        WorkerInvocation::new(&self.interpreter)
            .arg(script)
            .working_dir(self.paths.root())
    }

    async fn run(&self, invocation: WorkerInvocation) -> Result<String, WorkerFailure> {
        let outcome = self
            .supervisor
            .run(&invocation)
            .await
            .map_err(WorkerFailure::spawn_failed)?;

        match outcome {
            ExitOutcome::Exited { code: Some(0), stdout, .. } => Ok(stdout),
            ExitOutcome::Exited { code, stdout, stderr } => {
                let failure = classify_exit(code, &stdout, &stderr);
                tracing::warn!("Conversion failed: {}", failure);
                Err(failure)
            }
            ExitOutcome::Killed { stdout, stderr } => Err(WorkerFailure::new(
                FailureReason::WorkerFailed,
                "Conversion worker was killed",
                format!("{}{}", stdout, stderr),
            )),
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

/// Whole output as JSON, falling back to the last line for chatty workers
fn parse_json_output(stdout: &str) -> Result<Value, WorkerFailure> {
    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) {
        return Ok(value);
    }

    last_line(stdout)
        .and_then(|line| serde_json::from_str::<Value>(line).ok())
        .ok_or_else(|| WorkerFailure::invalid_output("Worker output is not valid JSON", stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names() {
        assert_eq!(ConversionKind::SettingsToString.success_event(), "convertSettingsToStringSuccess");
        assert_eq!(ConversionKind::StringToSettings.error_event(), "convertStringToSettingsError");
        assert_eq!(ConversionKind::UpdateDynamicSetting.success_event(), "updateDynamicSettingSuccess");
    }

    #[test]
    fn test_parse_json_output() {
        assert_eq!(parse_json_output("{\"a\": 1}\n").unwrap(), json!({ "a": 1 }));
        assert_eq!(parse_json_output("Loading\n{\"a\": 2}\n").unwrap(), json!({ "a": 2 }));

        let failure = parse_json_output("Traceback\n").unwrap_err();
        assert_eq!(failure.reason, FailureReason::InvalidOutput);
        assert_eq!(failure.long, "Traceback\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_string_to_settings_through_worker() {
        use crate::services::platform::PlatformCapabilities;
        use crate::services::settings_store::MockSettingsWriter;
        use camino::Utf8PathBuf;

        let dir = tempfile::TempDir::new().unwrap();
        // Echo the settings string back inside a JSON object
        std::fs::write(
            dir.path().join("generate.sh"),
            "printf '{\"settings_string\": \"%s\"}\\n' \"$3\"\n",
        )
        .unwrap();

        let converter = SettingsConverter::new(
            ProcessSupervisor::new(PlatformCapabilities::detect()),
            Arc::new(MockSettingsWriter::new()),
            SourcePaths::new(
                Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap(),
                "generate.sh",
                "settings_to_json.sh",
            ),
            "sh",
        );

        let value = converter
            .convert(ConversionKind::StringToSettings, &json!("BSAWFNCAAJB"))
            .await
            .unwrap();

        assert_eq!(value, json!({ "settings_string": "BSAWFNCAAJB" }));
    }
}
