use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::LazyLock;

/// Worker-declared failure line: `FAILURE <code>[: message]`
static DECLARED_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*FAILURE\s+(?P<code>[a-z][a-z0-9_]*)(?::\s*(?P<msg>.*?))?\s*$")
        .expect("Invalid failure regex")
});

/// Python import failures that mean the interpreter environment is unusable
const MISSING_DEPENDENCY_MARKERS: [&str; 2] = ["ImportError", "ModuleNotFoundError"];

/// Machine-readable reason behind a [`WorkerFailure`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureReason {
    UserCancelled,
    MissingDependency,
    SpawnFailed,
    InvalidOutput,
    WorkerFailed,

    /// Any other code a worker declared about itself
    Declared(String),
}

impl FailureReason {
    pub fn code(&self) -> &str {
        match self {
            Self::UserCancelled => "user_cancelled",
            Self::MissingDependency => "missing_dependency",
            Self::SpawnFailed => "spawn_failed",
            Self::InvalidOutput => "invalid_output",
            Self::WorkerFailed => "worker_failed",
            Self::Declared(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "user_cancelled" => Self::UserCancelled,
            "missing_dependency" => Self::MissingDependency,
            "spawn_failed" => Self::SpawnFailed,
            "invalid_output" => Self::InvalidOutput,
            "worker_failed" => Self::WorkerFailed,
            other => Self::Declared(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// Structured failure of a worker run, as pushed to the UI.
///
/// `short` is a one-line summary (the reason code for declared and cancelled
/// failures), `long` the full diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerFailure {
    pub reason: FailureReason,
    pub short: String,
    pub long: String,
}

impl WorkerFailure {
    pub fn new(reason: FailureReason, short: impl Into<String>, long: impl Into<String>) -> Self {
        Self {
            reason,
            short: short.into(),
            long: long.into(),
        }
    }

    pub fn spawn_failed(error: impl fmt::Display) -> Self {
        let text = error.to_string();
        Self::new(FailureReason::SpawnFailed, text.clone(), text)
    }

    pub fn invalid_output(detail: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(FailureReason::InvalidOutput, detail, output)
    }

    pub fn is_cancellation(&self) -> bool {
        self.reason == FailureReason::UserCancelled
    }

    pub fn is_missing_dependency(&self) -> bool {
        self.reason == FailureReason::MissingDependency
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short, self.reason)
    }
}

/// Classify a worker that exited with a non-zero (or missing) exit code.
///
/// A declared `FAILURE` line wins, stderr before stdout; otherwise import
/// errors mean a missing dependency and everything else is a plain worker
/// failure summarised by the last non-empty stderr line.
pub fn classify_exit(code: Option<i32>, stdout: &str, stderr: &str) -> WorkerFailure {
    let long = combined(stdout, stderr);

    if let Some((code, message)) = find_declared(stderr).or_else(|| find_declared(stdout)) {
        let reason = FailureReason::from_code(&code);
        let long = match message {
            Some(message) if !message.is_empty() => message,
            _ => long,
        };
        tracing::debug!("Worker declared failure `{}`", reason);
        return WorkerFailure::new(reason, code, long);
    }

    if let Some(line) = long
        .lines()
        .find(|line| MISSING_DEPENDENCY_MARKERS.iter().any(|marker| line.contains(marker)))
    {
        return WorkerFailure::new(FailureReason::MissingDependency, line.trim(), long.clone());
    }

    let short = last_meaningful_line(stderr)
        .or_else(|| last_meaningful_line(stdout))
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("Worker exited with code {}", code),
            None => "Worker was terminated".to_string(),
        });

    WorkerFailure::new(FailureReason::WorkerFailed, short, long)
}

fn find_declared(text: &str) -> Option<(String, Option<String>)> {
    text.lines().rev().find_map(|line| {
        let caps = DECLARED_FAILURE.captures(line)?;
        Some((
            caps.name("code")?.as_str().to_string(),
            caps.name("msg").map(|m| m.as_str().to_string()),
        ))
    })
}

fn last_meaningful_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

fn combined(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, _) => stderr.trim_end().to_string(),
        (false, true) => stdout.trim_end().to_string(),
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
    }
}
