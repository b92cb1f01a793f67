use crate::services::platform::PlatformCapabilities;
use crate::services::supervisor::{ExitOutcome, ProcessSupervisor, SupervisorError, WorkerInvocation};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// How long a version probe may run before its process tree is killed
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Semantic version as reported by `<interpreter> --version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpreterVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

/// Which command will run the worker, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Supplied by configuration or the command line; used verbatim
    Explicit { command: String },

    /// The platform default, with the probed version when one was probed
    Default {
        command: String,
        version: Option<InterpreterVersion>,
    },

    /// The default candidate is too old; a launcher that selects a newer
    /// interpreter is used instead
    AlternateLauncher {
        command: String,
        found: InterpreterVersion,
    },

    /// The candidate answered without a recognisable version
    Unversioned,
}

impl Resolution {
    /// Command to run, `None` when the caller has to fall back
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Explicit { command } | Self::Default { command, .. } | Self::AlternateLauncher { command, .. } => {
                Some(command)
            }
            Self::Unversioned => None,
        }
    }
}

/// Errors raised while probing an interpreter
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Could not start interpreter `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: SupervisorError,
    },

    #[error("Interpreter `{command}` failed its version probe (exit code {code:?}): {output}")]
    ProbeFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Interpreter `{command}` did not answer within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Tunables for the version probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Candidate probed on the primary platform
    pub candidate: String,

    /// Arguments that make the candidate print its version
    pub version_args: Vec<String>,

    pub timeout: Duration,

    /// Oldest supported `(major, minor)`; the major version must match exactly
    pub min_supported: (u64, u64),
}

impl ResolverConfig {
    pub fn for_platform(capabilities: &PlatformCapabilities) -> Self {
        Self {
            candidate: capabilities.probe_candidate().to_string(),
            version_args: vec!["--version".to_string()],
            timeout: DEFAULT_PROBE_TIMEOUT,
            min_supported: (3, 11),
        }
    }
}

/// Determines the interpreter command used to run the worker
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    supervisor: ProcessSupervisor,
    config: ResolverConfig,
    version_pattern: Regex,
}

impl ExecutableResolver {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        let config = ResolverConfig::for_platform(supervisor.capabilities());
        Self::with_config(supervisor, config)
    }

    pub fn with_config(supervisor: ProcessSupervisor, config: ResolverConfig) -> Self {
        Self {
            supervisor,
            config,
            version_pattern: Regex::new(
                r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-((?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*)(?:\.(?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*))*))?(?:\+([0-9a-zA-Z-]+(?:\.[0-9a-zA-Z-]+)*))?$",
            )
            .expect("Invalid semver regex"),
        }
    }

    /// Resolve the interpreter command.
    ///
    /// # Arguments
    /// * `explicit` - Interpreter given by configuration or the command line
    ///
    /// # Returns
    /// The resolution; [`Resolution::Unversioned`] asks the caller to fall back
    /// to [`PlatformCapabilities::fallback_interpreter`].
    pub async fn resolve(&self, explicit: Option<&str>) -> Result<Resolution, ResolveError> {
        if let Some(command) = explicit.filter(|c| !c.trim().is_empty()) {
            tracing::info!("Using interpreter from configuration: {}", command);
            return Ok(Resolution::Explicit {
                command: command.to_string(),
            });
        }

        let capabilities = self.supervisor.capabilities();
        if capabilities.has_named_default_interpreter {
            return Ok(Resolution::Default {
                command: capabilities.named_default_interpreter().to_string(),
                version: None,
            });
        }

        let candidate = self.config.candidate.clone();
        let resolution = match self.probe(&candidate).await? {
            None => {
                tracing::warn!("`{}` reported no recognisable version", candidate);
                Resolution::Unversioned
            }
            Some(found) if !self.is_supported(&found) => {
                tracing::info!(
                    "`{}` is version {}, switching to `{}`",
                    candidate,
                    found,
                    capabilities.alternate_launcher()
                );
                Resolution::AlternateLauncher {
                    command: capabilities.alternate_launcher().to_string(),
                    found,
                }
            }
            Some(version) => {
                tracing::info!("Using `{}` version {}", candidate, version);
                Resolution::Default {
                    command: candidate,
                    version: Some(version),
                }
            }
        };

        Ok(resolution)
    }

    /// Confirm that `command` can be started and answers its version probe
    pub async fn verify(&self, command: &str) -> Result<Option<InterpreterVersion>, ResolveError> {
        let version = self.probe(command).await?;
        match &version {
            Some(version) => tracing::info!("Interpreter `{}` confirmed working ({})", command, version),
            None => tracing::info!("Interpreter `{}` confirmed working", command),
        }
        Ok(version)
    }

    pub fn is_supported(&self, version: &InterpreterVersion) -> bool {
        let (major, minor) = self.config.min_supported;
        version.major == major && version.minor >= minor
    }

    /// Extract a version from probe output such as `Python 3.12.1`
    pub fn parse_version(&self, output: &str) -> Option<InterpreterVersion> {
        output.lines().find_map(|line| {
            let lowered = line.to_ascii_lowercase();
            let rest = match lowered.find("python") {
                Some(idx) => &line[idx + "python".len()..],
                None => line,
            };
            let caps = self.version_pattern.captures(rest.trim())?;

            Some(InterpreterVersion {
                major: caps.get(1)?.as_str().parse().ok()?,
                minor: caps.get(2)?.as_str().parse().ok()?,
                patch: caps.get(3)?.as_str().parse().ok()?,
                prerelease: caps.get(4).map(|m| m.as_str().to_string()),
                build: caps.get(5).map(|m| m.as_str().to_string()),
            })
        })
    }

    async fn probe(&self, command: &str) -> Result<Option<InterpreterVersion>, ResolveError> {
        let invocation = WorkerInvocation::new(command).args(self.config.version_args.iter().cloned());
        let handle = self
            .supervisor
            .spawn(&invocation)
            .map_err(|source| ResolveError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let killer = handle.killer();
        let wait = handle.wait();
        tokio::pin!(wait);

        let outcome = match timeout(self.config.timeout, &mut wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("Version probe of `{}` timed out, killing it", command);
                killer.kill();
                // Reaped and drained before reporting
                let _ = wait.await;
                return Err(ResolveError::Timeout {
                    command: command.to_string(),
                    timeout: self.config.timeout,
                });
            }
        };

        let output = outcome.combined_output();
        if let Some(version) = self.parse_version(&output) {
            return Ok(Some(version));
        }

        match outcome {
            ExitOutcome::Exited { code: Some(0), .. } => Ok(None),
            ExitOutcome::Exited { code, .. } => Err(ResolveError::ProbeFailed {
                command: command.to_string(),
                code,
                output: output.trim().to_string(),
            }),
            ExitOutcome::Killed { .. } => Err(ResolveError::Timeout {
                command: command.to_string(),
                timeout: self.config.timeout,
            }),
        }
    }
}
