//! Services module - worker orchestration without any UI concerns.
//!
//! Everything here is usable from tests and from the binary alike; nothing
//! depends on the transport or on a desktop environment.
//!
//! # Components
//!
//! - [`ExecutableResolver`]: picks the interpreter command, probing its version
//!   where the platform has no universally-named interpreter
//! - [`ProcessSupervisor`]: spawns workers, streams stdout, kills whole process trees
//! - [`JobController`]: the single generation job, its cancellation and its
//!   terminal events
//! - [`ProgressRelay`]: turns worker stdout into ordered [`ProgressEvent`]s
//! - [`SettingsConverter`]: one-shot settings conversions through the worker
//! - [`SettingsStore`]: settings, presets and version files under the source root
//! - [`failure`]: classification of failed runs into [`WorkerFailure`]s
//! - [`PlatformCapabilities`]: platform facts, detected once
//!
//! # Worker protocol
//!
//! 1. Progress is reported on stdout as `PROGRESS <pct>[%] [message]` lines
//! 2. The result is the last other stdout line, JSON when it parses
//! 3. A failure may be declared as `FAILURE <code>[: message]`
//! 4. Cancellation is requested by creating the file named in `OOTR_CANCEL_FILE`;
//!    a cooperating worker then exits with `FAILURE user_cancelled`

pub mod conversion;
pub mod failure;
pub mod job;
pub mod line_buffer;
pub mod platform;
pub mod progress;
pub mod resolver;
pub mod settings_store;
pub mod supervisor;

pub use conversion::{ConversionKind, SettingsConverter};
pub use failure::{FailureReason, WorkerFailure, classify_exit};
pub use job::{GenerateRequest, JobConfig, JobController, JobError, JobOutcome, JobSnapshot, JobTicket};
pub use platform::PlatformCapabilities;
pub use progress::{ProgressEvent, ProgressParser, ProgressRelay};
pub use resolver::{ExecutableResolver, InterpreterVersion, Resolution, ResolveError, ResolverConfig};
pub use settings_store::{SettingsStore, SettingsWriter, SourcePaths, SourceVersion, StoreError};
pub use supervisor::{ExitOutcome, ProcessHandle, ProcessKiller, ProcessSupervisor, SupervisorError, WorkerInvocation};
