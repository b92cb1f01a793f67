//! ootr-bridge - process orchestration and IPC bridge for the OoT Randomizer GUI
//!
//! Main entry point. The UI host talks to this process over stdin/stdout, one
//! JSON document per line; logs go to a rotating file and, optionally, stderr.
//!
//! # Execution Flow
//!
//! 1. Parse command line flags, load `bridge.yaml` layered with `OOTR_BRIDGE__*`
//!    environment variables
//! 2. Initialize logging
//! 3. Check the worker source tree and resolve the interpreter; failures are
//!    reported to the UI as a `fatalError` event before exiting
//! 4. Build the shared context and register every request handler
//! 5. Serve requests until the UI closes the transport or a shutdown is requested
//! 6. Abort a running job, log metrics, shut down the runtime

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use ootr_bridge::context::FATAL_EXIT_DELAY;
use ootr_bridge::services::{ExecutableResolver, PlatformCapabilities, ProcessSupervisor, ResolverConfig, SourcePaths};
use ootr_bridge::ui::bridge::{Bridge, write_event};
use ootr_bridge::ui::{MessageRouter, NativeDesktop, register_handlers};
use ootr_bridge::{APP_NAME, AppContext, BridgeConfig, BridgeEvent, ConfigManager, ContextOptions, VERSION};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ootr-bridge", version, about = "Process bridge for the OoT Randomizer GUI")]
struct Cli {
    /// Interpreter used to run the worker, skipping resolution
    #[arg(short = 'p', long = "python")]
    python: Option<String>,

    /// Packaged layout: the worker sources live next to the executable
    #[arg(short, long)]
    release: bool,

    /// Directory holding bridge.yaml
    #[arg(long, default_value = "config")]
    config_dir: Utf8PathBuf,

    /// Root of the worker source tree
    #[arg(long)]
    source_dir: Option<Utf8PathBuf>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new(&cli.config_dir)?;
    let mut config = config_manager.load()?;
    apply_cli(&mut config, &cli)?;

    let _guard = ootr_bridge::logging::setup_logging_with_console(
        config.logging.dir.as_str(),
        &config.logging.prefix,
        config.logging.debug,
        config.logging.console,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);
    tracing::debug!("Configuration: {:?}", config);

    // Handlers run on one thread; dialogs and clipboard use the blocking pool
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("ootr-bridge-blocking")
        .build()?;

    let exit_code = runtime.block_on(run(config));

    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Application shutdown complete");

    exit_code
}

fn apply_cli(config: &mut BridgeConfig, cli: &Cli) -> Result<()> {
    if let Some(python) = &cli.python {
        config.worker.interpreter = Some(python.clone());
    }

    if let Some(source_dir) = &cli.source_dir {
        config.worker.source_dir = source_dir.clone();
    } else if cli.release {
        let exe = std::env::current_exe().context("Failed to locate the executable")?;
        let exe_dir = exe
            .parent()
            .context("Executable has no parent directory")?
            .to_path_buf();
        let exe_dir = Utf8PathBuf::try_from(exe_dir).context("Executable path is not valid UTF-8")?;
        config.worker.source_dir = exe_dir.join("python");
    }

    if cli.debug {
        config.logging.debug = true;
    }
    if cli.release {
        config.logging.console = false;
    }

    Ok(())
}

async fn run(config: BridgeConfig) -> Result<ExitCode> {
    let worker = &config.worker;
    let capabilities = PlatformCapabilities::detect();
    let paths = SourcePaths::new(
        worker.source_dir.clone(),
        worker.generator_script.clone(),
        worker.settings_to_json_script.clone(),
    );

    if !paths.generator_script().exists() {
        return fatal_exit(
            "source_not_found",
            format!(
                "The GUI is not placed in the correct location: {} not found",
                paths.generator_script()
            ),
        )
        .await;
    }

    let supervisor = ProcessSupervisor::new(capabilities).with_drain_grace(worker.drain_grace());
    let resolver = ExecutableResolver::with_config(
        supervisor,
        ResolverConfig {
            timeout: worker.probe_timeout(),
            ..ResolverConfig::for_platform(&capabilities)
        },
    );

    let interpreter = match resolver.resolve(worker.explicit_interpreter()).await {
        Ok(resolution) => resolution
            .command()
            .unwrap_or_else(|| capabilities.fallback_interpreter())
            .to_string(),
        Err(e) => return fatal_exit("interpreter_unavailable", e.to_string()).await,
    };

    match resolver.verify(&interpreter).await {
        Ok(Some(version)) => tracing::info!("Worker interpreter: {} ({})", interpreter, version),
        Ok(None) => tracing::info!("Worker interpreter: {}", interpreter),
        Err(e) => return fatal_exit("interpreter_unavailable", e.to_string()).await,
    }

    let context = AppContext::new(
        ContextOptions {
            paths,
            interpreter,
            capabilities,
            cancel_grace: worker.cancel_grace(),
            cooperative_cancel: worker.cooperative_cancel,
            drain_grace: worker.drain_grace(),
        },
        Arc::new(NativeDesktop::new()),
    );
    let _fatal_watcher = context.watch_fatal_errors();

    let mut router = MessageRouter::new(Arc::clone(&context), Arc::clone(&context.metrics));
    register_handlers(&mut router);

    let bridge = Bridge::new(Arc::new(router), &context.state, Arc::clone(&context.metrics));
    bridge
        .run(tokio::io::stdin(), tokio::io::stdout(), context.shutdown_signal())
        .await
        .context("Transport failed")?;

    if context.jobs.abort_active_job() {
        tracing::warn!("Bridge stopped while a job was running, killing its worker");
        let reaped = tokio::time::timeout(Duration::from_secs(2), async {
            while context.jobs.is_running() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if reaped.is_err() {
            tracing::warn!("Worker did not exit in time");
        }
    }

    context.metrics.log_summary();

    let fatal = context.state.read(|state| state.fatal_error.clone());
    match fatal {
        Some(reason) => {
            tracing::error!("Exiting after fatal error: {}", reason);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Report a startup failure to the UI, then exit after the fatal delay
async fn fatal_exit(reason: &str, message: String) -> Result<ExitCode> {
    tracing::error!("Fatal error ({}): {}", reason, message);

    let event = BridgeEvent::FatalError {
        reason: reason.to_string(),
        message,
    };
    let mut stdout = tokio::io::stdout();
    write_event(&mut stdout, &event)
        .await
        .context("Failed to report the fatal error")?;

    tokio::time::sleep(FATAL_EXIT_DELAY).await;
    Ok(ExitCode::FAILURE)
}
