use crate::services::platform::PlatformCapabilities;
use camino::Utf8PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long EOF is awaited on the output pipes after the process is gone.
///
/// A helper process that inherited the pipes can keep them open after the
/// worker itself exited; past this grace the streams are abandoned with
/// whatever was already read.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Everything needed to start one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<Utf8PathBuf>,
    pub env: Vec<(String, String)>,
}

impl WorkerInvocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line for logs
    pub fn display(&self) -> String {
        let mut parts = vec![format!("\"{}\"", self.command)];
        parts.extend(self.args.iter().map(|arg| {
            if arg.contains(' ') {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        }));
        parts.join(" ")
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own. `code` is `None` when it was terminated
    /// by a signal we did not send.
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// `kill` was requested before the process exited
    Killed { stdout: String, stderr: String },
}

impl ExitOutcome {
    pub fn stdout(&self) -> &str {
        match self {
            Self::Exited { stdout, .. } | Self::Killed { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            Self::Exited { stderr, .. } | Self::Killed { stderr, .. } => stderr,
        }
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed { .. })
    }

    /// stdout followed by stderr, as a single diagnostic text
    pub fn combined_output(&self) -> String {
        let (stdout, stderr) = (self.stdout(), self.stderr());
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout.trim_end(), stderr),
        }
    }
}

/// Errors raised while starting a worker
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} pipe was not captured")]
    MissingPipe(&'static str),
}

/// Cloneable reference used to request termination of a supervised process.
///
/// Holding a killer does not keep the process alive or give access to its
/// output; after the process is gone `kill` is a no-op.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    pid: Option<u32>,
    kill_tx: Arc<watch::Sender<bool>>,
}

impl ProcessKiller {
    /// Request termination of the whole process tree
    pub fn kill(&self) {
        if !self.kill_tx.send_replace(true) {
            tracing::debug!("Kill requested for worker pid {:?}", self.pid);
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// One live worker process.
///
/// Consumed by [`wait`](Self::wait), so an exited handle can never be reused.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    killer: ProcessKiller,
    stdout_chunks: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    exit_rx: oneshot::Receiver<ExitOutcome>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    /// Raw stdout chunks as they are read, before the process exits.
    ///
    /// Can be taken once; the stream ends when stdout reaches EOF or is abandoned.
    pub fn take_stdout_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.stdout_chunks.take()
    }

    /// Wait for the process to end and both output streams to be drained
    pub async fn wait(self) -> ExitOutcome {
        let ProcessHandle { pid, exit_rx, .. } = self;
        match exit_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("Monitor for worker pid {:?} vanished without an outcome", pid);
                ExitOutcome::Killed {
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }
    }
}

/// Spawns worker processes and supervises them until exit
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    capabilities: PlatformCapabilities,
    drain_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(capabilities: PlatformCapabilities) -> Self {
        Self {
            capabilities,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    pub fn capabilities(&self) -> &PlatformCapabilities {
        &self.capabilities
    }

    /// Start a worker and return immediately with its handle.
    ///
    /// Must be called from within a tokio runtime; the output readers and the
    /// exit monitor run as background tasks.
    pub fn spawn(&self, invocation: &WorkerInvocation) -> Result<ProcessHandle, SupervisorError> {
        tracing::info!("Spawning worker: {}", invocation.display());

        let mut command = Command::new(&invocation.command);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        #[cfg(unix)]
        if self.capabilities.supports_process_groups {
            // Lead a new group so the whole tree can be signalled at once
            command.process_group(0);
        }

        #[cfg(windows)]
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            command: invocation.command.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SupervisorError::MissingPipe("stderr"))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let stdout_task = tokio::spawn(drain_stream(stdout, Arc::clone(&stdout_buf), Some(chunk_tx)));
        let stderr_task = tokio::spawn(drain_stream(stderr, Arc::clone(&stderr_buf), None));

        let (kill_tx, kill_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(monitor(Monitor {
            child,
            pid,
            capabilities: self.capabilities,
            kill_rx,
            readers: [stdout_task, stderr_task],
            stdout_buf,
            stderr_buf,
            drain_grace: self.drain_grace,
            exit_tx,
        }));

        tracing::debug!("Worker started with pid {:?}", pid);

        Ok(ProcessHandle {
            pid,
            killer: ProcessKiller {
                pid,
                kill_tx: Arc::new(kill_tx),
            },
            stdout_chunks: Some(chunk_rx),
            exit_rx,
        })
    }

    /// Request termination of the process tree behind `handle`
    pub fn kill(&self, handle: &ProcessHandle) {
        handle.killer().kill();
    }

    /// Spawn a worker and wait for its outcome
    pub async fn run(&self, invocation: &WorkerInvocation) -> Result<ExitOutcome, SupervisorError> {
        Ok(self.spawn(invocation)?.wait().await)
    }
}

struct Monitor {
    child: Child,
    pid: Option<u32>,
    capabilities: PlatformCapabilities,
    kill_rx: watch::Receiver<bool>,
    readers: [JoinHandle<()>; 2],
    stdout_buf: Arc<Mutex<Vec<u8>>>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    drain_grace: Duration,
    exit_tx: oneshot::Sender<ExitOutcome>,
}

enum Ending {
    Exited(Option<i32>),
    Killed,
}

async fn monitor(mut m: Monitor) {
    let status = tokio::select! {
        status = m.child.wait() => Some(status),
        () = kill_requested(&mut m.kill_rx) => None,
    };

    let ending = match status {
        Some(Ok(status)) => Ending::Exited(status.code()),
        Some(Err(e)) => {
            tracing::warn!("Failed to wait for worker pid {:?}: {}", m.pid, e);
            Ending::Exited(None)
        }
        None => {
            terminate_tree(&mut m.child, m.pid, &m.capabilities).await;
            Ending::Killed
        }
    };

    let [stdout_task, stderr_task] = m.readers;
    tokio::join!(
        finish_reader(stdout_task, m.drain_grace, "stdout"),
        finish_reader(stderr_task, m.drain_grace, "stderr"),
    );

    let stdout = String::from_utf8_lossy(&std::mem::take(&mut *lock(&m.stdout_buf))).into_owned();
    let stderr = String::from_utf8_lossy(&std::mem::take(&mut *lock(&m.stderr_buf))).into_owned();

    let outcome = match ending {
        Ending::Exited(code) => {
            tracing::info!("Worker pid {:?} exited with code {:?}", m.pid, code);
            ExitOutcome::Exited { code, stdout, stderr }
        }
        Ending::Killed => {
            tracing::info!("Worker pid {:?} was killed", m.pid);
            ExitOutcome::Killed { stdout, stderr }
        }
    };

    // The handle may already be gone; nobody is waiting then
    let _ = m.exit_tx.send(outcome);
}

async fn kill_requested(kill_rx: &mut watch::Receiver<bool>) {
    loop {
        if *kill_rx.borrow_and_update() {
            return;
        }
        if kill_rx.changed().await.is_err() {
            // Every killer is gone, so no kill can arrive any more
            std::future::pending::<()>().await;
        }
    }
}

async fn terminate_tree(child: &mut Child, pid: Option<u32>, capabilities: &PlatformCapabilities) {
    let tree_killed = match pid {
        Some(pid) => match kill_process_tree(pid, capabilities).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Process tree kill for pid {} failed: {}", pid, e);
                false
            }
        },
        None => false,
    };

    if !tree_killed {
        if let Err(e) = child.start_kill() {
            tracing::debug!("Direct kill of worker failed: {}", e);
        }
    }

    if let Err(e) = child.wait().await {
        tracing::warn!("Failed to reap killed worker: {}", e);
    }
}

/// Forcefully terminate `pid` and every process it started.
///
/// On Unix this relies on the worker leading its own process group (see
/// [`ProcessSupervisor::spawn`]).
pub async fn kill_process_tree(pid: u32, capabilities: &PlatformCapabilities) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if !capabilities.supports_process_groups {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "process groups are not available",
            ));
        }

        let raw = i32::try_from(pid).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("pid {} out of range", pid))
        })?;

        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno)),
        }
    }

    #[cfg(windows)]
    {
        let _ = capabilities;
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (pid, capabilities);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process tree kill is not supported on this platform",
        ))
    }
}

async fn drain_stream<R>(mut stream: R, sink: Arc<Mutex<Vec<u8>>>, tap: Option<mpsc::UnboundedSender<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                lock(&sink).extend_from_slice(&chunk[..n]);
                if let Some(tap) = &tap {
                    // The consumer may have stopped listening; the bytes are buffered anyway
                    let _ = tap.send(chunk[..n].to_vec());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Failed to read worker output: {}", e);
                break;
            }
        }
    }
}

async fn finish_reader(task: JoinHandle<()>, grace: Duration, stream: &str) {
    let abort = task.abort_handle();
    match timeout(grace, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Worker {} reader ended abnormally: {}", stream, e),
        Err(_) => {
            tracing::warn!(
                "Worker {} still open {:?} after exit, abandoning remaining output",
                stream,
                grace
            );
            abort.abort();
        }
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
