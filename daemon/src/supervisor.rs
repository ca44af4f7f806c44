//! Launches and supervises the single external application.
//!
//! At most one process is active at a time.  `launch` validates the target,
//! spawns it with its own directory as working directory and piped output,
//! fires the `started` callback, and hands the child to a watcher task.  The
//! watcher fires exactly one of `finished(exit_code)` / `error(description)`
//! when the process ends, on the runtime's threads rather than the caller's.

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::Instrument;

use crate::config::DEFAULT_GRACE_PERIOD_SECS;

/// Extra time `terminate` allows for the kill and final wait after the grace
/// period has run out.
const KILL_WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("another application is already running")]
    AlreadyRunning,

    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("failed to start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to kill process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("process {pid} did not exit after being killed")]
    Unresponsive { pid: u32 },
}

/// Extra arguments and environment for a launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

type StartedFn = Arc<dyn Fn(u32) + Send + Sync>;
type FinishedFn = Arc<dyn Fn(i32) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(String) + Send + Sync>;

/// Lifecycle notifications.  `started` runs on the caller of `launch`; the
/// other two run on the watcher task.
#[derive(Clone, Default)]
pub struct Callbacks {
    started: Option<StartedFn>,
    finished: Option<FinishedFn>,
    error: Option<ErrorFn>,
}

impl Callbacks {
    pub fn on_started(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.started = Some(Arc::new(f));
        self
    }

    pub fn on_finished(mut self, f: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.finished = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }
}

type StopRequest = oneshot::Sender<Result<(), TerminateError>>;

enum Slot {
    Idle,
    /// Reserved by a `launch` that is validating and spawning.
    Starting,
    Running(Active),
}

struct Active {
    pid: u32,
    generation: u64,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
    /// Flips to `true` once the watcher has reaped the process.
    exited: watch::Receiver<bool>,
}

struct Shared {
    slot: Mutex<Slot>,
    callbacks: Callbacks,
    grace_period: Mutex<Duration>,
    generations: AtomicU64,
}

impl Shared {
    /// Returns the slot to idle if it still belongs to `generation`.
    fn release(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Running(active) if active.generation == generation) {
            *slot = Slot::Idle;
        }
    }
}

/// Handle to the supervisor; clones share the same process slot.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(callbacks: Callbacks) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Idle),
                callbacks,
                grace_period: Mutex::new(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_grace_period(self, grace: Duration) -> Self {
        self.set_grace_period(grace);
        self
    }

    pub fn set_grace_period(&self, grace: Duration) {
        *self.shared.grace_period.lock() = grace;
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.shared.slot.lock(), Slot::Running(_))
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.shared.slot.lock() {
            Slot::Running(active) => Some(active.pid),
            _ => None,
        }
    }

    pub fn launch(&self, path: &Path) -> Result<u32, LaunchError> {
        self.launch_with(path, &LaunchOptions::default())
    }

    /// Starts `path` and returns its process id.
    pub fn launch_with(&self, path: &Path, options: &LaunchOptions) -> Result<u32, LaunchError> {
        {
            let mut slot = self.shared.slot.lock();
            if !matches!(&*slot, Slot::Idle) {
                return Err(LaunchError::AlreadyRunning);
            }
            *slot = Slot::Starting;
        }

        let (child, pid, path) = match spawn_child(path, options) {
            Ok(spawned) => spawned,
            Err(e) => {
                *self.shared.slot.lock() = Slot::Idle;
                tracing::error!("Failed to launch application: {e}");
                return Err(e);
            }
        };

        let generation = self.shared.generations.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        *self.shared.slot.lock() = Slot::Running(Active {
            pid,
            generation,
            stop_tx: Some(stop_tx),
            exited: exited_rx,
        });
        tracing::info!("Application launched: {} (pid {pid})", path.display());

        if let Some(started) = &self.shared.callbacks.started {
            started(pid);
        }

        let watcher = Watcher {
            shared: Arc::clone(&self.shared),
            pid,
            generation,
            exited: exited_tx,
        };
        tokio::spawn(
            watcher
                .run(child, stop_rx)
                .instrument(tracing::info_span!("supervisor", pid)),
        );
        Ok(pid)
    }

    /// Stops the running application: graceful request, grace period, kill.
    ///
    /// Succeeds immediately when nothing is running.  A call that overlaps
    /// one already in flight waits for the same process to be reaped.  The
    /// supervisor is idle when this returns, whatever the outcome.
    pub async fn terminate(&self) -> Result<(), TerminateError> {
        let (pid, generation, stop_tx, mut exited) = {
            let mut slot = self.shared.slot.lock();
            match &mut *slot {
                Slot::Running(active) => (
                    active.pid,
                    active.generation,
                    active.stop_tx.take(),
                    active.exited.clone(),
                ),
                _ => return Ok(()),
            }
        };
        let limit = self.shared.grace_period.lock().saturating_add(KILL_WAIT_LIMIT);

        let result = match stop_tx {
            Some(tx) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(reply_tx).is_err() {
                    // The watcher already saw the process exit.
                    Ok(())
                } else {
                    match tokio::time::timeout(limit, reply_rx).await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(_)) => Ok(()),
                        Err(_) => Err(TerminateError::Unresponsive { pid }),
                    }
                }
            }
            None => {
                // A dropped sender means the watcher is gone, so the process is too.
                let reaped = tokio::time::timeout(limit, exited.wait_for(|done| *done))
                    .await
                    .is_ok();
                if reaped {
                    Ok(())
                } else {
                    Err(TerminateError::Unresponsive { pid })
                }
            }
        };

        // No-op when the watcher already released this generation.
        self.shared.release(generation);
        match &result {
            Ok(()) => tracing::info!("Application terminated (pid {pid})"),
            Err(e) => tracing::error!("Failed to terminate application: {e}"),
        }
        result
    }
}

/// Validates `path` and spawns it.  Returns the child, its pid and the
/// absolute path that was started.
fn spawn_child(path: &Path, options: &LaunchOptions) -> Result<(Child, u32, PathBuf), LaunchError> {
    let path = std::path::absolute(path).map_err(|_| LaunchError::NotFound(path.to_path_buf()))?;
    if !path.is_file() {
        return Err(LaunchError::NotFound(path));
    }
    if !is_executable(&path) {
        return Err(LaunchError::NotExecutable(path));
    }

    let mut command = Command::new(&path);
    command
        .args(&options.args)
        .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = path.parent() {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        path: path.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, pid, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, pid, "stderr"));
    }
    Ok((child, pid, path))
}

/// Drains one of the child's pipes into the log so it never fills up.
async fn forward_output(stream: impl AsyncRead + Unpin, pid: u32, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "workload", pid, stream = name, "{line}");
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Exit code as reported to `finished`: the process's own code, or the
/// negated signal number when it was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(unix)]
async fn request_graceful_exit(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(e)
    }
}

/// `taskkill` without `/F` asks the application's windows to close.
#[cfg(windows)]
async fn request_graceful_exit(pid: u32) -> io::Result<()> {
    Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(drop)
}

struct Watcher {
    shared: Arc<Shared>,
    pid: u32,
    generation: u64,
    exited: watch::Sender<bool>,
}

impl Watcher {
    async fn run(self, mut child: Child, mut stop_rx: oneshot::Receiver<StopRequest>) {
        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| TerminateError::Wait { pid: self.pid, source }),
            Ok(reply) = &mut stop_rx => {
                let grace = *self.shared.grace_period.lock();
                let outcome = self.shut_down(&mut child, grace).await;
                let (status, reply_value) = match outcome {
                    Ok(status) => (Ok(status), Ok(())),
                    Err(e) => (
                        Err(TerminateError::Unresponsive { pid: self.pid }),
                        Err(e),
                    ),
                };
                let _ = reply.send(reply_value);
                status
            }
        };

        self.shared.release(self.generation);
        self.exited.send_replace(true);

        match status {
            Ok(status) => {
                let code = exit_code(status);
                tracing::info!("Application finished with exit code: {code}");
                if let Some(finished) = &self.shared.callbacks.finished {
                    finished(code);
                }
            }
            Err(e) => {
                tracing::error!("Process monitoring error: {e}");
                if let Some(error) = &self.shared.callbacks.error {
                    error(e.to_string());
                }
            }
        }
    }

    async fn shut_down(&self, child: &mut Child, grace: Duration) -> Result<ExitStatus, TerminateError> {
        let pid = self.pid;
        if let Err(e) = request_graceful_exit(pid).await {
            tracing::warn!("Graceful stop request failed: {e}");
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return Ok(status),
            Ok(Err(source)) => return Err(TerminateError::Wait { pid, source }),
            Err(_) => tracing::warn!("Process did not exit within {grace:?}; killing"),
        }

        child
            .start_kill()
            .map_err(|source| TerminateError::Kill { pid, source })?;
        child
            .wait()
            .await
            .map_err(|source| TerminateError::Wait { pid, source })
    }
}
