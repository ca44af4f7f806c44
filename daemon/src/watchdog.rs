//! Kiosk auto-restart.
//!
//! While an interactive session is attached, the [`SessionWatchdog`] keeps
//! the kiosk workload alive, relaunching it when it disappears.  Consecutive
//! launch failures are counted; once the ceiling is reached the watchdog
//! gives up for good and stops polling.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::sync::watch;

use crate::config::KioskConfig;
use crate::platform::{Platform, PlatformError};
use crate::supervisor::{LaunchError, LaunchOptions, ProcessSupervisor};

/// Session query faults wait this many intervals before the next poll.
const QUERY_ERROR_BACKOFF_FACTOR: u32 = 2;

/// The thing being kept alive.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn is_alive(&self) -> bool;

    fn launch(&self) -> Result<(), LaunchError>;

    /// Stops the workload when the watchdog shuts down.
    async fn shut_down(&self);
}

/// The configured executable, started through the supervisor with the kiosk
/// flag and environment.
pub struct KioskWorkload {
    supervisor: ProcessSupervisor,
    executable: PathBuf,
    options: LaunchOptions,
    system: Arc<Mutex<System>>,
}

impl KioskWorkload {
    pub fn new(supervisor: ProcessSupervisor, executable: PathBuf, config: &KioskConfig) -> Self {
        Self {
            supervisor,
            executable,
            options: kiosk_options(config),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// An instance started some other way (by hand, or by a previous run of
    /// this daemon) also counts as alive.  Only the resolved executable path
    /// is compared; a different program with the same file name does not
    /// count, and neither does one whose image this user cannot read.
    async fn external_instance_running(&self) -> bool {
        let executable = self.executable.clone();
        let system = Arc::clone(&self.system);
        let scan = tokio::task::spawn_blocking(move || {
            // Windows canonical paths carry a `\\?\` prefix the process table lacks.
            let canonical = std::fs::canonicalize(&executable).ok();
            let mut system = system.lock();
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
            );
            system.processes().values().any(|p| {
                p.exe().is_some_and(|exe| {
                    exe == executable.as_path() || Some(exe) == canonical.as_deref()
                })
            })
        });
        match scan.await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Process table scan failed: {e}");
                false
            }
        }
    }
}

/// `--kiosk` on the command line and `KIOSK=1` in the environment.  An empty
/// setting leaves that part out.
pub fn kiosk_options(config: &KioskConfig) -> LaunchOptions {
    LaunchOptions {
        args: Some(config.kiosk_arg.clone())
            .filter(|arg| !arg.is_empty())
            .into_iter()
            .collect(),
        env: Some(config.kiosk_env.clone())
            .filter(|var| !var.is_empty())
            .map(|var| (var, "1".to_string()))
            .into_iter()
            .collect(),
    }
}

#[async_trait]
impl Workload for KioskWorkload {
    async fn is_alive(&self) -> bool {
        self.supervisor.is_running() || self.external_instance_running().await
    }

    fn launch(&self) -> Result<(), LaunchError> {
        self.supervisor
            .launch_with(&self.executable, &self.options)
            .map(drop)
    }

    async fn shut_down(&self) {
        if let Err(e) = self.supervisor.terminate().await {
            tracing::error!("Failed to stop kiosk application: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub check_interval: Duration,
    pub max_restart_attempts: u32,
}

impl From<&KioskConfig> for WatchdogSettings {
    fn from(config: &KioskConfig) -> Self {
        Self {
            check_interval: config.session_check_interval(),
            max_restart_attempts: config.max_restart_attempts,
        }
    }
}

/// Result of a single watchdog cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    NoSession,
    Alive,
    Launched,
    LaunchFailed { attempt: u32 },
    /// The restart ceiling has been reached; no further launches happen.
    Exhausted,
}

/// Why [`SessionWatchdog::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Shutdown,
    Exhausted,
}

pub struct SessionWatchdog {
    platform: Arc<dyn Platform>,
    workload: Arc<dyn Workload>,
    settings: WatchdogSettings,
    attempt_count: u32,
    exhausted: bool,
}

impl SessionWatchdog {
    pub fn new(
        platform: Arc<dyn Platform>,
        workload: Arc<dyn Workload>,
        settings: WatchdogSettings,
    ) -> Self {
        Self {
            platform,
            workload,
            settings,
            attempt_count: 0,
            exhausted: false,
        }
    }

    /// Consecutive failed launches since the last success.
    #[cfg(test)]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub async fn poll_once(&mut self) -> Result<PollOutcome, PlatformError> {
        if self.exhausted {
            return Ok(PollOutcome::Exhausted);
        }

        let Some(session) = self.platform.active_session().await? else {
            tracing::trace!("No active user session");
            return Ok(PollOutcome::NoSession);
        };
        if self.workload.is_alive().await {
            return Ok(PollOutcome::Alive);
        }

        let max = self.settings.max_restart_attempts;
        if self.attempt_count >= max {
            return Ok(self.exhaust());
        }

        tracing::info!(
            "Kiosk application not running in session {session}; launching (attempt {}/{max})",
            self.attempt_count + 1
        );
        match self.workload.launch() {
            Ok(()) => {
                self.attempt_count = 0;
                Ok(PollOutcome::Launched)
            }
            // Came up between the liveness check and the launch.
            Err(LaunchError::AlreadyRunning) => Ok(PollOutcome::Alive),
            Err(e) => {
                self.attempt_count += 1;
                tracing::error!("Failed to launch kiosk application: {e}");
                if self.attempt_count >= max {
                    Ok(self.exhaust())
                } else {
                    Ok(PollOutcome::LaunchFailed {
                        attempt: self.attempt_count,
                    })
                }
            }
        }
    }

    fn exhaust(&mut self) -> PollOutcome {
        self.exhausted = true;
        tracing::error!(
            "Maximum restart attempts ({}) reached; no further launches will be made",
            self.settings.max_restart_attempts
        );
        PollOutcome::Exhausted
    }

    /// Polls until `shutdown` flips to `true` (or its sender is dropped) or
    /// the restart ceiling is exhausted, then stops the workload.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WatchdogExit {
        tracing::info!(
            "Session watchdog started (interval {:?}, max restarts {})",
            self.settings.check_interval,
            self.settings.max_restart_attempts
        );

        let exit = loop {
            if *shutdown.borrow() {
                break WatchdogExit::Shutdown;
            }

            let delay = match self.poll_once().await {
                Ok(PollOutcome::Exhausted) => break WatchdogExit::Exhausted,
                Ok(_) => self.settings.check_interval,
                Err(e) => {
                    tracing::error!("Error checking sessions: {e}");
                    self.settings
                        .check_interval
                        .saturating_mul(QUERY_ERROR_BACKOFF_FACTOR)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break WatchdogExit::Shutdown;
                    }
                }
            }
        };

        self.workload.shut_down().await;
        tracing::info!("Session watchdog stopped ({exit:?})");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use crate::platform::SessionId;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakeWorkload {
        alive: AtomicBool,
        fail_launch: AtomicBool,
        launches: AtomicUsize,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl Workload for FakeWorkload {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn launch(&self) -> Result<(), LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(LaunchError::NotFound(PathBuf::from("/opt/kiosk/missing")));
            }
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shut_down(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    fn setup(max: u32) -> (Arc<FakePlatform>, Arc<FakeWorkload>, SessionWatchdog) {
        let platform = Arc::new(FakePlatform::new());
        let workload = Arc::new(FakeWorkload::default());
        let watchdog = SessionWatchdog::new(
            Arc::clone(&platform) as Arc<dyn Platform>,
            Arc::clone(&workload) as Arc<dyn Workload>,
            WatchdogSettings {
                check_interval: INTERVAL,
                max_restart_attempts: max,
            },
        );
        (platform, workload, watchdog)
    }

    fn with_session(platform: &FakePlatform) {
        *platform.session.lock() = Some(SessionId::new("2"));
    }

    // ── single cycles ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn no_session_never_launches() {
        let (_platform, workload, mut watchdog) = setup(5);
        assert_eq!(watchdog.poll_once().await.unwrap(), PollOutcome::NoSession);
        assert_eq!(workload.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn alive_workload_is_left_alone() {
        let (platform, workload, mut watchdog) = setup(5);
        with_session(&platform);
        workload.alive.store(true, Ordering::SeqCst);

        assert_eq!(watchdog.poll_once().await.unwrap(), PollOutcome::Alive);
        assert_eq!(workload.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_the_attempt_count() {
        let (platform, workload, mut watchdog) = setup(5);
        with_session(&platform);
        workload.fail_launch.store(true, Ordering::SeqCst);

        assert_eq!(
            watchdog.poll_once().await.unwrap(),
            PollOutcome::LaunchFailed { attempt: 1 }
        );
        assert_eq!(
            watchdog.poll_once().await.unwrap(),
            PollOutcome::LaunchFailed { attempt: 2 }
        );

        workload.fail_launch.store(false, Ordering::SeqCst);
        assert_eq!(watchdog.poll_once().await.unwrap(), PollOutcome::Launched);
        assert_eq!(watchdog.attempt_count(), 0);
        assert_eq!(watchdog.poll_once().await.unwrap(), PollOutcome::Alive);
    }

    #[tokio::test]
    async fn query_fault_is_returned() {
        let (platform, _workload, mut watchdog) = setup(5);
        platform.fail_session_query.store(true, Ordering::SeqCst);
        assert!(watchdog.poll_once().await.is_err());
    }

    // ── run loop ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_stop_after_the_ceiling() {
        let (platform, workload, watchdog) = setup(3);
        with_session(&platform);
        workload.fail_launch.store(true, Ordering::SeqCst);
        let (_tx, rx) = watch::channel(false);

        let exit = watchdog.run(rx).await;

        assert_eq!(exit, WatchdogExit::Exhausted);
        assert_eq!(workload.launches.load(Ordering::SeqCst), 3);
        assert_eq!(platform.session_queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn query_fault_backs_off_twice_the_interval() {
        let (platform, workload, watchdog) = setup(5);
        platform.fail_session_query.store(true, Ordering::SeqCst);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(watchdog.run(rx));

        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;
        assert_eq!(platform.session_queries.load(Ordering::SeqCst), 1);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(platform.session_queries.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), WatchdogExit::Shutdown);
        assert!(workload.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_workload() {
        let (platform, workload, watchdog) = setup(5);
        with_session(&platform);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(watchdog.run(rx));

        tokio::time::sleep(INTERVAL / 2).await;
        assert_eq!(workload.launches.load(Ordering::SeqCst), 1);
        assert!(workload.alive.load(Ordering::SeqCst));

        drop(tx);
        assert_eq!(handle.await.unwrap(), WatchdogExit::Shutdown);
        assert!(workload.shut_down.load(Ordering::SeqCst));
        assert!(!workload.alive.load(Ordering::SeqCst));
    }

    // ── kiosk workload ────────────────────────────────────────────────────────

    #[test]
    fn kiosk_options_carry_flag_and_environment() {
        let options = kiosk_options(&KioskConfig::default());
        assert_eq!(options.args, vec!["--kiosk"]);
        assert_eq!(options.env, vec![("KIOSK".to_string(), "1".to_string())]);
    }

    #[test]
    fn empty_kiosk_settings_are_left_out() {
        let config = KioskConfig {
            kiosk_arg: String::new(),
            kiosk_env: String::new(),
            ..KioskConfig::default()
        };
        let options = kiosk_options(&config);
        assert!(options.args.is_empty());
        assert!(options.env.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_started_elsewhere_counts_as_alive() {
        let sleep = which::which("sleep").unwrap();
        let mut outside = std::process::Command::new(&sleep).arg("30").spawn().unwrap();

        let workload = KioskWorkload::new(
            ProcessSupervisor::new(Default::default()),
            sleep,
            &KioskConfig::default(),
        );
        assert!(workload.is_alive().await);

        outside.kill().unwrap();
        outside.wait().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn same_file_name_elsewhere_is_not_the_workload() {
        let sleep = which::which("sleep").unwrap();
        let mut outside = std::process::Command::new(&sleep).arg("30").spawn().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let lookalike = dir.path().join("sleep");
        std::fs::copy(&sleep, &lookalike).unwrap();
        let workload = KioskWorkload::new(
            ProcessSupervisor::new(Default::default()),
            lookalike,
            &KioskConfig::default(),
        );
        assert!(!workload.is_alive().await);

        outside.kill().unwrap();
        outside.wait().unwrap();
    }
}
