use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;

use crate::config::MonitorConfig;
use crate::devices::{DeviceStatusSnapshot, LogicalDevice};
use crate::platform::{Platform, PlatformError};

const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Commands the presenter sends to a running scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

/// One message per scan cycle, published on the status channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorMessage {
    /// The cycle completed; supersedes any earlier snapshot.
    DeviceStatus(DeviceStatusSnapshot),
    /// The cycle failed; the loop backs off and retries.
    Error(String),
}

impl MonitorMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorMessage::DeviceStatus(_) => "device_status",
            MonitorMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("presence monitor is already running")]
    AlreadyRunning,

    #[error("presence monitor is not running")]
    NotRunning,

    #[error("control channel is full or closed")]
    ControlUnavailable,
}

/// How a call to [`PresenceMonitor::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// The loop saw the stop request and exited on its own.
    Graceful,
    /// The loop did not exit in time and was aborted.
    Forced,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub error_backoff_factor: u32,
    pub status_capacity: usize,
    pub stop_timeout: Duration,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            interval: config.interval(),
            error_backoff_factor: config.error_backoff_factor,
            status_capacity: config.status_channel_capacity,
            stop_timeout: config.stop_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct LoopState {
    paused: bool,
}

/// Polls the host's device listing on an interval and publishes a
/// [`DeviceStatusSnapshot`] per cycle.
///
/// Publishing never waits on the consumer: when the status channel is full
/// the cycle's update is dropped.  Control commands are read at most one per
/// cycle, before enumeration.
pub struct PresenceMonitor {
    platform: Arc<dyn Platform>,
    devices: Arc<[LogicalDevice]>,
    settings: MonitorSettings,
    state: Arc<Mutex<LoopState>>,
    control_tx: Option<mpsc::Sender<ControlCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl PresenceMonitor {
    pub fn new(
        platform: Arc<dyn Platform>,
        devices: Vec<LogicalDevice>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            platform,
            devices: devices.into(),
            settings,
            state: Arc::new(Mutex::new(LoopState::default())),
            control_tx: None,
            handle: None,
        }
    }

    /// Spawns the scan loop and returns the receiving end of the status channel.
    pub fn start(&mut self) -> Result<mpsc::Receiver<MonitorMessage>, MonitorError> {
        if self.is_running() {
            return Err(MonitorError::AlreadyRunning);
        }

        let (status_tx, status_rx) = mpsc::channel(self.settings.status_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        self.state.lock().paused = false;

        let scan = ScanLoop {
            platform: Arc::clone(&self.platform),
            devices: Arc::clone(&self.devices),
            settings: self.settings.clone(),
            state: Arc::clone(&self.state),
            control_rx,
            status_tx,
        };
        self.handle = Some(tokio::spawn(
            scan.run().instrument(tracing::info_span!("presence_monitor")),
        ));
        self.control_tx = Some(control_tx);
        Ok(status_rx)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether the loop has applied a pause request.
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn pause(&self) -> Result<(), MonitorError> {
        self.send_control(ControlCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), MonitorError> {
        self.send_control(ControlCommand::Resume)
    }

    fn send_control(&self, command: ControlCommand) -> Result<(), MonitorError> {
        if !self.is_running() {
            return Err(MonitorError::NotRunning);
        }
        let tx = self.control_tx.as_ref().ok_or(MonitorError::NotRunning)?;
        tx.try_send(command).map_err(|_| MonitorError::ControlUnavailable)
    }

    /// Asks the loop to stop and waits up to the configured timeout before
    /// aborting it.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };

        // Dropping the sender closes the channel, which the loop also treats
        // as a stop once queued commands are drained.
        if let Some(tx) = self.control_tx.take() {
            if tx.try_send(ControlCommand::Stop).is_err() {
                tracing::warn!("Control channel full; stopping via channel close");
            }
        }

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.settings.stop_timeout, handle).await {
            Ok(_) => StopOutcome::Graceful,
            Err(_) => {
                tracing::warn!(
                    "Presence monitor did not stop within {:?}; aborting",
                    self.settings.stop_timeout
                );
                abort.abort();
                StopOutcome::Forced
            }
        }
    }
}

/// Runs one enumeration and maps it onto the configured devices.
pub async fn scan_once(
    platform: &dyn Platform,
    devices: &[LogicalDevice],
) -> Result<DeviceStatusSnapshot, PlatformError> {
    let lines = platform.enumerate_devices().await?;
    Ok(DeviceStatusSnapshot::build(devices, &lines))
}

struct ScanLoop {
    platform: Arc<dyn Platform>,
    devices: Arc<[LogicalDevice]>,
    settings: MonitorSettings,
    state: Arc<Mutex<LoopState>>,
    control_rx: mpsc::Receiver<ControlCommand>,
    status_tx: mpsc::Sender<MonitorMessage>,
}

impl ScanLoop {
    async fn run(mut self) {
        let interval = self.settings.interval;
        let backoff = interval.saturating_mul(self.settings.error_backoff_factor);
        tracing::info!(
            "Presence monitor started on {} ({} logical devices, every {:?})",
            self.platform.name(),
            self.devices.len(),
            interval
        );

        loop {
            match self.control_rx.try_recv() {
                Ok(ControlCommand::Stop) | Err(TryRecvError::Disconnected) => break,
                Ok(ControlCommand::Pause) => {
                    self.state.lock().paused = true;
                    tracing::info!("Scanning paused");
                    sleep(interval).await;
                    continue;
                }
                Ok(ControlCommand::Resume) => {
                    self.state.lock().paused = false;
                    tracing::info!("Scanning resumed");
                    sleep(interval).await;
                    continue;
                }
                Err(TryRecvError::Empty) => {}
            }

            let paused = self.state.lock().paused;
            if paused {
                sleep(interval).await;
                continue;
            }

            match scan_once(self.platform.as_ref(), &self.devices).await {
                Ok(snapshot) => {
                    tracing::trace!("{} device(s) connected", snapshot.connected_count());
                    if !self.publish(MonitorMessage::DeviceStatus(snapshot)) {
                        break;
                    }
                    sleep(interval).await;
                }
                Err(e) => {
                    tracing::error!("Scan cycle failed: {e}");
                    if !self.publish(MonitorMessage::Error(e.to_string())) {
                        break;
                    }
                    sleep(backoff).await;
                }
            }
        }

        tracing::info!("Presence monitor stopped");
    }

    /// Returns `false` once nobody is listening any more.
    fn publish(&self, message: MonitorMessage) -> bool {
        match self.status_tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!("Status channel full; dropping {} update", message.kind());
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::info!("Status receiver dropped");
                false
            }
        }
    }
}
