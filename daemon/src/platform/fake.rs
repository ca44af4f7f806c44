use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{Platform, PlatformError, PowerAction, PowerCommand, SessionId};
use crate::devices::DeviceLine;

/// Scriptable in-memory host used by the component tests.
#[derive(Default)]
pub struct FakePlatform {
    pub lines: Mutex<Vec<DeviceLine>>,
    pub session: Mutex<Option<SessionId>>,
    pub existing_commands: Mutex<HashSet<String>>,
    pub candidates: Mutex<Vec<PowerCommand>>,
    pub dispatched: Mutex<Vec<PowerCommand>>,
    pub enumerations: AtomicUsize,
    pub session_queries: AtomicUsize,
    pub dispatch_attempts: AtomicUsize,
    pub fail_enumeration: AtomicBool,
    pub fail_session_query: AtomicBool,
    pub fail_dispatch: AtomicBool,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines(lines: Vec<DeviceLine>) -> Self {
        let fake = Self::new();
        *fake.lines.lock() = lines;
        fake
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceLine>, PlatformError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(PlatformError::Query("usb backend exploded".into()));
        }
        Ok(self.lines.lock().clone())
    }

    async fn active_session(&self) -> Result<Option<SessionId>, PlatformError> {
        self.session_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_session_query.load(Ordering::SeqCst) {
            return Err(PlatformError::Query("session service unavailable".into()));
        }
        Ok(self.session.lock().clone())
    }

    async fn power_command_candidates(&self, _action: PowerAction) -> Vec<PowerCommand> {
        self.candidates.lock().clone()
    }

    fn command_exists(&self, program: &str) -> bool {
        self.existing_commands.lock().contains(program)
    }

    fn dispatch(&self, command: &PowerCommand) -> std::io::Result<()> {
        self.dispatch_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "not permitted",
            ));
        }
        self.dispatched.lock().push(command.clone());
        Ok(())
    }
}
