use std::sync::Arc;
use thiserror::Error;

use crate::platform::{Platform, PowerAction, PowerCommand};

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("no {action} command could be dispatched (tried: {})", tried.join(", "))]
    NoCommandAvailable {
        action: PowerAction,
        tried: Vec<String>,
    },
}

/// Issues host shutdown / restart by walking the platform's ordered
/// candidates until one is dispatched.
pub struct SystemController {
    platform: Arc<dyn Platform>,
}

impl SystemController {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub async fn shutdown(&self) -> Result<PowerCommand, PowerError> {
        self.perform(PowerAction::Shutdown).await
    }

    pub async fn restart(&self) -> Result<PowerCommand, PowerError> {
        self.perform(PowerAction::Restart).await
    }

    /// Success means the command was started, not that the host went down.
    async fn perform(&self, action: PowerAction) -> Result<PowerCommand, PowerError> {
        tracing::info!("Attempting system {action}");
        let mut tried = Vec::new();

        for candidate in self.platform.power_command_candidates(action).await {
            tried.push(candidate.to_string());
            if !self.platform.command_exists(&candidate.program) {
                tracing::debug!("Skipping {candidate}: {} not found", candidate.program);
                continue;
            }
            match self.platform.dispatch(&candidate) {
                Ok(()) => {
                    tracing::info!("Executing {action} command: {candidate}");
                    return Ok(candidate);
                }
                Err(e) => tracing::warn!("Failed to start {candidate}: {e}"),
            }
        }

        let err = PowerError::NoCommandAvailable { action, tried };
        tracing::error!("{err}");
        Err(err)
    }
}
