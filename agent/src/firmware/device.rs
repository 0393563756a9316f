//! Device restart

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::errors::AgentError;

/// Exit status used when the agent terminates to boot a new image
pub const RESTART_EXIT_CODE: i32 = 0;

/// Restart capability. On real hardware `restart` does not return.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn restart(&self) -> Result<(), AgentError>;
}

/// Restarts by running an optional command (e.g. `systemctl reboot`) and then
/// exiting the process so the supervisor brings the new image up.
#[derive(Debug, Clone, Default)]
pub struct ProcessRestart {
    command: Option<Vec<String>>,
}

impl ProcessRestart {
    pub fn new(command: Option<Vec<String>>) -> Self {
        Self {
            command: command.filter(|argv| !argv.is_empty()),
        }
    }
}

#[async_trait]
impl DeviceControl for ProcessRestart {
    async fn restart(&self) -> Result<(), AgentError> {
        if let Some(argv) = &self.command {
            info!("Running restart command: {}", argv.join(" "));
            let status = Command::new(&argv[0]).args(&argv[1..]).status().await?;
            if !status.success() {
                error!("Restart command exited with {}", status);
                return Err(AgentError::Internal(format!(
                    "restart command exited with {}",
                    status
                )));
            }
        }

        info!("Restarting...");
        std::process::exit(RESTART_EXIT_CODE);
    }
}
