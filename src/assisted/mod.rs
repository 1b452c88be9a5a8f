//! Hand the install over to the assisted-installer agent and wait for it.
//!
//! The agent is an independently running service. We only start it and
//! watch its lifecycle through a [`ServiceManager`] backend.

mod file_signal;
mod systemd;

pub use file_signal::FileSignalManager;
pub use systemd::SystemdServiceManager;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::clock::Sleep;

/// Lifecycle of the agent as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    NotPresent,
    Inactive,
    Activating,
    Active,
    Succeeded,
    /// Carries the backend's failure description
    Failed(String),
}

impl UnitState {
    pub fn is_running(&self) -> bool {
        matches!(self, UnitState::Activating | UnitState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssistedError {
    #[error("Assisted agent is not ready: {0}")]
    AgentNotReady(String),

    #[error("Assisted agent failed: {result}")]
    AgentFailed { result: String },

    #[error("Assisted agent {0} disappeared while installing")]
    AgentVanished(String),

    #[error("Failed to talk to systemd")]
    Dbus(#[from] zbus::Error),

    #[error("Failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Start/observe capability over the externally owned agent
pub trait ServiceManager {
    /// Human-readable name of what is being watched
    fn describe(&self) -> String;

    fn status(&mut self) -> Result<UnitState, AssistedError>;

    fn start(&mut self) -> Result<(), AssistedError>;
}

/// Controller view of one assisted session after Start was issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Started,
    Waiting(UnitState),
    Succeeded,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed(_))
    }

    /// Apply one observation. Terminal states absorb everything after them.
    pub fn observe(self, status: UnitState, unit: &str) -> Result<Self, AssistedError> {
        if self.is_terminal() {
            return Ok(self);
        }
        Ok(match status {
            UnitState::Succeeded => SessionState::Succeeded,
            UnitState::Failed(result) => SessionState::Failed(result),
            UnitState::NotPresent => return Err(AssistedError::AgentVanished(unit.to_string())),
            running => SessionState::Waiting(running),
        })
    }
}

pub struct AssistedController<'a> {
    manager: Box<dyn ServiceManager + 'a>,
    poll_interval: Duration,
    sleeper: &'a dyn Sleep,
}

impl<'a> AssistedController<'a> {
    pub fn new(
        manager: Box<dyn ServiceManager + 'a>,
        poll_interval: Duration,
        sleeper: &'a dyn Sleep,
    ) -> Self {
        Self {
            manager,
            poll_interval,
            sleeper,
        }
    }

    /// Start the agent and block until it reports a terminal state.
    ///
    /// There is no timeout here; the deploy framework owns that.
    pub fn run(&mut self) -> Result<(), AssistedError> {
        let unit = self.manager.describe();

        match self.manager.status()? {
            s if s.is_running() => {
                tracing::warn!("Assisted Installer Agent should not be active at this stage ({:?})", s)
            }
            s if s.is_terminal() => {
                tracing::debug!("Ignoring result left over from a previous session ({:?})", s)
            }
            _ => {}
        }

        self.manager.start()?;
        tracing::info!("Triggered installation via the assisted agent {}", unit);

        let mut state = SessionState::Started;
        loop {
            state = state.observe(self.manager.status()?, &unit)?;
            match &state {
                SessionState::Succeeded => {
                    tracing::info!("Successfully installed using the assisted agent");
                    return Ok(());
                }
                SessionState::Failed(result) => {
                    return Err(AssistedError::AgentFailed {
                        result: result.clone(),
                    })
                }
                waiting => {
                    tracing::debug!("Still waiting for the assisted agent to finish ({:?})", waiting)
                }
            }
            self.sleeper.sleep(self.poll_interval);
        }
    }
}

/// Which backend tracks the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistedBackend {
    #[default]
    Systemd,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistedConfig {
    pub backend: AssistedBackend,
    pub unit: String,
    pub state_dir: PathBuf,
    pub poll_secs: u64,
}

impl Default for AssistedConfig {
    fn default() -> Self {
        Self {
            backend: AssistedBackend::Systemd,
            unit: "agent.service".into(),
            state_dir: PathBuf::from(crate::paths::ASSISTED_STATE_DIR),
            poll_secs: 15,
        }
    }
}

impl AssistedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    /// Construct the configured backend
    pub fn connect(&self) -> Result<Box<dyn ServiceManager>, AssistedError> {
        Ok(match self.backend {
            AssistedBackend::Systemd => Box::new(SystemdServiceManager::connect(&self.unit)?),
            AssistedBackend::File => Box::new(FileSignalManager::new(&self.state_dir)),
        })
    }
}
