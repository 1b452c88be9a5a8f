use std::path::PathBuf;

use crate::assisted::AssistedError;
use crate::boot::BootError;
use crate::ignition::ComposeError;
use crate::installer::InstallError;

/// Everything a deploy step can fail with.
///
/// Each kind is its own variant so the conductor side can tell a missing
/// installer from a failed install from bad input.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Cannot run {tool}, is it installed in {}?", root.display())]
    ToolNotFound { tool: String, root: PathBuf },

    #[error("{tool} failed with code {code}: {last_line}")]
    ToolExecution {
        tool: String,
        code: i32,
        last_line: String,
    },

    #[error("Cannot use a pre-rendered configdrive, please pass it as JSON data")]
    ConfigurationRejected,

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Assisted agent is not ready: {0}")]
    AgentNotReady(String),

    #[error("Assisted agent failed: {result}")]
    AssistedAgentFailed { result: String },

    #[error("Assisted agent {0} disappeared while installing")]
    AgentVanished(String),

    #[error("UEFI boot configuration failed: {0}")]
    BootRegistration(#[source] BootError),

    #[error("Unknown deploy step: {0}")]
    UnknownStep(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<InstallError> for DeployError {
    fn from(e: InstallError) -> Self {
        match e {
            InstallError::ToolNotFound { tool, root } => DeployError::ToolNotFound { tool, root },
            InstallError::ToolExecution {
                tool,
                code,
                last_line,
            } => DeployError::ToolExecution {
                tool,
                code,
                last_line,
            },
            other => DeployError::Other(other.into()),
        }
    }
}

impl From<ComposeError> for DeployError {
    fn from(e: ComposeError) -> Self {
        match e {
            ComposeError::Rejected => DeployError::ConfigurationRejected,
            ComposeError::Malformed(msg) => DeployError::MalformedInput(msg),
        }
    }
}

impl From<AssistedError> for DeployError {
    fn from(e: AssistedError) -> Self {
        match e {
            AssistedError::AgentNotReady(msg) => DeployError::AgentNotReady(msg),
            AssistedError::AgentFailed { result } => DeployError::AssistedAgentFailed { result },
            AssistedError::AgentVanished(unit) => DeployError::AgentVanished(unit),
            other => DeployError::Other(other.into()),
        }
    }
}

impl From<BootError> for DeployError {
    fn from(e: BootError) -> Self {
        DeployError::BootRegistration(e)
    }
}
