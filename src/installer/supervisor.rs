use std::path::PathBuf;

use super::InstallerInvocation;

/// One observation from a running installer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A line of combined stdout/stderr
    Line(String),
    /// The process finished with this exit code
    Exited(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Cannot run {tool}, is it installed in {}?", root.display())]
    ToolNotFound { tool: String, root: PathBuf },

    #[error("{tool} failed with code {code}: {last_line}")]
    ToolExecution {
        tool: String,
        code: i32,
        last_line: String,
    },

    #[error("Failed to start {tool}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Starts one installer attempt and hands back its output as events.
///
/// Implementations must yield lines as they are produced and finish with a
/// single [`ProcessEvent::Exited`].
pub trait ToolRunner {
    fn launch(
        &mut self,
        invocation: &InstallerInvocation,
    ) -> Result<Box<dyn Iterator<Item = ProcessEvent>>, InstallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Retryable,
    Fatal,
}

/// Result of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Most recent non-blank output line, empty if there was none
    pub last_line: String,
}

/// Bookkeeping for one supervised operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_line: String,
    pub termination: Option<Termination>,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts.max(1),
            last_line: String::new(),
            termination: None,
        }
    }

    fn record(&mut self, outcome: &RunOutcome) -> Termination {
        self.last_line = outcome.last_line.clone();
        let termination = if outcome.exit_code == 0 {
            Termination::Success
        } else if self.attempt < self.max_attempts {
            Termination::Retryable
        } else {
            Termination::Fatal
        };
        self.termination = Some(termination);
        termination
    }
}

/// Drain the events of one attempt.
///
/// Every line is logged as it arrives; only the last non-blank one is kept.
/// A stream that ends without an exit event counts as exit code -1.
pub fn summarize(events: impl IntoIterator<Item = ProcessEvent>) -> RunOutcome {
    let mut last_line = String::new();
    let mut exit_code = -1;

    for event in events {
        match event {
            ProcessEvent::Line(line) => {
                tracing::info!(target: "coreos-installer", "{}", line);
                let trimmed = line.trim_end();
                if !trimmed.trim_start().is_empty() {
                    last_line = trimmed.to_string();
                }
            }
            ProcessEvent::Exited(code) => {
                exit_code = code;
                break;
            }
        }
    }

    RunOutcome {
        exit_code,
        last_line,
    }
}

/// Run the installer until it succeeds or the attempt budget is spent.
///
/// Only non-zero exits are retried. A missing tool or a failed spawn is
/// returned straight away.
pub fn supervise<R>(
    runner: &mut R,
    invocation: &InstallerInvocation,
    policy: &RetryPolicy,
) -> Result<RunOutcome, InstallError>
where
    R: ToolRunner + ?Sized,
{
    let mut state = RetryState::new(policy);

    loop {
        state.attempt += 1;
        tracing::debug!(
            "Starting {} (attempt {}/{})",
            invocation.tool,
            state.attempt,
            state.max_attempts
        );

        let events = match runner.launch(invocation) {
            Ok(events) => events,
            Err(e) => {
                state.termination = Some(Termination::Fatal);
                return Err(e);
            }
        };
        let outcome = summarize(events);

        match state.record(&outcome) {
            Termination::Success => return Ok(outcome),
            Termination::Retryable => {
                tracing::warn!(
                    "{} failed with code {} (attempt {}/{}), retrying: {}",
                    invocation.tool,
                    outcome.exit_code,
                    state.attempt,
                    state.max_attempts,
                    outcome.last_line
                );
            }
            Termination::Fatal => {
                return Err(InstallError::ToolExecution {
                    tool: invocation.tool.clone(),
                    code: outcome.exit_code,
                    last_line: outcome.last_line,
                })
            }
        }
    }
}
