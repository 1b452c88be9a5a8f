use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{AssistedError, ServiceManager, UnitState};

const PID_FILE: &str = "pid";
const TRIGGER_FILE: &str = "trigger";
const RESULT_FILE: &str = "result";

/// Talks to an agent through marker files in a shared state directory.
///
/// - `pid`: the agent is up and waiting
/// - `trigger`: written by us to start the install
/// - `result`: written by the agent when done; empty means success,
///   anything else is the failure text. Surrounding whitespace is ignored,
///   so a file holding just a newline (`echo > result`) is also a success.
#[derive(Debug, Clone)]
pub struct FileSignalManager {
    dir: PathBuf,
    started: bool,
}

impl FileSignalManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            started: false,
        }
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> AssistedError + '_ {
    move |source| AssistedError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Remove a marker, tolerating its absence
fn remove_stale(path: &Path) -> Result<(), AssistedError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed stale {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path)(e)),
    }
}

impl ServiceManager for FileSignalManager {
    fn describe(&self) -> String {
        format!("at {}", self.dir.display())
    }

    fn status(&mut self) -> Result<UnitState, AssistedError> {
        let result = self.marker(RESULT_FILE);
        match fs::read_to_string(&result) {
            Ok(text) if text.trim().is_empty() => return Ok(UnitState::Succeeded),
            Ok(text) => return Ok(UnitState::Failed(text.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&result)(e)),
        }

        Ok(if self.marker(TRIGGER_FILE).exists() {
            UnitState::Activating
        } else if self.marker(PID_FILE).exists() {
            if self.started {
                UnitState::Active
            } else {
                UnitState::Inactive
            }
        } else {
            UnitState::NotPresent
        })
    }

    fn start(&mut self) -> Result<(), AssistedError> {
        if !self.marker(PID_FILE).exists() {
            return Err(AssistedError::AgentNotReady(format!(
                "no {} file in {}",
                PID_FILE,
                self.dir.display()
            )));
        }

        remove_stale(&self.marker(TRIGGER_FILE))?;
        remove_stale(&self.marker(RESULT_FILE))?;

        let trigger = self.marker(TRIGGER_FILE);
        fs::write(&trigger, b"").map_err(io_error(&trigger))?;
        self.started = true;
        Ok(())
    }
}
