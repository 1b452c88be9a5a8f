mod efibootmgr;

pub use efibootmgr::{parse_boot_entries, EfiBootManager, EfiEntry};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::clock::Sleep;

/// Firmware interface the live environment was booted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Uefi,
    #[default]
    Bios,
}

impl BootMode {
    /// Detect from the running kernel
    pub fn detect() -> Self {
        if Path::new("/sys/firmware/efi").exists() {
            BootMode::Uefi
        } else {
            BootMode::Bios
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// A firmware tool exited unsuccessfully. These are known to be flaky.
    #[error("Boot entry command failed: {0}")]
    CommandExecution(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Registers the installed system with the firmware boot manager
pub trait BootRegistrar {
    fn register(&self, device: &Path) -> Result<(), BootError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for BootPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

/// Make sure the firmware boots `device` after imaging.
///
/// Does nothing outside UEFI. Command failures are retried with a fixed
/// delay; anything else, or the last command failure, is returned as is.
pub fn finalize(
    registrar: &dyn BootRegistrar,
    device: &Path,
    mode: BootMode,
    policy: &BootPolicy,
    sleeper: &dyn Sleep,
) -> Result<(), BootError> {
    if mode != BootMode::Uefi {
        tracing::debug!("Not booted via UEFI, skipping boot entry setup");
        return Ok(());
    }

    tracing::info!("Configuring UEFI boot from device {}", device.display());
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match registrar.register(device) {
            Ok(()) => return Ok(()),
            Err(BootError::CommandExecution(msg)) if attempt < max_attempts => {
                // https://bugzilla.redhat.com/show_bug.cgi?id=2057668
                tracing::warn!(
                    "UEFI boot configuration failed (attempt {}/{}), retrying: {}",
                    attempt,
                    max_attempts,
                    msg
                );
                sleeper.sleep(policy.delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
