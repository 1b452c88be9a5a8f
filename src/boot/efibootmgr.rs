use anyhow::anyhow;
use std::path::Path;

use super::{BootError, BootRegistrar};
use crate::cmd;

/// A `BootXXXX` line from `efibootmgr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiEntry {
    pub num: String,
    pub active: bool,
    pub label: String,
}

/// Parse the boot entries out of plain `efibootmgr` output
pub fn parse_boot_entries(output: &str) -> Vec<EfiEntry> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("Boot")?;
            let num = rest.get(..4)?;
            if !num.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            let rest = &rest[4..];
            let (active, rest) = match rest.strip_prefix('*') {
                Some(r) => (true, r),
                None => (false, rest),
            };
            let label = rest.strip_prefix(' ')?.trim_start();
            let label = label.split('\t').next().unwrap_or(label).trim_end();
            Some(EfiEntry {
                num: num.to_string(),
                active,
                label: label.to_string(),
            })
        })
        .collect()
}

/// UEFI boot entry management through `efibootmgr`
#[derive(Debug, Clone)]
pub struct EfiBootManager {
    pub label: String,
    /// Loader path on the ESP, in firmware notation
    pub loader: String,
    /// ESP partition number on the install device
    pub esp_partition: u32,
}

impl Default for EfiBootManager {
    fn default() -> Self {
        Self {
            label: "Red Hat CoreOS".into(),
            loader: "\\EFI\\redhat\\shimx64.efi".into(),
            esp_partition: 2,
        }
    }
}

fn command_failed(e: anyhow::Error) -> BootError {
    BootError::CommandExecution(format!("{:#}", e))
}

impl EfiBootManager {
    fn entries(&self) -> Result<Vec<EfiEntry>, BootError> {
        let output = cmd::run_output("efibootmgr", Vec::<&str>::new()).map_err(command_failed)?;
        Ok(parse_boot_entries(&output))
    }
}

impl BootRegistrar for EfiBootManager {
    fn register(&self, device: &Path) -> Result<(), BootError> {
        if !Path::new("/sys/firmware/efi/efivars").exists() {
            return Err(anyhow!(
                "EFI variables not available. Cannot create boot entries.\n\
                 Try: mount -t efivarfs efivarfs /sys/firmware/efi/efivars"
            )
            .into());
        }

        // Stale entries from previous deployments would otherwise pile up
        for entry in self.entries()?.iter().filter(|e| e.label == self.label) {
            tracing::debug!("Removing stale boot entry Boot{} ({})", entry.num, entry.label);
            cmd::run("efibootmgr", ["-b", &entry.num, "-B"]).map_err(command_failed)?;
        }

        let device_str = device.to_string_lossy().to_string();
        let part_str = self.esp_partition.to_string();
        cmd::run(
            "efibootmgr",
            [
                "--create",
                "--disk",
                &device_str,
                "--part",
                &part_str,
                "--label",
                &self.label,
                "--loader",
                &self.loader,
            ],
        )
        .map_err(command_failed)?;

        if !self.entries()?.iter().any(|e| e.label == self.label) {
            return Err(BootError::CommandExecution(format!(
                "Boot entry '{}' was not saved to NVRAM",
                self.label
            )));
        }

        tracing::info!("Boot entry '{}' verified in NVRAM", self.label);
        Ok(())
    }
}
