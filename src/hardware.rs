//! Device discovery and disk housekeeping on the provisioning host

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::boot::BootMode;
use crate::cmd;

/// Ironic skips disks smaller than this when picking a root device
const MIN_ROOT_DEVICE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// What the deploy steps need to know about (and do to) the local hardware
pub trait Hardware {
    /// Block device the OS is installed to
    fn install_device(&self) -> Result<PathBuf>;

    fn boot_mode(&self) -> BootMode;

    /// Stop and wipe any software RAID arrays
    fn delete_software_raid(&self) -> Result<()>;

    /// Re-read the partition table and wait for udev
    fn rescan_device(&self, device: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub path: String,
    pub size_bytes: u64,
    pub model: Option<String>,
    pub removable: bool,
}

/// Parse `lsblk -b -d -n -o PATH,SIZE,MODEL,RM`
pub fn parse_lsblk(stdout: &str) -> Vec<BlockDevice> {
    let mut devices = Vec::new();

    for line in stdout.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            let path = parts[0].to_string();

            if is_loop_or_optical(&path) {
                continue;
            }

            let size_bytes = parts[1].parse().unwrap_or(0);
            let removable = parts.last().map(|s| *s == "1").unwrap_or(false);
            let model = if parts.len() > 3 {
                Some(parts[2..parts.len() - 1].join(" "))
            } else {
                None
            };

            devices.push(BlockDevice {
                path,
                size_bytes,
                model,
                removable,
            });
        }
    }

    devices
}

/// `loopN` and `srN` kernel names. Matching on the whole name keeps
/// devices like `/dev/mapper/vg-usr` in the list.
fn is_loop_or_optical(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    ["loop", "sr"].iter().any(|prefix| {
        name.strip_prefix(prefix)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Smallest fixed disk big enough to hold an OS
pub fn pick_root_device(devices: &[BlockDevice]) -> Option<&BlockDevice> {
    devices
        .iter()
        .filter(|d| !d.removable && d.size_bytes >= MIN_ROOT_DEVICE_BYTES)
        .min_by_key(|d| d.size_bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdArray {
    pub name: String,
    pub members: Vec<String>,
}

/// Parse the array lines of `/proc/mdstat`
pub fn parse_mdstat(content: &str) -> Vec<MdArray> {
    content
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(" : ")?;
            let name = name.trim();
            if !name.starts_with("md") {
                return None;
            }
            let members = rest
                .split_whitespace()
                .filter_map(|token| token.split_once('[').map(|(dev, _)| dev.to_string()))
                .collect();
            Some(MdArray {
                name: name.to_string(),
                members,
            })
        })
        .collect()
}

/// The machine this agent is running on
#[derive(Debug, Clone, Default)]
pub struct LocalHardware {
    /// Explicit install target; otherwise picked from `lsblk`
    pub device: Option<PathBuf>,
}

impl LocalHardware {
    pub fn new(device: Option<PathBuf>) -> Self {
        Self { device }
    }
}

impl Hardware for LocalHardware {
    fn install_device(&self) -> Result<PathBuf> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }

        let output = cmd::run_output("lsblk", ["-b", "-d", "-n", "-o", "PATH,SIZE,MODEL,RM"])?;
        let devices = parse_lsblk(&output);
        match pick_root_device(&devices) {
            Some(dev) => {
                tracing::info!(
                    "Picked root device {} ({} bytes, {})",
                    dev.path,
                    dev.size_bytes,
                    dev.model.as_deref().unwrap_or("unknown model")
                );
                Ok(PathBuf::from(&dev.path))
            }
            None => bail!("No suitable root device found"),
        }
    }

    fn boot_mode(&self) -> BootMode {
        BootMode::detect()
    }

    fn delete_software_raid(&self) -> Result<()> {
        let mdstat = match fs::read_to_string("/proc/mdstat") {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!("No /proc/mdstat, nothing to clean up");
                return Ok(());
            }
        };

        for array in parse_mdstat(&mdstat) {
            tracing::info!("Deleting software RAID device {}", array.name);
            cmd::run("mdadm", ["--stop", &format!("/dev/{}", array.name)])
                .with_context(|| format!("Failed to stop /dev/{}", array.name))?;

            for member in &array.members {
                cmd::run("mdadm", ["--zero-superblock", &format!("/dev/{}", member)])
                    .with_context(|| format!("Failed to wipe RAID superblock on /dev/{}", member))?;
            }
        }

        Ok(())
    }

    fn rescan_device(&self, device: &Path) -> Result<()> {
        let device_str = device.to_string_lossy().to_string();
        cmd::run("partprobe", [&device_str])?;
        cmd::run("udevadm", ["settle"])?;
        Ok(())
    }
}
