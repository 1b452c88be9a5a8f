use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::FileEntry;
use crate::paths;

const DISPATCHER_MODE: u32 = 0o744;
const HOSTNAME_MODE: u32 = 0o644;

/// Copy every NetworkManager dispatcher script into Ignition entries.
///
/// Each script is emitted twice: once at its own path and once under
/// `/sysroot`, since Ignition may run before the real root is pivoted in.
/// A missing directory simply yields nothing.
pub fn dispatcher_scripts(dir: &Path) -> Result<Vec<FileEntry>> {
    if !dir.is_dir() {
        tracing::debug!("No dispatcher directory at {}", dir.display());
        return Ok(Vec::new());
    }

    let mut scripts: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    scripts.sort();

    let mut entries = Vec::with_capacity(scripts.len() * 2);
    for script in scripts {
        let contents = fs::read(&script)
            .with_context(|| format!("Failed to read dispatcher script {}", script.display()))?;
        tracing::debug!(
            "Dispatcher file {}: {}",
            script.display(),
            String::from_utf8_lossy(&contents)
        );

        let live_path = script.to_string_lossy().to_string();
        let sysroot_path = format!("{}{}", paths::SYSROOT, live_path);

        entries.push(FileEntry::from_contents(live_path, DISPATCHER_MODE, false, &contents));
        entries.push(FileEntry::from_contents(sysroot_path, DISPATCHER_MODE, false, &contents));
    }

    Ok(entries)
}

/// First-boot `/etc/hostname`, if we know a real hostname
pub fn hostname_file(hostname: Option<&str>) -> Option<FileEntry> {
    let hostname = hostname.map(str::trim).filter(|h| is_real_hostname(h))?;
    Some(FileEntry::from_contents(
        "/etc/hostname",
        HOSTNAME_MODE,
        true,
        format!("{}\n", hostname).as_bytes(),
    ))
}

fn is_real_hostname(hostname: &str) -> bool {
    !hostname.is_empty() && hostname != "localhost" && hostname != "localhost.localdomain"
}

/// Hostname of the provisioning environment, usually set from DHCP
pub fn current_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => Some(name.to_string_lossy().into_owned()),
        Err(e) => {
            tracing::debug!("Could not resolve hostname: {}", e);
            None
        }
    }
}

/// Everything this host adds to the caller's Ignition config
pub fn local_additions(dispatcher_dir: &Path, hostname: Option<&str>) -> Result<Vec<FileEntry>> {
    let mut additions = dispatcher_scripts(dispatcher_dir)?;
    additions.extend(hostname_file(hostname));
    Ok(additions)
}
