use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assisted::AssistedConfig;
use crate::boot::{BootPolicy, EfiBootManager};
use crate::installer::RetryPolicy;
use crate::paths;

/// Overrides the config file location
pub const CONFIG_ENV: &str = "COREOS_DEPLOY_CONFIG";

/// Agent settings. Every field has a default so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Where the CoreOS live root is mounted
    pub root_mount: PathBuf,
    /// Installer binary name inside the live root
    pub installer: String,
    pub dispatcher_dir: PathBuf,
    pub install_attempts: u32,
    pub boot: BootSettings,
    pub assisted: AssistedConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            root_mount: PathBuf::from(paths::ROOT_MOUNT),
            installer: "coreos-installer".into(),
            dispatcher_dir: PathBuf::from(paths::NM_DISPATCHER_DIR),
            install_attempts: RetryPolicy::default().max_attempts,
            boot: BootSettings::default(),
            assisted: AssistedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSettings {
    pub max_attempts: u32,
    pub delay_secs: u64,
    pub label: String,
    pub loader: String,
    pub esp_partition: u32,
}

impl Default for BootSettings {
    fn default() -> Self {
        let policy = BootPolicy::default();
        let efi = EfiBootManager::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_secs: policy.delay.as_secs(),
            label: efi.label,
            loader: efi.loader,
            esp_partition: efi.esp_partition,
        }
    }
}

impl BootSettings {
    pub fn policy(&self) -> BootPolicy {
        BootPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_secs(self.delay_secs),
        }
    }

    pub fn registrar(&self) -> EfiBootManager {
        EfiBootManager {
            label: self.label.clone(),
            loader: self.loader.clone(),
            esp_partition: self.esp_partition,
        }
    }
}

impl AgentConfig {
    pub fn install_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.install_attempts,
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agent config")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("In {}", path.display()))
    }

    /// Load from `$COREOS_DEPLOY_CONFIG` if set, else the default path if it
    /// exists, else built-in defaults.
    pub fn load() -> Result<Self> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        let default_path = Path::new(paths::CONFIG_FILE);
        if default_path.exists() {
            return Self::load_from(default_path);
        }

        Ok(Self::default())
    }
}
