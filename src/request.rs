use serde_json::Value;
use std::env;
use std::path::PathBuf;

use crate::boot::BootMode;
use crate::ignition::ConfigPayload;
use crate::node::{ConfigDrive, Node};

/// Forces `--copy-network` when set to `true`
pub const COPY_NETWORK_ENV: &str = "IPA_COREOS_COPY_NETWORK";
/// Extra kernel arguments (usually `ip=` options) for the installed system
pub const IP_OPTIONS_ENV: &str = "IPA_COREOS_IP_OPTIONS";

/// Settings the provisioning image passes through its environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub copy_network: bool,
    pub extra_kargs: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            copy_network: lookup(COPY_NETWORK_ENV)
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            extra_kargs: lookup(IP_OPTIONS_ENV)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    pub append: Vec<String>,
    pub delete: Vec<String>,
}

/// Everything one `install_coreos` attempt needs, resolved up front
#[derive(Debug, Clone, PartialEq)]
pub struct InstallRequest {
    pub device: PathBuf,
    /// `None` installs the image embedded in the live environment
    pub image_source: Option<String>,
    pub kernel_args: KernelArgs,
    pub config: Option<ConfigPayload>,
    /// Per-node network copy setting; falls back to [`EnvOverrides`]
    pub copy_network: Option<bool>,
    pub boot_mode: BootMode,
    pub automated_clean: bool,
}

impl InstallRequest {
    pub fn from_node(node: &Node, device: PathBuf, boot_mode: BootMode) -> Self {
        let info = &node.instance_info;

        let (meta, config) = match &info.configdrive {
            None => (None, None),
            Some(ConfigDrive::Rendered(s)) if s.trim().is_empty() => (None, None),
            Some(ConfigDrive::Rendered(s)) => (None, Some(ConfigPayload::PreRendered(s.clone()))),
            Some(ConfigDrive::Data(data)) => (
                data.meta_data.clone(),
                data.user_data.as_ref().and_then(user_data_payload),
            ),
        };
        let meta = meta.unwrap_or_default();

        Self {
            device,
            image_source: info
                .image_source
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            kernel_args: KernelArgs {
                append: meta.coreos_append_karg.unwrap_or_default(),
                delete: meta.coreos_delete_karg.unwrap_or_default(),
            },
            config,
            copy_network: meta.coreos_copy_network,
            boot_mode,
            automated_clean: node.automated_clean.unwrap_or(true),
        }
    }
}

fn user_data_payload(value: &Value) -> Option<ConfigPayload> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(ConfigPayload::Text(s.clone())),
        other => Some(ConfigPayload::Structured(other.clone())),
    }
}
