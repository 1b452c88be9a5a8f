use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// The subset of an Ironic node document the deploy steps read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub uuid: Option<String>,

    #[serde(default)]
    pub instance_info: InstanceInfo,

    /// Whether automated cleaning runs for this node; unset means enabled
    #[serde(default)]
    pub automated_clean: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Image URL; absent or empty installs the image embedded in the live ISO
    #[serde(default)]
    pub image_source: Option<String>,

    #[serde(default)]
    pub configdrive: Option<ConfigDrive>,
}

/// Either structured config drive data or an opaque pre-rendered blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigDrive {
    Rendered(String),
    Data(ConfigDriveData),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDriveData {
    #[serde(default)]
    pub meta_data: Option<MetaData>,

    /// The Ignition config, as JSON or as JSON text
    #[serde(default)]
    pub user_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(default)]
    pub coreos_append_karg: Option<Vec<String>>,

    #[serde(default)]
    pub coreos_delete_karg: Option<Vec<String>>,

    #[serde(default)]
    pub coreos_copy_network: Option<bool>,
}

/// Where to read a node document from
#[derive(Debug, Clone)]
pub enum NodeSource {
    File(PathBuf),
    Url(String),
    Stdin,
}

impl NodeSource {
    /// Parse from command line argument
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            "-" => Self::Stdin,
            s if s.starts_with("http://") || s.starts_with("https://") => Self::Url(s.to_string()),
            s => Self::File(PathBuf::from(s)),
        }
    }
}

/// Load a node document from any supported source
pub fn load(source: &NodeSource) -> Result<Node> {
    match source {
        NodeSource::File(path) => load_from_file(path),
        NodeSource::Url(url) => load_from_url(url),
        NodeSource::Stdin => load_from_stdin(),
    }
}

fn load_from_file(path: &Path) -> Result<Node> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read node document: {}", path.display()))?;

    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "json" => parse_json(&content),
        "yaml" | "yml" => parse_yaml(&content),
        _ => parse_auto(&content),
    }
}

fn load_from_url(url: &str) -> Result<Node> {
    let content = ureq::get(url)
        .call()
        .with_context(|| format!("Failed to fetch node document from URL: {}", url))?
        .into_string()
        .context("Failed to read response body")?;
    parse_auto(&content)
}

fn load_from_stdin() -> Result<Node> {
    let mut content = String::new();
    io::stdin()
        .read_to_string(&mut content)
        .context("Failed to read node document from stdin")?;
    parse_auto(&content)
}

fn parse_json(content: &str) -> Result<Node> {
    serde_json::from_str(content).context("Failed to parse JSON node document")
}

fn parse_yaml(content: &str) -> Result<Node> {
    serde_yaml::from_str(content).context("Failed to parse YAML node document")
}

/// Auto-detect format and parse
pub fn parse_auto(content: &str) -> Result<Node> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        bail!("Node document is empty");
    }

    if trimmed.starts_with('{') {
        parse_json(content)
    } else {
        parse_yaml(content)
    }
}
