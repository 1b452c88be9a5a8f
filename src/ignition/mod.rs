//! Ignition document composition
//!
//! The node owner hands us an Ignition config as part of the config drive.
//! We never rewrite what they gave us: local files are appended to
//! `storage.files` and everything else passes through untouched.

mod additions;

pub use additions::{current_hostname, dispatcher_scripts, hostname_file, local_additions};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Ignition config version used when the caller supplies no document
pub const DEFAULT_VERSION: &str = "3.2.0";

const DATA_URI_PREFIX: &str = "data:;base64,";

/// The user-supplied part of a config drive
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigPayload {
    /// Already-parsed JSON
    Structured(Value),
    /// JSON text that still has to be parsed
    Text(String),
    /// An opaque, pre-rendered config drive. Local files cannot be merged into it.
    PreRendered(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Malformed Ignition config: {0}")]
    Malformed(String),

    #[error("Cannot use a pre-rendered configdrive, please pass it as JSON data")]
    Rejected,
}

impl From<serde_json::Error> for ComposeError {
    fn from(e: serde_json::Error) -> Self {
        ComposeError::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub source: String,
}

/// A single `storage.files` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// Permission bits. Ignition wants these as a plain (decimal) integer.
    pub mode: u32,
    pub overwrite: bool,
    pub contents: FileContents,
}

impl FileEntry {
    /// Build an entry with `contents` embedded as a base64 data URI
    pub fn from_contents(path: impl Into<String>, mode: u32, overwrite: bool, contents: &[u8]) -> Self {
        Self {
            path: path.into(),
            mode,
            overwrite,
            contents: FileContents {
                source: format!("{}{}", DATA_URI_PREFIX, STANDARD.encode(contents)),
            },
        }
    }

    /// Decode the data URI back into bytes, if it is one we produced
    pub fn decoded_contents(&self) -> Option<Vec<u8>> {
        let encoded = self.contents.source.strip_prefix(DATA_URI_PREFIX)?;
        STANDARD.decode(encoded).ok()
    }
}

/// An Ignition config as a JSON object.
///
/// Key order is preserved so that re-serializing a caller's document changes
/// nothing but the appended files.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    root: Map<String, Value>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        let mut ignition = Map::new();
        ignition.insert("version".into(), Value::String(DEFAULT_VERSION.into()));

        let mut root = Map::new();
        root.insert("ignition".into(), Value::Object(ignition));
        Self { root }
    }
}

impl ConfigDocument {
    fn from_value(value: Value) -> Result<Self, ComposeError> {
        let root = match value {
            Value::Object(map) => map,
            other => {
                return Err(ComposeError::Malformed(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        if let Some(storage) = root.get("storage") {
            let storage = storage
                .as_object()
                .ok_or_else(|| ComposeError::Malformed("storage is not an object".into()))?;
            if let Some(files) = storage.get("files") {
                if !files.is_array() {
                    return Err(ComposeError::Malformed(
                        "storage.files is not an array".into(),
                    ));
                }
            }
        }

        Ok(Self { root })
    }

    /// Raw `storage.files` entries, in document order
    pub fn files(&self) -> &[Value] {
        self.root
            .get("storage")
            .and_then(|s| s.get("files"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.files()
            .iter()
            .any(|f| f.get("path").and_then(Value::as_str) == Some(path))
    }

    fn push_file(&mut self, entry: &FileEntry) -> Result<(), ComposeError> {
        let value = serde_json::to_value(entry)?;
        let storage = self
            .root
            .entry("storage")
            .or_insert_with(|| Value::Object(Map::new()));
        let files = storage
            .as_object_mut()
            .ok_or_else(|| ComposeError::Malformed("storage is not an object".into()))?
            .entry("files")
            .or_insert_with(|| Value::Array(Vec::new()));
        files
            .as_array_mut()
            .ok_or_else(|| ComposeError::Malformed("storage.files is not an array".into()))?
            .push(value);
        Ok(())
    }

    /// Replace the entry for `entry.path` where it stands
    fn replace_file(&mut self, entry: &FileEntry) -> Result<(), ComposeError> {
        let value = serde_json::to_value(entry)?;
        let existing = self
            .root
            .get_mut("storage")
            .and_then(|s| s.get_mut("files"))
            .and_then(Value::as_array_mut)
            .and_then(|files| {
                files
                    .iter_mut()
                    .find(|f| f.get("path").and_then(Value::as_str) == Some(entry.path.as_str()))
            })
            .ok_or_else(|| ComposeError::Malformed(format!("no entry for {}", entry.path)))?;
        *existing = value;
        Ok(())
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Serialized form written to disk
    pub fn to_vec(&self) -> Result<Vec<u8>, ComposeError> {
        Ok(serde_json::to_vec(&self.root)?)
    }

    /// Write the document below `root` at [`crate::paths::IGNITION_FILE`].
    ///
    /// The file is written to a temporary name and renamed into place, so the
    /// installer can never see a partial document.
    pub fn write_to_root(&self, root: &Path) -> Result<PathBuf> {
        let dest = root.join(crate::paths::IGNITION_FILE.trim_start_matches('/'));
        let dir = dest
            .parent()
            .context("Ignition destination has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let bytes = self.to_vec()?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes)
            .context("Failed to write Ignition document")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync Ignition document")?;
        tmp.persist(&dest)
            .with_context(|| format!("Failed to move Ignition document to {}", dest.display()))?;

        Ok(dest)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Merge `additions` into `base`.
///
/// Additions are appended in order. A path never appears twice: an addition
/// whose path is already present is dropped, unless it sets `overwrite`, in
/// which case it replaces the existing entry where it stands.
pub fn compose(
    base: Option<&ConfigPayload>,
    additions: &[FileEntry],
) -> Result<ConfigDocument, ComposeError> {
    let mut doc = match base {
        None => ConfigDocument::default(),
        Some(ConfigPayload::Structured(value)) => ConfigDocument::from_value(value.clone())?,
        Some(ConfigPayload::Text(text)) => ConfigDocument::from_value(serde_json::from_str(text)?)?,
        Some(ConfigPayload::PreRendered(_)) => return Err(ComposeError::Rejected),
    };

    for entry in additions {
        if !doc.has_path(&entry.path) {
            doc.push_file(entry)?;
        } else if entry.overwrite {
            tracing::debug!("Replacing Ignition entry for {}", entry.path);
            doc.replace_file(entry)?;
        } else {
            tracing::debug!("Keeping existing Ignition entry for {}", entry.path);
        }
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn entry(path: &str) -> FileEntry {
        FileEntry::from_contents(path, 0o644, false, path.as_bytes())
    }

    fn reparse(doc: &ConfigDocument) -> Value {
        serde_json::from_slice(&doc.to_vec().unwrap()).unwrap()
    }

    #[test]
    fn absent_base_gives_default_document() {
        let doc = compose(None, &[]).unwrap();
        assert_eq!(reparse(&doc), json!({"ignition": {"version": "3.2.0"}}));
        assert!(doc.files().is_empty());
    }

    #[test]
    fn additions_follow_existing_files() {
        let base = json!({
            "ignition": {"version": "3.4.0"},
            "passwd": {"users": [{"name": "core"}]},
            "storage": {"files": [
                {"path": "/etc/a", "mode": 420},
                {"path": "/etc/b", "mode": 420}
            ]}
        });
        let additions = [entry("/etc/c"), entry("/etc/d")];
        let doc = compose(Some(&ConfigPayload::Structured(base.clone())), &additions).unwrap();

        let out = reparse(&doc);
        let paths: Vec<_> = out["storage"]["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, ["/etc/a", "/etc/b", "/etc/c", "/etc/d"]);
        assert_eq!(out["storage"]["files"][0], base["storage"]["files"][0]);
        assert_eq!(out["passwd"], base["passwd"]);
    }

    #[test]
    fn text_base_is_parsed() {
        let text = r#"{"ignition":{"version":"3.2.0"},"storage":{"files":[{"path":"/x"}]}}"#;
        let doc = compose(Some(&ConfigPayload::Text(text.into())), &[entry("/y")]).unwrap();
        assert_eq!(doc.files().len(), 2);
    }

    #[test]
    fn unparseable_text_is_malformed() {
        let err = compose(Some(&ConfigPayload::Text("{not json".into())), &[]).unwrap_err();
        assert!(matches!(err, ComposeError::Malformed(_)));
    }

    #[test]
    fn non_object_base_is_malformed() {
        let err = compose(Some(&ConfigPayload::Structured(json!([1, 2]))), &[]).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn files_must_be_an_array() {
        let base = json!({"storage": {"files": {"path": "/x"}}});
        let err = compose(Some(&ConfigPayload::Structured(base)), &[]).unwrap_err();
        assert!(matches!(err, ComposeError::Malformed(_)));
    }

    #[test]
    fn pre_rendered_is_rejected() {
        let err = compose(Some(&ConfigPayload::PreRendered("H4sI...".into())), &[]).unwrap_err();
        assert!(matches!(err, ComposeError::Rejected));
    }

    #[test]
    fn existing_path_wins_without_overwrite() {
        let base = json!({"storage": {"files": [{"path": "/etc/hostname", "mode": 420}]}});
        let doc = compose(
            Some(&ConfigPayload::Structured(base)),
            &[entry("/etc/hostname")],
        )
        .unwrap();
        assert_eq!(doc.files().len(), 1);
        assert_eq!(doc.files()[0]["mode"], 420);
    }

    #[test]
    fn overwrite_addition_replaces_in_place() {
        let base = json!({"storage": {"files": [
            {"path": "/etc/motd"},
            {"path": "/etc/hostname", "contents": {"source": "data:,old"}},
            {"path": "/etc/issue"}
        ]}});
        let addition = FileEntry::from_contents("/etc/hostname", 0o644, true, b"node-1\n");
        let doc = compose(Some(&ConfigPayload::Structured(base)), &[addition.clone()]).unwrap();

        let paths: Vec<_> = doc.files().iter().map(|f| f["path"].as_str().unwrap()).collect();
        assert_eq!(paths, ["/etc/motd", "/etc/hostname", "/etc/issue"]);
        assert_eq!(doc.files()[1], serde_json::to_value(&addition).unwrap());
    }

    #[test]
    fn caller_hostname_is_not_duplicated() {
        let base = json!({
            "ignition": {"version": "3.2.0"},
            "storage": {"files": [{"path": "/etc/hostname", "mode": 420}]}
        });
        let hostname = additions::hostname_file(Some("worker-0")).unwrap();
        let doc = compose(Some(&ConfigPayload::Structured(base)), &[hostname]).unwrap();

        let out = reparse(&doc);
        let files = out["storage"]["files"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["path"], "/etc/hostname");
        assert_eq!(files[0]["contents"]["source"], "data:;base64,d29ya2VyLTAK");
    }

    #[test]
    fn repeated_overwrite_additions_leave_one_entry() {
        let first = FileEntry::from_contents("/etc/hostname", 0o644, true, b"a\n");
        let second = FileEntry::from_contents("/etc/hostname", 0o644, true, b"b\n");
        let doc = compose(None, &[first, second.clone()]).unwrap();
        assert_eq!(doc.files().len(), 1);
        assert_eq!(doc.files()[0], serde_json::to_value(&second).unwrap());
    }

    #[test]
    fn compose_is_deterministic() {
        let base = ConfigPayload::Text(
            r#"{"systemd":{"units":[{"name":"x.service"}]},"ignition":{"version":"3.2.0"}}"#.into(),
        );
        let additions = [entry("/a"), entry("/b")];
        let first = compose(Some(&base), &additions).unwrap().to_vec().unwrap();
        let second = compose(Some(&base), &additions).unwrap().to_vec().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn caller_key_order_is_preserved() {
        let text = r#"{"systemd":{},"ignition":{"version":"3.2.0"}}"#;
        let doc = compose(Some(&ConfigPayload::Text(text.into())), &[]).unwrap();
        assert_eq!(String::from_utf8(doc.to_vec().unwrap()).unwrap(), text);
    }

    #[test]
    fn entry_uses_base64_data_uri() {
        let e = FileEntry::from_contents("/etc/hostname", 0o644, true, b"node-1\n");
        assert_eq!(e.contents.source, "data:;base64,bm9kZS0xCg==");
        assert_eq!(e.decoded_contents().unwrap(), b"node-1\n");

        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["mode"], 420);
    }

    #[test]
    fn write_to_root_places_document_under_tmp() {
        let root = tempfile::tempdir().unwrap();
        let doc = compose(None, &[entry("/etc/motd")]).unwrap();

        let written = doc.write_to_root(root.path()).unwrap();
        assert_eq!(written, root.path().join("tmp/ironic.ign"));

        let on_disk: Value = serde_json::from_slice(&std::fs::read(&written).unwrap()).unwrap();
        assert_eq!(on_disk, doc.as_value());

        // Only the final file should remain, no temp leftovers
        let entries: Vec<_> = std::fs::read_dir(root.path().join("tmp")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    proptest! {
        #[test]
        fn non_colliding_additions_are_appended_after_base(
            base_paths in prop::collection::btree_set("[a-z]{1,8}", 0..6),
            added_paths in prop::collection::btree_set("[a-z]{1,8}", 0..6),
            overwrite in any::<bool>(),
        ) {
            let base_files: Vec<Value> = base_paths
                .iter()
                .map(|p| json!({"path": format!("/etc/{}", p), "mode": 420}))
                .collect();
            let base = json!({
                "ignition": {"version": "3.2.0"},
                "storage": {"files": base_files.clone()}
            });
            let additions: Vec<FileEntry> = added_paths
                .iter()
                .map(|p| FileEntry::from_contents(format!("/opt/{}", p), 0o644, overwrite, p.as_bytes()))
                .collect();

            let doc = compose(Some(&ConfigPayload::Structured(base)), &additions).unwrap();
            let out = reparse(&doc);

            let mut expected = base_files;
            expected.extend(additions.iter().map(|e| serde_json::to_value(e).unwrap()));
            prop_assert_eq!(out["storage"]["files"].as_array().unwrap(), &expected);
            let version = out["ignition"]["version"].as_str();
            prop_assert_eq!(version, Some("3.2.0"));
        }
    }
}
