mod process;
mod supervisor;

pub use process::{spawn_events, ChrootRunner, ChildEvents};
pub use supervisor::{
    summarize, supervise, InstallError, ProcessEvent, RetryPolicy, RetryState, RunOutcome,
    Termination, ToolRunner,
};

use std::path::{Path, PathBuf};

use crate::request::{EnvOverrides, InstallRequest};

/// A fully resolved `coreos-installer install` command line.
///
/// The installer lives inside the live root, so it is always run through
/// `chroot`. The target device is always the final argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerInvocation {
    pub root: PathBuf,
    pub tool: String,
    pub args: Vec<String>,
}

impl InstallerInvocation {
    /// Derive the arguments from the request, the environment overrides and
    /// the (root-relative) Ignition path, if a document was written.
    pub fn build(
        root: &Path,
        tool: &str,
        request: &InstallRequest,
        ignition: Option<&str>,
        overrides: &EnvOverrides,
    ) -> Self {
        // --preserve-on-error: cleaning takes care of partial installs
        let mut args = vec!["--preserve-on-error".to_string()];

        if let Some(path) = ignition {
            args.extend(["--ignition-file".into(), path.into()]);
        }

        if !request.kernel_args.append.is_empty() {
            args.extend(["--append-karg".into(), request.kernel_args.append.join(",")]);
        }

        if !request.kernel_args.delete.is_empty() {
            args.extend(["--delete-karg".into(), request.kernel_args.delete.join(",")]);
        }

        match &request.image_source {
            Some(url) => args.extend(["--image-url".into(), url.clone(), "--insecure".into()]),
            None => args.push("--offline".into()),
        }

        if let Some(extra) = &overrides.extra_kargs {
            args.extend(["--append-karg".into(), extra.clone()]);
        }

        if request.copy_network.unwrap_or(overrides.copy_network) {
            args.push("--copy-network".into());
        }

        args.push(request.device.to_string_lossy().to_string());

        Self {
            root: root.to_path_buf(),
            tool: tool.to_string(),
            args,
        }
    }

    /// Full argv, starting with `chroot`
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            "chroot".to_string(),
            self.root.to_string_lossy().to_string(),
            self.tool.clone(),
            "install".to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}
