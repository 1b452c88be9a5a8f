use std::io::{self, BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use super::supervisor::{InstallError, ProcessEvent, ToolRunner};
use super::InstallerInvocation;

const ROOT_BIN_DIRS: [&str; 4] = ["usr/bin", "usr/sbin", "bin", "sbin"];

/// Runs the installer inside the live root with `chroot`
#[derive(Debug, Clone, Copy, Default)]
pub struct ChrootRunner;

impl ChrootRunner {
    fn preflight(invocation: &InstallerInvocation) -> Result<(), InstallError> {
        if which::which("chroot").is_err() {
            return Err(InstallError::ToolNotFound {
                tool: "chroot".into(),
                root: PathBuf::from("/"),
            });
        }

        let search = root_search_path(&invocation.root);
        if which::which_in(&invocation.tool, Some(search), &invocation.root).is_err() {
            return Err(InstallError::ToolNotFound {
                tool: invocation.tool.clone(),
                root: invocation.root.clone(),
            });
        }

        Ok(())
    }
}

fn root_search_path(root: &Path) -> String {
    ROOT_BIN_DIRS
        .iter()
        .map(|dir| root.join(dir).to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

impl ToolRunner for ChrootRunner {
    fn launch(
        &mut self,
        invocation: &InstallerInvocation,
    ) -> Result<Box<dyn Iterator<Item = ProcessEvent>>, InstallError> {
        Self::preflight(invocation)?;

        let argv = invocation.argv();
        tracing::info!("Executing CoreOS installer: {:?}", argv);

        match spawn_events(&argv) {
            Ok(events) => Ok(Box::new(events)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(InstallError::ToolNotFound {
                tool: argv[0].clone(),
                root: invocation.root.clone(),
            }),
            Err(e) => Err(InstallError::Spawn {
                tool: invocation.tool.clone(),
                source: e,
            }),
        }
    }
}

/// Output of a running child, stdout and stderr interleaved as written
#[derive(Debug)]
pub struct ChildEvents {
    reader: Option<BufReader<os_pipe::PipeReader>>,
    child: Option<Child>,
}

/// Spawn `argv` with stdout and stderr sharing one pipe
pub fn spawn_events(argv: &[String]) -> io::Result<ChildEvents> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let (reader, writer) = os_pipe::pipe()?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);

    let child = command.spawn()?;
    // The Command holds our copies of the write end; drop them so EOF arrives
    // when the child exits.
    drop(command);

    Ok(ChildEvents {
        reader: Some(BufReader::new(reader)),
        child: Some(child),
    })
}

impl ChildEvents {
    fn next_line(&mut self) -> Option<String> {
        let reader = self.reader.as_mut()?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.reader = None;
                None
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                Some(line.trim_end_matches(['\n', '\r']).to_string())
            }
            Err(e) => {
                tracing::warn!("Stopped reading installer output: {}", e);
                self.reader = None;
                None
            }
        }
    }
}

impl Iterator for ChildEvents {
    type Item = ProcessEvent;

    fn next(&mut self) -> Option<ProcessEvent> {
        if let Some(line) = self.next_line() {
            return Some(ProcessEvent::Line(line));
        }

        let mut child = self.child.take()?;
        let code = match child.wait() {
            Ok(status) => status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
            Err(e) => {
                tracing::warn!("Failed to wait for installer: {}", e);
                -1
            }
        };
        Some(ProcessEvent::Exited(code))
    }
}
