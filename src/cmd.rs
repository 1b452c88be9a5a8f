use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Command;

fn describe<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let args_str: Vec<_> = args.iter().map(|s| s.as_ref().to_string_lossy()).collect();
    format!("{} {}", program, args_str.join(" "))
}

pub fn run<I, S>(program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().collect();
    tracing::info!("> {}", describe(program, &args));

    let status = Command::new(program)
        .args(&args)
        .status()
        .with_context(|| format!("Failed to run {}", program))?;

    if !status.success() {
        anyhow::bail!("{} failed with exit code {:?}", program, status.code());
    }

    Ok(())
}

pub fn run_output<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().collect();
    tracing::debug!("> {}", describe(program, &args));

    let output = Command::new(program)
        .args(&args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} failed with exit code {:?}: {}",
            program,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
