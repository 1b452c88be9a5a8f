use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use coreos_deploy::clock::ThreadSleep;
use coreos_deploy::config::AgentConfig;
use coreos_deploy::hardware::LocalHardware;
use coreos_deploy::ignition::current_hostname;
use coreos_deploy::installer::ChrootRunner;
use coreos_deploy::node::{self, NodeSource};
use coreos_deploy::request::EnvOverrides;
use coreos_deploy::steps::{deploy_steps, CoreOsDeploy};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "steps" => {
            println!("{}", serde_json::to_string_pretty(&deploy_steps())?);
            Ok(())
        }
        "run" => run(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"coreos-deploy - CoreOS deploy steps for bare-metal provisioning

Usage:
    coreos-deploy steps                          List the deploy steps as JSON
    coreos-deploy run <step> <node> [options]    Run a deploy step for a node
    coreos-deploy help                           Show this help message

Node documents can be a file (JSON or YAML), an http(s) URL, or - for stdin.

Options:
    --device <path>    Install to this block device instead of auto-detecting

Examples:
    coreos-deploy run install_coreos node.json --device /dev/sda
    coreos-deploy run start_assisted_install -
"#
    );
}

fn run(args: &[String]) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Error: coreos-deploy run must be run as root");
        std::process::exit(1);
    }

    let mut positional = Vec::new();
    let mut device = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--device" => {
                let path = iter.next().context("--device requires a path")?;
                device = Some(PathBuf::from(path));
            }
            other => positional.push(other),
        }
    }

    let [step, node_arg] = positional[..] else {
        bail!("Usage: coreos-deploy run <step> <node> [--device <path>]");
    };

    let config = AgentConfig::load()?;
    let overrides = EnvOverrides::from_env();
    let node = node::load(&NodeSource::from_arg(node_arg))?;

    let hardware = LocalHardware::new(device);
    let mut runner = ChrootRunner;
    let registrar = config.boot.registrar();
    let sleeper = ThreadSleep;

    let mut deploy = CoreOsDeploy {
        config: &config,
        overrides: &overrides,
        hostname: current_hostname(),
        hardware: &hardware,
        runner: &mut runner,
        registrar: &registrar,
        sleeper: &sleeper,
    };
    deploy.execute(step, &node)?;
    Ok(())
}
