//! Deploy steps exposed to the conductor

use serde::Serialize;
use serde_json::{Map, Value};

use crate::assisted::{AssistedController, ServiceManager};
use crate::boot::{finalize, BootRegistrar};
use crate::cleanup::cleanup;
use crate::clock::Sleep;
use crate::config::AgentConfig;
use crate::error::DeployError;
use crate::hardware::Hardware;
use crate::ignition::{compose, local_additions, ConfigPayload};
use crate::installer::{supervise, InstallerInvocation, ToolRunner};
use crate::node::Node;
use crate::paths;
use crate::request::{EnvOverrides, InstallRequest};

pub const INSTALL_COREOS: &str = "install_coreos";
pub const START_ASSISTED_INSTALL: &str = "start_assisted_install";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployStep {
    pub step: &'static str,
    pub priority: u32,
    pub interface: &'static str,
    pub reboot_requested: bool,
    pub argsinfo: Map<String, Value>,
}

impl DeployStep {
    fn deploy(step: &'static str) -> Self {
        Self {
            step,
            priority: 0,
            interface: "deploy",
            reboot_requested: false,
            argsinfo: Map::new(),
        }
    }
}

/// Steps this agent offers. Priority 0: they only run when requested.
pub fn deploy_steps() -> Vec<DeployStep> {
    vec![
        DeployStep::deploy(INSTALL_COREOS),
        DeployStep::deploy(START_ASSISTED_INSTALL),
    ]
}

/// Runs deploy steps against one machine
pub struct CoreOsDeploy<'a> {
    pub config: &'a AgentConfig,
    pub overrides: &'a EnvOverrides,
    /// Hostname to pin on first boot, if any
    pub hostname: Option<String>,
    pub hardware: &'a dyn Hardware,
    pub runner: &'a mut dyn ToolRunner,
    pub registrar: &'a dyn BootRegistrar,
    pub sleeper: &'a dyn Sleep,
}

impl CoreOsDeploy<'_> {
    pub fn execute(&mut self, step: &str, node: &Node) -> Result<(), DeployError> {
        match step {
            INSTALL_COREOS => self.install_coreos(node),
            START_ASSISTED_INSTALL => {
                let manager = self.config.assisted.connect()?;
                self.start_assisted_install(manager)
            }
            other => Err(DeployError::UnknownStep(other.to_string())),
        }
    }

    /// Image the install device with coreos-installer
    pub fn install_coreos(&mut self, node: &Node) -> Result<(), DeployError> {
        let device = self.hardware.install_device()?;
        let request = InstallRequest::from_node(node, device, self.hardware.boot_mode());

        // Fail before touching any disks
        if matches!(request.config, Some(ConfigPayload::PreRendered(_))) {
            return Err(DeployError::ConfigurationRejected);
        }

        cleanup(self.hardware, &request);

        let additions = local_additions(&self.config.dispatcher_dir, self.hostname.as_deref())?;
        let ignition = if request.config.is_some() || !additions.is_empty() {
            let doc = compose(request.config.as_ref(), &additions)?;
            tracing::debug!("Updated ignition {}", doc.as_value());
            doc.write_to_root(&self.config.root_mount)?;
            Some(paths::IGNITION_FILE)
        } else {
            None
        };

        let invocation = InstallerInvocation::build(
            &self.config.root_mount,
            &self.config.installer,
            &request,
            ignition,
            self.overrides,
        );
        supervise(&mut *self.runner, &invocation, &self.config.install_policy())?;

        // Just in case: re-read disk information
        if let Err(e) = self.hardware.rescan_device(&request.device) {
            tracing::warn!("Failed to rescan {}: {:#}", request.device.display(), e);
        }

        finalize(
            self.registrar,
            &request.device,
            request.boot_mode,
            &self.config.boot.policy(),
            self.sleeper,
        )?;

        tracing::info!(
            "Successfully installed via CoreOS installer on device {}",
            request.device.display()
        );
        Ok(())
    }

    /// Hand the install to the assisted agent and wait for it to finish
    pub fn start_assisted_install(
        &self,
        manager: Box<dyn ServiceManager + '_>,
    ) -> Result<(), DeployError> {
        let mut controller =
            AssistedController::new(manager, self.config.assisted.poll_interval(), self.sleeper);
        controller.run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assisted::FileSignalManager;
    use crate::boot::{BootError, BootMode};
    use crate::clock::testing::RecordingSleep;
    use crate::installer::{InstallError, ProcessEvent};
    use crate::node::parse_auto;
    use anyhow::Result;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::path::{Path, PathBuf};

    struct FakeHardware {
        mode: BootMode,
        calls: RefCell<Vec<String>>,
    }

    impl FakeHardware {
        fn new(mode: BootMode) -> Self {
            Self {
                mode,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Hardware for FakeHardware {
        fn install_device(&self) -> Result<PathBuf> {
            Ok(PathBuf::from("/dev/vda"))
        }

        fn boot_mode(&self) -> BootMode {
            self.mode
        }

        fn delete_software_raid(&self) -> Result<()> {
            self.calls.borrow_mut().push("raid".into());
            Ok(())
        }

        fn rescan_device(&self, device: &Path) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("rescan {}", device.display()));
            Ok(())
        }
    }

    /// Checks the Ignition file is in place before "running" the installer
    struct FakeInstaller {
        exit_code: i32,
        launches: Vec<Vec<String>>,
        ignition_seen: Vec<bool>,
    }

    impl FakeInstaller {
        fn exiting(exit_code: i32) -> Self {
            Self {
                exit_code,
                launches: Vec::new(),
                ignition_seen: Vec::new(),
            }
        }
    }

    impl ToolRunner for FakeInstaller {
        fn launch(
            &mut self,
            invocation: &InstallerInvocation,
        ) -> Result<Box<dyn Iterator<Item = ProcessEvent>>, InstallError> {
            self.launches.push(invocation.args.clone());
            self.ignition_seen
                .push(invocation.root.join("tmp/ironic.ign").exists());
            Ok(Box::new(
                vec![
                    ProcessEvent::Line("Read disk 1.2 GiB/1.2 GiB (100%)".into()),
                    ProcessEvent::Exited(self.exit_code),
                ]
                .into_iter(),
            ))
        }
    }

    #[derive(Default)]
    struct FakeRegistrar {
        calls: Cell<u32>,
    }

    impl BootRegistrar for FakeRegistrar {
        fn register(&self, _device: &Path) -> Result<(), BootError> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        dispatcher: tempfile::TempDir,
        config: AgentConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let dispatcher = tempfile::tempdir().unwrap();
            fs::write(dispatcher.path().join("30-static-ip"), "#!/bin/sh\n").unwrap();
            let config = AgentConfig {
                root_mount: root.path().to_path_buf(),
                dispatcher_dir: dispatcher.path().to_path_buf(),
                ..AgentConfig::default()
            };
            Self {
                root,
                dispatcher,
                config,
            }
        }
    }

    const NODE: &str = r#"{
        "instance_info": {
            "image_source": "http://x/img",
            "configdrive": {
                "meta_data": {"coreos_append_karg": ["console=ttyS0"]},
                "user_data": {
                    "ignition": {"version": "3.2.0"},
                    "storage": {"files": [{"path": "/etc/motd", "mode": 420}]}
                }
            }
        }
    }"#;

    #[test]
    fn steps_are_advertised() {
        let steps = deploy_steps();
        let names: Vec<_> = steps.iter().map(|s| s.step).collect();
        assert_eq!(names, [INSTALL_COREOS, START_ASSISTED_INSTALL]);
        assert!(steps
            .iter()
            .all(|s| s.priority == 0 && s.interface == "deploy" && !s.reboot_requested));

        let json = serde_json::to_value(&steps[0]).unwrap();
        assert_eq!(json["argsinfo"], serde_json::json!({}));
    }

    #[test]
    fn install_writes_ignition_then_runs_installer() {
        let fixture = Fixture::new();
        let hardware = FakeHardware::new(BootMode::Uefi);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: Some("worker-0".into()),
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        deploy.execute(INSTALL_COREOS, &parse_auto(NODE).unwrap()).unwrap();

        assert_eq!(installer.launches.len(), 1);
        assert_eq!(installer.ignition_seen, vec![true]);
        assert_eq!(
            installer.launches[0],
            vec![
                "--preserve-on-error",
                "--ignition-file",
                "/tmp/ironic.ign",
                "--append-karg",
                "console=ttyS0",
                "--image-url",
                "http://x/img",
                "--insecure",
                "/dev/vda"
            ]
        );

        let doc: Value = serde_json::from_slice(
            &fs::read(fixture.root.path().join("tmp/ironic.ign")).unwrap(),
        )
        .unwrap();
        let script = fixture
            .dispatcher
            .path()
            .join("30-static-ip")
            .to_string_lossy()
            .to_string();
        let paths: Vec<_> = doc["storage"]["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/etc/motd".to_string(),
                script.clone(),
                format!("/sysroot{}", script),
                "/etc/hostname".to_string()
            ]
        );

        assert_eq!(
            *hardware.calls.borrow(),
            vec!["raid", "rescan /dev/vda", "rescan /dev/vda"]
        );
        assert_eq!(registrar.calls.get(), 1);
    }

    #[test]
    fn bios_install_skips_boot_registration() {
        let fixture = Fixture::new();
        let hardware = FakeHardware::new(BootMode::Bios);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        deploy.install_coreos(&Node::default()).unwrap();

        assert_eq!(registrar.calls.get(), 0);
        // The dispatcher script still produces a document
        assert_eq!(installer.ignition_seen, vec![true]);
        assert!(installer.launches[0].contains(&"--offline".to_string()));
    }

    #[test]
    fn nothing_to_merge_means_no_ignition_file() {
        let mut fixture = Fixture::new();
        fixture.config.dispatcher_dir = fixture.root.path().join("missing");
        let hardware = FakeHardware::new(BootMode::Bios);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        deploy.install_coreos(&Node::default()).unwrap();

        assert_eq!(installer.ignition_seen, vec![false]);
        assert!(!installer.launches[0].contains(&"--ignition-file".to_string()));
    }

    #[test]
    fn pre_rendered_config_drive_is_rejected_up_front() {
        let fixture = Fixture::new();
        let hardware = FakeHardware::new(BootMode::Uefi);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let node = parse_auto(r#"{"instance_info": {"configdrive": "H4sIAAAA"}}"#).unwrap();
        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        let err = deploy.install_coreos(&node).unwrap_err();

        assert!(matches!(err, DeployError::ConfigurationRejected));
        assert!(installer.launches.is_empty());
        assert!(hardware.calls.borrow().is_empty());
    }

    #[test]
    fn malformed_user_data_is_bad_input() {
        let fixture = Fixture::new();
        let hardware = FakeHardware::new(BootMode::Uefi);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let node = parse_auto(
            r#"{"instance_info": {"configdrive": {"user_data": "{\"ignition\": "}}}"#,
        )
        .unwrap();
        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        let err = deploy.install_coreos(&node).unwrap_err();

        assert!(matches!(err, DeployError::MalformedInput(_)));
        assert!(installer.launches.is_empty());
    }

    #[test]
    fn failing_installer_stops_before_boot_setup() {
        let fixture = Fixture::new();
        let hardware = FakeHardware::new(BootMode::Uefi);
        let mut installer = FakeInstaller::exiting(1);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        let err = deploy.install_coreos(&Node::default()).unwrap_err();

        assert!(matches!(err, DeployError::ToolExecution { code: 1, .. }));
        assert_eq!(installer.launches.len(), 3);
        // Written once, not per attempt
        assert!(installer.ignition_seen.iter().all(|seen| *seen));
        assert_eq!(registrar.calls.get(), 0);
    }

    #[test]
    fn unknown_step() {
        let fixture = Fixture::new();
        let hardware = FakeHardware::new(BootMode::Bios);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let mut deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        let err = deploy.execute("erase_devices", &Node::default()).unwrap_err();
        assert_eq!(err.to_string(), "Unknown deploy step: erase_devices");
    }

    #[test]
    fn assisted_install_needs_a_ready_agent() {
        let fixture = Fixture::new();
        let state_dir = tempfile::tempdir().unwrap();
        let hardware = FakeHardware::new(BootMode::Bios);
        let mut installer = FakeInstaller::exiting(0);
        let registrar = FakeRegistrar::default();
        let sleeper = RecordingSleep::default();
        let overrides = EnvOverrides::default();

        let deploy = CoreOsDeploy {
            config: &fixture.config,
            overrides: &overrides,
            hostname: None,
            hardware: &hardware,
            runner: &mut installer,
            registrar: &registrar,
            sleeper: &sleeper,
        };
        let err = deploy
            .start_assisted_install(Box::new(FileSignalManager::new(state_dir.path())))
            .unwrap_err();
        assert!(matches!(err, DeployError::AgentNotReady(_)));
        assert_eq!(sleeper.count(), 0);
    }
}
