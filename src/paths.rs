/// Where the provisioning image mounts the CoreOS live root
pub const ROOT_MOUNT: &str = "/mnt/coreos";

/// Ignition document location, relative to the root mount
pub const IGNITION_FILE: &str = "/tmp/ironic.ign";

/// NetworkManager dispatcher scripts carried into the installed system
pub const NM_DISPATCHER_DIR: &str = "/etc/NetworkManager/dispatcher.d";

/// Prefix under which the installed root is assembled at first boot
pub const SYSROOT: &str = "/sysroot";

/// Default config file for the deploy agent
pub const CONFIG_FILE: &str = "/etc/coreos-deploy.toml";

/// Marker directory shared with the assisted agent (file-signal backend)
pub const ASSISTED_STATE_DIR: &str = "/var/lib/assisted-agent";
