//! Daemon-owned configuration: TOML profile, environment overlay, and
//! translation to core types.
//!
//! Core never sees these types -- it receives a pre-built
//! `ControllerConfig` and a device inventory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use fleetconf_core::{ControllerConfig, DeviceConfig, SchemaPolicy, YangConfig};
use fleetconf_netconf::FramingMode;

// ── TOML config structs ──────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Unix socket the RPC surface listens on.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Per-device timeout in seconds for transient connection states.
    #[serde(default = "default_timeout")]
    pub device_timeout: u64,

    /// Initial framing mode: "eom" or "chunked".
    #[serde(default = "default_framing")]
    pub framing: String,

    /// Pin the framing mode, skipping hello negotiation.
    #[serde(default)]
    pub pin_framing: bool,

    /// YANG module cache directory.
    #[serde(default = "default_schema_dir")]
    pub schema_dir: PathBuf,

    /// Service-action command line (argv). Empty disables actions.
    #[serde(default)]
    pub action_command: Vec<String>,

    /// Module name prefixes to drop from device schema lists.
    #[serde(default)]
    pub skip_schema_prefixes: Vec<String>,

    /// Device inventory.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            device_timeout: default_timeout(),
            framing: default_framing(),
            pin_framing: false,
            schema_dir: default_schema_dir(),
            action_command: Vec::new(),
            skip_schema_prefixes: Vec::new(),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub name: String,
    pub addr: String,
    pub user: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// "bind" or "validate".
    #[serde(default = "default_yang_config")]
    pub yang_config: String,
}

fn default_socket() -> PathBuf {
    PathBuf::from("/var/run/fleetconfd.sock")
}
fn default_timeout() -> u64 {
    60
}
fn default_framing() -> String {
    "eom".into()
}
fn default_schema_dir() -> PathBuf {
    ProjectDirs::from("org", "fleetconf", "fleetconfd")
        .map(|dirs| dirs.data_dir().join("schemas"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/fleetconfd/schemas"))
}
fn default_enabled() -> bool {
    true
}
fn default_yang_config() -> String {
    "validate".into()
}

// ── Loading ──────────────────────────────────────────────────────────

/// Load the daemon config from file + `FLEETCONF_` environment overlay.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(DaemonConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    } else {
        figment = figment.merge(Toml::file("/etc/fleetconfd.toml"));
    }
    figment.merge(Env::prefixed("FLEETCONF_")).extract()
}

// ── Translation to core types ────────────────────────────────────────

/// This is the single boundary where daemon config types cross into
/// core types.
pub fn controller_config(config: &DaemonConfig) -> ControllerConfig {
    ControllerConfig {
        device_timeout: Duration::from_secs(config.device_timeout),
        framing: match config.framing.as_str() {
            "chunked" => FramingMode::Chunked,
            _ => FramingMode::Eom,
        },
        pin_framing: config.pin_framing,
        schema_dir: config.schema_dir.clone(),
        action_command: config.action_command.clone(),
    }
}

pub fn inventory(config: &DaemonConfig) -> Vec<DeviceConfig> {
    config
        .devices
        .iter()
        .map(|entry| {
            let mut dev = DeviceConfig::new(entry.name.clone(), entry.addr.clone());
            dev.user = entry.user.clone();
            dev.enabled = entry.enabled;
            dev.yang_config = match entry.yang_config.as_str() {
                "bind" => YangConfig::Bind,
                _ => YangConfig::Validate,
            };
            dev
        })
        .collect()
}

pub fn schema_policy(config: &DaemonConfig) -> SchemaPolicy {
    if config.skip_schema_prefixes.is_empty() {
        SchemaPolicy::default()
    } else {
        SchemaPolicy::skip_prefixes(config.skip_schema_prefixes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_profile_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
device_timeout = 5
framing = "chunked"

[[devices]]
name = "r1"
addr = "10.0.0.1"
user = "admin"

[[devices]]
name = "lab"
addr = "10.0.0.9"
enabled = false
yang_config = "bind"
"#
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.device_timeout, 5);

        let core = controller_config(&config);
        assert_eq!(core.device_timeout, Duration::from_secs(5));
        assert_eq!(core.framing, FramingMode::Chunked);

        let devices = inventory(&config);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "r1");
        assert_eq!(devices[0].user.as_deref(), Some("admin"));
        assert!(devices[0].enabled);
        assert_eq!(devices[1].yang_config, YangConfig::Bind);
        assert!(!devices[1].enabled);
    }

    #[test]
    fn defaults_apply_without_file() {
        let config = load_config(Some(Path::new("/nonexistent/fleetconf.toml"))).unwrap();
        assert_eq!(config.device_timeout, 60);
        assert_eq!(config.framing, "eom");
        assert!(config.devices.is_empty());
    }
}
