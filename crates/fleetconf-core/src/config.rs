use std::path::PathBuf;
use std::time::Duration;

use fleetconf_netconf::FramingMode;

/// Process-wide controller options.
///
/// Built once at startup (the daemon translates its figment profile
/// into this) and passed by reference through the reactor; core never
/// reads configuration sources itself.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Per-device timer for every transient connection state.
    pub device_timeout: Duration,

    /// Initial framing mode for new sessions. Sessions always begin in
    /// EOM per RFC 6242; setting this to EOM additionally pins the mode
    /// so hello negotiation never upgrades to chunked.
    pub framing: FramingMode,

    /// Pin the framing mode to `framing`, ignoring hello negotiation.
    pub pin_framing: bool,

    /// Directory where fetched YANG modules are cached.
    pub schema_dir: PathBuf,

    /// Service-action command line (argv); empty means unconfigured.
    pub action_command: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(60),
            framing: FramingMode::Eom,
            pin_framing: false,
            schema_dir: PathBuf::from("/var/lib/fleetconf/schemas"),
            action_command: Vec::new(),
        }
    }
}
